//! Cross-app comparison.
//!
//! Aggregates N successful analyses (N >= 2) into one [`ComparisonResult`]:
//! feature rows keyed case-insensitively with coverage/sentiment/mention
//! statistics, a common/unique partition of strengths and weaknesses, per-app
//! projections, and an LLM-generated 7-step action plan.
//!
//! Everything here is a pure function of its inputs except the one LLM call
//! for the action plan and the access check consulted up front.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;

use crate::llm::LlmClient;
use crate::models::{
    AppAnalysis, AppInfo, AppSummaryRow, CommonTrait, ComparisonResult, FeatureComparison,
    MarketPositionRow, PricingRow, TraitComparison, UniqueTrait, UserBaseRow,
};

/// The action plan always has exactly this many steps.
pub const PLAN_STEPS: usize = 7;

/// Validation attempts for the action-plan completion.
const PLAN_ATTEMPTS: u32 = 3;

/// Authorization gate consulted before any cross-app comparison is produced.
#[async_trait]
pub trait AccessPolicy: Send + Sync {
    async fn user_has_access(&self, user: &str, app_ids: &[String]) -> Result<bool>;
}

/// Policy for deployments without per-user app scoping.
pub struct AllowAll;

#[async_trait]
impl AccessPolicy for AllowAll {
    async fn user_has_access(&self, _user: &str, _app_ids: &[String]) -> Result<bool> {
        Ok(true)
    }
}

/// One successfully analyzed app, as the comparator consumes it.
#[derive(Debug, Clone)]
pub struct AnalyzedApp {
    pub info: AppInfo,
    pub review_count: i64,
    pub analysis: AppAnalysis,
}

impl AnalyzedApp {
    fn display_name(&self) -> &str {
        if self.analysis.app_name.is_empty() {
            &self.info.title
        } else {
            &self.analysis.app_name
        }
    }
}

/// Compare >= 2 analyzed apps.
///
/// # Errors
///
/// - access denial fails the whole comparison (no partial result);
/// - fewer than 2 apps is a caller bug surfaced as an error;
/// - action-plan generation failure propagates — the comparison cannot
///   silently degrade for that field.
pub async fn compare(
    llm: &dyn LlmClient,
    policy: &dyn AccessPolicy,
    user: &str,
    apps: &[AnalyzedApp],
) -> Result<ComparisonResult> {
    if apps.len() < 2 {
        bail!("comparison requires at least 2 analyzed apps, got {}", apps.len());
    }

    let app_ids: Vec<String> = apps.iter().map(|a| a.info.app_id.clone()).collect();
    if !policy.user_has_access(user, &app_ids).await? {
        bail!("access denied: user does not have rights to all requested apps");
    }

    let feature_comparison = aggregate_features(apps);
    let strengths_comparison = partition_traits(apps, |a| &a.analysis.overview.strengths);
    let weaknesses_comparison = partition_traits(apps, |a| &a.analysis.overview.weaknesses);

    let summary_rows: Vec<AppSummaryRow> = apps
        .iter()
        .map(|a| AppSummaryRow {
            name: a.display_name().to_string(),
            id: a.info.app_id.clone(),
            rating: a.info.score,
            review_count: a.review_count,
        })
        .collect();

    let market_position = apps
        .iter()
        .map(|a| MarketPositionRow {
            app: a.display_name().to_string(),
            position: a.analysis.overview.market_position.clone(),
        })
        .collect();

    let pricing_comparison = apps
        .iter()
        .map(|a| PricingRow {
            app: a.display_name().to_string(),
            value_for_money: a.analysis.pricing_perception.value_for_money,
            pricing_complaints: a.analysis.pricing_perception.pricing_complaints,
            willingness: a.analysis.pricing_perception.willingness.clone(),
        })
        .collect();

    let user_base_comparison = apps
        .iter()
        .map(|a| UserBaseRow {
            app: a.display_name().to_string(),
            target_demographic: a.analysis.overview.target_demographic.clone(),
            segments: a.analysis.user_segments.clone().unwrap_or_default(),
        })
        .collect();

    let recommendation_summary = generate_action_plan(
        llm,
        &summary_rows,
        &strengths_comparison,
        &weaknesses_comparison,
        &feature_comparison,
    )
    .await?;

    Ok(ComparisonResult {
        apps: summary_rows,
        feature_comparison,
        strengths_comparison,
        weaknesses_comparison,
        market_position,
        pricing_comparison,
        user_base_comparison,
        recommendation_summary,
    })
}

/// Aggregate every (app, feature) pair keyed by the case-folded feature name.
///
/// `app_coverage` uses the number of apps that produced a successful
/// analysis as its denominator; rows sort descending by coverage, then total
/// mentions, and keep insertion order on full ties (the sort is stable).
pub fn aggregate_features(apps: &[AnalyzedApp]) -> Vec<FeatureComparison> {
    struct Accumulator {
        display: String,
        scores: Vec<f64>,
        mentions: i64,
        apps: Vec<String>,
    }

    let total_apps = apps.len();
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Accumulator> = HashMap::new();

    for app in apps {
        let app_name = app.display_name().to_string();
        for feature in &app.analysis.feature_analysis {
            let key = feature.feature.to_lowercase();
            let acc = by_key.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Accumulator {
                    display: feature.feature.clone(),
                    scores: Vec::new(),
                    mentions: 0,
                    apps: Vec::new(),
                }
            });
            acc.scores.push(feature.sentiment_score);
            acc.mentions += feature.mention_count;
            if !acc.apps.contains(&app_name) {
                acc.apps.push(app_name.clone());
            }
        }
    }

    let mut rows: Vec<FeatureComparison> = order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .map(|acc| {
            let average = acc.scores.iter().sum::<f64>() / acc.scores.len() as f64;
            FeatureComparison {
                feature: acc.display,
                app_coverage: acc.apps.len() as f64 / total_apps as f64,
                average_sentiment: average,
                total_mentions: acc.mentions,
                present_in_apps: acc.apps,
            }
        })
        .collect();

    // Stable: equal (coverage, mentions) keeps insertion order
    rows.sort_by(|a, b| {
        b.app_coverage
            .total_cmp(&a.app_coverage)
            .then(b.total_mentions.cmp(&a.total_mentions))
    });
    rows
}

/// Partition strengths or weaknesses by case-folded text: entries mentioned
/// by more than one distinct app are common, entries from exactly one app
/// are unique. No key ever lands on both sides.
pub fn partition_traits<F>(apps: &[AnalyzedApp], select: F) -> TraitComparison
where
    F: Fn(&AnalyzedApp) -> &Vec<String>,
{
    struct Entry {
        display: String,
        apps: Vec<String>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, Entry> = HashMap::new();

    for app in apps {
        let app_name = app.display_name().to_string();
        for text in select(app) {
            let key = text.to_lowercase();
            let entry = by_key.entry(key.clone()).or_insert_with(|| {
                order.push(key.clone());
                Entry {
                    display: text.clone(),
                    apps: Vec::new(),
                }
            });
            if !entry.apps.contains(&app_name) {
                entry.apps.push(app_name.clone());
            }
        }
    }

    let mut result = TraitComparison::default();
    for key in order {
        let Some(entry) = by_key.remove(&key) else {
            continue;
        };
        if entry.apps.len() > 1 {
            result.common.push(CommonTrait {
                text: entry.display,
                apps: entry.apps,
            });
        } else if let Some(app) = entry.apps.into_iter().next() {
            result.unique.push(UniqueTrait {
                text: entry.display,
                app,
            });
        }
    }
    result
}

/// One LLM call producing the ranked 7-step plan, re-requested on schema
/// failure up to the attempt budget. Failure propagates to the caller.
async fn generate_action_plan(
    llm: &dyn LlmClient,
    apps: &[AppSummaryRow],
    strengths: &TraitComparison,
    weaknesses: &TraitComparison,
    features: &[FeatureComparison],
) -> Result<Vec<String>> {
    let prompt = build_plan_prompt(apps, strengths, weaknesses, features);

    let mut last_err = None;
    for attempt in 1..=PLAN_ATTEMPTS {
        let value = llm
            .generate_json(PLAN_SYSTEM_PROMPT, &prompt)
            .await
            .context("action plan generation failed")?;

        match render_plan(&value) {
            Ok(steps) => return Ok(steps),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "action plan failed validation");
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("plan validation failed"))
        .context("action plan generation failed"))
}

/// Validate the plan payload and render the literal step strings.
pub fn render_plan(value: &serde_json::Value) -> Result<Vec<String>> {
    let steps = value["steps"]
        .as_array()
        .context("plan is missing a steps array")?;
    if steps.len() != PLAN_STEPS {
        bail!("plan must contain exactly {} steps, got {}", PLAN_STEPS, steps.len());
    }

    let mut rendered = Vec::with_capacity(PLAN_STEPS);
    for (i, step) in steps.iter().enumerate() {
        let title = step["title"]
            .as_str()
            .with_context(|| format!("step {} is missing a title", i + 1))?;
        let description = step["description"]
            .as_str()
            .with_context(|| format!("step {} is missing a description", i + 1))?;
        let priority = step["priority"].as_str().unwrap_or("");
        if !matches!(priority, "low" | "medium" | "high" | "critical") {
            bail!("step {} has invalid priority '{}'", i + 1, priority);
        }
        let title = title.trim().trim_end_matches('.');
        rendered.push(format!("STEP {}: {}. {}", i + 1, title, description.trim()));
    }
    Ok(rendered)
}

const PLAN_SYSTEM_PROMPT: &str = "You are a product strategist. Given a competitive comparison of \
mobile apps, produce a prioritized action plan. Respond with a single JSON object: \
{\"steps\": [{\"title\": string (one sentence), \"description\": string (one sentence), \
\"priority\": \"low\"|\"medium\"|\"high\"|\"critical\"}]} with exactly 7 steps ordered by rank.";

fn build_plan_prompt(
    apps: &[AppSummaryRow],
    strengths: &TraitComparison,
    weaknesses: &TraitComparison,
    features: &[FeatureComparison],
) -> String {
    let mut prompt = String::with_capacity(8 * 1024);

    prompt.push_str("Apps under comparison:\n");
    for app in apps {
        prompt.push_str(&format!(
            "- {} ({}): rating {}, {} reviews analyzed\n",
            app.name,
            app.id,
            app.rating
                .map(|r| format!("{:.1}", r))
                .unwrap_or_else(|| "n/a".to_string()),
            app.review_count
        ));
    }

    prompt.push_str("\nShared strengths:\n");
    for item in &strengths.common {
        prompt.push_str(&format!("- {} ({})\n", item.text, item.apps.join(", ")));
    }
    prompt.push_str("\nShared weaknesses:\n");
    for item in &weaknesses.common {
        prompt.push_str(&format!("- {} ({})\n", item.text, item.apps.join(", ")));
    }

    prompt.push_str("\nFeature comparison (coverage, avg sentiment, mentions):\n");
    for row in features.iter().take(20) {
        prompt.push_str(&format!(
            "- {}: {:.2}, {:+.2}, {}\n",
            row.feature, row.app_coverage, row.average_sentiment, row.total_mentions
        ));
    }

    prompt.push_str(
        "\nProduce the 7-step ranked action plan for a team competing in this market.\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        FeatureSentiment, Overview, Platform, PricingPerception, Priority,
    };
    use chrono::Utc;

    fn app(name: &str, id: &str, features: Vec<(&str, f64, i64)>, strengths: Vec<&str>) -> AnalyzedApp {
        AnalyzedApp {
            info: AppInfo {
                app_id: id.to_string(),
                platform: Platform::GooglePlay,
                title: name.to_string(),
                icon: None,
                developer: None,
                categories: vec![],
                description: String::new(),
                score: Some(4.0),
                ratings: Some(100),
                histogram: None,
                installs: None,
                version: None,
                raw: serde_json::Value::Null,
                last_fetched: Utc::now(),
            },
            review_count: 50,
            analysis: AppAnalysis {
                app_name: name.to_string(),
                overview: Overview {
                    strengths: strengths.into_iter().map(|s| s.to_string()).collect(),
                    weaknesses: vec![],
                    opportunities: vec![],
                    threats: vec![],
                    market_position: "challenger".to_string(),
                    target_demographic: "general".to_string(),
                },
                feature_analysis: features
                    .into_iter()
                    .map(|(f, s, m)| FeatureSentiment {
                        feature: f.to_string(),
                        sentiment_score: s,
                        mention_count: m,
                        common_feedback: vec![],
                        competitive_edge: false,
                        improvement_priority: Priority::Medium,
                    })
                    .collect(),
                pricing_perception: PricingPerception {
                    value_for_money: 0.2,
                    pricing_complaints: 5.0,
                    willingness: "moderate".to_string(),
                },
                recommended_actions: vec![],
                user_segments: None,
            },
        }
    }

    #[test]
    fn coverage_uses_successful_apps_as_denominator() {
        let apps = vec![
            app("A", "com.a", vec![("Offline Mode", 0.5, 10)], vec![]),
            app("B", "com.b", vec![("offline mode", -0.5, 6)], vec![]),
            app("C", "com.c", vec![("Dark Theme", 0.8, 3)], vec![]),
        ];
        let rows = aggregate_features(&apps);

        let offline = rows.iter().find(|r| r.feature == "Offline Mode").unwrap();
        assert!((offline.app_coverage - 2.0 / 3.0).abs() < 1e-9);
        assert!((offline.average_sentiment - 0.0).abs() < 1e-9);
        assert_eq!(offline.total_mentions, 16);
        assert_eq!(offline.present_in_apps, vec!["A", "B"]);

        for row in &rows {
            assert!(row.app_coverage > 0.0 && row.app_coverage <= 1.0);
        }
    }

    #[test]
    fn features_sort_by_coverage_then_mentions() {
        let apps = vec![
            app(
                "A",
                "com.a",
                vec![("alpha", 0.0, 1), ("beta", 0.0, 9), ("gamma", 0.0, 9)],
                vec![],
            ),
            app("B", "com.b", vec![("alpha", 0.0, 1)], vec![]),
        ];
        let rows = aggregate_features(&apps);
        // alpha: coverage 1.0 beats both single-app rows despite fewer mentions
        assert_eq!(rows[0].feature, "alpha");
        // beta and gamma tie on coverage and mentions: insertion order holds
        assert_eq!(rows[1].feature, "beta");
        assert_eq!(rows[2].feature, "gamma");
    }

    #[test]
    fn strengths_partition_is_disjoint() {
        let apps = vec![
            app("A", "com.a", vec![], vec!["Great onboarding", "Fast sync"]),
            app("B", "com.b", vec![], vec!["great onboarding", "Clean UI"]),
        ];
        let partition = partition_traits(&apps, |a| &a.analysis.overview.strengths);

        assert_eq!(partition.common.len(), 1);
        assert_eq!(partition.common[0].apps, vec!["A", "B"]);
        assert_eq!(partition.unique.len(), 2);

        let common_keys: Vec<String> = partition
            .common
            .iter()
            .map(|c| c.text.to_lowercase())
            .collect();
        for unique in &partition.unique {
            assert!(!common_keys.contains(&unique.text.to_lowercase()));
        }
    }

    #[test]
    fn plan_rendering_enforces_cardinality_and_format() {
        let make_steps = |n: usize| {
            serde_json::json!({
                "steps": (0..n).map(|i| serde_json::json!({
                    "title": format!("Do thing {}", i + 1),
                    "description": "Because it matters.",
                    "priority": "high"
                })).collect::<Vec<_>>()
            })
        };

        assert!(render_plan(&make_steps(6)).is_err());
        assert!(render_plan(&make_steps(8)).is_err());

        let steps = render_plan(&make_steps(7)).unwrap();
        assert_eq!(steps.len(), 7);
        assert_eq!(steps[0], "STEP 1: Do thing 1. Because it matters.");
        assert!(steps[6].starts_with("STEP 7: "));
    }

    #[test]
    fn plan_rejects_bad_priority() {
        let value = serde_json::json!({
            "steps": (0..7).map(|i| serde_json::json!({
                "title": format!("t{}", i),
                "description": "d",
                "priority": "urgent"
            })).collect::<Vec<_>>()
        });
        assert!(render_plan(&value).is_err());
    }

    #[tokio::test]
    async fn comparison_requires_two_apps() {
        struct NoLlm;
        #[async_trait]
        impl LlmClient for NoLlm {
            async fn generate_json(&self, _: &str, _: &str) -> Result<serde_json::Value> {
                bail!("should not be called")
            }
            async fn stream_chat(
                &self,
                _: Vec<crate::llm::ChatMessage>,
                _: tokio::sync::mpsc::Sender<String>,
            ) -> Result<String> {
                bail!("should not be called")
            }
        }
        let only = vec![app("A", "com.a", vec![], vec![])];
        let err = compare(&NoLlm, &AllowAll, "user", &only).await.unwrap_err();
        assert!(err.to_string().contains("at least 2"));
    }

    #[tokio::test]
    async fn access_denial_fails_comparison() {
        struct NoLlm;
        #[async_trait]
        impl LlmClient for NoLlm {
            async fn generate_json(&self, _: &str, _: &str) -> Result<serde_json::Value> {
                bail!("should not be called")
            }
            async fn stream_chat(
                &self,
                _: Vec<crate::llm::ChatMessage>,
                _: tokio::sync::mpsc::Sender<String>,
            ) -> Result<String> {
                bail!("should not be called")
            }
        }
        struct DenyAll;
        #[async_trait]
        impl AccessPolicy for DenyAll {
            async fn user_has_access(&self, _: &str, _: &[String]) -> Result<bool> {
                Ok(false)
            }
        }
        let apps = vec![
            app("A", "com.a", vec![], vec![]),
            app("B", "com.b", vec![], vec![]),
        ];
        let err = compare(&NoLlm, &DenyAll, "user", &apps).await.unwrap_err();
        assert!(err.to_string().contains("access denied"));
    }
}
