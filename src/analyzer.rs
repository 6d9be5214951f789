//! Single-app analysis.
//!
//! Turns (app metadata, review sample) into a structured [`AppAnalysis`] via
//! a schema-guided LLM completion. Reviews are sampled stratified by rating
//! so critical reviews are deliberately over-represented relative to a naive
//! proportional sample — app store review distributions skew heavily toward
//! 5 stars, which would otherwise drown out every complaint worth reading.

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::llm::LlmClient;
use crate::models::{AnalysisStatus, AppAnalysis, AppInfo, Phase, Review, StreamEvent};

/// Schema-validation attempts before an analysis error surfaces.
const VALIDATION_ATTEMPTS: u32 = 3;

/// Per-star sample caps, index 0 = 1 star. Critical buckets stay small but
/// over-weighted relative to the typical rating distribution.
const BUCKET_CAPS: [usize; 5] = [10, 10, 10, 15, 15];

/// Maximum description excerpt embedded in the prompt.
const DESCRIPTION_EXCERPT: usize = 1200;

/// Prompt verbosity guidance. Varies wording only, never control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Basic,
    Detailed,
    Comprehensive,
}

impl Depth {
    pub fn parse(s: &str) -> Option<Depth> {
        match s {
            "basic" => Some(Depth::Basic),
            "detailed" => Some(Depth::Detailed),
            "comprehensive" => Some(Depth::Comprehensive),
            _ => None,
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            Depth::Basic => "Keep each field brief: one short phrase per item, at most 5 features.",
            Depth::Detailed => {
                "Be specific and concrete: cite patterns from the reviews, cover 5-10 features."
            }
            Depth::Comprehensive => {
                "Be thorough: cover every recurring theme in the reviews, including minor ones, \
                 with concrete feedback examples per feature."
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    pub sample_size: usize,
    pub depth: Depth,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            sample_size: 50,
            depth: Depth::Detailed,
        }
    }
}

/// Stratified, order-preserving review sample.
///
/// Buckets by star rating with per-bucket caps, then backfills with any
/// remaining unselected reviews (in original order) until `sample_size` is
/// reached or reviews run out. Never exceeds `sample_size`, never duplicates
/// a review.
pub fn balanced_sample(reviews: &[Review], sample_size: usize) -> Vec<Review> {
    let mut taken_per_bucket = [0usize; 5];
    let mut selected: Vec<usize> = Vec::new();

    for (i, review) in reviews.iter().enumerate() {
        let bucket = (review.score.clamp(1, 5) - 1) as usize;
        if taken_per_bucket[bucket] < BUCKET_CAPS[bucket] {
            taken_per_bucket[bucket] += 1;
            selected.push(i);
        }
    }

    selected.truncate(sample_size);

    if selected.len() < sample_size {
        for i in 0..reviews.len() {
            if selected.len() >= sample_size {
                break;
            }
            if !selected.contains(&i) {
                selected.push(i);
            }
        }
    }

    selected.sort_unstable();
    selected.into_iter().map(|i| reviews[i].clone()).collect()
}

/// Count reviews per star rating, index 0 = 1 star.
pub fn bucket_counts(reviews: &[Review]) -> [usize; 5] {
    let mut counts = [0usize; 5];
    for review in reviews {
        counts[(review.score.clamp(1, 5) - 1) as usize] += 1;
    }
    counts
}

/// Analyze one app from its review sample.
///
/// Retries the structured call on schema-validation failure up to 3 attempts;
/// transport errors propagate from the LLM client's own retry budget. On
/// exhausted attempts the error names the app so the orchestrator can scope
/// the failure.
pub async fn analyze(
    llm: &dyn LlmClient,
    info: &AppInfo,
    reviews: &[Review],
    opts: &AnalyzeOptions,
) -> Result<AppAnalysis> {
    let sample = balanced_sample(reviews, opts.sample_size);
    let prompt = build_analysis_prompt(info, reviews, &sample, opts.depth);

    let mut last_err = None;
    for attempt in 1..=VALIDATION_ATTEMPTS {
        let value = llm
            .generate_json(ANALYSIS_SYSTEM_PROMPT, &prompt)
            .await
            .with_context(|| format!("Analysis failed for app {}", info.app_id))?;

        match validate_analysis(value, info) {
            Ok(analysis) => return Ok(analysis),
            Err(e) => {
                tracing::warn!(
                    app_id = %info.app_id,
                    attempt,
                    error = %e,
                    "analysis output failed validation"
                );
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("analysis validation failed"))
        .context(format!("Analysis failed for app {}", info.app_id)))
}

/// Progress-emitting variant: yields one status update describing the sample
/// before producing exactly one final result.
pub async fn analyze_with_progress(
    llm: &dyn LlmClient,
    info: &AppInfo,
    reviews: &[Review],
    opts: &AnalyzeOptions,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<AppAnalysis> {
    let sample_len = balanced_sample(reviews, opts.sample_size).len();
    let _ = tx
        .send(StreamEvent::status(
            AnalysisStatus::Analyzing,
            Phase::Analyzing,
            format!("Analyzing {} reviews for {}...", sample_len, info.title),
            Some(info.app_id.clone()),
        ))
        .await;

    analyze(llm, info, reviews, opts).await
}

/// Parse and validate one structured completion into an [`AppAnalysis`],
/// clamping score ranges at the boundary.
fn validate_analysis(value: serde_json::Value, info: &AppInfo) -> Result<AppAnalysis> {
    let mut analysis: AppAnalysis =
        serde_json::from_value(value).context("analysis object does not match schema")?;

    if analysis.app_name.trim().is_empty() {
        analysis.app_name = info.title.clone();
    }
    if analysis.overview.strengths.is_empty() && analysis.overview.weaknesses.is_empty() {
        anyhow::bail!("analysis has neither strengths nor weaknesses");
    }

    analysis.clamp_scores();
    Ok(analysis)
}

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a mobile app market analyst. You derive competitive \
insights strictly from the app metadata and user reviews provided. Respond with a single JSON \
object matching the requested schema exactly: no prose, no markdown fences.";

fn build_analysis_prompt(
    info: &AppInfo,
    all_reviews: &[Review],
    sample: &[Review],
    depth: Depth,
) -> String {
    let counts = bucket_counts(all_reviews);
    let mut prompt = String::with_capacity(16 * 1024);

    prompt.push_str(&format!(
        "Analyze the mobile app below from its user reviews.\n\n\
         App: {title}\nDeveloper: {developer}\nCategories: {categories}\n\
         Store rating: {score} across {ratings} ratings\n",
        title = info.title,
        developer = info.developer.as_deref().unwrap_or("unknown"),
        categories = info
            .categories
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        score = info
            .score
            .map(|s| format!("{:.1}", s))
            .unwrap_or_else(|| "n/a".to_string()),
        ratings = info
            .ratings
            .map(|r| r.to_string())
            .unwrap_or_else(|| "n/a".to_string()),
    ));

    let excerpt: String = info.description.chars().take(DESCRIPTION_EXCERPT).collect();
    prompt.push_str(&format!("\nDescription excerpt:\n{}\n", excerpt));

    prompt.push_str(&format!(
        "\nReview distribution (1..5 stars): {} / {} / {} / {} / {}\n",
        counts[0], counts[1], counts[2], counts[3], counts[4]
    ));

    prompt.push_str(&format!(
        "\nSampled reviews ({} of {}, stratified by rating):\n",
        sample.len(),
        all_reviews.len()
    ));
    for review in sample {
        let title = review.title.as_deref().unwrap_or("");
        prompt.push_str(&format!(
            "- [{}★ {}] {} {}\n",
            review.score,
            review.date.format("%Y-%m-%d"),
            title,
            review.text.replace('\n', " "),
        ));
    }

    prompt.push_str(&format!("\nGuidance: {}\n", depth.guidance()));

    prompt.push_str(
        "\nReturn a JSON object with this shape:\n\
        {\n\
          \"app_name\": string,\n\
          \"overview\": {\n\
            \"strengths\": [string], \"weaknesses\": [string],\n\
            \"opportunities\": [string], \"threats\": [string],\n\
            \"market_position\": string, \"target_demographic\": string\n\
          },\n\
          \"feature_analysis\": [{\n\
            \"feature\": string, \"sentiment_score\": number in [-1,1],\n\
            \"mention_count\": integer, \"common_feedback\": [string],\n\
            \"competitive_edge\": boolean,\n\
            \"improvement_priority\": \"low\"|\"medium\"|\"high\"|\"critical\"\n\
          }],\n\
          \"pricing_perception\": {\n\
            \"value_for_money\": number in [-1,1],\n\
            \"pricing_complaints\": number in [0,100],\n\
            \"willingness\": string\n\
          },\n\
          \"recommended_actions\": [{\n\
            \"action\": string, \"priority\": \"low\"|\"medium\"|\"high\"|\"critical\",\n\
            \"impact\": string, \"timeframe\": string (optional)\n\
          }],\n\
          \"user_segments\": [string] (optional)\n\
        }\n",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn review(id: usize, score: i64) -> Review {
        Review {
            id: format!("r{}", id),
            user_name: "u".to_string(),
            user_image: None,
            date: Utc::now(),
            score,
            title: None,
            text: format!("review {}", id),
            thumbs_up: None,
            version: None,
        }
    }

    fn pool(counts: [usize; 5]) -> Vec<Review> {
        let mut out = Vec::new();
        let mut id = 0;
        for (bucket, &n) in counts.iter().enumerate() {
            for _ in 0..n {
                out.push(review(id, bucket as i64 + 1));
                id += 1;
            }
        }
        out
    }

    #[test]
    fn sample_never_exceeds_size_and_has_no_duplicates() {
        let reviews = pool([40, 40, 40, 40, 200]);
        let sample = balanced_sample(&reviews, 50);
        assert!(sample.len() <= 50);

        let mut ids: Vec<&str> = sample.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn critical_reviews_are_over_represented() {
        // A realistic positively-skewed pool
        let reviews = pool([20, 10, 15, 50, 300]);
        let sample = balanced_sample(&reviews, 50);
        let counts = bucket_counts(&sample);
        assert_eq!(counts[0], 10);
        assert_eq!(counts[1], 10);
        assert_eq!(counts[2], 10);
        // 1-star share of sample far exceeds its share of the pool
        assert!(counts[0] as f64 / 50.0 > 20.0 / 395.0);
    }

    #[test]
    fn backfill_reaches_sample_size_when_buckets_fall_short() {
        // Only 5-star reviews: bucket cap is 15, backfill tops it up
        let reviews = pool([0, 0, 0, 0, 40]);
        let sample = balanced_sample(&reviews, 30);
        assert_eq!(sample.len(), 30);
    }

    #[test]
    fn small_pool_is_taken_whole() {
        let reviews = pool([2, 1, 0, 3, 4]);
        let sample = balanced_sample(&reviews, 50);
        assert_eq!(sample.len(), 10);
    }

    #[test]
    fn sample_preserves_original_order() {
        let reviews = pool([3, 0, 0, 0, 3]);
        let sample = balanced_sample(&reviews, 6);
        let ids: Vec<&str> = sample.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r3", "r4", "r5"]);
    }

    #[test]
    fn validate_fills_empty_app_name() {
        let info = AppInfo {
            app_id: "com.a".to_string(),
            platform: crate::models::Platform::GooglePlay,
            title: "Alpha".to_string(),
            icon: None,
            developer: None,
            categories: vec![],
            description: String::new(),
            score: None,
            ratings: None,
            histogram: None,
            installs: None,
            version: None,
            raw: serde_json::Value::Null,
            last_fetched: Utc::now(),
        };
        let value = serde_json::json!({
            "app_name": "",
            "overview": {
                "strengths": ["fast"], "weaknesses": [],
                "market_position": "leader", "target_demographic": "teens"
            },
            "feature_analysis": [{
                "feature": "Sync", "sentiment_score": 2.0, "mention_count": 4,
                "common_feedback": [], "competitive_edge": true,
                "improvement_priority": "low"
            }],
            "pricing_perception": {
                "value_for_money": 0.5, "pricing_complaints": 10.0, "willingness": "high"
            },
            "recommended_actions": []
        });
        let analysis = validate_analysis(value, &info).unwrap();
        assert_eq!(analysis.app_name, "Alpha");
        // Out-of-range score clamped at the boundary
        assert_eq!(analysis.feature_analysis[0].sentiment_score, 1.0);
    }

    #[test]
    fn validate_rejects_empty_overview() {
        let info_value = serde_json::json!({
            "app_name": "X",
            "overview": {
                "strengths": [], "weaknesses": [],
                "market_position": "", "target_demographic": ""
            },
            "feature_analysis": [],
            "pricing_perception": {
                "value_for_money": 0.0, "pricing_complaints": 0.0, "willingness": ""
            },
            "recommended_actions": []
        });
        let info = AppInfo {
            app_id: "com.a".to_string(),
            platform: crate::models::Platform::GooglePlay,
            title: "Alpha".to_string(),
            icon: None,
            developer: None,
            categories: vec![],
            description: String::new(),
            score: None,
            ratings: None,
            histogram: None,
            installs: None,
            version: None,
            raw: serde_json::Value::Null,
            last_fetched: Utc::now(),
        };
        assert!(validate_analysis(info_value, &info).is_err());
    }

    #[test]
    fn prompt_embeds_sample_and_distribution() {
        let info = AppInfo {
            app_id: "com.a".to_string(),
            platform: crate::models::Platform::GooglePlay,
            title: "Alpha".to_string(),
            icon: None,
            developer: Some("Acme".to_string()),
            categories: vec![],
            description: "A very useful app.".to_string(),
            score: Some(4.1),
            ratings: Some(52),
            histogram: None,
            installs: None,
            version: None,
            raw: serde_json::Value::Null,
            last_fetched: Utc::now(),
        };
        let reviews = pool([1, 0, 0, 0, 2]);
        let sample = balanced_sample(&reviews, 10);
        let prompt = build_analysis_prompt(&info, &reviews, &sample, Depth::Basic);
        assert!(prompt.contains("Alpha"));
        assert!(prompt.contains("1 / 0 / 0 / 0 / 2"));
        assert!(prompt.contains("review 0"));
    }
}
