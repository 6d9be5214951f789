//! Core data models used throughout ReviewLens.
//!
//! These types represent the apps, reviews, analyses, and stream events that
//! flow through the fetch → analyze → compare → stream pipeline. Everything
//! here is plain serde data; behavior lives in the modules that produce and
//! consume these shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Store platform an app belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    GooglePlay,
    AppStore,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::GooglePlay => "google_play",
            Platform::AppStore => "app_store",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "google_play" => Some(Platform::GooglePlay),
            "app_store" => Some(Platform::AppStore),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved app identifier, produced by the resolver from free-form input.
/// Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentifier {
    /// The raw user input this identifier was parsed from.
    pub raw_input: String,
    /// Store-native app id (package name or numeric id).
    pub app_id: String,
    pub platform: Platform,
}

/// A store category an app is listed under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

/// Persisted snapshot of one app's store metadata.
///
/// Created on first successful fetch; overwritten (not versioned) whenever
/// re-fetched because stale. Never deleted by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppInfo {
    pub app_id: String,
    pub platform: Platform,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer: Option<String>,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratings: Option<i64>,
    /// Rating histogram, index 0 = 1 star ... index 4 = 5 stars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Vec<i64>>,
    /// Install-count bucket as reported by the store (e.g. `"10,000,000+"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Raw provider payload, tagged with a `platform` field for downstream
    /// disambiguation.
    #[serde(default)]
    pub raw: serde_json::Value,
    pub last_fetched: DateTime<Utc>,
}

/// One user review belonging to an app snapshot.
///
/// Reviews are replaced wholesale whenever the parent app is re-fetched; a
/// re-fetch invalidates and replaces the prior sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image: Option<String>,
    pub date: DateTime<Utc>,
    /// Star rating, 1..=5.
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbs_up: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Result of fetching one app: metadata plus a bounded review sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedApp {
    pub info: AppInfo,
    pub reviews: Vec<Review>,
}

// ============ Analysis types ============

/// Priority label used across feature and action items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// SWOT-style overview of one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub opportunities: Vec<String>,
    #[serde(default)]
    pub threats: Vec<String>,
    pub market_position: String,
    pub target_demographic: String,
}

/// Sentiment summary for one feature mentioned in reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSentiment {
    pub feature: String,
    /// Clamped to `[-1.0, 1.0]` at the analyzer boundary.
    pub sentiment_score: f64,
    pub mention_count: i64,
    #[serde(default)]
    pub common_feedback: Vec<String>,
    #[serde(default)]
    pub competitive_edge: bool,
    pub improvement_priority: Priority,
}

/// How users perceive the app's pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingPerception {
    /// Clamped to `[-1.0, 1.0]` at the analyzer boundary.
    pub value_for_money: f64,
    /// Percentage of sampled reviews complaining about pricing, 0..=100.
    pub pricing_complaints: f64,
    pub willingness: String,
}

/// A single recommended action for the app's team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendedAction {
    pub action: String,
    pub priority: Priority,
    pub impact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
}

/// Structured analysis of one app, derived from its review sample.
///
/// Created once per (app, review-sample) combination; cached keyed by the app
/// row and invalidated together with its reviews.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppAnalysis {
    pub app_name: String,
    pub overview: Overview,
    pub feature_analysis: Vec<FeatureSentiment>,
    pub pricing_perception: PricingPerception,
    pub recommended_actions: Vec<RecommendedAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_segments: Option<Vec<String>>,
}

impl AppAnalysis {
    /// Clamp every sentiment-style score into `[-1.0, 1.0]` and complaint
    /// percentages into `[0.0, 100.0]`. The analyzer applies this before an
    /// analysis leaves its boundary, so consumers can rely on the ranges.
    pub fn clamp_scores(&mut self) {
        for f in &mut self.feature_analysis {
            f.sentiment_score = f.sentiment_score.clamp(-1.0, 1.0);
        }
        let p = &mut self.pricing_perception;
        p.value_for_money = p.value_for_money.clamp(-1.0, 1.0);
        p.pricing_complaints = p.pricing_complaints.clamp(0.0, 100.0);
    }
}

/// Wire payload of the `analysis_results` stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResults {
    pub app_id: String,
    pub app_name: String,
    /// Size of the review sample the analysis was derived from.
    pub review_count: i64,
    pub analysis: AppAnalysis,
}

// ============ Comparison types ============

/// Per-app summary row in a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummaryRow {
    pub name: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    pub review_count: i64,
}

/// One aggregated feature row across apps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureComparison {
    pub feature: String,
    /// Fraction of successfully analyzed apps mentioning this feature, in
    /// `(0.0, 1.0]`.
    pub app_coverage: f64,
    pub average_sentiment: f64,
    pub total_mentions: i64,
    pub present_in_apps: Vec<String>,
}

/// A strength or weakness shared by more than one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommonTrait {
    pub text: String,
    pub apps: Vec<String>,
}

/// A strength or weakness reported by exactly one app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueTrait {
    pub text: String,
    pub app: String,
}

/// Common/unique partition of strengths or weaknesses across apps.
/// The two sides never share a case-folded key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TraitComparison {
    pub common: Vec<CommonTrait>,
    pub unique: Vec<UniqueTrait>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPositionRow {
    pub app: String,
    pub position: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingRow {
    pub app: String,
    pub value_for_money: f64,
    pub pricing_complaints: f64,
    pub willingness: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBaseRow {
    pub app: String,
    pub target_demographic: String,
    #[serde(default)]
    pub segments: Vec<String>,
}

/// Cross-app comparison derived from N successful analyses (N >= 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub apps: Vec<AppSummaryRow>,
    pub feature_comparison: Vec<FeatureComparison>,
    pub strengths_comparison: TraitComparison,
    pub weaknesses_comparison: TraitComparison,
    pub market_position: Vec<MarketPositionRow>,
    pub pricing_comparison: Vec<PricingRow>,
    pub user_base_comparison: Vec<UserBaseRow>,
    /// Exactly 7 entries of the form `"STEP <n>: <title>. <description>"`.
    pub recommendation_summary: Vec<String>,
}

// ============ Stream protocol ============

/// Coarse status carried on `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Analyzing,
    Summarizing,
    Completed,
    Error,
}

/// Typed pipeline phase carried on `status` events so consumers can drive
/// loading state without matching message prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Resolving,
    Fetching,
    Analyzing,
    Comparing,
    Summarizing,
    Done,
    Failed,
}

/// Discriminated union flowing over the wire, one JSON object per frame.
///
/// Ordering within one app's pipeline is fixed
/// (status → app_info → status → analysis_results); across apps no relative
/// order is guaranteed. A comparison frame, when present, always follows all
/// per-app frames it depends on, and narrative frames are always last before
/// the terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        status: AnalysisStatus,
        message: String,
        /// Absent in streams produced before phases existed; consumers fall
        /// back to message matching.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
    },
    AppInfo(AppInfo),
    AnalysisResults(AnalysisResults),
    ComparisonResults(ComparisonResult),
    Narrative {
        /// Monotonically increasing per run, so identical token text still
        /// fingerprints uniquely.
        index: u64,
        text: String,
    },
}

impl StreamEvent {
    /// Convenience constructor for a `status` frame.
    pub fn status(
        status: AnalysisStatus,
        phase: Phase,
        message: impl Into<String>,
        app_id: Option<String>,
    ) -> Self {
        StreamEvent::Status {
            status,
            message: message.into(),
            phase: Some(phase),
            app_id,
        }
    }

    /// Stable fingerprint of the full serialized event, used by consumers to
    /// deduplicate replayed frames. Struct fields serialize in declaration
    /// order, so equal events always hash equal.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> StreamEvent {
        StreamEvent::status(
            AnalysisStatus::Analyzing,
            Phase::Fetching,
            "Fetching data for app com.example...",
            Some("com.example".to_string()),
        )
    }

    #[test]
    fn stream_event_tagging() {
        let json = serde_json::to_value(sample_status()).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "analyzing");
        assert_eq!(json["phase"], "fetching");
        assert_eq!(json["app_id"], "com.example");
    }

    #[test]
    fn stream_event_roundtrip() {
        let ev = sample_status();
        let json = serde_json::to_string(&ev).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn status_without_phase_deserializes() {
        let back: StreamEvent =
            serde_json::from_str(r#"{"type":"status","status":"completed","message":"done"}"#)
                .unwrap();
        match back {
            StreamEvent::Status { phase, .. } => assert!(phase.is_none()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn fingerprint_distinguishes_events() {
        let a = sample_status();
        let b = StreamEvent::Narrative {
            index: 0,
            text: "hello".to_string(),
        };
        let c = StreamEvent::Narrative {
            index: 1,
            text: "hello".to_string(),
        };
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        // Same token text, different index: still distinct.
        assert_ne!(b.fingerprint(), c.fingerprint());
    }

    #[test]
    fn clamp_scores_bounds() {
        let mut analysis = AppAnalysis {
            app_name: "X".to_string(),
            overview: Overview {
                strengths: vec![],
                weaknesses: vec![],
                opportunities: vec![],
                threats: vec![],
                market_position: String::new(),
                target_demographic: String::new(),
            },
            feature_analysis: vec![FeatureSentiment {
                feature: "sync".to_string(),
                sentiment_score: 3.5,
                mention_count: 2,
                common_feedback: vec![],
                competitive_edge: false,
                improvement_priority: Priority::Low,
            }],
            pricing_perception: PricingPerception {
                value_for_money: -2.0,
                pricing_complaints: 140.0,
                willingness: String::new(),
            },
            recommended_actions: vec![],
            user_segments: None,
        };
        analysis.clamp_scores();
        assert_eq!(analysis.feature_analysis[0].sentiment_score, 1.0);
        assert_eq!(analysis.pricing_perception.value_for_money, -1.0);
        assert_eq!(analysis.pricing_perception.pricing_complaints, 100.0);
    }
}
