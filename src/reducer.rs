//! Client-side stream folding.
//!
//! [`ClientState`] is the reference consumer of the event stream: an
//! idempotent fold that any UI (or test) can use to materialize the current
//! view from a prefix of events. Replayed frames are dropped by fingerprint,
//! so re-delivering any prefix of the stream leaves the state unchanged.
//!
//! Loading flags are driven by the typed `phase` on status events when
//! present; streams produced before phases existed fall back to the
//! documented message prefixes.

use std::collections::{BTreeMap, HashSet};

use crate::models::{
    AnalysisResults, AnalysisStatus, AppInfo, ComparisonResult, Phase, StreamEvent,
};

/// One app's slot in the client view, keyed by app id, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct AppEntry {
    pub app_id: String,
    pub info: Option<AppInfo>,
    pub results: Option<AnalysisResults>,
    /// Scoped failure message, when this app's pipeline errored.
    pub error: Option<String>,
}

/// Materialized view of an analysis stream.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
    /// Most recent status message, verbatim.
    pub status_message: String,
    pub apps: Vec<AppEntry>,
    pub comparison: Option<ComparisonResult>,
    /// Narrative frames by index; render by joining in key order.
    pub narrative: BTreeMap<u64, String>,
    /// App ids with a fetch or analysis in flight.
    pub loading_app_ids: HashSet<String>,
    pub show_comparison_skeleton: bool,
    pub show_summary_skeleton: bool,
    pub completed: bool,
    /// Request-level failure, terminal.
    pub error: Option<String>,
    seen: HashSet<String>,
}

impl ClientState {
    /// Fold one event into the state. Returns `false` when the event was a
    /// replay (already-seen fingerprint) and was ignored.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        if !self.seen.insert(event.fingerprint()) {
            return false;
        }

        match event {
            StreamEvent::Status {
                status,
                message,
                phase,
                app_id,
            } => self.apply_status(*status, message, *phase, app_id.as_deref()),
            StreamEvent::AppInfo(info) => {
                self.loading_app_ids.remove(&info.app_id);
                self.entry_mut(&info.app_id).info = Some(info.clone());
            }
            StreamEvent::AnalysisResults(results) => {
                self.loading_app_ids.remove(&results.app_id);
                self.entry_mut(&results.app_id).results = Some(results.clone());
            }
            StreamEvent::ComparisonResults(comparison) => {
                self.show_comparison_skeleton = false;
                self.comparison = Some(comparison.clone());
            }
            StreamEvent::Narrative { index, text } => {
                self.show_summary_skeleton = false;
                self.narrative.insert(*index, text.clone());
            }
        }
        true
    }

    /// Rebuild the state from a full snapshot of the stream so far. An empty
    /// snapshot resets everything, including the replay fingerprints.
    pub fn apply_snapshot(&mut self, events: &[StreamEvent]) {
        *self = ClientState::default();
        for event in events {
            self.apply(event);
        }
    }

    /// The narrative text accumulated so far, frames joined in index order.
    pub fn narrative_text(&self) -> String {
        self.narrative.values().cloned().collect()
    }

    fn apply_status(
        &mut self,
        status: AnalysisStatus,
        message: &str,
        phase: Option<Phase>,
        app_id: Option<&str>,
    ) {
        self.status_message = message.to_string();

        match status {
            AnalysisStatus::Completed => {
                self.completed = true;
                self.loading_app_ids.clear();
                self.show_comparison_skeleton = false;
                self.show_summary_skeleton = false;
                return;
            }
            AnalysisStatus::Error => {
                let scoped = app_id
                    .map(|id| id.to_string())
                    .or_else(|| extract_app_id(message));
                match scoped {
                    Some(id) => {
                        self.loading_app_ids.remove(&id);
                        self.entry_mut(&id).error = Some(message.to_string());
                    }
                    None => {
                        // Request-level failure: terminal.
                        self.error = Some(message.to_string());
                        self.loading_app_ids.clear();
                        self.show_comparison_skeleton = false;
                        self.show_summary_skeleton = false;
                    }
                }
                return;
            }
            AnalysisStatus::Analyzing | AnalysisStatus::Summarizing => {}
        }

        let phase = phase.or_else(|| phase_from_message(message));
        match phase {
            Some(Phase::Fetching) | Some(Phase::Analyzing) => {
                let id = app_id
                    .map(|id| id.to_string())
                    .or_else(|| extract_app_id(message));
                if let Some(id) = id {
                    self.loading_app_ids.insert(id);
                }
            }
            Some(Phase::Comparing) => self.show_comparison_skeleton = true,
            Some(Phase::Summarizing) => self.show_summary_skeleton = true,
            _ => {}
        }
    }

    fn entry_mut(&mut self, app_id: &str) -> &mut AppEntry {
        if let Some(pos) = self.apps.iter().position(|e| e.app_id == app_id) {
            return &mut self.apps[pos];
        }
        self.apps.push(AppEntry {
            app_id: app_id.to_string(),
            ..Default::default()
        });
        let last = self.apps.len() - 1;
        &mut self.apps[last]
    }
}

/// Classify a phaseless status message by its documented prefixes.
fn phase_from_message(message: &str) -> Option<Phase> {
    if message.starts_with("Resolving") {
        Some(Phase::Resolving)
    } else if message.starts_with("Fetching data for app ") {
        Some(Phase::Fetching)
    } else if message.starts_with("Analyzing ") || message.starts_with("Loaded cached analysis") {
        Some(Phase::Analyzing)
    } else if message.starts_with("Comparing ")
        || message.starts_with("Generating cross-app comparison")
    {
        Some(Phase::Comparing)
    } else if message.starts_with("Generating") {
        Some(Phase::Summarizing)
    } else {
        None
    }
}

/// Pull the app id out of a `"Fetching data for app <id>..."` message when
/// the event carries no `app_id` field.
fn extract_app_id(message: &str) -> Option<String> {
    let rest = message.strip_prefix("Fetching data for app ")?;
    let id = rest.strip_suffix("...").unwrap_or(rest);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AppAnalysis, Overview, Platform, PricingPerception,
    };
    use chrono::Utc;

    fn info(app_id: &str) -> AppInfo {
        AppInfo {
            app_id: app_id.to_string(),
            platform: Platform::GooglePlay,
            title: format!("App {}", app_id),
            icon: None,
            developer: None,
            categories: vec![],
            description: String::new(),
            score: Some(4.0),
            ratings: Some(10),
            histogram: None,
            installs: None,
            version: None,
            raw: serde_json::Value::Null,
            last_fetched: Utc::now(),
        }
    }

    fn results(app_id: &str) -> AnalysisResults {
        AnalysisResults {
            app_id: app_id.to_string(),
            app_name: format!("App {}", app_id),
            review_count: 50,
            analysis: AppAnalysis {
                app_name: format!("App {}", app_id),
                overview: Overview {
                    strengths: vec!["fast".to_string()],
                    weaknesses: vec![],
                    opportunities: vec![],
                    threats: vec![],
                    market_position: "niche".to_string(),
                    target_demographic: "everyone".to_string(),
                },
                feature_analysis: vec![],
                pricing_perception: PricingPerception {
                    value_for_money: 0.0,
                    pricing_complaints: 0.0,
                    willingness: "low".to_string(),
                },
                recommended_actions: vec![],
                user_segments: None,
            },
        }
    }

    fn fetching(app_id: &str) -> StreamEvent {
        StreamEvent::status(
            AnalysisStatus::Analyzing,
            Phase::Fetching,
            format!("Fetching data for app {}...", app_id),
            Some(app_id.to_string()),
        )
    }

    #[test]
    fn loading_flag_tracks_app_lifecycle() {
        let mut state = ClientState::default();

        state.apply(&fetching("com.a"));
        assert!(state.loading_app_ids.contains("com.a"));

        state.apply(&StreamEvent::AppInfo(info("com.a")));
        assert!(!state.loading_app_ids.contains("com.a"));

        // The analyzing status puts the app back in flight
        state.apply(&StreamEvent::status(
            AnalysisStatus::Analyzing,
            Phase::Analyzing,
            "Analyzing 50 reviews for App com.a...",
            Some("com.a".to_string()),
        ));
        assert!(state.loading_app_ids.contains("com.a"));

        state.apply(&StreamEvent::AnalysisResults(results("com.a")));
        assert!(!state.loading_app_ids.contains("com.a"));
        assert!(state.apps[0].results.is_some());
    }

    #[test]
    fn replayed_events_are_ignored() {
        let mut state = ClientState::default();
        let event = StreamEvent::AppInfo(info("com.a"));

        assert!(state.apply(&event));
        assert!(!state.apply(&event));
        assert_eq!(state.apps.len(), 1);
    }

    #[test]
    fn replaying_a_prefix_changes_nothing() {
        let events = vec![
            fetching("com.a"),
            StreamEvent::AppInfo(info("com.a")),
            StreamEvent::AnalysisResults(results("com.a")),
            StreamEvent::Narrative {
                index: 0,
                text: "Alpha ".to_string(),
            },
            StreamEvent::Narrative {
                index: 1,
                text: "wins.".to_string(),
            },
        ];

        let mut state = ClientState::default();
        for event in &events {
            state.apply(event);
        }
        let narrative_before = state.narrative_text();
        let apps_before = state.apps.len();

        // Re-deliver the first three frames
        for event in &events[..3] {
            assert!(!state.apply(event));
        }
        assert_eq!(state.narrative_text(), narrative_before);
        assert_eq!(state.apps.len(), apps_before);
    }

    #[test]
    fn phaseless_status_falls_back_to_message_prefix() {
        let mut state = ClientState::default();
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"status","status":"analyzing","message":"Fetching data for app com.b..."}"#,
        )
        .unwrap();
        state.apply(&event);
        assert!(state.loading_app_ids.contains("com.b"));
    }

    #[test]
    fn scoped_error_does_not_terminate() {
        let mut state = ClientState::default();
        state.apply(&fetching("com.a"));
        state.apply(&StreamEvent::status(
            AnalysisStatus::Error,
            Phase::Failed,
            "Failed to analyze com.a: fetch error",
            Some("com.a".to_string()),
        ));

        assert!(state.error.is_none());
        assert!(!state.loading_app_ids.contains("com.a"));
        assert!(state.apps[0].error.is_some());
    }

    #[test]
    fn unscoped_error_is_terminal() {
        let mut state = ClientState::default();
        state.apply(&StreamEvent::status(
            AnalysisStatus::Error,
            Phase::Failed,
            "Analysis failed: storage unavailable",
            None,
        ));
        assert_eq!(
            state.error.as_deref(),
            Some("Analysis failed: storage unavailable")
        );
    }

    #[test]
    fn completed_clears_loading_and_skeletons() {
        let mut state = ClientState::default();
        state.apply(&fetching("com.a"));
        state.apply(&StreamEvent::status(
            AnalysisStatus::Analyzing,
            Phase::Comparing,
            "Comparing 2 apps...",
            None,
        ));
        assert!(state.show_comparison_skeleton);

        state.apply(&StreamEvent::status(
            AnalysisStatus::Completed,
            Phase::Done,
            "Analysis complete for App com.a.",
            None,
        ));
        assert!(state.completed);
        assert!(state.loading_app_ids.is_empty());
        assert!(!state.show_comparison_skeleton);
    }

    #[test]
    fn narrative_frames_join_in_index_order() {
        let mut state = ClientState::default();
        // Out-of-order delivery still renders correctly
        state.apply(&StreamEvent::Narrative {
            index: 1,
            text: "world".to_string(),
        });
        state.apply(&StreamEvent::Narrative {
            index: 0,
            text: "hello ".to_string(),
        });
        assert_eq!(state.narrative_text(), "hello world");
    }

    #[test]
    fn empty_snapshot_resets_everything() {
        let mut state = ClientState::default();
        let event = StreamEvent::AppInfo(info("com.a"));
        state.apply(&event);

        state.apply_snapshot(&[]);
        assert!(state.apps.is_empty());
        // Fingerprints were cleared too: the event applies again
        assert!(state.apply(&event));
    }
}
