//! Streaming pipeline orchestration.
//!
//! [`Orchestrator::run`] drives one analysis request end to end: resolve
//! identifiers, fan out per-app fetch+analyze pipelines in parallel, compare
//! when at least two apps succeed, then stream a narrative digest. Every
//! intermediate result is pushed through the event channel the moment it
//! exists; the consumer renders incrementally and never waits for the run to
//! finish.
//!
//! Failure isolation: one app failing to fetch or analyze produces a scoped
//! `status: error` event and drops that app from the comparison, it never
//! aborts the run. Only request-level failures (comparison, narrative,
//! storage) terminate the stream with `status: error`.

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::analyzer::{self, AnalyzeOptions};
use crate::compare::{self, AccessPolicy, AnalyzedApp};
use crate::fetcher::ReviewSource;
use crate::llm::{ChatMessage, LlmClient};
use crate::models::{
    AnalysisResults, AnalysisStatus, AppIdentifier, Phase, StreamEvent,
};
use crate::resolver;
use crate::store::AppDataStore;

/// One analysis request, already shape-validated by the transport layer.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    /// Direct app ids; when non-empty, conversation turns are ignored.
    pub app_ids: Vec<String>,
    /// User-turn texts of the conversation, oldest first.
    pub turns: Vec<String>,
    pub user: Option<String>,
}

/// Identifiers a request resolves to: `targets` run the full pipeline,
/// `context` apps (from earlier conversation turns) join the comparison only
/// if a fresh cached analysis already exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub targets: Vec<AppIdentifier>,
    pub context: Vec<AppIdentifier>,
}

pub fn resolve_request(req: &AnalysisRequest) -> ResolvedRequest {
    if !req.app_ids.is_empty() {
        return ResolvedRequest {
            targets: resolver::resolve_segments(&req.app_ids),
            context: Vec::new(),
        };
    }

    let targets = req
        .turns
        .last()
        .map(|turn| resolver::resolve_identifiers(turn))
        .unwrap_or_default();
    let context = resolver::resolve_conversation(&req.turns)
        .into_iter()
        .filter(|ident| !targets.iter().any(|t| t.app_id == ident.app_id))
        .collect();

    ResolvedRequest { targets, context }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: AppDataStore,
    source: Arc<dyn ReviewSource>,
    llm: Arc<dyn LlmClient>,
    policy: Arc<dyn AccessPolicy>,
    analyze_opts: AnalyzeOptions,
    review_count: usize,
}

impl Orchestrator {
    pub fn new(
        store: AppDataStore,
        source: Arc<dyn ReviewSource>,
        llm: Arc<dyn LlmClient>,
        policy: Arc<dyn AccessPolicy>,
        analyze_opts: AnalyzeOptions,
        review_count: usize,
    ) -> Self {
        Self {
            store,
            source,
            llm,
            policy,
            analyze_opts,
            review_count,
        }
    }

    /// Run one request to completion, streaming events through `tx`.
    ///
    /// Never returns an error: request-level failures become a terminal
    /// `status: error` event on the stream. A closed receiver just ends the
    /// run early.
    pub async fn run(&self, req: AnalysisRequest, tx: mpsc::Sender<StreamEvent>) {
        if let Err(e) = self.run_inner(&req, &tx).await {
            tracing::error!(error = ?e, "analysis run failed");
            let _ = tx
                .send(StreamEvent::status(
                    AnalysisStatus::Error,
                    Phase::Failed,
                    format!("Analysis failed: {:#}", e),
                    None,
                ))
                .await;
        }
    }

    async fn run_inner(&self, req: &AnalysisRequest, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
        let _ = tx
            .send(StreamEvent::status(
                AnalysisStatus::Analyzing,
                Phase::Resolving,
                "Resolving app identifiers...",
                None,
            ))
            .await;

        let resolved = resolve_request(req);
        tracing::info!(
            targets = resolved.targets.len(),
            context = resolved.context.len(),
            "resolved analysis request"
        );

        // Fan out one pipeline per target; each failure stays scoped to its
        // own app.
        let handles: Vec<_> = resolved
            .targets
            .iter()
            .cloned()
            .map(|ident| {
                let this = self.clone();
                let tx = tx.clone();
                tokio::spawn(async move { this.run_app_pipeline(ident, tx).await })
            })
            .collect();

        let mut analyzed: Vec<AnalyzedApp> = Vec::new();
        for outcome in join_all(handles).await {
            match outcome {
                Ok(Some(app)) => analyzed.push(app),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "app pipeline task panicked"),
            }
        }

        // Earlier-turn apps join the comparison only when their cached
        // analysis is still fresh; they are never re-fetched here.
        for ident in &resolved.context {
            if analyzed.iter().any(|a| a.info.app_id == ident.app_id) {
                continue;
            }
            let Some(fetched) = self.store.load_fresh(&ident.app_id).await? else {
                continue;
            };
            let Some((analysis, review_count)) =
                self.store.cached_analysis(&ident.app_id).await?
            else {
                continue;
            };
            analyzed.push(AnalyzedApp {
                info: fetched.info,
                review_count,
                analysis,
            });
        }

        if analyzed.is_empty() {
            let _ = tx
                .send(StreamEvent::status(
                    AnalysisStatus::Completed,
                    Phase::Done,
                    "Analysis complete. No valid results.",
                    None,
                ))
                .await;
            return Ok(());
        }

        // Comparison requires two successes; the narrative digest runs for
        // any non-empty result set (single-app or comparison narrative).
        let comparison = if analyzed.len() >= 2 {
            Some(self.run_comparison(req, &analyzed, tx).await?)
        } else {
            None
        };
        self.stream_narrative(&analyzed, comparison.as_ref(), tx)
            .await?;

        let names: Vec<&str> = analyzed
            .iter()
            .map(|a| {
                if a.analysis.app_name.is_empty() {
                    a.info.title.as_str()
                } else {
                    a.analysis.app_name.as_str()
                }
            })
            .collect();
        let _ = tx
            .send(StreamEvent::status(
                AnalysisStatus::Completed,
                Phase::Done,
                format!("Analysis complete for {}.", names.join(", ")),
                None,
            ))
            .await;
        Ok(())
    }

    /// Fetch + analyze one app, streaming its events in the fixed per-app
    /// order: status → app_info → status → analysis_results. Returns `None`
    /// after emitting a scoped error event on any failure.
    async fn run_app_pipeline(
        &self,
        ident: AppIdentifier,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Option<AnalyzedApp> {
        let app_id = ident.app_id.clone();
        let _ = tx
            .send(StreamEvent::status(
                AnalysisStatus::Analyzing,
                Phase::Fetching,
                format!("Fetching data for app {}...", app_id),
                Some(app_id.clone()),
            ))
            .await;

        let fetched = match self
            .store
            .get_or_fetch(
                self.source.as_ref(),
                &app_id,
                ident.platform,
                self.review_count,
            )
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(app_id = %app_id, error = ?e, "fetch failed");
                let _ = tx
                    .send(StreamEvent::status(
                        AnalysisStatus::Error,
                        Phase::Failed,
                        format!("Failed to analyze {}: {:#}", app_id, e),
                        Some(app_id),
                    ))
                    .await;
                return None;
            }
        };

        let _ = tx.send(StreamEvent::AppInfo(fetched.info.clone())).await;

        let (analysis, sample_len) = match self.store.cached_analysis(&app_id).await {
            Ok(Some((analysis, review_count))) => {
                let _ = tx
                    .send(StreamEvent::status(
                        AnalysisStatus::Analyzing,
                        Phase::Analyzing,
                        format!("Loaded cached analysis for {}...", fetched.info.title),
                        Some(app_id.clone()),
                    ))
                    .await;
                (analysis, review_count)
            }
            Ok(None) | Err(_) => {
                let result = analyzer::analyze_with_progress(
                    self.llm.as_ref(),
                    &fetched.info,
                    &fetched.reviews,
                    &self.analyze_opts,
                    &tx,
                )
                .await;
                let analysis = match result {
                    Ok(analysis) => analysis,
                    Err(e) => {
                        tracing::warn!(app_id = %app_id, error = ?e, "analysis failed");
                        let _ = tx
                            .send(StreamEvent::status(
                                AnalysisStatus::Error,
                                Phase::Failed,
                                format!("Failed to analyze {}: {:#}", app_id, e),
                                Some(app_id),
                            ))
                            .await;
                        return None;
                    }
                };
                let sample_len = analyzer::balanced_sample(
                    &fetched.reviews,
                    self.analyze_opts.sample_size,
                )
                .len() as i64;
                if let Err(e) = self
                    .store
                    .save_analysis(&app_id, &analysis, sample_len)
                    .await
                {
                    tracing::warn!(app_id = %app_id, error = ?e, "failed to cache analysis");
                }
                (analysis, sample_len)
            }
        };

        let results = AnalysisResults {
            app_id: app_id.clone(),
            app_name: if analysis.app_name.is_empty() {
                fetched.info.title.clone()
            } else {
                analysis.app_name.clone()
            },
            review_count: sample_len,
            analysis: analysis.clone(),
        };
        let _ = tx.send(StreamEvent::AnalysisResults(results)).await;

        Some(AnalyzedApp {
            info: fetched.info,
            review_count: sample_len,
            analysis,
        })
    }

    /// Produce the comparison frame, reusing a cached comparison for the
    /// exact same app-id set when fresh.
    async fn run_comparison(
        &self,
        req: &AnalysisRequest,
        analyzed: &[AnalyzedApp],
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<crate::models::ComparisonResult> {
        let _ = tx
            .send(StreamEvent::status(
                AnalysisStatus::Analyzing,
                Phase::Comparing,
                format!("Comparing {} apps...", analyzed.len()),
                None,
            ))
            .await;

        let app_ids: Vec<String> = analyzed.iter().map(|a| a.info.app_id.clone()).collect();
        let user = req.user.as_deref().unwrap_or("anonymous");

        // The access check gates every comparator result, cached or fresh.
        if !self.policy.user_has_access(user, &app_ids).await? {
            bail!("Comparison failed: access denied: user does not have rights to all requested apps");
        }

        // Cache failures degrade: a broken read recomputes, a broken write
        // just skips persisting. Neither withholds a computed comparison.
        let cached = match self.store.cached_comparison(&app_ids).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(error = ?e, "comparison cache lookup failed, recomputing");
                None
            }
        };

        let comparison = match cached {
            Some(cached) => {
                tracing::info!("reusing cached comparison");
                cached
            }
            None => {
                let fresh = compare::compare(
                    self.llm.as_ref(),
                    self.policy.as_ref(),
                    user,
                    analyzed,
                )
                .await
                .context("Comparison failed")?;
                if let Err(e) = self.store.save_comparison(&app_ids, &fresh).await {
                    tracing::warn!(error = ?e, "failed to cache comparison");
                }
                fresh
            }
        };

        let _ = tx
            .send(StreamEvent::ComparisonResults(comparison.clone()))
            .await;
        Ok(comparison)
    }

    /// Stream the narrative digest as indexed frames: a comparison narrative
    /// when a comparison exists, a single-app narrative otherwise. A
    /// narrative failure is a request-level failure: the caller turns it
    /// into a terminal error.
    async fn stream_narrative(
        &self,
        analyzed: &[AnalyzedApp],
        comparison: Option<&crate::models::ComparisonResult>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let _ = tx
            .send(StreamEvent::status(
                AnalysisStatus::Summarizing,
                Phase::Summarizing,
                "Generating summary...",
                None,
            ))
            .await;

        let messages = vec![
            ChatMessage::system(NARRATIVE_SYSTEM_PROMPT),
            ChatMessage::user(build_narrative_prompt(analyzed, comparison)),
        ];

        let (token_tx, mut token_rx) = mpsc::channel::<String>(32);
        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            let mut index = 0u64;
            while let Some(text) = token_rx.recv().await {
                let _ = forward_tx
                    .send(StreamEvent::Narrative { index, text })
                    .await;
                index += 1;
            }
        });

        let result = self.llm.stream_chat(messages, token_tx).await;
        // token_tx was moved into the call and is gone now, so the forwarder
        // drains and exits.
        let _ = forwarder.await;
        result.context("Narrative generation failed")?;
        Ok(())
    }
}

const NARRATIVE_SYSTEM_PROMPT: &str = "You are a product analyst narrating app review analysis \
results. Write a concise prose summary (3-5 short paragraphs) of the key findings and the single \
most important move for each app. Plain text only.";

fn build_narrative_prompt(
    analyzed: &[AnalyzedApp],
    comparison: Option<&crate::models::ComparisonResult>,
) -> String {
    let mut prompt = String::with_capacity(8 * 1024);
    prompt.push_str("Apps analyzed:\n");
    for app in analyzed {
        prompt.push_str(&format!(
            "- {} ({} reviews analyzed, rating {}): {}\n",
            app.info.title,
            app.review_count,
            app.info
                .score
                .map(|r| format!("{:.1}", r))
                .unwrap_or_else(|| "n/a".to_string()),
            app.analysis.overview.market_position,
        ));
        for strength in app.analysis.overview.strengths.iter().take(3) {
            prompt.push_str(&format!("  + {}\n", strength));
        }
        for weakness in app.analysis.overview.weaknesses.iter().take(3) {
            prompt.push_str(&format!("  - {}\n", weakness));
        }
    }

    if let Some(comparison) = comparison {
        prompt.push_str("\nTop features by coverage:\n");
        for row in comparison.feature_comparison.iter().take(10) {
            prompt.push_str(&format!(
                "- {}: sentiment {:+.2}, present in {}\n",
                row.feature,
                row.average_sentiment,
                row.present_in_apps.join(", ")
            ));
        }

        prompt.push_str("\nShared weaknesses:\n");
        for item in &comparison.weaknesses_comparison.common {
            prompt.push_str(&format!("- {}\n", item.text));
        }

        prompt.push_str("\nAction plan already produced:\n");
        for step in &comparison.recommendation_summary {
            prompt.push_str(&format!("{}\n", step));
        }
    }

    prompt.push_str("\nWrite the narrative summary.\n");
    prompt
}
