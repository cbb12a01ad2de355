//! Analysis orchestrator: runs the two-wave schedule for one session.
//!
//! Wave 1 fans out the independent analyzers (mood, topics, breakthrough) as
//! concurrently awaited tasks and drains them all-settled — never fail-fast.
//! Action summary follows sequentially once topics has succeeded. Wave 2
//! (deep analysis) runs only behind the wave-1 gate. Every result is
//! persisted through the store gateway, which owns the status graph; this
//! module proposes transitions, the gateway accepts or rejects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pipeline::artifact::{ArtifactKind, ArtifactRecord};
use pipeline::logger::{AnalysisEvent, DualLogger, EventKind};
use pipeline::retry::RetryPolicy;
use pipeline::router::ModelRouter;
use pipeline::status::AnalysisStatus;
use pipeline::store::{LogEntry, LogStatus, SessionStore, SessionView, StoreError};
use pipeline::techniques::TechniqueLibrary;

use crate::analyzers::{
    ActionSummaryAnalyzer, Analyzer, AnalyzerDeps, AnalyzerError, BreakthroughAnalyzer,
    DeepAnalyzer, MoodAnalyzer, TopicsAnalyzer,
};
use crate::config::AnalysisConfig;
use crate::context::SessionContext;
use crate::llm::ChatTransport;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How one kind ended up after this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindOutcome {
    /// Artifact persisted (this run or a previous one).
    Succeeded,
    /// Retries exhausted; last error attached.
    Exhausted(String),
    /// Not attempted: the attempt budget was already spent before this run.
    AlreadyExhausted,
    /// Not attempted: a dependency never materialized.
    Blocked,
    /// Run cancelled mid-flight.
    Cancelled,
}

/// Summary returned to the trigger/CLI after a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: String,
    pub final_status: AnalysisStatus,
    pub kinds: HashMap<ArtifactKind, KindOutcome>,
    /// True when the run was a no-op (terminal session or lost admission race).
    pub skipped: bool,
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    logger: DualLogger,
    router: Arc<ModelRouter>,
    transport: Arc<dyn ChatTransport>,
    techniques: Arc<TechniqueLibrary>,
    config: AnalysisConfig,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn ChatTransport>,
        techniques: Arc<TechniqueLibrary>,
        config: AnalysisConfig,
    ) -> Self {
        let logger = DualLogger::new(store.clone());
        let router = Arc::new(ModelRouter::new(config.router.clone()));
        Self {
            store,
            logger,
            router,
            transport,
            techniques,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels every in-flight attempt of every run on this
    /// orchestrator. Committed artifacts remain.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn build_analyzer(&self, kind: ArtifactKind) -> Arc<dyn Analyzer> {
        let deps = AnalyzerDeps::new(self.transport.clone(), self.router.clone())
            .with_overrides(self.config.model_overrides.clone());
        match kind {
            ArtifactKind::Mood => Arc::new(MoodAnalyzer::new(deps)),
            ArtifactKind::Topics => Arc::new(TopicsAnalyzer::new(deps, self.techniques.clone())),
            ArtifactKind::ActionSummary => Arc::new(ActionSummaryAnalyzer::new(deps)),
            ArtifactKind::Breakthrough => Arc::new(BreakthroughAnalyzer::new(
                deps,
                self.config.breakthrough_confidence_floor,
            )),
            ArtifactKind::Deep => Arc::new(DeepAnalyzer::new(deps)),
        }
    }

    /// Run the full schedule for a session. Idempotent: terminal sessions
    /// and lost admission races return a skipped report.
    pub async fn run(&self, session_id: &str) -> Result<RunReport, OrchestratorError> {
        self.run_inner(session_id, &HashSet::new()).await
    }

    /// Retry entry: grants the named kinds (all kinds when `None`) a fresh
    /// attempt budget. The caller (wave trigger) has already cleared any
    /// artifacts it wants recomputed.
    pub async fn rerun(
        &self,
        session_id: &str,
        kinds: Option<&[ArtifactKind]>,
    ) -> Result<RunReport, OrchestratorError> {
        let fresh: HashSet<ArtifactKind> = match kinds {
            Some(kinds) => kinds.iter().copied().collect(),
            None => ArtifactKind::ALL.into_iter().collect(),
        };
        self.run_inner(session_id, &fresh).await
    }

    async fn run_inner(
        &self,
        session_id: &str,
        fresh: &HashSet<ArtifactKind>,
    ) -> Result<RunReport, OrchestratorError> {
        let view = self.store.load(session_id).await?;
        let mut kinds: HashMap<ArtifactKind, KindOutcome> = HashMap::new();

        // Admission control against the status machine.
        match view.status {
            AnalysisStatus::Transcribed => {
                match self
                    .store
                    .set_status(
                        session_id,
                        AnalysisStatus::Wave1Running,
                        AnalysisStatus::Transcribed,
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(StoreError::StaleStatus { actual, .. }) => {
                        info!(session_id, %actual, "lost admission race, skipping run");
                        return Ok(skipped_report(session_id, actual));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            AnalysisStatus::Failed => {
                let retryable = self.retryable_kinds(&view, fresh).await?;
                if retryable.is_empty() {
                    info!(session_id, "failed session has no retryable kinds, skipping");
                    return Ok(skipped_report(session_id, view.status));
                }
                if let Err(e) = self
                    .store
                    .set_status(
                        session_id,
                        AnalysisStatus::Wave1Running,
                        AnalysisStatus::Failed,
                    )
                    .await
                {
                    if matches!(e, StoreError::StaleStatus { .. }) {
                        return Ok(skipped_report(session_id, view.status));
                    }
                    return Err(e.into());
                }
            }
            AnalysisStatus::Wave1Running => {
                // Plain triggers assume another worker owns the wave; only an
                // explicit retry resumes a wave left behind by a dead worker.
                if fresh.is_empty() {
                    info!(session_id, "wave 1 already running elsewhere, skipping");
                    return Ok(skipped_report(session_id, view.status));
                }
            }
            AnalysisStatus::Wave1Complete
            | AnalysisStatus::Wave2Running
            | AnalysisStatus::Complete => {
                return Ok(skipped_report(session_id, view.status));
            }
        }

        self.logger
            .emit(AnalysisEvent::new(
                session_id,
                "orchestrator",
                EventKind::Start,
                "wave1",
                0,
            ))
            .await;

        let ctx = Arc::new(SessionContext::from_view(
            &view,
            self.config.transcript_char_budget,
        ));
        self.logger
            .emit(AnalysisEvent::new(
                session_id,
                "orchestrator",
                EventKind::ContextBuilt,
                "wave1",
                0,
            ))
            .await;

        // ── Wave 1: all-settled fan-out ───────────────────────────────────
        let mut join_set: JoinSet<(ArtifactKind, KindOutcome)> = JoinSet::new();
        for kind in ArtifactKind::WAVE1_PARALLEL {
            if view.has_artifact(kind) {
                kinds.insert(kind, KindOutcome::Succeeded);
                continue;
            }
            let fresh_budget = fresh.contains(&kind);
            let prior_failed = self.store.failed_attempts(session_id, kind).await?;
            if !fresh_budget && !self.config.retry.allows_another(prior_failed) {
                kinds.insert(kind, KindOutcome::AlreadyExhausted);
                continue;
            }

            let runner = AttemptRunner {
                store: self.store.clone(),
                logger: self.logger.clone(),
                policy: self.config.retry,
                attempt_timeout: self.config.attempt_timeout,
                cancel: self.cancel.clone(),
            };
            let analyzer = self.build_analyzer(kind);
            let ctx = ctx.clone();
            let session_id = session_id.to_string();
            join_set.spawn(async move {
                let outcome = runner
                    .run_to_terminal(&session_id, analyzer, &ctx, prior_failed, fresh_budget)
                    .await;
                (kind, outcome)
            });
        }

        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((kind, outcome)) => {
                    kinds.insert(kind, outcome);
                }
                Err(e) => {
                    warn!(session_id, error = %e, "wave-1 analyzer task panicked");
                }
            }
        }

        if kinds.values().any(|o| *o == KindOutcome::Cancelled) {
            info!(session_id, "run cancelled during wave 1");
            return Ok(RunReport {
                session_id: session_id.to_string(),
                final_status: AnalysisStatus::Wave1Running,
                kinds,
                skipped: false,
            });
        }

        // ── Wave 1b: action summary, strictly after topics ────────────────
        let view = self.store.load(session_id).await?;
        let topics_ok = view.has_artifact(ArtifactKind::Topics);
        let summary_outcome = if view.has_artifact(ArtifactKind::ActionSummary) {
            KindOutcome::Succeeded
        } else if !topics_ok {
            KindOutcome::Blocked
        } else {
            let fresh_budget = fresh.contains(&ArtifactKind::ActionSummary);
            let prior_failed = self
                .store
                .failed_attempts(session_id, ArtifactKind::ActionSummary)
                .await?;
            if !fresh_budget && !self.config.retry.allows_another(prior_failed) {
                KindOutcome::AlreadyExhausted
            } else {
                let ctx = SessionContext::from_view(&view, self.config.transcript_char_budget);
                let runner = AttemptRunner {
                    store: self.store.clone(),
                    logger: self.logger.clone(),
                    policy: self.config.retry,
                    attempt_timeout: self.config.attempt_timeout,
                    cancel: self.cancel.clone(),
                };
                runner
                    .run_to_terminal(
                        session_id,
                        self.build_analyzer(ArtifactKind::ActionSummary),
                        &ctx,
                        prior_failed,
                        fresh_budget,
                    )
                    .await
            }
        };
        kinds.insert(ArtifactKind::ActionSummary, summary_outcome);

        if kinds.values().any(|o| *o == KindOutcome::Cancelled) {
            return Ok(RunReport {
                session_id: session_id.to_string(),
                final_status: AnalysisStatus::Wave1Running,
                kinds,
                skipped: false,
            });
        }

        // ── Wave-1 gate ───────────────────────────────────────────────────
        let view = self.store.load(session_id).await?;
        let mood_ok = view.has_artifact(ArtifactKind::Mood);
        let breakthrough_ok = view.has_artifact(ArtifactKind::Breakthrough);
        let topics_ok = view.has_artifact(ArtifactKind::Topics);
        let summary_ok = view.has_artifact(ArtifactKind::ActionSummary);

        // Deep analysis needs topics for its prompt and either mood or
        // breakthrough for a useful context set. Action summary is required
        // for the session to ever reach `complete`, so losing it is fatal
        // too.
        let wave1_usable = topics_ok && (mood_ok || breakthrough_ok) && summary_ok;

        if !wave1_usable {
            self.store
                .set_status(session_id, AnalysisStatus::Failed, AnalysisStatus::Wave1Running)
                .await?;
            self.logger
                .emit(
                    AnalysisEvent::new(
                        session_id,
                        "orchestrator",
                        EventKind::Failed,
                        "wave1",
                        0,
                    )
                    .with_payload(serde_json::json!({
                        "topics_ok": topics_ok,
                        "mood_ok": mood_ok,
                        "breakthrough_ok": breakthrough_ok,
                        "action_summary_ok": summary_ok,
                    })),
                )
                .await;
            kinds.insert(ArtifactKind::Deep, KindOutcome::Blocked);
            return Ok(RunReport {
                session_id: session_id.to_string(),
                final_status: AnalysisStatus::Failed,
                kinds,
                skipped: false,
            });
        }

        self.store
            .set_status(
                session_id,
                AnalysisStatus::Wave1Complete,
                AnalysisStatus::Wave1Running,
            )
            .await?;

        // ── Wave 2: deep analysis ─────────────────────────────────────────
        self.store
            .set_status(
                session_id,
                AnalysisStatus::Wave2Running,
                AnalysisStatus::Wave1Complete,
            )
            .await?;

        let deep_outcome = if view.has_artifact(ArtifactKind::Deep) {
            KindOutcome::Succeeded
        } else {
            let fresh_budget = fresh.contains(&ArtifactKind::Deep);
            let prior_failed = self
                .store
                .failed_attempts(session_id, ArtifactKind::Deep)
                .await?;
            if !fresh_budget && !self.config.retry.allows_another(prior_failed) {
                KindOutcome::AlreadyExhausted
            } else {
                let ctx = SessionContext::from_view(&view, self.config.transcript_char_budget);
                let runner = AttemptRunner {
                    store: self.store.clone(),
                    logger: self.logger.clone(),
                    policy: self.config.retry,
                    attempt_timeout: self.config.attempt_timeout,
                    cancel: self.cancel.clone(),
                };
                runner
                    .run_to_terminal(
                        session_id,
                        self.build_analyzer(ArtifactKind::Deep),
                        &ctx,
                        prior_failed,
                        fresh_budget,
                    )
                    .await
            }
        };

        let deep_ok = deep_outcome == KindOutcome::Succeeded;
        kinds.insert(ArtifactKind::Deep, deep_outcome);

        if kinds.values().any(|o| *o == KindOutcome::Cancelled) {
            return Ok(RunReport {
                session_id: session_id.to_string(),
                final_status: AnalysisStatus::Wave2Running,
                kinds,
                skipped: false,
            });
        }

        // `complete` means every kind has an artifact; a session that got
        // here with an exhausted optional kind (mood or breakthrough) still
        // lands on `failed`, with the deep artifact available for display.
        let view = self.store.load(session_id).await?;
        let all_present = ArtifactKind::ALL.iter().all(|k| view.has_artifact(*k));
        let final_status = if deep_ok && all_present {
            AnalysisStatus::Complete
        } else {
            AnalysisStatus::Failed
        };
        self.store
            .set_status(session_id, final_status, AnalysisStatus::Wave2Running)
            .await?;

        self.logger
            .emit(
                AnalysisEvent::new(
                    session_id,
                    "orchestrator",
                    if final_status == AnalysisStatus::Complete {
                        EventKind::Complete
                    } else {
                        EventKind::Failed
                    },
                    "wave2",
                    0,
                )
                .with_payload(serde_json::json!({ "cost_usd": view.cost_usd })),
            )
            .await;

        Ok(RunReport {
            session_id: session_id.to_string(),
            final_status,
            kinds,
            skipped: false,
        })
    }

    /// Kinds a failed session could still make progress on.
    async fn retryable_kinds(
        &self,
        view: &SessionView,
        fresh: &HashSet<ArtifactKind>,
    ) -> Result<Vec<ArtifactKind>, StoreError> {
        let mut retryable = Vec::new();
        for kind in ArtifactKind::ALL {
            if view.has_artifact(kind) {
                continue;
            }
            if fresh.contains(&kind) {
                retryable.push(kind);
                continue;
            }
            let failed = self.store.failed_attempts(&view.id, kind).await?;
            if self.config.retry.allows_another(failed) {
                retryable.push(kind);
            }
        }
        Ok(retryable)
    }
}

fn skipped_report(session_id: &str, status: AnalysisStatus) -> RunReport {
    RunReport {
        session_id: session_id.to_string(),
        final_status: status,
        kinds: HashMap::new(),
        skipped: true,
    }
}

// ── Per-kind attempt loop ─────────────────────────────────────────────────

/// Drives one analyzer to a terminal outcome: success (persisted), exhausted,
/// or cancelled. Owns all per-attempt logging and backoff.
struct AttemptRunner {
    store: Arc<dyn SessionStore>,
    logger: DualLogger,
    policy: RetryPolicy,
    attempt_timeout: std::time::Duration,
    cancel: CancellationToken,
}

impl AttemptRunner {
    async fn run_to_terminal(
        &self,
        session_id: &str,
        analyzer: Arc<dyn Analyzer>,
        ctx: &SessionContext,
        prior_failed: u32,
        fresh_budget: bool,
    ) -> KindOutcome {
        let kind = analyzer.kind();
        let component = format!("analyzer:{kind}");
        let budget = if fresh_budget {
            self.policy.max_attempts
        } else {
            self.policy.max_attempts.saturating_sub(prior_failed)
        };

        let mut last_error = String::new();
        let mut retry_after_hint: Option<std::time::Duration> = None;
        for attempt_idx in 0..budget {
            // 0-based position recorded in log rows; continues prior counts
            // when resuming, restarts on an explicit retry cycle.
            let retry_count = if fresh_budget {
                attempt_idx
            } else {
                prior_failed + attempt_idx
            };

            if attempt_idx > 0 {
                let delay = self
                    .policy
                    .delay_before(retry_count + 1, retry_after_hint.take());
                tokio::time::sleep(delay).await;
            }

            let started_at = Utc::now();
            let started = Instant::now();

            if let Err(e) = self
                .store
                .record_log(&LogEntry {
                    session_id: session_id.to_string(),
                    wave_kind: kind.as_str().to_string(),
                    status: LogStatus::Started,
                    started_at,
                    ended_at: None,
                    error: None,
                    retry_count,
                    duration_ms: 0,
                })
                .await
            {
                warn!(session_id, %kind, error = %e, "could not record attempt start");
            }

            self.logger
                .emit(AnalysisEvent::new(
                    session_id,
                    component.clone(),
                    EventKind::CallBegin,
                    kind.wave(),
                    retry_count + 1,
                ))
                .await;

            let attempt_timeout = analyzer.attempt_timeout().unwrap_or(self.attempt_timeout);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(AnalyzerError::Cancelled),
                res = tokio::time::timeout(attempt_timeout, analyzer.analyze(ctx)) => {
                    match res {
                        Ok(inner) => inner,
                        Err(_) => Err(AnalyzerError::AttemptTimeout(attempt_timeout)),
                    }
                }
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(outcome) => {
                    let record = ArtifactRecord {
                        kind,
                        payload: match outcome.payload.to_column_json() {
                            Ok(v) => v,
                            Err(e) => {
                                warn!(session_id, %kind, error = %e, "payload serialization failed");
                                return KindOutcome::Exhausted(e.to_string());
                            }
                        },
                        confidence: outcome.confidence,
                        model_id: outcome.model_id.clone(),
                        prompt_tokens: outcome.usage.prompt_tokens,
                        completion_tokens: outcome.usage.completion_tokens,
                        cost_usd: outcome.usage.cost_usd,
                        produced_at: Utc::now(),
                    };
                    let log = LogEntry {
                        session_id: session_id.to_string(),
                        wave_kind: kind.as_str().to_string(),
                        status: LogStatus::Completed,
                        started_at,
                        ended_at: Some(Utc::now()),
                        error: None,
                        retry_count,
                        duration_ms,
                    };

                    self.logger
                        .emit(
                            AnalysisEvent::new(
                                session_id,
                                component.clone(),
                                EventKind::CallEnd,
                                kind.wave(),
                                retry_count + 1,
                            )
                            .with_payload(serde_json::json!({
                                "model_id": outcome.model_id,
                                "prompt_tokens": outcome.usage.prompt_tokens,
                                "completion_tokens": outcome.usage.completion_tokens,
                                "cost_usd": outcome.usage.cost_usd,
                            })),
                        )
                        .await;

                    if let Err(e) = self.store.write_artifact(session_id, &record, &log).await {
                        // A competing worker may have finished the session;
                        // reload and reconcile rather than fail the kind.
                        warn!(session_id, %kind, error = %e, "artifact write rejected");
                        return match self.store.load(session_id).await {
                            Ok(view) if view.has_artifact(kind) => KindOutcome::Succeeded,
                            _ => KindOutcome::Exhausted(e.to_string()),
                        };
                    }

                    self.logger
                        .emit(AnalysisEvent::new(
                            session_id,
                            component.clone(),
                            EventKind::VersionSave,
                            kind.wave(),
                            retry_count + 1,
                        ))
                        .await;

                    info!(session_id, %kind, attempt = retry_count + 1, "analyzer succeeded");
                    return KindOutcome::Succeeded;
                }
                Err(AnalyzerError::Cancelled) => {
                    info!(session_id, %kind, "attempt cancelled");
                    return KindOutcome::Cancelled;
                }
                Err(e) => {
                    // Token spend from failed calls still counts toward the
                    // session's cost ledger.
                    if let Some(usage) = e.usage() {
                        if usage.cost_usd > 0.0 {
                            if let Err(err) =
                                self.store.add_cost(session_id, usage.cost_usd).await
                            {
                                warn!(session_id, error = %err, "failed-call cost not recorded");
                            }
                        }
                    }

                    let category = e.retry_category();
                    last_error = format!("{e}");
                    retry_after_hint = e.retry_after();

                    if let Err(err) = self
                        .store
                        .record_log(&LogEntry {
                            session_id: session_id.to_string(),
                            wave_kind: kind.as_str().to_string(),
                            status: LogStatus::Failed,
                            started_at,
                            ended_at: Some(Utc::now()),
                            error: Some(format!("[{category}] {last_error}")),
                            retry_count,
                            duration_ms,
                        })
                        .await
                    {
                        warn!(session_id, %kind, error = %err, "could not record attempt failure");
                    }

                    self.logger
                        .emit(
                            AnalysisEvent::new(
                                session_id,
                                component.clone(),
                                EventKind::Failed,
                                kind.wave(),
                                retry_count + 1,
                            )
                            .with_payload(serde_json::json!({
                                "category": category.to_string(),
                                "error": last_error.clone(),
                                "cost_usd": e.usage().map(|u| u.cost_usd).unwrap_or(0.0),
                            })),
                        )
                        .await;

                    if !category.is_retriable() {
                        warn!(session_id, %kind, %category, "non-retryable failure, kind terminal");
                        return KindOutcome::Exhausted(last_error);
                    }
                }
            }
        }

        warn!(session_id, %kind, "attempt budget exhausted");
        KindOutcome::Exhausted(last_error)
    }
}
