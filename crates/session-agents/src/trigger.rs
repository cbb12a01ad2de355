//! Wave trigger: the entry point invoked when transcription completes.
//!
//! A thin façade over the orchestrator: admission control (id validation,
//! per-patient rate limiting), a work queue drained by a single worker task,
//! and the per-kind status report the polling endpoints serve. No analysis
//! logic lives here.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use pipeline::artifact::ArtifactKind;
use pipeline::status::AnalysisStatus;
use pipeline::store::{SessionStore, StoreError};

use crate::orchestrator::Orchestrator;

const QUEUE_DEPTH: usize = 256;
const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("malformed session id: {0}")]
    MalformedId(String),

    #[error("rate limit exceeded for patient {0}")]
    RateLimited(String),

    #[error("session {0} is complete; forced reruns are not applied to completed sessions")]
    AlreadyComplete(String),

    #[error("analysis queue is full")]
    Busy,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle returned to the caller; poll `status()` for progress.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisHandle {
    pub session_id: String,
    pub status: AnalysisStatus,
}

/// Per-kind state for the status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KindState {
    Complete,
    Pending,
    Exhausted,
    Blocked,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindStatus {
    pub state: KindState,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub status: AnalysisStatus,
    pub per_kind: HashMap<String, KindStatus>,
    pub cost_usd: f64,
}

enum Job {
    Run {
        session_id: String,
    },
    Retry {
        session_id: String,
        kinds: Option<Vec<ArtifactKind>>,
    },
}

pub struct WaveTrigger {
    store: Arc<dyn SessionStore>,
    orchestrator: Arc<Orchestrator>,
    queue: mpsc::Sender<Job>,
    patient_rate_limit: u32,
    recent_triggers: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl WaveTrigger {
    /// Build the trigger and spawn its worker loop.
    pub fn new(
        store: Arc<dyn SessionStore>,
        orchestrator: Arc<Orchestrator>,
        patient_rate_limit: u32,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let trigger = Arc::new(Self {
            store,
            orchestrator: orchestrator.clone(),
            queue: tx,
            patient_rate_limit,
            recent_triggers: Mutex::new(HashMap::new()),
        });
        tokio::spawn(worker_loop(rx, orchestrator));
        trigger
    }

    /// Idempotent analysis trigger, called when a transcript lands.
    pub async fn on_transcription_complete(
        &self,
        session_id: &str,
    ) -> Result<AnalysisHandle, TriggerError> {
        let session_id = validate_id(session_id)?;
        let view = self.store.load(&session_id).await?;
        self.check_rate(&view.patient_id)?;

        self.enqueue(Job::Run {
            session_id: session_id.clone(),
        })?;
        info!(session_id, "analysis queued");
        Ok(AnalysisHandle {
            session_id,
            status: view.status,
        })
    }

    /// Re-attempt failed kinds (all of them when `kinds` is `None`).
    /// Successful artifacts are never recomputed by this path.
    pub async fn retry(
        &self,
        session_id: &str,
        kinds: Option<Vec<ArtifactKind>>,
    ) -> Result<AnalysisHandle, TriggerError> {
        let session_id = validate_id(session_id)?;
        let view = self.store.load(&session_id).await?;
        self.check_rate(&view.patient_id)?;

        self.enqueue(Job::Retry {
            session_id: session_id.clone(),
            kinds,
        })?;
        info!(session_id, "retry queued");
        Ok(AnalysisHandle {
            session_id,
            status: view.status,
        })
    }

    /// Discard the named kinds' current artifacts and recompute them.
    /// A forced topics rerun also recomputes the action summary, which is
    /// derived from its action items. Completed sessions are immutable.
    pub async fn force_rerun(
        &self,
        session_id: &str,
        kinds: &[ArtifactKind],
    ) -> Result<AnalysisHandle, TriggerError> {
        let session_id = validate_id(session_id)?;
        let view = self.store.load(&session_id).await?;
        if view.status == AnalysisStatus::Complete {
            return Err(TriggerError::AlreadyComplete(session_id));
        }
        self.check_rate(&view.patient_id)?;

        let mut rerun_kinds: Vec<ArtifactKind> = kinds.to_vec();
        if rerun_kinds.contains(&ArtifactKind::Topics)
            && !rerun_kinds.contains(&ArtifactKind::ActionSummary)
        {
            rerun_kinds.push(ArtifactKind::ActionSummary);
        }
        for kind in &rerun_kinds {
            if view.has_artifact(*kind) {
                self.store.clear_artifact(&session_id, *kind).await?;
            }
        }

        self.enqueue(Job::Retry {
            session_id: session_id.clone(),
            kinds: Some(rerun_kinds),
        })?;
        info!(session_id, "forced rerun queued");
        Ok(AnalysisHandle {
            session_id,
            status: view.status,
        })
    }

    /// Per-kind progress report. Always answers, whatever partial state the
    /// session is in.
    pub async fn status(&self, session_id: &str) -> Result<StatusReport, TriggerError> {
        let session_id = validate_id(session_id)?;
        let view = self.store.load(&session_id).await?;
        let entries = self.store.log_entries(&session_id).await?;

        let topics_done = view.has_artifact(ArtifactKind::Topics);
        let mut per_kind = HashMap::new();
        for kind in ArtifactKind::ALL {
            let failed_rows: Vec<_> = entries
                .iter()
                .filter(|e| {
                    e.wave_kind == kind.as_str()
                        && e.status == pipeline::store::LogStatus::Failed
                })
                .collect();
            let retry_count = failed_rows.len() as u32;
            let last_error = failed_rows.last().and_then(|e| e.error.clone());

            let state = if view.has_artifact(kind) {
                KindState::Complete
            } else if view.status == AnalysisStatus::Failed && retry_count > 0 {
                KindState::Exhausted
            } else if matches!(kind, ArtifactKind::Deep | ArtifactKind::ActionSummary)
                && view.status == AnalysisStatus::Failed
                && !topics_done
            {
                KindState::Blocked
            } else {
                KindState::Pending
            };

            per_kind.insert(
                kind.as_str().to_string(),
                KindStatus {
                    state,
                    retry_count,
                    last_error,
                },
            );
        }

        Ok(StatusReport {
            session_id,
            status: view.status,
            per_kind,
            cost_usd: view.cost_usd,
        })
    }

    fn enqueue(&self, job: Job) -> Result<(), TriggerError> {
        self.queue.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TriggerError::Busy,
            mpsc::error::TrySendError::Closed(_) => {
                error!("analysis worker is gone");
                TriggerError::Busy
            }
        })
    }

    /// Sliding-window rate limit per patient.
    fn check_rate(&self, patient_id: &str) -> Result<(), TriggerError> {
        let mut recent = self
            .recent_triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let window = recent.entry(patient_id.to_string()).or_default();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > RATE_WINDOW)
        {
            window.pop_front();
        }
        if window.len() as u32 >= self.patient_rate_limit {
            warn!(patient_id, "patient trigger rate limit hit");
            return Err(TriggerError::RateLimited(patient_id.to_string()));
        }
        window.push_back(now);
        Ok(())
    }
}

fn validate_id(session_id: &str) -> Result<String, TriggerError> {
    Uuid::parse_str(session_id)
        .map(|u| u.to_string())
        .map_err(|_| TriggerError::MalformedId(session_id.to_string()))
}

async fn worker_loop(mut rx: mpsc::Receiver<Job>, orchestrator: Arc<Orchestrator>) {
    while let Some(job) = rx.recv().await {
        let result = match &job {
            Job::Run { session_id } => orchestrator.run(session_id).await,
            Job::Retry { session_id, kinds } => {
                orchestrator.rerun(session_id, kinds.as_deref()).await
            }
        };
        match result {
            Ok(report) if report.skipped => {
                info!(session_id = %report.session_id, status = %report.final_status, "run skipped");
            }
            Ok(report) => {
                info!(
                    session_id = %report.session_id,
                    status = %report.final_status,
                    "run finished"
                );
            }
            Err(e) => {
                error!(error = %e, "analysis run errored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_ids() {
        assert!(validate_id("not-a-uuid").is_err());
        assert!(validate_id("../../etc/passwd").is_err());
        assert!(validate_id("3fa85f64-5717-4562-b3fc-2c963f66afa6").is_ok());
    }
}
