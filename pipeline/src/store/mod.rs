//! Session store gateway.
//!
//! The session row and its derived artifact columns are owned exclusively by
//! this module; everything else reads through [`SessionStore`] and mutates by
//! submitting typed updates. The gateway enforces the status graph and
//! guarantees that an artifact write and its `completed` log row land in one
//! transaction.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::artifact::{ArtifactKind, ArtifactRecord};
use crate::logger::AnalysisEvent;
use crate::status::{AnalysisStatus, IllegalTransition};
use crate::transcript::Transcript;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency failure: another worker moved the status first.
    #[error("stale status: expected {expected}, found {actual}")]
    StaleStatus {
        expected: AnalysisStatus,
        actual: AnalysisStatus,
    },

    /// Artifact writes against `complete`/`failed` sessions are rejected.
    #[error("session {session_id} is {status}; write rejected")]
    TerminalState {
        session_id: String,
        status: AnalysisStatus,
    },

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("session {0} already exists")]
    DuplicateSession(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Session record as created by the transcription collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub id: String,
    pub patient_id: String,
    pub therapist_id: String,
    pub session_ts: DateTime<Utc>,
    pub duration_secs: f64,
    pub transcript: Transcript,
}

/// Composed read: session row, status, cost, and all current artifacts.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub id: String,
    pub patient_id: String,
    pub therapist_id: String,
    pub session_ts: DateTime<Utc>,
    pub duration_secs: f64,
    pub transcript: Transcript,
    pub status: AnalysisStatus,
    pub cost_usd: f64,
    pub artifacts: HashMap<ArtifactKind, ArtifactRecord>,
}

impl SessionView {
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactRecord> {
        self.artifacts.get(&kind)
    }

    pub fn has_artifact(&self, kind: ArtifactKind) -> bool {
        self.artifacts.contains_key(&kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Started,
    Completed,
    Failed,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the append-only processing log. `wave_kind` carries the
/// artifact kind the attempt was for; attempt bookkeeping drives retry
/// selection after restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub wave_kind: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub duration_ms: u64,
}

/// The gateway contract. The SQLite implementation is the production path;
/// tests run it in memory.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a freshly transcribed session (status `transcribed`).
    async fn insert_session(&self, session: &NewSession) -> Result<(), StoreError>;

    /// Composed read of one session. Never locks.
    async fn load(&self, session_id: &str) -> Result<SessionView, StoreError>;

    /// Persist one artifact and its `completed` log row in a single
    /// transaction, updating the derived column, appending the history row,
    /// and adding the call's cost to the session total. Rejected when the
    /// session is in a terminal state.
    async fn write_artifact(
        &self,
        session_id: &str,
        artifact: &ArtifactRecord,
        log: &LogEntry,
    ) -> Result<(), StoreError>;

    /// Optimistic status transition; fails with [`StoreError::StaleStatus`]
    /// when `expected_prev` no longer matches, and rejects edges outside the
    /// status graph.
    async fn set_status(
        &self,
        session_id: &str,
        new_status: AnalysisStatus,
        expected_prev: AnalysisStatus,
    ) -> Result<(), StoreError>;

    /// Append a processing-log row (attempt start, attempt failure).
    async fn record_log(&self, entry: &LogEntry) -> Result<(), StoreError>;

    /// Append a fine-grained pipeline event (the dual logger's persistent
    /// sink).
    async fn record_event(&self, event: &AnalysisEvent) -> Result<(), StoreError>;

    /// Failed attempts recorded for one kind, across worker restarts.
    async fn failed_attempts(&self, session_id: &str, kind: ArtifactKind)
        -> Result<u32, StoreError>;

    /// Drop the current artifact for a kind (forced rerun). History rows are
    /// retained.
    async fn clear_artifact(&self, session_id: &str, kind: ArtifactKind) -> Result<(), StoreError>;

    /// Add a model call's cost to the session total (used for calls that
    /// never produced an artifact).
    async fn add_cost(&self, session_id: &str, cost_usd: f64) -> Result<(), StoreError>;

    /// All processing-log rows for a session, oldest first.
    async fn log_entries(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError>;
}
