//! Deterministic core for the therapy-session analysis pipeline.
//!
//! This crate holds everything that does NOT talk to a language model:
//! - Domain types: transcripts, artifact payloads, the per-session status machine
//! - Model router: logical task → concrete model id + pricing, with tier shifting
//! - Retry policy: error classification and backoff computation
//! - Session store: SQLite-backed gateway owning the session row and its
//!   derived columns, with transactional artifact writes
//! - Dual logger: structured events mirrored to the line sink and the log table
//! - Technique library: static catalog of therapeutic technique definitions
//!
//! The LLM-facing analyzers and the orchestration loop live in the
//! `session-agents` crate and consume this one through injected handles.

pub mod artifact;
pub mod logger;
pub mod retry;
pub mod router;
pub mod status;
pub mod store;
pub mod techniques;
pub mod transcript;

pub use artifact::{
    snap_to_half, ActionSummaryPayload, ArtifactKind, ArtifactPayload, ArtifactRecord,
    BreakthroughMoment, BreakthroughPayload, BreakthroughType, DeepAnalysisPayload, MoodPayload,
    RiskFlag, RiskSeverity, TopicsPayload,
};
pub use logger::{AnalysisEvent, DualLogger, EventKind};
pub use retry::{RetryCategory, RetryPolicy};
pub use router::{
    ModelPricing, ModelRouter, ResolvedModel, RouterConfig, RouterError, Tier, TierBinding,
};
pub use status::{is_legal_transition, AnalysisStatus, IllegalTransition};
pub use store::{
    sqlite::SqliteStore, LogEntry, LogStatus, NewSession, SessionStore, SessionView, StoreError,
};
pub use techniques::{Technique, TechniqueLibrary};
pub use transcript::{SpeakerMap, Transcript, TranscriptSegment};
