//! Dual logger: every pipeline event goes to the operator line sink
//! (`tracing`) and to the append-only event table.
//!
//! Persistence failures never abort analysis; they are themselves reported
//! as a `FAILED` event on the line sink only. Events for one session are
//! emitted in orchestrator order, so the table reads as a monotonic
//! per-session timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Start,
    ContextBuilt,
    CallBegin,
    CallEnd,
    VersionSave,
    Complete,
    Failed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::ContextBuilt => "CONTEXT_BUILT",
            Self::CallBegin => "CALL_BEGIN",
            Self::CallEnd => "CALL_END",
            Self::VersionSave => "VERSION_SAVE",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEvent {
    pub session_id: String,
    /// Emitting component, e.g. `orchestrator` or `analyzer:mood`.
    pub component: String,
    pub kind: EventKind,
    /// `wave1`, `wave1b`, or `wave2`.
    pub wave: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl AnalysisEvent {
    pub fn new(
        session_id: impl Into<String>,
        component: impl Into<String>,
        kind: EventKind,
        wave: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            component: component.into(),
            kind,
            wave: wave.into(),
            attempt,
            at: Utc::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Mirrors events to `tracing` and the store's event table.
#[derive(Clone)]
pub struct DualLogger {
    store: Arc<dyn SessionStore>,
}

impl DualLogger {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Emit one event to both sinks. Infallible from the caller's point of
    /// view: a persistent-sink failure is reported on the line sink and
    /// swallowed.
    pub async fn emit(&self, event: AnalysisEvent) {
        tracing::info!(
            session_id = %event.session_id,
            component = %event.component,
            event = %event.kind,
            wave = %event.wave,
            attempt = event.attempt,
            payload = event
                .payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            "pipeline event"
        );

        if let Err(e) = self.store.record_event(&event).await {
            tracing::error!(
                session_id = %event.session_id,
                component = %event.component,
                event = "FAILED",
                error = %e,
                "event persistence failed"
            );
        }
    }
}
