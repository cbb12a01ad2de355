//! Per-session analysis status machine.
//!
//! Statuses only advance; the single backward edge is `failed →
//! wave1_running`, taken on an explicit retry. The store gateway enforces the
//! graph on every `set_status` — the orchestrator proposes transitions, the
//! gateway accepts or rejects.
//!
//! ```text
//! transcribed → wave1_running → wave1_complete → wave2_running → complete
//!                     ▲                                │
//!                     └────────── failed ◄─────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Transcript present, no analysis started.
    Transcribed,
    /// Wave-1 analyzers in flight.
    Wave1Running,
    /// All wave-1 kinds settled with a usable context set.
    Wave1Complete,
    /// Deep analysis in flight.
    Wave2Running,
    /// All artifact kinds present — terminal.
    Complete,
    /// At least one required kind exhausted retries. Re-enterable via retry.
    Failed,
}

impl AnalysisStatus {
    /// `Complete` admits no further work at all; `Failed` only the explicit
    /// retry edge.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcribed => "transcribed",
            Self::Wave1Running => "wave1_running",
            Self::Wave1Complete => "wave1_complete",
            Self::Wave2Running => "wave2_running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcribed" => Some(Self::Transcribed),
            "wave1_running" => Some(Self::Wave1Running),
            "wave1_complete" => Some(Self::Wave1Complete),
            "wave2_running" => Some(Self::Wave2Running),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` is an edge of the status graph.
pub fn is_legal_transition(from: AnalysisStatus, to: AnalysisStatus) -> bool {
    use AnalysisStatus::*;

    // Any running state may downgrade to failed when a required kind
    // exhausts its retries.
    if to == Failed && matches!(from, Wave1Running | Wave1Complete | Wave2Running) {
        return true;
    }

    matches!(
        (from, to),
        (Transcribed, Wave1Running)
            | (Wave1Running, Wave1Complete)
            | (Wave1Complete, Wave2Running)
            | (Wave2Running, Complete)
            // Explicit retry re-enters wave 1.
            | (Failed, Wave1Running)
    )
}

/// Error for a `set_status` proposal that is not an edge of the graph.
#[derive(Debug, Clone, thiserror::Error)]
#[error("illegal status transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: AnalysisStatus,
    pub to: AnalysisStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use AnalysisStatus::*;

    const ALL: [AnalysisStatus; 6] = [
        Transcribed,
        Wave1Running,
        Wave1Complete,
        Wave2Running,
        Complete,
        Failed,
    ];

    #[test]
    fn happy_path_is_legal() {
        assert!(is_legal_transition(Transcribed, Wave1Running));
        assert!(is_legal_transition(Wave1Running, Wave1Complete));
        assert!(is_legal_transition(Wave1Complete, Wave2Running));
        assert!(is_legal_transition(Wave2Running, Complete));
    }

    #[test]
    fn failure_edges() {
        assert!(is_legal_transition(Wave1Running, Failed));
        assert!(is_legal_transition(Wave2Running, Failed));
        assert!(is_legal_transition(Failed, Wave1Running));
        assert!(!is_legal_transition(Transcribed, Failed));
    }

    #[test]
    fn terminal_states_admit_nothing_forward() {
        for to in ALL {
            assert!(!is_legal_transition(Complete, to), "complete → {to}");
        }
        for to in ALL {
            if to != Wave1Running {
                assert!(!is_legal_transition(Failed, to), "failed → {to}");
            }
        }
    }

    #[test]
    fn no_skipping_waves() {
        assert!(!is_legal_transition(Transcribed, Wave2Running));
        assert!(!is_legal_transition(Wave1Running, Wave2Running));
        assert!(!is_legal_transition(Transcribed, Complete));
        assert!(!is_legal_transition(Wave1Complete, Complete));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in ALL {
            assert_eq!(AnalysisStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AnalysisStatus::parse("queued"), None);
    }
}
