//! SQLite schema for sessions, artifact history, and the append-only logs.
//!
//! Derived artifact columns live on the session row (one JSON column per
//! kind) so the dashboard read is a single-row fetch; history and logs are
//! separate append-only tables.

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    therapist_id TEXT NOT NULL,
    session_ts TEXT NOT NULL,
    duration_secs REAL NOT NULL,
    transcript TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'transcribed',
    cost_usd REAL NOT NULL DEFAULT 0.0,
    mood TEXT,
    topics TEXT,
    action_summary TEXT,
    breakthrough TEXT,
    deep TEXT
);

CREATE TABLE IF NOT EXISTS artifact_history (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    record TEXT NOT NULL,
    produced_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS analysis_log (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    wave TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    error TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE TABLE IF NOT EXISTS analysis_events (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    component TEXT NOT NULL,
    event TEXT NOT NULL,
    wave TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    at TEXT NOT NULL,
    payload TEXT,
    FOREIGN KEY (session_id) REFERENCES sessions(id)
);

CREATE INDEX IF NOT EXISTS idx_history_session ON artifact_history(session_id, kind);
CREATE INDEX IF NOT EXISTS idx_log_session ON analysis_log(session_id, wave, status);
CREATE INDEX IF NOT EXISTS idx_events_session ON analysis_events(session_id, at);
"#;

/// Column name for a kind's derived slot on the session row.
pub fn artifact_column(kind: crate::artifact::ArtifactKind) -> &'static str {
    // Matches ArtifactKind::as_str, kept explicit because these are SQL
    // identifiers, not display strings.
    match kind {
        crate::artifact::ArtifactKind::Mood => "mood",
        crate::artifact::ArtifactKind::Topics => "topics",
        crate::artifact::ArtifactKind::ActionSummary => "action_summary",
        crate::artifact::ArtifactKind::Breakthrough => "breakthrough",
        crate::artifact::ArtifactKind::Deep => "deep",
    }
}
