//! SQLite implementation of the session store gateway.
//!
//! One connection guarded by an async mutex: SQLite serializes writers
//! anyway, and the lock gives the same effect as row-level locking for the
//! single-session mutation paths. All multi-statement writes run inside an
//! explicit transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::schema::{artifact_column, SCHEMA};
use super::{LogEntry, LogStatus, NewSession, SessionStore, SessionView, StoreError};
use crate::artifact::{ArtifactKind, ArtifactRecord};
use crate::logger::AnalysisEvent;
use crate::status::{is_legal_transition, AnalysisStatus, IllegalTransition};
use crate::transcript::Transcript;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn status_of(conn: &Connection, session_id: &str) -> Result<AnalysisStatus, StoreError> {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        parse_status(&status)
    }
}

fn parse_status(s: &str) -> Result<AnalysisStatus, StoreError> {
    AnalysisStatus::parse(s)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status value: {s}")))
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn insert_log_row(conn: &Connection, entry: &LogEntry) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO analysis_log
            (id, session_id, wave, status, started_at, ended_at, error, retry_count, duration_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            Uuid::new_v4().to_string(),
            entry.session_id,
            entry.wave_kind,
            entry.status.as_str(),
            entry.started_at.to_rfc3339(),
            entry.ended_at.map(|t| t.to_rfc3339()),
            entry.error,
            entry.retry_count,
            entry.duration_ms as i64,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn insert_session(&self, session: &NewSession) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO sessions
                (id, patient_id, therapist_id, session_ts, duration_secs, transcript, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'transcribed')
            "#,
            params![
                session.id,
                session.patient_id,
                session.therapist_id,
                session.session_ts.to_rfc3339(),
                session.duration_secs,
                to_json(&session.transcript)?,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::DuplicateSession(session.id.clone()));
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<SessionView, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"
                SELECT id, patient_id, therapist_id, session_ts, duration_secs, transcript,
                       status, cost_usd, mood, topics, action_summary, breakthrough, deep
                FROM sessions WHERE id = ?1
                "#,
                [session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, Option<String>>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                        row.get::<_, Option<String>>(11)?,
                        row.get::<_, Option<String>>(12)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let transcript: Transcript = from_json(&row.5)?;
        let mut artifacts: HashMap<ArtifactKind, ArtifactRecord> = HashMap::new();
        let columns = [
            (ArtifactKind::Mood, &row.8),
            (ArtifactKind::Topics, &row.9),
            (ArtifactKind::ActionSummary, &row.10),
            (ArtifactKind::Breakthrough, &row.11),
            (ArtifactKind::Deep, &row.12),
        ];
        for (kind, raw) in columns {
            if let Some(raw) = raw {
                artifacts.insert(kind, from_json::<ArtifactRecord>(raw)?);
            }
        }

        Ok(SessionView {
            id: row.0,
            patient_id: row.1,
            therapist_id: row.2,
            session_ts: parse_ts(&row.3)?,
            duration_secs: row.4,
            transcript,
            status: parse_status(&row.6)?,
            cost_usd: row.7,
            artifacts,
        })
    }

    async fn write_artifact(
        &self,
        session_id: &str,
        artifact: &ArtifactRecord,
        log: &LogEntry,
    ) -> Result<(), StoreError> {
        debug_assert_eq!(log.status, LogStatus::Completed);

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let status = Self::status_of(&tx, session_id)?;
        if status.is_terminal() {
            return Err(StoreError::TerminalState {
                session_id: session_id.to_string(),
                status,
            });
        }

        let record_json = to_json(artifact)?;
        let column = artifact_column(artifact.kind);
        // Column name comes from a fixed table, not caller input.
        tx.execute(
            &format!(
                "UPDATE sessions SET {column} = ?1, cost_usd = cost_usd + ?2 WHERE id = ?3"
            ),
            params![record_json, artifact.cost_usd, session_id],
        )?;

        tx.execute(
            r#"
            INSERT INTO artifact_history (id, session_id, kind, record, produced_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                Uuid::new_v4().to_string(),
                session_id,
                artifact.kind.as_str(),
                record_json,
                artifact.produced_at.to_rfc3339(),
            ],
        )?;

        insert_log_row(&tx, log)?;
        tx.commit()?;
        Ok(())
    }

    async fn set_status(
        &self,
        session_id: &str,
        new_status: AnalysisStatus,
        expected_prev: AnalysisStatus,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let actual = Self::status_of(&tx, session_id)?;
        if actual != expected_prev {
            return Err(StoreError::StaleStatus {
                expected: expected_prev,
                actual,
            });
        }
        if !is_legal_transition(expected_prev, new_status) {
            return Err(IllegalTransition {
                from: expected_prev,
                to: new_status,
            }
            .into());
        }

        tx.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![new_status.as_str(), session_id],
        )?;
        tx.commit()?;

        tracing::debug!(session_id, from = %expected_prev, to = %new_status, "status transition");
        Ok(())
    }

    async fn record_log(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_log_row(&conn, entry)
    }

    async fn record_event(&self, event: &AnalysisEvent) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO analysis_events
                (id, session_id, component, event, wave, attempt, at, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                Uuid::new_v4().to_string(),
                event.session_id,
                event.component,
                event.kind.as_str(),
                event.wave,
                event.attempt,
                event.at.to_rfc3339(),
                event.payload.as_ref().map(|p| p.to_string()),
            ],
        )?;
        Ok(())
    }

    async fn failed_attempts(
        &self,
        session_id: &str,
        kind: ArtifactKind,
    ) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analysis_log WHERE session_id = ?1 AND wave = ?2 AND status = 'failed'",
            params![session_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    async fn clear_artifact(
        &self,
        session_id: &str,
        kind: ArtifactKind,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let column = artifact_column(kind);
        let updated = conn.execute(
            &format!("UPDATE sessions SET {column} = NULL WHERE id = ?1"),
            [session_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn add_cost(&self, session_id: &str, cost_usd: f64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE sessions SET cost_usd = cost_usd + ?1 WHERE id = ?2",
            params![cost_usd, session_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn log_entries(&self, session_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, wave, status, started_at, ended_at, error, retry_count, duration_ms
            FROM analysis_log
            WHERE session_id = ?1
            ORDER BY started_at, rowid
            "#,
        )?;

        let rows = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let status = LogStatus::parse(&row.2)
                .ok_or_else(|| StoreError::Serialization(format!("unknown log status: {}", row.2)))?;
            entries.push(LogEntry {
                session_id: row.0,
                wave_kind: row.1,
                status,
                started_at: parse_ts(&row.3)?,
                ended_at: row.4.as_deref().map(parse_ts).transpose()?,
                error: row.5,
                retry_count: row.6,
                duration_ms: row.7 as u64,
            });
        }
        Ok(entries)
    }
}
