//! Inbound HTTP surface.
//!
//! Three endpoints over the trigger and the store; everything else about the
//! product (upload, dashboards, auth) lives in other services.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use pipeline::artifact::ArtifactKind;
use pipeline::store::{SessionStore, StoreError};
use pipeline::techniques::{Technique, TechniqueLibrary};

use crate::trigger::{TriggerError, WaveTrigger};

#[derive(Clone)]
pub struct AppState {
    pub trigger: Arc<WaveTrigger>,
    pub store: Arc<dyn SessionStore>,
    pub techniques: Arc<TechniqueLibrary>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions/{id}/analyze", post(analyze))
        .route("/sessions/{id}/status", get(status))
        .route("/sessions/{id}", get(session_view))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "HTTP surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct AnalyzeBody {
    #[serde(default)]
    kinds: Vec<String>,
}

async fn analyze(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<AnalyzeBody>>,
) -> Result<Response, ApiError> {
    let kinds = parse_kinds(body.map(|Json(b)| b.kinds).unwrap_or_default())?;
    let handle = match kinds {
        None => state.trigger.on_transcription_complete(&id).await?,
        Some(kinds) => state.trigger.retry(&id, Some(kinds)).await?,
    };
    Ok((StatusCode::ACCEPTED, Json(handle)).into_response())
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state.trigger.status(&id).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
    patient_id: String,
    therapist_id: String,
    session_ts: chrono::DateTime<chrono::Utc>,
    duration_secs: f64,
    status: pipeline::AnalysisStatus,
    cost_usd: f64,
    transcript: pipeline::Transcript,
    artifacts: HashMap<String, pipeline::ArtifactRecord>,
    technique_definition: Option<Technique>,
}

async fn session_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let view = state.store.load(&id).await.map_err(TriggerError::Store)?;

    // Resolve the technique tagged by the topic extractor, when known.
    let technique_definition = view
        .artifact(ArtifactKind::Topics)
        .and_then(|record| record.typed().ok())
        .and_then(|payload| match payload {
            pipeline::ArtifactPayload::Topics(t) => Some(t.technique_id),
            _ => None,
        })
        .and_then(|id| state.techniques.lookup(&id));

    let artifacts = view
        .artifacts
        .iter()
        .map(|(kind, record)| (kind.as_str().to_string(), record.clone()))
        .collect();

    Ok(Json(SessionResponse {
        session_id: view.id,
        patient_id: view.patient_id,
        therapist_id: view.therapist_id,
        session_ts: view.session_ts,
        duration_secs: view.duration_secs,
        status: view.status,
        cost_usd: view.cost_usd,
        transcript: view.transcript,
        artifacts,
        technique_definition,
    })
    .into_response())
}

fn parse_kinds(raw: Vec<String>) -> Result<Option<Vec<ArtifactKind>>, ApiError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut kinds = Vec::with_capacity(raw.len());
    for name in raw {
        match ArtifactKind::parse(&name) {
            Some(kind) => kinds.push(kind),
            None => {
                return Err(ApiError {
                    status: StatusCode::BAD_REQUEST,
                    message: format!("unknown artifact kind: {name}"),
                })
            }
        }
    }
    Ok(Some(kinds))
}

// ── Error mapping ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<TriggerError> for ApiError {
    fn from(err: TriggerError) -> Self {
        let status = match &err {
            TriggerError::MalformedId(_) => StatusCode::BAD_REQUEST,
            TriggerError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            TriggerError::AlreadyComplete(_) => StatusCode::CONFLICT,
            TriggerError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            TriggerError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            TriggerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kinds_accepts_known_names() {
        let kinds = parse_kinds(vec!["mood".into(), "deep".into()]).unwrap().unwrap();
        assert_eq!(kinds, vec![ArtifactKind::Mood, ArtifactKind::Deep]);
    }

    #[test]
    fn parse_kinds_rejects_unknown() {
        assert!(parse_kinds(vec!["vibes".into()]).is_err());
    }

    #[test]
    fn empty_body_means_full_run() {
        assert!(parse_kinds(Vec::new()).unwrap().is_none());
    }
}
