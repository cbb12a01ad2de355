//! Per-run analysis context.
//!
//! Built once per orchestrator run from the stored session view, then shared
//! read-only by every analyzer. Holds the rendered transcript views and the
//! typed prior-wave outputs each analyzer may declare as dependencies.

use pipeline::artifact::{
    ActionSummaryPayload, ArtifactKind, BreakthroughPayload, MoodPayload, TopicsPayload,
};
use pipeline::store::SessionView;
use pipeline::transcript::SpeakerMap;

/// Typed wave-1 outputs available to later steps. Absent entries mean the
/// kind failed or has not run; consumers must say so rather than fabricate.
#[derive(Debug, Clone, Default)]
pub struct PriorOutputs {
    pub mood: Option<MoodPayload>,
    pub topics: Option<TopicsPayload>,
    pub action_summary: Option<ActionSummaryPayload>,
    pub breakthrough: Option<BreakthroughPayload>,
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub patient_id: String,
    pub speaker_map: SpeakerMap,
    /// Full dialogue, `[mm:ss] Role: text` lines, budget-bounded.
    pub dialogue: String,
    /// Patient utterances only — the mood analyzer's entire input.
    pub patient_dialogue: String,
    pub duration_secs: f64,
    pub prior: PriorOutputs,
}

impl SessionContext {
    /// Build the context from a stored view. Artifact payloads that fail to
    /// deserialize are treated as absent (and logged); a corrupt old payload
    /// must not wedge the whole session.
    pub fn from_view(view: &SessionView, char_budget: usize) -> Self {
        let speaker_map = view.transcript.infer_speaker_map(None);
        let dialogue = view.transcript.render_dialogue(&speaker_map, char_budget);
        let patient_dialogue = view
            .transcript
            .render_patient_only(&speaker_map, char_budget);

        let mut prior = PriorOutputs::default();
        for (kind, record) in &view.artifacts {
            match (*kind, record.typed()) {
                (ArtifactKind::Mood, Ok(pipeline::ArtifactPayload::Mood(p))) => {
                    prior.mood = Some(p)
                }
                (ArtifactKind::Topics, Ok(pipeline::ArtifactPayload::Topics(p))) => {
                    prior.topics = Some(p)
                }
                (
                    ArtifactKind::ActionSummary,
                    Ok(pipeline::ArtifactPayload::ActionSummary(p)),
                ) => prior.action_summary = Some(p),
                (
                    ArtifactKind::Breakthrough,
                    Ok(pipeline::ArtifactPayload::Breakthrough(p)),
                ) => prior.breakthrough = Some(p),
                (ArtifactKind::Deep, Ok(_)) => {}
                (kind, Ok(_)) => {
                    tracing::warn!(session_id = %view.id, %kind, "artifact payload under wrong kind, ignoring");
                }
                (kind, Err(e)) => {
                    tracing::warn!(session_id = %view.id, %kind, error = %e, "undecodable artifact payload, ignoring");
                }
            }
        }

        Self {
            session_id: view.id.clone(),
            patient_id: view.patient_id.clone(),
            speaker_map,
            dialogue,
            patient_dialogue,
            duration_secs: view.duration_secs,
            prior,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pipeline::artifact::ArtifactRecord;
    use pipeline::status::AnalysisStatus;
    use pipeline::transcript::{Transcript, TranscriptSegment};
    use std::collections::HashMap;

    fn view_with_artifacts(artifacts: HashMap<ArtifactKind, ArtifactRecord>) -> SessionView {
        SessionView {
            id: "s1".to_string(),
            patient_id: "p1".to_string(),
            therapist_id: "t1".to_string(),
            session_ts: Utc::now(),
            duration_secs: 600.0,
            transcript: Transcript {
                segments: vec![
                    TranscriptSegment {
                        start_sec: 0.0,
                        end_sec: 3.0,
                        speaker_label: "SPEAKER_00".to_string(),
                        text: "What would you like to focus on?".to_string(),
                    },
                    TranscriptSegment {
                        start_sec: 4.0,
                        end_sec: 9.0,
                        speaker_label: "SPEAKER_01".to_string(),
                        text: "The panic attacks at work.".to_string(),
                    },
                ],
            },
            status: AnalysisStatus::Wave1Running,
            cost_usd: 0.0,
            artifacts,
        }
    }

    #[test]
    fn builds_both_transcript_views() {
        let ctx = SessionContext::from_view(&view_with_artifacts(HashMap::new()), 8192);
        assert!(ctx.dialogue.contains("Therapist:"));
        assert!(ctx.dialogue.contains("Patient:"));
        assert!(ctx.patient_dialogue.contains("panic attacks"));
        assert!(!ctx.patient_dialogue.contains("focus on"));
        assert!(ctx.prior.topics.is_none());
    }

    #[test]
    fn typed_priors_from_artifacts() {
        let payload = pipeline::ArtifactPayload::Topics(TopicsPayload {
            topics: vec!["work anxiety".to_string()],
            action_items: vec!["Log panic triggers".to_string(), "Practice box breathing".to_string()],
            technique_id: "cbt_cognitive_restructuring".to_string(),
            summary: "Explored workplace panic".to_string(),
            extraction_confidence: 0.8,
        });
        let mut artifacts = HashMap::new();
        artifacts.insert(
            ArtifactKind::Topics,
            ArtifactRecord {
                kind: ArtifactKind::Topics,
                payload: payload.to_column_json().unwrap(),
                confidence: 0.8,
                model_id: "m".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
                cost_usd: 0.0,
                produced_at: Utc::now(),
            },
        );

        let ctx = SessionContext::from_view(&view_with_artifacts(artifacts), 8192);
        let topics = ctx.prior.topics.expect("topics prior");
        assert_eq!(topics.action_items.len(), 2);
    }

    #[test]
    fn corrupt_artifact_payload_is_ignored() {
        let mut artifacts = HashMap::new();
        artifacts.insert(
            ArtifactKind::Mood,
            ArtifactRecord {
                kind: ArtifactKind::Mood,
                payload: serde_json::json!({"not": "a mood"}),
                confidence: 0.5,
                model_id: "m".to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
                cost_usd: 0.0,
                produced_at: Utc::now(),
            },
        );
        let ctx = SessionContext::from_view(&view_with_artifacts(artifacts), 8192);
        assert!(ctx.prior.mood.is_none());
    }
}
