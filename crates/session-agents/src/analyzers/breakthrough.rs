//! Breakthrough detector: at most one primary breakthrough moment plus
//! secondaries, each with cited dialogue evidence.
//!
//! The confidence guardrail is applied after validation: a primary below the
//! configured floor is reported as no breakthrough regardless of what the
//! model asserted.

use async_trait::async_trait;

use pipeline::artifact::{
    ArtifactKind, ArtifactPayload, BreakthroughMoment, BreakthroughPayload,
};

use super::{call_validated, Analyzer, AnalyzerDeps, AnalyzerError, AnalyzerOutcome};
use crate::context::SessionContext;

const SYSTEM_PROMPT: &str = "You are a breakthrough detector reviewing a therapy session \
transcript. A breakthrough is a dialogue moment where something genuinely shifts for the \
patient. Types: cognitive_insight, emotional_shift, behavioral_commitment, \
relational_realization, self_compassion.\n\
\n\
Identify at most ONE primary breakthrough and any secondary ones. Every reported \
breakthrough MUST cite evidence: the start/end timestamps in seconds and the exact \
dialogue excerpt. If nothing qualifies, say so.\n\
\n\
Respond with a JSON object:\n\
{\"has_breakthrough\": bool,\n \
\"primary\": {\"type\": string, \"description\": string, \"evidence\": string,\n  \
\"confidence\": number 0-1, \"timestamp_start\": number, \"timestamp_end\": number,\n  \
\"dialogue_excerpt\": string} | null,\n \
\"all_breakthroughs\": [same shape as primary]}";

pub struct BreakthroughAnalyzer {
    deps: AnalyzerDeps,
    confidence_floor: f64,
}

impl BreakthroughAnalyzer {
    pub fn new(deps: AnalyzerDeps, confidence_floor: f64) -> Self {
        Self {
            deps,
            confidence_floor,
        }
    }
}

fn validate_moment(value: &serde_json::Value) -> Result<BreakthroughMoment, String> {
    let moment: BreakthroughMoment = serde_json::from_value(value.clone())
        .map_err(|e| format!("invalid breakthrough entry: {e}"))?;
    if moment.dialogue_excerpt.trim().is_empty() || moment.evidence.trim().is_empty() {
        return Err("breakthrough entry missing dialogue evidence".to_string());
    }
    if moment.timestamp_start < 0.0 || moment.timestamp_end < moment.timestamp_start {
        return Err("breakthrough entry has inconsistent timestamps".to_string());
    }
    Ok(moment)
}

#[async_trait]
impl Analyzer for BreakthroughAnalyzer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Breakthrough
    }

    async fn analyze(&self, ctx: &SessionContext) -> Result<AnalyzerOutcome, AnalyzerError> {
        let resolved = self.deps.resolve(ArtifactKind::Breakthrough)?;
        let user = format!("Session transcript:\n\n{}", ctx.dialogue);

        let (mut payload, usage) = call_validated(
            &self.deps,
            &resolved,
            SYSTEM_PROMPT,
            &user,
            0.3,
            900,
            |value| {
                let has = value
                    .get("has_breakthrough")
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| "missing bool field `has_breakthrough`".to_string())?;

                let primary = match value.get("primary") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(raw) => Some(validate_moment(raw)?),
                };
                if has && primary.is_none() {
                    return Err("has_breakthrough=true but no primary provided".to_string());
                }

                let all = match value.get("all_breakthroughs") {
                    None | Some(serde_json::Value::Null) => Vec::new(),
                    Some(serde_json::Value::Array(items)) => items
                        .iter()
                        .map(validate_moment)
                        .collect::<Result<Vec<_>, _>>()?,
                    Some(_) => return Err("`all_breakthroughs` is not an array".to_string()),
                };

                Ok(BreakthroughPayload {
                    has_breakthrough: has,
                    primary,
                    all_breakthroughs: all,
                })
            },
        )
        .await?;

        // Guardrail: low-confidence detections are not surfaced.
        if let Some(primary) = &payload.primary {
            if primary.confidence < self.confidence_floor {
                tracing::info!(
                    session_id = %ctx.session_id,
                    confidence = primary.confidence,
                    floor = self.confidence_floor,
                    "breakthrough below confidence floor, reporting none"
                );
                payload = BreakthroughPayload::none();
            }
        }

        let confidence = payload
            .primary
            .as_ref()
            .map(|p| p.confidence)
            .unwrap_or(1.0);

        Ok(AnalyzerOutcome {
            payload: ArtifactPayload::Breakthrough(payload),
            confidence,
            model_id: resolved.model_id,
            usage,
        })
    }
}
