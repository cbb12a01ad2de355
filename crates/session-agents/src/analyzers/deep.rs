//! Deep analysis (wave 2): structured clinical analysis over the full
//! transcript plus every wave-1 payload, on the highest-precision tier.

use async_trait::async_trait;

use pipeline::artifact::{ArtifactKind, ArtifactPayload, DeepAnalysisPayload};

use super::{call_validated, Analyzer, AnalyzerDeps, AnalyzerError, AnalyzerOutcome};
use crate::context::{PriorOutputs, SessionContext};

const SYSTEM_PROMPT: &str = "You are a senior clinical supervisor writing a deep analysis of \
a therapy session. You receive the transcript and the outputs of earlier automated passes \
(mood, topics, breakthroughs). Some passes may be marked missing; work only from what is \
present and never invent results for a missing pass.\n\
\n\
Respond with a JSON object:\n\
{\"progress_indicators\": [string], \"coping_skills\": [string],\n \
\"relational_patterns\": [string],\n \
\"risk_flags\": [{\"flag\": string, \"severity\": \"low\"|\"moderate\"|\"high\"|\"critical\"}],\n \
\"recommended_topics\": [string], \"unresolved_concerns\": [string],\n \
\"analysis_confidence\": number 0-1}";

pub struct DeepAnalyzer {
    deps: AnalyzerDeps,
}

impl DeepAnalyzer {
    pub fn new(deps: AnalyzerDeps) -> Self {
        Self { deps }
    }
}

/// Render wave-1 outputs verbatim, explicitly marking absent ones.
fn render_prior(prior: &PriorOutputs) -> String {
    fn section<T: serde::Serialize>(name: &str, value: &Option<T>) -> String {
        match value {
            Some(v) => format!(
                "## {name}\n{}\n",
                serde_json::to_string_pretty(v).unwrap_or_else(|_| "unserializable".to_string())
            ),
            None => format!("## {name}\nmissing\n"),
        }
    }

    format!(
        "{}{}{}{}",
        section("Mood analysis", &prior.mood),
        section("Topic extraction", &prior.topics),
        section("Action summary", &prior.action_summary),
        section("Breakthrough detection", &prior.breakthrough),
    )
}

#[async_trait]
impl Analyzer for DeepAnalyzer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Deep
    }

    fn dependencies(&self) -> &'static [ArtifactKind] {
        &ArtifactKind::WAVE1_PARALLEL
    }

    // The largest prompt and the slowest tier in the schedule.
    fn attempt_timeout(&self) -> Option<std::time::Duration> {
        Some(std::time::Duration::from_secs(180))
    }

    async fn analyze(&self, ctx: &SessionContext) -> Result<AnalyzerOutcome, AnalyzerError> {
        // Topics is the hard dependency; the prompt tolerates the rest missing.
        if ctx.prior.topics.is_none() {
            return Err(AnalyzerError::MissingDependency(ArtifactKind::Topics));
        }

        let resolved = self.deps.resolve(ArtifactKind::Deep)?;
        let user = format!(
            "# Earlier analysis passes\n{}\n# Session transcript\n\n{}",
            render_prior(&ctx.prior),
            ctx.dialogue
        );

        let (payload, usage) = call_validated(
            &self.deps,
            &resolved,
            SYSTEM_PROMPT,
            &user,
            0.3,
            1600,
            |value| {
                let mut payload: DeepAnalysisPayload = serde_json::from_value(value.clone())
                    .map_err(|e| format!("invalid deep analysis payload: {e}"))?;
                payload.analysis_confidence = payload.analysis_confidence.clamp(0.0, 1.0);
                Ok(payload)
            },
        )
        .await?;

        let confidence = payload.analysis_confidence;
        Ok(AnalyzerOutcome {
            payload: ArtifactPayload::Deep(payload),
            confidence,
            model_id: resolved.model_id,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::artifact::MoodPayload;

    #[test]
    fn absent_priors_render_as_missing() {
        let prior = PriorOutputs {
            mood: Some(MoodPayload {
                score: 5.5,
                confidence: 0.8,
                rationale: "flat affect".to_string(),
                key_indicators: vec![],
                emotional_tone: "flat".to_string(),
            }),
            ..PriorOutputs::default()
        };
        let rendered = render_prior(&prior);
        assert!(rendered.contains("\"score\": 5.5"));
        assert!(rendered.contains("## Topic extraction\nmissing"));
        assert!(rendered.contains("## Breakthrough detection\nmissing"));
    }

    #[test]
    fn payload_parses_with_defaults() {
        let value = serde_json::json!({
            "risk_flags": [{"flag": "passive ideation", "severity": "high"}],
            "analysis_confidence": 0.72
        });
        let payload: DeepAnalysisPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.risk_flags.len(), 1);
        assert!(payload.progress_indicators.is_empty());
        assert!((payload.analysis_confidence - 0.72).abs() < 1e-9);
    }
}
