//! Mood analyzer: holistic session mood score from patient dialogue only.

use async_trait::async_trait;

use pipeline::artifact::{snap_to_half, ArtifactKind, ArtifactPayload, MoodPayload};

use super::{
    call_validated, f64_field, str_field, string_list, Analyzer, AnalyzerDeps, AnalyzerError,
    AnalyzerOutcome,
};
use crate::context::SessionContext;

const SYSTEM_PROMPT: &str = "You are a clinical mood assessor reviewing a therapy session. \
You see ONLY the patient's utterances. Produce a single holistic mood score for the session \
on a 0.0-10.0 scale in 0.5 steps, where 0 is severe distress and 10 is excellent wellbeing.\n\
\n\
Scoring rubric, weighed together:\n\
- Prevalence and intensity of emotional language (positive and negative)\n\
- Clinical symptom markers: sleep, appetite, concentration, energy\n\
- Suicidal or self-harm ideation: any presence weighs the score down hard\n\
- Anhedonia: loss of interest or pleasure\n\
- Hopefulness and future orientation\n\
- Engagement with the session itself\n\
\n\
Respond with a JSON object:\n\
{\"score\": number, \"confidence\": number 0-1, \"rationale\": string,\n \
\"key_indicators\": [string], \"emotional_tone\": string}";

pub struct MoodAnalyzer {
    deps: AnalyzerDeps,
}

impl MoodAnalyzer {
    pub fn new(deps: AnalyzerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Analyzer for MoodAnalyzer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Mood
    }

    async fn analyze(&self, ctx: &SessionContext) -> Result<AnalyzerOutcome, AnalyzerError> {
        let resolved = self.deps.resolve(ArtifactKind::Mood)?;

        let user = format!(
            "Patient utterances from a {:.0}-minute session:\n\n{}",
            ctx.duration_secs / 60.0,
            ctx.patient_dialogue
        );

        let (payload, usage) = call_validated(
            &self.deps,
            &resolved,
            SYSTEM_PROMPT,
            &user,
            0.2,
            700,
            |value| {
                let score = snap_to_half(f64_field(value, "score")?);
                let confidence = f64_field(value, "confidence")?.clamp(0.0, 1.0);
                Ok(MoodPayload {
                    score,
                    confidence,
                    rationale: str_field(value, "rationale")?,
                    key_indicators: string_list(value, "key_indicators", false)?,
                    emotional_tone: str_field(value, "emotional_tone")?,
                })
            },
        )
        .await?;

        let confidence = payload.confidence;
        Ok(AnalyzerOutcome {
            payload: ArtifactPayload::Mood(payload),
            confidence,
            model_id: resolved.model_id,
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validator_snaps_and_clamps() {
        // Exercise the closure shape through the same helpers the analyzer uses.
        let value = serde_json::json!({
            "score": 6.3,
            "confidence": 1.4,
            "rationale": "engaged, some hopelessness",
            "key_indicators": ["hopelessness", "engagement"],
            "emotional_tone": "mixed"
        });
        let score = snap_to_half(f64_field(&value, "score").unwrap());
        let confidence = f64_field(&value, "confidence").unwrap().clamp(0.0, 1.0);
        assert_eq!(score, 6.5);
        assert_eq!(confidence, 1.0);
    }
}
