//! Topic extractor: discussion topics, homework action items, dominant
//! technique, and a short clinician-style summary.

use async_trait::async_trait;

use pipeline::artifact::{ArtifactKind, ArtifactPayload, TopicsPayload};
use pipeline::techniques::TechniqueLibrary;
use std::sync::Arc;

use super::{
    call_validated, f64_field, str_field, string_list, Analyzer, AnalyzerDeps, AnalyzerError,
    AnalyzerOutcome,
};
use crate::context::SessionContext;

const MAX_SUMMARY_CHARS: usize = 150;

pub struct TopicsAnalyzer {
    deps: AnalyzerDeps,
    techniques: Arc<TechniqueLibrary>,
}

impl TopicsAnalyzer {
    pub fn new(deps: AnalyzerDeps, techniques: Arc<TechniqueLibrary>) -> Self {
        Self { deps, techniques }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a clinical topic extractor reviewing a therapy session transcript. \
             Identify what was actually discussed and what the patient agreed to work on.\n\
             \n\
             Rules:\n\
             - topics: 1-2 main discussion topics, short noun phrases\n\
             - action_items: EXACTLY two concrete homework actions the patient could take this week\n\
             - technique_id: the single dominant therapeutic technique, preferably one of: {}\n\
             - summary: one clinician-style sentence, at most 150 characters\n\
             - extraction_confidence: 0-1\n\
             \n\
             Respond with a JSON object:\n\
             {{\"topics\": [string], \"action_items\": [string, string], \"technique_id\": string,\n \
             \"summary\": string, \"extraction_confidence\": number}}",
            self.techniques.known_ids().join(", ")
        )
    }
}

#[async_trait]
impl Analyzer for TopicsAnalyzer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::Topics
    }

    async fn analyze(&self, ctx: &SessionContext) -> Result<AnalyzerOutcome, AnalyzerError> {
        let resolved = self.deps.resolve(ArtifactKind::Topics)?;
        let system = self.system_prompt();
        let user = format!("Session transcript:\n\n{}", ctx.dialogue);

        let (payload, usage) = call_validated(
            &self.deps,
            &resolved,
            &system,
            &user,
            0.3,
            800,
            |value| {
                let mut topics = string_list(value, "topics", true)?;
                if topics.is_empty() {
                    return Err("`topics` must contain at least one entry".to_string());
                }
                topics.truncate(2);

                let action_items = string_list(value, "action_items", true)?;
                if action_items.len() != 2 {
                    return Err(format!(
                        "`action_items` must contain exactly 2 entries, got {}",
                        action_items.len()
                    ));
                }

                let mut summary = str_field(value, "summary")?;
                if summary.chars().count() > MAX_SUMMARY_CHARS {
                    summary = summary.chars().take(MAX_SUMMARY_CHARS).collect();
                }

                Ok(TopicsPayload {
                    topics,
                    action_items,
                    technique_id: str_field(value, "technique_id")?,
                    summary,
                    extraction_confidence: f64_field(value, "extraction_confidence")?
                        .clamp(0.0, 1.0),
                })
            },
        )
        .await?;

        if self.techniques.lookup(&payload.technique_id).is_none() {
            tracing::debug!(
                session_id = %ctx.session_id,
                technique_id = %payload.technique_id,
                "technique not in library, carrying as free text"
            );
        }

        let confidence = payload.extraction_confidence;
        Ok(AnalyzerOutcome {
            payload: ArtifactPayload::Topics(payload),
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
    fn action_items_must_be_exactly_two() {
        let one = serde_json::json!({"action_items": ["only one"]});
        let items = string_list(&one, "action_items", true).unwrap();
        assert_eq!(items.len(), 1); // the analyzer's closure rejects this count
    }

    #[test]
    fn summary_truncates_on_char_boundary() {
        let long: String = "é".repeat(200);
        let truncated: String = long.chars().take(MAX_SUMMARY_CHARS).collect();
        assert_eq!(truncated.chars().count(), MAX_SUMMARY_CHARS);
    }
}
