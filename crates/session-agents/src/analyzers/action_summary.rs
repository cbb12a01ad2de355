//! Action summary: condense the two homework items into one short phrase
//! for the session card. Runs on the cheapest tier at zero temperature.

use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

use pipeline::artifact::{ActionSummaryPayload, ArtifactKind, ArtifactPayload};

use super::{
    call_validated, str_field, Analyzer, AnalyzerDeps, AnalyzerError, AnalyzerOutcome,
};
use crate::context::SessionContext;

/// Display cap, measured in user-perceived characters.
pub const MAX_SUMMARY_GRAPHEMES: usize = 45;

const SYSTEM_PROMPT: &str = "You condense therapy homework into a session-card caption. \
Given two action items, produce ONE short phrase (45 characters maximum) that combines or \
condenses them. Imperative voice, no trailing period.\n\
\n\
Respond with a JSON object: {\"text\": string}";

pub struct ActionSummaryAnalyzer {
    deps: AnalyzerDeps,
}

impl ActionSummaryAnalyzer {
    pub fn new(deps: AnalyzerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Analyzer for ActionSummaryAnalyzer {
    fn kind(&self) -> ArtifactKind {
        ArtifactKind::ActionSummary
    }

    fn dependencies(&self) -> &'static [ArtifactKind] {
        &[ArtifactKind::Topics]
    }

    async fn analyze(&self, ctx: &SessionContext) -> Result<AnalyzerOutcome, AnalyzerError> {
        let topics = ctx
            .prior
            .topics
            .as_ref()
            .ok_or(AnalyzerError::MissingDependency(ArtifactKind::Topics))?;

        let resolved = self.deps.resolve(ArtifactKind::ActionSummary)?;
        let user = format!(
            "Action items:\n1. {}\n2. {}",
            topics.action_items.first().map(String::as_str).unwrap_or(""),
            topics.action_items.get(1).map(String::as_str).unwrap_or(""),
        );

        let (payload, usage) = call_validated(
            &self.deps,
            &resolved,
            SYSTEM_PROMPT,
            &user,
            0.0,
            60,
            |value| {
                let text = str_field(value, "text")?;
                if text.trim().is_empty() {
                    return Err("`text` is empty".to_string());
                }
                Ok(ActionSummaryPayload {
                    text: truncate_graphemes(text.trim(), MAX_SUMMARY_GRAPHEMES),
                })
            },
        )
        .await?;

        Ok(AnalyzerOutcome {
            payload: ArtifactPayload::ActionSummary(payload),
            confidence: 1.0,
            model_id: resolved.model_id,
            usage,
        })
    }
}

/// Truncate on grapheme-cluster boundaries so emoji and combining marks are
/// never split.
pub fn truncate_graphemes(input: &str, max: usize) -> String {
    input.graphemes(true).take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_untouched() {
        assert_eq!(truncate_graphemes("Walk daily", 45), "Walk daily");
    }

    #[test]
    fn truncates_at_grapheme_boundary() {
        let input = "a".repeat(50);
        let out = truncate_graphemes(&input, 45);
        assert_eq!(out.graphemes(true).count(), 45);
    }

    #[test]
    fn never_splits_emoji() {
        // Family emoji is a multi-codepoint grapheme cluster.
        let input = format!("{}🧘‍♀️", "x".repeat(44));
        let out = truncate_graphemes(&input, 45);
        assert_eq!(out.graphemes(true).count(), 45);
        assert!(out.ends_with("🧘‍♀️"));

        let cut = truncate_graphemes(&input, 44);
        assert!(!cut.contains('🧘'));
    }
}
