//! Analyzer units: one per artifact kind.
//!
//! Each unit owns its prompt assembly and output validation and exposes the
//! common `analyze(ctx) → Result<AnalyzerOutcome, AnalyzerError>` contract.
//! Schema problems get exactly one strict "JSON only" re-prompt inside the
//! unit; whatever surfaces to the orchestrator is already classified for the
//! retry decision.

pub mod action_summary;
pub mod breakthrough;
pub mod deep;
pub mod mood;
pub mod topics;

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use pipeline::artifact::{ArtifactKind, ArtifactPayload};
use pipeline::retry::RetryCategory;
use pipeline::router::{ModelRouter, ResolvedModel, RouterError};

use crate::context::SessionContext;
use crate::llm::{ChatMessage, ChatRequest, ChatTransport, LlmError};

pub use action_summary::ActionSummaryAnalyzer;
pub use breakthrough::BreakthroughAnalyzer;
pub use deep::DeepAnalyzer;
pub use mood::MoodAnalyzer;
pub use topics::TopicsAnalyzer;

/// Token usage and priced cost across every call an attempt made (the strict
/// re-prompt makes that up to two).
#[derive(Debug, Clone, Copy, Default)]
pub struct CallUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub calls: u32,
}

impl CallUsage {
    fn absorb(&mut self, other: CallUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
        self.calls += other.calls;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// Output failed validation even after the strict re-prompt. Terminal
    /// for the kind; the usage is still owed to the session's cost ledger.
    #[error("model output failed validation: {message}")]
    Schema { message: String, usage: CallUsage },

    #[error(transparent)]
    Router(#[from] RouterError),

    /// A declared dependency artifact is absent — the state machine should
    /// have prevented the call.
    #[error("missing dependency artifact: {0}")]
    MissingDependency(ArtifactKind),

    #[error("attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    #[error("run cancelled")]
    Cancelled,
}

impl AnalyzerError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Llm(e) => e.retry_category(),
            Self::Schema { .. } => RetryCategory::SchemaFailure,
            Self::Router(_) | Self::MissingDependency(_) => RetryCategory::Configuration,
            Self::AttemptTimeout(_) => RetryCategory::Transient,
            Self::Cancelled => RetryCategory::Cancelled,
        }
    }

    /// Tokens consumed by a failed attempt, when any call completed.
    pub fn usage(&self) -> Option<CallUsage> {
        match self {
            Self::Schema { usage, .. } => Some(*usage),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Llm(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// A validated analyzer result ready for persistence.
#[derive(Debug, Clone)]
pub struct AnalyzerOutcome {
    pub payload: ArtifactPayload,
    pub confidence: f64,
    pub model_id: String,
    pub usage: CallUsage,
}

/// The common analyzer contract. Implementations hold no cross-session
/// state; everything per-run arrives through the context.
#[async_trait]
pub trait Analyzer: Send + Sync {
    fn kind(&self) -> ArtifactKind;

    /// Prior-wave kinds this analyzer reads. The orchestrator sequences
    /// accordingly; `analyze` still re-checks and fails typed.
    fn dependencies(&self) -> &'static [ArtifactKind] {
        &[]
    }

    /// Per-attempt wall clock override; `None` uses the worker default.
    fn attempt_timeout(&self) -> Option<Duration> {
        None
    }

    async fn analyze(&self, ctx: &SessionContext) -> Result<AnalyzerOutcome, AnalyzerError>;
}

// ── Shared call/parse plumbing ────────────────────────────────────────────

/// Handle bundle every unit is built from.
#[derive(Clone)]
pub struct AnalyzerDeps {
    pub transport: Arc<dyn ChatTransport>,
    pub router: Arc<ModelRouter>,
    /// Per-task model id overrides; an entry bypasses the router's tier
    /// tables for that task while keeping the tier's pricing.
    pub overrides: HashMap<ArtifactKind, String>,
}

impl AnalyzerDeps {
    pub fn new(transport: Arc<dyn ChatTransport>, router: Arc<ModelRouter>) -> Self {
        Self {
            transport,
            router,
            overrides: HashMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: HashMap<ArtifactKind, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Route one task, applying any configured model override.
    pub fn resolve(&self, kind: ArtifactKind) -> Result<ResolvedModel, RouterError> {
        self.router
            .resolve(kind.as_str(), self.overrides.get(&kind).map(String::as_str))
    }
}

const STRICT_REPROMPT: &str = "Your previous reply was not valid for the requested schema. \
Respond with ONLY a single valid JSON object matching the schema exactly. \
No prose, no markdown fences, no commentary.";

/// Call the model and validate its JSON output, with one strict re-prompt on
/// any schema problem. Returns the validated value plus accumulated usage.
pub(crate) async fn call_validated<T>(
    deps: &AnalyzerDeps,
    resolved: &ResolvedModel,
    system: &str,
    user: &str,
    temperature: f32,
    max_tokens: u32,
    validate: impl Fn(&serde_json::Value) -> Result<T, String>,
) -> Result<(T, CallUsage), AnalyzerError> {
    let mut usage = CallUsage::default();
    let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];

    for strict in [false, true] {
        if strict {
            messages.push(ChatMessage::user(STRICT_REPROMPT.to_string()));
        }
        let request = ChatRequest {
            model: resolved.model_id.clone(),
            messages: messages.clone(),
            temperature,
            max_tokens,
        };
        let completion = deps.transport.complete(&request).await?;
        // Price from the resolved tier, not the echoed model id: endpoints
        // report dated variants (`gpt-4o-2024-08-06`) the tier table has
        // never heard of.
        usage.absorb(CallUsage {
            prompt_tokens: completion.prompt_tokens,
            completion_tokens: completion.completion_tokens,
            cost_usd: resolved
                .pricing
                .cost(completion.prompt_tokens, completion.completion_tokens),
            calls: 1,
        });

        match extract_json(&completion.content).and_then(|v| validate(&v)) {
            Ok(value) => return Ok((value, usage)),
            Err(message) if strict => {
                return Err(AnalyzerError::Schema { message, usage });
            }
            Err(message) => {
                tracing::debug!(error = %message, "schema miss, issuing strict re-prompt");
                messages.push(ChatMessage {
                    role: "assistant".to_string(),
                    content: completion.content,
                });
            }
        }
    }
    unreachable!("strict pass either returns or errors");
}

/// Pull a JSON object out of a model reply, tolerating markdown fences and
/// leading prose.
pub(crate) fn extract_json(raw: &str) -> Result<serde_json::Value, String> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    // ```json ... ``` fences first, then the outermost brace span.
    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex");
    if let Some(caps) = fence.captures(trimmed) {
        if let Ok(value) = serde_json::from_str(&caps[1]) {
            return Ok(value);
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Ok(value);
            }
        }
    }

    Err(format!(
        "no JSON object found in reply ({} chars)",
        raw.len()
    ))
}

/// Read a required string field.
pub(crate) fn str_field(value: &serde_json::Value, key: &str) -> Result<String, String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| format!("missing string field `{key}`"))
}

/// Read a required numeric field.
pub(crate) fn f64_field(value: &serde_json::Value, key: &str) -> Result<f64, String> {
    value
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| format!("missing numeric field `{key}`"))
}

/// Read an array of strings, tolerating missing as empty when `required` is
/// false.
pub(crate) fn string_list(
    value: &serde_json::Value,
    key: &str,
    required: bool,
) -> Result<Vec<String>, String> {
    match value.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| format!("non-string entry in `{key}`"))
            })
            .collect(),
        Some(_) => Err(format!("field `{key}` is not an array")),
        None if required => Err(format!("missing array field `{key}`")),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_plain_json() {
        let value = extract_json(r#"{"score": 7.0}"#).unwrap();
        assert_eq!(value["score"], 7.0);
    }

    #[test]
    fn extract_fenced_json() {
        let raw = "Here you go:\n```json\n{\"score\": 5.5}\n```\nHope that helps!";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["score"], 5.5);
    }

    #[test]
    fn extract_embedded_object() {
        let raw = "The assessment is {\"score\": 3.0, \"confidence\": 0.7} overall.";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["confidence"], 0.7);
    }

    #[test]
    fn extract_rejects_prose() {
        assert!(extract_json("I could not produce a score.").is_err());
    }

    #[test]
    fn field_helpers() {
        let value = serde_json::json!({
            "name": "x", "score": 2, "tags": ["a", "b"], "bad": [1]
        });
        assert_eq!(str_field(&value, "name").unwrap(), "x");
        assert_eq!(f64_field(&value, "score").unwrap(), 2.0);
        assert_eq!(string_list(&value, "tags", true).unwrap(), vec!["a", "b"]);
        assert!(string_list(&value, "bad", true).is_err());
        assert!(string_list(&value, "absent", true).is_err());
        assert_eq!(string_list(&value, "absent", false).unwrap().len(), 0);
        assert!(str_field(&value, "absent").is_err());
    }

    #[test]
    fn usage_absorb_accumulates() {
        let mut a = CallUsage {
            prompt_tokens: 100,
            completion_tokens: 20,
            cost_usd: 0.001,
            calls: 1,
        };
        a.absorb(CallUsage {
            prompt_tokens: 50,
            completion_tokens: 10,
            cost_usd: 0.0005,
            calls: 1,
        });
        assert_eq!(a.prompt_tokens, 150);
        assert_eq!(a.calls, 2);
        assert!((a.cost_usd - 0.0015).abs() < 1e-12);
    }
}
