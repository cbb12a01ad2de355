//! Environment-driven configuration for the analysis worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use pipeline::artifact::ArtifactKind;
use pipeline::retry::RetryPolicy;
use pipeline::router::RouterConfig;

/// LLM endpoint settings (OpenAI-style chat completions API).
#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    /// Base URL up to and including `/v1`.
    pub base_url: String,
    pub api_key: String,
}

/// Top-level configuration, loaded once at startup and passed by reference.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub endpoint: LlmEndpoint,
    /// Tier table, task table, and global shift for the model router.
    pub router: RouterConfig,
    /// Per-task model id overrides (`ANALYSIS_MODEL_<TASK>`), bypassing the
    /// tier tables for that task while keeping the tier's pricing.
    pub model_overrides: HashMap<ArtifactKind, String>,
    /// Attempt budget and backoff shape, shared by every analyzer kind.
    pub retry: RetryPolicy,
    /// Per-attempt wall clock for one analyzer call.
    pub attempt_timeout: Duration,
    /// Breakthroughs below this confidence are reported as none.
    pub breakthrough_confidence_floor: f64,
    /// Character budget for rendered transcript views in prompts.
    pub transcript_char_budget: usize,
    /// Analysis triggers allowed per patient per minute.
    pub patient_rate_limit: u32,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Optional technique-catalog TOML override.
    pub techniques_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: LlmEndpoint {
                base_url: env_or("ANALYSIS_LLM_URL", "https://api.openai.com/v1"),
                api_key: env_or("ANALYSIS_LLM_API_KEY", ""),
            },
            router: RouterConfig {
                tier_shift: env_parsed("ANALYSIS_TIER_SHIFT", 0),
                ..RouterConfig::default()
            },
            model_overrides: model_overrides_from_env(),
            retry: RetryPolicy {
                max_attempts: env_parsed("ANALYSIS_MAX_ATTEMPTS", 3),
                ..RetryPolicy::default()
            },
            attempt_timeout: Duration::from_secs(env_parsed("ANALYSIS_ATTEMPT_TIMEOUT_SECS", 90)),
            breakthrough_confidence_floor: env_parsed("ANALYSIS_BREAKTHROUGH_FLOOR", 0.6),
            transcript_char_budget: env_parsed("ANALYSIS_TRANSCRIPT_BUDGET", 24_000),
            patient_rate_limit: env_parsed("ANALYSIS_PATIENT_RATE_LIMIT", 6),
            db_path: PathBuf::from(env_or("ANALYSIS_DB_PATH", "./sessions.db")),
            techniques_path: std::env::var("TECHNIQUES_PATH").ok().map(PathBuf::from),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// `ANALYSIS_MODEL_MOOD=...`, `ANALYSIS_MODEL_DEEP=...`, and so on.
fn model_overrides_from_env() -> HashMap<ArtifactKind, String> {
    let mut overrides = HashMap::new();
    for kind in ArtifactKind::ALL {
        let key = format!("ANALYSIS_MODEL_{}", kind.as_str().to_ascii_uppercase());
        if let Ok(model) = std::env::var(&key) {
            if !model.is_empty() {
                overrides.insert(kind, model);
            }
        }
    }
    overrides
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AnalysisConfig::default();
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.breakthrough_confidence_floor > 0.0);
        assert!(config.transcript_char_budget > 1_000);
    }
}
