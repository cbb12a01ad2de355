//! Model router: logical analysis task → concrete model id + pricing.
//!
//! Routing is table-driven. A tier table maps the three cost/quality buckets
//! to model ids, a task table maps each analysis task to its default tier,
//! and a single global shift moves every task up or down the tier ladder for
//! cost experiments. An explicit override bypasses all lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::artifact::ArtifactKind;

/// Cost/quality buckets, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Precision,
    Balanced,
    Rapid,
}

impl Tier {
    const LADDER: [Tier; 3] = [Tier::Precision, Tier::Balanced, Tier::Rapid];

    /// Move along the ladder: negative toward precision, positive toward
    /// rapid. Clamped at both ends.
    pub fn shifted(self, by: i8) -> Tier {
        let idx = Self::LADDER.iter().position(|t| *t == self).unwrap_or(1) as i32;
        let idx = (idx + by as i32).clamp(0, Self::LADDER.len() as i32 - 1);
        Self::LADDER[idx as usize]
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Precision => "precision",
            Self::Balanced => "balanced",
            Self::Rapid => "rapid",
        };
        f.write_str(s)
    }
}

/// Per-1K-token prices in USD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl ModelPricing {
    pub fn cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        prompt_tokens as f64 / 1000.0 * self.prompt_per_1k
            + completion_tokens as f64 / 1000.0 * self.completion_per_1k
    }
}

/// One tier's concrete model binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierBinding {
    pub model_id: String,
    pub pricing: ModelPricing,
}

/// Full routing configuration: tier table, task table, global shift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub tiers: HashMap<Tier, TierBinding>,
    pub tasks: HashMap<ArtifactKind, Tier>,
    /// Applied to every task's tier; negative shifts toward precision.
    pub tier_shift: i8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            Tier::Precision,
            TierBinding {
                model_id: "gpt-4o".to_string(),
                pricing: ModelPricing {
                    prompt_per_1k: 0.0025,
                    completion_per_1k: 0.01,
                },
            },
        );
        tiers.insert(
            Tier::Balanced,
            TierBinding {
                model_id: "gpt-4o-mini".to_string(),
                pricing: ModelPricing {
                    prompt_per_1k: 0.00015,
                    completion_per_1k: 0.0006,
                },
            },
        );
        tiers.insert(
            Tier::Rapid,
            TierBinding {
                model_id: "gpt-4o-mini".to_string(),
                pricing: ModelPricing {
                    prompt_per_1k: 0.00015,
                    completion_per_1k: 0.0006,
                },
            },
        );

        let mut tasks = HashMap::new();
        tasks.insert(ArtifactKind::Mood, Tier::Balanced);
        tasks.insert(ArtifactKind::Topics, Tier::Balanced);
        tasks.insert(ArtifactKind::ActionSummary, Tier::Rapid);
        tasks.insert(ArtifactKind::Breakthrough, Tier::Balanced);
        tasks.insert(ArtifactKind::Deep, Tier::Precision);

        Self {
            tiers,
            tasks,
            tier_shift: 0,
        }
    }
}

/// Routing result handed to an analyzer before its model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub model_id: String,
    pub tier: Tier,
    pub pricing: ModelPricing,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RouterError {
    /// Operator error, surfaced and never retried.
    #[error("unknown analysis task: {0}")]
    UnknownTask(String),
    #[error("no model bound for tier {0}")]
    UnboundTier(Tier),
}

/// Read-mostly router. Hot reload, when wanted, replaces the whole value
/// behind the caller's `Arc`.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    config: RouterConfig,
}

impl ModelRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Resolve a task name to a model, applying the global tier shift.
    /// `override_model` bypasses both tables; the pricing falls back to the
    /// task's tier pricing so cost accounting still works. Callers price
    /// completed calls through the returned `pricing` — endpoints echo
    /// dated model-id variants, so a by-id lookup after the fact would miss.
    pub fn resolve(
        &self,
        task_name: &str,
        override_model: Option<&str>,
    ) -> Result<ResolvedModel, RouterError> {
        let task = ArtifactKind::parse(task_name)
            .ok_or_else(|| RouterError::UnknownTask(task_name.to_string()))?;
        let tier = self
            .config
            .tasks
            .get(&task)
            .copied()
            .ok_or_else(|| RouterError::UnknownTask(task_name.to_string()))?
            .shifted(self.config.tier_shift);
        let binding = self
            .config
            .tiers
            .get(&tier)
            .ok_or(RouterError::UnboundTier(tier))?;

        Ok(ResolvedModel {
            model_id: override_model.unwrap_or(&binding.model_id).to_string(),
            tier,
            pricing: binding.pricing,
        })
    }
}
