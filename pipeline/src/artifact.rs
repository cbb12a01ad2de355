//! Artifact kinds and validated payload types.
//!
//! Model outputs arrive as untyped JSON; each analyzer validates into one of
//! the tagged payloads below before anything is persisted. The store keeps
//! the payload as a JSON column, so `ArtifactRecord` carries both the typed
//! kind and the serialized value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// The five analyzer outputs a session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Mood,
    Topics,
    ActionSummary,
    Breakthrough,
    Deep,
}

impl ArtifactKind {
    /// All kinds, wave order: the three independent wave-1 analyzers, the
    /// sequential wave-1b step, then wave 2.
    pub const ALL: [ArtifactKind; 5] = [
        Self::Mood,
        Self::Topics,
        Self::Breakthrough,
        Self::ActionSummary,
        Self::Deep,
    ];

    /// The wave-1 kinds that run concurrently.
    pub const WAVE1_PARALLEL: [ArtifactKind; 3] = [Self::Mood, Self::Topics, Self::Breakthrough];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mood => "mood",
            Self::Topics => "topics",
            Self::ActionSummary => "action_summary",
            Self::Breakthrough => "breakthrough",
            Self::Deep => "deep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mood" => Some(Self::Mood),
            "topics" => Some(Self::Topics),
            "action_summary" => Some(Self::ActionSummary),
            "breakthrough" => Some(Self::Breakthrough),
            "deep" => Some(Self::Deep),
            _ => None,
        }
    }

    /// Which wave this kind belongs to, for log rows and status reports.
    pub fn wave(self) -> &'static str {
        match self {
            Self::Mood | Self::Topics | Self::Breakthrough => "wave1",
            Self::ActionSummary => "wave1b",
            Self::Deep => "wave2",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holistic session mood assessment, patient dialogue only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodPayload {
    /// Multiple of 0.5 in [0.0, 10.0].
    pub score: f64,
    pub confidence: f64,
    pub rationale: String,
    pub key_indicators: Vec<String>,
    pub emotional_tone: String,
}

/// Discussion topics, homework candidates, and the dominant technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsPayload {
    /// 1–2 main topics.
    pub topics: Vec<String>,
    /// Exactly two concrete action items.
    pub action_items: Vec<String>,
    /// Keyed into the technique library; free text when unknown.
    pub technique_id: String,
    /// Clinician-style summary, ≤ 150 chars.
    pub summary: String,
    pub extraction_confidence: f64,
}

/// Condensed action phrase for session cards, ≤ 45 graphemes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummaryPayload {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakthroughType {
    CognitiveInsight,
    EmotionalShift,
    BehavioralCommitment,
    RelationalRealization,
    SelfCompassion,
}

/// One detected breakthrough moment with its dialogue evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakthroughMoment {
    #[serde(rename = "type")]
    pub kind: BreakthroughType,
    pub description: String,
    pub evidence: String,
    pub confidence: f64,
    pub timestamp_start: f64,
    pub timestamp_end: f64,
    pub dialogue_excerpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakthroughPayload {
    pub has_breakthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<BreakthroughMoment>,
    #[serde(default)]
    pub all_breakthroughs: Vec<BreakthroughMoment>,
}

impl BreakthroughPayload {
    /// Null-ish payload used when nothing clears the guardrail.
    pub fn none() -> Self {
        Self {
            has_breakthrough: false,
            primary: None,
            all_breakthroughs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSeverity {
    Low,
    Moderate,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFlag {
    pub flag: String,
    pub severity: RiskSeverity,
}

/// Wave-2 clinical analysis built over all wave-1 outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepAnalysisPayload {
    #[serde(default)]
    pub progress_indicators: Vec<String>,
    #[serde(default)]
    pub coping_skills: Vec<String>,
    #[serde(default)]
    pub relational_patterns: Vec<String>,
    #[serde(default)]
    pub risk_flags: Vec<RiskFlag>,
    #[serde(default)]
    pub recommended_topics: Vec<String>,
    #[serde(default)]
    pub unresolved_concerns: Vec<String>,
    pub analysis_confidence: f64,
}

/// Tagged union over every validated payload shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactPayload {
    Mood(MoodPayload),
    Topics(TopicsPayload),
    ActionSummary(ActionSummaryPayload),
    Breakthrough(BreakthroughPayload),
    Deep(DeepAnalysisPayload),
}

impl ArtifactPayload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Self::Mood(_) => ArtifactKind::Mood,
            Self::Topics(_) => ArtifactKind::Topics,
            Self::ActionSummary(_) => ArtifactKind::ActionSummary,
            Self::Breakthrough(_) => ArtifactKind::Breakthrough,
            Self::Deep(_) => ArtifactKind::Deep,
        }
    }

    /// The JSON value persisted in the session's derived column, without the
    /// tag (the column already encodes the kind).
    pub fn to_column_json(&self) -> Result<serde_json::Value, StoreError> {
        let value = match self {
            Self::Mood(p) => serde_json::to_value(p),
            Self::Topics(p) => serde_json::to_value(p),
            Self::ActionSummary(p) => serde_json::to_value(p),
            Self::Breakthrough(p) => serde_json::to_value(p),
            Self::Deep(p) => serde_json::to_value(p),
        };
        value.map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// The current validated output of one analyzer for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub kind: ArtifactKind,
    pub payload: serde_json::Value,
    pub confidence: f64,
    pub model_id: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
    pub produced_at: DateTime<Utc>,
}

impl ArtifactRecord {
    /// Deserialize the payload back into its typed form.
    pub fn typed(&self) -> Result<ArtifactPayload, StoreError> {
        let payload = match self.kind {
            ArtifactKind::Mood => ArtifactPayload::Mood(from_value(&self.payload)?),
            ArtifactKind::Topics => ArtifactPayload::Topics(from_value(&self.payload)?),
            ArtifactKind::ActionSummary => {
                ArtifactPayload::ActionSummary(from_value(&self.payload)?)
            }
            ArtifactKind::Breakthrough => {
                ArtifactPayload::Breakthrough(from_value(&self.payload)?)
            }
            ArtifactKind::Deep => ArtifactPayload::Deep(from_value(&self.payload)?),
        };
        Ok(payload)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value.clone()).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Snap a raw model score to the nearest 0.5 within [0.0, 10.0].
pub fn snap_to_half(score: f64) -> f64 {
    let clamped = score.clamp(0.0, 10.0);
    (clamped * 2.0).round() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in ArtifactKind::ALL {
            assert_eq!(ArtifactKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ArtifactKind::parse("sentiment"), None);
    }

    #[test]
    fn snap_to_half_grid() {
        assert_eq!(snap_to_half(7.3), 7.5);
        assert_eq!(snap_to_half(7.24), 7.0);
        assert_eq!(snap_to_half(-1.0), 0.0);
        assert_eq!(snap_to_half(11.2), 10.0);
        assert_eq!(snap_to_half(4.75), 5.0);
    }

    #[test]
    fn breakthrough_type_serializes_snake_case() {
        let json = serde_json::to_string(&BreakthroughType::RelationalRealization).unwrap();
        assert_eq!(json, "\"relational_realization\"");
    }

    #[test]
    fn payload_tag_matches_kind() {
        let payload = ArtifactPayload::Mood(MoodPayload {
            score: 6.5,
            confidence: 0.9,
            rationale: "engaged, hopeful".into(),
            key_indicators: vec!["hopefulness".into()],
            emotional_tone: "cautiously optimistic".into(),
        });
        assert_eq!(payload.kind(), ArtifactKind::Mood);
        let column = payload.to_column_json().unwrap();
        assert!(column.get("kind").is_none());
        assert_eq!(column["score"], 6.5);
    }

    #[test]
    fn record_typed_round_trip() {
        let rec = ArtifactRecord {
            kind: ArtifactKind::ActionSummary,
            payload: serde_json::json!({"text": "Practice breathing daily"}),
            confidence: 1.0,
            model_id: "rapid-mini".into(),
            prompt_tokens: 40,
            completion_tokens: 8,
            cost_usd: 0.0001,
            produced_at: Utc::now(),
        };
        match rec.typed().unwrap() {
            ArtifactPayload::ActionSummary(p) => assert_eq!(p.text, "Practice breathing daily"),
            other => panic!("wrong payload: {other:?}"),
        }
    }
}
