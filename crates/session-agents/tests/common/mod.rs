//! Shared fixtures: a scriptable chat transport and session builders.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use pipeline::store::NewSession;
use pipeline::transcript::{Transcript, TranscriptSegment};
use session_agents::llm::{ChatCompletion, ChatRequest, ChatTransport, LlmError};

/// One scripted reply for a task's queue.
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// Valid JSON content.
    Json(serde_json::Value),
    /// Raw text content (for malformed-output scenarios).
    Text(String),
    /// 429 with a retry hint.
    RateLimited(u64),
}

/// Scriptable transport: replies are keyed by a marker in the system prompt,
/// consumed in order. An empty queue falls back to a well-formed default for
/// the task, so tests script only the interesting calls.
pub struct FakeTransport {
    scripts: Mutex<HashMap<&'static str, VecDeque<FakeReply>>>,
    pub calls: Mutex<Vec<String>>,
}

const TASK_MARKERS: [(&str, &str); 5] = [
    ("mood assessor", "mood"),
    ("topic extractor", "topics"),
    ("condense therapy homework", "action_summary"),
    ("breakthrough detector", "breakthrough"),
    ("senior clinical supervisor", "deep"),
];

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, task: &'static str, replies: Vec<FakeReply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task)
            .or_default()
            .extend(replies);
    }

    pub fn call_count(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == task)
            .count()
    }

    fn task_of(request: &ChatRequest) -> &'static str {
        let system = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        for (marker, task) in TASK_MARKERS {
            if system.contains(marker) {
                return task;
            }
        }
        panic!("unrecognized system prompt: {system:.80}");
    }

    fn default_reply(task: &str) -> serde_json::Value {
        match task {
            "mood" => serde_json::json!({
                "score": 6.5,
                "confidence": 0.9,
                "rationale": "Engaged throughout, some anxiety about work.",
                "key_indicators": ["engagement", "work anxiety"],
                "emotional_tone": "cautiously hopeful"
            }),
            "topics" => serde_json::json!({
                "topics": ["workplace anxiety", "avoidance patterns"],
                "action_items": [
                    "Keep a daily thought record",
                    "Schedule one enjoyable activity"
                ],
                "technique_id": "cbt_cognitive_restructuring",
                "summary": "Worked on challenging catastrophic predictions about work.",
                "extraction_confidence": 0.85
            }),
            "action_summary" => serde_json::json!({
                "text": "Thought record + one fun activity"
            }),
            "breakthrough" => serde_json::json!({
                "has_breakthrough": true,
                "primary": {
                    "type": "cognitive_insight",
                    "description": "Linked avoidance to fear of judgment",
                    "evidence": "Patient names the connection at 08:12",
                    "confidence": 0.82,
                    "timestamp_start": 492.0,
                    "timestamp_end": 511.0,
                    "dialogue_excerpt": "I avoid the calls because I assume they think I'm failing."
                },
                "all_breakthroughs": []
            }),
            "deep" => serde_json::json!({
                "progress_indicators": ["More willing to test predictions"],
                "coping_skills": ["thought records", "paced breathing"],
                "relational_patterns": ["anticipates criticism from authority figures"],
                "risk_flags": [],
                "recommended_topics": ["perfectionism", "workplace boundaries"],
                "unresolved_concerns": ["sleep disruption"],
                "analysis_confidence": 0.8
            }),
            other => panic!("no default reply for task {other}"),
        }
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, LlmError> {
        let task = Self::task_of(request);
        self.calls.lock().unwrap().push(task.to_string());

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(task)
            .and_then(|q| q.pop_front());

        let content = match scripted {
            Some(FakeReply::Json(value)) => value.to_string(),
            Some(FakeReply::Text(text)) => text,
            Some(FakeReply::RateLimited(secs)) => {
                return Err(LlmError::RateLimited {
                    retry_after: Some(Duration::from_secs(secs)),
                });
            }
            None => Self::default_reply(task).to_string(),
        };

        // Real endpoints echo a dated variant of the requested id; cost
        // accounting must not depend on recognizing it.
        Ok(ChatCompletion {
            content,
            model: format!("{}-2024-08-06", request.model),
            prompt_tokens: 1000,
            completion_tokens: 200,
        })
    }
}

/// Twelve-minute two-speaker session with clear CBT content.
pub fn cbt_session(id: &str) -> NewSession {
    let turns = [
        (0.0, "SPEAKER_00", "How have you been since we talked about the work situation?"),
        (9.0, "SPEAKER_01", "Honestly, anxious. I keep assuming my manager thinks I'm failing."),
        (21.0, "SPEAKER_00", "What evidence do you have for that thought?"),
        (30.0, "SPEAKER_01", "Not much, really. She approved my last two reports."),
        (44.0, "SPEAKER_00", "So what might be a more balanced way to read the situation?"),
        (58.0, "SPEAKER_01", "Maybe that she's busy, not disappointed in me."),
        (290.0, "SPEAKER_00", "Could you test that prediction this week?"),
        (305.0, "SPEAKER_01", "I could ask for feedback directly instead of avoiding her."),
        (492.0, "SPEAKER_01", "I avoid the calls because I assume they think I'm failing."),
        (511.0, "SPEAKER_00", "That sounds like an important realization."),
        (640.0, "SPEAKER_01", "Writing the thoughts down did help last time."),
        (700.0, "SPEAKER_00", "Let's make that the homework again, plus one enjoyable activity."),
    ];
    NewSession {
        id: id.to_string(),
        patient_id: "patient-7".to_string(),
        therapist_id: "therapist-2".to_string(),
        session_ts: Utc::now(),
        duration_secs: 720.0,
        transcript: Transcript {
            segments: turns
                .iter()
                .map(|(start, label, text)| TranscriptSegment {
                    start_sec: *start,
                    end_sec: start + 6.0,
                    speaker_label: label.to_string(),
                    text: text.to_string(),
                })
                .collect(),
        },
    }
}

pub fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}
