//! Diarized transcript types and speaker-role inference.
//!
//! The transcription collaborator hands us an ordered list of segments with
//! opaque speaker labels (`SPEAKER_00`, `SPEAKER_01`, ...). Nothing upstream
//! tells us which label is the therapist, so role assignment is inferred:
//! the first label to speak is assumed to be the therapist unless the
//! question-density heuristic says otherwise.

use serde::{Deserialize, Serialize};

/// One diarized utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_sec: f64,
    pub end_sec: f64,
    /// Diarization label, e.g. `SPEAKER_00`.
    pub speaker_label: String,
    pub text: String,
}

/// Ordered sequence of segments for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
}

/// Resolved mapping from diarization labels to clinical roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerMap {
    pub therapist_label: String,
}

impl SpeakerMap {
    pub fn is_patient(&self, label: &str) -> bool {
        label != self.therapist_label
    }
}

/// Minimum question-ratio lead before the heuristic overrides the
/// first-speaker convention.
const QUESTION_RATIO_LEAD: f64 = 0.2;

impl Transcript {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total duration in seconds, from the last segment's end time.
    pub fn duration_secs(&self) -> f64 {
        self.segments.last().map(|s| s.end_sec).unwrap_or(0.0)
    }

    /// Distinct speaker labels in order of first appearance.
    pub fn speaker_labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for seg in &self.segments {
            if !labels.contains(&seg.speaker_label.as_str()) {
                labels.push(&seg.speaker_label);
            }
        }
        labels
    }

    /// Infer which label belongs to the therapist.
    ///
    /// Convention: the first speaker is the therapist. Override: if another
    /// label asks questions at a markedly higher rate (therapists probe,
    /// patients narrate), that label wins. An explicit `override_label`
    /// bypasses both.
    pub fn infer_speaker_map(&self, override_label: Option<&str>) -> SpeakerMap {
        if let Some(label) = override_label {
            return SpeakerMap {
                therapist_label: label.to_string(),
            };
        }

        let labels = self.speaker_labels();
        let first = labels.first().map(|l| l.to_string()).unwrap_or_default();
        if labels.len() < 2 {
            return SpeakerMap {
                therapist_label: first,
            };
        }

        let ratio = |label: &str| -> f64 {
            let (mut total, mut questions) = (0usize, 0usize);
            for seg in self.segments.iter().filter(|s| s.speaker_label == label) {
                total += 1;
                if seg.text.trim_end().ends_with('?') {
                    questions += 1;
                }
            }
            if total == 0 {
                0.0
            } else {
                questions as f64 / total as f64
            }
        };

        let best = labels
            .iter()
            .map(|l| (*l, ratio(l)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(l, r)| (l.to_string(), r))
            .unwrap_or((first.clone(), 0.0));

        if best.0 != first && best.1 >= ratio(&first) + QUESTION_RATIO_LEAD {
            SpeakerMap {
                therapist_label: best.0,
            }
        } else {
            SpeakerMap {
                therapist_label: first,
            }
        }
    }

    /// Render the full dialogue as `[mm:ss] Role: text` lines.
    ///
    /// Output is capped at `char_budget` characters; when over budget the
    /// head is kept and a truncation marker is appended, so prompts stay
    /// bounded on very long sessions.
    pub fn render_dialogue(&self, map: &SpeakerMap, char_budget: usize) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            let role = if map.is_patient(&seg.speaker_label) {
                "Patient"
            } else {
                "Therapist"
            };
            let line = format!("[{}] {}: {}\n", fmt_timestamp(seg.start_sec), role, seg.text);
            if out.len() + line.len() > char_budget {
                out.push_str("[... transcript truncated ...]\n");
                break;
            }
            out.push_str(&line);
        }
        out
    }

    /// Render only the patient's utterances, timestamped.
    pub fn render_patient_only(&self, map: &SpeakerMap, char_budget: usize) -> String {
        let mut out = String::new();
        for seg in self
            .segments
            .iter()
            .filter(|s| map.is_patient(&s.speaker_label))
        {
            let line = format!("[{}] {}\n", fmt_timestamp(seg.start_sec), seg.text);
            if out.len() + line.len() > char_budget {
                out.push_str("[... transcript truncated ...]\n");
                break;
            }
            out.push_str(&line);
        }
        out
    }
}

/// Format seconds as `mm:ss`.
pub fn fmt_timestamp(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, label: &str, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start_sec: start,
            end_sec: start + 5.0,
            speaker_label: label.to_string(),
            text: text.to_string(),
        }
    }

    fn two_speaker_transcript() -> Transcript {
        Transcript {
            segments: vec![
                seg(0.0, "SPEAKER_00", "How have you been feeling this week?"),
                seg(6.0, "SPEAKER_01", "Honestly, pretty low. Work has been hard."),
                seg(14.0, "SPEAKER_00", "What do you think triggered that?"),
                seg(20.0, "SPEAKER_01", "I keep thinking I'm going to be fired."),
            ],
        }
    }

    #[test]
    fn first_speaker_is_therapist_by_convention() {
        let t = two_speaker_transcript();
        let map = t.infer_speaker_map(None);
        assert_eq!(map.therapist_label, "SPEAKER_00");
        assert!(map.is_patient("SPEAKER_01"));
    }

    #[test]
    fn question_density_overrides_convention() {
        // Patient speaks first, but the second speaker asks all the questions.
        let t = Transcript {
            segments: vec![
                seg(0.0, "SPEAKER_00", "I had a rough week."),
                seg(6.0, "SPEAKER_01", "What made it rough?"),
                seg(12.0, "SPEAKER_00", "Mostly the deadline at work."),
                seg(18.0, "SPEAKER_01", "How did you cope with that?"),
            ],
        };
        let map = t.infer_speaker_map(None);
        assert_eq!(map.therapist_label, "SPEAKER_01");
    }

    #[test]
    fn explicit_override_wins() {
        let t = two_speaker_transcript();
        let map = t.infer_speaker_map(Some("SPEAKER_01"));
        assert_eq!(map.therapist_label, "SPEAKER_01");
    }

    #[test]
    fn patient_only_view_excludes_therapist() {
        let t = two_speaker_transcript();
        let map = t.infer_speaker_map(None);
        let view = t.render_patient_only(&map, 4096);
        assert!(view.contains("pretty low"));
        assert!(!view.contains("How have you been"));
    }

    #[test]
    fn dialogue_render_respects_budget() {
        let t = two_speaker_transcript();
        let map = t.infer_speaker_map(None);
        let view = t.render_dialogue(&map, 60);
        assert!(view.contains("truncated"));
        assert!(view.len() < 120);
    }

    #[test]
    fn timestamp_formatting() {
        assert_eq!(fmt_timestamp(0.0), "00:00");
        assert_eq!(fmt_timestamp(65.4), "01:05");
        assert_eq!(fmt_timestamp(725.0), "12:05");
    }
}
