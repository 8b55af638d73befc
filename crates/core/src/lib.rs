pub mod breaker;
pub mod health;
pub mod inference;
pub mod plan;
pub mod planner;
pub mod registry;
pub mod report;
pub mod session;
pub mod turn;

use serde::Serialize;

/// Events pushed to whichever live connection is currently attached to a
/// session. Zero or one connection is attached at a time; events for a
/// detached session are dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Spoken interviewer output: a greeting, question, probe or closing line.
    /// `audio` is base64-encoded synthesized speech, empty when synthesis was
    /// skipped or failed (the client falls back to text-only delivery).
    AiResponse {
        text: String,
        audio: String,
        is_last: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_question: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        question_index: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_questions: Option<usize>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        resumed: bool,
    },
    /// Synthesized speech delivered after its question text, so text delivery
    /// is never blocked on synthesis latency.
    TtsAudio { audio: String },
    /// Live per-turn metrics, pushed once a background evaluation lands.
    LiveMetrics {
        technical_score: f32,
        communication_score: f32,
        confidence_score: f32,
        feedback: String,
        question_index: usize,
    },
    /// Terminal event carrying an opaque reference to the persisted report.
    ReportReady { report_id: String },
    /// Explicit error surfaced to the candidate. `code` is machine-readable
    /// ("SESSION_EXPIRED", "AI_OFFLINE").
    Error { message: String, code: String },
}

impl ClientEvent {
    /// A plain spoken line with no question bookkeeping attached.
    pub fn spoken(text: impl Into<String>, audio: impl Into<String>) -> Self {
        ClientEvent::AiResponse {
            text: text.into(),
            audio: audio.into(),
            is_last: false,
            current_question: None,
            question_index: None,
            total_questions: None,
            resumed: false,
        }
    }
}
