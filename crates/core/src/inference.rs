//! Typed gateway to the external AI service.
//!
//! Every capability the orchestrator consumes (speech-to-text, text-to-speech,
//! question generation, answer evaluation, report narration) is a network call
//! behind the `InferenceClient` trait. The trait seam keeps the turn state
//! machine testable with a mock client, and the HTTP implementation owns the
//! per-call timeouts so callers never hang on a slow capability.

use crate::plan::{Difficulty, Persona, QuestionSpec};
use crate::session::{EvaluationRecord, MonitoringEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Per-call timeouts. Generation and report narration run against large
// models and get the widest bound; health pings the tightest.
const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(60);
const SYNTHESIZE_TIMEOUT: Duration = Duration::from_secs(15);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const EVALUATE_TIMEOUT: Duration = Duration::from_secs(30);
const REPORT_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Structured score for one answered question. All score fields are bounded
/// 1-10 by the evaluation capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerEvaluation {
    #[serde(default = "neutral_score")]
    pub technical_score: f32,
    #[serde(default = "neutral_score")]
    pub communication_score: f32,
    #[serde(default = "neutral_score")]
    pub composite_score: f32,
    #[serde(default)]
    pub feedback: String,
}

fn neutral_score() -> f32 {
    5.0
}

impl Default for AnswerEvaluation {
    /// The provisional placeholder recorded before background scoring lands:
    /// neutral midpoint scores, no feedback.
    fn default() -> Self {
        Self {
            technical_score: 5.0,
            communication_score: 5.0,
            composite_score: 5.0,
            feedback: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionRequest {
    pub resume_text: String,
    pub count: usize,
    pub difficulty: Difficulty,
    pub topic: String,
    /// Free-form rationale passed through to the generator, e.g. why the
    /// planner is asking for an easier question.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequest {
    pub question: String,
    pub answer: String,
    pub difficulty: Difficulty,
    pub topic: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRequest {
    pub evaluations: Vec<EvaluationRecord>,
    pub monitoring_log: Vec<MonitoringEvent>,
    pub topic: String,
    pub persona: Persona,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    #[serde(default = "neutral_score")]
    pub technical: f32,
    #[serde(default = "neutral_score")]
    pub communication: f32,
    #[serde(default = "neutral_score")]
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionFeedback {
    pub question: String,
    #[serde(default)]
    pub feedback: String,
}

/// Narrative half of the final report, produced by the generation capability.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportNarrative {
    #[serde(default = "neutral_score")]
    pub overall_score: f32,
    #[serde(default = "default_readiness")]
    pub readiness_level: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub scores: ScoreBreakdown,
    #[serde(default)]
    pub question_feedback: Vec<QuestionFeedback>,
    #[serde(default)]
    pub improvement_tips: Vec<String>,
}

fn default_readiness() -> String {
    "Developing".to_string()
}

/// Contract for the external AI capabilities. Implementations must tolerate
/// garbled input; an empty transcript or empty audio payload is a valid
/// response, not an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Speech-to-text. Returns the transcript, possibly empty.
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;

    /// Text-to-speech. Returns base64-encoded audio, empty on soft failure;
    /// callers fall back to text-only delivery.
    async fn synthesize(&self, text: &str, persona: Persona) -> Result<String>;

    /// Question generation from resume/context text.
    async fn generate_questions(&self, req: QuestionRequest) -> Result<Vec<QuestionSpec>>;

    /// Structured scoring of a single answer.
    async fn evaluate_answer(&self, req: EvaluationRequest) -> Result<AnswerEvaluation>;

    /// Final narrative and per-question feedback for the whole session.
    async fn compile_report(&self, req: ReportRequest) -> Result<ReportNarrative>;

    /// Liveness probe for the service behind this gateway.
    async fn health_check(&self) -> Result<()>;
}

/// `InferenceClient` backed by the external AI service's HTTP API.
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Deserialize)]
struct TranscribeOut {
    #[serde(default)]
    transcript: String,
}

#[derive(Deserialize)]
struct SynthesizeOut {
    #[serde(default)]
    audio_base64: String,
}

/// Question metadata as the generation endpoint reports it. Difficulty comes
/// back as free text, so it is mapped leniently onto our bands.
#[derive(Deserialize)]
struct RichQuestionOut {
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    expected_depth: Option<String>,
    #[serde(default)]
    followup_seeds: Vec<String>,
}

#[derive(Deserialize)]
struct GenerateOut {
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    questions_rich: Vec<RichQuestionOut>,
}

#[derive(Deserialize)]
struct EvaluateOut {
    evaluation: AnswerEvaluation,
}

fn parse_difficulty(s: Option<&str>, fallback: Difficulty) -> Difficulty {
    match s.map(|s| s.to_lowercase()) {
        Some(ref s) if s.starts_with("easy") => Difficulty::Easy,
        Some(ref s) if s.starts_with("hard") || s.starts_with("advanced") => Difficulty::Hard,
        Some(_) => Difficulty::Medium,
        None => fallback,
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio.webm")
            .mime_str("audio/webm")
            .context("Failed to build audio multipart body")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let out: TranscribeOut = self
            .client
            .post(self.url("/stt/transcribe"))
            .multipart(form)
            .timeout(TRANSCRIBE_TIMEOUT)
            .send()
            .await
            .context("Transcription request failed")?
            .error_for_status()
            .context("Transcription service returned an error status")?
            .json()
            .await
            .context("Failed to decode transcription response")?;
        Ok(out.transcript)
    }

    async fn synthesize(&self, text: &str, persona: Persona) -> Result<String> {
        let body = serde_json::json!({
            "text": text,
            "persona": persona.to_string(),
        });
        let out: SynthesizeOut = self
            .client
            .post(self.url("/speak"))
            .json(&body)
            .timeout(SYNTHESIZE_TIMEOUT)
            .send()
            .await
            .context("Speech synthesis request failed")?
            .error_for_status()
            .context("Speech synthesis returned an error status")?
            .json()
            .await
            .context("Failed to decode speech synthesis response")?;
        Ok(out.audio_base64)
    }

    async fn generate_questions(&self, req: QuestionRequest) -> Result<Vec<QuestionSpec>> {
        let requested = req.difficulty;
        let topic = req.topic.clone();
        let out: GenerateOut = self
            .client
            .post(self.url("/resume/generate-questions"))
            .json(&req)
            .timeout(GENERATE_TIMEOUT)
            .send()
            .await
            .context("Question generation request failed")?
            .error_for_status()
            .context("Question generation returned an error status")?
            .json()
            .await
            .context("Failed to decode question generation response")?;

        // Prefer rich metadata when the service supplies it; otherwise wrap
        // the plain strings with neutral metadata.
        if !out.questions_rich.is_empty() {
            return Ok(out
                .questions_rich
                .into_iter()
                .map(|q| QuestionSpec {
                    difficulty: parse_difficulty(q.difficulty.as_deref(), requested),
                    text: q.text,
                    category: q.category.unwrap_or_else(|| topic.clone()),
                    expected_depth: q.expected_depth.unwrap_or_else(|| "Moderate".to_string()),
                    followup_seeds: q.followup_seeds,
                })
                .collect());
        }
        Ok(out
            .questions
            .into_iter()
            .map(|text| QuestionSpec::plain(text, &topic, requested))
            .collect())
    }

    async fn evaluate_answer(&self, req: EvaluationRequest) -> Result<AnswerEvaluation> {
        let out: EvaluateOut = self
            .client
            .post(self.url("/evaluate-answer"))
            .json(&req)
            .timeout(EVALUATE_TIMEOUT)
            .send()
            .await
            .context("Evaluation request failed")?
            .error_for_status()
            .context("Evaluation returned an error status")?
            .json()
            .await
            .context("Failed to decode evaluation response")?;
        Ok(out.evaluation)
    }

    async fn compile_report(&self, req: ReportRequest) -> Result<ReportNarrative> {
        let narrative: ReportNarrative = self
            .client
            .post(self.url("/interview/generate-report"))
            .json(&req)
            .timeout(REPORT_TIMEOUT)
            .send()
            .await
            .context("Report narration request failed")?
            .error_for_status()
            .context("Report narration returned an error status")?
            .json()
            .await
            .context("Failed to decode report narration response")?;
        Ok(narrative)
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context("Health ping failed")?
            .error_for_status()
            .context("Health ping returned an error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_difficulty_parsing() {
        assert_eq!(parse_difficulty(Some("Easy"), Difficulty::Medium), Difficulty::Easy);
        assert_eq!(parse_difficulty(Some("hardcore"), Difficulty::Easy), Difficulty::Hard);
        assert_eq!(parse_difficulty(Some("Intermediate"), Difficulty::Easy), Difficulty::Medium);
        assert_eq!(parse_difficulty(None, Difficulty::Hard), Difficulty::Hard);
    }

    #[test]
    fn narrative_tolerates_sparse_payloads() {
        let narrative: ReportNarrative = serde_json::from_str("{}").unwrap();
        assert_eq!(narrative.overall_score, 5.0);
        assert_eq!(narrative.readiness_level, "Developing");
        assert!(narrative.question_feedback.is_empty());
    }
}
