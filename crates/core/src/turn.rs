//! The per-turn state machine driving a live interview.
//!
//! Each audio turn runs TRANSCRIBING -> PROBE_DECISION -> ACK_SENT, with
//! scoring decoupled into a background task so the candidate never waits on
//! evaluation latency. The acknowledgement (probe, next question or closing
//! line) goes out as soon as the transcript is classified; synthesized speech
//! for it follows on its own event once ready.
//!
//! Failure policy, in order of preference: retry the candidate (garbled
//! audio), degrade the turn (advance with a placeholder answer), and only
//! then surface an error event. A turn never takes the session down.

use crate::ClientEvent;
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::health::HealthSnapshot;
use crate::inference::{EvaluationRequest, InferenceClient, QuestionRequest};
use crate::plan::{CandidateProfile, Persona, QuestionSpec, fallback_plan};
use crate::planner::AdaptiveQuestionPlanner;
use crate::registry::{SessionRegistry, SharedSession};
use crate::report::ReportCompiler;
use crate::session::{InterviewSession, MonitoringEvent, SessionSettings};
use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Answer recorded when the candidate could not be transcribed after the
/// retry budget, so the plan still advances.
pub const PLACEHOLDER_ANSWER: &str = "[No clear response detected]";
/// Answer recorded when a turn degrades because the AI capabilities are
/// unreachable mid-interview.
const UNAVAILABLE_ANSWER: &str = "[answer unavailable]";

const RETRY_PROMPT: &str =
    "I didn't quite catch that. Could you please repeat your answer?";
const DEFAULT_PROBE: &str =
    "That's a good start, but could you elaborate? A specific example would help.";
const CLOSING_LINE: &str = "Thank you, that was the last question. The interview is now \
                            complete and your performance report is being prepared.";

#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Answers shorter than this many words trigger a probe.
    pub short_answer_words: usize,
    /// Maximum probes across the whole session.
    pub probe_budget: u32,
    /// Empty transcriptions tolerated per turn before forcing an advance.
    pub max_transcription_retries: u32,
    /// Transcripts below this many characters count as empty.
    pub min_transcript_chars: usize,
    /// Plan length requested at join time.
    pub plan_size: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            short_answer_words: 15,
            probe_budget: 8,
            max_transcription_retries: 2,
            min_transcript_chars: 3,
            plan_size: 7,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The AI service is offline; admission is refused rather than admitting
    /// a candidate into a session that cannot hear them.
    #[error("the interview service is temporarily offline, please try again shortly")]
    ServiceOffline,
    #[error(transparent)]
    Init(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("session expired")]
    SessionExpired,
}

pub struct TurnProcessor {
    registry: Arc<SessionRegistry>,
    gateway: Arc<dyn InferenceClient>,
    breaker: Arc<CircuitBreaker>,
    planner: Arc<AdaptiveQuestionPlanner>,
    compiler: Arc<ReportCompiler>,
    health: Arc<HealthSnapshot>,
    config: TurnConfig,
}

impl TurnProcessor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: Arc<dyn InferenceClient>,
        breaker: Arc<CircuitBreaker>,
        planner: Arc<AdaptiveQuestionPlanner>,
        compiler: Arc<ReportCompiler>,
        health: Arc<HealthSnapshot>,
        config: TurnConfig,
    ) -> Self {
        Self {
            registry,
            gateway,
            breaker,
            planner,
            compiler,
            health,
            config,
        }
    }

    /// Admits a candidate: creates the session (building the plan) on first
    /// join, or reattaches the connection and re-emits the question in play
    /// on reconnect.
    pub async fn join(
        &self,
        user_key: &str,
        profile: &CandidateProfile,
        settings: SessionSettings,
        conn: mpsc::Sender<ClientEvent>,
    ) -> Result<(), JoinError> {
        if !self.health.inference_online() {
            return Err(JoinError::ServiceOffline);
        }

        let (session, created) = self
            .registry
            .get_or_create(user_key, || async {
                let plan = self.build_plan(profile, &settings).await;
                tracing::info!(
                    user = user_key,
                    questions = plan.len(),
                    topic = %settings.topic,
                    persona = %settings.persona,
                    "Interview session created"
                );
                Ok(InterviewSession::new(user_key, plan, settings, conn.clone()))
            })
            .await?;

        if created {
            let (text, first_question, total, persona) = {
                let s = session.lock().await;
                let first = s
                    .current_question()
                    .map(|q| q.text.clone())
                    .ok_or_else(|| anyhow!("session created with an empty plan"))?;
                (
                    greeting(&s.settings, s.plan.len(), &first),
                    first,
                    s.plan.len(),
                    s.settings.persona,
                )
            };
            let audio = self.synthesize_soft(&text, persona).await;
            self.push(
                &session,
                ClientEvent::AiResponse {
                    text,
                    audio,
                    is_last: false,
                    current_question: Some(first_question),
                    question_index: Some(0),
                    total_questions: Some(total),
                    resumed: false,
                },
            )
            .await;
        } else {
            let (question, index, total) = {
                let mut s = session.lock().await;
                s.attach(conn);
                (
                    s.current_question().map(|q| q.text.clone()),
                    s.cursor(),
                    s.plan.len(),
                )
            };
            tracing::info!(user = user_key, index, "Reconnected to existing session");
            let event = match question {
                Some(text) => ClientEvent::AiResponse {
                    text: text.clone(),
                    audio: String::new(),
                    is_last: false,
                    current_question: Some(text),
                    question_index: Some(index),
                    total_questions: Some(total),
                    resumed: true,
                },
                None => ClientEvent::spoken(
                    "Your interview is already complete. Your report is on its way.",
                    "",
                ),
            };
            self.push(&session, event).await;
        }
        Ok(())
    }

    /// Processes one audio turn end to end. Internal failures degrade the
    /// turn instead of propagating; the only hard error is an unknown
    /// session.
    pub async fn process_audio(&self, user_key: &str, audio: Vec<u8>) -> Result<(), TurnError> {
        let session = self
            .registry
            .get(user_key)
            .await
            .ok_or(TurnError::SessionExpired)?;

        if let Err(e) = self.run_turn(user_key, &session, audio).await {
            tracing::error!(user = user_key, "Turn failed, degrading: {e:?}");
            self.degrade(user_key, &session).await;
        }
        Ok(())
    }

    /// Appends a proctoring event to the session's monitoring log.
    pub async fn record_monitoring_event(
        &self,
        user_key: &str,
        event: MonitoringEvent,
    ) -> Result<(), TurnError> {
        let session = self
            .registry
            .get(user_key)
            .await
            .ok_or(TurnError::SessionExpired)?;
        tracing::debug!(user = user_key, kind = %event.kind, "Monitoring event recorded");
        session.lock().await.record_monitoring_event(event);
        Ok(())
    }

    async fn run_turn(
        &self,
        user_key: &str,
        session: &SharedSession,
        audio: Vec<u8>,
    ) -> anyhow::Result<()> {
        let (persona, already_complete) = {
            let s = session.lock().await;
            (s.settings.persona, s.is_complete())
        };
        if already_complete {
            self.push(
                session,
                ClientEvent::spoken(
                    "Your interview is already complete. Your report is on its way.",
                    "",
                ),
            )
            .await;
            return Ok(());
        }

        // TRANSCRIBING. A transient failure counts as an empty transcript and
        // falls into the retry path; an open circuit means every capability
        // is down, so the turn degrades instead.
        let transcript = match self
            .breaker
            .execute(|| async { self.gateway.transcribe(&audio).await })
            .await
        {
            Ok(t) => t.trim().to_string(),
            Err(BreakerError::Open) => {
                return Err(anyhow!("AI capabilities unavailable (circuit open)"));
            }
            Err(BreakerError::Call(e)) => {
                tracing::warn!(user = user_key, "Transcription failed: {e:?}");
                String::new()
            }
        };

        let (transcript, forced) = if transcript.chars().count() < self.config.min_transcript_chars
        {
            let retries = {
                let mut s = session.lock().await;
                s.transcription_retries += 1;
                s.touch();
                s.transcription_retries
            };
            if retries < self.config.max_transcription_retries {
                tracing::info!(user = user_key, retries, "Empty transcript, asking to repeat");
                let audio = self.synthesize_soft(RETRY_PROMPT, persona).await;
                self.push(session, ClientEvent::spoken(RETRY_PROMPT, audio)).await;
                return Ok(());
            }
            tracing::info!(user = user_key, "Retry budget exhausted, advancing with placeholder");
            (PLACEHOLDER_ANSWER.to_string(), true)
        } else {
            (transcript, false)
        };

        // PROBE_DECISION. A short first answer to a question earns one probe;
        // the probed retry always advances, whatever its length. A forced
        // placeholder is never probed.
        let word_count = transcript.split_whitespace().count();
        let probe = {
            let mut s = session.lock().await;
            s.transcription_retries = 0;
            s.touch();
            if !forced
                && word_count < self.config.short_answer_words
                && !s.is_probing
                && s.probes_used < self.config.probe_budget
            {
                s.is_probing = true;
                s.probes_used += 1;
                Some(
                    s.current_question()
                        .and_then(|q| q.followup_seeds.first().cloned())
                        .unwrap_or_else(|| DEFAULT_PROBE.to_string()),
                )
            } else {
                s.is_probing = false;
                None
            }
        };
        if let Some(probe_text) = probe {
            tracing::info!(user = user_key, word_count, "Short answer, probing");
            let audio = self.synthesize_soft(&probe_text, persona).await;
            self.push(session, ClientEvent::spoken(probe_text, audio)).await;
            return Ok(());
        }

        // Record the answer and advance the cursor before anything slow runs.
        let (turn_index, question, next_question, total, schedule) = {
            let mut s = session.lock().await;
            let question = s
                .current_question()
                .map(|q| q.text.clone())
                .unwrap_or_default();
            let turn_index = s.record_answer(transcript.clone());
            let next = s.current_question().map(|q| q.text.clone());
            let schedule = next.is_none() && s.schedule_report();
            (turn_index, question, next, s.plan.len(), schedule)
        };

        // BACKGROUND_SCORING runs off the turn path; its result is applied
        // back by turn index.
        self.spawn_scoring(user_key, session, turn_index, question, transcript);

        // ACK_SENT. Text goes out immediately; speech follows separately so
        // the candidate is never blocked on synthesis.
        match next_question {
            Some(next) => {
                let text = transition_line(turn_index, &next);
                self.push(
                    session,
                    ClientEvent::AiResponse {
                        text: text.clone(),
                        audio: String::new(),
                        is_last: false,
                        current_question: Some(next),
                        question_index: Some(turn_index + 1),
                        total_questions: Some(total),
                        resumed: false,
                    },
                )
                .await;
                self.spawn_speech(session, text, persona);
            }
            None => {
                tracing::info!(user = user_key, "Plan exhausted, closing the interview");
                let audio = self.synthesize_soft(CLOSING_LINE, persona).await;
                self.push(
                    session,
                    ClientEvent::AiResponse {
                        text: CLOSING_LINE.to_string(),
                        audio,
                        is_last: true,
                        current_question: None,
                        question_index: None,
                        total_questions: Some(total),
                        resumed: false,
                    },
                )
                .await;
                if schedule {
                    self.compiler.schedule(user_key.to_string());
                }
            }
        }
        Ok(())
    }

    /// Last-resort recovery: record a placeholder answer, advance and keep
    /// the interview moving. Never scores the placeholder.
    async fn degrade(&self, user_key: &str, session: &SharedSession) {
        let (next_question, index, total, schedule) = {
            let mut s = session.lock().await;
            if s.is_complete() {
                return;
            }
            s.is_probing = false;
            s.transcription_retries = 0;
            s.record_answer(UNAVAILABLE_ANSWER.to_string());
            let next = s.current_question().map(|q| q.text.clone());
            let schedule = next.is_none() && s.schedule_report();
            (next, s.cursor(), s.plan.len(), schedule)
        };

        match next_question {
            Some(next) => {
                self.push(
                    session,
                    ClientEvent::AiResponse {
                        text: format!("Let's continue. {next}"),
                        audio: String::new(),
                        is_last: false,
                        current_question: Some(next),
                        question_index: Some(index),
                        total_questions: Some(total),
                        resumed: false,
                    },
                )
                .await;
            }
            None => {
                self.push(
                    session,
                    ClientEvent::AiResponse {
                        text: CLOSING_LINE.to_string(),
                        audio: String::new(),
                        is_last: true,
                        current_question: None,
                        question_index: None,
                        total_questions: Some(total),
                        resumed: false,
                    },
                )
                .await;
                if schedule {
                    self.compiler.schedule(user_key.to_string());
                }
            }
        }
    }

    fn spawn_scoring(
        &self,
        user_key: &str,
        session: &SharedSession,
        turn_index: usize,
        question: String,
        answer: String,
    ) {
        let user_key = user_key.to_string();
        let session = session.clone();
        let registry = self.registry.clone();
        let gateway = self.gateway.clone();
        let breaker = self.breaker.clone();
        let planner = self.planner.clone();

        tokio::spawn(async move {
            let (difficulty, topic) = {
                let s = session.lock().await;
                (s.settings.difficulty, s.settings.topic.clone())
            };
            let request = EvaluationRequest {
                question,
                answer,
                difficulty,
                topic,
            };
            let evaluation = match breaker
                .execute(|| async { gateway.evaluate_answer(request.clone()).await })
                .await
            {
                Ok(e) => e,
                Err(e) => {
                    // The provisional neutral score stands.
                    tracing::warn!(user = user_key, turn_index, "Background scoring failed: {e:?}");
                    return;
                }
            };

            let (applied, cumulative, sender) = {
                let mut s = session.lock().await;
                let applied = s.apply_evaluation(turn_index, evaluation.clone());
                (applied, s.cumulative_score, s.sender())
            };
            if !applied {
                tracing::debug!(user = user_key, turn_index, "Late or duplicate evaluation ignored");
                return;
            }
            tracing::info!(
                user = user_key,
                turn_index,
                score = evaluation.composite_score,
                cumulative,
                "Evaluation applied"
            );
            if let Some(tx) = sender {
                let feedback = if evaluation.feedback.is_empty() {
                    "Good response!".to_string()
                } else {
                    evaluation.feedback.clone()
                };
                let _ = tx
                    .send(ClientEvent::LiveMetrics {
                        technical_score: evaluation.technical_score,
                        communication_score: evaluation.communication_score,
                        confidence_score: cumulative,
                        feedback,
                        question_index: turn_index,
                    })
                    .await;
            }

            planner.maybe_adjust(&registry, &user_key).await;
        });
    }

    /// Synthesizes the ack off the turn path and delivers it as a follow-up
    /// audio event.
    fn spawn_speech(&self, session: &SharedSession, text: String, persona: Persona) {
        let session = session.clone();
        let gateway = self.gateway.clone();
        let breaker = self.breaker.clone();
        tokio::spawn(async move {
            let audio = match breaker
                .execute(|| async { gateway.synthesize(&text, persona).await })
                .await
            {
                Ok(a) => a,
                Err(e) => {
                    tracing::debug!("Speech synthesis unavailable: {e:?}");
                    return;
                }
            };
            if audio.is_empty() {
                return;
            }
            let sender = session.lock().await.sender();
            if let Some(tx) = sender {
                let _ = tx.send(ClientEvent::TtsAudio { audio }).await;
            }
        });
    }

    async fn build_plan(
        &self,
        profile: &CandidateProfile,
        settings: &SessionSettings,
    ) -> Vec<QuestionSpec> {
        let count = self.config.plan_size;
        let request = QuestionRequest {
            resume_text: settings.resume_text.clone(),
            count,
            difficulty: settings.difficulty,
            topic: settings.topic.clone(),
            context: None,
        };
        match self
            .breaker
            .execute(|| async { self.gateway.generate_questions(request.clone()).await })
            .await
        {
            Ok(mut questions) if !questions.is_empty() => {
                questions.truncate(count);
                questions
            }
            Ok(_) => {
                tracing::warn!("Generator returned no questions, using local fallback plan");
                fallback_plan(profile, &settings.topic, settings.difficulty, count)
            }
            Err(e) => {
                tracing::warn!("Question generation failed, using local fallback plan: {e:?}");
                fallback_plan(profile, &settings.topic, settings.difficulty, count)
            }
        }
    }

    /// Synthesis that never fails the caller: any error yields empty audio
    /// and the event goes out text-only.
    async fn synthesize_soft(&self, text: &str, persona: Persona) -> String {
        match self
            .breaker
            .execute(|| async { self.gateway.synthesize(text, persona).await })
            .await
        {
            Ok(audio) => audio,
            Err(e) => {
                tracing::debug!("Speech synthesis unavailable: {e:?}");
                String::new()
            }
        }
    }

    async fn push(&self, session: &SharedSession, event: ClientEvent) {
        let sender = session.lock().await.sender();
        match sender {
            Some(tx) => {
                if tx.send(event).await.is_err() {
                    tracing::debug!("Connection closed, event dropped");
                }
            }
            None => tracing::debug!("No connection attached, event dropped"),
        }
    }
}

fn greeting(settings: &SessionSettings, total: usize, first_question: &str) -> String {
    let name = &settings.candidate_name;
    let topic = &settings.topic;
    match settings.persona {
        Persona::FriendlyMentor => format!(
            "Hi {name}! Welcome to your {topic} interview. I've prepared {total} questions \
             for you. Take your time with each answer and speak naturally when you're ready. \
             Let's begin. {first_question}"
        ),
        Persona::StrictLead => format!(
            "Good day, {name}. This is a {topic} interview consisting of {total} questions. \
             I expect precise, well-structured answers. First question: {first_question}"
        ),
        Persona::StressTester => format!(
            "Welcome, {name}. Over the next {total} questions I'll be pushing on the depth \
             of your {topic} knowledge. Stay sharp. First question: {first_question}"
        ),
    }
}

/// Rotates the spoken lead-in so consecutive turns don't sound identical.
fn transition_line(turn_index: usize, question: &str) -> String {
    const LEADS: &[&str] = &[
        "Thank you. Here's your next question:",
        "Got it. Moving on:",
        "Alright, let's continue:",
        "Good. Next up:",
        "Okay, noted. Next question:",
    ];
    format!("{} {}", LEADS[turn_index % LEADS.len()], question)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::inference::{AnswerEvaluation, MockInferenceClient};
    use crate::plan::Difficulty;
    use crate::planner::PlannerConfig;
    use crate::report::MockReportStore;
    use std::time::Duration;

    struct Harness {
        registry: Arc<SessionRegistry>,
        processor: TurnProcessor,
        health: Arc<HealthSnapshot>,
    }

    fn harness(gateway: MockInferenceClient, config: TurnConfig) -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let gateway: Arc<dyn InferenceClient> = Arc::new(gateway);
        let breaker = Arc::new(CircuitBreaker::default());
        let planner = Arc::new(AdaptiveQuestionPlanner::new(
            gateway.clone(),
            breaker.clone(),
            PlannerConfig::default(),
        ));
        let compiler = Arc::new(ReportCompiler::new(
            registry.clone(),
            gateway.clone(),
            breaker.clone(),
            Arc::new(MockReportStore::new()),
            Duration::from_secs(3),
        ));
        let health = Arc::new(HealthSnapshot::default());
        health.force_inference(true);
        Harness {
            registry: registry.clone(),
            processor: TurnProcessor::new(
                registry,
                gateway,
                breaker,
                planner,
                compiler,
                health.clone(),
                config,
            ),
            health,
        }
    }

    fn plan_of(n: usize) -> Vec<QuestionSpec> {
        (0..n)
            .map(|i| QuestionSpec::plain(format!("Q{i}"), "general", Difficulty::Medium))
            .collect()
    }

    fn expect_plan(gateway: &mut MockInferenceClient, n: usize) {
        gateway
            .expect_generate_questions()
            .times(1)
            .returning(move |_| Ok(plan_of(n)));
    }

    fn soft_synthesis(gateway: &mut MockInferenceClient) {
        gateway.expect_synthesize().returning(|_, _| Ok(String::new()));
    }

    /// Collects events already queued on the channel without blocking.
    fn drain(rx: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn join_is_refused_while_the_ai_service_is_offline() {
        let h = harness(MockInferenceClient::new(), TurnConfig::default());
        h.health.force_inference(false);
        let (tx, _rx) = mpsc::channel(8);
        let result = h
            .processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await;
        assert!(matches!(result, Err(JoinError::ServiceOffline)));
        assert!(h.registry.get("u1").await.is_none());
    }

    #[tokio::test]
    async fn first_join_builds_a_plan_and_greets_with_the_first_question() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 3);
        gateway
            .expect_synthesize()
            .times(1)
            .returning(|_, _| Ok("QUJD".to_string()));

        let h = harness(gateway, TurnConfig::default());
        let (tx, mut rx) = mpsc::channel(8);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();

        match rx.recv().await {
            Some(ClientEvent::AiResponse {
                text,
                audio,
                current_question,
                question_index,
                total_questions,
                resumed,
                ..
            }) => {
                assert!(text.contains("Q0"));
                assert_eq!(audio, "QUJD");
                assert_eq!(current_question.as_deref(), Some("Q0"));
                assert_eq!(question_index, Some(0));
                assert_eq!(total_questions, Some(3));
                assert!(!resumed);
            }
            other => panic!("expected greeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_falls_back_to_a_local_plan_when_generation_fails() {
        let mut gateway = MockInferenceClient::new();
        gateway
            .expect_generate_questions()
            .times(1)
            .returning(|_| Err(anyhow!("generator offline")));
        soft_synthesis(&mut gateway);

        let h = harness(gateway, TurnConfig::default());
        let profile = CandidateProfile {
            skills: vec!["Rust".to_string()],
            ..CandidateProfile::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        h.processor
            .join("u1", &profile, SessionSettings::default(), tx)
            .await
            .unwrap();

        match rx.recv().await {
            Some(ClientEvent::AiResponse { current_question, .. }) => {
                assert!(current_question.unwrap().contains("Rust"));
            }
            other => panic!("expected greeting, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconnect_reemits_the_question_in_play_without_advancing() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 10);
        soft_synthesis(&mut gateway);

        let h = harness(
            gateway,
            TurnConfig {
                plan_size: 10,
                ..TurnConfig::default()
            },
        );
        let (tx, _rx) = mpsc::channel(8);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();

        // Three turns happen, then the connection drops.
        {
            let session = h.registry.get("u1").await.unwrap();
            let mut s = session.lock().await;
            for i in 0..3 {
                s.record_answer(format!("answer {i}"));
            }
            s.detach();
        }

        let (tx2, mut rx2) = mpsc::channel(8);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx2)
            .await
            .unwrap();

        match rx2.recv().await {
            Some(ClientEvent::AiResponse {
                text,
                question_index,
                total_questions,
                resumed,
                ..
            }) => {
                assert_eq!(text, "Q3");
                assert_eq!(question_index, Some(3));
                assert_eq!(total_questions, Some(10));
                assert!(resumed);
            }
            other => panic!("expected resumed question, got {other:?}"),
        }
        let session = h.registry.get("u1").await.unwrap();
        assert_eq!(session.lock().await.cursor(), 3);
    }

    #[tokio::test]
    async fn audio_for_an_unknown_session_is_rejected() {
        let h = harness(MockInferenceClient::new(), TurnConfig::default());
        let result = h.processor.process_audio("ghost", vec![1, 2, 3]).await;
        assert!(matches!(result, Err(TurnError::SessionExpired)));
    }

    #[tokio::test]
    async fn empty_transcriptions_prompt_once_then_force_an_advance() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 2);
        soft_synthesis(&mut gateway);
        gateway
            .expect_transcribe()
            .times(3)
            .returning(|_| Ok(String::new()));
        gateway
            .expect_evaluate_answer()
            .withf(|req| req.answer == PLACEHOLDER_ANSWER)
            .times(1)
            .returning(|_| Ok(AnswerEvaluation::default()));

        let h = harness(gateway, TurnConfig::default());
        let (tx, mut rx) = mpsc::channel(16);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();
        drain(&mut rx);

        // First garbled turn spends the retry: prompt only, no advance.
        h.processor.process_audio("u1", vec![0]).await.unwrap();
        {
            let session = h.registry.get("u1").await.unwrap();
            assert_eq!(session.lock().await.cursor(), 0);
        }
        match rx.recv().await {
            Some(ClientEvent::AiResponse { text, current_question, .. }) => {
                assert!(text.contains("repeat"));
                assert!(current_question.is_none());
            }
            other => panic!("expected retry prompt, got {other:?}"),
        }

        // Second garbled turn exhausts the budget: placeholder recorded,
        // plan advances to the next question.
        h.processor.process_audio("u1", vec![0]).await.unwrap();
        settle().await;
        {
            let session = h.registry.get("u1").await.unwrap();
            let s = session.lock().await;
            assert_eq!(s.cursor(), 1);
            assert_eq!(s.evaluations[0].answer, PLACEHOLDER_ANSWER);
            assert_eq!(s.probes_used, 0, "a forced placeholder is never probed");
        }
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::AiResponse { current_question: Some(q), .. } if q == "Q1"
        )));

        // Third garbled turn lands on the fresh question with a reset retry
        // counter: prompt again, no advance.
        h.processor.process_audio("u1", vec![0]).await.unwrap();
        let session = h.registry.get("u1").await.unwrap();
        assert_eq!(session.lock().await.cursor(), 1);
    }

    #[tokio::test]
    async fn short_answers_probe_once_without_advancing() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 3);
        soft_synthesis(&mut gateway);
        gateway
            .expect_transcribe()
            .times(2)
            .returning(|_| Ok("just recursion".to_string()));
        gateway
            .expect_evaluate_answer()
            .times(1)
            .returning(|_| Ok(AnswerEvaluation::default()));

        let h = harness(gateway, TurnConfig::default());
        let (tx, mut rx) = mpsc::channel(16);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();
        drain(&mut rx);

        // First short answer: probe, no cursor movement, no evaluation.
        h.processor.process_audio("u1", vec![0]).await.unwrap();
        {
            let session = h.registry.get("u1").await.unwrap();
            let s = session.lock().await;
            assert_eq!(s.cursor(), 0);
            assert!(s.evaluations.is_empty());
            assert_eq!(s.probes_used, 1);
            assert!(s.is_probing);
        }
        match rx.recv().await {
            Some(ClientEvent::AiResponse { text, current_question, .. }) => {
                assert!(text.contains("elaborate"));
                assert!(current_question.is_none(), "a probe is not a new question");
            }
            other => panic!("expected probe, got {other:?}"),
        }

        // The probed retry advances even though it is still short.
        h.processor.process_audio("u1", vec![0]).await.unwrap();
        settle().await;
        let session = h.registry.get("u1").await.unwrap();
        let s = session.lock().await;
        assert_eq!(s.cursor(), 1);
        assert_eq!(s.evaluations[0].answer, "just recursion");
        assert!(!s.is_probing);
    }

    #[tokio::test]
    async fn exhausted_probe_budget_advances_short_answers_directly() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 3);
        soft_synthesis(&mut gateway);
        gateway
            .expect_transcribe()
            .times(1)
            .returning(|_| Ok("short".to_string()));
        gateway
            .expect_evaluate_answer()
            .times(1)
            .returning(|_| Ok(AnswerEvaluation::default()));

        let h = harness(
            gateway,
            TurnConfig {
                probe_budget: 0,
                ..TurnConfig::default()
            },
        );
        let (tx, _rx) = mpsc::channel(16);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();

        h.processor.process_audio("u1", vec![0]).await.unwrap();
        settle().await;
        let session = h.registry.get("u1").await.unwrap();
        let s = session.lock().await;
        assert_eq!(s.cursor(), 1);
        assert_eq!(s.probes_used, 0);
    }

    #[tokio::test]
    async fn full_answer_advances_and_background_scoring_pushes_metrics() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 3);
        soft_synthesis(&mut gateway);
        gateway.expect_transcribe().times(1).returning(|_| {
            Ok("I would start by reproducing the issue locally, then add targeted \
                logging around the failing path before changing anything"
                .to_string())
        });
        gateway.expect_evaluate_answer().times(1).returning(|_| {
            Ok(AnswerEvaluation {
                technical_score: 8.0,
                communication_score: 7.0,
                composite_score: 8.0,
                feedback: "Methodical approach".to_string(),
            })
        });

        let h = harness(gateway, TurnConfig::default());
        let (tx, mut rx) = mpsc::channel(16);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();
        drain(&mut rx);

        h.processor.process_audio("u1", vec![0]).await.unwrap();
        settle().await;

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::AiResponse { current_question: Some(q), question_index: Some(1), .. }
                if q == "Q1"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::LiveMetrics { question_index: 0, feedback, .. }
                if feedback == "Methodical approach"
        )));

        let session = h.registry.get("u1").await.unwrap();
        let s = session.lock().await;
        assert!(s.evaluations[0].finalized);
        assert!((s.cumulative_score - (0.7 * 5.0 + 0.3 * 8.0)).abs() < 1e-6);
    }

    #[tokio::test]
    async fn final_turn_closes_the_interview_and_schedules_the_report_once() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 1);
        soft_synthesis(&mut gateway);
        gateway.expect_transcribe().times(1).returning(|_| {
            Ok("My main strength is debugging distributed systems under pressure, \
                and I am working on delegating more instead of fixing everything myself"
                .to_string())
        });
        gateway
            .expect_evaluate_answer()
            .returning(|_| Ok(AnswerEvaluation::default()));

        let h = harness(gateway, TurnConfig::default());
        let (tx, mut rx) = mpsc::channel(16);
        h.processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();
        drain(&mut rx);

        h.processor.process_audio("u1", vec![0]).await.unwrap();

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::AiResponse { is_last: true, text, .. } if text.contains("complete")
        )));
        let session = h.registry.get("u1").await.unwrap();
        let mut s = session.lock().await;
        assert!(s.is_complete());
        assert!(!s.schedule_report(), "report must already be scheduled");
    }

    #[tokio::test]
    async fn open_circuit_degrades_the_turn_instead_of_crashing() {
        let mut gateway = MockInferenceClient::new();
        expect_plan(&mut gateway, 3);
        soft_synthesis(&mut gateway);
        gateway
            .expect_transcribe()
            .returning(|_| Err(anyhow!("service down")));

        let registry = Arc::new(SessionRegistry::new());
        let gateway: Arc<dyn InferenceClient> = Arc::new(gateway);
        // One failure trips the circuit, so the second turn sees it open.
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        }));
        let planner = Arc::new(AdaptiveQuestionPlanner::new(
            gateway.clone(),
            breaker.clone(),
            PlannerConfig::default(),
        ));
        let compiler = Arc::new(ReportCompiler::new(
            registry.clone(),
            gateway.clone(),
            breaker.clone(),
            Arc::new(MockReportStore::new()),
            Duration::from_secs(3),
        ));
        let health = Arc::new(HealthSnapshot::default());
        health.force_inference(true);
        let processor = TurnProcessor::new(
            registry.clone(),
            gateway,
            breaker,
            planner,
            compiler,
            health,
            TurnConfig::default(),
        );

        let (tx, mut rx) = mpsc::channel(16);
        processor
            .join("u1", &CandidateProfile::default(), SessionSettings::default(), tx)
            .await
            .unwrap();
        drain(&mut rx);

        // First turn: transcription error counts as garbled, retry prompt.
        processor.process_audio("u1", vec![0]).await.unwrap();
        // Second turn: the circuit is open, the turn degrades and advances.
        processor.process_audio("u1", vec![0]).await.unwrap();

        let session = registry.get("u1").await.unwrap();
        let s = session.lock().await;
        assert_eq!(s.cursor(), 1);
        assert_eq!(s.evaluations[0].answer, UNAVAILABLE_ANSWER);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::AiResponse { text, .. } if text.starts_with("Let's continue.")
        )));
    }
}
