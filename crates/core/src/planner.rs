//! Adaptive question planning.
//!
//! After each background evaluation lands, the planner looks at the rolling
//! performance score and, when the candidate is clearly struggling or
//! excelling, asks the generation capability for one replacement question
//! biased the opposite way. The replacement targets the next plan slot whose
//! text has not yet been spoken, and is applied only if the candidate still
//! has not reached that slot by the time the asynchronous result arrives.
//! This is a best-effort optimization: any failure leaves the plan untouched.

use crate::breaker::CircuitBreaker;
use crate::inference::{InferenceClient, QuestionRequest};
use crate::plan::Difficulty;
use crate::registry::SessionRegistry;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Below this rolling score the candidate counts as struggling.
    pub struggling_below: f32,
    /// Above this rolling score the candidate counts as excelling.
    pub excelling_above: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            struggling_below: 4.5,
            excelling_above: 8.5,
        }
    }
}

pub struct AdaptiveQuestionPlanner {
    gateway: Arc<dyn InferenceClient>,
    breaker: Arc<CircuitBreaker>,
    config: PlannerConfig,
}

impl AdaptiveQuestionPlanner {
    pub fn new(
        gateway: Arc<dyn InferenceClient>,
        breaker: Arc<CircuitBreaker>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            gateway,
            breaker,
            config,
        }
    }

    /// Considers rewriting the next unreached question for `user_key`.
    /// Called from the background scoring task after an evaluation applies;
    /// never retried within the same turn.
    pub async fn maybe_adjust(&self, registry: &SessionRegistry, user_key: &str) {
        let Some(session) = registry.get(user_key).await else {
            return;
        };

        let (difficulty, rationale, target, request) = {
            let s = session.lock().await;
            let score = s.cumulative_score;
            let (difficulty, direction) = if score < self.config.struggling_below {
                (Difficulty::Easy, "struggling")
            } else if score > self.config.excelling_above {
                (Difficulty::Hard, "excelling")
            } else {
                return;
            };

            // The question at the cursor has already been spoken; the first
            // rewritable slot is the one after it.
            let target = s.cursor() + 1;
            if target >= s.plan.len() {
                return;
            }

            let rationale = format!(
                "ROLLING_SCORE: {score:.1}, REASON: candidate is {direction}, {}",
                match difficulty {
                    Difficulty::Easy => "simplify toward fundamentals",
                    _ => "challenge with deeper depth",
                }
            );
            let request = QuestionRequest {
                resume_text: s.settings.resume_text.clone(),
                count: 1,
                difficulty,
                topic: s.settings.topic.clone(),
                context: Some(rationale.clone()),
            };
            (difficulty, rationale, target, request)
        };

        tracing::info!(user = user_key, target, %difficulty, %rationale, "Adjusting upcoming question");

        let result = self
            .breaker
            .execute(|| async { self.gateway.generate_questions(request).await })
            .await;
        match result {
            Ok(mut questions) if !questions.is_empty() => {
                let replacement = questions.remove(0);
                let mut s = session.lock().await;
                if s.replace_upcoming_question(target, replacement) {
                    tracing::info!(user = user_key, target, "Upcoming question replaced");
                } else {
                    tracing::debug!(
                        user = user_key,
                        target,
                        "Replacement arrived late, discarded"
                    );
                }
            }
            Ok(_) => {
                tracing::debug!(user = user_key, "Generator returned no replacement");
            }
            Err(e) => {
                // Best effort only: the original question stays in place.
                tracing::warn!(user = user_key, "Failed to adjust question: {e:?}");
            }
        }
    }
}
