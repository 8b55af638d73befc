//! Final report compilation and persistence.
//!
//! Runs once per session, off the live turn path, a short grace delay after
//! the plan is exhausted so in-flight background scorings from the last
//! turns can land first. If the narrative capability is unreachable the
//! compiler still persists a degraded report built from locally-known
//! scores: the candidate always gets closure, never an indefinite
//! "generating" state.

use crate::ClientEvent;
use crate::breaker::CircuitBreaker;
use crate::inference::{
    InferenceClient, QuestionFeedback, ReportNarrative, ReportRequest, ScoreBreakdown,
};
use crate::plan::Persona;
use crate::registry::SessionRegistry;
use crate::session::{EvaluationRecord, MonitoringEvent};
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// The persisted report record, keyed by user identity in the external
/// durable store.
#[derive(Debug, Clone, Serialize)]
pub struct InterviewReport {
    pub user_key: String,
    pub topic: String,
    pub persona: Persona,
    pub overall_score: f32,
    pub readiness_level: String,
    pub summary: String,
    pub scores: ScoreBreakdown,
    pub question_feedback: Vec<QuestionFeedback>,
    pub improvement_tips: Vec<String>,
    pub evaluations: Vec<EvaluationRecord>,
    pub monitoring_log: Vec<MonitoringEvent>,
    /// True when the narrative capability was unreachable and the report was
    /// assembled from local scores only.
    pub degraded: bool,
}

/// External durable store for finished reports. The orchestrator only knows
/// the fields it writes and the opaque id it gets back.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn save(&self, report: InterviewReport) -> Result<String>;
}

/// `ReportStore` backed by the persistence service's HTTP API.
pub struct HttpReportStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReportStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct SaveOut {
    report_id: String,
}

#[async_trait]
impl ReportStore for HttpReportStore {
    async fn save(&self, report: InterviewReport) -> Result<String> {
        use anyhow::Context;
        let out: SaveOut = self
            .client
            .post(format!("{}/reports", self.base_url.trim_end_matches('/')))
            .json(&report)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("Report persistence request failed")?
            .error_for_status()
            .context("Report persistence returned an error status")?
            .json()
            .await
            .context("Failed to decode report persistence response")?;
        Ok(out.report_id)
    }
}

pub struct ReportCompiler {
    registry: Arc<SessionRegistry>,
    gateway: Arc<dyn InferenceClient>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<dyn ReportStore>,
    /// Delay between plan exhaustion and compilation, giving in-flight
    /// background scorings time to land.
    grace: Duration,
}

impl ReportCompiler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        gateway: Arc<dyn InferenceClient>,
        breaker: Arc<CircuitBreaker>,
        store: Arc<dyn ReportStore>,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            gateway,
            breaker,
            store,
            grace,
        }
    }

    /// Schedules compilation for a completed session. Fire-and-forget; all
    /// failures are contained within the spawned task.
    pub fn schedule(self: &Arc<Self>, user_key: String) {
        let compiler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(compiler.grace).await;
            compiler.compile(&user_key).await;
        });
    }

    pub async fn compile(&self, user_key: &str) {
        let Some(session) = self.registry.get(user_key).await else {
            return;
        };

        let (request, cumulative_score) = {
            let s = session.lock().await;
            (
                ReportRequest {
                    evaluations: s.evaluations.clone(),
                    monitoring_log: s.monitoring_log.clone(),
                    topic: s.settings.topic.clone(),
                    persona: s.settings.persona,
                },
                s.cumulative_score,
            )
        };

        let report = match self
            .breaker
            .execute(|| async { self.gateway.compile_report(request.clone()).await })
            .await
        {
            Ok(narrative) => Self::from_narrative(user_key, &request, narrative),
            Err(e) => {
                tracing::warn!(
                    user = user_key,
                    "Report narration unavailable, assembling degraded report: {e:?}"
                );
                Self::degraded(user_key, &request, cumulative_score)
            }
        };

        let sender = session.lock().await.sender();
        match self.store.save(report).await {
            Ok(report_id) => {
                tracing::info!(user = user_key, report_id, "Report persisted");
                if let Some(tx) = sender {
                    let _ = tx.send(ClientEvent::ReportReady { report_id }).await;
                }
                self.registry.remove(user_key).await;
            }
            Err(e) => {
                // The session stays registered; the idle sweep reclaims it.
                tracing::error!(user = user_key, "Failed to persist report: {e:?}");
                if let Some(tx) = sender {
                    let _ = tx
                        .send(ClientEvent::spoken(
                            "Interview complete! Report generation is taking a moment.",
                            "",
                        ))
                        .await;
                }
            }
        }
    }

    fn from_narrative(
        user_key: &str,
        request: &ReportRequest,
        narrative: ReportNarrative,
    ) -> InterviewReport {
        InterviewReport {
            user_key: user_key.to_string(),
            topic: request.topic.clone(),
            persona: request.persona,
            overall_score: narrative.overall_score,
            readiness_level: narrative.readiness_level,
            summary: narrative.summary,
            scores: narrative.scores,
            question_feedback: narrative.question_feedback,
            improvement_tips: narrative.improvement_tips,
            evaluations: request.evaluations.clone(),
            monitoring_log: request.monitoring_log.clone(),
            degraded: false,
        }
    }

    /// Report built purely from locally-known scores, used when the
    /// narrative capability is unreachable.
    fn degraded(user_key: &str, request: &ReportRequest, cumulative_score: f32) -> InterviewReport {
        let finals: Vec<f32> = request
            .evaluations
            .iter()
            .map(|e| e.evaluation.composite_score)
            .collect();
        let overall = if finals.is_empty() {
            cumulative_score
        } else {
            finals.iter().sum::<f32>() / finals.len() as f32
        };
        let technical = average(request.evaluations.iter().map(|e| e.evaluation.technical_score));
        let communication =
            average(request.evaluations.iter().map(|e| e.evaluation.communication_score));

        InterviewReport {
            user_key: user_key.to_string(),
            topic: request.topic.clone(),
            persona: request.persona,
            overall_score: overall,
            readiness_level: "Developing".to_string(),
            summary: "Interview completed. Detailed narrative feedback was unavailable; \
                      scores reflect the per-question evaluations recorded during the session."
                .to_string(),
            scores: ScoreBreakdown {
                technical,
                communication,
                confidence: cumulative_score,
            },
            question_feedback: request
                .evaluations
                .iter()
                .map(|e| QuestionFeedback {
                    question: e.question.clone(),
                    feedback: e.evaluation.feedback.clone(),
                })
                .collect(),
            improvement_tips: Vec::new(),
            evaluations: request.evaluations.clone(),
            monitoring_log: request.monitoring_log.clone(),
            degraded: true,
        }
    }
}

fn average(scores: impl Iterator<Item = f32>) -> f32 {
    let collected: Vec<f32> = scores.collect();
    if collected.is_empty() {
        crate::session::NEUTRAL_SCORE
    } else {
        collected.iter().sum::<f32>() / collected.len() as f32
    }
}
