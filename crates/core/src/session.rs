//! In-memory state for one live interview session.
//!
//! The registry owns the session; the live connection is held only as an
//! mpsc sender that gets swapped on reconnect. All turn bookkeeping (cursor,
//! evaluations, probe budget, retry counters) lives here, and the mutation
//! API is shaped so background tasks communicate results back by index
//! rather than holding references across await points.

use crate::ClientEvent;
use crate::inference::AnswerEvaluation;
use crate::plan::{Difficulty, Persona, QuestionSpec};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

// EWMA decay for the rolling performance score: 70% old, 30% new.
const SCORE_DECAY_OLD: f32 = 0.7;
const SCORE_DECAY_NEW: f32 = 0.3;
/// Neutral midpoint on the 1-10 scale; the score every session starts from.
pub const NEUTRAL_SCORE: f32 = 5.0;

/// Per-turn result, appended once per consumed plan entry. Recorded first as
/// a provisional placeholder so the live loop never waits on scoring, then
/// finalized in place when the background evaluation lands.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRecord {
    pub question: String,
    pub answer: String,
    pub evaluation: AnswerEvaluation,
    /// True once a real evaluation has overwritten the placeholder. A
    /// finalized record is never re-applied, which keeps duplicate
    /// deliveries of the same background result idempotent.
    pub finalized: bool,
}

/// Proctoring/integrity event, appended independently of evaluations and
/// carried into the final report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringEvent {
    pub kind: String,
    #[serde(default)]
    pub detail: String,
    pub timestamp_ms: u64,
}

/// Immutable per-session settings captured at join time.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub persona: Persona,
    pub difficulty: Difficulty,
    pub topic: String,
    pub candidate_name: String,
    pub resume_text: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            persona: Persona::FriendlyMentor,
            difficulty: Difficulty::Medium,
            topic: "General".to_string(),
            candidate_name: "there".to_string(),
            resume_text: String::new(),
        }
    }
}

pub struct InterviewSession {
    pub user_key: String,
    pub settings: SessionSettings,
    conn: Option<mpsc::Sender<ClientEvent>>,
    pub plan: Vec<QuestionSpec>,
    /// Index of the question currently in play. Monotonically increasing,
    /// never exceeds `plan.len()`; the session is complete at equality.
    cursor: usize,
    pub evaluations: Vec<EvaluationRecord>,
    pub cumulative_score: f32,
    pub probes_used: u32,
    /// Whether the current turn is a probe retry rather than a plan advance.
    pub is_probing: bool,
    /// Consecutive empty/short transcriptions for the current turn.
    pub transcription_retries: u32,
    pub monitoring_log: Vec<MonitoringEvent>,
    last_activity: Instant,
    /// Set when report compilation has been scheduled, so completion of a
    /// resumed or duplicate final turn cannot trigger a second report.
    report_scheduled: bool,
}

impl InterviewSession {
    pub fn new(
        user_key: impl Into<String>,
        plan: Vec<QuestionSpec>,
        settings: SessionSettings,
        conn: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self {
            user_key: user_key.into(),
            settings,
            conn: Some(conn),
            plan,
            cursor: 0,
            evaluations: Vec::new(),
            cumulative_score: NEUTRAL_SCORE,
            probes_used: 0,
            is_probing: false,
            transcription_retries: 0,
            monitoring_log: Vec::new(),
            last_activity: Instant::now(),
            report_scheduled: false,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_complete(&self) -> bool {
        self.cursor == self.plan.len()
    }

    pub fn current_question(&self) -> Option<&QuestionSpec> {
        self.plan.get(self.cursor)
    }

    /// Swaps in a new connection handle, preserving all other state. Used on
    /// reconnect and on duplicate start messages.
    pub fn attach(&mut self, conn: mpsc::Sender<ClientEvent>) {
        self.conn = Some(conn);
        self.touch();
    }

    pub fn detach(&mut self) {
        self.conn = None;
    }

    /// The currently attached connection, if any. Cloned out so callers can
    /// send without holding the session lock across the await.
    pub fn sender(&self) -> Option<mpsc::Sender<ClientEvent>> {
        self.conn.clone()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> tokio::time::Duration {
        self.last_activity.elapsed()
    }

    /// Records the answer for the question at the cursor with a provisional
    /// neutral evaluation and advances the cursor. Returns the turn index
    /// the background scorer must apply its result to.
    pub fn record_answer(&mut self, answer: String) -> usize {
        debug_assert!(self.cursor < self.plan.len());
        let question = self
            .current_question()
            .map(|q| q.text.clone())
            .unwrap_or_default();
        self.evaluations.push(EvaluationRecord {
            question,
            answer,
            evaluation: AnswerEvaluation::default(),
            finalized: false,
        });
        let index = self.cursor;
        self.cursor += 1;
        self.touch();
        index
    }

    /// Applies a background evaluation to its own turn index. Returns false
    /// (and changes nothing) if the index is unknown or already finalized,
    /// so late and duplicate arrivals are safe by construction.
    pub fn apply_evaluation(&mut self, index: usize, evaluation: AnswerEvaluation) -> bool {
        match self.evaluations.get_mut(index) {
            Some(record) if !record.finalized => {
                self.cumulative_score = SCORE_DECAY_OLD * self.cumulative_score
                    + SCORE_DECAY_NEW * evaluation.composite_score;
                record.evaluation = evaluation;
                record.finalized = true;
                true
            }
            _ => false,
        }
    }

    /// Replaces a not-yet-reached plan entry. Returns false if the cursor
    /// has already caught up to the slot, in which case the replacement is
    /// discarded and the original question stands.
    pub fn replace_upcoming_question(&mut self, slot: usize, question: QuestionSpec) -> bool {
        if slot > self.cursor && slot < self.plan.len() {
            self.plan[slot] = question;
            true
        } else {
            false
        }
    }

    pub fn record_monitoring_event(&mut self, event: MonitoringEvent) {
        self.monitoring_log.push(event);
    }

    /// Marks report compilation as scheduled. Returns false if it already
    /// was, so the report is compiled exactly once.
    pub fn schedule_report(&mut self) -> bool {
        if self.report_scheduled {
            false
        } else {
            self.report_scheduled = true;
            true
        }
    }
}
