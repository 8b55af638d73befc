use serde::{Deserialize, Serialize};

/// Difficulty band attached to a question, and requested from the generation
/// capability when the planner rewrites upcoming questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Difficulty::Easy => write!(f, "Easy"),
            Difficulty::Medium => write!(f, "Medium"),
            Difficulty::Hard => write!(f, "Hard"),
        }
    }
}

/// Interviewer persona, used for speech synthesis voice selection and for
/// flavoring the opening greeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Persona {
    FriendlyMentor,
    StrictLead,
    StressTester,
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Persona::FriendlyMentor => write!(f, "Friendly Mentor"),
            Persona::StrictLead => write!(f, "Strict Lead"),
            Persona::StressTester => write!(f, "Stress Tester"),
        }
    }
}

/// One entry in a session's interview plan. The planner may rewrite entries
/// the candidate has not yet reached; consumed entries are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub text: String,
    pub category: String,
    pub difficulty: Difficulty,
    /// Hint for the evaluator about how much depth a strong answer carries.
    pub expected_depth: String,
    /// Seed prompts for follow-up probing on this question.
    #[serde(default)]
    pub followup_seeds: Vec<String>,
}

impl QuestionSpec {
    /// Wraps bare question text with neutral metadata. Used when the
    /// generation capability returns plain strings or when building the
    /// local fallback plan.
    pub fn plain(text: impl Into<String>, category: &str, difficulty: Difficulty) -> Self {
        Self {
            text: text.into(),
            category: category.to_string(),
            difficulty,
            expected_depth: "Moderate".to_string(),
            followup_seeds: Vec::new(),
        }
    }
}

/// What the orchestrator knows about the candidate at join time. All fields
/// are optional; an empty profile still yields a usable fallback plan.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidateProfile {
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub job_role: Option<String>,
    #[serde(default)]
    pub target_company: Option<String>,
    #[serde(default)]
    pub resume_text: Option<String>,
}

impl CandidateProfile {
    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or("there")
    }
}

const GENERIC_QUESTIONS: &[&str] = &[
    "What is your approach to debugging complex issues in production?",
    "Describe a situation where you had to learn a new technology quickly. How did you approach it?",
    "Can you walk me through how you would design a scalable web application from scratch?",
    "What's the most challenging technical problem you've solved? Walk me through your approach.",
    "How do you handle disagreements with team members about technical decisions?",
    "Tell me about a project that failed or didn't go as planned. What did you learn?",
    "If you had to refactor a legacy codebase, how would you plan and execute it?",
    "Describe your understanding of system design principles and trade-offs.",
    "What are your strengths and areas where you'd like to improve as a developer?",
];

/// Builds an interview plan locally from the candidate profile, used when the
/// external generation capability is unreachable or returns nothing. Prefers
/// profile-specific questions (skills, projects, target company) and tops up
/// with generic ones.
pub fn fallback_plan(
    profile: &CandidateProfile,
    topic: &str,
    difficulty: Difficulty,
    count: usize,
) -> Vec<QuestionSpec> {
    let mut plan: Vec<QuestionSpec> = Vec::with_capacity(count);
    let role = profile.job_role.as_deref().unwrap_or("Software Engineer");

    for skill in profile.skills.iter().take(3.min(count)) {
        plan.push(QuestionSpec::plain(
            format!(
                "Can you explain your experience with {skill} and how you've used it in your projects?"
            ),
            topic,
            difficulty,
        ));
    }

    for project in profile.projects.iter().take(2) {
        if plan.len() >= count {
            break;
        }
        plan.push(QuestionSpec::plain(
            format!(
                "Tell me about {project}. What was your role, what challenges did you face, and how did you solve them?"
            ),
            topic,
            difficulty,
        ));
    }

    if let Some(company) = profile.target_company.as_deref() {
        if !company.is_empty() && plan.len() < count {
            plan.push(QuestionSpec::plain(
                format!(
                    "Why do you want to work at {company}, and what makes you a good fit for a {role} role there?"
                ),
                topic,
                difficulty,
            ));
        }
    }

    let mut generic = GENERIC_QUESTIONS.iter();
    while plan.len() < count {
        match generic.next() {
            Some(q) => plan.push(QuestionSpec::plain(*q, "general", difficulty)),
            None => break,
        }
    }
    plan.truncate(count);
    plan
}
