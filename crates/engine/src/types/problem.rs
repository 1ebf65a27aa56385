//! Problem decomposition data model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SubProblemId;

/// Absolute ceiling on deliberation rounds, regardless of complexity or
/// any configuration override.
pub const MAX_ROUNDS_HARD_CAP: u32 = 15;

/// The user's confirmed decision problem. Immutable once confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub id: Uuid,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
}

impl Problem {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            context: None,
            constraints: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// A scoped decision question with its own complexity and deliberation loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubProblem {
    pub id: SubProblemId,
    pub goal: String,
    pub context: String,
    /// 1..=10; drives the round budget.
    pub complexity_score: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<SubProblemId>,
}

impl SubProblem {
    pub fn new(goal: impl Into<String>, context: impl Into<String>, complexity_score: u8) -> Self {
        Self {
            id: SubProblemId::new(),
            goal: goal.into(),
            context: context.into(),
            complexity_score: complexity_score.clamp(1, 10),
            dependencies: Vec::new(),
        }
    }

    /// Round budget derived from complexity: 1–3 → 5, 4–6 → 7, 7–10 → 10.
    /// Never exceeds [`MAX_ROUNDS_HARD_CAP`].
    pub fn max_rounds(&self) -> u32 {
        let rounds = match self.complexity_score {
            0..=3 => 5,
            4..=6 => 7,
            _ => 10,
        };
        rounds.min(MAX_ROUNDS_HARD_CAP)
    }
}

/// Where a missing piece of information has to come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapCategory {
    /// Only the user can answer; collected at a checkpoint.
    Internal,
    /// Answerable by outside research.
    External,
}

/// How badly the deliberation needs the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapPriority {
    /// Deliberation pauses until answered.
    Critical,
    /// Deferred or skipped.
    NiceToHave,
}

/// A question the decomposer could not answer from the problem statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InformationGap {
    pub question: String,
    pub category: GapCategory,
    pub priority: GapPriority,
}

impl InformationGap {
    pub fn new(question: impl Into<String>, category: GapCategory, priority: GapPriority) -> Self {
        Self {
            question: question.into(),
            category,
            priority,
        }
    }

    /// True for the gaps that block the graph at the context checkpoint.
    pub fn blocks_deliberation(&self) -> bool {
        self.category == GapCategory::Internal && self.priority == GapPriority::Critical
    }
}
