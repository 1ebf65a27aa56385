//! Session state: the hub every component reads and mutates
//!
//! `SessionState` is owned by exactly one running task at a time. All
//! mutation goes through methods that enforce the session invariants:
//! monotonic round numbers, bounded rounds, phase-graph transitions, and
//! cost accounting that always sums to the total.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::persona::{Persona, PersonaCode};
use super::problem::{InformationGap, Problem, SubProblem, MAX_ROUNDS_HARD_CAP};
use super::{ContributionId, OwnerId, PhaseTag, SessionId, SubProblemId};

/// One persona turn in the debate. Append-only per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: ContributionId,
    pub persona_code: PersonaCode,
    pub round_number: u32,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub created_at: DateTime<Utc>,
    pub tokens: u64,
    pub cost: f64,
    pub phase_tag: PhaseTag,
}

/// How much new signal a round carried, which sets the summary budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InformationDensity {
    High,
    Low,
}

/// Background summary of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_number: u32,
    pub summary_text: String,
    /// 75 for low-density rounds, 150 for high-density rounds.
    pub target_tokens: u32,
    pub information_density: InformationDensity,
    pub created_at: DateTime<Utc>,
}

/// A persona's final position. Free-form: binary and strategy answers are
/// both valid; there is no enum of decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub persona_code: PersonaCode,
    pub recommendation_text: String,
    pub reasoning: String,
    /// 0.0..=1.0
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives_considered: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<String>,
}

/// Confidence bucket assigned by the synthesis call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// AI-synthesized aggregation of all persona recommendations. Produced by
/// a model call, never by tallying.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationAggregation {
    pub consensus_recommendation: String,
    pub confidence_level: ConfidenceLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub critical_conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_approaches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dissenting_views: Vec<String>,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPhase {
    Init,
    Decomposed,
    Selecting,
    Initial,
    Debating,
    Recommending,
    Synthesizing,
    Complete,
    Killed,
    Expired,
}

impl SessionPhase {
    /// Terminal phases accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Complete | SessionPhase::Killed | SessionPhase::Expired
        )
    }

    /// Forward edges of the lifecycle graph. Kills and expiry are allowed
    /// from any non-terminal phase; everything else follows the pipeline.
    /// Resume re-enters at the stored phase and is not a transition.
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, SessionPhase::Killed | SessionPhase::Expired) {
            return true;
        }
        matches!(
            (self, next),
            (SessionPhase::Init, SessionPhase::Decomposed)
                | (SessionPhase::Decomposed, SessionPhase::Selecting)
                | (SessionPhase::Selecting, SessionPhase::Initial)
                | (SessionPhase::Initial, SessionPhase::Debating)
                | (SessionPhase::Initial, SessionPhase::Recommending)
                | (SessionPhase::Debating, SessionPhase::Debating)
                | (SessionPhase::Debating, SessionPhase::Recommending)
                | (SessionPhase::Recommending, SessionPhase::Synthesizing)
                | (SessionPhase::Synthesizing, SessionPhase::Complete)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Init => "INIT",
            SessionPhase::Decomposed => "DECOMPOSED",
            SessionPhase::Selecting => "SELECTING",
            SessionPhase::Initial => "INITIAL",
            SessionPhase::Debating => "DEBATING",
            SessionPhase::Recommending => "RECOMMENDING",
            SessionPhase::Synthesizing => "SYNTHESIZING",
            SessionPhase::Complete => "COMPLETE",
            SessionPhase::Killed => "KILLED",
            SessionPhase::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts split the way the provider reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_write: u64,
    pub cache_read: u64,
}

impl TokenTotals {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_write + self.cache_read
    }
}

/// Cost, token, cache, and retry accounting for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_cost: f64,
    /// Keyed by `PhaseTag::as_key()`.
    pub phase_costs: HashMap<String, f64>,
    pub tokens: TokenTotals,
    /// Fraction of prompt tokens served from the provider cache.
    pub cache_hit_rate: f64,
    pub retry_count: u32,
    pub llm_calls: u64,
    pub duration_ms: u64,
}

impl SessionMetrics {
    /// Record one broker response against a phase. The only mutation path,
    /// which is what keeps `sum(phase_costs) == total_cost`.
    pub fn record_call(
        &mut self,
        phase: &PhaseTag,
        cost: f64,
        tokens: &TokenTotals,
        retries: u32,
    ) {
        self.total_cost += cost;
        *self.phase_costs.entry(phase.as_key()).or_insert(0.0) += cost;
        self.tokens.input += tokens.input;
        self.tokens.output += tokens.output;
        self.tokens.cache_write += tokens.cache_write;
        self.tokens.cache_read += tokens.cache_read;
        self.retry_count += retries;
        self.llm_calls += 1;

        let cacheable = self.tokens.input + self.tokens.cache_read + self.tokens.cache_write;
        self.cache_hit_rate = if cacheable == 0 {
            0.0
        } else {
            self.tokens.cache_read as f64 / cacheable as f64
        };
    }

    /// Mean cost of a single LLM call so far, used to budget synthesis
    /// after a cost stop.
    pub fn mean_call_cost(&self) -> f64 {
        if self.llm_calls == 0 {
            0.0
        } else {
            self.total_cost / self.llm_calls as f64
        }
    }

    /// Invariant: phase costs sum to the total within floating tolerance.
    pub fn cost_invariant_holds(&self) -> bool {
        let sum: f64 = self.phase_costs.values().sum();
        (sum - self.total_cost).abs() < 1e-6
    }
}

/// Why a safety layer asked the session to stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CostBudgetExceeded,
    SessionTimeout,
    MaxRoundsReached,
    RecursionLimitExceeded,
    KilledByUser,
    KilledByAdmin,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::CostBudgetExceeded => "cost_budget_exceeded",
            StopReason::SessionTimeout => "session_timeout",
            StopReason::MaxRoundsReached => "max_rounds_reached",
            StopReason::RecursionLimitExceeded => "recursion_limit_exceeded",
            StopReason::KilledByUser => "killed_by_user",
            StopReason::KilledByAdmin => "killed_by_admin",
        };
        f.write_str(s)
    }
}

/// Stop flags set by the safety subsystem, checked at node boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyFlags {
    pub should_stop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl SafetyFlags {
    pub fn stop(&mut self, reason: StopReason) {
        // First reason wins; later layers don't overwrite it.
        if !self.should_stop {
            self.should_stop = true;
            self.stop_reason = Some(reason);
        }
    }
}

/// Structured result of a finished deliberation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "code", content = "reason")]
pub enum ResultCode {
    Complete,
    TimedOut,
    CostExceeded,
    KilledByUser,
    KilledByAdmin,
    Failed(String),
}

/// The complete, serializable state of one deliberation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub owner_id: OwnerId,
    pub problem: Problem,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_problems: Vec<SubProblem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_sub_problem_id: Option<SubProblemId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub information_gaps: Vec<InformationGap>,
    /// User answers to CRITICAL INTERNAL gaps, keyed by question.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub internal_context: HashMap<String, String>,
    /// Research findings (or a recorded "research unavailable" marker).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub research_context: Vec<String>,
    /// Explicit research requests raised in contributions, not yet served.
    /// Kept in state so a checkpoint between rounds does not lose them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_research: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub personas: Vec<Persona>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributions: Vec<Contribution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub round_summaries: Vec<RoundSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<Recommendation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<RecommendationAggregation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_text: Option<String>,
    pub phase: SessionPhase,
    pub round_number: u32,
    pub max_rounds: u32,
    pub metrics: SessionMetrics,
    pub safety: SafetyFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_reason: Option<String>,
}

/// Errors raised when a mutation would violate a session invariant.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionStateError {
    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition {
        from: SessionPhase,
        to: SessionPhase,
    },

    #[error("session is in terminal phase {0}; no new contributions may be appended")]
    Terminal(SessionPhase),

    #[error("contribution round {contribution} exceeds session round {session}")]
    RoundAhead { contribution: u32, session: u32 },

    #[error("round {requested} exceeds max_rounds {max}")]
    RoundBudgetExceeded { requested: u32, max: u32 },
}

impl SessionState {
    pub fn new(owner_id: OwnerId, problem: Problem) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            owner_id,
            problem,
            sub_problems: Vec::new(),
            current_sub_problem_id: None,
            information_gaps: Vec::new(),
            internal_context: HashMap::new(),
            research_context: Vec::new(),
            pending_research: Vec::new(),
            personas: Vec::new(),
            contributions: Vec::new(),
            round_summaries: Vec::new(),
            recommendations: Vec::new(),
            aggregation: None,
            synthesis_text: None,
            phase: SessionPhase::Init,
            round_number: 0,
            max_rounds: 5,
            metrics: SessionMetrics::default(),
            safety: SafetyFlags::default(),
            created_at: now,
            updated_at: now,
            killed_at: None,
            kill_reason: None,
        }
    }

    /// Move to the next lifecycle phase, enforcing the phase graph.
    pub fn transition_to(&mut self, next: SessionPhase) -> Result<(), SessionStateError> {
        if !self.phase.can_transition_to(next) {
            return Err(SessionStateError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.touch();
        Ok(())
    }

    /// Mark the session killed, recording when and why.
    pub fn kill(&mut self, reason: impl Into<String>) -> Result<(), SessionStateError> {
        self.transition_to(SessionPhase::Killed)?;
        self.killed_at = Some(Utc::now());
        self.kill_reason = Some(reason.into());
        Ok(())
    }

    /// Advance the round counter. Monotonic and bounded by
    /// `min(max_rounds, MAX_ROUNDS_HARD_CAP)`.
    pub fn advance_round(&mut self) -> Result<u32, SessionStateError> {
        let next = self.round_number + 1;
        let bound = self.max_rounds.min(MAX_ROUNDS_HARD_CAP);
        if next > bound {
            return Err(SessionStateError::RoundBudgetExceeded {
                requested: next,
                max: bound,
            });
        }
        self.round_number = next;
        self.touch();
        Ok(next)
    }

    /// Set the round budget for the current sub-problem, clamped to the
    /// hard cap under any override.
    pub fn set_max_rounds(&mut self, max_rounds: u32) {
        self.max_rounds = max_rounds.clamp(1, MAX_ROUNDS_HARD_CAP);
        self.touch();
    }

    /// Append a contribution, enforcing round ordering and terminal-phase
    /// rejection.
    pub fn append_contribution(
        &mut self,
        contribution: Contribution,
    ) -> Result<(), SessionStateError> {
        if self.phase.is_terminal() {
            return Err(SessionStateError::Terminal(self.phase));
        }
        if contribution.round_number > self.round_number {
            return Err(SessionStateError::RoundAhead {
                contribution: contribution.round_number,
                session: self.round_number,
            });
        }
        self.contributions.push(contribution);
        self.touch();
        Ok(())
    }

    /// The sub-problem the debate is currently working.
    pub fn current_sub_problem(&self) -> Option<&SubProblem> {
        let id = self.current_sub_problem_id?;
        self.sub_problems.iter().find(|sp| sp.id == id)
    }

    /// Contributions for the current round, in append order.
    pub fn contributions_in_round(&self, round: u32) -> Vec<&Contribution> {
        self.contributions
            .iter()
            .filter(|c| c.round_number == round)
            .collect()
    }

    /// The last speaker, if anyone has contributed yet.
    pub fn last_speaker(&self) -> Option<&PersonaCode> {
        self.contributions.last().map(|c| &c.persona_code)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
