//! Core types and data structures for the deliberation engine

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod persona;
pub mod problem;
pub mod session;

pub use error::*;
pub use persona::*;
pub use problem::*;
pub use session::*;

/// Unique identifier for deliberation sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Unique identifier for contributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContributionId(pub Uuid);

impl ContributionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContributionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContributionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for sub-problems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubProblemId(pub Uuid);

impl SubProblemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubProblemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubProblemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identity bound to a session at creation.
///
/// Every user-scoped mutation is checked against the owner recorded on the
/// session; admin operations bypass the check but are audit-logged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Logical model role resolved to a concrete model id by the broker.
///
/// Higher-capability roles drive the debate; cheaper roles handle
/// summarization, moderation, research validation, and synthesis scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Persona,
    Facilitator,
    Decomposer,
    Selector,
    Summarizer,
    Moderator,
    Researcher,
    Validator,
}

impl ModelRole {
    /// All roles, in a stable order.
    pub const ALL: [ModelRole; 8] = [
        ModelRole::Persona,
        ModelRole::Facilitator,
        ModelRole::Decomposer,
        ModelRole::Selector,
        ModelRole::Summarizer,
        ModelRole::Moderator,
        ModelRole::Researcher,
        ModelRole::Validator,
    ];

    /// Whether this role defaults to the higher-capability model tier.
    pub fn is_capable_tier(&self) -> bool {
        matches!(
            self,
            ModelRole::Persona | ModelRole::Facilitator | ModelRole::Decomposer | ModelRole::Selector
        )
    }

    /// Case-insensitive parse, used for `MODEL_FOR_ROLE__<ROLE>` overrides.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "persona" => Some(ModelRole::Persona),
            "facilitator" => Some(ModelRole::Facilitator),
            "decomposer" => Some(ModelRole::Decomposer),
            "selector" => Some(ModelRole::Selector),
            "summarizer" => Some(ModelRole::Summarizer),
            "moderator" => Some(ModelRole::Moderator),
            "researcher" => Some(ModelRole::Researcher),
            "validator" => Some(ModelRole::Validator),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Persona => "persona",
            ModelRole::Facilitator => "facilitator",
            ModelRole::Decomposer => "decomposer",
            ModelRole::Selector => "selector",
            ModelRole::Summarizer => "summarizer",
            ModelRole::Moderator => "moderator",
            ModelRole::Researcher => "researcher",
            ModelRole::Validator => "validator",
        }
    }
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cost-accounting phase a broker call is attributed to.
///
/// Serialized to a stable string key so per-phase aggregation survives
/// round trips through the state store and the JSON export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "round")]
pub enum PhaseTag {
    Decomposition,
    Selection,
    InitialRound,
    RoundDeliberation(u32),
    ModeratorIntervention,
    Research,
    Recommending,
    Synthesis,
}

impl PhaseTag {
    /// Stable string key for metrics maps and checkpoint names.
    pub fn as_key(&self) -> String {
        match self {
            PhaseTag::Decomposition => "decomposition".to_string(),
            PhaseTag::Selection => "selection".to_string(),
            PhaseTag::InitialRound => "initial_round".to_string(),
            PhaseTag::RoundDeliberation(n) => format!("round_{}_deliberation", n),
            PhaseTag::ModeratorIntervention => "moderator_intervention".to_string(),
            PhaseTag::Research => "research".to_string(),
            PhaseTag::Recommending => "recommending".to_string(),
            PhaseTag::Synthesis => "synthesis".to_string(),
        }
    }
}

impl std::fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_key())
    }
}
