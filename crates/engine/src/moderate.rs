//! Moderator interventions
//!
//! Three transient moderator flavors break dysfunctional debate patterns.
//! A moderator is invoked only by the facilitator, receives the detected
//! issue as context, and is tracked per sub-problem so the same flavor is
//! not re-invoked trivially.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::broker::{LlmBroker, LlmRequest, LlmResponse, SystemSegment};
use crate::context::{discussion_window, shared_preamble};
use crate::types::{EngineError, ModelRole, PhaseTag, SessionState, SubProblemId};
use crate::xmlout::parse_contribution;

/// Debate dysfunction detected by the facilitator's quality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    PrematureConsensus,
    UnverifiedClaims,
    NegativitySpiral,
    CircularArguments,
}

/// Moderator flavor, each with a distinct system role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeratorKind {
    Contrarian,
    Skeptic,
    Optimist,
}

impl ModeratorKind {
    /// Detected issue → moderator flavor.
    pub fn for_issue(issue: QualityIssue) -> Self {
        match issue {
            QualityIssue::PrematureConsensus => ModeratorKind::Contrarian,
            QualityIssue::UnverifiedClaims => ModeratorKind::Skeptic,
            QualityIssue::NegativitySpiral => ModeratorKind::Optimist,
            QualityIssue::CircularArguments => ModeratorKind::Contrarian,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModeratorKind::Contrarian => "contrarian",
            ModeratorKind::Skeptic => "skeptic",
            ModeratorKind::Optimist => "optimist",
        }
    }

    fn system_role(&self) -> &'static str {
        match self {
            ModeratorKind::Contrarian => {
                "You are a contrarian moderator joining an advisory debate. The board is \
                 converging too comfortably or circling the same ground. Your job is to \
                 argue the strongest version of the position nobody is defending, name \
                 the assumption everyone is sharing without proof, and force the board \
                 to engage with it."
            }
            ModeratorKind::Skeptic => {
                "You are a skeptical moderator joining an advisory debate. Claims have \
                 been made without evidence. Your job is to list the specific unverified \
                 claims the board is relying on, say what evidence would settle each, \
                 and refuse to let confident language stand in for data."
            }
            ModeratorKind::Optimist => {
                "You are an optimistic moderator joining an advisory debate. The board \
                 has spiraled into risk enumeration. Your job is to restate the genuine \
                 upside of the options on the table, identify which named risks are \
                 actually manageable, and pull the discussion back to what success \
                 would look like."
            }
        }
    }
}

impl std::fmt::Display for ModeratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A moderator turn ready to append to the debate.
#[derive(Debug, Clone)]
pub struct ModeratorTurn {
    pub kind: ModeratorKind,
    pub content: String,
    pub thinking: Option<String>,
    pub response: LlmResponse,
}

/// Moderator stage with per-sub-problem invocation tracking.
pub struct Moderator {
    broker: LlmBroker,
    invoked: DashMap<SubProblemId, HashSet<ModeratorKind>>,
}

impl Moderator {
    pub fn new(broker: LlmBroker) -> Self {
        Self {
            broker,
            invoked: DashMap::new(),
        }
    }

    /// Whether this flavor has already intervened on this sub-problem.
    pub fn already_invoked(&self, sub_problem: SubProblemId, kind: ModeratorKind) -> bool {
        self.invoked
            .get(&sub_problem)
            .is_some_and(|kinds| kinds.contains(&kind))
    }

    /// Run one intervention. The detected issue travels into the prompt so
    /// the moderator knows why it was called.
    pub async fn intervene(
        &self,
        state: &SessionState,
        kind: ModeratorKind,
        reason: &str,
    ) -> Result<ModeratorTurn, EngineError> {
        let request = LlmRequest::new(
            ModelRole::Moderator,
            PhaseTag::ModeratorIntervention,
            format!("moderator_{}", kind),
        )
        .with_system(vec![
            SystemSegment::cached(shared_preamble(state)),
            SystemSegment::plain(kind.system_role()),
        ])
        .with_user(format!(
            "The facilitator invoked you because: {}\n\nDiscussion so far:\n{}\n\
             Intervene now, in one focused turn.",
            reason,
            discussion_window(state)
        ))
        .with_temperature(0.8)
        .with_max_tokens(1024);

        let response = self.broker.call(request).await?;
        let parsed = parse_contribution(&response.content);

        if let Some(sp) = state.current_sub_problem_id {
            self.invoked.entry(sp).or_default().insert(kind);
        }

        Ok(ModeratorTurn {
            kind,
            content: parsed.contribution,
            thinking: parsed.thinking,
            response,
        })
    }
}
