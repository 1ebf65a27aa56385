//! Convergence, novelty, and drift scoring
//!
//! Runs after every contribution. Semantic convergence is the mean
//! pairwise cosine similarity of the last six contribution embeddings;
//! novelty is one minus the newest contribution's maximum similarity to
//! anything said before it; drift is the newest contribution's similarity
//! to the current sub-problem goal. All thresholds are configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::embedding::{cosine_similarity, max_similarity, mean_pairwise_similarity, EmbeddingClient};
use crate::types::{EngineError, SessionState};

/// Contributions included in the convergence window.
pub const CONVERGENCE_WINDOW: usize = 6;

/// Rounds that must elapse before an early stop is allowed. Scaled down
/// for small round budgets so an atomic question can still stop early.
pub const MIN_ROUNDS_FOR_STOP: u32 = 5;

/// Effective early-stop floor for a session: the global floor, but always
/// strictly inside the round budget.
pub fn stop_floor(max_rounds: u32) -> u32 {
    MIN_ROUNDS_FOR_STOP
        .min(max_rounds.saturating_sub(1))
        .max(1)
}

/// The three scalars computed per check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSignals {
    pub convergence: f64,
    pub novelty: f64,
    pub drift: f64,
}

/// What the check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceVerdict {
    /// Keep debating.
    Continue,
    /// Consensus: converged, nothing new, enough rounds behind us.
    Stop,
    /// The debate has wandered; inject a facilitator refocus.
    Redirect,
}

/// Convergence checker bound to an embedding client and thresholds.
pub struct ConvergenceChecker {
    embeddings: Arc<dyn EmbeddingClient>,
    convergence_threshold: f64,
    novelty_threshold: f64,
    drift_threshold: f64,
}

impl ConvergenceChecker {
    pub fn new(embeddings: Arc<dyn EmbeddingClient>, config: &EngineConfig) -> Self {
        Self {
            embeddings,
            convergence_threshold: config.convergence_threshold,
            novelty_threshold: config.novelty_threshold,
            drift_threshold: config.drift_threshold,
        }
    }

    /// Score the debate and produce a verdict.
    pub async fn check(
        &self,
        state: &SessionState,
    ) -> Result<(ConvergenceSignals, ConvergenceVerdict), EngineError> {
        let contents: Vec<String> = state
            .contributions
            .iter()
            .map(|c| c.content.clone())
            .collect();

        if contents.is_empty() {
            return Ok((
                ConvergenceSignals {
                    convergence: 0.0,
                    novelty: 1.0,
                    drift: 1.0,
                },
                ConvergenceVerdict::Continue,
            ));
        }

        let goal = state
            .current_sub_problem()
            .map(|sp| sp.goal.clone())
            .unwrap_or_else(|| state.problem.description.clone());

        // One batch: every contribution plus the goal. The embedding cache
        // makes re-scoring earlier contributions free.
        let mut batch = contents.clone();
        batch.push(goal);
        let mut vectors = self.embeddings.embed(&batch).await?;
        let goal_vector = vectors.pop().expect("goal vector present");

        let window_start = vectors.len().saturating_sub(CONVERGENCE_WINDOW);
        let convergence = mean_pairwise_similarity(&vectors[window_start..]);

        let newest = vectors.last().expect("at least one contribution");
        let priors = &vectors[..vectors.len() - 1];
        let novelty = if priors.is_empty() {
            1.0
        } else {
            (1.0 - max_similarity(newest, priors)).clamp(0.0, 1.0)
        };

        let drift = cosine_similarity(newest, &goal_vector);

        let signals = ConvergenceSignals {
            convergence,
            novelty,
            drift,
        };

        let verdict = if convergence > self.convergence_threshold
            && novelty < self.novelty_threshold
            && state.round_number >= stop_floor(state.max_rounds)
        {
            ConvergenceVerdict::Stop
        } else if drift < self.drift_threshold {
            ConvergenceVerdict::Redirect
        } else {
            ConvergenceVerdict::Continue
        };

        tracing::debug!(
            "convergence check: convergence={:.3} novelty={:.3} drift={:.3} → {:?}",
            signals.convergence,
            signals.novelty,
            signals.drift,
            verdict
        );
        Ok((signals, verdict))
    }

    /// Conflict floor for deadlock detection: far below the convergence
    /// threshold means positions are actively opposed.
    pub fn is_high_conflict(&self, signals: &ConvergenceSignals) -> bool {
        signals.convergence < (self.convergence_threshold - 0.35)
    }
}
