//! Cost and token reporting
//!
//! Rolls a session's per-call accounting into the report shape the
//! exports ship: totals plus a deterministic per-phase breakdown.

use serde::{Deserialize, Serialize};

use crate::types::{SessionState, TokenTotals};

/// One phase row in the breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCost {
    pub phase: String,
    pub cost: f64,
    /// Share of total cost, 0.0 when the session cost nothing.
    pub share: f64,
}

/// The aggregate metrics report for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub total_cost: f64,
    pub phases: Vec<PhaseCost>,
    pub tokens: TokenTotals,
    pub cache_hit_rate: f64,
    pub retry_count: u32,
    pub llm_calls: u64,
    pub duration_ms: u64,
}

impl MetricsReport {
    /// Build the report. Phases are ordered by descending cost, ties by
    /// name, so repeated exports of the same session are identical.
    pub fn from_state(state: &SessionState) -> Self {
        let metrics = &state.metrics;
        let mut phases: Vec<PhaseCost> = metrics
            .phase_costs
            .iter()
            .map(|(phase, &cost)| PhaseCost {
                phase: phase.clone(),
                cost,
                share: if metrics.total_cost > 0.0 {
                    cost / metrics.total_cost
                } else {
                    0.0
                },
            })
            .collect();
        phases.sort_by(|a, b| {
            b.cost
                .partial_cmp(&a.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.phase.cmp(&b.phase))
        });

        Self {
            total_cost: metrics.total_cost,
            phases,
            tokens: metrics.tokens.clone(),
            cache_hit_rate: metrics.cache_hit_rate,
            retry_count: metrics.retry_count,
            llm_calls: metrics.llm_calls,
            duration_ms: metrics.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OwnerId, PhaseTag, Problem};

    fn state() -> SessionState {
        let mut s = SessionState::new(OwnerId::new("o"), Problem::new("p"));
        let tokens = TokenTotals {
            input: 1000,
            output: 300,
            cache_write: 0,
            cache_read: 500,
        };
        s.metrics.record_call(&PhaseTag::Decomposition, 0.01, &tokens, 0);
        s.metrics
            .record_call(&PhaseTag::InitialRound, 0.05, &tokens, 1);
        s.metrics
            .record_call(&PhaseTag::RoundDeliberation(1), 0.02, &tokens, 0);
        s
    }

    #[test]
    fn test_phase_rows_sum_to_total() {
        let report = MetricsReport::from_state(&state());
        let sum: f64 = report.phases.iter().map(|p| p.cost).sum();
        assert!((sum - report.total_cost).abs() < 1e-9);
        let share_sum: f64 = report.phases.iter().map(|p| p.share).sum();
        assert!((share_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_phases_sorted_by_cost_descending() {
        let report = MetricsReport::from_state(&state());
        assert_eq!(report.phases[0].phase, "initial_round");
        assert_eq!(report.phases[1].phase, "round_1_deliberation");
        assert_eq!(report.phases[2].phase, "decomposition");
    }

    #[test]
    fn test_report_deterministic() {
        let s = state();
        assert_eq!(MetricsReport::from_state(&s), MetricsReport::from_state(&s));
    }

    #[test]
    fn test_empty_session_zero_shares() {
        let s = SessionState::new(OwnerId::new("o"), Problem::new("p"));
        let report = MetricsReport::from_state(&s);
        assert_eq!(report.total_cost, 0.0);
        assert!(report.phases.is_empty());
    }

    #[test]
    fn test_counts_carried_through() {
        let report = MetricsReport::from_state(&state());
        assert_eq!(report.llm_calls, 3);
        assert_eq!(report.retry_count, 1);
        assert_eq!(report.tokens.cache_read, 1500);
    }
}
