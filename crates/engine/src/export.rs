//! Session exports
//!
//! Two shapes: a canonical JSON document for machines (aggregation,
//! recommendations, sources, metrics included) and a Markdown transcript
//! for humans. Both carry the advisory disclaimer.

use serde::{Deserialize, Serialize};

use crate::facilitate::ADVISORY_DISCLAIMER;
use crate::metrics::MetricsReport;
use crate::types::{
    Recommendation, RecommendationAggregation, SessionPhase, SessionState,
};

/// The canonical machine-readable export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonExport {
    pub session_id: String,
    pub owner_id: String,
    pub phase: SessionPhase,
    pub problem: String,
    pub disclaimer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<RecommendationAggregation>,
    pub recommendations: Vec<Recommendation>,
    pub research_sources: Vec<String>,
    pub metrics: MetricsReport,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Build the canonical JSON export document.
pub fn to_json(state: &SessionState) -> serde_json::Result<String> {
    let export = JsonExport {
        session_id: state.session_id.to_string(),
        owner_id: state.owner_id.to_string(),
        phase: state.phase,
        problem: state.problem.description.clone(),
        disclaimer: ADVISORY_DISCLAIMER.to_string(),
        synthesis_text: state.synthesis_text.clone(),
        aggregation: state.aggregation.clone(),
        recommendations: state.recommendations.clone(),
        research_sources: state.research_context.clone(),
        metrics: MetricsReport::from_state(state),
        created_at: state.created_at,
        updated_at: state.updated_at,
    };
    serde_json::to_string_pretty(&export)
}

/// Build the human-readable Markdown transcript.
pub fn to_markdown(state: &SessionState) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Board of One — {}\n\n", state.problem.description));
    out.push_str(&format!(
        "*Session `{}` · phase {} · owner {}*\n\n",
        state.session_id, state.phase, state.owner_id
    ));

    if let Some(sp) = state.current_sub_problem() {
        out.push_str(&format!(
            "**Question deliberated:** {} (complexity {}/10, {} rounds max)\n\n",
            sp.goal, sp.complexity_score, state.max_rounds
        ));
    }

    if !state.personas.is_empty() {
        out.push_str("## The board\n\n");
        for p in &state.personas {
            out.push_str(&format!("- **{}** — {}\n", p.name, p.role));
        }
        out.push('\n');
    }

    if !state.research_context.is_empty() {
        out.push_str("## Research\n\n");
        for entry in &state.research_context {
            out.push_str(&format!("- {}\n", entry));
        }
        out.push('\n');
    }

    if !state.contributions.is_empty() {
        out.push_str("## Transcript\n\n");
        let mut current_round = 0;
        for c in &state.contributions {
            if c.round_number != current_round {
                current_round = c.round_number;
                out.push_str(&format!("### Round {}\n\n", current_round));
            }
            out.push_str(&format!("**{}:** {}\n\n", c.persona_code, c.content));
        }
    }

    if !state.recommendations.is_empty() {
        out.push_str("## Recommendations\n\n");
        for r in &state.recommendations {
            out.push_str(&format!(
                "### {} (confidence {:.0}%)\n\n{}\n\n",
                r.persona_code,
                r.confidence * 100.0,
                r.recommendation_text
            ));
            if !r.reasoning.is_empty() {
                out.push_str(&format!("*Reasoning:* {}\n\n", r.reasoning));
            }
            if !r.conditions.is_empty() {
                out.push_str("*Conditions:*\n");
                for condition in &r.conditions {
                    out.push_str(&format!("- {}\n", condition));
                }
                out.push('\n');
            }
        }
    }

    if let Some(aggregation) = &state.aggregation {
        out.push_str("## Consensus\n\n");
        out.push_str(&format!(
            "{}\n\n*Confidence: {:?}*\n\n",
            aggregation.consensus_recommendation, aggregation.confidence_level
        ));
        if !aggregation.critical_conditions.is_empty() {
            out.push_str("**Critical conditions:**\n");
            for condition in &aggregation.critical_conditions {
                out.push_str(&format!("- {}\n", condition));
            }
            out.push('\n');
        }
        if !aggregation.dissenting_views.is_empty() {
            out.push_str("**Dissenting views:**\n");
            for view in &aggregation.dissenting_views {
                out.push_str(&format!("- {}\n", view));
            }
            out.push('\n');
        }
    }

    if let Some(synthesis) = &state.synthesis_text {
        out.push_str("## Synthesis\n\n");
        out.push_str(synthesis);
        out.push_str("\n\n");
    }

    let report = MetricsReport::from_state(state);
    out.push_str("## Cost\n\n");
    out.push_str(&format!(
        "Total ${:.4} across {} model calls ({} retries, {:.0}% cache hit rate).\n\n",
        report.total_cost,
        report.llm_calls,
        report.retry_count,
        report.cache_hit_rate * 100.0
    ));
    for phase in &report.phases {
        out.push_str(&format!(
            "- {}: ${:.4} ({:.0}%)\n",
            phase.phase,
            phase.cost,
            phase.share * 100.0
        ));
    }
    out.push('\n');

    if !out.contains(ADVISORY_DISCLAIMER) {
        out.push_str("---\n\n");
        out.push_str(ADVISORY_DISCLAIMER);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ConfidenceLevel, Contribution, ContributionId, OwnerId, PersonaCode, PhaseTag, Problem,
        TokenTotals,
    };

    fn state() -> SessionState {
        let mut s = SessionState::new(OwnerId::new("owner-a"), Problem::new("SEO or ads?"));
        s.set_max_rounds(7);
        s.advance_round().unwrap();
        s.append_contribution(Contribution {
            id: ContributionId::new(),
            persona_code: PersonaCode::from("growth_strategist"),
            round_number: 1,
            content: "SEO compounds.".into(),
            thinking: None,
            created_at: chrono::Utc::now(),
            tokens: 100,
            cost: 0.002,
            phase_tag: PhaseTag::InitialRound,
        })
        .unwrap();
        s.recommendations.push(Recommendation {
            persona_code: PersonaCode::from("growth_strategist"),
            recommendation_text: "We recommend SEO.".into(),
            reasoning: "Compounding returns.".into(),
            confidence: 0.8,
            conditions: vec!["revisit in 90 days".into()],
            alternatives_considered: vec![],
            risk_assessment: None,
        });
        s.aggregation = Some(RecommendationAggregation {
            consensus_recommendation: "We recommend a SEO-weighted split.".into(),
            confidence_level: ConfidenceLevel::Medium,
            critical_conditions: vec!["budget cap holds".into()],
            alternative_approaches: vec![],
            dissenting_views: vec!["financial_analyst dissents".into()],
        });
        s.synthesis_text = Some(format!("The board leaned SEO.\n\n{}", ADVISORY_DISCLAIMER));
        s.metrics.record_call(
            &PhaseTag::InitialRound,
            0.002,
            &TokenTotals {
                input: 100,
                output: 50,
                cache_write: 0,
                cache_read: 0,
            },
            0,
        );
        s
    }

    #[test]
    fn test_json_export_round_trips() {
        let s = state();
        let json = to_json(&s).unwrap();
        let parsed: JsonExport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, s.session_id.to_string());
        assert_eq!(parsed.recommendations.len(), 1);
        assert!(parsed.aggregation.is_some());
        assert_eq!(parsed.disclaimer, ADVISORY_DISCLAIMER);
    }

    #[test]
    fn test_json_includes_metrics_breakdown() {
        let json = to_json(&state()).unwrap();
        assert!(json.contains("initial_round"));
        assert!(json.contains("total_cost"));
    }

    #[test]
    fn test_markdown_carries_disclaimer() {
        let md = to_markdown(&state());
        assert!(md.contains(ADVISORY_DISCLAIMER));
    }

    #[test]
    fn test_markdown_structure() {
        let md = to_markdown(&state());
        assert!(md.contains("# Board of One — SEO or ads?"));
        assert!(md.contains("## Transcript"));
        assert!(md.contains("### Round 1"));
        assert!(md.contains("**growth_strategist:** SEO compounds."));
        assert!(md.contains("## Recommendations"));
        assert!(md.contains("## Consensus"));
        assert!(md.contains("Dissenting views"));
        assert!(md.contains("## Cost"));
    }

    #[test]
    fn test_markdown_disclaimer_appended_when_missing() {
        let mut s = state();
        s.synthesis_text = None;
        let md = to_markdown(&s);
        assert!(md.contains(ADVISORY_DISCLAIMER));
    }
}
