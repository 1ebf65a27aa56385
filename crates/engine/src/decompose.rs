//! Problem decomposition
//!
//! Turns a confirmed problem statement into 1..5 sub-problems with
//! complexity scores and a list of information gaps. Uses a JSON prefill
//! so the model's first output character is already inside the document;
//! on parse failure it logs the fallback, retries once with stricter
//! instructions, then fails the node.

use serde::Deserialize;

use crate::broker::{LlmBroker, LlmRequest, SystemSegment};
use crate::types::{
    EngineError, GapCategory, GapPriority, GraphError, InformationGap, ModelRole, PhaseTag,
    Problem, SubProblem,
};
use crate::xmlout::preview;

/// Ceiling on sub-problems per decomposition; more collapse into a meta
/// sub-problem. Recursive decomposition is an owner-initiated follow-up.
pub const MAX_SUB_PROBLEMS: usize = 5;

/// Result of decomposing one problem.
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub sub_problems: Vec<SubProblem>,
    pub information_gaps: Vec<InformationGap>,
}

#[derive(Deserialize)]
struct RawDecomposition {
    #[serde(default)]
    sub_problems: Vec<RawSubProblem>,
    #[serde(default)]
    information_gaps: Vec<RawGap>,
}

#[derive(Deserialize)]
struct RawSubProblem {
    goal: String,
    #[serde(default)]
    context: String,
    #[serde(default = "default_complexity")]
    complexity: u8,
    /// Indices into `sub_problems`, in output order.
    #[serde(default)]
    depends_on: Vec<usize>,
}

#[derive(Deserialize)]
struct RawGap {
    question: String,
    category: String,
    priority: String,
}

fn default_complexity() -> u8 {
    5
}

/// The decomposition stage.
pub struct Decomposer {
    broker: LlmBroker,
}

impl Decomposer {
    pub fn new(broker: LlmBroker) -> Self {
        Self { broker }
    }

    /// Decompose a problem into sub-problems and information gaps.
    pub async fn decompose(
        &self,
        problem: &Problem,
        business_context: Option<&str>,
    ) -> Result<Decomposition, EngineError> {
        let first = self.attempt(problem, business_context, false).await?;
        match first {
            Ok(decomposition) => Ok(decomposition),
            Err(parse_error) => {
                tracing::warn!(
                    "⚠ decomposition output unparseable ({}); retrying once with \
                     stricter instructions — one extra model call",
                    parse_error
                );
                let second = self.attempt(problem, business_context, true).await?;
                second.map_err(|e| {
                    GraphError::NodeFailed {
                        node: "decompose".into(),
                        message: format!("unparseable after strict retry: {}", e),
                    }
                    .into()
                })
            }
        }
    }

    /// One model attempt. Outer error: broker failure. Inner error: parse
    /// failure (eligible for the strict retry).
    async fn attempt(
        &self,
        problem: &Problem,
        business_context: Option<&str>,
        strict: bool,
    ) -> Result<Result<Decomposition, String>, EngineError> {
        let mut user = format!("Problem statement:\n{}\n", problem.description);
        if let Some(ctx) = problem.context.as_deref() {
            user.push_str(&format!("\nProblem context:\n{}\n", ctx));
        }
        if !problem.constraints.is_empty() {
            user.push_str(&format!("\nConstraints:\n- {}\n", problem.constraints.join("\n- ")));
        }
        if let Some(ctx) = business_context {
            user.push_str(&format!("\nBusiness context:\n{}\n", ctx));
        }
        user.push_str(
            "\nDecompose this decision into independent sub-problems (at most 5; if more \
             emerge, group related ones into meta-problems). For each, give a goal, a \
             one-paragraph context, a complexity score from 1 to 10, and the indices of \
             sub-problems it depends on. Also list information gaps: questions whose \
             answers would materially change the recommendation, each tagged category \
             INTERNAL (only the decision-maker can answer) or EXTERNAL (answerable by \
             research) and priority CRITICAL or NICE_TO_HAVE.\n\n\
             Respond as JSON: {\"sub_problems\": [{\"goal\", \"context\", \"complexity\", \
             \"depends_on\"}], \"information_gaps\": [{\"question\", \"category\", \
             \"priority\"}]}",
        );
        if strict {
            user.push_str(
                "\n\nIMPORTANT: respond with a single valid JSON object and nothing else. \
                 No prose, no markdown fences, no trailing commentary.",
            );
        }

        let request = LlmRequest::new(ModelRole::Decomposer, PhaseTag::Decomposition, "decomposer")
            .with_system(vec![SystemSegment::plain(
                "You break decision problems into well-scoped sub-problems and name what \
                 information is missing. You are precise and output machine-readable JSON.",
            )])
            .with_user(user)
            .with_prefill("{\"")
            .with_temperature(if strict { 0.0 } else { 0.3 })
            .with_max_tokens(2048);

        let response = self.broker.call(request).await?;
        Ok(self.parse(&response.content, problem))
    }

    fn parse(&self, content: &str, problem: &Problem) -> Result<Decomposition, String> {
        let raw: RawDecomposition = serde_json::from_str(content)
            .map_err(|e| format!("{} (payload: {:?})", e, preview(content, 160)))?;

        let mut sub_problems = self.build_sub_problems(raw.sub_problems, problem);
        if sub_problems.is_empty() {
            // Atomic problem: one sub-problem equal to the original.
            sub_problems.push(SubProblem::new(
                problem.description.clone(),
                problem.context.clone().unwrap_or_default(),
                3,
            ));
        }

        let mut information_gaps = Vec::with_capacity(raw.information_gaps.len());
        for gap in raw.information_gaps {
            let category = match gap.category.to_ascii_uppercase().as_str() {
                "INTERNAL" => GapCategory::Internal,
                "EXTERNAL" => GapCategory::External,
                other => {
                    tracing::warn!(
                        "⚠ gap category '{}' unrecognized; treating as EXTERNAL so the \
                         user is not blocked on it",
                        other
                    );
                    GapCategory::External
                }
            };
            let priority = match gap.priority.to_ascii_uppercase().as_str() {
                "CRITICAL" => GapPriority::Critical,
                _ => GapPriority::NiceToHave,
            };
            information_gaps.push(InformationGap::new(gap.question, category, priority));
        }

        Ok(Decomposition {
            sub_problems,
            information_gaps,
        })
    }

    fn build_sub_problems(&self, raw: Vec<RawSubProblem>, problem: &Problem) -> Vec<SubProblem> {
        let mut list = raw;

        // Group overflow into a single meta sub-problem rather than
        // dropping anything.
        if list.len() > MAX_SUB_PROBLEMS {
            tracing::warn!(
                "decomposition produced {} sub-problems for {}; grouping overflow into a \
                 meta-problem",
                list.len(),
                problem.id
            );
            let overflow = list.split_off(MAX_SUB_PROBLEMS - 1);
            let goal = overflow
                .iter()
                .map(|sp| sp.goal.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            let context = overflow
                .iter()
                .map(|sp| sp.context.as_str())
                .filter(|c| !c.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            let complexity = overflow.iter().map(|sp| sp.complexity).max().unwrap_or(5);
            list.push(RawSubProblem {
                goal: format!("Resolve the remaining interdependent questions: {}", goal),
                context,
                complexity,
                depends_on: Vec::new(),
            });
        }

        // First pass materializes ids, second pass resolves index-based
        // dependencies against them. Self-references and out-of-range
        // indices are dropped.
        let mut materialized: Vec<SubProblem> = list
            .iter()
            .map(|raw| SubProblem::new(raw.goal.clone(), raw.context.clone(), raw.complexity))
            .collect();
        let ids: Vec<_> = materialized.iter().map(|sp| sp.id).collect();
        for (i, (sp, raw)) in materialized.iter_mut().zip(list.iter()).enumerate() {
            sp.dependencies = raw
                .depends_on
                .iter()
                .filter(|&&dep| dep != i)
                .filter_map(|&dep| ids.get(dep).copied())
                .collect();
        }
        materialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::broker_with_contents;

    fn problem() -> Problem {
        Problem::new("Should I invest $50K in SEO or paid ads?")
    }

    fn decomposer(contents: Vec<&str>) -> Decomposer {
        Decomposer::new(broker_with_contents(contents))
    }

    const GOOD: &str = r#"{"sub_problems": [
        {"goal": "Evaluate SEO payback", "context": "Organic channel", "complexity": 6, "depends_on": []},
        {"goal": "Evaluate paid ads payback", "context": "Paid channel", "complexity": 5, "depends_on": []}
    ], "information_gaps": [
        {"question": "What is the monthly budget ceiling?", "category": "INTERNAL", "priority": "CRITICAL"},
        {"question": "Average CPC in this vertical?", "category": "EXTERNAL", "priority": "NICE_TO_HAVE"}
    ]}"#;

    #[tokio::test]
    async fn test_parses_sub_problems_and_gaps() {
        let d = decomposer(vec![GOOD]);
        let out = d.decompose(&problem(), None).await.unwrap();
        assert_eq!(out.sub_problems.len(), 2);
        assert_eq!(out.sub_problems[0].complexity_score, 6);
        assert_eq!(out.information_gaps.len(), 2);
        assert_eq!(out.information_gaps[0].category, GapCategory::Internal);
        assert_eq!(out.information_gaps[0].priority, GapPriority::Critical);
    }

    #[tokio::test]
    async fn test_atomic_problem_single_sub_problem() {
        let d = decomposer(vec![r#"{"sub_problems": [], "information_gaps": []}"#]);
        let out = d.decompose(&problem(), None).await.unwrap();
        assert_eq!(out.sub_problems.len(), 1);
        assert_eq!(out.sub_problems[0].goal, problem().description);
        // Low default complexity keeps the round budget small.
        assert!(out.sub_problems[0].max_rounds() <= 5);
    }

    #[tokio::test]
    async fn test_overflow_grouped_into_meta_problem() {
        let many: String = {
            let subs: Vec<String> = (0..8)
                .map(|i| {
                    format!(
                        r#"{{"goal": "Question {}", "context": "ctx", "complexity": {}, "depends_on": []}}"#,
                        i,
                        (i % 10) + 1
                    )
                })
                .collect();
            format!(
                r#"{{"sub_problems": [{}], "information_gaps": []}}"#,
                subs.join(",")
            )
        };
        let d = decomposer(vec![&many]);
        let out = d.decompose(&problem(), None).await.unwrap();
        assert_eq!(out.sub_problems.len(), MAX_SUB_PROBLEMS);
        let meta = out.sub_problems.last().unwrap();
        assert!(meta.goal.contains("Question 4"));
        assert!(meta.goal.contains("Question 7"));
    }

    #[tokio::test]
    async fn test_parse_failure_retries_once_with_strict() {
        let d = decomposer(vec!["Here are my thoughts on your problem...", GOOD]);
        let out = d.decompose(&problem(), None).await.unwrap();
        assert_eq!(out.sub_problems.len(), 2);
    }

    #[tokio::test]
    async fn test_double_parse_failure_fails_node() {
        let d = decomposer(vec!["not json", "still not json"]);
        let err = d.decompose(&problem(), None).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::NodeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_gap_category_degrades_to_external() {
        let json = r#"{"sub_problems": [{"goal": "g", "context": "", "complexity": 2, "depends_on": []}],
            "information_gaps": [{"question": "q", "category": "MYSTERY", "priority": "CRITICAL"}]}"#;
        let d = decomposer(vec![json]);
        let out = d.decompose(&problem(), None).await.unwrap();
        assert_eq!(out.information_gaps[0].category, GapCategory::External);
        // Misclassified gaps must not block the user at a checkpoint.
        assert!(!out.information_gaps[0].blocks_deliberation());
    }

    #[tokio::test]
    async fn test_dependencies_resolved_to_ids() {
        let json = r#"{"sub_problems": [
            {"goal": "a", "context": "", "complexity": 2, "depends_on": []},
            {"goal": "b", "context": "", "complexity": 2, "depends_on": [0, 1, 9]}
        ], "information_gaps": []}"#;
        let d = decomposer(vec![json]);
        let out = d.decompose(&problem(), None).await.unwrap();
        // Self-reference (1) and out-of-range (9) dropped; 0 resolved to an id.
        assert_eq!(out.sub_problems[1].dependencies, vec![out.sub_problems[0].id]);
    }

    #[tokio::test]
    async fn test_complexity_defaults_when_missing() {
        let json = r#"{"sub_problems": [{"goal": "g", "context": ""}], "information_gaps": []}"#;
        let d = decomposer(vec![json]);
        let out = d.decompose(&problem(), None).await.unwrap();
        assert_eq!(out.sub_problems[0].complexity_score, 5);
    }
}
