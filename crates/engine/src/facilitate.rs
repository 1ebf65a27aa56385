//! Facilitator: per-round orchestration, quality detection, and synthesis
//!
//! Each round the facilitator chooses exactly one next action: continue
//! with a named speaker, invoke a moderator flavor, trigger research, or
//! move to recommendations. Explicit research requests take precedence;
//! a periodic quality check can raise a moderator; otherwise a model call
//! picks the speaker under deterministic guards (never the same speaker
//! twice in a row, silent personas get invited).

use serde::Deserialize;

use crate::broker::{LlmBroker, LlmRequest, LlmResponse, SystemSegment};
use crate::context::{discussion_window, shared_preamble};
use crate::moderate::{Moderator, ModeratorKind, QualityIssue};
use crate::types::{
    ConfidenceLevel, EngineError, GraphError, ModelRole, PersonaCode, PhaseTag,
    RecommendationAggregation, SessionState,
};
use crate::xmlout::preview;

/// The advisory disclaimer carried by every synthesis and export. The
/// engine recommends; it never decides.
pub const ADVISORY_DISCLAIMER: &str =
    "This recommendation is advisory only. The final decision rests with you.";

/// Confidence floor for quality-check-triggered moderation.
pub const QUALITY_CONFIDENCE_FLOOR: f64 = 0.7;

/// One action per round, chosen by the facilitator.
#[derive(Debug, Clone, PartialEq)]
pub enum FacilitatorDecision {
    /// A named persona speaks next.
    Continue { speaker: PersonaCode, reason: String },
    /// A moderator flavor intervenes.
    Moderate { kind: ModeratorKind, reason: String },
    /// Research is triggered with an extracted query.
    Research { query: String },
    /// The debate ends; collect recommendations.
    Recommend { reason: String },
}

#[derive(Deserialize)]
struct QualityOutput {
    #[serde(default)]
    issue: Option<QualityIssue>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct DecisionOutput {
    action: String,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct SynthesisJson {
    synthesis: String,
    consensus_recommendation: String,
    #[serde(default)]
    confidence_level: Option<String>,
    #[serde(default)]
    critical_conditions: Vec<String>,
    #[serde(default)]
    alternative_approaches: Vec<String>,
    #[serde(default)]
    dissenting_views: Vec<String>,
}

#[derive(Deserialize)]
struct ValidationJson {
    #[serde(default)]
    completeness: f64,
    #[serde(default)]
    actionability: f64,
    #[serde(default)]
    dissent_inclusion: f64,
    #[serde(default)]
    feedback: String,
}

impl ValidationJson {
    fn passes(&self) -> bool {
        let mean = (self.completeness + self.actionability + self.dissent_inclusion) / 3.0;
        mean >= 0.7
    }
}

/// Result of the synthesis stage.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub synthesis_text: String,
    pub aggregation: RecommendationAggregation,
    /// Broker responses for cost accounting at the call site.
    pub responses: Vec<LlmResponse>,
    /// True when the validator forced one auto-revision.
    pub revised: bool,
}

/// The facilitating agent.
pub struct Facilitator {
    broker: LlmBroker,
}

impl Facilitator {
    pub fn new(broker: LlmBroker) -> Self {
        Self { broker }
    }

    /// Choose the next action for the current round.
    pub async fn decide(
        &self,
        state: &mut SessionState,
        moderator: &Moderator,
    ) -> Result<(FacilitatorDecision, Vec<LlmResponse>), EngineError> {
        let mut responses = Vec::new();

        // Explicit research requests from recent contributions win.
        if let Some(query) = state.pending_research.first().cloned() {
            state.pending_research.remove(0);
            return Ok((FacilitatorDecision::Research { query }, responses));
        }

        // Periodic AI quality check (every 2 rounds once the debate has
        // shape). Confidence must clear the floor and the mapped flavor
        // must not have intervened on this sub-problem already.
        if state.round_number >= 2 && state.round_number % 2 == 0 {
            let (issue, response) = self.quality_check(state).await?;
            responses.push(response);
            if let Some((kind, reason)) = issue {
                let sub_problem = state.current_sub_problem_id;
                let fresh = sub_problem
                    .map(|sp| !moderator.already_invoked(sp, kind))
                    .unwrap_or(true);
                if fresh {
                    return Ok((FacilitatorDecision::Moderate { kind, reason }, responses));
                }
                tracing::debug!(
                    "quality check raised {} again; already intervened on this sub-problem",
                    kind
                );
            }
        }

        let (decision, response) = self.pick_speaker(state).await?;
        responses.push(response);
        Ok((decision, responses))
    }

    async fn quality_check(
        &self,
        state: &SessionState,
    ) -> Result<(Option<(ModeratorKind, String)>, LlmResponse), EngineError> {
        let request = LlmRequest::new(
            ModelRole::Validator,
            PhaseTag::RoundDeliberation(state.round_number),
            "quality_check",
        )
        .with_system(vec![SystemSegment::plain(
            "You audit the health of an expert debate. Look for: premature_consensus \
             (agreement without examining alternatives), unverified_claims (numbers or \
             facts asserted without evidence), negativity_spiral (only risks, no paths \
             forward), circular_arguments (the same points repeating). Respond with \
             JSON only.",
        )])
        .with_user(format!(
            "Discussion:\n{}\n\nRespond as {{\"issue\": \"premature_consensus\"|\
             \"unverified_claims\"|\"negativity_spiral\"|\"circular_arguments\"|null, \
             \"confidence\": 0.0-1.0, \"reason\": \"...\"}}. Use null when the debate \
             is healthy.",
            discussion_window(state)
        ))
        .with_prefill("{\"")
        .with_temperature(0.0)
        .with_max_tokens(256);

        let response = self.broker.call(request).await?;
        let verdict = match serde_json::from_str::<QualityOutput>(&response.content) {
            Ok(q) => q,
            Err(e) => {
                tracing::warn!(
                    "⚠ quality check unparseable ({}); treating round as healthy \
                     (payload: {:?})",
                    e,
                    preview(&response.content, 120)
                );
                return Ok((None, response));
            }
        };

        let triggered = verdict.issue.and_then(|issue| {
            if verdict.confidence > QUALITY_CONFIDENCE_FLOOR {
                Some((ModeratorKind::for_issue(issue), verdict.reason.clone()))
            } else {
                None
            }
        });
        Ok((triggered, response))
    }

    async fn pick_speaker(
        &self,
        state: &SessionState,
    ) -> Result<(FacilitatorDecision, LlmResponse), EngineError> {
        let last_speaker = state.last_speaker().cloned();
        let roster: Vec<String> = state
            .personas
            .iter()
            .map(|p| {
                let turns = state
                    .contributions
                    .iter()
                    .filter(|c| c.persona_code == p.code)
                    .count();
                format!("- {} ({} turns so far)", p.code, turns)
            })
            .collect();

        let request = LlmRequest::new(
            ModelRole::Facilitator,
            PhaseTag::RoundDeliberation(state.round_number),
            "facilitator",
        )
        .with_system(vec![
            SystemSegment::cached(shared_preamble(state)),
            SystemSegment::plain(
                "You facilitate this debate. Each round you either name the next \
                 speaker or end the debate and move to recommendations. Prefer \
                 speakers with unaddressed material; directly invite personas who \
                 have been silent. Never pick the speaker who just spoke. Move to \
                 recommendations when positions are fully developed and further \
                 rounds would only repeat. Respond with JSON only.",
            ),
        ])
        .with_user(format!(
            "Round {} of at most {}.\nBoard:\n{}\n\nDiscussion:\n{}\n\
             Respond as {{\"action\": \"speaker\"|\"recommend\", \"speaker\": \
             \"persona_code or null\", \"reason\": \"...\"}}.",
            state.round_number,
            state.max_rounds,
            roster.join("\n"),
            discussion_window(state)
        ))
        .with_prefill("{\"")
        .with_temperature(0.3)
        .with_max_tokens(256);

        let response = self.broker.call(request).await?;
        let decision = match serde_json::from_str::<DecisionOutput>(&response.content) {
            Ok(d) if d.action.eq_ignore_ascii_case("recommend") => FacilitatorDecision::Recommend {
                reason: d.reason,
            },
            Ok(d) => {
                let proposed = d.speaker.map(PersonaCode);
                let speaker = self.validate_speaker(state, proposed, &last_speaker);
                FacilitatorDecision::Continue {
                    speaker,
                    reason: d.reason,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "⚠ facilitator decision unparseable ({}); inviting the \
                     least-heard persona (payload: {:?})",
                    e,
                    preview(&response.content, 120)
                );
                FacilitatorDecision::Continue {
                    speaker: self.fallback_speaker(state, &last_speaker),
                    reason: "fallback: least-heard persona".into(),
                }
            }
        };
        Ok((decision, response))
    }

    /// Enforce the selection guards on a model-proposed speaker.
    fn validate_speaker(
        &self,
        state: &SessionState,
        proposed: Option<PersonaCode>,
        last_speaker: &Option<PersonaCode>,
    ) -> PersonaCode {
        if let Some(code) = proposed {
            let on_board = state.personas.iter().any(|p| p.code == code);
            let repeats = last_speaker.as_ref() == Some(&code);
            if on_board && !repeats {
                return code;
            }
            if !on_board {
                tracing::warn!("⚠ facilitator named '{}', not on the board; overriding", code);
            }
        }
        self.fallback_speaker(state, last_speaker)
    }

    /// Deterministic fallback: the persona with the fewest turns that is
    /// not the last speaker.
    fn fallback_speaker(
        &self,
        state: &SessionState,
        last_speaker: &Option<PersonaCode>,
    ) -> PersonaCode {
        state
            .personas
            .iter()
            .filter(|p| last_speaker.as_ref() != Some(&p.code))
            .min_by_key(|p| {
                state
                    .contributions
                    .iter()
                    .filter(|c| c.persona_code == p.code)
                    .count()
            })
            .map(|p| p.code.clone())
            .unwrap_or_else(|| {
                // A board always has ≥3 personas; this arm exists for
                // malformed states only.
                PersonaCode::from("facilitator")
            })
    }

    /// Deterministic refocus message injected when drift is detected.
    pub fn refocus_message(&self, state: &SessionState) -> String {
        let goal = state
            .current_sub_problem()
            .map(|sp| sp.goal.clone())
            .unwrap_or_else(|| state.problem.description.clone());
        format!(
            "Let's refocus. The question in front of the board is: {}. \
             Please tie your next contributions directly to it.",
            goal
        )
    }

    /// Synthesize the final advisory output from the full discussion and
    /// all recommendations, with one validator-driven auto-revision.
    pub async fn synthesize(&self, state: &SessionState) -> Result<SynthesisOutcome, EngineError> {
        let mut responses = Vec::new();

        let first = self.synthesis_call(state, None).await?;
        responses.push(first.1.clone());
        let mut parsed = first.0;

        let (validation, validation_response) = self.validate_synthesis(state, &parsed).await?;
        responses.push(validation_response);

        let mut revised = false;
        if let Some(feedback) = validation {
            tracing::info!("synthesis below quality bar; requesting one revision");
            let second = self.synthesis_call(state, Some(&feedback)).await?;
            responses.push(second.1);
            parsed = second.0;
            revised = true;
        }

        let confidence_level = match parsed
            .confidence_level
            .as_deref()
            .map(|s| s.to_ascii_lowercase())
            .as_deref()
        {
            Some("high") => ConfidenceLevel::High,
            Some("low") => ConfidenceLevel::Low,
            _ => ConfidenceLevel::Medium,
        };

        let mut synthesis_text = parsed.synthesis.trim().to_string();
        if !synthesis_text.contains(ADVISORY_DISCLAIMER) {
            synthesis_text.push_str("\n\n");
            synthesis_text.push_str(ADVISORY_DISCLAIMER);
        }

        Ok(SynthesisOutcome {
            synthesis_text,
            aggregation: RecommendationAggregation {
                consensus_recommendation: parsed.consensus_recommendation,
                confidence_level,
                critical_conditions: parsed.critical_conditions,
                alternative_approaches: parsed.alternative_approaches,
                dissenting_views: parsed.dissenting_views,
            },
            responses,
            revised,
        })
    }

    async fn synthesis_call(
        &self,
        state: &SessionState,
        revision_feedback: Option<&str>,
    ) -> Result<(SynthesisJson, LlmResponse), EngineError> {
        let recommendations: String = state
            .recommendations
            .iter()
            .map(|r| {
                format!(
                    "- {} (confidence {:.2}): {}\n  Reasoning: {}\n  Conditions: {}\n",
                    r.persona_code,
                    r.confidence,
                    r.recommendation_text,
                    r.reasoning,
                    if r.conditions.is_empty() {
                        "none".to_string()
                    } else {
                        r.conditions.join("; ")
                    }
                )
            })
            .collect();

        let mut user = format!(
            "Full discussion:\n{}\n\nBoard recommendations:\n{}\n\n\
             Write the final advisory synthesis. Phrase guidance as \"we recommend\", \
             never as instructions the reader must follow. Represent disagreement \
             honestly: where the board split, name both camps in dissenting_views \
             rather than papering over the split.\n\n\
             Respond as JSON: {{\"synthesis\": \"...\", \"consensus_recommendation\": \
             \"...\", \"confidence_level\": \"high\"|\"medium\"|\"low\", \
             \"critical_conditions\": [...], \"alternative_approaches\": [...], \
             \"dissenting_views\": [...]}}",
            discussion_window(state),
            recommendations
        );
        if let Some(feedback) = revision_feedback {
            user.push_str(&format!(
                "\n\nA reviewer scored the previous draft below the quality bar. \
                 Address this feedback in full: {}",
                feedback
            ));
        }

        let request = LlmRequest::new(ModelRole::Facilitator, PhaseTag::Synthesis, "synthesizer")
            .with_system(vec![SystemSegment::cached(shared_preamble(state))])
            .with_user(user)
            .with_prefill("{\"")
            .with_temperature(0.3)
            .with_max_tokens(4096);

        let response = self.broker.call(request).await?;
        let parsed = serde_json::from_str::<SynthesisJson>(&response.content).map_err(|e| {
            GraphError::NodeFailed {
                node: "synthesize".into(),
                message: format!(
                    "synthesis unparseable: {} (payload: {:?})",
                    e,
                    preview(&response.content, 160)
                ),
            }
        })?;
        Ok((parsed, response))
    }

    /// Score the synthesis on completeness, actionability, and dissent
    /// inclusion. Returns revision feedback when below threshold.
    async fn validate_synthesis(
        &self,
        state: &SessionState,
        synthesis: &SynthesisJson,
    ) -> Result<(Option<String>, LlmResponse), EngineError> {
        let request = LlmRequest::new(ModelRole::Validator, PhaseTag::Synthesis, "synthesis_validator")
            .with_system(vec![SystemSegment::plain(
                "You score a decision synthesis against the debate it summarizes. \
                 Score three axes from 0.0 to 1.0: completeness (no major position \
                 omitted), actionability (the reader knows what to do next), \
                 dissent_inclusion (disagreement is represented, not smoothed over). \
                 Respond with JSON only.",
            )])
            .with_user(format!(
                "Discussion:\n{}\n\nSynthesis under review:\n{}\n\nConsensus: {}\n\
                 Dissenting views: {:?}\n\nRespond as {{\"completeness\": 0.0-1.0, \
                 \"actionability\": 0.0-1.0, \"dissent_inclusion\": 0.0-1.0, \
                 \"feedback\": \"what to fix\"}}.",
                discussion_window(state),
                synthesis.synthesis,
                synthesis.consensus_recommendation,
                synthesis.dissenting_views
            ))
            .with_prefill("{\"")
            .with_temperature(0.0)
            .with_max_tokens(512);

        let response = self.broker.call(request).await?;
        match serde_json::from_str::<ValidationJson>(&response.content) {
            Ok(v) if v.passes() => Ok((None, response)),
            Ok(v) => {
                let feedback = if v.feedback.is_empty() {
                    format!(
                        "completeness {:.2}, actionability {:.2}, dissent inclusion {:.2}",
                        v.completeness, v.actionability, v.dissent_inclusion
                    )
                } else {
                    v.feedback
                };
                Ok((Some(feedback), response))
            }
            Err(e) => {
                tracing::warn!(
                    "⚠ synthesis validation unparseable ({}); accepting the draft as-is",
                    e
                );
                Ok((None, response))
            }
        }
    }
}
