//! Persona turns and recommendation collection
//!
//! Fan-out calls share one cacheable prefix: the first call runs alone so
//! the provider creates the prompt cache, then the rest run concurrently
//! and read it. Round numbers are assigned before fan-out so parallel
//! writes never race the counter.

use futures::future::join_all;

use crate::broker::{LlmBroker, LlmRequest, LlmResponse};
use crate::context::{discussion_window, persona_system};
use crate::types::{
    Contribution, ContributionId, EngineError, GraphError, ModelRole, Persona, PhaseTag,
    Recommendation, SessionState,
};
use crate::xmlout::{parse_contribution, parse_recommendation};

/// One persona turn, ready to append.
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub contribution: Contribution,
    pub research_request: Option<String>,
    pub response: LlmResponse,
}

/// Run one persona's debate turn.
pub async fn persona_turn(
    broker: &LlmBroker,
    state: &SessionState,
    persona: &Persona,
    phase_tag: PhaseTag,
    invitation: &str,
) -> Result<TurnOutput, EngineError> {
    let request = LlmRequest::new(ModelRole::Persona, phase_tag.clone(), persona.code.as_str())
        .with_system(persona_system(state, &persona.system_role_text))
        .with_user(format!(
            "Discussion so far:\n{}\n{} — {}, it is your turn.",
            discussion_window(state),
            invitation,
            persona.name
        ))
        .with_temperature(0.8)
        .with_max_tokens(1024);

    let response = broker.call(request).await?;
    let parsed = parse_contribution(&response.content);

    let contribution = Contribution {
        id: ContributionId::new(),
        persona_code: persona.code.clone(),
        round_number: state.round_number,
        content: parsed.contribution,
        thinking: parsed.thinking,
        created_at: chrono::Utc::now(),
        tokens: response.tokens.total(),
        cost: response.cost.total,
        phase_tag,
    };

    Ok(TurnOutput {
        contribution,
        research_request: parsed.research_request.map(|r| r.query),
        response,
    })
}

/// The opening round: every persona contributes against the same shared
/// cacheable system prompt. The first call primes the provider cache;
/// the rest run in parallel and read it. Failed turns are skipped with a
/// logged fallback; the round fails only if nobody speaks.
pub async fn initial_round(
    broker: &LlmBroker,
    state: &SessionState,
) -> Result<Vec<TurnOutput>, EngineError> {
    let personas = state.personas.clone();
    let Some((first, rest)) = personas.split_first() else {
        return Err(GraphError::NodeFailed {
            node: "initial_round".into(),
            message: "no personas selected".into(),
        }
        .into());
    };

    let invitation = "Give your opening position on the question";
    let mut outputs = Vec::with_capacity(personas.len());

    // Sequential first call creates the cache entry.
    match persona_turn(broker, state, first, PhaseTag::InitialRound, invitation).await {
        Ok(output) => outputs.push(output),
        Err(e) => tracing::warn!(
            "⚠ opening turn for {} failed ({}); the board opens without that voice",
            first.code,
            e
        ),
    }

    // The rest read the cache concurrently.
    let parallel = join_all(rest.iter().map(|persona| {
        persona_turn(broker, state, persona, PhaseTag::InitialRound, invitation)
    }))
    .await;
    for (persona, result) in rest.iter().zip(parallel) {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => tracing::warn!(
                "⚠ opening turn for {} failed ({}); the board opens without that voice",
                persona.code,
                e
            ),
        }
    }

    if outputs.is_empty() {
        return Err(GraphError::NodeFailed {
            node: "initial_round".into(),
            message: "every persona turn failed".into(),
        }
        .into());
    }
    Ok(outputs)
}

/// Collect one recommendation per persona, same sequential-then-parallel
/// caching pattern as the initial round.
pub async fn collect_recommendations(
    broker: &LlmBroker,
    state: &SessionState,
) -> Result<Vec<(Recommendation, LlmResponse)>, EngineError> {
    let personas = state.personas.clone();
    let Some((first, rest)) = personas.split_first() else {
        return Err(GraphError::NodeFailed {
            node: "recommend".into(),
            message: "no personas selected".into(),
        }
        .into());
    };

    let mut outputs = Vec::with_capacity(personas.len());
    match recommendation_call(broker, state, first).await {
        Ok(output) => outputs.push(output),
        Err(e) => tracing::warn!(
            "⚠ recommendation from {} failed ({}); synthesis proceeds without it",
            first.code,
            e
        ),
    }

    let parallel = join_all(
        rest.iter()
            .map(|persona| recommendation_call(broker, state, persona)),
    )
    .await;
    for (persona, result) in rest.iter().zip(parallel) {
        match result {
            Ok(output) => outputs.push(output),
            Err(e) => tracing::warn!(
                "⚠ recommendation from {} failed ({}); synthesis proceeds without it",
                persona.code,
                e
            ),
        }
    }

    if outputs.is_empty() {
        return Err(GraphError::NodeFailed {
            node: "recommend".into(),
            message: "every recommendation call failed".into(),
        }
        .into());
    }
    Ok(outputs)
}

async fn recommendation_call(
    broker: &LlmBroker,
    state: &SessionState,
    persona: &Persona,
) -> Result<(Recommendation, LlmResponse), EngineError> {
    let request = LlmRequest::new(
        ModelRole::Persona,
        PhaseTag::Recommending,
        persona.code.as_str(),
    )
    .with_system(persona_system(state, &persona.system_role_text))
    .with_user(format!(
        "Discussion so far:\n{}\nThe debate is closing. {}, give your final \
         recommendation. Any form of answer is valid — a binary call, a split, a \
         conditional strategy. Structure it as <recommendation>…</recommendation>\
         <reasoning>…</reasoning><confidence>0.0-1.0</confidence>\
         <conditions><condition>…</condition></conditions> with optional \
         <alternatives_considered> and <risk_assessment> blocks.",
        discussion_window(state),
        persona.name
    ))
    .with_temperature(0.5)
    .with_max_tokens(1024);

    let response = broker.call(request).await?;
    let parsed = parse_recommendation(&response.content);

    Ok((
        Recommendation {
            persona_code: persona.code.clone(),
            recommendation_text: parsed.recommendation,
            reasoning: parsed.reasoning,
            confidence: parsed.confidence,
            conditions: parsed.conditions,
            alternatives_considered: parsed.alternatives_considered,
            risk_assessment: parsed.risk_assessment,
        },
        response,
    ))
}
