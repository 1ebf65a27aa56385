//! Prompt context assembly
//!
//! Builds the shared cacheable preamble and the hierarchical discussion
//! window used by persona, facilitator, and moderator calls. Older rounds
//! appear as summaries, only the most recent rounds appear verbatim —
//! this is what defeats quadratic token growth across a long debate.

use crate::broker::SystemSegment;
use crate::types::SessionState;

/// Rounds whose contributions are included verbatim; everything older is
/// represented by its round summary.
pub const VERBATIM_ROUNDS: u32 = 2;

/// The shared preamble identical across all personas in a session.
///
/// Built deterministically from session fields so every call in the same
/// phase produces a byte-identical prefix — the property provider-side
/// prompt caching keys on.
pub fn shared_preamble(state: &SessionState) -> String {
    let mut out = String::new();
    out.push_str("You are one voice on an advisory board deliberating a decision.\n\n");
    out.push_str(&format!("Problem: {}\n", state.problem.description));
    if let Some(ctx) = state.problem.context.as_deref() {
        out.push_str(&format!("Problem context: {}\n", ctx));
    }
    if !state.problem.constraints.is_empty() {
        out.push_str(&format!(
            "Constraints:\n- {}\n",
            state.problem.constraints.join("\n- ")
        ));
    }
    if let Some(sp) = state.current_sub_problem() {
        out.push_str(&format!("\nCurrent question: {}\n", sp.goal));
        if !sp.context.is_empty() {
            out.push_str(&format!("Question context: {}\n", sp.context));
        }
    }

    if !state.personas.is_empty() {
        out.push_str("\nThe board:\n");
        for p in &state.personas {
            out.push_str(&format!("- {} ({}): {}\n", p.name, p.code, p.role));
        }
    }

    if !state.internal_context.is_empty() {
        out.push_str("\nAnswers from the decision-maker:\n");
        let mut entries: Vec<_> = state.internal_context.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (question, answer) in entries {
            out.push_str(&format!("- {} {}\n", question, answer));
        }
    }

    if !state.research_context.is_empty() {
        out.push_str("\nResearch:\n");
        for entry in &state.research_context {
            out.push_str(&format!("- {}\n", entry));
        }
    }

    out.push_str(
        "\nSpeak in your persona's voice. Structure every turn as \
         <thinking>private reasoning</thinking> followed by \
         <contribution>what you say to the board</contribution>. If a factual \
         question requires outside research, include \
         <research_request><query>the question</query><reason>why</reason>\
         </research_request>.\n",
    );
    out
}

/// System segments for a persona call: the shared cacheable preamble plus
/// the persona's own (cacheable) role text.
pub fn persona_system(state: &SessionState, persona_role_text: &str) -> Vec<SystemSegment> {
    vec![
        SystemSegment::cached(shared_preamble(state)),
        SystemSegment::cached(persona_role_text.to_string()),
    ]
}

/// The hierarchical discussion window: summaries for older rounds, full
/// transcript for the last [`VERBATIM_ROUNDS`] rounds.
pub fn discussion_window(state: &SessionState) -> String {
    let mut out = String::new();
    let verbatim_from = state.round_number.saturating_sub(VERBATIM_ROUNDS - 1).max(1);

    let mut summaries: Vec<_> = state
        .round_summaries
        .iter()
        .filter(|s| s.round_number < verbatim_from)
        .collect();
    summaries.sort_by_key(|s| s.round_number);
    for summary in summaries {
        out.push_str(&format!(
            "[round {} summary] {}\n",
            summary.round_number, summary.summary_text
        ));
    }

    for contribution in state
        .contributions
        .iter()
        .filter(|c| c.round_number >= verbatim_from)
    {
        out.push_str(&format!(
            "[round {}] {}: {}\n",
            contribution.round_number, contribution.persona_code, contribution.content
        ));
    }

    if out.is_empty() {
        out.push_str("(no discussion yet)\n");
    }
    out
}
