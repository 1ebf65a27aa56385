//! Background round summarization
//!
//! After each completed round a detached task produces a compressed
//! summary used in later-round prompts instead of the full transcript —
//! the hierarchical context strategy that keeps token growth linear. The
//! graph only awaits a summary when it is about to need it (round N+2);
//! awaiting blocks that session's node, never other sessions.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{LlmBroker, LlmRequest, LlmResponse, SystemSegment};
use crate::types::{
    Contribution, InformationDensity, ModelRole, PhaseTag, RoundSummary,
};

/// Density heuristic: a round is high-density when it carries numbers,
/// explicit conflict, or newly introduced evidence.
pub fn assess_density(contributions: &[Contribution]) -> InformationDensity {
    const CONFLICT_MARKERS: [&str; 6] = [
        "disagree",
        "however",
        "on the contrary",
        "that is wrong",
        "risk",
        "evidence",
    ];
    let has_numbers = contributions
        .iter()
        .any(|c| c.content.chars().filter(|ch| ch.is_ascii_digit()).count() >= 2);
    let has_conflict = contributions.iter().any(|c| {
        let lower = c.content.to_lowercase();
        CONFLICT_MARKERS.iter().any(|m| lower.contains(m))
    });
    if has_numbers || has_conflict {
        InformationDensity::High
    } else {
        InformationDensity::Low
    }
}

/// Fire-and-forget round summarizer with a join point per round.
pub struct RoundSummarizer {
    broker: LlmBroker,
    high_tokens: u32,
    low_tokens: u32,
    pending: Mutex<HashMap<u32, JoinHandle<Option<(RoundSummary, LlmResponse)>>>>,
}

impl RoundSummarizer {
    pub fn new(broker: LlmBroker, high_tokens: u32, low_tokens: u32) -> Self {
        Self {
            broker,
            high_tokens,
            low_tokens,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the summary task for a completed round. Returns immediately;
    /// the summary is ready by the time round N+2 needs it under normal
    /// latency.
    pub fn spawn(&self, round: u32, contributions: Vec<Contribution>, goal: String) {
        let density = assess_density(&contributions);
        let target_tokens = match density {
            InformationDensity::High => self.high_tokens,
            InformationDensity::Low => self.low_tokens,
        };
        let broker = self.broker.clone();

        let handle = tokio::spawn(async move {
            let transcript: String = contributions
                .iter()
                .map(|c| format!("{}: {}\n", c.persona_code, c.content))
                .collect();

            let request = LlmRequest::new(
                ModelRole::Summarizer,
                PhaseTag::RoundDeliberation(round),
                "summarizer",
            )
            .with_system(vec![SystemSegment::plain(
                "You compress one round of an expert debate. Preserve positions, points \
                 of disagreement, and any numbers or evidence. Drop pleasantries and \
                 repetition.",
            )])
            .with_user(format!(
                "Debate goal: {}\n\nRound {} transcript:\n{}\n\
                 Summarize this round in about {} tokens.",
                goal, round, transcript, target_tokens
            ))
            .with_temperature(0.2)
            .with_max_tokens(target_tokens * 2);

            match broker.call(request).await {
                Ok(response) => {
                    let summary = RoundSummary {
                        round_number: round,
                        summary_text: response.content.trim().to_string(),
                        target_tokens,
                        information_density: density,
                        created_at: chrono::Utc::now(),
                    };
                    let measured = estimate_tokens(&summary.summary_text);
                    if measured > (target_tokens as usize) * 2 {
                        tracing::debug!(
                            "round {} summary ran long: ~{} tokens against a {} target",
                            round,
                            measured,
                            target_tokens
                        );
                    }
                    Some((summary, response))
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠ round {} summary failed ({}); later rounds will see the raw \
                         transcript for this round instead",
                        round,
                        e
                    );
                    None
                }
            }
        });

        self.pending.lock().insert(round, handle);
    }

    /// Await the summary for a round, if one was spawned. The accounting
    /// for the summary call is returned so the caller can record it
    /// against the session's metrics at the join point.
    pub async fn take(&self, round: u32) -> Option<(RoundSummary, LlmResponse)> {
        let handle = self.pending.lock().remove(&round)?;
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("⚠ round {} summary task panicked: {}", round, e);
                None
            }
        }
    }

    /// Rounds with summaries still in flight.
    pub fn pending_rounds(&self) -> Vec<u32> {
        let mut rounds: Vec<u32> = self.pending.lock().keys().copied().collect();
        rounds.sort_unstable();
        rounds
    }

    /// Abort all in-flight summary tasks (session cancellation).
    pub fn abort_all(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }
}

/// Rough token estimate used for summary-length diagnostics. tiktoken's
/// cl100k vocabulary approximates the Claude tokenizer closely enough for
/// a budget check.
pub fn estimate_tokens(text: &str) -> usize {
    use std::sync::OnceLock;
    static BPE: OnceLock<Option<tiktoken_rs::CoreBPE>> = OnceLock::new();
    let bpe = BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok());
    match bpe {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        // Character heuristic when the vocabulary is unavailable.
        None => text.len() / 4,
    }
}
