//! Deliberation graph runner
//!
//! Drives one session's state through the compiled graph: decompose →
//! collect context → select personas → initial round → the debate loop →
//! recommend → synthesize. A checkpoint is written after every node, the
//! cost ledger is drained into session metrics at each boundary, and the
//! safety layers (visit budget, round counter, watchdog deadline, cost
//! kill switch) are checked where they apply.

use std::sync::Arc;
use std::time::Instant;

use crate::broker::{CostLedger, LlmBroker};
use crate::collect::{AnswerSource, CollectOutcome, ContextCollector};
use crate::config::EngineConfig;
use crate::decompose::Decomposer;
use crate::embedding::EmbeddingClient;
use crate::events::{EngineEvent, EventSink};
use crate::facilitate::{Facilitator, FacilitatorDecision};
use crate::moderate::{Moderator, ModeratorKind};
use crate::personas::{PersonaCatalog, PersonaSelector};
use crate::research::{record_findings, record_unavailable, Researcher};
use crate::store::{Checkpoints, StateStore};
use crate::summarize::RoundSummarizer;
use crate::types::{
    Contribution, ContributionId, EngineError, GraphError, PersonaCode, PhaseTag, ResultCode,
    SessionPhase, SessionState, SessionStateError, StopReason,
};

use super::convergence::{ConvergenceChecker, ConvergenceVerdict};
use super::{CompiledGraph, GraphDefinition, NodeId};

/// How a graph run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOutcome {
    /// The session ran to a terminal result (COMPLETE, TIMED_OUT, …).
    Completed(ResultCode),
    /// The session paused at the context checkpoint awaiting user answers.
    Paused { unanswered: Vec<String> },
}

/// Consecutive high-conflict convergence checks that force recommend.
const DEADLOCK_STREAK: u32 = 5;

enum Next {
    Goto(NodeId),
    Done(GraphOutcome),
}

/// One session's graph execution engine.
pub struct GraphRunner {
    config: EngineConfig,
    broker: LlmBroker,
    ledger: Arc<CostLedger>,
    store: Arc<dyn StateStore>,
    decomposer: Decomposer,
    collector: ContextCollector,
    selector: PersonaSelector,
    researcher: Arc<dyn Researcher>,
    summarizer: RoundSummarizer,
    facilitator: Facilitator,
    moderator: Moderator,
    convergence: ConvergenceChecker,
    events: EventSink,
    graph: CompiledGraph,
}

impl GraphRunner {
    /// Build a runner. The graph is compiled here, so an uncontrolled
    /// cycle fails before any model call is made.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        broker: &LlmBroker,
        store: Arc<dyn StateStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        researcher: Arc<dyn Researcher>,
        answers: Arc<dyn AnswerSource>,
        catalog: PersonaCatalog,
        events: EventSink,
    ) -> Result<Self, GraphError> {
        let graph = GraphDefinition::deliberation().compile()?;
        let ledger = Arc::new(CostLedger::new());
        let broker = broker.with_ledger(ledger.clone());

        Ok(Self {
            decomposer: Decomposer::new(broker.clone()),
            collector: ContextCollector::new(answers),
            selector: PersonaSelector::new(broker.clone(), catalog),
            summarizer: RoundSummarizer::new(
                broker.clone(),
                config.summary_high_tokens,
                config.summary_low_tokens,
            ),
            facilitator: Facilitator::new(broker.clone()),
            moderator: Moderator::new(broker.clone()),
            convergence: ConvergenceChecker::new(embeddings, &config),
            researcher,
            store,
            events,
            graph,
            ledger,
            broker,
            config,
        })
    }

    /// Run (or resume) the session until it completes, pauses, or stops.
    ///
    /// Resume is entry-point mapping: the stored phase picks the node to
    /// re-enter, and completed nodes are never re-executed.
    pub async fn run(&self, state: &mut SessionState) -> Result<GraphOutcome, EngineError> {
        let started = Instant::now();
        let deadline = started + self.config.session_timeout;
        let mut visits: u32 = 0;
        let mut conflict_streak: u32 = 0;
        let mut next_speaker: Option<(PersonaCode, String)> = None;
        let mut next_moderation: Option<(ModeratorKind, String)> = None;
        let mut next_query: Option<String> = None;

        let mut node = match self.entry_node(state)? {
            Some(node) => node,
            None => return Ok(GraphOutcome::Completed(ResultCode::Complete)),
        };

        let outcome = loop {
            visits += 1;
            if visits > self.graph.max_visits() {
                let err = GraphError::RecursionLimit {
                    visits,
                    limit: self.graph.max_visits(),
                };
                self.events.emit(EngineEvent::Error {
                    session_id: state.session_id,
                    message: err.to_string(),
                });
                return Err(err.into());
            }

            // Layer 4: wall-clock watchdog. The latest checkpoint is
            // already on disk; mark the stop and leave.
            if Instant::now() >= deadline {
                state.safety.stop(StopReason::SessionTimeout);
                self.drain_ledger(state, started);
                self.checkpoint(state, "timeout").await;
                tracing::warn!(
                    "session {} timed out after {:?}",
                    state.session_id,
                    self.config.session_timeout
                );
                break GraphOutcome::Completed(ResultCode::TimedOut);
            }

            self.events.emit(EngineEvent::NodeStart {
                session_id: state.session_id,
                node: node.to_string(),
            });

            let next = match node {
                NodeId::Decompose => self.node_decompose(state).await?,
                NodeId::CollectContext => self.node_collect(state).await?,
                NodeId::SelectPersonas => self.node_select(state).await?,
                NodeId::InitialRound => self.node_initial_round(state).await?,
                NodeId::FacilitatorDecide => {
                    let (next, stash) = self.node_decide(state).await?;
                    match stash {
                        Stash::Speaker(code, reason) => next_speaker = Some((code, reason)),
                        Stash::Moderation(kind, reason) => {
                            next_moderation = Some((kind, reason))
                        }
                        Stash::Query(query) => next_query = Some(query),
                        Stash::None => {}
                    }
                    next
                }
                NodeId::PersonaContribute => {
                    let (code, reason) = next_speaker.take().ok_or_else(|| {
                        EngineError::Internal("persona_contribute without a speaker".into())
                    })?;
                    self.node_persona(state, code, reason).await?
                }
                NodeId::ModeratorIntervene => {
                    let (kind, reason) = next_moderation.take().ok_or_else(|| {
                        EngineError::Internal("moderator_intervene without a flavor".into())
                    })?;
                    self.node_moderator(state, kind, reason).await?
                }
                NodeId::Research => {
                    let query = next_query.take().ok_or_else(|| {
                        EngineError::Internal("research without a query".into())
                    })?;
                    self.node_research(state, query).await?
                }
                NodeId::CheckConvergence => {
                    self.node_convergence(state, &mut conflict_streak).await?
                }
                NodeId::Recommend => self.node_recommend(state).await?,
                NodeId::Synthesize => self.node_synthesize(state).await?,
                NodeId::End => Next::Done(self.finish(state)?),
            };

            self.drain_ledger(state, started);
            debug_assert!(state.metrics.cost_invariant_holds());
            self.checkpoint(state, node.as_str()).await;
            self.events.emit(EngineEvent::NodeEnd {
                session_id: state.session_id,
                node: node.to_string(),
            });

            match next {
                Next::Goto(to) => {
                    debug_assert!(
                        node == NodeId::End || self.graph.has_edge(node, to),
                        "undeclared edge {} -> {}",
                        node,
                        to
                    );
                    node = to;
                }
                Next::Done(outcome) => break outcome,
            }
        };

        self.drain_ledger(state, started);
        self.checkpoint(state, "final").await;
        if let GraphOutcome::Completed(result) = &outcome {
            self.events.emit(EngineEvent::Complete {
                session_id: state.session_id,
                result: result.clone(),
            });
        }
        Ok(outcome)
    }

    /// Map the stored phase to the node to (re-)enter.
    fn entry_node(&self, state: &SessionState) -> Result<Option<NodeId>, EngineError> {
        let node = match state.phase {
            SessionPhase::Init => NodeId::Decompose,
            SessionPhase::Decomposed => NodeId::CollectContext,
            SessionPhase::Selecting => NodeId::SelectPersonas,
            SessionPhase::Initial => NodeId::InitialRound,
            SessionPhase::Debating => NodeId::FacilitatorDecide,
            SessionPhase::Recommending => NodeId::Recommend,
            SessionPhase::Synthesizing => NodeId::Synthesize,
            SessionPhase::Complete => return Ok(None),
            SessionPhase::Killed | SessionPhase::Expired => {
                return Err(EngineError::Internal(format!(
                    "session {} is {} and cannot run",
                    state.session_id, state.phase
                )));
            }
        };
        Ok(Some(node))
    }

    // ── Nodes ───────────────────────────────────────────────────────

    async fn node_decompose(&self, state: &mut SessionState) -> Result<Next, EngineError> {
        let business_context = self.collector.business_context().await;
        if let (Some(ctx), None) = (business_context.as_deref(), state.problem.context.as_deref())
        {
            state.problem.context = Some(ctx.to_string());
        }

        let decomposition = self
            .decomposer
            .decompose(&state.problem, business_context.as_deref())
            .await?;
        state.sub_problems = decomposition.sub_problems;
        state.information_gaps = decomposition.information_gaps;
        state.transition_to(SessionPhase::Decomposed)?;
        Ok(Next::Goto(NodeId::CollectContext))
    }

    async fn node_collect(&self, state: &mut SessionState) -> Result<Next, EngineError> {
        match self.collector.collect(state).await {
            CollectOutcome::Complete => {
                state.transition_to(SessionPhase::Selecting)?;
                Ok(Next::Goto(NodeId::SelectPersonas))
            }
            CollectOutcome::Paused { unanswered } => {
                // The graph pauses at this checkpoint; it never guesses.
                Ok(Next::Done(GraphOutcome::Paused { unanswered }))
            }
        }
    }

    async fn node_select(&self, state: &mut SessionState) -> Result<Next, EngineError> {
        // The primary sub-problem anchors the debate; the rest travel as
        // context. Highest complexity wins, first listed breaks ties.
        let primary = state
            .sub_problems
            .iter()
            .max_by_key(|sp| sp.complexity_score)
            .ok_or_else(|| EngineError::Internal("decomposition produced no sub-problems".into()))?
            .clone();

        state.current_sub_problem_id = Some(primary.id);
        state.set_max_rounds(primary.max_rounds().min(self.config.max_rounds_hard_cap));

        let personas = self.selector.select(&primary).await?;
        state.personas = personas;
        state.transition_to(SessionPhase::Initial)?;
        Ok(Next::Goto(NodeId::InitialRound))
    }

    async fn node_initial_round(&self, state: &mut SessionState) -> Result<Next, EngineError> {
        // Layer 5: the kill switch sits before every expensive node.
        if self.cost_exceeded(state) {
            state.safety.stop(StopReason::CostBudgetExceeded);
            state.transition_to(SessionPhase::Debating)?;
            return Ok(Next::Goto(NodeId::FacilitatorDecide));
        }

        state.advance_round()?;
        let outputs = crate::debate::initial_round(&self.broker, state).await?;
        for output in outputs {
            self.emit_contribution(state, &output.contribution);
            if let Some(query) = output.research_request {
                state.pending_research.push(query);
            }
            state.append_contribution(output.contribution)?;
        }
        self.spawn_round_summary(state, state.round_number);
        state.transition_to(SessionPhase::Debating)?;
        Ok(Next::Goto(NodeId::FacilitatorDecide))
    }

    async fn node_decide(&self, state: &mut SessionState) -> Result<(Next, Stash), EngineError> {
        // Safety stops and a spent round budget both end the debate.
        if state.safety.should_stop {
            return Ok((Next::Goto(NodeId::Recommend), Stash::None));
        }
        let bound = state.max_rounds.min(self.config.max_rounds_hard_cap);
        if state.round_number >= bound {
            state.safety.stop(StopReason::MaxRoundsReached);
            return Ok((Next::Goto(NodeId::Recommend), Stash::None));
        }
        if self.cost_exceeded(state) {
            state.safety.stop(StopReason::CostBudgetExceeded);
            return Ok((Next::Goto(NodeId::Recommend), Stash::None));
        }

        let (decision, _responses) = self.facilitator.decide(state, &self.moderator).await?;
        let (action, detail) = match &decision {
            FacilitatorDecision::Continue { speaker, reason } => {
                ("continue", format!("{}: {}", speaker, reason))
            }
            FacilitatorDecision::Moderate { kind, reason } => {
                ("moderate", format!("{}: {}", kind, reason))
            }
            FacilitatorDecision::Research { query } => ("research", query.clone()),
            FacilitatorDecision::Recommend { reason } => ("recommend", reason.clone()),
        };
        self.events.emit(EngineEvent::FacilitatorDecision {
            session_id: state.session_id,
            action: action.to_string(),
            detail,
        });

        Ok(match decision {
            FacilitatorDecision::Continue { speaker, reason } => (
                Next::Goto(NodeId::PersonaContribute),
                Stash::Speaker(speaker, reason),
            ),
            FacilitatorDecision::Moderate { kind, reason } => (
                Next::Goto(NodeId::ModeratorIntervene),
                Stash::Moderation(kind, reason),
            ),
            FacilitatorDecision::Research { query } => {
                (Next::Goto(NodeId::Research), Stash::Query(query))
            }
            FacilitatorDecision::Recommend { .. } => (Next::Goto(NodeId::Recommend), Stash::None),
        })
    }

    async fn node_persona(
        &self,
        state: &mut SessionState,
        code: PersonaCode,
        reason: String,
    ) -> Result<Next, EngineError> {
        if self.cost_exceeded(state) {
            state.safety.stop(StopReason::CostBudgetExceeded);
            return Ok(Next::Goto(NodeId::CheckConvergence));
        }
        match state.advance_round() {
            Ok(_) => {}
            Err(SessionStateError::RoundBudgetExceeded { .. }) => {
                state.safety.stop(StopReason::MaxRoundsReached);
                return Ok(Next::Goto(NodeId::CheckConvergence));
            }
            Err(e) => return Err(e.into()),
        }

        let persona = state
            .personas
            .iter()
            .find(|p| p.code == code)
            .cloned()
            .ok_or_else(|| {
                EngineError::Internal(format!("speaker '{}' not on the board", code))
            })?;

        let round = state.round_number;
        let output = crate::debate::persona_turn(
            &self.broker,
            state,
            &persona,
            PhaseTag::RoundDeliberation(round),
            &reason,
        )
        .await?;
        self.emit_contribution(state, &output.contribution);
        if let Some(query) = output.research_request {
            state.pending_research.push(query);
        }
        state.append_contribution(output.contribution)?;
        self.spawn_round_summary(state, round);
        Ok(Next::Goto(NodeId::CheckConvergence))
    }

    async fn node_moderator(
        &self,
        state: &mut SessionState,
        kind: ModeratorKind,
        reason: String,
    ) -> Result<Next, EngineError> {
        if self.cost_exceeded(state) {
            state.safety.stop(StopReason::CostBudgetExceeded);
            return Ok(Next::Goto(NodeId::CheckConvergence));
        }
        match state.advance_round() {
            Ok(_) => {}
            Err(SessionStateError::RoundBudgetExceeded { .. }) => {
                state.safety.stop(StopReason::MaxRoundsReached);
                return Ok(Next::Goto(NodeId::CheckConvergence));
            }
            Err(e) => return Err(e.into()),
        }

        let round = state.round_number;
        let turn = self.moderator.intervene(state, kind, &reason).await?;
        let contribution = Contribution {
            id: ContributionId::new(),
            persona_code: PersonaCode::new(format!("moderator_{}", turn.kind)),
            round_number: round,
            content: turn.content,
            thinking: turn.thinking,
            created_at: chrono::Utc::now(),
            tokens: turn.response.tokens.total(),
            cost: turn.response.cost.total,
            phase_tag: PhaseTag::ModeratorIntervention,
        };
        self.emit_contribution(state, &contribution);
        state.append_contribution(contribution)?;
        self.spawn_round_summary(state, round);
        Ok(Next::Goto(NodeId::CheckConvergence))
    }

    async fn node_research(
        &self,
        state: &mut SessionState,
        query: String,
    ) -> Result<Next, EngineError> {
        match self.researcher.research(&query).await {
            Ok(Some(findings)) => record_findings(state, &findings),
            Ok(None) => record_unavailable(state, &query),
            Err(e) => {
                // Research trouble is never fatal; the gap is recorded so
                // personas see it and deliberation proceeds.
                tracing::warn!("⚠ research failed for {:?} ({}); recording the gap", query, e);
                record_unavailable(state, &query);
            }
        }
        Ok(Next::Goto(NodeId::FacilitatorDecide))
    }

    async fn node_convergence(
        &self,
        state: &mut SessionState,
        conflict_streak: &mut u32,
    ) -> Result<Next, EngineError> {
        // Integrate the summary for round N−2; by now it should be ready,
        // and if not the await blocks only this session.
        if state.round_number >= 3 {
            let lagged = state.round_number - 2;
            if let Some((summary, _)) = self.summarizer.take(lagged).await {
                state.round_summaries.push(summary);
            }
        }

        if state.safety.should_stop {
            return Ok(Next::Goto(NodeId::Recommend));
        }

        let (signals, verdict) = self.convergence.check(state).await?;
        self.events.emit(EngineEvent::Convergence {
            session_id: state.session_id,
            round_number: state.round_number,
            signals,
        });

        // Layer 3: the round counter, checked after every contribution.
        let bound = state.max_rounds.min(self.config.max_rounds_hard_cap);
        if state.round_number >= bound {
            state.safety.stop(StopReason::MaxRoundsReached);
            return Ok(Next::Goto(NodeId::Recommend));
        }

        if self.convergence.is_high_conflict(&signals) {
            *conflict_streak += 1;
            if *conflict_streak >= DEADLOCK_STREAK {
                tracing::info!(
                    "deadlock: {} consecutive high-conflict rounds; forcing recommendations \
                     so synthesis can acknowledge the split",
                    conflict_streak
                );
                return Ok(Next::Goto(NodeId::Recommend));
            }
        } else {
            *conflict_streak = 0;
        }

        match verdict {
            ConvergenceVerdict::Stop => Ok(Next::Goto(NodeId::Recommend)),
            ConvergenceVerdict::Redirect => {
                let round = state.round_number;
                let message = self.facilitator.refocus_message(state);
                let refocus = Contribution {
                    id: ContributionId::new(),
                    persona_code: PersonaCode::from("facilitator"),
                    round_number: round,
                    content: message,
                    thinking: None,
                    created_at: chrono::Utc::now(),
                    tokens: 0,
                    cost: 0.0,
                    phase_tag: PhaseTag::RoundDeliberation(round),
                };
                self.emit_contribution(state, &refocus);
                state.append_contribution(refocus)?;
                Ok(Next::Goto(NodeId::FacilitatorDecide))
            }
            ConvergenceVerdict::Continue => Ok(Next::Goto(NodeId::FacilitatorDecide)),
        }
    }

    async fn node_recommend(&self, state: &mut SessionState) -> Result<Next, EngineError> {
        if state.phase != SessionPhase::Recommending {
            state.transition_to(SessionPhase::Recommending)?;
        }

        // Join every in-flight summary so its cost is accounted and late
        // summaries still enrich the export.
        for round in self.summarizer.pending_rounds() {
            if let Some((summary, _)) = self.summarizer.take(round).await {
                state.round_summaries.push(summary);
            }
        }
        state.round_summaries.sort_by_key(|s| s.round_number);

        let cost_stopped = state.safety.stop_reason == Some(StopReason::CostBudgetExceeded);
        if !cost_stopped && state.recommendations.is_empty() {
            let outputs = crate::debate::collect_recommendations(&self.broker, state).await?;
            for (recommendation, _) in outputs {
                self.events.emit(EngineEvent::Recommendation {
                    session_id: state.session_id,
                    persona_code: recommendation.persona_code.clone(),
                    recommendation_text: recommendation.recommendation_text.clone(),
                });
                state.recommendations.push(recommendation);
            }
        }
        Ok(Next::Goto(NodeId::Synthesize))
    }

    async fn node_synthesize(&self, state: &mut SessionState) -> Result<Next, EngineError> {
        if state.phase != SessionPhase::Synthesizing {
            state.transition_to(SessionPhase::Synthesizing)?;
        }

        if state.safety.stop_reason == Some(StopReason::CostBudgetExceeded)
            && !self.synthesis_affordable(state)
        {
            tracing::warn!(
                "session {} over budget with no headroom for synthesis; ending without it",
                state.session_id
            );
            return Ok(Next::Goto(NodeId::End));
        }

        let outcome = self.facilitator.synthesize(state).await?;
        state.synthesis_text = Some(outcome.synthesis_text);
        state.aggregation = Some(outcome.aggregation);
        Ok(Next::Goto(NodeId::End))
    }

    fn finish(&self, state: &mut SessionState) -> Result<GraphOutcome, EngineError> {
        let result = match state.safety.stop_reason {
            Some(StopReason::CostBudgetExceeded) => ResultCode::CostExceeded,
            Some(StopReason::SessionTimeout) => ResultCode::TimedOut,
            // A spent round budget is a normal way for a debate to end.
            _ => {
                state.transition_to(SessionPhase::Complete)?;
                ResultCode::Complete
            }
        };
        Ok(GraphOutcome::Completed(result))
    }

    // ── Support ─────────────────────────────────────────────────────

    /// Layer 5 predicate: recorded session cost plus anything sitting in
    /// the ledger awaiting a drain.
    fn cost_exceeded(&self, state: &SessionState) -> bool {
        state.metrics.total_cost + self.ledger.pending_cost() >= self.config.max_cost_per_session
    }

    /// After a cost stop, synthesis runs only if the projected cost of a
    /// synthesis-sized call (2× the session's mean call cost) still fits.
    fn synthesis_affordable(&self, state: &SessionState) -> bool {
        let projected = state.metrics.total_cost + 2.0 * state.metrics.mean_call_cost();
        projected <= self.config.max_cost_per_session
    }

    fn drain_ledger(&self, state: &mut SessionState, started: Instant) {
        for record in self.ledger.drain() {
            state.metrics.record_call(
                &record.phase_tag,
                record.cost,
                &record.tokens,
                record.retry_count,
            );
        }
        state.metrics.duration_ms = started.elapsed().as_millis() as u64;
    }

    /// Persist the session record and a per-node checkpoint. A failing
    /// store degrades to a warning: the session finishes in memory but is
    /// not resumable.
    async fn checkpoint(&self, state: &SessionState, node_key: &str) {
        if let Err(e) = self.store.save(state).await {
            tracing::warn!(
                "⚠ session record write failed at {} ({}); continuing in-memory — \
                 this session will not survive a process restart",
                node_key,
                e
            );
            return;
        }
        if let Err(e) =
            Checkpoints::write(self.store.as_ref(), state, node_key, Some(self.config.state_ttl))
                .await
        {
            tracing::warn!("⚠ checkpoint write failed at {}: {}", node_key, e);
        }
    }

    fn spawn_round_summary(&self, state: &SessionState, round: u32) {
        let contributions: Vec<Contribution> = state
            .contributions
            .iter()
            .filter(|c| c.round_number == round)
            .cloned()
            .collect();
        if contributions.is_empty() {
            return;
        }
        let goal = state
            .current_sub_problem()
            .map(|sp| sp.goal.clone())
            .unwrap_or_else(|| state.problem.description.clone());
        self.summarizer.spawn(round, contributions, goal);
    }

    fn emit_contribution(&self, state: &SessionState, contribution: &Contribution) {
        self.events.emit(EngineEvent::Contribution {
            session_id: state.session_id,
            persona_code: contribution.persona_code.clone(),
            round_number: contribution.round_number,
            content: contribution.content.clone(),
        });
    }

    /// Abort in-flight background work (session cancellation).
    pub fn abort_background(&self) {
        self.summarizer.abort_all();
    }
}

enum Stash {
    Speaker(PersonaCode, String),
    Moderation(ModeratorKind, String),
    Query(String),
    None,
}
