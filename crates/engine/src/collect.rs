//! Context collection checkpoint
//!
//! Blocks the graph at a defined checkpoint to elicit user answers for
//! CRITICAL INTERNAL information gaps. NICE_TO_HAVE gaps are skipped.
//! When an answer is unavailable the session pauses — the engine never
//! guesses on the user's behalf.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::types::SessionState;

/// Supplies user answers at the context checkpoint.
///
/// `None` means the answer is not available through this source right now;
/// the graph pauses and the front-end resumes the session once the user
/// has answered.
#[async_trait]
pub trait AnswerSource: Send + Sync {
    /// Ask one critical internal question.
    async fn ask(&self, question: &str) -> Option<String>;

    /// Optional business context collected upstream of decomposition.
    async fn business_context(&self) -> Option<String> {
        None
    }
}

/// Answer source with a fixed question → answer map. Used by tests and by
/// front-ends that collect answers before starting the engine.
pub struct MapAnswerSource {
    answers: HashMap<String, String>,
    business_context: Option<String>,
}

impl MapAnswerSource {
    pub fn new(answers: HashMap<String, String>) -> Self {
        Self {
            answers,
            business_context: None,
        }
    }

    pub fn with_business_context(mut self, context: impl Into<String>) -> Self {
        self.business_context = Some(context.into());
        self
    }
}

#[async_trait]
impl AnswerSource for MapAnswerSource {
    async fn ask(&self, question: &str) -> Option<String> {
        self.answers.get(question).cloned()
    }

    async fn business_context(&self) -> Option<String> {
        self.business_context.clone()
    }
}

/// Source with no answers; every critical gap pauses the session.
pub struct NoAnswers;

#[async_trait]
impl AnswerSource for NoAnswers {
    async fn ask(&self, _question: &str) -> Option<String> {
        None
    }
}

/// Outcome of the collection checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Every critical internal gap has an answer; deliberation proceeds.
    Complete,
    /// One or more critical gaps are unanswered; the graph pauses here.
    Paused { unanswered: Vec<String> },
}

/// The collection stage.
pub struct ContextCollector {
    source: Arc<dyn AnswerSource>,
}

impl ContextCollector {
    pub fn new(source: Arc<dyn AnswerSource>) -> Self {
        Self { source }
    }

    /// Elicit answers for every unanswered CRITICAL INTERNAL gap, storing
    /// them in `internal_context`. Idempotent: already-answered questions
    /// are not asked again, so resume does not re-prompt.
    pub async fn collect(&self, state: &mut SessionState) -> CollectOutcome {
        let questions: Vec<String> = state
            .information_gaps
            .iter()
            .filter(|gap| gap.blocks_deliberation())
            .map(|gap| gap.question.clone())
            .collect();

        let skipped = state
            .information_gaps
            .iter()
            .filter(|gap| !gap.blocks_deliberation())
            .count();
        if skipped > 0 {
            tracing::debug!("{} non-blocking gaps deferred to research or skipped", skipped);
        }

        let mut unanswered = Vec::new();
        for question in questions {
            if state.internal_context.contains_key(&question) {
                continue;
            }
            match self.source.ask(&question).await {
                Some(answer) => {
                    state.internal_context.insert(question, answer);
                }
                None => unanswered.push(question),
            }
        }

        if unanswered.is_empty() {
            CollectOutcome::Complete
        } else {
            tracing::info!(
                "pausing at context checkpoint: {} critical gap(s) unanswered",
                unanswered.len()
            );
            CollectOutcome::Paused { unanswered }
        }
    }

    /// Business context gathered upstream, if the source has any.
    pub async fn business_context(&self) -> Option<String> {
        self.source.business_context().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        GapCategory, GapPriority, InformationGap, OwnerId, Problem,
    };

    fn state_with_gaps(gaps: Vec<InformationGap>) -> SessionState {
        let mut state = SessionState::new(OwnerId::new("o"), Problem::new("p"));
        state.information_gaps = gaps;
        state
    }

    fn critical_internal(q: &str) -> InformationGap {
        InformationGap::new(q, GapCategory::Internal, GapPriority::Critical)
    }

    #[tokio::test]
    async fn test_all_answered_completes() {
        let mut answers = HashMap::new();
        answers.insert("budget?".to_string(), "$50K".to_string());
        let collector = ContextCollector::new(Arc::new(MapAnswerSource::new(answers)));

        let mut state = state_with_gaps(vec![critical_internal("budget?")]);
        let outcome = collector.collect(&mut state).await;
        assert_eq!(outcome, CollectOutcome::Complete);
        assert_eq!(state.internal_context.get("budget?").unwrap(), "$50K");
    }

    #[tokio::test]
    async fn test_missing_answer_pauses() {
        let collector = ContextCollector::new(Arc::new(NoAnswers));
        let mut state = state_with_gaps(vec![critical_internal("runway?")]);
        let outcome = collector.collect(&mut state).await;
        assert_eq!(
            outcome,
            CollectOutcome::Paused {
                unanswered: vec!["runway?".to_string()]
            }
        );
        assert!(state.internal_context.is_empty());
    }

    #[tokio::test]
    async fn test_nice_to_have_and_external_skipped() {
        let collector = ContextCollector::new(Arc::new(NoAnswers));
        let mut state = state_with_gaps(vec![
            InformationGap::new("team size?", GapCategory::Internal, GapPriority::NiceToHave),
            InformationGap::new("market size?", GapCategory::External, GapPriority::Critical),
        ]);
        // Neither gap blocks, so an answerless source still completes.
        let outcome = collector.collect(&mut state).await;
        assert_eq!(outcome, CollectOutcome::Complete);
    }

    #[tokio::test]
    async fn test_resume_does_not_reask() {
        let mut answers = HashMap::new();
        answers.insert("budget?".to_string(), "changed answer".to_string());
        let collector = ContextCollector::new(Arc::new(MapAnswerSource::new(answers)));

        let mut state = state_with_gaps(vec![critical_internal("budget?")]);
        state
            .internal_context
            .insert("budget?".to_string(), "original answer".to_string());

        let outcome = collector.collect(&mut state).await;
        assert_eq!(outcome, CollectOutcome::Complete);
        // The stored answer from before the pause wins.
        assert_eq!(
            state.internal_context.get("budget?").unwrap(),
            "original answer"
        );
    }

    #[tokio::test]
    async fn test_partial_answers_pause_with_remaining() {
        let mut answers = HashMap::new();
        answers.insert("budget?".to_string(), "$50K".to_string());
        let collector = ContextCollector::new(Arc::new(MapAnswerSource::new(answers)));

        let mut state = state_with_gaps(vec![
            critical_internal("budget?"),
            critical_internal("deadline?"),
        ]);
        let outcome = collector.collect(&mut state).await;
        assert_eq!(
            outcome,
            CollectOutcome::Paused {
                unanswered: vec!["deadline?".to_string()]
            }
        );
        // The answered gap is retained for the resume.
        assert_eq!(state.internal_context.len(), 1);
    }
}
