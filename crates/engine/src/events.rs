//! Session-scoped event stream
//!
//! Every running session publishes typed events over a broadcast channel.
//! Front-ends subscribe to render progress; the engine never blocks on a
//! slow or absent subscriber.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::graph::convergence::ConvergenceSignals;
use crate::types::{PersonaCode, ResultCode, SessionId};

/// Channel capacity per session. Slow subscribers lose oldest events
/// (broadcast semantics), never stall the engine.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One event in a session's stream. JSON-serializable for any front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    NodeStart {
        session_id: SessionId,
        node: String,
    },
    NodeEnd {
        session_id: SessionId,
        node: String,
    },
    Contribution {
        session_id: SessionId,
        persona_code: PersonaCode,
        round_number: u32,
        content: String,
    },
    FacilitatorDecision {
        session_id: SessionId,
        action: String,
        detail: String,
    },
    Convergence {
        session_id: SessionId,
        round_number: u32,
        signals: ConvergenceSignals,
    },
    Recommendation {
        session_id: SessionId,
        persona_code: PersonaCode,
        recommendation_text: String,
    },
    Complete {
        session_id: SessionId,
        result: ResultCode,
    },
    Error {
        session_id: SessionId,
        message: String,
    },
}

/// Sender half bound to one session.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventSink {
    pub fn new() -> (Self, broadcast::Receiver<EngineEvent>) {
        let (sender, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    /// Emit an event. Absent subscribers are not an error.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
