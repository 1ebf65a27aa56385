//! Board of One deliberation engine
//!
//! Takes one natural-language problem statement and produces a
//! synthesized, advisory recommendation by orchestrating a panel of
//! LLM-driven expert personas through a structured multi-round debate:
//! decompose → collect context → select personas → initial round →
//! (facilitate ↔ contribute ↔ converge)* → recommend → synthesize.
//!
//! All output is advisory; the engine never decides on the user's behalf.

pub mod broker;
pub mod collect;
pub mod config;
pub mod context;
pub mod debate;
pub mod decompose;
pub mod embedding;
pub mod events;
pub mod export;
pub mod facilitate;
pub mod graph;
pub mod metrics;
pub mod moderate;
pub mod personas;
pub mod research;
pub mod safety;
pub mod session;
pub mod store;
pub mod summarize;
pub mod types;
pub mod xmlout;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export the surface most consumers need.
pub use broker::{AnthropicProvider, ChatProvider, LlmBroker, LlmRequest, LlmResponse};
pub use collect::{AnswerSource, MapAnswerSource, NoAnswers};
pub use config::EngineConfig;
pub use events::{EngineEvent, EventSink};
pub use export::{to_json, to_markdown};
pub use facilitate::ADVISORY_DISCLAIMER;
pub use graph::{GraphOutcome, GraphRunner};
pub use metrics::MetricsReport;
pub use personas::PersonaCatalog;
pub use research::{LlmResearcher, Researcher, StubResearcher};
pub use safety::{Actor, AuditLog};
pub use session::SessionManager;
pub use store::{FileStore, MemoryStore, ResilientStore, StateStore};
pub use types::{
    EngineError, OwnerId, Problem, ResultCode, SessionId, SessionPhase, SessionState,
};
