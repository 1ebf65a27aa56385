//! Error taxonomy for the deliberation engine
//!
//! Recoverable errors are handled at the node that owns them and logged
//! with a ⚠ marker. Errors that would violate a session invariant are
//! fatal and surface as `EngineError`; safety stops are reported through
//! `SafetyFlags`, not through this taxonomy.

use thiserror::Error;

use super::session::SessionStateError;
use super::{OwnerId, SessionId};

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Session state error: {0}")]
    SessionState(#[from] SessionStateError),

    #[error("Ownership violation: {0}")]
    Ownership(#[from] OwnershipError),

    #[error("Persona catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Unresolved critical information gap: {question}")]
    InformationGapUnresolved { question: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from the single LLM call path.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Overloaded, timeout, 5xx: retried by the broker, invisible to the
    /// graph unless retries exhaust.
    #[error("Transient model error: {0}")]
    Transient(String),

    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// 4xx other than 429: surfaced immediately.
    #[error("Permanent model error ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("No model configured for role '{0}'")]
    UnknownRole(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

impl BrokerError {
    /// Whether the broker should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Transient(_) | BrokerError::RateLimited { .. }
        )
    }
}

/// Errors from the embedding client.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    Request(String),

    #[error("Embedding response malformed: {0}")]
    Malformed(String),

    #[error("Missing credential: {0}")]
    MissingCredential(String),
}

/// Errors from the state store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session {0} not found")]
    NotFound(SessionId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors from compiling or running the deliberation graph.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph compile error: cycle through node '{node}' has no conditional exit")]
    UncontrolledCycle { node: String },

    #[error("Graph compile error: {0}")]
    Invalid(String),

    #[error("Node visit budget exceeded: {visits} visits (limit {limit})")]
    RecursionLimit { visits: u32, limit: u32 },

    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },
}

/// Permission error on an owner-scoped mutation.
#[derive(Error, Debug)]
#[error("caller '{caller}' does not own session {session_id}")]
pub struct OwnershipError {
    pub session_id: SessionId,
    pub caller: OwnerId,
}

/// Errors loading or validating the persona catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog parse error: {0}")]
    Parse(String),

    #[error("Unknown persona code '{0}'")]
    UnknownCode(String),

    #[error("Duplicate persona code '{0}'")]
    DuplicateCode(String),

    #[error("Catalog file not found: {0}")]
    FileNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_retryable_split() {
        assert!(BrokerError::Transient("overloaded".into()).is_retryable());
        assert!(BrokerError::RateLimited {
            retry_after_ms: Some(2000)
        }
        .is_retryable());
        assert!(!BrokerError::Permanent {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!BrokerError::Parse("no tag".into()).is_retryable());
    }

    #[test]
    fn test_error_conversion_chain() {
        let err: EngineError = BrokerError::Transient("timeout".into()).into();
        assert!(matches!(err, EngineError::Broker(_)));

        let err: EngineError = GraphError::RecursionLimit {
            visits: 56,
            limit: 55,
        }
        .into();
        assert!(err.to_string().contains("visit budget"));
    }

    #[test]
    fn test_ownership_error_message() {
        let err = OwnershipError {
            session_id: SessionId::new(),
            caller: OwnerId::new("intruder"),
        };
        assert!(err.to_string().contains("intruder"));
    }
}
