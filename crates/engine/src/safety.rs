//! Safety subsystem: ownership enforcement, kill authorization, audit
//!
//! Runaway prevention is five layers deep, each living where it bites:
//!
//! 1. Node-visit budget — [`crate::graph::MAX_NODE_VISITS`], enforced by
//!    the runner; exceeding it is fatal.
//! 2. Compile-time cycle check — [`crate::graph::GraphDefinition::compile`]
//!    refuses cycles without a conditional exit, before any model call.
//! 3. Round counter — monotonic in `SessionState`, checked after every
//!    contribution, absolute cap 15.
//! 4. Wall-clock watchdog — deadline checked at every node boundary.
//! 5. Cost kill switch — checked before every expensive node.
//!
//! This module owns what is left: who may kill a session, and the audit
//! trail for privileged operations.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, OwnershipError, SessionId};

/// Who is asking for a privileged operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// A regular user; must own the session.
    User(OwnerId),
    /// An administrator; bypasses ownership but is always audited.
    Admin { admin_id: String },
}

impl Actor {
    pub fn describe(&self) -> String {
        match self {
            Actor::User(owner) => format!("user:{}", owner),
            Actor::Admin { admin_id } => format!("admin:{}", admin_id),
        }
    }
}

/// Verify that `actor` may mutate a session owned by `owner_id`.
///
/// Users must match the owner recorded at creation; admins pass but the
/// caller must write an audit record.
pub fn authorize(
    session_id: SessionId,
    owner_id: &OwnerId,
    actor: &Actor,
) -> Result<(), OwnershipError> {
    match actor {
        Actor::User(caller) if caller == owner_id => Ok(()),
        Actor::User(caller) => Err(OwnershipError {
            session_id,
            caller: caller.clone(),
        }),
        Actor::Admin { .. } => Ok(()),
    }
}

/// One audited privileged operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub session_id: Option<SessionId>,
    pub reason: Option<String>,
}

/// In-memory audit trail, also mirrored to the log. Admin kills and
/// kill-alls always land here.
#[derive(Default)]
pub struct AuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        actor: &Actor,
        action: impl Into<String>,
        session_id: Option<SessionId>,
        reason: Option<String>,
    ) {
        let record = AuditRecord {
            timestamp: Utc::now(),
            actor: actor.describe(),
            action: action.into(),
            session_id,
            reason,
        };
        tracing::info!(
            "audit: {} {} session={:?} reason={:?}",
            record.actor,
            record.action,
            record.session_id.map(|id| id.to_string()),
            record.reason
        );
        self.records.lock().push(record);
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_may_act() {
        let owner = OwnerId::new("owner-a");
        let actor = Actor::User(owner.clone());
        assert!(authorize(SessionId::new(), &owner, &actor).is_ok());
    }

    #[test]
    fn test_non_owner_rejected() {
        let owner = OwnerId::new("owner-a");
        let actor = Actor::User(OwnerId::new("owner-b"));
        let err = authorize(SessionId::new(), &owner, &actor).unwrap_err();
        assert_eq!(err.caller, OwnerId::new("owner-b"));
    }

    #[test]
    fn test_admin_bypasses_ownership() {
        let owner = OwnerId::new("owner-a");
        let actor = Actor::Admin {
            admin_id: "ops-1".into(),
        };
        assert!(authorize(SessionId::new(), &owner, &actor).is_ok());
    }

    #[test]
    fn test_audit_log_captures_admin_kill() {
        let log = AuditLog::new();
        let actor = Actor::Admin {
            admin_id: "ops-1".into(),
        };
        let session_id = SessionId::new();
        log.record(&actor, "kill", Some(session_id), Some("incident".into()));

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].actor, "admin:ops-1");
        assert_eq!(records[0].action, "kill");
        assert_eq!(records[0].session_id, Some(session_id));
    }

    #[test]
    fn test_layer_constants_are_wired() {
        // Layer 1 budget covers 15 rounds of decide/speak/check plus
        // pipeline overhead, and layer 3's absolute cap is 15.
        assert_eq!(crate::graph::MAX_NODE_VISITS, 55);
        assert_eq!(crate::types::MAX_ROUNDS_HARD_CAP, 15);
    }
}
