//! Session lifecycle API
//!
//! The surface any front-end consumes: create, start, stream events,
//! pause, resume, kill (user and admin), and read. Active sessions live
//! in a single registry keyed by session id; only the session's own task
//! mutates its state, and every user-scoped operation verifies ownership.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{AnthropicProvider, ChatProvider, LlmBroker};
use crate::collect::AnswerSource;
use crate::config::EngineConfig;
use crate::embedding::{CachedEmbeddings, EmbeddingClient, HttpEmbeddingClient, MockEmbedder};
use crate::events::{EngineEvent, EventSink};
use crate::graph::{GraphOutcome, GraphRunner};
use crate::personas::PersonaCatalog;
use crate::research::{LlmResearcher, Researcher};
use crate::safety::{authorize, Actor, AuditLog};
use crate::store::{Checkpoints, FileStore, SessionSummary, StateStore};
use crate::types::{
    EngineError, OwnerId, Problem, ResultCode, SessionId, SessionPhase, SessionState, StoreError,
};

/// Grace period for tasks to reach a node boundary during shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct SessionHandle {
    task: JoinHandle<()>,
    events: EventSink,
}

/// The engine's session registry and lifecycle API.
pub struct SessionManager {
    config: EngineConfig,
    broker: LlmBroker,
    store: Arc<dyn StateStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    researcher: Arc<dyn Researcher>,
    catalog: PersonaCatalog,
    active: Arc<DashMap<SessionId, SessionHandle>>,
    audit: AuditLog,
}

impl SessionManager {
    /// Assemble a manager from explicit parts (the seam tests use).
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn ChatProvider>,
        store: Arc<dyn StateStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        researcher: Option<Arc<dyn Researcher>>,
        catalog: PersonaCatalog,
    ) -> Self {
        let broker = LlmBroker::new(provider, &config);
        let researcher = researcher
            .unwrap_or_else(|| Arc::new(LlmResearcher::new(broker.clone(), store.clone())));
        Self {
            config,
            broker,
            store,
            embeddings,
            researcher,
            catalog,
            active: Arc::new(DashMap::new()),
            audit: AuditLog::new(),
        }
    }

    /// Assemble the production manager from environment configuration:
    /// Anthropic chat provider, file-backed store, cached embeddings.
    pub fn from_config(config: EngineConfig) -> Result<Self, EngineError> {
        let api_key = config.llm_api_key.clone().ok_or_else(|| {
            EngineError::Broker(crate::types::BrokerError::MissingCredential(
                "LLM_API_KEY".into(),
            ))
        })?;
        let provider: Arc<dyn ChatProvider> =
            Arc::new(AnthropicProvider::new(api_key, config.llm_base_url.clone())?);

        let store: Arc<dyn StateStore> = Arc::new(
            FileStore::open(config.state_dir.clone())?.with_default_ttl(config.state_ttl),
        );

        let raw_embedder: Arc<dyn EmbeddingClient> = match config.embed_api_key.as_deref() {
            Some(key) => Arc::new(
                HttpEmbeddingClient::new(key, config.embed_base_url.clone(), config.embed_model.clone())?,
            ),
            None => Arc::new(MockEmbedder::new()),
        };
        let embeddings: Arc<dyn EmbeddingClient> = Arc::new(
            CachedEmbeddings::new(raw_embedder, store.clone()).with_ttl(config.state_ttl),
        );

        Ok(Self::new(
            config,
            provider,
            store,
            embeddings,
            None,
            PersonaCatalog::builtin(),
        ))
    }

    // ── Creation & reads ────────────────────────────────────────────

    /// Create a session. The caller becomes the owner for its lifetime.
    pub async fn create_session(
        &self,
        owner: OwnerId,
        problem_statement: impl Into<String>,
        context: Option<String>,
    ) -> Result<(SessionId, SessionPhase), EngineError> {
        let mut problem = Problem::new(problem_statement);
        problem.context = context;
        let state = SessionState::new(owner, problem);
        self.store.save(&state).await?;
        tracing::info!(
            "session {} created by {}",
            state.session_id,
            state.owner_id
        );
        Ok((state.session_id, state.phase))
    }

    /// Read a session. Owners see their own; admins see any.
    pub async fn get(
        &self,
        session_id: SessionId,
        actor: &Actor,
    ) -> Result<SessionState, EngineError> {
        let state = self.store.load(session_id).await?;
        authorize(session_id, &state.owner_id, actor)?;
        Ok(state)
    }

    /// Sessions owned by the calling user.
    pub async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<SessionSummary>, EngineError> {
        Ok(self.store.list_by_owner(owner).await?)
    }

    /// All active sessions. Admin-only.
    pub async fn list_active(&self, actor: &Actor) -> Result<Vec<SessionSummary>, EngineError> {
        match actor {
            Actor::Admin { .. } => Ok(self.store.list_active().await?),
            Actor::User(_) => Err(EngineError::Internal(
                "list_active requires an admin actor".into(),
            )),
        }
    }

    /// Subscribe to a running session's event stream.
    pub fn events(
        &self,
        session_id: SessionId,
    ) -> Result<broadcast::Receiver<EngineEvent>, EngineError> {
        self.active
            .get(&session_id)
            .map(|handle| handle.events.subscribe())
            .ok_or_else(|| EngineError::Store(StoreError::NotFound(session_id)))
    }

    // ── Running ─────────────────────────────────────────────────────

    /// Start deliberation as a background task. Returns an event receiver.
    pub async fn start(
        &self,
        session_id: SessionId,
        actor: &Actor,
        answers: Arc<dyn AnswerSource>,
    ) -> Result<broadcast::Receiver<EngineEvent>, EngineError> {
        let state = self.load_for_run(session_id, actor).await?;
        if self.active.contains_key(&session_id) {
            return Err(EngineError::Internal(format!(
                "session {} is already running",
                session_id
            )));
        }

        let (events, receiver) = EventSink::new();
        let runner = self.build_runner(answers, events.clone())?;
        let active = self.active.clone();

        // The task waits for its registry entry before running, so it can
        // never finish (and deregister) before it was registered.
        let registered = Arc::new(tokio::sync::Notify::new());
        let task = tokio::spawn({
            let events = events.clone();
            let registered = registered.clone();
            async move {
                registered.notified().await;
                let mut state = state;
                match runner.run(&mut state).await {
                    Ok(outcome) => {
                        tracing::info!("session {} finished: {:?}", state.session_id, outcome)
                    }
                    Err(e) => {
                        tracing::error!("session {} failed: {}", state.session_id, e);
                        events.emit(EngineEvent::Error {
                            session_id: state.session_id,
                            message: e.to_string(),
                        });
                        events.emit(EngineEvent::Complete {
                            session_id: state.session_id,
                            result: ResultCode::Failed(e.to_string()),
                        });
                    }
                }
                active.remove(&state.session_id);
            }
        });

        self.active
            .insert(session_id, SessionHandle { task, events });
        registered.notify_one();
        Ok(receiver)
    }

    /// Run a session inline to its terminal outcome (the CLI path).
    pub async fn run_to_completion(
        &self,
        session_id: SessionId,
        actor: &Actor,
        answers: Arc<dyn AnswerSource>,
    ) -> Result<(SessionState, GraphOutcome), EngineError> {
        let mut state = self.load_for_run(session_id, actor).await?;
        let (events, _receiver) = EventSink::new();
        let runner = self.build_runner(answers, events)?;
        let outcome = runner.run(&mut state).await?;
        Ok((state, outcome))
    }

    /// Pause a running session. The latest node-boundary checkpoint is
    /// already persisted; the task is cancelled and in-flight model calls
    /// are abandoned.
    pub async fn pause(&self, session_id: SessionId, actor: &Actor) -> Result<(), EngineError> {
        let state = self.store.load(session_id).await?;
        authorize(session_id, &state.owner_id, actor)?;

        let Some((_, handle)) = self.active.remove(&session_id) else {
            return Err(EngineError::Internal(format!(
                "session {} is not running",
                session_id
            )));
        };
        handle.task.abort();
        tracing::info!("session {} paused at its latest checkpoint", session_id);
        Ok(())
    }

    /// Resume a paused session from its latest checkpoint.
    pub async fn resume(
        &self,
        session_id: SessionId,
        actor: &Actor,
        answers: Arc<dyn AnswerSource>,
    ) -> Result<broadcast::Receiver<EngineEvent>, EngineError> {
        self.start(session_id, actor, answers).await
    }

    // ── Kill switches ───────────────────────────────────────────────

    /// User-scoped kill: verified against the owner or rejected.
    pub async fn kill(
        &self,
        session_id: SessionId,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<ResultCode, EngineError> {
        let state = self.store.load(session_id).await?;
        authorize(session_id, &state.owner_id, actor)?;

        let result = match actor {
            Actor::User(_) => ResultCode::KilledByUser,
            Actor::Admin { .. } => ResultCode::KilledByAdmin,
        };
        if matches!(actor, Actor::Admin { .. }) {
            self.audit
                .record(actor, "kill", Some(session_id), reason.clone());
        }
        self.terminate(session_id, actor, reason).await?;
        Ok(result)
    }

    /// Global admin kill: snapshots the registry once and kills the
    /// snapshot. Sessions created after enumeration are not observed.
    pub async fn kill_all(
        &self,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<usize, EngineError> {
        let Actor::Admin { .. } = actor else {
            return Err(EngineError::Internal(
                "kill_all requires an admin actor".into(),
            ));
        };
        self.audit.record(actor, "kill_all", None, reason.clone());

        let snapshot: Vec<SessionId> = self.active.iter().map(|entry| *entry.key()).collect();
        let mut killed = 0;
        for session_id in snapshot {
            match self.terminate(session_id, actor, reason.clone()).await {
                Ok(()) => killed += 1,
                Err(e) => tracing::warn!("⚠ kill_all skipped {}: {}", session_id, e),
            }
        }
        Ok(killed)
    }

    async fn terminate(
        &self,
        session_id: SessionId,
        actor: &Actor,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some((_, handle)) = self.active.remove(&session_id) {
            handle.task.abort();
        }

        let mut state = self.store.load(session_id).await?;
        if !state.phase.is_terminal() {
            let reason_text = reason.unwrap_or_else(|| format!("killed by {}", actor.describe()));
            state.kill(reason_text)?;
            self.store.save(&state).await?;
        }
        Ok(())
    }

    /// Graceful shutdown: cancel every active task, give them a grace
    /// period, and rely on node-boundary checkpoints already persisted.
    pub async fn shutdown(&self) {
        let snapshot: Vec<SessionId> = self.active.iter().map(|entry| *entry.key()).collect();
        if snapshot.is_empty() {
            return;
        }
        tracing::info!(
            "shutting down: cancelling {} active session task(s)",
            snapshot.len()
        );
        for session_id in snapshot {
            if let Some((_, handle)) = self.active.remove(&session_id) {
                handle.task.abort();
            }
        }
        tokio::time::sleep(SHUTDOWN_GRACE.min(Duration::from_millis(100))).await;
    }

    /// Audit records written so far (admin operations).
    pub fn audit_records(&self) -> Vec<crate::safety::AuditRecord> {
        self.audit.records()
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn load_for_run(
        &self,
        session_id: SessionId,
        actor: &Actor,
    ) -> Result<SessionState, EngineError> {
        // Prefer the latest checkpoint; fall back to the session record.
        let state = match Checkpoints::read_latest(self.store.as_ref(), session_id).await? {
            Some(checkpoint) => checkpoint,
            None => self.store.load(session_id).await?,
        };
        authorize(session_id, &state.owner_id, actor)?;
        if matches!(state.phase, SessionPhase::Killed | SessionPhase::Expired) {
            return Err(EngineError::Internal(format!(
                "session {} is {} and cannot run",
                session_id, state.phase
            )));
        }
        Ok(state)
    }

    fn build_runner(
        &self,
        answers: Arc<dyn AnswerSource>,
        events: EventSink,
    ) -> Result<GraphRunner, EngineError> {
        Ok(GraphRunner::new(
            self.config.clone(),
            &self.broker,
            self.store.clone(),
            self.embeddings.clone(),
            self.researcher.clone(),
            answers,
            self.catalog.clone(),
            events,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::NoAnswers;
    use crate::research::{Researcher, StubResearcher};
    use crate::store::MemoryStore;
    use crate::testutil::{HashEmbedder, RoutingProvider};
    use crate::types::SessionPhase;

    fn manager() -> (SessionManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(
            EngineConfig::default(),
            Arc::new(RoutingProvider::new()),
            store.clone(),
            Arc::new(HashEmbedder),
            Some(Arc::new(StubResearcher) as Arc<dyn Researcher>),
            PersonaCatalog::builtin(),
        );
        (manager, store)
    }

    fn user(name: &str) -> Actor {
        Actor::User(OwnerId::new(name))
    }

    fn admin() -> Actor {
        Actor::Admin {
            admin_id: "ops".into(),
        }
    }

    #[tokio::test]
    async fn test_create_records_owner() {
        let (m, _) = manager();
        let (id, phase) = m
            .create_session(OwnerId::new("owner-a"), "axis:0 decide", None)
            .await
            .unwrap();
        assert_eq!(phase, SessionPhase::Init);
        let state = m.get(id, &user("owner-a")).await.unwrap();
        assert_eq!(state.owner_id, OwnerId::new("owner-a"));
    }

    #[tokio::test]
    async fn test_owner_isolation_on_get_and_kill() {
        let (m, _) = manager();
        let (id, _) = m
            .create_session(OwnerId::new("owner-a"), "axis:0 decide", None)
            .await
            .unwrap();

        // Owner B sees a permission error on get and kill.
        assert!(matches!(
            m.get(id, &user("owner-b")).await.unwrap_err(),
            EngineError::Ownership(_)
        ));
        assert!(matches!(
            m.kill(id, &user("owner-b"), None).await.unwrap_err(),
            EngineError::Ownership(_)
        ));

        // Admin kill succeeds and is audited.
        let result = m.kill(id, &admin(), Some("incident".into())).await.unwrap();
        assert_eq!(result, ResultCode::KilledByAdmin);
        assert_eq!(m.audit_records().len(), 1);

        let state = m.get(id, &admin()).await.unwrap();
        assert_eq!(state.phase, SessionPhase::Killed);
        assert_eq!(state.kill_reason.as_deref(), Some("incident"));
    }

    #[tokio::test]
    async fn test_list_by_owner_excludes_others() {
        let (m, _) = manager();
        m.create_session(OwnerId::new("owner-a"), "p1", None)
            .await
            .unwrap();
        m.create_session(OwnerId::new("owner-b"), "p2", None)
            .await
            .unwrap();

        let mine = m.list_by_owner(&OwnerId::new("owner-b")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].owner_id, OwnerId::new("owner-b"));
    }

    #[tokio::test]
    async fn test_list_active_is_admin_only() {
        let (m, _) = manager();
        assert!(m.list_active(&user("owner-a")).await.is_err());
        assert!(m.list_active(&admin()).await.is_ok());
    }

    #[tokio::test]
    async fn test_user_kill_own_session() {
        let (m, _) = manager();
        let (id, _) = m
            .create_session(OwnerId::new("owner-a"), "p", None)
            .await
            .unwrap();
        let result = m
            .kill(id, &user("owner-a"), Some("changed my mind".into()))
            .await
            .unwrap();
        assert_eq!(result, ResultCode::KilledByUser);
        // User kills are not audited; only admin operations are.
        assert!(m.audit_records().is_empty());
    }

    #[tokio::test]
    async fn test_killed_session_cannot_start() {
        let (m, _) = manager();
        let (id, _) = m
            .create_session(OwnerId::new("owner-a"), "p", None)
            .await
            .unwrap();
        m.kill(id, &user("owner-a"), None).await.unwrap();
        let err = m
            .run_to_completion(id, &user("owner-a"), Arc::new(NoAnswers))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot run"));
    }

    #[tokio::test]
    async fn test_run_to_completion_full_session() {
        let (m, store) = manager();
        let (id, _) = m
            .create_session(OwnerId::new("owner-a"), "axis:0 decide the question", None)
            .await
            .unwrap();

        let (state, outcome) = m
            .run_to_completion(id, &user("owner-a"), Arc::new(NoAnswers))
            .await
            .unwrap();
        assert_eq!(outcome, GraphOutcome::Completed(ResultCode::Complete));
        assert_eq!(state.phase, SessionPhase::Complete);
        // The stored record reflects completion.
        assert_eq!(
            store.load(id).await.unwrap().phase,
            SessionPhase::Complete
        );
    }

    #[tokio::test]
    async fn test_background_start_and_events() {
        let (m, _) = manager();
        let (id, _) = m
            .create_session(OwnerId::new("owner-a"), "axis:0 decide", None)
            .await
            .unwrap();

        let mut receiver = m
            .start(id, &user("owner-a"), Arc::new(NoAnswers))
            .await
            .unwrap();

        // Drain events until completion.
        let mut completed = false;
        while let Ok(event) = receiver.recv().await {
            if matches!(event, EngineEvent::Complete { .. }) {
                completed = true;
                break;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (m, _) = manager();
        let (id, _) = m
            .create_session(OwnerId::new("owner-a"), "axis:0 decide", None)
            .await
            .unwrap();
        let _receiver = m
            .start(id, &user("owner-a"), Arc::new(NoAnswers))
            .await
            .unwrap();
        let err = m.start(id, &user("owner-a"), Arc::new(NoAnswers)).await;
        // Either already running, or it finished fast enough that the
        // second start re-runs a completed session and is a no-op.
        if let Err(e) = err {
            assert!(e.to_string().contains("already running"));
        }
    }

    #[tokio::test]
    async fn test_kill_all_snapshot() {
        let (m, _) = manager();
        let (a, _) = m
            .create_session(OwnerId::new("owner-a"), "axis:0 one", None)
            .await
            .unwrap();
        let (b, _) = m
            .create_session(OwnerId::new("owner-b"), "axis:0 two", None)
            .await
            .unwrap();
        let _ra = m.start(a, &user("owner-a"), Arc::new(NoAnswers)).await.unwrap();
        let _rb = m.start(b, &user("owner-b"), Arc::new(NoAnswers)).await.unwrap();

        let killed = m.kill_all(&admin(), Some("maintenance".into())).await.unwrap();
        assert!(killed <= 2);
        assert!(m
            .audit_records()
            .iter()
            .any(|r| r.action == "kill_all"));
    }

    #[tokio::test]
    async fn test_kill_all_requires_admin() {
        let (m, _) = manager();
        assert!(m.kill_all(&user("owner-a"), None).await.is_err());
    }
}
