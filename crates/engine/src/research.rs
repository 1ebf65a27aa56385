//! Research stage for EXTERNAL questions
//!
//! Every query is pre-validated with a cheap-model call (is it actually
//! external? already answered? too vague?) before the real research call.
//! Successful findings are cached by normalized-query hash in the state
//! store. The stub implementation answers nothing; the caller records
//! "research unavailable" so personas see the gap instead of assuming an
//! answer exists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::broker::{LlmBroker, LlmRequest, SystemSegment};
use crate::store::StateStore;
use crate::types::{EngineError, ModelRole, PhaseTag, SessionState};
use crate::xmlout::{extract_all_tags, extract_tag, preview};

/// Summarized findings for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchFindings {
    pub query: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

/// Answers EXTERNAL questions. The interface is stable; implementations
/// range from a full research pipeline to a recording stub.
#[async_trait]
pub trait Researcher: Send + Sync {
    /// Research one query. `Ok(None)` means research is unavailable or the
    /// query was rejected; deliberation proceeds without it.
    async fn research(&self, query: &str) -> Result<Option<ResearchFindings>, EngineError>;
}

/// Record an unavailable-research marker so downstream personas see the
/// gap instead of assuming the question was answered.
pub fn record_unavailable(state: &mut SessionState, query: &str) {
    state
        .research_context
        .push(format!("[research unavailable] {}", query));
}

/// Record findings into the session's research context.
pub fn record_findings(state: &mut SessionState, findings: &ResearchFindings) {
    let sources = if findings.sources.is_empty() {
        String::new()
    } else {
        format!(" (sources: {})", findings.sources.join(", "))
    };
    state
        .research_context
        .push(format!("[research] {}: {}{}", findings.query, findings.summary, sources));
}

/// Stub researcher: always unavailable.
pub struct StubResearcher;

#[async_trait]
impl Researcher for StubResearcher {
    async fn research(&self, query: &str) -> Result<Option<ResearchFindings>, EngineError> {
        tracing::debug!("research stubbed out; query {:?} goes unanswered", query);
        Ok(None)
    }
}

#[derive(Deserialize)]
struct ValidationOutput {
    valid: bool,
    #[serde(default)]
    reason: String,
}

/// Model-backed researcher with pre-validation and a normalized-query
/// cache.
pub struct LlmResearcher {
    broker: LlmBroker,
    store: Arc<dyn StateStore>,
    cache_ttl: Option<Duration>,
}

impl LlmResearcher {
    pub fn new(broker: LlmBroker, store: Arc<dyn StateStore>) -> Self {
        Self {
            broker,
            store,
            cache_ttl: None,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    fn cache_key(query: &str) -> String {
        let normalized = normalize_query(query);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        format!("research:{}", hex::encode(hasher.finalize()))
    }

    async fn validate(&self, query: &str) -> Result<Option<String>, EngineError> {
        let request = LlmRequest::new(ModelRole::Researcher, PhaseTag::Research, "research_validator")
            .with_system(vec![SystemSegment::plain(
                "You triage research queries. A query is valid only if it asks for \
                 external, factual information that research could answer, is specific \
                 enough to act on, and is not a question only the decision-maker could \
                 answer. Respond with JSON only.",
            )])
            .with_user(format!(
                "Query: {}\n\nRespond as {{\"valid\": true|false, \"reason\": \"...\"}}.",
                query
            ))
            .with_prefill("{\"")
            .with_temperature(0.0)
            .with_max_tokens(256);

        let response = self.broker.call(request).await?;
        match serde_json::from_str::<ValidationOutput>(&response.content) {
            Ok(v) if v.valid => Ok(None),
            Ok(v) => Ok(Some(if v.reason.is_empty() {
                "rejected by validator".to_string()
            } else {
                v.reason
            })),
            Err(e) => {
                // An unreadable verdict never blocks research.
                tracing::warn!(
                    "⚠ research validation unparseable ({}); proceeding as valid \
                     (payload: {:?})",
                    e,
                    preview(&response.content, 120)
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Researcher for LlmResearcher {
    async fn research(&self, query: &str) -> Result<Option<ResearchFindings>, EngineError> {
        let key = Self::cache_key(query);
        match self.store.get_raw(&key).await {
            Ok(Some(bytes)) => {
                if let Ok(cached) = serde_json::from_slice::<ResearchFindings>(&bytes) {
                    tracing::debug!("research cache hit for {:?}", query);
                    return Ok(Some(cached));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠ research cache read failed ({}); querying anyway", e),
        }

        if let Some(reason) = self.validate(query).await? {
            tracing::info!("research query {:?} rejected: {}", query, reason);
            return Ok(None);
        }

        let request = LlmRequest::new(ModelRole::Researcher, PhaseTag::Research, "researcher")
            .with_system(vec![SystemSegment::plain(
                "You answer factual research questions concisely for a decision-support \
                 panel. State what is known, note uncertainty, and cite the kind of \
                 source each claim rests on. Structure your answer as \
                 <findings>…</findings> and <sources><source>…</source></sources>.",
            )])
            .with_user(query.to_string())
            .with_temperature(0.2)
            .with_max_tokens(1024);

        let response = self.broker.call(request).await?;

        let summary = extract_tag(&response.content, "findings").unwrap_or_else(|| {
            tracing::warn!(
                "⚠ research findings tags absent; using full output (preview: {:?})",
                preview(&response.content, 120)
            );
            response.content.trim().to_string()
        });

        let findings = ResearchFindings {
            query: query.to_string(),
            summary,
            sources: extract_all_tags(&response.content, "source"),
        };

        match serde_json::to_vec(&findings) {
            Ok(bytes) => {
                if let Err(e) = self.store.put_raw(&key, bytes, self.cache_ttl).await {
                    tracing::warn!("⚠ research cache write failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("⚠ research findings serialization failed: {}", e),
        }

        Ok(Some(findings))
    }
}

/// Normalize a query for cache keying: case, whitespace, and trailing
/// punctuation are not distinguishing.
fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['?', '.', '!'])
        .to_string()
}
