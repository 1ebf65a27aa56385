//! LLM broker: the sole path from the engine to any language model
//!
//! Every model call in the engine goes through [`LlmBroker::call`]. The
//! broker resolves the logical role to a concrete model, enforces the
//! retry policy, re-prepends prefill seeds, computes cost from the price
//! table, and surfaces cache token counts on every response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::EngineConfig;
use crate::types::{BrokerError, ModelRole, PhaseTag, TokenTotals};

pub mod pricing;
pub mod provider;

pub use pricing::{CostBreakdown, ModelPricing, PriceTable};
pub use provider::{AnthropicProvider, ChatProvider, ProviderRequest, ProviderResponse, SystemSegment};

/// A role-level request from a graph node.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: Vec<SystemSegment>,
    pub user_message: String,
    /// Assistant-turn seed, re-prepended to the returned content. The
    /// canonical fix for parsers that expect a leading brace or tag.
    pub prefill: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub model_role: ModelRole,
    pub phase_tag: PhaseTag,
    /// Free-form caller identity for metrics (persona code, "facilitator", …).
    pub agent_type: String,
}

impl LlmRequest {
    pub fn new(role: ModelRole, phase_tag: PhaseTag, agent_type: impl Into<String>) -> Self {
        Self {
            system: Vec::new(),
            user_message: String::new(),
            prefill: None,
            temperature: 0.7,
            max_tokens: 2048,
            model_role: role,
            phase_tag,
            agent_type: agent_type.into(),
        }
    }

    pub fn with_system(mut self, segments: Vec<SystemSegment>) -> Self {
        self.system = segments;
        self
    }

    pub fn with_user(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_prefill(mut self, prefill: impl Into<String>) -> Self {
        self.prefill = Some(prefill.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A fully accounted broker response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Model output with any prefill seed re-prepended.
    pub content: String,
    pub tokens: TokenTotals,
    pub cost: CostBreakdown,
    pub duration_ms: u64,
    /// Fraction of prompt tokens served from the provider cache on this call.
    pub cache_hit_rate: f64,
    pub request_id: String,
    pub model: String,
    pub retry_count: u32,
    pub phase_tag: PhaseTag,
    pub agent_type: String,
}

/// One accounted call, as appended to a session's cost ledger.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub phase_tag: PhaseTag,
    pub agent_type: String,
    pub cost: f64,
    pub tokens: TokenTotals,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub model: String,
    pub cache_hit_rate: f64,
}

/// Session-scoped ledger the broker appends every finished call to. The
/// graph drains it into the session metrics at node boundaries, which is
/// how detached tasks (summaries) get accounted without touching the
/// session state themselves.
#[derive(Default)]
pub struct CostLedger {
    records: parking_lot::Mutex<Vec<CallRecord>>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: CallRecord) {
        self.records.lock().push(record);
    }

    /// Take every record accumulated since the last drain.
    pub fn drain(&self) -> Vec<CallRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Cost recorded but not yet drained.
    pub fn pending_cost(&self) -> f64 {
        self.records.lock().iter().map(|r| r.cost).sum()
    }
}

/// Exponential backoff with jitter; 429 respects the server hint capped
/// by `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), honoring a server
    /// supplied retry-after hint when present.
    fn delay_for(&self, attempt: u32, server_hint_ms: Option<u64>) -> Duration {
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let base = match server_hint_ms {
            Some(hint) => Duration::from_millis(hint).min(self.max_delay),
            None => backoff,
        };
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64)
        };
        base + Duration::from_millis(jitter_ms)
    }
}

/// The broker. Clone-cheap; shared across all nodes of a session.
#[derive(Clone)]
pub struct LlmBroker {
    provider: Arc<dyn ChatProvider>,
    role_models: HashMap<ModelRole, String>,
    prices: PriceTable,
    retry: RetryPolicy,
    ledger: Option<Arc<CostLedger>>,
}

impl LlmBroker {
    pub fn new(provider: Arc<dyn ChatProvider>, config: &EngineConfig) -> Self {
        let role_models = ModelRole::ALL
            .iter()
            .map(|role| (*role, config.model_for_role(*role).to_string()))
            .collect();
        Self {
            provider,
            role_models,
            prices: PriceTable::default(),
            retry: RetryPolicy::default(),
            ledger: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// A clone of this broker that appends every call to `ledger`. Used to
    /// scope accounting to one session.
    pub fn with_ledger(&self, ledger: Arc<CostLedger>) -> Self {
        let mut broker = self.clone();
        broker.ledger = Some(ledger);
        broker
    }

    pub fn with_price_table(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    /// Concrete model id for a role.
    pub fn model_for(&self, role: ModelRole) -> Result<&str, BrokerError> {
        self.role_models
            .get(&role)
            .map(|s| s.as_str())
            .ok_or_else(|| BrokerError::UnknownRole(role.to_string()))
    }

    /// Perform one model call with retries, cost accounting, and prefill
    /// re-prepending.
    pub async fn call(&self, request: LlmRequest) -> Result<LlmResponse, BrokerError> {
        let model = self.model_for(request.model_role)?.to_string();
        let provider_request = ProviderRequest {
            model: model.clone(),
            system: request.system.clone(),
            user_message: request.user_message.clone(),
            prefill: request.prefill.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let start = Instant::now();
        let mut retry_count = 0u32;
        let mut last_error: Option<BrokerError> = None;

        for attempt in 0..self.retry.max_attempts {
            match self.provider.send(&provider_request).await {
                Ok(raw) => {
                    return Ok(self.finish(request, raw, model, retry_count, start));
                }
                Err(err) if err.is_retryable() => {
                    let hint = match &err {
                        BrokerError::RateLimited { retry_after_ms } => *retry_after_ms,
                        _ => None,
                    };
                    let remaining = self.retry.max_attempts - attempt - 1;
                    if remaining == 0 {
                        last_error = Some(err);
                        break;
                    }
                    let delay = self.retry.delay_for(attempt, hint);
                    tracing::warn!(
                        "⚠ model call transient failure (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.retry.max_attempts,
                        delay,
                        err
                    );
                    retry_count += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(BrokerError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn finish(
        &self,
        request: LlmRequest,
        raw: ProviderResponse,
        requested_model: String,
        retry_count: u32,
        start: Instant,
    ) -> LlmResponse {
        // Re-prepend the prefill seed so structured-output parsers see the
        // full document.
        let content = match &request.prefill {
            Some(prefill) => format!("{}{}", prefill, raw.content),
            None => raw.content,
        };

        let served_model = if raw.model.is_empty() {
            requested_model
        } else {
            raw.model
        };
        let cost = self.prices.cost(&served_model, &raw.tokens);

        let cacheable = raw.tokens.input + raw.tokens.cache_read + raw.tokens.cache_write;
        let cache_hit_rate = if cacheable == 0 {
            0.0
        } else {
            raw.tokens.cache_read as f64 / cacheable as f64
        };

        let response = LlmResponse {
            content,
            tokens: raw.tokens,
            cost,
            duration_ms: start.elapsed().as_millis() as u64,
            cache_hit_rate,
            request_id: raw.request_id,
            model: served_model,
            retry_count,
            phase_tag: request.phase_tag,
            agent_type: request.agent_type,
        };

        if let Some(ledger) = &self.ledger {
            ledger.record(CallRecord {
                phase_tag: response.phase_tag.clone(),
                agent_type: response.agent_type.clone(),
                cost: response.cost.total,
                tokens: response.tokens.clone(),
                retry_count: response.retry_count,
                duration_ms: response.duration_ms,
                model: response.model.clone(),
                cache_hit_rate: response.cache_hit_rate,
            });
        }

        response
    }
}
