//! Shared test doubles for unit tests
//!
//! A scripted chat provider that plays back canned responses, and a
//! deterministic hash embedder. Compiled only for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::broker::{ChatProvider, LlmBroker, ProviderRequest, ProviderResponse, RetryPolicy};
use crate::config::EngineConfig;
use crate::embedding::EmbeddingClient;
use crate::types::{BrokerError, EmbeddingError, TokenTotals};

/// Plays back a scripted sequence of contents (or errors); repeats the
/// last entry when the script runs dry.
pub struct ScriptedProvider {
    script: Mutex<Vec<Result<String, BrokerError>>>,
    /// Requests seen, for assertions on prompts.
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<String, BrokerError>>) -> Self {
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn of_contents(contents: Vec<&str>) -> Self {
        Self::new(contents.into_iter().map(|c| Ok(c.to_string())).collect())
    }
}

/// Scripts are written as the full document the caller should see. A real
/// provider continues *after* an assistant prefill, so the mock strips a
/// leading prefill before returning; the broker re-prepends it.
pub fn continue_after_prefill(content: String, prefill: &Option<String>) -> String {
    match prefill {
        Some(prefill) => content
            .strip_prefix(prefill.as_str())
            .map(String::from)
            .unwrap_or(content),
        None => content,
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, BrokerError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.remove(0)
        } else {
            match script.first() {
                Some(Ok(content)) => Ok(content.clone()),
                Some(Err(e)) => Err(clone_error(e)),
                None => Ok("(empty script)".to_string()),
            }
        };
        next.map(|content| ProviderResponse {
            content: continue_after_prefill(content, &request.prefill),
            tokens: TokenTotals {
                input: 200,
                output: 80,
                cache_write: 0,
                cache_read: 0,
            },
            request_id: "req_test".into(),
            model: "claude-sonnet-4-20250514".into(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn clone_error(e: &BrokerError) -> BrokerError {
    match e {
        BrokerError::Transient(m) => BrokerError::Transient(m.clone()),
        BrokerError::RateLimited { retry_after_ms } => BrokerError::RateLimited {
            retry_after_ms: *retry_after_ms,
        },
        BrokerError::Permanent { status, message } => BrokerError::Permanent {
            status: *status,
            message: message.clone(),
        },
        BrokerError::RetriesExhausted {
            attempts,
            last_error,
        } => BrokerError::RetriesExhausted {
            attempts: *attempts,
            last_error: last_error.clone(),
        },
        BrokerError::Parse(m) => BrokerError::Parse(m.clone()),
        BrokerError::UnknownRole(m) => BrokerError::UnknownRole(m.clone()),
        BrokerError::MissingCredential(m) => BrokerError::MissingCredential(m.clone()),
    }
}

/// Broker over a scripted provider with near-zero retry delays.
pub fn broker_of(provider: Arc<ScriptedProvider>) -> LlmBroker {
    LlmBroker::new(provider, &EngineConfig::default()).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(2),
        jitter: std::time::Duration::ZERO,
    })
}

/// Broker that replies with the given contents in order.
pub fn broker_with_contents(contents: Vec<&str>) -> LlmBroker {
    broker_of(Arc::new(ScriptedProvider::of_contents(contents)))
}

/// Broker over any provider with near-zero retry delays.
pub fn broker_over(provider: Arc<dyn ChatProvider>) -> LlmBroker {
    LlmBroker::new(provider, &EngineConfig::default()).with_retry_policy(RetryPolicy {
        max_attempts: 2,
        base_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(2),
        jitter: std::time::Duration::ZERO,
    })
}

/// Provider that answers by recognizing which stage is calling from the
/// request text. Lets a whole session run against one double.
///
/// Persona turns pop from `contributions` (falling back to an agreeable
/// default); facilitator decisions pop from `speakers` and switch to
/// "recommend" when the queue runs dry.
pub struct RoutingProvider {
    pub decomposition: String,
    pub selection: String,
    pub contributions: Mutex<std::collections::VecDeque<String>>,
    pub speakers: Mutex<std::collections::VecDeque<String>>,
    pub synthesis: String,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl RoutingProvider {
    pub fn new() -> Self {
        Self {
            decomposition: r#"{"sub_problems": [{"goal": "axis:0 decide the question", "context": "ctx", "complexity": 5, "depends_on": []}], "information_gaps": []}"#.to_string(),
            selection: r#"{"personas": ["growth_strategist", "financial_analyst", "user_advocate"]}"#.to_string(),
            contributions: Mutex::new(std::collections::VecDeque::new()),
            speakers: Mutex::new(std::collections::VecDeque::new()),
            synthesis: r#"{"synthesis": "The board weighed the options.", "consensus_recommendation": "We recommend option A.", "confidence_level": "medium", "critical_conditions": [], "alternative_approaches": [], "dissenting_views": []}"#.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_speakers(self, speakers: Vec<&str>) -> Self {
        *self.speakers.lock().unwrap() = speakers.into_iter().map(String::from).collect();
        self
    }

    pub fn with_contributions(self, contributions: Vec<&str>) -> Self {
        *self.contributions.lock().unwrap() =
            contributions.into_iter().map(String::from).collect();
        self
    }

    fn route(&self, request: &ProviderRequest) -> String {
        let user = &request.user_message;
        if user.contains("Decompose this decision") {
            return self.decomposition.clone();
        }
        if user.contains("Select exactly") {
            return self.selection.clone();
        }
        if user.contains("Summarize this round") {
            return "The round restated existing positions.".to_string();
        }
        if user.contains("give your final") {
            return "<recommendation>Option A.</recommendation>\
                    <reasoning>It held up in debate.</reasoning>\
                    <confidence>0.8</confidence>"
                .to_string();
        }
        if user.contains("final advisory synthesis") {
            return self.synthesis.clone();
        }
        if user.contains("\"completeness\"") {
            return r#"{"completeness": 0.9, "actionability": 0.9, "dissent_inclusion": 0.9, "feedback": ""}"#
                .to_string();
        }
        if user.contains("Respond as {\"issue\"") {
            return r#"{"issue": null, "confidence": 0.0, "reason": "healthy"}"#.to_string();
        }
        if user.contains("Respond as {\"action\"") {
            let mut speakers = self.speakers.lock().unwrap();
            return match speakers.pop_front() {
                Some(code) => format!(
                    r#"{{"action": "speaker", "speaker": "{}", "reason": "their turn"}}"#,
                    code
                ),
                None => r#"{"action": "recommend", "speaker": null, "reason": "positions developed"}"#
                    .to_string(),
            };
        }
        if user.contains("\"valid\"") {
            return r#"{"valid": true, "reason": ""}"#.to_string();
        }
        if user.contains("it is your turn") || user.contains("Intervene now") {
            let mut contributions = self.contributions.lock().unwrap();
            let content = contributions
                .pop_front()
                .unwrap_or_else(|| "axis:0 I agree with the emerging direction.".to_string());
            return format!(
                "<thinking>weighing</thinking><contribution>{}</contribution>",
                content
            );
        }
        "<contribution>axis:0 default turn</contribution>".to_string()
    }
}

impl Default for RoutingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for RoutingProvider {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, BrokerError> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ProviderResponse {
            content: continue_after_prefill(self.route(request), &request.prefill),
            tokens: TokenTotals {
                input: 300,
                output: 120,
                cache_write: 0,
                cache_read: 0,
            },
            request_id: "req_route".into(),
            model: "claude-sonnet-4-20250514".into(),
        })
    }

    fn name(&self) -> &str {
        "routing"
    }
}

/// Deterministic embedder: same text, same vector. Texts starting with
/// `axis:<n>` embed as the unit vector on axis n, which lets tests steer
/// convergence, novelty, and drift geometry exactly.
pub struct HashEmbedder;

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|t| {
                if let Some(rest) = t.strip_prefix("axis:") {
                    let axis: usize = rest
                        .split_whitespace()
                        .next()
                        .and_then(|n| n.parse().ok())
                        .unwrap_or(0);
                    let mut v = vec![0.0f32; 8];
                    v[axis % 8] = 1.0;
                    v
                } else {
                    let mut hasher = Sha256::new();
                    hasher.update(t.as_bytes());
                    hasher
                        .finalize()
                        .iter()
                        .take(8)
                        .map(|&b| b as f32 / 255.0 - 0.5)
                        .collect()
                }
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        8
    }
}
