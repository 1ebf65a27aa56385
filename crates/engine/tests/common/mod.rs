//! Shared test doubles for the end-to-end scenarios

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bo1_engine::broker::{ChatProvider, ProviderRequest, ProviderResponse};
use bo1_engine::embedding::EmbeddingClient;
use bo1_engine::types::{BrokerError, EmbeddingError, TokenTotals};
use sha2::{Digest, Sha256};

/// Provider that recognizes which engine stage is calling from the
/// request text and answers in kind. Queues make persona turns,
/// facilitator decisions, and recommendations scriptable per test.
pub struct StageMock {
    pub decomposition: String,
    pub selection: String,
    pub synthesis: String,
    pub contributions: Mutex<VecDeque<String>>,
    pub speakers: Mutex<VecDeque<String>>,
    pub recommendations: Mutex<VecDeque<String>>,
    /// Requests whose user message contains this substring fail with a
    /// permanent error (crash injection).
    pub fail_on: Option<String>,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl StageMock {
    pub fn new() -> Self {
        Self {
            decomposition: r#"{"sub_problems": [{"goal": "axis:0 decide the question", "context": "ctx", "complexity": 5, "depends_on": []}], "information_gaps": []}"#.into(),
            selection: r#"{"personas": ["growth_strategist", "financial_analyst", "user_advocate"]}"#.into(),
            synthesis: r#"{"synthesis": "The board weighed both options and leaned toward the compounding one.", "consensus_recommendation": "We recommend a 70/30 SEO-weighted split.", "confidence_level": "medium", "critical_conditions": ["revisit the split after 90 days"], "alternative_approaches": ["all-in paid for one quarter"], "dissenting_views": ["financial_analyst would defer spending entirely"]}"#.into(),
            contributions: Mutex::new(VecDeque::new()),
            speakers: Mutex::new(VecDeque::new()),
            recommendations: Mutex::new(VecDeque::new()),
            fail_on: None,
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

    pub fn with_recommendations(self, recommendations: Vec<&str>) -> Self {
        *self.recommendations.lock().unwrap() =
            recommendations.into_iter().map(String::from).collect();
        self
    }

    pub fn saw_request_containing(&self, needle: &str) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.user_message.contains(needle))
    }

    fn route(&self, user: &str) -> String {
        if user.contains("Decompose this decision") {
            return self.decomposition.clone();
        }
        if user.contains("Select exactly") {
            return self.selection.clone();
        }
        if user.contains("Summarize this round") {
            return "Positions restated; the split held.".into();
        }
        if user.contains("give your final") {
            return self
                .recommendations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    "<recommendation>Proceed with the favored option.</recommendation>\
                     <reasoning>It survived the debate.</reasoning>\
                     <confidence>0.75</confidence>"
                        .into()
                });
        }
        if user.contains("final advisory synthesis") {
            return self.synthesis.clone();
        }
        if user.contains("\"completeness\"") {
            return r#"{"completeness": 0.9, "actionability": 0.9, "dissent_inclusion": 0.9, "feedback": ""}"#.into();
        }
        if user.contains("Respond as {\"issue\"") {
            return r#"{"issue": null, "confidence": 0.0, "reason": "healthy"}"#.into();
        }
        if user.contains("Respond as {\"action\"") {
            return match self.speakers.lock().unwrap().pop_front() {
                Some(code) => format!(
                    r#"{{"action": "speaker", "speaker": "{}", "reason": "their turn"}}"#,
                    code
                ),
                None => {
                    r#"{"action": "recommend", "speaker": null, "reason": "positions developed"}"#
                        .into()
                }
            };
        }
        if user.contains("\"valid\"") {
            return r#"{"valid": true, "reason": ""}"#.into();
        }
        if user.contains("it is your turn") || user.contains("Intervene now") {
            let content = self
                .contributions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "axis:0 I agree with the emerging direction.".into());
            return format!(
                "<thinking>weighing</thinking><contribution>{}</contribution>",
                content
            );
        }
        "<contribution>axis:0 default turn</contribution>".into()
    }
}

impl Default for StageMock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for StageMock {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, BrokerError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(trigger) = &self.fail_on {
            if request.user_message.contains(trigger.as_str()) {
                return Err(BrokerError::Permanent {
                    status: 500,
                    message: "injected crash".into(),
                });
            }
        }
        // A real provider continues after the assistant prefill; the
        // broker re-prepends it. Scripts here are full documents, so the
        // prefill is stripped before returning.
        let mut content = self.route(&request.user_message);
        if let Some(prefill) = &request.prefill {
            if let Some(stripped) = content.strip_prefix(prefill.as_str()) {
                content = stripped.to_string();
            }
        }
        Ok(ProviderResponse {
            content,
            tokens: TokenTotals {
                input: 300,
                output: 120,
                cache_write: 0,
                cache_read: 0,
            },
            request_id: "req_e2e".into(),
            model: "claude-sonnet-4-20250514".into(),
        })
    }

    fn name(&self) -> &str {
        "stage-mock"
    }
}

/// Deterministic embedder: `axis:<n>` texts embed as the unit vector on
/// axis n; everything else hashes to a stable pseudo-random vector.
pub struct AxisEmbedder;

#[async_trait]
impl EmbeddingClient for AxisEmbedder {
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
