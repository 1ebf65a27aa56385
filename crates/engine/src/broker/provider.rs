//! Chat provider abstraction and the Anthropic-messages implementation
//!
//! The provider does one HTTP exchange and classifies failures into the
//! broker's retryable/permanent split. Retry policy, prefill handling, and
//! cost computation live in the broker, not here.

use async_trait::async_trait;
use serde_json::json;

use crate::types::{BrokerError, TokenTotals};

/// One segment of a system prompt. Cacheable segments carry a provider
/// cache marker so identical prefixes are reused across requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSegment {
    pub text: String,
    pub cacheable: bool,
}

impl SystemSegment {
    pub fn cached(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cacheable: true,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cacheable: false,
        }
    }
}

/// A single prepared exchange handed to a provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub model: String,
    pub system: Vec<SystemSegment>,
    pub user_message: String,
    /// Assistant-turn seed. The provider sends it as the beginning of the
    /// assistant message; the broker re-prepends it to the content.
    pub prefill: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Raw provider response before broker post-processing.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Model output, not including the prefill seed.
    pub content: String,
    pub tokens: TokenTotals,
    pub request_id: String,
    /// The model id that actually served the request.
    pub model: String,
}

/// A backend able to serve chat completions.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Perform one exchange. Implementations classify failures but do not
    /// retry; the broker owns the retry loop.
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, BrokerError>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Anthropic messages-API provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| BrokerError::Transient(format!("HTTP client build failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn build_body(&self, request: &ProviderRequest) -> serde_json::Value {
        let system: Vec<serde_json::Value> = request
            .system
            .iter()
            .map(|seg| {
                if seg.cacheable {
                    json!({
                        "type": "text",
                        "text": seg.text,
                        "cache_control": {"type": "ephemeral"},
                    })
                } else {
                    json!({"type": "text", "text": seg.text})
                }
            })
            .collect();

        let mut messages = vec![json!({"role": "user", "content": request.user_message})];
        if let Some(ref prefill) = request.prefill {
            messages.push(json!({"role": "assistant", "content": prefill}));
        }

        json!({
            "model": request.model,
            "system": system,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }

    fn parse_body(&self, resp: &serde_json::Value) -> Result<ProviderResponse, BrokerError> {
        let content_blocks = resp
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| BrokerError::Parse("no content array in response".into()))?;

        let mut text = String::new();
        for block in content_blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
        }

        let usage = resp.get("usage");
        let read_u64 = |field: &str| -> u64 {
            usage
                .and_then(|u| u.get(field))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };

        Ok(ProviderResponse {
            content: text,
            tokens: TokenTotals {
                input: read_u64("input_tokens"),
                output: read_u64("output_tokens"),
                cache_write: read_u64("cache_creation_input_tokens"),
                cache_read: read_u64("cache_read_input_tokens"),
            },
            request_id: resp
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            model: resp
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, BrokerError> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_body(request);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BrokerError::Transient("request timed out".into())
                } else {
                    BrokerError::Transient(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(BrokerError::RateLimited { retry_after_ms });
        }
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 529 {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Transient(format!(
                "server error ({}): {}",
                status,
                truncate(&text, 200)
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Permanent {
                status: status.as_u16(),
                message: truncate(&text, 500),
            });
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BrokerError::Parse(format!("JSON decode failed: {}", e)))?;

        self.parse_body(&resp_json)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("test-key", "https://api.anthropic.com/v1/").unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let p = provider();
        assert_eq!(p.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn test_body_carries_cache_markers() {
        let p = provider();
        let request = ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            system: vec![
                SystemSegment::cached("shared persona preamble"),
                SystemSegment::plain("per-round context"),
            ],
            user_message: "Speak.".into(),
            prefill: None,
            temperature: 0.7,
            max_tokens: 1024,
        };
        let body = p.build_body(&request);
        let system = body["system"].as_array().unwrap();
        assert_eq!(system.len(), 2);
        assert_eq!(system[0]["cache_control"]["type"], "ephemeral");
        assert!(system[1].get("cache_control").is_none());
    }

    #[test]
    fn test_body_prefill_becomes_assistant_turn() {
        let p = provider();
        let request = ProviderRequest {
            model: "claude-sonnet-4-20250514".into(),
            system: vec![SystemSegment::plain("sys")],
            user_message: "Decompose this.".into(),
            prefill: Some("{\"".into()),
            temperature: 0.2,
            max_tokens: 2048,
        };
        let body = p.build_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "{\"");
    }

    #[test]
    fn test_parse_body_reads_cache_token_counts() {
        let p = provider();
        let resp = json!({
            "id": "msg_0123",
            "model": "claude-sonnet-4-20250514",
            "content": [{"type": "text", "text": "sub_problems\": []}"}],
            "usage": {
                "input_tokens": 42,
                "output_tokens": 17,
                "cache_creation_input_tokens": 2048,
                "cache_read_input_tokens": 0,
            }
        });
        let parsed = p.parse_body(&resp).unwrap();
        assert_eq!(parsed.tokens.input, 42);
        assert_eq!(parsed.tokens.cache_write, 2048);
        assert_eq!(parsed.request_id, "msg_0123");
    }

    #[test]
    fn test_parse_body_joins_text_blocks() {
        let p = provider();
        let resp = json!({
            "id": "msg_1",
            "model": "m",
            "content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ],
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let parsed = p.parse_body(&resp).unwrap();
        assert_eq!(parsed.content, "first\nsecond");
    }

    #[test]
    fn test_parse_body_rejects_missing_content() {
        let p = provider();
        let resp = json!({"id": "msg_1"});
        assert!(matches!(
            p.parse_body(&resp).unwrap_err(),
            BrokerError::Parse(_)
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo wörld, this is a long error body";
        let t = truncate(s, 10);
        assert!(t.chars().count() <= 11);
    }
}
