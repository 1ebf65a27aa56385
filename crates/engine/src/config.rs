//! Engine configuration resolved from environment variables
//!
//! All options are read once at startup. Missing variables fall back to
//! documented defaults; malformed values fall back with a warning rather
//! than failing startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{ModelRole, MAX_ROUNDS_HARD_CAP};

/// Default model for the higher-capability roles.
pub const DEFAULT_CAPABLE_MODEL: &str = "claude-sonnet-4-20250514";
/// Default model for the cheaper roles.
pub const DEFAULT_FAST_MODEL: &str = "claude-3-5-haiku-20241022";

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Credential for the LLM endpoint (`LLM_API_KEY`).
    pub llm_api_key: Option<String>,
    /// Credential for the embedding endpoint (`EMBED_API_KEY`).
    pub embed_api_key: Option<String>,
    /// Base URL for the LLM messages endpoint (`LLM_BASE_URL`).
    pub llm_base_url: String,
    /// Base URL for the embeddings endpoint (`EMBED_BASE_URL`).
    pub embed_base_url: String,
    /// Embedding model id (`EMBED_MODEL`).
    pub embed_model: String,
    /// Safety layer 5: cost kill switch (`MAX_COST_PER_SESSION`).
    pub max_cost_per_session: f64,
    /// Safety layer 4: wall-clock watchdog (`SESSION_TIMEOUT_SEC`).
    pub session_timeout: Duration,
    /// Safety layer 3 absolute bound (`MAX_ROUNDS_HARD_CAP`, clamped to 15).
    pub max_rounds_hard_cap: u32,
    /// Stop when mean pairwise similarity exceeds this (`CONVERGENCE_THRESHOLD`).
    pub convergence_threshold: f64,
    /// Stop only when the newest contribution's novelty is below this
    /// (`NOVELTY_THRESHOLD`).
    pub novelty_threshold: f64,
    /// Refocus when topical drift falls below this (`DRIFT_THRESHOLD`).
    pub drift_threshold: f64,
    /// Summary budget for high-density rounds (`SUMMARY_HIGH_TOKENS`).
    pub summary_high_tokens: u32,
    /// Summary budget for low-density rounds (`SUMMARY_LOW_TOKENS`).
    pub summary_low_tokens: u32,
    /// Per-role model overrides (`MODEL_FOR_ROLE__<ROLE>`).
    pub model_overrides: HashMap<ModelRole, String>,
    /// Record TTL in the state store (`STATE_TTL_SEC`).
    pub state_ttl: Duration,
    /// Root directory for the file-backed store (`BO1_STATE_DIR`).
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            embed_api_key: None,
            llm_base_url: "https://api.anthropic.com/v1".to_string(),
            embed_base_url: "https://api.openai.com/v1".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            max_cost_per_session: 1.00,
            session_timeout: Duration::from_secs(3600),
            max_rounds_hard_cap: MAX_ROUNDS_HARD_CAP,
            convergence_threshold: 0.85,
            novelty_threshold: 0.30,
            drift_threshold: 0.60,
            summary_high_tokens: 150,
            summary_low_tokens: 75,
            model_overrides: HashMap::new(),
            state_ttl: Duration::from_secs(604_800),
            state_dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bo1")
        .join("state")
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_nonempty(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("⚠ {} has unparseable value {:?}; using default", key, raw);
            default
        }),
        None => default,
    }
}

impl EngineConfig {
    /// Resolve configuration from the process environment.
    ///
    /// A `.env` file is loaded first if present. Recognized variables are
    /// listed on the struct fields. Role overrides are read from
    /// `MODEL_FOR_ROLE__<ROLE>` with the role name matched
    /// case-insensitively.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let mut model_overrides = HashMap::new();
        for (key, value) in std::env::vars() {
            if let Some(role_name) = key.strip_prefix("MODEL_FOR_ROLE__") {
                match ModelRole::parse(role_name) {
                    Some(role) if !value.is_empty() => {
                        model_overrides.insert(role, value);
                    }
                    Some(_) => {}
                    None => {
                        tracing::warn!("⚠ {} names unknown role '{}'; ignored", key, role_name);
                    }
                }
            }
        }

        let hard_cap: u32 = env_parse("MAX_ROUNDS_HARD_CAP", defaults.max_rounds_hard_cap);

        Self {
            llm_api_key: env_nonempty("LLM_API_KEY"),
            embed_api_key: env_nonempty("EMBED_API_KEY"),
            llm_base_url: env_nonempty("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            embed_base_url: env_nonempty("EMBED_BASE_URL").unwrap_or(defaults.embed_base_url),
            embed_model: env_nonempty("EMBED_MODEL").unwrap_or(defaults.embed_model),
            max_cost_per_session: env_parse("MAX_COST_PER_SESSION", defaults.max_cost_per_session),
            session_timeout: Duration::from_secs(env_parse(
                "SESSION_TIMEOUT_SEC",
                defaults.session_timeout.as_secs(),
            )),
            max_rounds_hard_cap: hard_cap.clamp(1, MAX_ROUNDS_HARD_CAP),
            convergence_threshold: env_parse(
                "CONVERGENCE_THRESHOLD",
                defaults.convergence_threshold,
            ),
            novelty_threshold: env_parse("NOVELTY_THRESHOLD", defaults.novelty_threshold),
            drift_threshold: env_parse("DRIFT_THRESHOLD", defaults.drift_threshold),
            summary_high_tokens: env_parse("SUMMARY_HIGH_TOKENS", defaults.summary_high_tokens),
            summary_low_tokens: env_parse("SUMMARY_LOW_TOKENS", defaults.summary_low_tokens),
            model_overrides,
            state_ttl: Duration::from_secs(env_parse(
                "STATE_TTL_SEC",
                defaults.state_ttl.as_secs(),
            )),
            state_dir: env_nonempty("BO1_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
        }
    }

    /// Concrete model id for a role: explicit override first, then the
    /// role's tier default.
    pub fn model_for_role(&self, role: ModelRole) -> &str {
        if let Some(model) = self.model_overrides.get(&role) {
            return model;
        }
        if role.is_capable_tier() {
            DEFAULT_CAPABLE_MODEL
        } else {
            DEFAULT_FAST_MODEL
        }
    }
}
