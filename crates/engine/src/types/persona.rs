//! Expert persona model
//!
//! Personas are loaded from a static catalog; a session stores the subset
//! selected for its sub-problem. The style axes (risk tolerance, time
//! horizon, outlook) are invariant per persona and drive diversity
//! selection.

use serde::{Deserialize, Serialize};

/// Stable catalog identifier for a persona (e.g. `growth_strategist`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonaCode(pub String);

impl PersonaCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PersonaCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PersonaCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Appetite for risk in recommendations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTolerance {
    Averse,
    Moderate,
    Aggressive,
}

/// The planning window a persona reasons over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

/// Baseline disposition toward proposals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outlook {
    Optimistic,
    Pragmatic,
    Cautious,
}

/// Broad perspective a persona covers in the debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerspectiveKind {
    Strategic,
    Tactical,
    Technical,
    User,
}

/// A named expert role with a fixed system prompt and invariant style.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Persona {
    pub code: PersonaCode,
    pub name: String,
    pub role: String,
    pub expertise_domain: String,
    pub perspective: PerspectiveKind,
    pub risk_tolerance: RiskTolerance,
    pub time_horizon: TimeHorizon,
    pub outlook: Outlook,
    /// The persona's system-prompt body. Kept byte-identical across calls
    /// so provider-side prompt caching keys stay stable.
    pub system_role_text: String,
}

impl Persona {
    /// Style fingerprint used by the selector's diversity scoring.
    pub fn style(&self) -> (RiskTolerance, TimeHorizon, Outlook) {
        (self.risk_tolerance, self.time_horizon, self.outlook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Persona {
        Persona {
            code: PersonaCode::new("financial_analyst"),
            name: "Financial Analyst".into(),
            role: "Evaluates financial impact".into(),
            expertise_domain: "finance".into(),
            perspective: PerspectiveKind::Tactical,
            risk_tolerance: RiskTolerance::Averse,
            time_horizon: TimeHorizon::MediumTerm,
            outlook: Outlook::Cautious,
            system_role_text: "You are a financial analyst.".into(),
        }
    }

    #[test]
    fn test_persona_serde_round_trip() {
        let p = sample();
        let json = serde_json::to_string(&p).unwrap();
        let restored: Persona = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.code, p.code);
        assert_eq!(restored.risk_tolerance, RiskTolerance::Averse);
        assert_eq!(restored.perspective, PerspectiveKind::Tactical);
    }

    #[test]
    fn test_style_fingerprint() {
        let p = sample();
        assert_eq!(
            p.style(),
            (
                RiskTolerance::Averse,
                TimeHorizon::MediumTerm,
                Outlook::Cautious
            )
        );
    }

    #[test]
    fn test_persona_code_from_str() {
        let code: PersonaCode = "user_advocate".into();
        assert_eq!(code.as_str(), "user_advocate");
    }
}
