//! XML-tagged extraction from model output
//!
//! Personas emit `<thinking>`, `<contribution>`, and optional
//! `<research_request>` blocks; recommendations emit `<recommendation>`,
//! `<reasoning>`, `<confidence>`, and `<conditions>`. Parsers extract by
//! tag and log a ⚠ fallback when tags are absent. They never guess from
//! keywords like "approve"/"reject" — that heuristic caused a silent
//! abstain bug once and is banned.

use regex::Regex;

/// Extract the first `<tag>…</tag>` block, trimmed.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract every `<tag>…</tag>` block, trimmed, skipping empties.
pub fn extract_all_tags(text: &str, tag: &str) -> Vec<String> {
    let pattern = format!(r"(?s)<{tag}>(.*?)</{tag}>", tag = regex::escape(tag));
    let Ok(re) = Regex::new(&pattern) else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// An explicit research request embedded in a contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchRequest {
    pub query: String,
    pub reason: Option<String>,
}

/// A persona turn split into its tagged parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedContribution {
    pub thinking: Option<String>,
    pub contribution: String,
    pub research_request: Option<ResearchRequest>,
    /// True when the `<contribution>` tag was missing and the whole output
    /// was taken verbatim.
    pub used_fallback: bool,
}

/// Parse a persona turn. When `<contribution>` is absent the entire output
/// is used as the contribution and the fallback is logged with its impact.
pub fn parse_contribution(raw: &str) -> ParsedContribution {
    let thinking = extract_tag(raw, "thinking");

    let research_request = extract_tag(raw, "research_request").and_then(|block| {
        let query = extract_tag(&block, "query")?;
        Some(ResearchRequest {
            query,
            reason: extract_tag(&block, "reason"),
        })
    });

    match extract_tag(raw, "contribution") {
        Some(contribution) => ParsedContribution {
            thinking,
            contribution,
            research_request,
            used_fallback: false,
        },
        None => {
            tracing::warn!(
                "⚠ contribution tags absent; using full output verbatim — \
                 thinking will leak into the transcript for this turn (preview: {:?})",
                preview(raw, 120)
            );
            ParsedContribution {
                thinking: None,
                contribution: raw.trim().to_string(),
                research_request,
                used_fallback: true,
            }
        }
    }
}

/// A recommendation turn split into its tagged parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecommendation {
    pub recommendation: String,
    pub reasoning: String,
    pub confidence: f64,
    pub conditions: Vec<String>,
    pub alternatives_considered: Vec<String>,
    pub risk_assessment: Option<String>,
    pub used_fallback: bool,
}

/// Parse a recommendation turn. Missing tags degrade field-by-field: the
/// text is preserved, confidence defaults to 0.5, and the fallback is
/// logged. No keyword guessing.
pub fn parse_recommendation(raw: &str) -> ParsedRecommendation {
    let recommendation = extract_tag(raw, "recommendation");
    let used_fallback = recommendation.is_none();
    if used_fallback {
        tracing::warn!(
            "⚠ recommendation tags absent; treating full output as the recommendation \
             with neutral confidence (preview: {:?})",
            preview(raw, 120)
        );
    }

    let confidence = extract_tag(raw, "confidence")
        .and_then(|c| c.trim_end_matches('%').trim().parse::<f64>().ok())
        .map(|c| if c > 1.0 { c / 100.0 } else { c })
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    let conditions = {
        let items = extract_all_tags(raw, "condition");
        if !items.is_empty() {
            items
        } else {
            extract_tag(raw, "conditions")
                .map(|block| split_list(&block))
                .unwrap_or_default()
        }
    };

    let alternatives_considered = {
        let items = extract_all_tags(raw, "alternative");
        if !items.is_empty() {
            items
        } else {
            extract_tag(raw, "alternatives_considered")
                .map(|block| split_list(&block))
                .unwrap_or_default()
        }
    };

    ParsedRecommendation {
        recommendation: recommendation.unwrap_or_else(|| raw.trim().to_string()),
        reasoning: extract_tag(raw, "reasoning").unwrap_or_default(),
        confidence,
        conditions,
        alternatives_considered,
        risk_assessment: extract_tag(raw, "risk_assessment"),
        used_fallback,
    }
}

/// Split a free-form list block into items: one per line, bullets stripped.
fn split_list(block: &str) -> Vec<String> {
    block
        .lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Bounded preview of an offending payload for ⚠ logs.
pub fn preview(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tag_basic() {
        let text = "<contribution>Ship it.</contribution>";
        assert_eq!(extract_tag(text, "contribution").unwrap(), "Ship it.");
    }

    #[test]
    fn test_extract_tag_multiline() {
        let text = "<thinking>\nline one\nline two\n</thinking>";
        assert_eq!(extract_tag(text, "thinking").unwrap(), "line one\nline two");
    }

    #[test]
    fn test_extract_tag_absent() {
        assert!(extract_tag("no tags here", "contribution").is_none());
        assert!(extract_tag("<contribution></contribution>", "contribution").is_none());
    }

    #[test]
    fn test_parse_contribution_full() {
        let raw = "<thinking>weighing options</thinking>\n\
                   <contribution>SEO compounds; paid ads don't.</contribution>\n\
                   <research_request><query>average CAC for SaaS paid ads</query>\
                   <reason>unverified claim</reason></research_request>";
        let parsed = parse_contribution(raw);
        assert!(!parsed.used_fallback);
        assert_eq!(parsed.thinking.as_deref(), Some("weighing options"));
        assert_eq!(parsed.contribution, "SEO compounds; paid ads don't.");
        let req = parsed.research_request.unwrap();
        assert_eq!(req.query, "average CAC for SaaS paid ads");
        assert_eq!(req.reason.as_deref(), Some("unverified claim"));
    }

    #[test]
    fn test_parse_contribution_fallback_uses_verbatim_text() {
        let raw = "I think we should invest in SEO because it compounds.";
        let parsed = parse_contribution(raw);
        assert!(parsed.used_fallback);
        assert_eq!(parsed.contribution, raw);
        assert!(parsed.thinking.is_none());
    }

    #[test]
    fn test_parse_recommendation_full() {
        let raw = "<recommendation>Allocate 70% to SEO, 30% to paid.</recommendation>\n\
                   <reasoning>SEO compounds over the 12-month horizon.</reasoning>\n\
                   <confidence>0.8</confidence>\n\
                   <conditions>- revisit after 90 days\n- cap paid CAC at $80</conditions>\n\
                   <risk_assessment>Algorithm updates could slow SEO payback.</risk_assessment>";
        let parsed = parse_recommendation(raw);
        assert!(!parsed.used_fallback);
        assert_eq!(parsed.recommendation, "Allocate 70% to SEO, 30% to paid.");
        assert!((parsed.confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(parsed.conditions.len(), 2);
        assert_eq!(parsed.conditions[1], "cap paid CAC at $80");
        assert!(parsed.risk_assessment.is_some());
    }

    #[test]
    fn test_parse_recommendation_percent_confidence() {
        let raw = "<recommendation>Yes.</recommendation><confidence>85%</confidence>";
        let parsed = parse_recommendation(raw);
        assert!((parsed.confidence - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_parse_recommendation_fallback_neutral_confidence() {
        let raw = "Probably SEO, but it depends on runway.";
        let parsed = parse_recommendation(raw);
        assert!(parsed.used_fallback);
        assert_eq!(parsed.recommendation, raw);
        assert!((parsed.confidence - 0.5).abs() < f64::EPSILON);
        // No keyword guessing: nothing inferred beyond the verbatim text.
        assert!(parsed.conditions.is_empty());
    }

    #[test]
    fn test_condition_items_preferred_over_block() {
        let raw = "<recommendation>r</recommendation>\
                   <conditions><condition>first</condition><condition>second</condition></conditions>";
        let parsed = parse_recommendation(raw);
        assert_eq!(parsed.conditions, vec!["first", "second"]);
    }

    #[test]
    fn test_confidence_clamped() {
        let raw = "<recommendation>r</recommendation><confidence>250%</confidence>";
        let parsed = parse_recommendation(raw);
        assert!(parsed.confidence <= 1.0);
    }

    #[test]
    fn test_preview_bounded() {
        let long = "x".repeat(500);
        let p = preview(&long, 50);
        assert!(p.chars().count() <= 51);
        assert!(p.ends_with('…'));
    }
}
