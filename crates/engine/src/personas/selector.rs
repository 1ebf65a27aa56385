//! Persona selection
//!
//! Given a sub-problem, picks 3–5 personas covering the strategic,
//! tactical, technical, and user perspectives with diversity in risk
//! tolerance, time horizon, and outlook. Selection is model-assisted;
//! every returned code is validated against the catalog and a
//! deterministic diversity heuristic backstops the model.

use std::collections::HashSet;

use serde::Deserialize;

use crate::broker::{LlmBroker, LlmRequest, SystemSegment};
use crate::types::{
    EngineError, ModelRole, Persona, PersonaCode, PerspectiveKind, PhaseTag, SubProblem,
};
use crate::xmlout::preview;

use super::PersonaCatalog;

/// Minimum and maximum board size.
pub const MIN_PERSONAS: usize = 3;
pub const MAX_PERSONAS: usize = 5;

#[derive(Deserialize)]
struct SelectionOutput {
    personas: Vec<String>,
}

/// Model-assisted persona selector with a heuristic backstop.
pub struct PersonaSelector {
    broker: LlmBroker,
    catalog: PersonaCatalog,
}

impl PersonaSelector {
    pub fn new(broker: LlmBroker, catalog: PersonaCatalog) -> Self {
        Self { broker, catalog }
    }

    /// Board size grows with complexity: 3 for simple questions, 5 for the
    /// hardest ones.
    pub fn target_count(sub_problem: &SubProblem) -> usize {
        match sub_problem.complexity_score {
            0..=3 => MIN_PERSONAS,
            4..=6 => 4,
            _ => MAX_PERSONAS,
        }
    }

    /// Select personas for a sub-problem.
    pub async fn select(&self, sub_problem: &SubProblem) -> Result<Vec<Persona>, EngineError> {
        let target = Self::target_count(sub_problem);

        let mut codes = match self.model_selection(sub_problem, target).await {
            Ok(codes) => codes,
            Err(reason) => {
                tracing::warn!(
                    "⚠ model persona selection unusable ({}); falling back to \
                     diversity heuristic — board composition may be more generic",
                    reason
                );
                Vec::new()
            }
        };

        // Validate against the catalog; drop anything the model invented.
        codes.retain(|code| {
            let known = self.catalog.contains(code);
            if !known {
                tracing::warn!("⚠ selector proposed unknown persona code '{}'; dropped", code);
            }
            known
        });
        dedup_in_order(&mut codes);
        codes.truncate(MAX_PERSONAS);

        // Top up to the target with the heuristic, never below the minimum.
        if codes.len() < target {
            for candidate in self.heuristic_ranking(sub_problem, &codes) {
                if codes.len() >= target {
                    break;
                }
                codes.push(candidate);
            }
        }

        let personas = self.catalog.resolve(&codes)?;
        debug_assert!(personas.len() >= MIN_PERSONAS && personas.len() <= MAX_PERSONAS);
        Ok(personas)
    }

    async fn model_selection(
        &self,
        sub_problem: &SubProblem,
        target: usize,
    ) -> Result<Vec<PersonaCode>, String> {
        let mut roster = String::new();
        for p in self.catalog.all() {
            roster.push_str(&format!(
                "- {}: {} (domain: {}; perspective: {:?}; risk: {:?}; horizon: {:?}; outlook: {:?})\n",
                p.code, p.role, p.expertise_domain, p.perspective, p.risk_tolerance,
                p.time_horizon, p.outlook
            ));
        }

        let request = LlmRequest::new(ModelRole::Selector, PhaseTag::Selection, "selector")
            .with_system(vec![SystemSegment::plain(
                "You assemble an advisory board for a decision question. Choose personas \
                 whose expertise matches the question and whose perspectives, risk \
                 tolerances, time horizons, and outlooks differ from each other. \
                 Respond with JSON only.",
            )])
            .with_user(format!(
                "Decision question: {}\nContext: {}\n\nAvailable personas:\n{}\n\
                 Select exactly {} persona codes. Respond as {{\"personas\": [\"code\", ...]}}.",
                sub_problem.goal, sub_problem.context, roster, target
            ))
            .with_prefill("{\"")
            .with_temperature(0.3)
            .with_max_tokens(512);

        let response = self.broker.call(request).await.map_err(|e| e.to_string())?;
        let parsed: SelectionOutput = serde_json::from_str(&response.content)
            .map_err(|e| format!("{} (payload: {:?})", e, preview(&response.content, 120)))?;
        Ok(parsed.personas.into_iter().map(PersonaCode).collect())
    }

    /// Deterministic ranking: relevance to the sub-problem, then greedy
    /// diversity over perspective and style axes relative to `chosen`.
    fn heuristic_ranking(
        &self,
        sub_problem: &SubProblem,
        chosen: &[PersonaCode],
    ) -> Vec<PersonaCode> {
        let topic = format!("{} {}", sub_problem.goal, sub_problem.context).to_lowercase();
        let topic_words: HashSet<&str> = topic.split_whitespace().collect();

        let mut picked: Vec<&Persona> = chosen
            .iter()
            .filter_map(|code| self.catalog.get(code).ok())
            .collect();
        let mut remaining: Vec<&Persona> = self
            .catalog
            .all()
            .filter(|p| !chosen.contains(&p.code))
            .collect();
        let mut ranking = Vec::new();

        while !remaining.is_empty() {
            let (index, _) = remaining
                .iter()
                .enumerate()
                .map(|(i, p)| (i, self.score(p, &topic_words, &picked)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .expect("remaining is non-empty");
            let persona = remaining.remove(index);
            ranking.push(persona.code.clone());
            picked.push(persona);
        }
        ranking
    }

    fn score(&self, p: &Persona, topic_words: &HashSet<&str>, picked: &[&Persona]) -> f64 {
        let relevance = p
            .expertise_domain
            .split_whitespace()
            .filter(|w| topic_words.contains(&w.to_lowercase().as_str()))
            .count() as f64;

        let covered_perspectives: HashSet<PerspectiveKind> =
            picked.iter().map(|q| q.perspective).collect();
        let new_perspective = !covered_perspectives.contains(&p.perspective) as u8 as f64;
        let new_risk = picked.iter().all(|q| q.risk_tolerance != p.risk_tolerance) as u8 as f64;
        let new_horizon = picked.iter().all(|q| q.time_horizon != p.time_horizon) as u8 as f64;
        let new_outlook = picked.iter().all(|q| q.outlook != p.outlook) as u8 as f64;

        relevance + 2.0 * new_perspective + new_risk + new_horizon + new_outlook
    }
}

fn dedup_in_order(codes: &mut Vec<PersonaCode>) {
    let mut seen = HashSet::new();
    codes.retain(|code| seen.insert(code.clone()));
}
