//! Per-model price table and cost computation
//!
//! The broker is the only place cost is computed; callers receive a
//! `CostBreakdown` and never multiply token counts themselves.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TokenTotals;

/// USD per million tokens, split by token class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_write_per_mtok: f64,
    pub cache_read_per_mtok: f64,
}

/// Cost of one call, split by token class. `total` is always the sum of
/// the parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_write_cost: f64,
    pub cache_read_cost: f64,
    pub total: f64,
}

/// Model-id → pricing lookup with prefix matching, so dated model ids
/// resolve without enumerating every snapshot.
#[derive(Debug, Clone)]
pub struct PriceTable {
    by_prefix: Vec<(String, ModelPricing)>,
    exact: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
}

impl Default for PriceTable {
    fn default() -> Self {
        let by_prefix = vec![
            (
                "claude-opus".to_string(),
                ModelPricing {
                    input_per_mtok: 15.0,
                    output_per_mtok: 75.0,
                    cache_write_per_mtok: 18.75,
                    cache_read_per_mtok: 1.50,
                },
            ),
            (
                "claude-sonnet".to_string(),
                ModelPricing {
                    input_per_mtok: 3.0,
                    output_per_mtok: 15.0,
                    cache_write_per_mtok: 3.75,
                    cache_read_per_mtok: 0.30,
                },
            ),
            (
                "claude-3-5-haiku".to_string(),
                ModelPricing {
                    input_per_mtok: 0.80,
                    output_per_mtok: 4.0,
                    cache_write_per_mtok: 1.0,
                    cache_read_per_mtok: 0.08,
                },
            ),
            (
                "claude-haiku".to_string(),
                ModelPricing {
                    input_per_mtok: 1.0,
                    output_per_mtok: 5.0,
                    cache_write_per_mtok: 1.25,
                    cache_read_per_mtok: 0.10,
                },
            ),
        ];
        Self {
            by_prefix,
            exact: HashMap::new(),
            // Priced like a mid-tier model so unknown ids still accrue cost
            // against the kill switch instead of running free.
            fallback: ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
                cache_write_per_mtok: 3.75,
                cache_read_per_mtok: 0.30,
            },
        }
    }
}

impl PriceTable {
    /// Register an exact-id price, overriding prefix matches.
    pub fn insert(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.exact.insert(model.into(), pricing);
    }

    /// Resolve pricing for a model id.
    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        if let Some(p) = self.exact.get(model) {
            return *p;
        }
        self.by_prefix
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, p)| *p)
            .unwrap_or(self.fallback)
    }

    /// Compute the cost of one call from its token counts.
    pub fn cost(&self, model: &str, tokens: &TokenTotals) -> CostBreakdown {
        let p = self.pricing_for(model);
        let per = 1_000_000.0;
        let input_cost = tokens.input as f64 / per * p.input_per_mtok;
        let output_cost = tokens.output as f64 / per * p.output_per_mtok;
        let cache_write_cost = tokens.cache_write as f64 / per * p.cache_write_per_mtok;
        let cache_read_cost = tokens.cache_read as f64 / per * p.cache_read_per_mtok;
        CostBreakdown {
            input_cost,
            output_cost,
            cache_write_cost,
            cache_read_cost,
            total: input_cost + output_cost + cache_write_cost + cache_read_cost,
        }
    }
}
