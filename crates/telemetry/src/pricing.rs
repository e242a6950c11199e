//! Built-in pricing table for common LLM models.
//!
//! Prices are in USD per 1 million tokens. Each model has an input and
//! output price. Locally served models are listed at zero so cost totals
//! stay meaningful in mixed deployments. Custom pricing can be added at
//! runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Price per 1M input tokens in USD.
    pub input_per_m: f64,
    /// Price per 1M output tokens in USD.
    pub output_per_m: f64,
}

impl ModelPricing {
    /// Create a new pricing entry.
    pub fn new(input_per_m: f64, output_per_m: f64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (input_tokens as f64 * self.input_per_m + output_tokens as f64 * self.output_per_m)
            / 1_000_000.0
    }
}

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    prices: RwLock<HashMap<String, ModelPricing>>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let mut prices = HashMap::new();

        // ── Local (Ollama) ─────────────────────────────────────────
        prices.insert("ollama/llama3.1:8b".into(), ModelPricing::new(0.0, 0.0));
        prices.insert("ollama/llama3.1:70b".into(), ModelPricing::new(0.0, 0.0));
        prices.insert("ollama/qwen2.5:14b".into(), ModelPricing::new(0.0, 0.0));
        prices.insert("ollama/mistral-nemo".into(), ModelPricing::new(0.0, 0.0));

        // ── Anthropic ──────────────────────────────────────────────
        prices.insert(
            "anthropic/claude-sonnet-4".into(),
            ModelPricing::new(3.0, 15.0),
        );
        prices.insert(
            "anthropic/claude-3.5-haiku".into(),
            ModelPricing::new(0.8, 4.0),
        );

        // ── OpenAI ─────────────────────────────────────────────────
        prices.insert("openai/gpt-4o".into(), ModelPricing::new(2.5, 10.0));
        prices.insert("openai/gpt-4o-mini".into(), ModelPricing::new(0.15, 0.6));

        // ── Meta (via OpenRouter) ──────────────────────────────────
        prices.insert(
            "meta-llama/llama-3.1-70b".into(),
            ModelPricing::new(0.52, 0.75),
        );

        // ── DeepSeek ───────────────────────────────────────────────
        prices.insert("deepseek/deepseek-v3".into(), ModelPricing::new(0.27, 1.1));

        Self {
            prices: RwLock::new(prices),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
        }
    }

    /// Register or override pricing for a model.
    pub fn register(&self, model: impl Into<String>, pricing: ModelPricing) {
        self.prices.write().unwrap().insert(model.into(), pricing);
    }

    /// Look up pricing for a model.
    pub fn lookup(&self, model: &str) -> Option<ModelPricing> {
        self.prices.read().unwrap().get(model).cloned()
    }

    /// Compute cost for a call. Unknown models cost zero (and are logged
    /// once per call site via the caller).
    pub fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        match self.lookup(model) {
            Some(pricing) => pricing.cost(input_tokens, output_tokens),
            None => 0.0,
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_computation() {
        let pricing = ModelPricing::new(3.0, 15.0);
        // 1M input + 1M output = 3 + 15 USD
        let cost = pricing.cost(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn local_models_cost_zero() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.cost("ollama/llama3.1:8b", 50_000, 20_000), 0.0);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let table = PricingTable::with_defaults();
        assert_eq!(table.cost("nonexistent/model", 1_000, 1_000), 0.0);
    }

    #[test]
    fn register_overrides_defaults() {
        let table = PricingTable::with_defaults();
        table.register("ollama/llama3.1:8b", ModelPricing::new(1.0, 1.0));
        let cost = table.cost("ollama/llama3.1:8b", 1_000_000, 0);
        assert!((cost - 1.0).abs() < 1e-9);
    }
}
