//! Pricing oracle for cost accounting.
//!
//! Costs are tracked in minor currency units (hundredths of a cent) per
//! token pair. Missing entries fall back to a configurable average so
//! accounting never blocks a call; callers flag fallback pricing on the
//! event stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Looks up the cost of a completed call.
pub trait PricingOracle: Send + Sync {
    /// Cost in minor units, or `None` when no pricing data exists for the
    /// provider/model pair.
    fn price(&self, provider_id: &str, model: &str, input_tokens: u64, output_tokens: u64) -> Option<u64>;
}

/// Per-1000-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// A static pricing table keyed by (provider, model).
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rates: HashMap<(String, String), ModelRate>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rate for a provider/model pair.
    pub fn insert(&mut self, provider_id: &str, model: &str, rate: ModelRate) {
        self.rates
            .insert((provider_id.to_string(), model.to_string()), rate);
    }
}

impl PricingOracle for PricingTable {
    fn price(&self, provider_id: &str, model: &str, input_tokens: u64, output_tokens: u64) -> Option<u64> {
        let rate = self
            .rates
            .get(&(provider_id.to_string(), model.to_string()))?;
        let cost = (input_tokens as f64 / 1000.0) * rate.input_per_1k
            + (output_tokens as f64 / 1000.0) * rate.output_per_1k;
        Some(cost.round() as u64)
    }
}

/// A single flat rate for every model. Used as the fallback average.
#[derive(Debug, Clone, Copy)]
pub struct FlatPricing {
    pub rate: ModelRate,
}

impl FlatPricing {
    pub fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            rate: ModelRate {
                input_per_1k,
                output_per_1k,
            },
        }
    }
}

impl PricingOracle for FlatPricing {
    fn price(&self, _provider_id: &str, _model: &str, input_tokens: u64, output_tokens: u64) -> Option<u64> {
        let cost = (input_tokens as f64 / 1000.0) * self.rate.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.rate.output_per_1k;
        Some(cost.round() as u64)
    }
}
