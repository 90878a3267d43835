//! Retrying provider client with token fill-in and cost accounting.
//!
//! Wraps an [`LlmProvider`] with bounded exponential backoff. Only transient
//! errors retry; authentication and validation errors fail the call on the
//! spot. Every successful call comes back priced, with token counts filled
//! from the meter when the provider could not report them.

use crate::budget::TokenMeter;
use crate::errors::ProviderError;
use crate::provider::{CompletionRequest, LlmProvider, PricingOracle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay_ms: u64,
    /// Multiplier applied per retry.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            factor: 2,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay before the attempt with the given 1-based index.
    fn delay_before(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let ms = self.initial_delay_ms.saturating_mul(u64::from(self.factor).pow(exp));
        Duration::from_millis(ms)
    }
}

/// A priced, fully-accounted completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCall {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in minor currency units.
    pub cost_minor: u64,
    pub latency_ms: u64,
    pub provider_id: String,
    /// True when the pricing oracle had no entry and the fallback average
    /// was used. Callers emit a `context_update` event when set.
    pub pricing_fallback: bool,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
}

impl CompletedCall {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Uniform request/retry/cost wrapper over an LLM provider.
pub struct ProviderClient {
    provider: Arc<dyn LlmProvider>,
    pricing: Arc<dyn PricingOracle>,
    fallback_pricing: Arc<dyn PricingOracle>,
    meter: TokenMeter,
    retry: RetryPolicy,
}

impl ProviderClient {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        pricing: Arc<dyn PricingOracle>,
        fallback_pricing: Arc<dyn PricingOracle>,
        meter: TokenMeter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            pricing,
            fallback_pricing,
            meter,
            retry,
        }
    }

    /// Total attempts the retry policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    /// Execute a completion with retry, cancellation, and cost accounting.
    ///
    /// Cancellation aborts between attempts and races in-flight requests;
    /// a response arriving after cancellation is discarded.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletedCall, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ProviderError::Network("cancelled".into()));
            }

            let outcome = tokio::select! {
                result = self.provider.complete(request) => result,
                _ = cancel.cancelled() => {
                    return Err(ProviderError::Network("cancelled".into()));
                }
            };

            match outcome {
                Ok(response) => {
                    let input_tokens = response.input_tokens.unwrap_or_else(|| {
                        u64::from(self.meter.estimate_messages(&request.messages, &request.model).tokens)
                    });
                    let output_tokens = response.output_tokens.unwrap_or_else(|| {
                        u64::from(self.meter.estimate(&response.text, &request.model).tokens)
                    });

                    let (cost_minor, pricing_fallback) = match self.pricing.price(
                        &response.provider_id,
                        &request.model,
                        input_tokens,
                        output_tokens,
                    ) {
                        Some(cost) => (cost, false),
                        None => {
                            let cost = self
                                .fallback_pricing
                                .price(&response.provider_id, &request.model, input_tokens, output_tokens)
                                .unwrap_or(0);
                            (cost, true)
                        }
                    };

                    return Ok(CompletedCall {
                        text: response.text,
                        input_tokens,
                        output_tokens,
                        cost_minor,
                        latency_ms: response.latency_ms,
                        provider_id: response.provider_id,
                        pricing_fallback,
                        attempts: attempt,
                    });
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = match &err {
                        ProviderError::RateLimited { retry_after_ms } => {
                            Duration::from_millis(*retry_after_ms).max(self.retry.delay_before(attempt))
                        }
                        _ => self.retry.delay_before(attempt),
                    };
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient provider error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(ProviderError::Network("cancelled".into()));
                        }
                    }
                }
                Err(err) => {
                    debug!(attempt, error = %err, "Provider call failed permanently");
                    return Err(err);
                }
            }
        }
    }
}
