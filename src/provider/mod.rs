//! Uniform LLM provider boundary.
//!
//! Providers are external collaborators injected at task start. The core
//! talks to them through [`LlmProvider`] with normalized request/response
//! records; [`client::ProviderClient`] adds bounded retry, token fill-in,
//! and cost accounting on top.

pub mod client;
pub mod pricing;

pub use client::{CompletedCall, ProviderClient, RetryPolicy};
pub use pricing::{FlatPricing, PricingOracle, PricingTable};

use crate::errors::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message in a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            role,
            content: content.to_string(),
        }
    }

    pub fn system(content: &str) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: &str) -> Self {
        Self::new(Role::User, content)
    }
}

/// Normalized completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_output_tokens: u64,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CompletionRequest {
    pub fn new(model: &str, messages: Vec<Message>, max_output_tokens: u64) -> Self {
        Self {
            model: model.to_string(),
            messages,
            max_output_tokens,
            stop: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Normalized completion response as reported by the provider.
///
/// Token counts are optional; when a provider cannot report them the
/// client fills them in from the token meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub latency_ms: u64,
    pub provider_id: String,
}

/// An LLM provider. Implementations wrap an actual API; the core only
/// depends on this trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable identifier used for pricing lookups and response metadata.
    fn id(&self) -> &str;

    /// Execute one completion. Implementations should return transient
    /// errors (rate limit, 5xx, network) distinctly so the client can retry.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;
}
