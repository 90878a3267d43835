//! Token estimation with a pluggable tokenizer seam.
//!
//! A model-specific tokenizer is used when one has been registered;
//! otherwise the byte-length heuristic (~4 bytes per token) applies. The
//! meter never fails: estimation always falls back rather than erroring.

use crate::provider::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which estimator produced a token count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    /// A registered model-specific tokenizer.
    Tokenizer { name: String },
    /// The bytes/4 fallback.
    Heuristic,
}

/// A token count together with the estimator that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub tokens: u32,
    pub estimator: Estimator,
}

/// Model-specific tokenizer. Implementations are optional; the meter falls
/// back to the heuristic for models without one.
pub trait Tokenizer: Send + Sync {
    /// Name recorded on counts this tokenizer produces.
    fn name(&self) -> &str;

    /// Encode text into tokens. A `None` return falls back to the heuristic.
    fn encode(&self, text: &str, model: &str) -> Option<u32>;
}

/// Provider-aware token meter.
#[derive(Clone, Default)]
pub struct TokenMeter {
    tokenizers: HashMap<String, Arc<dyn Tokenizer>>,
}

impl std::fmt::Debug for TokenMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenMeter")
            .field("tokenizers", &self.tokenizers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TokenMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tokenizer for a model. Replaces any previous registration.
    pub fn register(&mut self, model: &str, tokenizer: Arc<dyn Tokenizer>) {
        self.tokenizers.insert(model.to_string(), tokenizer);
    }

    /// Estimate tokens for a text. Deterministic; strictly positive for
    /// non-empty input; zero for empty input.
    pub fn estimate(&self, text: &str, model: &str) -> TokenCount {
        if let Some(tokenizer) = self.tokenizers.get(model)
            && let Some(tokens) = tokenizer.encode(text, model)
        {
            return TokenCount {
                tokens,
                estimator: Estimator::Tokenizer {
                    name: tokenizer.name().to_string(),
                },
            };
        }
        TokenCount {
            tokens: heuristic_tokens(text),
            estimator: Estimator::Heuristic,
        }
    }

    /// Estimate tokens for a message list, including a small per-message
    /// framing overhead.
    pub fn estimate_messages(&self, messages: &[Message], model: &str) -> TokenCount {
        let mut total: u32 = 0;
        let mut estimator = Estimator::Heuristic;
        for message in messages {
            let count = self.estimate(&message.content, model);
            // Per-message framing overhead: role plus separators.
            total = total.saturating_add(count.tokens).saturating_add(4);
            if matches!(count.estimator, Estimator::Tokenizer { .. }) {
                estimator = count.estimator;
            }
        }
        if messages.is_empty() {
            total = 0;
        }
        TokenCount {
            tokens: total,
            estimator,
        }
    }
}

/// Byte-length fallback: one token per 4 UTF-8 bytes, rounded up.
fn heuristic_tokens(text: &str) -> u32 {
    let bytes = text.len();
    if bytes == 0 {
        return 0;
    }
    (bytes.div_ceil(4)).min(u32::MAX as usize) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;

    struct FixedTokenizer;

    impl Tokenizer for FixedTokenizer {
        fn name(&self) -> &str {
            "fixed"
        }

        fn encode(&self, text: &str, _model: &str) -> Option<u32> {
            Some(text.split_whitespace().count() as u32)
        }
    }

    struct DecliningTokenizer;

    impl Tokenizer for DecliningTokenizer {
        fn name(&self) -> &str {
            "declining"
        }

        fn encode(&self, _text: &str, _model: &str) -> Option<u32> {
            None
        }
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        let meter = TokenMeter::new();
        let count = meter.estimate("", "any-model");
        assert_eq!(count.tokens, 0);
        assert_eq!(count.estimator, Estimator::Heuristic);
    }

    #[test]
    fn non_empty_text_is_strictly_positive() {
        let meter = TokenMeter::new();
        assert_eq!(meter.estimate("a", "m").tokens, 1);
        assert_eq!(meter.estimate("abcd", "m").tokens, 1);
        assert_eq!(meter.estimate("abcde", "m").tokens, 2);
    }

    #[test]
    fn heuristic_counts_utf8_bytes() {
        let meter = TokenMeter::new();
        // "héllo" is 6 bytes in UTF-8
        assert_eq!(meter.estimate("héllo", "m").tokens, 2);
    }

    #[test]
    fn estimation_is_deterministic() {
        let meter = TokenMeter::new();
        let text = "the same input every time";
        assert_eq!(meter.estimate(text, "m"), meter.estimate(text, "m"));
    }

    #[test]
    fn registered_tokenizer_is_preferred_and_recorded() {
        let mut meter = TokenMeter::new();
        meter.register("word-model", Arc::new(FixedTokenizer));

        let count = meter.estimate("three word input", "word-model");
        assert_eq!(count.tokens, 3);
        assert_eq!(
            count.estimator,
            Estimator::Tokenizer {
                name: "fixed".to_string()
            }
        );

        // Unregistered model still uses the heuristic.
        let count = meter.estimate("three word input", "other-model");
        assert_eq!(count.estimator, Estimator::Heuristic);
    }

    #[test]
    fn declining_tokenizer_falls_back_to_heuristic() {
        let mut meter = TokenMeter::new();
        meter.register("m", Arc::new(DecliningTokenizer));

        let count = meter.estimate("abcdefgh", "m");
        assert_eq!(count.tokens, 2);
        assert_eq!(count.estimator, Estimator::Heuristic);
    }

    #[test]
    fn messages_include_framing_overhead() {
        let meter = TokenMeter::new();
        let messages = vec![
            Message::new(Role::System, "abcd"),
            Message::new(Role::User, "abcd"),
        ];
        // 1 token per message content + 4 framing each
        assert_eq!(meter.estimate_messages(&messages, "m").tokens, 10);
    }

    #[test]
    fn empty_message_list_is_zero() {
        let meter = TokenMeter::new();
        assert_eq!(meter.estimate_messages(&[], "m").tokens, 0);
    }
}
