//! LLM oracle contract and adapters.
//!
//! The oracle is opaque to the core: given a prompt it returns zero or
//! more candidate patch strings. Implementations own transport,
//! retries, and response extraction; the engine only ever sees the
//! blocking `llm_call` signature bridged by [`blocking_call`].

pub mod openai;

pub use openai::OpenAiOracle;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Maximum backoff between retry attempts, in seconds.
const MAX_BACKOFF_SECS: u64 = 10;

/// One conversation turn appended after the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Message role: `system`, `user`, or `assistant`.
    pub role: String,
    /// Message content.
    pub content: String,
}

/// A generation request against the oracle.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The assembled user prompt.
    pub prompt: String,
    /// System prompt (typically a meta-prompt template).
    pub system: String,
    /// Model override; `None` uses the oracle default.
    pub model: Option<String>,
    /// Number of candidates requested.
    pub n: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Extra conversation turns appended after the prompt.
    pub extra_messages: Vec<ChatTurn>,
}

impl GenerationRequest {
    /// A single-candidate request with default sampling.
    #[must_use]
    pub fn new(prompt: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: system.into(),
            model: None,
            n: 1,
            temperature: 0.7,
            extra_messages: Vec::new(),
        }
    }
}

/// A batch of generated candidate patches.
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    /// Distinct candidate patch strings, in provider order.
    pub candidates: Vec<String>,
    /// Raw provider response, when available.
    pub raw_response: Option<serde_json::Value>,
}

/// Language-model backend capable of proposing patches.
#[async_trait]
pub trait LlmOracle: Send + Sync {
    /// Oracle name for logging (e.g. `"openai"`).
    fn name(&self) -> &'static str;

    /// Generates candidate patches for the request.
    ///
    /// Implementations retry transient failures with exponential
    /// backoff capped at [`MAX_BACKOFF_SECS`] between attempts.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] on terminal transport or format failures.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, LlmError>;
}

/// Backoff delay before the retry following `attempt` (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt).min(MAX_BACKOFF_SECS))
}

/// The engine's blocking LLM callable: prompt in, patch text out.
pub type LlmCallFn = dyn Fn(&str) -> Result<String, LlmError> + Send + Sync;

/// Bridges an async oracle into the engine's blocking `llm_call`.
///
/// The closure runs on a blocking worker; it drives the oracle to
/// completion on the supplied runtime handle and returns the first
/// candidate.
#[must_use]
pub fn blocking_call(
    oracle: Arc<dyn LlmOracle>,
    handle: tokio::runtime::Handle,
    template: GenerationRequest,
) -> Arc<LlmCallFn> {
    Arc::new(move |prompt: &str| {
        let mut request = template.clone();
        request.prompt = prompt.to_string();
        let result = handle.block_on(oracle.generate(&request))?;
        Ok(result.candidates.into_iter().next().unwrap_or_default())
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    struct FixedOracle {
        responses: Vec<String>,
    }

    #[async_trait]
    impl LlmOracle for FixedOracle {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<GenerationResult, LlmError> {
            Ok(GenerationResult {
                candidates: self.responses.clone(),
                raw_response: None,
            })
        }
    }

    #[test]
    fn test_backoff_caps_at_ten_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(4), Duration::from_secs(10));
        assert_eq!(backoff_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn test_blocking_call_returns_first_candidate() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let oracle = Arc::new(FixedOracle {
            responses: vec!["first".to_string(), "second".to_string()],
        });
        let call = blocking_call(
            oracle,
            runtime.handle().clone(),
            GenerationRequest::new("", "system"),
        );
        assert_eq!(call("prompt").unwrap(), "first");
    }

    #[test]
    fn test_blocking_call_empty_candidates_yield_empty_patch() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let oracle = Arc::new(FixedOracle { responses: Vec::new() });
        let call = blocking_call(
            oracle,
            runtime.handle().clone(),
            GenerationRequest::new("", "system"),
        );
        assert_eq!(call("prompt").unwrap(), "");
    }
}
