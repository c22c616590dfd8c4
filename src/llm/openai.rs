//! OpenAI-compatible oracle using the `async-openai` crate.
//!
//! Works against any API following the OpenAI chat completion spec
//! (OpenAI, Azure, local proxies) via the base URL override. Transient
//! failures are retried with exponential backoff capped at 10 seconds.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequest, CreateChatCompletionResponse,
};
use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ChatTurn, GenerationRequest, GenerationResult, LlmOracle, backoff_delay};
use crate::error::LlmError;

/// Default model when neither the request nor the oracle names one.
const DEFAULT_MODEL: &str = "gpt-4.1";
/// Default retry attempts per request.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Validator applied to each returned candidate before acceptance.
pub type DiffValidator = dyn Fn(&str) -> bool + Send + Sync;

/// OpenAI-compatible LLM oracle.
pub struct OpenAiOracle {
    client: Client<OpenAIConfig>,
    default_model: String,
    max_retries: u32,
    diff_validator: Option<Box<DiffValidator>>,
}

impl OpenAiOracle {
    /// Creates an oracle from explicit credentials.
    #[must_use]
    pub fn new(api_key: &str, base_url: Option<&str>, default_model: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = base_url {
            config = config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(config),
            default_model: default_model.unwrap_or(DEFAULT_MODEL).to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            diff_validator: None,
        }
    }

    /// Creates an oracle from `OPENAI_API_KEY` / `OPENAI_BASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ApiKeyMissing`] when no key is present.
    pub fn from_env() -> Result<Self, LlmError> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| LlmError::ApiKeyMissing)?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok();
        Ok(Self::new(&api_key, base_url.as_deref(), None))
    }

    /// Sets the maximum retry attempts per request.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Installs a candidate validator; non-matching candidates are
    /// dropped from the result.
    #[must_use]
    pub fn with_diff_validator(
        mut self,
        validator: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.diff_validator = Some(Box::new(validator));
        self
    }

    fn convert_turn(turn: &ChatTurn) -> ChatCompletionRequestMessage {
        match turn.role.as_str() {
            "system" => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                        turn.content.clone(),
                    ),
                    name: None,
                })
            }
            "assistant" => {
                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(
                        async_openai::types::ChatCompletionRequestAssistantMessageContent::Text(
                            turn.content.clone(),
                        ),
                    ),
                    name: None,
                    tool_calls: None,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
            _ => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: async_openai::types::ChatCompletionRequestUserMessageContent::Text(
                    turn.content.clone(),
                ),
                name: None,
            }),
        }
    }

    fn build_request(&self, request: &GenerationRequest) -> CreateChatCompletionRequest {
        let mut messages = vec![
            Self::convert_turn(&ChatTurn {
                role: "system".to_string(),
                content: request.system.clone(),
            }),
            Self::convert_turn(&ChatTurn {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }),
        ];
        messages.extend(request.extra_messages.iter().map(Self::convert_turn));

        CreateChatCompletionRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone()),
            messages,
            n: Some(u8::try_from(request.n).unwrap_or(u8::MAX).max(1)),
            temperature: Some(request.temperature),
            ..Default::default()
        }
    }

    fn extract_candidates(
        &self,
        response: &CreateChatCompletionResponse,
    ) -> Result<Vec<String>, LlmError> {
        let mut candidates = Vec::new();
        for choice in &response.choices {
            let Some(content) = choice.message.content.as_deref() else {
                continue;
            };
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            if self
                .diff_validator
                .as_ref()
                .is_none_or(|validator| validator(content))
            {
                candidates.push(content.to_string());
            }
        }
        if candidates.is_empty() {
            return Err(LlmError::NoCandidates);
        }
        Ok(candidates)
    }
}

impl std::fmt::Debug for OpenAiOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiOracle")
            .field("default_model", &self.default_model)
            .field("max_retries", &self.max_retries)
            .field("diff_validator", &self.diff_validator.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LlmOracle for OpenAiOracle {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult, LlmError> {
        if request.n < 1 {
            return Err(LlmError::InvalidResponse {
                message: "parameter 'n' must be at least 1".to_string(),
            });
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            let openai_request = self.build_request(request);
            // A response with no usable candidates is retried the same
            // way as a transport failure.
            let outcome = match self.client.chat().create(openai_request).await {
                Ok(response) => self.extract_candidates(&response).map(|candidates| {
                    (candidates, serde_json::to_value(&response).ok())
                }),
                Err(err) => Err(LlmError::Request {
                    message: err.to_string(),
                }),
            };
            match outcome {
                Ok((candidates, raw_response)) => {
                    debug!(
                        attempt,
                        candidates = candidates.len(),
                        "generation succeeded"
                    );
                    return Ok(GenerationResult {
                        candidates,
                        raw_response,
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt < self.max_retries {
                        let delay = backoff_delay(attempt);
                        warn!(attempt, error = %last_error, ?delay, "generation failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(LlmError::Request {
            message: last_error,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_defaults_model() {
        let oracle = OpenAiOracle::new("key", None, Some("custom-model"));
        let built = oracle.build_request(&GenerationRequest::new("prompt", "system"));
        assert_eq!(built.model, "custom-model");
        assert_eq!(built.n, Some(1));
        assert_eq!(built.messages.len(), 2);
    }

    #[test]
    fn test_build_request_honors_overrides() {
        let oracle = OpenAiOracle::new("key", None, None);
        let mut request = GenerationRequest::new("prompt", "system");
        request.model = Some("override".to_string());
        request.n = 4;
        request.temperature = 0.2;
        request.extra_messages.push(ChatTurn {
            role: "assistant".to_string(),
            content: "previous attempt".to_string(),
        });
        let built = oracle.build_request(&request);
        assert_eq!(built.model, "override");
        assert_eq!(built.n, Some(4));
        assert_eq!(built.temperature, Some(0.2));
        assert_eq!(built.messages.len(), 3);
    }

    #[test]
    fn test_convert_turn_roles() {
        let system = OpenAiOracle::convert_turn(&ChatTurn {
            role: "system".to_string(),
            content: "s".to_string(),
        });
        assert!(matches!(system, ChatCompletionRequestMessage::System(_)));
        let user = OpenAiOracle::convert_turn(&ChatTurn {
            role: "anything-else".to_string(),
            content: "u".to_string(),
        });
        assert!(matches!(user, ChatCompletionRequestMessage::User(_)));
        let assistant = OpenAiOracle::convert_turn(&ChatTurn {
            role: "assistant".to_string(),
            content: "a".to_string(),
        });
        assert!(matches!(
            assistant,
            ChatCompletionRequestMessage::Assistant(_)
        ));
    }
}
