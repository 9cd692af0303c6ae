use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use autorun_types::ModelSpec;

mod classify;
mod gateway;
mod limiter;
mod retry;

pub use classify::*;
pub use gateway::*;
pub use limiter::*;
pub use retry::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CallParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ask the provider for a bare JSON object where supported.
    #[serde(default)]
    pub json_only: bool,
}

impl CallParams {
    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        if temperature.is_some() {
            self.temperature = temperature;
        }
        self
    }

    pub fn json(mut self) -> Self {
        self.json_only = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: ModelSpec,
    pub params: CallParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub call_id: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("llm call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Provider(String),
}

impl LlmError {
    pub fn from_message(message: String) -> Self {
        match classify_error(&message) {
            ErrorClass::RateLimited => LlmError::RateLimited(message),
            ErrorClass::Transient => LlmError::Transient(message),
            ErrorClass::Other => LlmError::Provider(message),
        }
    }

    pub fn outcome(&self) -> CallOutcome {
        match self {
            LlmError::Timeout(_) | LlmError::Transient(_) => CallOutcome::Transient,
            LlmError::RateLimited(_) => CallOutcome::RateLimited,
            LlmError::Provider(_) => CallOutcome::Other,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "timeout",
            LlmError::RateLimited(_) => "rate_limited",
            LlmError::Transient(_) => "transient",
            LlmError::Provider(_) => "provider",
        }
    }
}

/// One LLM completion backend. Transport and SDK details live behind this.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider id this client serves. Models with a blank provider id are
    /// attributed to it.
    fn provider_id(&self) -> &str;
    async fn complete(&self, request: LlmRequest) -> anyhow::Result<LlmResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_classified() {
        assert!(matches!(
            LlmError::from_message("429 too many requests".to_string()),
            LlmError::RateLimited(_)
        ));
        assert_eq!(
            LlmError::Timeout(Duration::from_secs(1)).outcome(),
            CallOutcome::Transient
        );
    }
}
