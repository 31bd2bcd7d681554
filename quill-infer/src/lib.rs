use std::time::Duration;

use async_trait::async_trait;
use quill_types::{snippet, Diagnostics, ErrorKind, GenerationParams, ModelTier};
use thiserror::Error;

pub mod decode;
pub use decode::decode_chat_completion;

pub mod scripted;
pub use scripted::{EchoModelClient, ScriptStep, ScriptedModelClient};

/// One call to a model tier.
#[derive(Clone, Debug)]
pub struct ModelCall {
    pub tier: ModelTier,
    pub prompt: String,
    pub params: GenerationParams,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub model_id: String,
    pub model_version: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ModelResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind} error: {message}")]
pub struct ModelError {
    pub kind: ErrorKind,
    pub message: String,
    pub diagnostics: Diagnostics,
}

impl ModelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn parse(message: impl Into<String>, raw: &str, parse_error: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            message: message.into(),
            diagnostics: Diagnostics {
                raw_snippet: Some(snippet(raw)),
                parse_error: Some(parse_error.into()),
                suggestions: Vec::new(),
            },
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ErrorKind::Timeout, format!("model call exceeded {after:?}"))
    }
}

/// Seam to a model provider. Transport lives behind this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, call: ModelCall) -> Result<ModelResponse, ModelError>;
}

/// Run a model call under a deadline; an elapsed deadline is its own error kind.
pub async fn call_with_timeout(
    client: &dyn ModelClient,
    call: ModelCall,
    timeout: Duration,
) -> Result<ModelResponse, ModelError> {
    let tier = call.tier;
    match tokio::time::timeout(timeout, client.complete(call)).await {
        Ok(res) => res,
        Err(_) => {
            tracing::warn!(%tier, ?timeout, "model call timed out");
            Err(ModelError::timeout(timeout))
        }
    }
}

/// Small and big model clients.
#[derive(Clone)]
pub struct ModelPool {
    pub small: std::sync::Arc<dyn ModelClient>,
    pub big: std::sync::Arc<dyn ModelClient>,
}

impl ModelPool {
    pub fn client(&self, tier: ModelTier) -> &dyn ModelClient {
        match tier {
            ModelTier::Small => self.small.as_ref(),
            ModelTier::Big => self.big.as_ref(),
        }
    }
}
