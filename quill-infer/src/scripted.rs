use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use quill_types::ErrorKind;

use crate::{decode_chat_completion, ModelCall, ModelClient, ModelError, ModelResponse};

/// Deterministic local client that turns the prompt into a short passage.
pub struct EchoModelClient {
    model_id: String,
}

impl EchoModelClient {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl ModelClient for EchoModelClient {
    async fn complete(&self, call: ModelCall) -> Result<ModelResponse, ModelError> {
        let words: Vec<&str> = call.prompt.split_whitespace().collect();
        let text = format!(
            "The scene opened slowly, with rain moving across the rooftops and the lamps \
             coming on one by one along the quay. {}. Nobody in the room wanted to be the \
             first to speak, so the clock filled the silence for a while. When the door \
             finally opened, the cold came in with the news they had all been waiting for. \
             The night held its breath.",
            words.join(" ").trim_end_matches('.')
        );
        Ok(ModelResponse {
            prompt_tokens: words.len() as u32,
            completion_tokens: text.split_whitespace().count() as u32,
            text,
            model_id: self.model_id.clone(),
            model_version: "echo".into(),
        })
    }
}

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Respond(String),
    Fail(ErrorKind, String),
    /// A provider response body, decoded like a real completion.
    Raw(String),
    /// Sleep before responding; used to exercise call deadlines.
    Stall(Duration, String),
}

/// Replays a fixed script of outcomes, one per call.
pub struct ScriptedModelClient {
    model_id: String,
    steps: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
}

impl ScriptedModelClient {
    pub fn new(model_id: impl Into<String>, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            model_id: model_id.into(),
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn responding(model_id: impl Into<String>, texts: &[&str]) -> Self {
        Self::new(
            model_id,
            texts.iter().map(|t| ScriptStep::Respond(t.to_string())),
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn response(&self, call: &ModelCall, text: String) -> ModelResponse {
        ModelResponse {
            prompt_tokens: call.prompt.split_whitespace().count() as u32,
            completion_tokens: text.split_whitespace().count() as u32,
            text,
            model_id: self.model_id.clone(),
            model_version: "scripted".into(),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn complete(&self, call: ModelCall) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .map_err(|_| ModelError::new(ErrorKind::Unknown, "script lock poisoned"))?
            .pop_front();
        match step {
            Some(ScriptStep::Respond(text)) => Ok(self.response(&call, text)),
            Some(ScriptStep::Fail(kind, message)) => Err(ModelError::new(kind, message)),
            Some(ScriptStep::Raw(body)) => decode_chat_completion(&body),
            Some(ScriptStep::Stall(delay, text)) => {
                tokio::time::sleep(delay).await;
                Ok(self.response(&call, text))
            }
            None => Err(ModelError::new(ErrorKind::Api, "script exhausted")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_with_timeout;
    use quill_types::{GenerationParams, ModelTier};

    fn call() -> ModelCall {
        ModelCall {
            tier: ModelTier::Small,
            prompt: "write a scene".into(),
            params: GenerationParams::default(),
        }
    }

    #[tokio::test]
    async fn replays_steps_in_order() {
        let client = ScriptedModelClient::new(
            "s",
            [
                ScriptStep::Fail(ErrorKind::Network, "reset".into()),
                ScriptStep::Respond("ok".into()),
            ],
        );
        assert_eq!(client.complete(call()).await.unwrap_err().kind, ErrorKind::Network);
        assert_eq!(client.complete(call()).await.unwrap().text, "ok");
        assert_eq!(client.complete(call()).await.unwrap_err().kind, ErrorKind::Api);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn stalled_call_is_classified_as_timeout() {
        let client = ScriptedModelClient::new(
            "s",
            [ScriptStep::Stall(Duration::from_millis(200), "late".into())],
        );
        let err = call_with_timeout(&client, call(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn echo_is_deterministic() {
        let client = EchoModelClient::new("echo-small");
        let a = client.complete(call()).await.unwrap();
        let b = client.complete(call()).await.unwrap();
        assert_eq!(a, b);
        assert!(a.text.contains("write a scene"));
    }
}
