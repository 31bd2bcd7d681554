use quill_types::ErrorKind;
use serde::Deserialize;

use crate::{ModelError, ModelResponse};

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: String,
    #[serde(default)]
    system_fingerprint: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Decode an OpenAI-compatible chat completion body.
///
/// Provider errors map to `api`, malformed JSON to `parse`, and a decodable
/// body without usable content to `validation`.
pub fn decode_chat_completion(raw: &str) -> Result<ModelResponse, ModelError> {
    let body: ChatCompletion = serde_json::from_str(raw)
        .map_err(|e| ModelError::parse("completion body is not valid JSON", raw, e.to_string()))?;

    if let Some(err) = body.error {
        return Err(ModelError::new(ErrorKind::Api, err.message));
    }

    let text = body
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            let mut e = ModelError::new(ErrorKind::Validation, "completion has no message content");
            e.diagnostics.raw_snippet = Some(quill_types::snippet(raw));
            e.diagnostics
                .suggestions
                .push("check max_tokens and stop sequences".into());
            e
        })?;

    let usage = body.usage.unwrap_or(Usage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });
    Ok(ModelResponse {
        text,
        model_id: body.model,
        model_version: body.system_fingerprint.unwrap_or_default(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_content_and_usage() {
        let raw = r#"{"model":"big-1","system_fingerprint":"fp_9","choices":[{"message":{"role":"assistant","content":"Rain fell."}}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let resp = decode_chat_completion(raw).unwrap();
        assert_eq!(resp.text, "Rain fell.");
        assert_eq!(resp.model_version, "fp_9");
        assert_eq!(resp.total_tokens(), 15);
    }

    #[test]
    fn malformed_body_is_parse_error_with_snippet() {
        let err = decode_chat_completion("{\"choices\": [").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(err.diagnostics.raw_snippet.is_some());
        assert!(err.diagnostics.parse_error.is_some());
    }

    #[test]
    fn empty_content_is_validation_error() {
        let err = decode_chat_completion(r#"{"choices":[{"message":{"content":"  "}}]}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn provider_error_is_api_error() {
        let err = decode_chat_completion(r#"{"error":{"message":"rate limited"}}"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
    }
}
