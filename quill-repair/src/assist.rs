use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quill_infer::{call_with_timeout, ModelCall, ModelClient};
use quill_quality::{rules, text};
use quill_types::{GenerationParams, GenerationRequest, ModelTier, RuleViolation};

use crate::{AssistUsage, Assisted, Proposal, RepairAssistant};

/// Asks a model for one bridging sentence that introduces a missing entity.
///
/// The proposal replaces the final sentence with itself plus the new sentence,
/// so the recorded original span is always real text from the output.
pub struct ModelRepairAssistant {
    client: Arc<dyn ModelClient>,
    tier: ModelTier,
    timeout: Duration,
}

impl ModelRepairAssistant {
    pub fn new(client: Arc<dyn ModelClient>, tier: ModelTier, timeout: Duration) -> Self {
        Self {
            client,
            tier,
            timeout,
        }
    }
}

#[async_trait]
impl RepairAssistant for ModelRepairAssistant {
    async fn propose(
        &self,
        violation: &RuleViolation,
        output: &str,
        _req: &GenerationRequest,
    ) -> Assisted {
        if violation.rule_id != rules::MISSING_ENTITY {
            return Assisted::none();
        }
        let (Some(entity), Some(last)) = (
            violation.span.as_deref(),
            text::sentences(output).last().copied(),
        ) else {
            return Assisted::none();
        };

        let prompt = format!(
            "Continue this passage with exactly one sentence that naturally mentions {entity}. \
             Reply with the sentence only.\n\nPassage ending: {last}"
        );
        let call = ModelCall {
            tier: self.tier,
            prompt,
            params: GenerationParams {
                temperature: 0.3,
                max_tokens: 80,
            },
        };
        let resp = match call_with_timeout(self.client.as_ref(), call, self.timeout).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "repair assistant call failed");
                return Assisted::none();
            }
        };
        let usage = AssistUsage {
            tier: self.tier,
            tokens: resp.total_tokens(),
        };

        let sentence = resp.text.trim();
        let mentions = sentence.to_lowercase().contains(&entity.to_lowercase());
        let single = text::sentences(sentence).len() == 1;
        let confidence = match (mentions, single) {
            (true, true) => 0.85,
            (true, false) => 0.6,
            _ => 0.0,
        };
        Assisted {
            proposal: Some(Proposal {
                original: last.to_string(),
                replacement: format!("{last} {sentence}"),
                confidence,
            }),
            usage: Some(usage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RepairConfig, RepairEngine};
    use quill_infer::ScriptedModelClient;
    use quill_types::{RepairMethod, RequestContext, Severity};
    use std::collections::BTreeMap;

    fn request() -> GenerationRequest {
        GenerationRequest {
            template_id: "scene".into(),
            template_version: 1,
            rendered_prompt: "p".into(),
            variables: BTreeMap::new(),
            model_class: "prose".into(),
            params: GenerationParams::default(),
            context: RequestContext::default(),
            hints: None,
            required_entities: vec!["Ilse".into()],
        }
    }

    fn missing_ilse() -> RuleViolation {
        RuleViolation {
            rule_id: rules::MISSING_ENTITY.into(),
            severity: Severity::Error,
            message: String::new(),
            span: Some("Ilse".into()),
        }
    }

    #[tokio::test]
    async fn inserts_entity_sentence() {
        let client = Arc::new(ScriptedModelClient::responding(
            "big",
            &["Ilse watched from the doorway."],
        ));
        let engine = RepairEngine::new(RepairConfig::default()).with_assistant(Arc::new(
            ModelRepairAssistant::new(client.clone(), ModelTier::Big, Duration::from_secs(1)),
        ));
        let out = engine
            .repair("Mara lit the lamp. The room warmed.", &[missing_ilse()], &request())
            .await;
        assert_eq!(
            out.text,
            "Mara lit the lamp. The room warmed. Ilse watched from the doorway."
        );
        assert_eq!(out.actions[0].method, RepairMethod::ModelAssisted);
        assert_eq!(client.calls(), 1);
        // Scripted usage: the prompt's words plus the reply's four words.
        assert_eq!(out.usage.len(), 1);
        assert_eq!(out.usage[0].tier, ModelTier::Big);
        assert!(out.usage[0].tokens > 4);
    }

    #[tokio::test]
    async fn reply_without_entity_is_rejected() {
        let client = Arc::new(ScriptedModelClient::responding("big", &["The wind howled."]));
        let engine = RepairEngine::new(RepairConfig::default()).with_assistant(Arc::new(
            ModelRepairAssistant::new(client, ModelTier::Big, Duration::from_secs(1)),
        ));
        let out = engine.repair("Mara lit the lamp.", &[missing_ilse()], &request()).await;
        assert!(out.actions.is_empty());
        assert_eq!(out.unrepaired.len(), 1);
        assert_eq!(out.usage.len(), 1, "a rejected reply is still billed");
    }
}
