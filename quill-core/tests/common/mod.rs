#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use quill_audit::{GenerationLogger, InMemoryGenerationLog};
use quill_core::{Components, GenerationPipeline, QuillConfig};
use quill_infer::{ModelClient, ModelPool, ScriptedModelClient};
use quill_router::FixedRouter;
use quill_types::{GenerationParams, GenerationRequest, ModelTier, RequestContext};

pub const GOOD: &str = "Mara climbed the lighthouse stairs while the storm pressed against the glass. \
    Below her, the harbour lights shivered in the rain and the boats strained at their ropes. \
    She counted the steps the way her father had taught her, slowly and without fear. \
    At the top the lamp was dark, and Ilse was waiting beside it with a lantern of her own. \
    Neither of them spoke until the first wave broke over the pier.";

pub fn request(prompt: &str) -> GenerationRequest {
    GenerationRequest {
        template_id: "scene-draft".into(),
        template_version: 1,
        rendered_prompt: prompt.into(),
        variables: BTreeMap::from([("hero".to_string(), "Mara".to_string())]),
        model_class: "prose".into(),
        params: GenerationParams::default(),
        context: RequestContext {
            project_id: "novel-1".into(),
            chapter_id: Some("ch-3".into()),
            scene_id: Some("sc-2".into()),
        },
        hints: None,
        required_entities: vec!["Mara".into(), "Ilse".into()],
    }
}

pub fn test_config() -> QuillConfig {
    let mut cfg = QuillConfig::default();
    cfg.retry.backoff_ms = 0;
    cfg.retry.model_timeout_ms = 1_000;
    cfg.schema.report_ttl_ms = 0;
    cfg
}

pub struct Harness {
    pub pipeline: GenerationPipeline,
    pub small: Arc<ScriptedModelClient>,
    pub big: Arc<ScriptedModelClient>,
    pub log: Arc<InMemoryGenerationLog>,
}

pub fn harness(
    cfg: QuillConfig,
    first: ModelTier,
    small: ScriptedModelClient,
    big: ScriptedModelClient,
) -> Harness {
    harness_with(cfg, first, small, big, |_| {})
}

pub fn harness_with(
    cfg: QuillConfig,
    first: ModelTier,
    small: ScriptedModelClient,
    big: ScriptedModelClient,
    tweak: impl FnOnce(&mut Components),
) -> Harness {
    let small = Arc::new(small);
    let big = Arc::new(big);
    let log = Arc::new(InMemoryGenerationLog::new());
    let models = ModelPool {
        small: small.clone() as Arc<dyn ModelClient>,
        big: big.clone() as Arc<dyn ModelClient>,
    };
    let mut components =
        Components::in_memory(&cfg, models, log.clone() as Arc<dyn GenerationLogger>).unwrap();
    components.router = Arc::new(FixedRouter { tier: first });
    tweak(&mut components);
    Harness {
        pipeline: GenerationPipeline::new(cfg, components),
        small,
        big,
        log,
    }
}
