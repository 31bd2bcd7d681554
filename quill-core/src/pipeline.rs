use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use quill_audit::{GenerationLogEntry, GenerationLogger};
use quill_cache::{CacheHit, CacheMetadata, CacheStore, InMemoryCacheStore, TierKey};
use quill_features::{
    FeatureGate, InMemoryOverrides, AUTO_REPAIR, ENHANCED_CACHE, QUALITY_EVALUATION,
};
use quill_fingerprint::{template_signature, Embedder, Fingerprinter, Fingerprints, LexicalEmbedder};
use quill_infer::{call_with_timeout, ModelCall, ModelError, ModelPool};
use quill_quality::{QualityEvaluator, QualityReport};
use quill_repair::{ModelRepairAssistant, RepairAssistant, RepairEngine};
use quill_router::{cache_decision, Router, ScoringRouter, StrategyPlan};
use quill_schema::{
    SchemaCompatibilityChecker, SchemaInventory, StaticInventory, REQUIRED_SCHEMA_VERSION,
};
use quill_types::{
    snippet, CacheTier, Diagnostics, ErrorKind, ExecutionId, GenerationRequest, ModelTier,
    QualityScore, RouteState, RouteStrategy,
};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::QuillConfig;
use crate::context::{ExecutionContext, Terminal};
use crate::error::PipelineError;

/// Collaborators the pipeline is wired from.
pub struct Components {
    pub cache: Arc<dyn CacheStore>,
    pub embedder: Arc<dyn Embedder>,
    pub router: Arc<dyn Router>,
    pub models: ModelPool,
    pub audit: Arc<dyn GenerationLogger>,
    pub features: Arc<FeatureGate>,
    pub schema: Arc<SchemaCompatibilityChecker>,
    pub repair_assistant: Option<Arc<dyn RepairAssistant>>,
}

impl Components {
    /// Process-local cache, lexical embeddings, scoring router and in-memory
    /// overrides around the given models and audit log.
    pub fn in_memory(
        cfg: &QuillConfig,
        models: ModelPool,
        audit: Arc<dyn GenerationLogger>,
    ) -> Result<Self, PipelineError> {
        let inventory: Arc<dyn SchemaInventory> = match &cfg.schema.inventory_path {
            Some(path) => Arc::new(StaticInventory::from_path(path)?),
            None => Arc::new(StaticInventory::declared(REQUIRED_SCHEMA_VERSION)),
        };
        let schema = Arc::new(SchemaCompatibilityChecker::new(
            inventory,
            Duration::from_millis(cfg.schema.report_ttl_ms),
        ));
        let features = Arc::new(FeatureGate::builtin(
            Arc::new(InMemoryOverrides::new()),
            schema.clone(),
        )?);
        let assistant: Arc<dyn RepairAssistant> = Arc::new(ModelRepairAssistant::new(
            models.big.clone(),
            ModelTier::Big,
            cfg.retry.model_timeout(),
        ));
        Ok(Self {
            cache: Arc::new(InMemoryCacheStore::new(cfg.cache.clone())),
            embedder: Arc::new(LexicalEmbedder::new(cfg.cache.embed_dim)),
            router: Arc::new(ScoringRouter::new(cfg.router.clone())),
            models,
            audit,
            features,
            schema,
            repair_assistant: Some(assistant),
        })
    }
}

/// What the caller gets back for a served request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub execution_id: ExecutionId,
    pub text: String,
    pub quality_score: Option<QualityScore>,
    /// Cache tier that served the request, `None` for a model-served result.
    pub cache_path: Option<CacheTier>,
    pub strategy: RouteStrategy,
    pub retry_count: u32,
    pub tokens_used: u32,
    pub cost: f64,
}

#[derive(Clone, Copy, Debug)]
struct Stages {
    enhanced_cache: bool,
    quality: bool,
    repair: bool,
}

enum AttemptFailure {
    Model(ModelError),
    Rejected { text: String, report: QualityReport },
}

impl AttemptFailure {
    fn kind(&self) -> ErrorKind {
        match self {
            AttemptFailure::Model(e) => e.kind,
            AttemptFailure::Rejected { .. } => ErrorKind::Validation,
        }
    }

    /// Eligible for another attempt on the same tier.
    fn retryable(&self) -> bool {
        match self {
            AttemptFailure::Model(e) => e.kind.is_transient(),
            AttemptFailure::Rejected { .. } => true,
        }
    }

    fn into_parts(self) -> (ErrorKind, String, Diagnostics) {
        match self {
            AttemptFailure::Model(e) => (e.kind, e.message, e.diagnostics),
            AttemptFailure::Rejected { text, report } => {
                let blocking: Vec<&str> = report.blocking().map(|v| v.rule_id.as_str()).collect();
                let message = if blocking.is_empty() {
                    format!("output rejected with overall quality {:.2}", report.score.overall)
                } else {
                    format!("output rejected by rules: {}", blocking.join(", "))
                };
                let mut suggestions = report.score.suggestions;
                suggestions.extend(report.violations.into_iter().map(|v| v.message));
                (
                    ErrorKind::Validation,
                    message,
                    Diagnostics {
                        raw_snippet: Some(snippet(&text)),
                        parse_error: None,
                        suggestions,
                    },
                )
            }
        }
    }
}

/// The request state machine: cache check, strategy, model attempts, quality,
/// repair, then one audit append at the terminal state.
pub struct GenerationPipeline {
    cfg: QuillConfig,
    components: Components,
    fingerprinter: Fingerprinter,
    evaluator: QualityEvaluator,
    repair: RepairEngine,
}

impl GenerationPipeline {
    pub fn new(cfg: QuillConfig, components: Components) -> Self {
        let fingerprinter =
            Fingerprinter::new(components.embedder.clone(), cfg.retry.embed_timeout());
        let evaluator = QualityEvaluator::new(cfg.quality.clone());
        let mut repair_cfg = cfg.repair.clone();
        if repair_cfg.max_words.is_none() {
            repair_cfg.max_words = cfg.quality.rules.max_words;
        }
        let mut repair = RepairEngine::new(repair_cfg);
        if let Some(assistant) = &components.repair_assistant {
            repair = repair.with_assistant(assistant.clone());
        }
        Self {
            cfg,
            components,
            fingerprinter,
            evaluator,
            repair,
        }
    }

    pub fn config(&self) -> &QuillConfig {
        &self.cfg
    }

    pub fn components(&self) -> &Components {
        &self.components
    }

    /// Run one request to a terminal state. Exactly one audit entry is written
    /// for every request that passes validation.
    pub async fn submit(&self, req: GenerationRequest) -> Result<GenerationOutcome, PipelineError> {
        validate(&req)?;
        let execution_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "generation",
            %execution_id,
            project = %req.context.project_id,
            template = %req.template_id,
        );
        self.execute(execution_id, req).instrument(span).await
    }

    async fn execute(
        &self,
        execution_id: ExecutionId,
        req: GenerationRequest,
    ) -> Result<GenerationOutcome, PipelineError> {
        let mut ctx = ExecutionContext::new(execution_id);
        let gate = &self.components.features;
        let stages = Stages {
            enhanced_cache: gate.is_enabled(ENHANCED_CACHE),
            quality: gate.is_enabled(QUALITY_EVALUATION),
            repair: gate.is_enabled(AUTO_REPAIR),
        };

        ctx.trace.enter(RouteState::CacheCheck);
        let fps = self.fingerprints(&req, stages.enhanced_cache, &mut ctx).await;
        if let Some(hit) = self.lookup(&fps, &mut ctx).await {
            return self.serve_cached(req, hit, stages, ctx).await;
        }

        ctx.trace.enter(RouteState::Miss);
        ctx.trace.enter(RouteState::StrategySelect);
        let history_key = template_signature(&req);
        let plan = self.components.router.select(&req, &history_key).await;
        tracing::info!(
            strategy = plan.planned_strategy().as_str(),
            score = plan.score,
            "cache miss; strategy selected"
        );

        match self.run_models(&req, &plan, &history_key, stages, &mut ctx).await {
            Ok(text) => {
                ctx.trace.enter(RouteState::Done);
                self.finish_served(req, &plan, &fps, text, ctx).await
            }
            Err(failure) => {
                ctx.trace.enter(RouteState::Failed);
                self.finish_failed(req, &plan, failure, ctx).await
            }
        }
    }

    async fn fingerprints(
        &self,
        req: &GenerationRequest,
        enhanced: bool,
        ctx: &mut ExecutionContext,
    ) -> Fingerprints {
        match self.fingerprinter.fingerprint(req, enhanced).await {
            Ok(fps) => fps,
            Err(err) => {
                ctx.warn(format!("semantic fingerprint unavailable: {err}"));
                let mut fps = Fingerprints::exact_only(req);
                fps.template = Some(template_signature(req));
                fps
            }
        }
    }

    async fn lookup(&self, fps: &Fingerprints, ctx: &mut ExecutionContext) -> Option<CacheHit> {
        match self.components.cache.lookup(fps, Utc::now()).await {
            Ok(hit) => hit,
            Err(err) => {
                ctx.warn(format!("cache lookup failed, treating as miss: {err}"));
                None
            }
        }
    }

    async fn serve_cached(
        &self,
        req: GenerationRequest,
        hit: CacheHit,
        stages: Stages,
        mut ctx: ExecutionContext,
    ) -> Result<GenerationOutcome, PipelineError> {
        ctx.trace.enter(RouteState::Hit);
        let tier = hit.tier();
        let hits = match self.components.cache.touch(tier, hit.entry.key.id()).await {
            Ok(n) => n,
            Err(err) => {
                ctx.warn(format!("cache touch failed: {err}"));
                hit.entry.hit_count
            }
        };
        tracing::info!(%tier, hits, similarity = hit.similarity, "served from cache");
        ctx.cache_tier = Some(tier);
        ctx.cache_hit_count = Some(hits);

        let text = hit.entry.payload;
        if stages.quality {
            let report = self.evaluator.evaluate(&text, &req);
            ctx.quality = Some(report.score);
            ctx.violations = report.violations;
        }
        ctx.trace.enter(RouteState::Done);
        let decision = cache_decision(tier, hit.similarity, std::mem::take(&mut ctx.trace).into_transitions());

        let outcome = GenerationOutcome {
            execution_id: ctx.execution_id,
            text,
            quality_score: ctx.quality.clone(),
            cache_path: Some(tier),
            strategy: RouteStrategy::Cache,
            retry_count: 0,
            tokens_used: 0,
            cost: 0.0,
        };
        let entry = ctx.into_entry(&req, decision, Terminal::Served(&outcome.text));
        self.record(entry).await?;
        Ok(outcome)
    }

    /// Small model gets one escalation to big. Transient errors and rejections
    /// are retried on the current tier. Escalation and retries draw from the
    /// same `max_retries` budget, so `retry_count` never exceeds it.
    async fn run_models(
        &self,
        req: &GenerationRequest,
        plan: &StrategyPlan,
        history_key: &str,
        stages: Stages,
        ctx: &mut ExecutionContext,
    ) -> Result<String, AttemptFailure> {
        let mut tier = plan.first;
        let mut fallback_left = plan.allow_fallback && tier == ModelTier::Small;
        let mut retries_left = self.cfg.retry.max_retries;
        ctx.trace.enter(model_state(tier));

        loop {
            let result = self.attempt(tier, req, stages, ctx).await;
            if tier == ModelTier::Small {
                self.components
                    .router
                    .record_small_outcome(history_key, result.is_ok());
            }
            let failure = match result {
                Ok(text) => return Ok(text),
                Err(failure) => failure,
            };
            tracing::warn!(%tier, kind = %failure.kind(), attempt = ctx.attempts, retries_left, "attempt failed");

            if retries_left == 0 {
                return Err(failure);
            }
            if tier == ModelTier::Small && fallback_left {
                retries_left -= 1;
                fallback_left = false;
                tier = ModelTier::Big;
                ctx.trace.enter(RouteState::FallbackBigModel);
                ctx.trace.enter(RouteState::BigModel);
                continue;
            }
            if !failure.retryable() {
                return Err(failure);
            }
            retries_left -= 1;
            ctx.trace.enter(RouteState::Retry);
            let delay = self.cfg.retry.backoff(self.cfg.retry.max_retries - retries_left);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            ctx.trace.enter(model_state(tier));
        }
    }

    async fn attempt(
        &self,
        tier: ModelTier,
        req: &GenerationRequest,
        stages: Stages,
        ctx: &mut ExecutionContext,
    ) -> Result<String, AttemptFailure> {
        ctx.attempts += 1;
        ctx.repairs.clear();
        let call = ModelCall {
            tier,
            prompt: req.rendered_prompt.clone(),
            params: req.params.clone(),
        };
        let resp = call_with_timeout(
            self.components.models.client(tier),
            call,
            self.cfg.retry.model_timeout(),
        )
        .await
        .map_err(AttemptFailure::Model)?;
        ctx.charge(tier, &resp, &self.cfg.pricing);

        if !stages.quality {
            return Ok(resp.text);
        }

        ctx.trace.enter(RouteState::QualityCheck);
        let report = self.evaluator.evaluate(&resp.text, req);
        ctx.quality = Some(report.score.clone());
        ctx.violations = report.violations.clone();

        // Accepted output with warnings is still repaired.
        if stages.repair && !report.violations.is_empty() {
            ctx.trace.enter(RouteState::Repair);
            let out = self.repair.repair(&resp.text, &report.violations, req).await;
            for usage in &out.usage {
                ctx.charge_repair(usage.tier, usage.tokens, &self.cfg.pricing);
            }
            if !out.actions.is_empty() {
                tracing::info!(
                    repaired = out.actions.len(),
                    unrepaired = out.unrepaired.len(),
                    "repairs applied"
                );
                let rescored = self.evaluator.evaluate(&out.text, req);
                if rescored.accepted {
                    ctx.repairs = out.actions;
                    ctx.quality = Some(rescored.score.clone());
                    ctx.violations = rescored.violations;
                    return Ok(out.text);
                }
                if !report.accepted {
                    ctx.repairs = out.actions;
                    ctx.quality = Some(rescored.score.clone());
                    ctx.violations = rescored.violations.clone();
                    return Err(AttemptFailure::Rejected {
                        text: out.text,
                        report: rescored,
                    });
                }
                tracing::warn!("repaired text fell below the acceptance bar; serving the original");
            }
        }

        if report.accepted {
            return Ok(resp.text);
        }
        Err(AttemptFailure::Rejected {
            text: resp.text,
            report,
        })
    }

    async fn finish_served(
        &self,
        req: GenerationRequest,
        plan: &StrategyPlan,
        fps: &Fingerprints,
        text: String,
        mut ctx: ExecutionContext,
    ) -> Result<GenerationOutcome, PipelineError> {
        let decision = std::mem::take(&mut ctx.trace).seal(plan);
        let outcome = GenerationOutcome {
            execution_id: ctx.execution_id,
            text,
            quality_score: ctx.quality.clone(),
            cache_path: None,
            strategy: decision.strategy,
            retry_count: ctx.retry_count(),
            tokens_used: ctx.tokens_used,
            cost: ctx.cost,
        };
        let metadata = ctx.model.as_ref().map(|(tier, model_id, _)| CacheMetadata {
            model_id: model_id.clone(),
            model_tier: *tier,
            tokens_used: ctx.tokens_used,
            cost: ctx.cost,
            quality: ctx.quality.as_ref().map(|q| q.overall),
        });

        let entry = ctx.into_entry(&req, decision, Terminal::Served(&outcome.text));
        self.record(entry).await?;

        // Only audited output is reused.
        if let Some(metadata) = metadata {
            self.populate_cache(fps, &outcome.text, metadata).await;
        }
        Ok(outcome)
    }

    async fn finish_failed(
        &self,
        req: GenerationRequest,
        plan: &StrategyPlan,
        failure: AttemptFailure,
        mut ctx: ExecutionContext,
    ) -> Result<GenerationOutcome, PipelineError> {
        let decision = std::mem::take(&mut ctx.trace).seal(plan);
        let execution_id = ctx.execution_id;
        let (kind, message, diagnostics) = failure.into_parts();
        let entry = ctx.into_entry(
            &req,
            decision,
            Terminal::Failed {
                kind,
                message: &message,
                diagnostics: &diagnostics,
            },
        );
        self.record(entry).await?;
        Err(PipelineError::Terminal {
            execution_id,
            kind,
            message,
            diagnostics,
        })
    }

    async fn populate_cache(&self, fps: &Fingerprints, text: &str, metadata: CacheMetadata) {
        let now = Utc::now();
        for key in TierKey::all_from(fps) {
            let tier = key.tier();
            if let Err(err) = self
                .components
                .cache
                .store(key, text.to_string(), metadata.clone(), now)
                .await
            {
                tracing::warn!(%tier, error = %err, "cache store failed");
            }
        }
    }

    async fn record(&self, entry: GenerationLogEntry) -> Result<(), PipelineError> {
        let execution_id = entry.execution_id;
        match self.components.audit.record(entry).await {
            Ok(stored) => {
                tracing::info!(chain_hash = %stored.chain_hash, "generation audited");
                Ok(())
            }
            Err(source) => {
                tracing::error!(error = %source, "audit append failed; reporting request as failed");
                Err(PipelineError::AuditWrite {
                    execution_id,
                    source,
                })
            }
        }
    }
}

fn model_state(tier: ModelTier) -> RouteState {
    match tier {
        ModelTier::Small => RouteState::SmallModel,
        ModelTier::Big => RouteState::BigModel,
    }
}

fn validate(req: &GenerationRequest) -> Result<(), PipelineError> {
    if req.rendered_prompt.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("rendered prompt is empty".into()));
    }
    if req.template_id.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("template id is empty".into()));
    }
    if req.context.project_id.trim().is_empty() {
        return Err(PipelineError::InvalidRequest("project id is empty".into()));
    }
    if req.params.max_tokens == 0 {
        return Err(PipelineError::InvalidRequest("max_tokens must be positive".into()));
    }
    if !req.params.temperature.is_finite() || req.params.temperature < 0.0 {
        return Err(PipelineError::InvalidRequest(format!(
            "temperature {} out of range",
            req.params.temperature
        )));
    }
    Ok(())
}
