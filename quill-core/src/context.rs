use std::time::Instant;

use chrono::{DateTime, Utc};
use quill_audit::{GenerationLogEntry, Outcome};
use quill_infer::ModelResponse;
use quill_router::RouteTrace;
use quill_types::{
    CacheTier, Diagnostics, ErrorKind, ExecutionId, GenerationRequest, ModelTier, QualityScore,
    RepairAction, RouteDecision, RuleViolation,
};
use sha2::{Digest, Sha256};

use crate::config::PricingConfig;

const SUMMARY_CHARS: usize = 160;

/// In-memory state of one execution. Nothing here is durable until the
/// terminal outcome is written as a single audit entry.
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub trace: RouteTrace,
    pub attempts: u32,
    pub tokens_used: u32,
    pub cost: f64,
    pub model: Option<(ModelTier, String, String)>,
    pub quality: Option<QualityScore>,
    pub violations: Vec<RuleViolation>,
    pub repairs: Vec<RepairAction>,
    pub warnings: Vec<String>,
    pub cache_tier: Option<CacheTier>,
    pub cache_hit_count: Option<u64>,
}

/// How the execution ended.
pub enum Terminal<'a> {
    Served(&'a str),
    Failed {
        kind: ErrorKind,
        message: &'a str,
        diagnostics: &'a Diagnostics,
    },
}

impl ExecutionContext {
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            started: Instant::now(),
            started_at: Utc::now(),
            trace: RouteTrace::new(),
            attempts: 0,
            tokens_used: 0,
            cost: 0.0,
            model: None,
            quality: None,
            violations: Vec::new(),
            repairs: Vec::new(),
            warnings: Vec::new(),
            cache_tier: None,
            cache_hit_count: None,
        }
    }

    /// Attempts beyond the first.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(execution_id = %self.execution_id, "{message}");
        self.warnings.push(message);
    }

    /// Every attempt is billed, accepted or not.
    pub fn charge(&mut self, tier: ModelTier, resp: &ModelResponse, pricing: &PricingConfig) {
        let tokens = resp.total_tokens();
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost += pricing.cost(tier, tokens);
        self.model = Some((tier, resp.model_id.clone(), resp.model_version.clone()));
    }

    /// Model-assisted repair spend. Billed without changing the serving model.
    pub fn charge_repair(&mut self, tier: ModelTier, tokens: u32, pricing: &PricingConfig) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
        self.cost += pricing.cost(tier, tokens);
    }

    pub fn into_entry(
        self,
        req: &GenerationRequest,
        decision: RouteDecision,
        terminal: Terminal<'_>,
    ) -> GenerationLogEntry {
        let duration_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let retry_count = self.retry_count();
        let (model_tier, model_id, model_version) = match self.model {
            Some((tier, id, version)) => (Some(tier), Some(id), Some(version)),
            None => (None, None, None),
        };
        let (outcome, response_hash, response_summary, error_kind, error_message, diagnostics) =
            match terminal {
                Terminal::Served(text) => (
                    Outcome::Success,
                    Some(sha256_hex(text)),
                    Some(text.chars().take(SUMMARY_CHARS).collect()),
                    None,
                    None,
                    None,
                ),
                Terminal::Failed {
                    kind,
                    message,
                    diagnostics,
                } => (
                    Outcome::Failure,
                    None,
                    None,
                    Some(kind),
                    Some(message.to_string()),
                    Some(diagnostics.clone()),
                ),
            };

        GenerationLogEntry {
            execution_id: self.execution_id,
            project_id: req.context.project_id.clone(),
            chapter_id: req.context.chapter_id.clone(),
            scene_id: req.context.scene_id.clone(),
            template_id: req.template_id.clone(),
            template_version: req.template_version,
            prompt_hash: sha256_hex(&req.rendered_prompt),
            model_id,
            model_version,
            model_tier,
            parameters: req.params.clone(),
            route_decision: decision,
            cache_tier: self.cache_tier,
            cache_hit_count: self.cache_hit_count,
            response_hash,
            response_summary,
            tokens_used: self.tokens_used,
            cost: self.cost,
            quality_score: self.quality,
            rule_violations: self.violations,
            repair_actions: self.repairs,
            retry_count,
            duration_ms,
            outcome,
            error_kind,
            error_message,
            diagnostics,
            warnings: self.warnings,
            corrects: None,
            timestamp: self.started_at,
            prev_hash: None,
            chain_hash: String::new(),
        }
    }
}

pub fn sha256_hex(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
