use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use quill_types::{
    CacheTier, FeatureContribution, GenerationRequest, ModelPreference, ModelTier, RouteDecision,
    RouteState, RouteStrategy,
};
use serde::{Deserialize, Serialize};

pub mod trace;
pub use trace::RouteTrace;

/// Which tier to try first and whether one escalation is permitted.
#[derive(Clone, Debug, PartialEq)]
pub struct StrategyPlan {
    pub first: ModelTier,
    pub allow_fallback: bool,
    pub score: f64,
    pub confidence: f64,
    pub top_features: Vec<FeatureContribution>,
    pub rationale: String,
}

impl StrategyPlan {
    pub fn planned_strategy(&self) -> RouteStrategy {
        match (self.first, self.allow_fallback) {
            (ModelTier::Big, _) => RouteStrategy::BigModel,
            (ModelTier::Small, true) => RouteStrategy::SmallWithFallback,
            (ModelTier::Small, false) => RouteStrategy::SmallModel,
        }
    }
}

/// Strategy selection after a cache miss.
///
/// `history_key` groups similar requests (the template signature) for the
/// small-model failure-rate feature.
#[async_trait]
pub trait Router: Send + Sync {
    async fn select(&self, req: &GenerationRequest, history_key: &str) -> StrategyPlan;

    /// Feed back whether the small model's output was accepted.
    fn record_small_outcome(&self, history_key: &str, accepted: bool);
}

/// Routes every request to one tier. Used for pinned deployments and tests.
pub struct FixedRouter {
    pub tier: ModelTier,
}

#[async_trait]
impl Router for FixedRouter {
    async fn select(&self, _req: &GenerationRequest, _history_key: &str) -> StrategyPlan {
        StrategyPlan {
            first: self.tier,
            allow_fallback: self.tier == ModelTier::Small,
            score: 0.0,
            confidence: 1.0,
            top_features: Vec::new(),
            rationale: format!("fixed routing to {} model", self.tier),
        }
    }

    fn record_small_outcome(&self, _history_key: &str, _accepted: bool) {}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterWeights {
    pub length: f64,
    pub complexity: f64,
    pub failure_rate: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            length: 0.4,
            complexity: 0.3,
            failure_rate: 0.3,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Scores strictly above this go big-model-first.
    pub threshold: f64,
    pub weights: RouterWeights,
    /// Prompt size (estimated tokens) at which the length feature saturates.
    pub long_prompt_tokens: usize,
    /// Genre/style markers that signal harder prose.
    pub complexity_terms: Vec<String>,
    pub complexity_saturation: usize,
    /// Small-model attempts needed before the failure rate counts.
    pub min_history: u32,
    /// Distinct history keys kept; the least recently updated is evicted.
    pub max_history_keys: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            weights: RouterWeights::default(),
            long_prompt_tokens: 1500,
            complexity_terms: [
                "unreliable narrator",
                "stream of consciousness",
                "multiple pov",
                "nonlinear",
                "flashback",
                "foreshadow",
                "subtext",
                "dialect",
                "epistolary",
                "verse",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            complexity_saturation: 3,
            min_history: 5,
            max_history_keys: 10_000,
        }
    }
}

impl RouterConfig {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)?;
        let cfg: RouterConfig = serde_yaml::from_str(&text)?;
        Ok(cfg)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmallModelRecord {
    pub attempts: u32,
    pub failures: u32,
}

#[derive(Debug, Default)]
struct History {
    records: HashMap<String, (SmallModelRecord, u64)>,
    clock: u64,
}

impl History {
    fn record(&mut self, key: &str, accepted: bool, cap: usize) {
        self.clock += 1;
        if !self.records.contains_key(key) && self.records.len() >= cap.max(1) {
            let oldest = self
                .records
                .iter()
                .min_by_key(|(_, (_, touched))| *touched)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.records.remove(&oldest);
            }
        }
        let (rec, touched) = self.records.entry(key.to_string()).or_default();
        *touched = self.clock;
        rec.attempts += 1;
        if !accepted {
            rec.failures += 1;
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Cost/quality aware router: weighted feature score against a threshold.
pub struct ScoringRouter {
    cfg: RouterConfig,
    history: Mutex<History>,
}

impl ScoringRouter {
    pub fn new(cfg: RouterConfig) -> Self {
        Self {
            cfg,
            history: Mutex::new(History::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(RouterConfig::from_path(path)?))
    }

    pub fn history(&self, key: &str) -> SmallModelRecord {
        self.history
            .lock()
            .ok()
            .and_then(|h| h.records.get(key).map(|(rec, _)| *rec))
            .unwrap_or_default()
    }

    pub fn tracked_keys(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn failure_rate(&self, key: &str) -> f64 {
        let rec = self.history(key);
        if rec.attempts < self.cfg.min_history || rec.attempts == 0 {
            return 0.0;
        }
        f64::from(rec.failures) / f64::from(rec.attempts)
    }

    fn complexity(&self, prompt: &str) -> f64 {
        let lower = prompt.to_lowercase();
        let matched = self
            .cfg
            .complexity_terms
            .iter()
            .filter(|t| lower.contains(t.as_str()))
            .count();
        let sat = self.cfg.complexity_saturation.max(1);
        (matched as f64 / sat as f64).min(1.0)
    }

    /// Score the request and return the contributions, highest first.
    pub fn score(&self, req: &GenerationRequest, history_key: &str) -> (f64, Vec<FeatureContribution>) {
        let w = &self.cfg.weights;
        let length = (req.est_tokens() as f64 / self.cfg.long_prompt_tokens.max(1) as f64).min(1.0);
        let complexity = self.complexity(&req.rendered_prompt);
        let failure = self.failure_rate(history_key);

        let mut features = vec![
            FeatureContribution {
                name: "content_length".into(),
                value: length,
                contribution: w.length * length,
            },
            FeatureContribution {
                name: "style_complexity".into(),
                value: complexity,
                contribution: w.complexity * complexity,
            },
            FeatureContribution {
                name: "small_model_failure_rate".into(),
                value: failure,
                contribution: w.failure_rate * failure,
            },
        ];
        let score = features.iter().map(|f| f.contribution).sum();
        features.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));
        (score, features)
    }

    fn confidence(&self, score: f64) -> f64 {
        let margin = (score - self.cfg.threshold).abs();
        let span = self.cfg.threshold.max(1.0 - self.cfg.threshold).max(f64::EPSILON);
        (0.5 + 0.5 * (margin / span)).min(1.0)
    }
}

#[async_trait]
impl Router for ScoringRouter {
    async fn select(&self, req: &GenerationRequest, history_key: &str) -> StrategyPlan {
        let (score, top_features) = self.score(req, history_key);
        let confidence = self.confidence(score);

        let (first, allow_fallback, rationale) = match req.hints {
            Some(ModelPreference::PreferBig) => (
                ModelTier::Big,
                false,
                "caller prefers the big model".to_string(),
            ),
            Some(ModelPreference::PreferSmall) => (
                ModelTier::Small,
                true,
                "caller prefers the small model; big model kept as fallback".to_string(),
            ),
            Some(ModelPreference::SmallOnly) => (
                ModelTier::Small,
                false,
                "caller restricted generation to the small model".to_string(),
            ),
            Some(ModelPreference::Auto) | None => {
                // Ties go to the cheaper tier.
                if score > self.cfg.threshold {
                    (
                        ModelTier::Big,
                        false,
                        format!(
                            "score {score:.3} above threshold {:.3}; led by {}",
                            self.cfg.threshold, top_features[0].name
                        ),
                    )
                } else {
                    (
                        ModelTier::Small,
                        true,
                        format!(
                            "score {score:.3} within threshold {:.3}; small model first",
                            self.cfg.threshold
                        ),
                    )
                }
            }
        };

        tracing::debug!(score, confidence, tier = %first, "strategy selected");
        StrategyPlan {
            first,
            allow_fallback,
            score,
            confidence,
            top_features: top_features.into_iter().take(3).collect(),
            rationale,
        }
    }

    fn record_small_outcome(&self, history_key: &str, accepted: bool) {
        match self.history.lock() {
            Ok(mut h) => h.record(history_key, accepted, self.cfg.max_history_keys),
            Err(_) => tracing::warn!(history_key, "router history lock poisoned; outcome dropped"),
        }
    }
}

/// Decision recorded for a request served from cache.
pub fn cache_decision(tier: CacheTier, similarity: f32, transitions: Vec<RouteState>) -> RouteDecision {
    RouteDecision {
        strategy: RouteStrategy::Cache,
        rationale: format!("served from {tier} cache (similarity {similarity:.3})"),
        score: 0.0,
        confidence: f64::from(similarity),
        top_features: Vec::new(),
        transitions,
    }
}
