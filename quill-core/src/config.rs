use std::path::{Path, PathBuf};
use std::time::Duration;

use quill_cache::CacheConfig;
use quill_quality::QualityConfig;
use quill_repair::RepairConfig;
use quill_router::RouterConfig;
use quill_types::ModelTier;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Extra big-model attempts after the first, for transient errors and
    /// quality rejections.
    pub max_retries: u32,
    pub model_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    /// Linear backoff between big-model retries.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            model_timeout_ms: 30_000,
            embed_timeout_ms: 2_000,
            backoff_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_millis(self.model_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(retry)))
    }
}

/// Cost per thousand tokens, by tier.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PricingConfig {
    pub small_per_1k: f64,
    pub big_per_1k: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            small_per_1k: 0.0005,
            big_per_1k: 0.01,
        }
    }
}

impl PricingConfig {
    pub fn cost(&self, tier: ModelTier, tokens: u32) -> f64 {
        let rate = match tier {
            ModelTier::Small => self.small_per_1k,
            ModelTier::Big => self.big_per_1k,
        };
        f64::from(tokens) / 1000.0 * rate
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub report_ttl_ms: u64,
    /// YAML description of the store's tables. Absent means a fully migrated store.
    pub inventory_path: Option<PathBuf>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            report_ttl_ms: 30_000,
            inventory_path: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QuillConfig {
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub quality: QualityConfig,
    pub repair: RepairConfig,
    pub retry: RetryConfig,
    pub pricing: PricingConfig,
    pub schema: SchemaConfig,
}

impl QuillConfig {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Config from `QUILL_CONFIG` if set, defaults otherwise.
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("QUILL_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_) => Ok(Self::default()),
        }
    }
}
