use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quill_fingerprint::Fingerprints;
use quill_types::{CacheTier, ModelTier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod memory;
pub use memory::InMemoryCacheStore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry not found: {tier}/{key}")]
    NotFound { tier: CacheTier, key: String },
    #[error("cache backend error: {0}")]
    Backend(String),
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Minimum cosine similarity for a semantic hit.
    pub semantic_threshold: f32,
    pub embed_dim: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 3600,
            semantic_threshold: 0.92,
            embed_dim: 256,
        }
    }
}

/// Tier-tagged cache key. Semantic keys keep their vector for similarity scans.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "lowercase")]
pub enum TierKey {
    Exact { hash: String },
    Semantic { digest: String, vector: Vec<f32> },
    Template { signature: String },
}

impl TierKey {
    pub fn tier(&self) -> CacheTier {
        match self {
            TierKey::Exact { .. } => CacheTier::Exact,
            TierKey::Semantic { .. } => CacheTier::Semantic,
            TierKey::Template { .. } => CacheTier::Template,
        }
    }

    /// Index key within the tier.
    pub fn id(&self) -> &str {
        match self {
            TierKey::Exact { hash } => hash,
            TierKey::Semantic { digest, .. } => digest,
            TierKey::Template { signature } => signature,
        }
    }

    /// Every key the fingerprint set supports, in lookup precedence order.
    pub fn all_from(fps: &Fingerprints) -> Vec<TierKey> {
        let mut keys = vec![TierKey::Exact {
            hash: fps.exact.clone(),
        }];
        if let Some(sem) = &fps.semantic {
            keys.push(TierKey::Semantic {
                digest: sem.digest.clone(),
                vector: sem.vector.clone(),
            });
        }
        if let Some(sig) = &fps.template {
            keys.push(TierKey::Template {
                signature: sig.clone(),
            });
        }
        keys
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub model_id: String,
    pub model_tier: ModelTier,
    pub tokens_used: u32,
    pub cost: f64,
    pub quality: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: TierKey,
    pub payload: String,
    pub metadata: CacheMetadata,
    pub hit_count: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn tier(&self) -> CacheTier {
        self.key.tier()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Integrity checksum over the payload and provenance.
    pub fn checksum(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.key.id().as_bytes());
        h.update([0u8]);
        h.update(self.payload.as_bytes());
        h.update([0u8]);
        h.update(self.metadata.model_id.as_bytes());
        hex::encode(h.finalize())
    }
}

/// Entry plus checksum, the unit of export/import.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub entry: CacheEntry,
    pub checksum: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
    pub entry: CacheEntry,
    /// 1.0 for exact and template hits.
    pub similarity: f32,
}

impl CacheHit {
    pub fn tier(&self) -> CacheTier {
        self.entry.tier()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub exact_entries: usize,
    pub semantic_entries: usize,
    pub template_entries: usize,
    pub total_hits: u64,
    pub lookups_hit: u64,
    pub lookups_missed: u64,
}

/// Three-tier result cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Try exact, then semantic, then template. Expired or corrupted entries are
    /// removed and treated as misses.
    async fn lookup(
        &self,
        fps: &Fingerprints,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheHit>, CacheError>;

    /// Create or refresh an entry with a fresh expiry. The entry becomes visible
    /// only once fully built.
    async fn store(
        &self,
        key: TierKey,
        payload: String,
        metadata: CacheMetadata,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError>;

    /// Atomically increment the hit counter and return the new count.
    async fn touch(&self, tier: CacheTier, key: &str) -> Result<u64, CacheError>;

    /// Remove entries whose expiry is at or before `cutoff`.
    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, CacheError>;

    /// Remove entries created more than `days_old` days before `now`.
    async fn cleanup(&self, days_old: u32, now: DateTime<Utc>) -> Result<usize, CacheError>;

    async fn purge_all(&self) -> Result<usize, CacheError>;

    async fn stats(&self) -> Result<CacheStats, CacheError>;
}
