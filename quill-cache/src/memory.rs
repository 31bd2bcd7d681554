use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quill_fingerprint::{cosine_similarity, Fingerprints};
use quill_types::CacheTier;

use crate::{
    CacheConfig, CacheEntry, CacheError, CacheHit, CacheMetadata, CacheStats, CacheStore,
    StoredEntry, TierKey,
};

type SlotKey = (CacheTier, String);

/// An immutable entry plus its live hit counter.
///
/// Writers replace the whole `Arc<Slot>`, so readers never observe a
/// half-written entry.
struct Slot {
    entry: CacheEntry,
    checksum: String,
    hits: AtomicU64,
}

impl Slot {
    fn new(entry: CacheEntry, checksum: String, hits: u64) -> Self {
        Self {
            entry,
            checksum,
            hits: AtomicU64::new(hits),
        }
    }

    fn snapshot(&self) -> CacheEntry {
        let mut entry = self.entry.clone();
        entry.hit_count = self.hits.load(Ordering::SeqCst);
        entry
    }

    fn is_intact(&self) -> bool {
        self.entry.checksum() == self.checksum
    }
}

/// In-process cache store backed by a sharded concurrent map.
pub struct InMemoryCacheStore {
    cfg: CacheConfig,
    slots: DashMap<SlotKey, Arc<Slot>>,
    lookups_hit: AtomicU64,
    lookups_missed: AtomicU64,
}

impl InMemoryCacheStore {
    pub fn new(cfg: CacheConfig) -> Self {
        Self {
            cfg,
            slots: DashMap::new(),
            lookups_hit: AtomicU64::new(0),
            lookups_missed: AtomicU64::new(0),
        }
    }

    /// Load a previously exported entry. Integrity is checked lazily on lookup.
    pub fn import(&self, stored: StoredEntry) {
        let key = (stored.entry.tier(), stored.entry.key.id().to_string());
        let hits = stored.entry.hit_count;
        self.slots
            .insert(key, Arc::new(Slot::new(stored.entry, stored.checksum, hits)));
    }

    pub fn export(&self) -> Vec<StoredEntry> {
        self.slots
            .iter()
            .map(|s| StoredEntry {
                entry: s.value().snapshot(),
                checksum: s.value().checksum.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the slot if it is servable; drops expired or corrupted slots.
    fn servable(&self, key: &SlotKey, now: DateTime<Utc>) -> Option<Arc<Slot>> {
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()))?;
        if !slot.is_intact() {
            tracing::warn!(tier = %key.0, key = %key.1, "dropping corrupted cache entry");
            self.remove_if_same(key, &slot);
            return None;
        }
        if slot.entry.is_expired(now) {
            tracing::debug!(tier = %key.0, key = %key.1, "dropping expired cache entry");
            self.remove_if_same(key, &slot);
            return None;
        }
        Some(slot)
    }

    // A concurrent writer may have refreshed the slot; only remove the one we inspected.
    fn remove_if_same(&self, key: &SlotKey, slot: &Arc<Slot>) {
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    fn lookup_semantic(&self, digest: &str, vector: &[f32], now: DateTime<Utc>) -> Option<CacheHit> {
        let direct = (CacheTier::Semantic, digest.to_string());
        if let Some(slot) = self.servable(&direct, now) {
            return Some(CacheHit {
                entry: slot.snapshot(),
                similarity: 1.0,
            });
        }

        let threshold = self.cfg.semantic_threshold;
        let mut best: Option<(f32, SlotKey)> = None;
        for item in self.slots.iter() {
            let (tier, _) = item.key();
            if *tier != CacheTier::Semantic {
                continue;
            }
            let TierKey::Semantic { vector: stored, .. } = &item.value().entry.key else {
                continue;
            };
            let sim = cosine_similarity(vector, stored);
            if sim > threshold && best.as_ref().map_or(true, |(b, _)| sim > *b) {
                best = Some((sim, item.key().clone()));
            }
        }

        // Validate outside the iteration so removal does not contend with the shard read lock.
        let (similarity, key) = best?;
        self.servable(&key, now).map(|slot| CacheHit {
            entry: slot.snapshot(),
            similarity,
        })
    }

    fn retain(&self, keep: impl Fn(&CacheEntry) -> bool) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| keep(&slot.entry));
        before.saturating_sub(self.slots.len())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn lookup(
        &self,
        fps: &Fingerprints,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheHit>, CacheError> {
        for key in TierKey::all_from(fps) {
            let hit = match &key {
                TierKey::Semantic { digest, vector } => self.lookup_semantic(digest, vector, now),
                other => self
                    .servable(&(other.tier(), other.id().to_string()), now)
                    .map(|slot| CacheHit {
                        entry: slot.snapshot(),
                        similarity: 1.0,
                    }),
            };
            if let Some(hit) = hit {
                self.lookups_hit.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tier = %hit.tier(), similarity = hit.similarity, "cache hit");
                return Ok(Some(hit));
            }
        }
        self.lookups_missed.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn store(
        &self,
        key: TierKey,
        payload: String,
        metadata: CacheMetadata,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        // Out-of-range TTLs saturate to "never expires".
        let expires_at = i64::try_from(self.cfg.ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let entry = CacheEntry {
            key,
            payload,
            metadata,
            hit_count: 0,
            created_at: now,
            expires_at,
        };
        let checksum = entry.checksum();
        let slot_key = (entry.tier(), entry.key.id().to_string());

        // Refreshing keeps the hit history; the shard write lock serializes this
        // against concurrent touches.
        let stored = match self.slots.entry(slot_key) {
            Entry::Occupied(mut o) => {
                let hits = o.get().hits.load(Ordering::SeqCst);
                let slot = Arc::new(Slot::new(entry, checksum, hits));
                let snapshot = slot.snapshot();
                o.insert(slot);
                snapshot
            }
            Entry::Vacant(v) => {
                let slot = Arc::new(Slot::new(entry, checksum, 0));
                let snapshot = slot.snapshot();
                v.insert(slot);
                snapshot
            }
        };
        Ok(stored)
    }

    async fn touch(&self, tier: CacheTier, key: &str) -> Result<u64, CacheError> {
        let slot = self
            .slots
            .get(&(tier, key.to_string()))
            .ok_or_else(|| CacheError::NotFound {
                tier,
                key: key.to_string(),
            })?;
        Ok(slot.hits.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, CacheError> {
        let removed = self.retain(|e| !e.is_expired(cutoff));
        tracing::info!(removed, "swept expired cache entries");
        Ok(removed)
    }

    async fn cleanup(&self, days_old: u32, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let threshold = Duration::try_days(i64::from(days_old))
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.retain(|e| e.created_at >= threshold);
        tracing::info!(removed, days_old, "cleaned up old cache entries");
        Ok(removed)
    }

    async fn purge_all(&self) -> Result<usize, CacheError> {
        let removed = self.slots.len();
        self.slots.clear();
        tracing::info!(removed, "purged cache");
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats {
            lookups_hit: self.lookups_hit.load(Ordering::Relaxed),
            lookups_missed: self.lookups_missed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for item in self.slots.iter() {
            match item.key().0 {
                CacheTier::Exact => stats.exact_entries += 1,
                CacheTier::Semantic => stats.semantic_entries += 1,
                CacheTier::Template => stats.template_entries += 1,
            }
            stats.total_hits += item.value().hits.load(Ordering::SeqCst);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_fingerprint::{embed, semantic_digest, SemanticSignature};
    use quill_types::ModelTier;

    fn meta() -> CacheMetadata {
        CacheMetadata {
            model_id: "small-v1".into(),
            model_tier: ModelTier::Small,
            tokens_used: 120,
            cost: 0.002,
            quality: Some(0.8),
        }
    }

    fn semantic(text: &str) -> SemanticSignature {
        let vector = embed(text, 64);
        SemanticSignature {
            digest: semantic_digest(&vector),
            vector,
        }
    }

    #[tokio::test]
    async fn expired_entry_is_never_served() {
        let store = InMemoryCacheStore::new(CacheConfig {
            ttl_secs: 60,
            ..Default::default()
        });
        let t0 = Utc::now();
        store
            .store(TierKey::Exact { hash: "h".into() }, "text".into(), meta(), t0)
            .await
            .unwrap();
        let fps = Fingerprints {
            exact: "h".into(),
            semantic: None,
            template: None,
        };
        assert!(store.lookup(&fps, t0).await.unwrap().is_some());
        assert!(store
            .lookup(&fps, t0 + Duration::seconds(61))
            .await
            .unwrap()
            .is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn corrupted_entry_is_removed_and_missed() {
        let store = InMemoryCacheStore::new(CacheConfig::default());
        let now = Utc::now();
        store
            .store(TierKey::Exact { hash: "h".into() }, "good".into(), meta(), now)
            .await
            .unwrap();
        let mut exported = store.export();
        assert_eq!(exported.len(), 1);
        let mut bad: StoredEntry = exported.remove(0);
        bad.entry.payload = "tampered".into();
        store.import(bad);

        let fps = Fingerprints {
            exact: "h".into(),
            semantic: None,
            template: None,
        };
        assert!(store.lookup(&fps, now).await.unwrap().is_none());
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn semantic_hit_requires_threshold() {
        let store = InMemoryCacheStore::new(CacheConfig {
            semantic_threshold: 0.9,
            ..Default::default()
        });
        let now = Utc::now();
        let stored = semantic("the storm breaks over the harbour at dusk");
        store
            .store(
                TierKey::Semantic {
                    digest: stored.digest.clone(),
                    vector: stored.vector.clone(),
                },
                "cached prose".into(),
                meta(),
                now,
            )
            .await
            .unwrap();

        let near = Fingerprints {
            exact: "other".into(),
            semantic: Some(semantic("The storm   breaks over the harbour at dusk.")),
            template: None,
        };
        let hit = store.lookup(&near, now).await.unwrap().unwrap();
        assert_eq!(hit.tier(), CacheTier::Semantic);

        let far = Fingerprints {
            exact: "other".into(),
            semantic: Some(semantic("a quiet breakfast in the mountain village")),
            template: None,
        };
        assert!(store.lookup(&far, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn similarity_must_exceed_the_threshold() {
        let stored = vec![1.0_f32, 0.0];
        let probe = vec![0.6_f32, 0.8];
        let sim = cosine_similarity(&probe, &stored);
        let fps = Fingerprints {
            exact: "other".into(),
            semantic: Some(SemanticSignature {
                digest: "query".into(),
                vector: probe.clone(),
            }),
            template: None,
        };
        let now = Utc::now();

        for (threshold, served) in [(sim, false), (sim - 0.01, true)] {
            let store = InMemoryCacheStore::new(CacheConfig {
                semantic_threshold: threshold,
                ..Default::default()
            });
            store
                .store(
                    TierKey::Semantic {
                        digest: "stored".into(),
                        vector: stored.clone(),
                    },
                    "cached prose".into(),
                    meta(),
                    now,
                )
                .await
                .unwrap();
            let hit = store.lookup(&fps, now).await.unwrap();
            assert_eq!(hit.is_some(), served, "threshold {threshold}");
        }
    }

    #[tokio::test]
    async fn huge_ttl_saturates_instead_of_overflowing() {
        let store = InMemoryCacheStore::new(CacheConfig {
            ttl_secs: 20_000_000_000_000,
            ..Default::default()
        });
        let now = Utc::now();
        let entry = store
            .store(TierKey::Exact { hash: "h".into() }, "a".into(), meta(), now)
            .await
            .unwrap();
        assert_eq!(entry.expires_at, DateTime::<Utc>::MAX_UTC);

        let fps = Fingerprints {
            exact: "h".into(),
            semantic: None,
            template: None,
        };
        assert!(store.lookup(&fps, now).await.unwrap().is_some());
        assert_eq!(store.cleanup(u32::MAX, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_keeps_hit_history() {
        let store = InMemoryCacheStore::new(CacheConfig::default());
        let now = Utc::now();
        let key = TierKey::Template {
            signature: "t".into(),
        };
        store.store(key.clone(), "a".into(), meta(), now).await.unwrap();
        store.touch(CacheTier::Template, "t").await.unwrap();
        store.touch(CacheTier::Template, "t").await.unwrap();
        let refreshed = store.store(key, "b".into(), meta(), now).await.unwrap();
        assert_eq!(refreshed.hit_count, 2);
        assert_eq!(refreshed.payload, "b");
    }

    #[tokio::test]
    async fn cleanup_removes_old_entries_only() {
        let store = InMemoryCacheStore::new(CacheConfig::default());
        let now = Utc::now();
        store
            .store(TierKey::Exact { hash: "old".into() }, "a".into(), meta(), now - Duration::days(10))
            .await
            .unwrap();
        store
            .store(TierKey::Exact { hash: "new".into() }, "b".into(), meta(), now)
            .await
            .unwrap();
        assert_eq!(store.cleanup(7, now).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.purge_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn touch_on_missing_entry_errors() {
        let store = InMemoryCacheStore::new(CacheConfig::default());
        let err = store.touch(CacheTier::Exact, "nope").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));
    }
}
