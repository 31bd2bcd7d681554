use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use quill_cache::{CacheConfig, CacheMetadata, CacheStore, InMemoryCacheStore, TierKey};
use quill_fingerprint::{embed, semantic_digest, Fingerprints, SemanticSignature};
use quill_types::{CacheTier, ModelTier};

fn meta(model: &str) -> CacheMetadata {
    CacheMetadata {
        model_id: model.into(),
        model_tier: ModelTier::Big,
        tokens_used: 300,
        cost: 0.03,
        quality: Some(0.9),
    }
}

#[tokio::test]
async fn lookup_prefers_exact_over_semantic_and_template() {
    let store = InMemoryCacheStore::new(CacheConfig::default());
    let now = Utc::now();
    let vector = embed("the lighthouse keeper's last night", 64);
    let semantic = SemanticSignature {
        digest: semantic_digest(&vector),
        vector: vector.clone(),
    };

    store
        .store(
            TierKey::Template {
                signature: "tmpl".into(),
            },
            "template result".into(),
            meta("m"),
            now,
        )
        .await
        .unwrap();
    store
        .store(
            TierKey::Semantic {
                digest: semantic.digest.clone(),
                vector,
            },
            "semantic result".into(),
            meta("m"),
            now,
        )
        .await
        .unwrap();
    store
        .store(
            TierKey::Exact { hash: "exact".into() },
            "exact result".into(),
            meta("m"),
            now,
        )
        .await
        .unwrap();

    let fps = Fingerprints {
        exact: "exact".into(),
        semantic: Some(semantic.clone()),
        template: Some("tmpl".into()),
    };
    let hit = store.lookup(&fps, now).await.unwrap().unwrap();
    assert_eq!(hit.tier(), CacheTier::Exact);
    assert_eq!(hit.entry.payload, "exact result");

    let no_exact = Fingerprints {
        exact: "missing".into(),
        ..fps
    };
    let hit = store.lookup(&no_exact, now).await.unwrap().unwrap();
    assert_eq!(hit.tier(), CacheTier::Semantic);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_touches_are_not_lost() {
    let store = Arc::new(InMemoryCacheStore::new(CacheConfig::default()));
    store
        .store(
            TierKey::Exact { hash: "h".into() },
            "payload".into(),
            meta("m"),
            Utc::now(),
        )
        .await
        .unwrap();

    let tasks = (0..16).map(|_| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            for _ in 0..250 {
                store.touch(CacheTier::Exact, "h").await.unwrap();
            }
        })
    });
    for res in join_all(tasks).await {
        res.unwrap();
    }

    let fps = Fingerprints {
        exact: "h".into(),
        semantic: None,
        template: None,
    };
    let hit = store.lookup(&fps, Utc::now()).await.unwrap().unwrap();
    assert_eq!(hit.entry.hit_count, 4000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_last_one_wins_with_intact_entry() {
    let store = Arc::new(InMemoryCacheStore::new(CacheConfig::default()));
    let tasks = (0..8).map(|i| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            store
                .store(
                    TierKey::Exact { hash: "same".into() },
                    format!("result {i}"),
                    meta(&format!("model-{i}")),
                    Utc::now(),
                )
                .await
                .unwrap();
        })
    });
    for res in join_all(tasks).await {
        res.unwrap();
    }

    let fps = Fingerprints {
        exact: "same".into(),
        semantic: None,
        template: None,
    };
    let hit = store.lookup(&fps, Utc::now()).await.unwrap().unwrap();
    // Payload and metadata always come from the same writer.
    let n = hit.entry.payload.trim_start_matches("result ");
    assert_eq!(hit.entry.metadata.model_id, format!("model-{n}"));
    assert_eq!(store.len(), 1);
}
