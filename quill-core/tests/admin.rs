mod common;

use common::*;
use quill_audit::LogFilter;
use quill_core::PipelineError;
use quill_features::{COST_MONITORING, GENERATION_LOGS};
use quill_infer::ScriptedModelClient;
use quill_schema::StaticInventory;
use quill_types::{CacheTier, ModelTier};

fn served_twice() -> Harness {
    harness(
        test_config(),
        ModelTier::Small,
        ScriptedModelClient::responding("small-1", &[GOOD]),
        ScriptedModelClient::responding("big-1", &[]),
    )
}

#[tokio::test]
async fn logs_are_filtered_and_paginated() {
    let h = served_twice();
    h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();
    h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();

    let all = h.pipeline.list_logs(&LogFilter::default()).await.unwrap();
    assert_eq!(all.total, 2);

    let cached = h
        .pipeline
        .list_logs(&LogFilter {
            project_id: Some("novel-1".into()),
            cache_tier: Some(CacheTier::Exact),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(cached.total, 1);

    let other = h
        .pipeline
        .list_logs(&LogFilter {
            project_id: Some("someone-else".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(other.total, 0);
}

#[tokio::test]
async fn read_api_is_gated_but_appends_are_not() {
    let h = served_twice();
    h.pipeline.set_feature_override(GENERATION_LOGS, false).unwrap();

    h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();
    assert_eq!(h.log.len(), 1);

    let err = h.pipeline.list_logs(&LogFilter::default()).await.unwrap_err();
    assert!(matches!(err, PipelineError::FeatureDisabled(ref f) if f == GENERATION_LOGS));
    let err = h.pipeline.cost_summary("novel-1").await.unwrap_err();
    assert!(matches!(err, PipelineError::FeatureDisabled(ref f) if f == COST_MONITORING));

    h.pipeline.clear_feature_override(GENERATION_LOGS).unwrap();
    assert_eq!(h.pipeline.list_logs(&LogFilter::default()).await.unwrap().total, 1);
}

#[tokio::test]
async fn cost_summary_splits_model_and_cache_paths() {
    let h = served_twice();
    let first = h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();
    h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();

    let summary = h.pipeline.cost_summary("novel-1").await.unwrap();
    assert_eq!(summary.total.requests, 2);
    assert_eq!(summary.total.tokens, u64::from(first.tokens_used));
    assert_eq!(summary.by_tier["small"].requests, 1);
    assert_eq!(summary.by_cache_path["exact"].requests, 1);
    assert!((summary.total.cost - first.cost).abs() < 1e-12);
}

#[tokio::test]
async fn corrections_reference_the_original() {
    let h = served_twice();
    let out = h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();
    let fix = h
        .pipeline
        .append_correction(out.execution_id, "disputed by author")
        .await
        .unwrap();
    assert_eq!(fix.corrects, Some(out.execution_id));
    assert_ne!(fix.execution_id, out.execution_id);

    let original = h.pipeline.get_log(out.execution_id).await.unwrap().unwrap();
    assert!(original.corrects.is_none());
    assert!(original.warnings.is_empty());
}

#[tokio::test]
async fn cache_maintenance() {
    let h = served_twice();
    h.pipeline.submit(request("Write the lighthouse scene.")).await.unwrap();
    assert_eq!(h.pipeline.cleanup_cache(1).await.unwrap(), 0);
    assert_eq!(h.pipeline.sweep_expired().await.unwrap(), 0);
    assert_eq!(h.pipeline.purge_cache().await.unwrap(), 1);
    assert_eq!(h.pipeline.cache_stats().await.unwrap().exact_entries, 0);
}

#[tokio::test]
async fn rollback_and_stable_set() {
    let h = served_twice();
    h.pipeline.rollback_to_legacy().unwrap();
    assert!(h.pipeline.feature_states().iter().all(|s| !s.enabled));
    h.pipeline.enable_stable_features().unwrap();
    let enabled = h
        .pipeline
        .feature_states()
        .into_iter()
        .filter(|s| s.enabled)
        .count();
    assert_eq!(enabled, 3);
    assert!(h.pipeline.set_feature_override("nope", true).is_err());
}

#[tokio::test]
async fn schema_report_from_inventory_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.yaml");
    let inv = StaticInventory::declared(2);
    std::fs::write(&path, serde_yaml::to_string(&inv).unwrap()).unwrap();

    let mut cfg = test_config();
    cfg.schema.inventory_path = Some(path);
    let h = harness(
        cfg,
        ModelTier::Small,
        ScriptedModelClient::responding("small-1", &[]),
        ScriptedModelClient::responding("big-1", &[]),
    );
    let report = h.pipeline.schema_report().unwrap();
    assert!(report.upgrade_required);
    assert_eq!(report.current_version, 2);
    assert_eq!(report.missing_columns.len(), 1);
    assert_eq!(report.missing_columns[0].column, "repair_actions");
}

