use std::sync::Arc;
use std::time::Duration;

use quill_features::*;
use quill_schema::{SchemaCompatibilityChecker, StaticInventory};

fn schema(inv: StaticInventory) -> Arc<SchemaCompatibilityChecker> {
    Arc::new(SchemaCompatibilityChecker::new(Arc::new(inv), Duration::ZERO))
}

fn overrides() -> Arc<InMemoryOverrides> {
    Arc::new(InMemoryOverrides::new())
}

#[test]
fn cyclic_flag_set_is_rejected() {
    let flags = vec![
        FeatureFlag::new("a", true, "").depends_on("b"),
        FeatureFlag::new("b", true, "").depends_on("c"),
        FeatureFlag::new("c", true, "").depends_on("a"),
    ];
    let err = FeatureGate::new(flags, overrides(), schema(StaticInventory::declared(3)))
        .err()
        .unwrap();
    assert_eq!(
        err,
        FeatureError::Cycle(vec!["a".into(), "b".into(), "c".into(), "a".into()])
    );
}

#[test]
fn self_dependency_is_a_cycle() {
    let flags = vec![FeatureFlag::new("loop", true, "").depends_on("loop")];
    let res = FeatureGate::new(flags, overrides(), schema(StaticInventory::declared(3)));
    assert!(matches!(res, Err(FeatureError::Cycle(_))));
}

#[test]
fn unknown_dependency_is_rejected() {
    let flags = vec![FeatureFlag::new("a", true, "").depends_on("ghost")];
    let res = FeatureGate::new(flags, overrides(), schema(StaticInventory::declared(3)));
    assert_eq!(
        res.err(),
        Some(FeatureError::UnknownDependency {
            flag: "a".into(),
            dependency: "ghost".into()
        })
    );
}

#[test]
fn missing_quality_column_blocks_auto_repair_despite_overrides() {
    let inv = StaticInventory::declared(3).without_column("generation_logs", "quality_score");
    let gate = FeatureGate::builtin(overrides(), schema(inv)).unwrap();
    gate.enable(QUALITY_EVALUATION).unwrap();
    gate.enable(AUTO_REPAIR).unwrap();

    assert!(!gate.is_enabled(QUALITY_EVALUATION));
    assert!(!gate.is_enabled(AUTO_REPAIR));
    assert!(gate.is_enabled(GENERATION_LOGS));
}

#[test]
fn overrides_are_isolated_per_gate() {
    let a = FeatureGate::builtin(overrides(), schema(StaticInventory::declared(3))).unwrap();
    let b = FeatureGate::builtin(overrides(), schema(StaticInventory::declared(3))).unwrap();
    a.enable(ENHANCED_CACHE).unwrap();
    assert!(a.is_enabled(ENHANCED_CACHE));
    assert!(!b.is_enabled(ENHANCED_CACHE));
}

#[test]
fn stable_set_and_listing() {
    let gate = FeatureGate::builtin(overrides(), schema(StaticInventory::declared(3))).unwrap();
    gate.rollback_to_legacy().unwrap();
    gate.enable_stable_features().unwrap();
    let states = gate.list();
    let enabled: Vec<_> = states
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.flag.name.as_str())
        .collect();
    assert_eq!(enabled, vec![COST_MONITORING, GENERATION_LOGS, QUALITY_EVALUATION]);

    let cost = states
        .iter()
        .find(|s| s.flag.name == COST_MONITORING)
        .unwrap();
    let json = serde_json::to_value(cost).unwrap();
    assert_eq!(json["resolution"]["reason"], "override-enabled");
    assert_eq!(json["override_value"], true);
}
