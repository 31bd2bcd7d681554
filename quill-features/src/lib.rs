//! Feature gate: declared defaults, an override layer, dependency chains and
//! storage readiness, resolved per call.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use quill_schema::SchemaCompatibilityChecker;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod flags;
pub use flags::*;

pub mod overrides;
pub use overrides::{InMemoryOverrides, OverrideStore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureError {
    #[error("unknown feature flag: {0}")]
    UnknownFlag(String),
    #[error("flag {0} declared twice")]
    DuplicateFlag(String),
    #[error("flag {flag} depends on unknown flag {dependency}")]
    UnknownDependency { flag: String, dependency: String },
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("override store: {0}")]
    OverrideStore(String),
}

/// Why a flag resolved the way it did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum Resolution {
    SchemaUnavailable { required: u32, current: Option<u32> },
    OverrideDisabled,
    OverrideEnabled,
    DependencyDisabled { dependency: String },
    DefaultDisabled,
    Default,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagState {
    pub flag: FeatureFlag,
    pub override_value: Option<bool>,
    pub enabled: bool,
    pub resolution: Resolution,
}

pub struct FeatureGate {
    flags: BTreeMap<String, FeatureFlag>,
    overrides: Arc<dyn OverrideStore>,
    schema: Arc<SchemaCompatibilityChecker>,
}

impl FeatureGate {
    /// Register `flags`. Duplicate names, unknown dependencies and cycles are
    /// rejected here so resolution never recurses unboundedly.
    pub fn new(
        flags: Vec<FeatureFlag>,
        overrides: Arc<dyn OverrideStore>,
        schema: Arc<SchemaCompatibilityChecker>,
    ) -> Result<Self, FeatureError> {
        let mut map = BTreeMap::new();
        for flag in flags {
            if map.contains_key(&flag.name) {
                return Err(FeatureError::DuplicateFlag(flag.name));
            }
            map.insert(flag.name.clone(), flag);
        }
        for flag in map.values() {
            for dep in &flag.dependencies {
                if !map.contains_key(dep) {
                    return Err(FeatureError::UnknownDependency {
                        flag: flag.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        check_acyclic(&map)?;
        Ok(Self {
            flags: map,
            overrides,
            schema,
        })
    }

    pub fn builtin(
        overrides: Arc<dyn OverrideStore>,
        schema: Arc<SchemaCompatibilityChecker>,
    ) -> Result<Self, FeatureError> {
        Self::new(builtin_flags(), overrides, schema)
    }

    /// Unknown flags resolve to disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        match self.resolve(name) {
            Ok((enabled, _)) => enabled,
            Err(_) => {
                tracing::warn!(flag = name, "queried unknown feature flag");
                false
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Result<(bool, Resolution), FeatureError> {
        let flag = self.flag(name)?;

        if let Some(required) = flag.min_schema_version {
            let current = self.schema.current_version().ok();
            let ready = current.is_some_and(|v| v >= required)
                && self.schema.is_feature_available(name);
            if !ready {
                return Ok((false, Resolution::SchemaUnavailable { required, current }));
            }
        }

        match self.overrides.get(name) {
            Some(false) => return Ok((false, Resolution::OverrideDisabled)),
            Some(true) => {}
            None if !flag.default_enabled => return Ok((false, Resolution::DefaultDisabled)),
            None => {}
        }

        for dep in &flag.dependencies {
            if !self.resolve(dep)?.0 {
                return Ok((
                    false,
                    Resolution::DependencyDisabled {
                        dependency: dep.clone(),
                    },
                ));
            }
        }

        let resolution = if self.overrides.get(name).is_some() {
            Resolution::OverrideEnabled
        } else {
            Resolution::Default
        };
        Ok((true, resolution))
    }

    pub fn enable(&self, name: &str) -> Result<(), FeatureError> {
        self.flag(name)?;
        self.overrides.set(name, true)?;
        tracing::info!(flag = name, "feature override set: enabled");
        Ok(())
    }

    pub fn disable(&self, name: &str) -> Result<(), FeatureError> {
        self.flag(name)?;
        self.overrides.set(name, false)?;
        tracing::info!(flag = name, "feature override set: disabled");
        Ok(())
    }

    pub fn clear_override(&self, name: &str) -> Result<(), FeatureError> {
        self.flag(name)?;
        self.overrides.clear(name)?;
        tracing::info!(flag = name, "feature override cleared");
        Ok(())
    }

    pub fn enable_stable_features(&self) -> Result<(), FeatureError> {
        for name in STABLE_FEATURES {
            if self.flags.contains_key(*name) {
                self.overrides.set(name, true)?;
            }
        }
        tracing::info!(flags = ?STABLE_FEATURES, "stable features enabled");
        Ok(())
    }

    /// Operational lever: force every flag off.
    pub fn rollback_to_legacy(&self) -> Result<(), FeatureError> {
        for name in self.flags.keys() {
            self.overrides.set(name, false)?;
        }
        tracing::warn!("rolled back to legacy: all features disabled");
        Ok(())
    }

    pub fn list(&self) -> Vec<FlagState> {
        self.flags
            .values()
            .map(|flag| {
                let (enabled, resolution) = self
                    .resolve(&flag.name)
                    .unwrap_or((false, Resolution::DefaultDisabled));
                FlagState {
                    flag: flag.clone(),
                    override_value: self.overrides.get(&flag.name),
                    enabled,
                    resolution,
                }
            })
            .collect()
    }

    pub fn flag(&self, name: &str) -> Result<&FeatureFlag, FeatureError> {
        self.flags
            .get(name)
            .ok_or_else(|| FeatureError::UnknownFlag(name.to_string()))
    }
}

fn check_acyclic(flags: &BTreeMap<String, FeatureFlag>) -> Result<(), FeatureError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        flags: &'a BTreeMap<String, FeatureFlag>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), FeatureError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Err(FeatureError::Cycle(cycle));
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(flag) = flags.get(name) {
            for dep in &flag.dependencies {
                visit(dep, flags, marks, path)?;
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    for name in flags.keys() {
        visit(name, flags, &mut marks, &mut path)?;
    }
    Ok(())
}
