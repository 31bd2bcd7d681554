use serde::{Deserialize, Serialize};

pub const GENERATION_LOGS: &str = "generation-logs";
pub const COST_MONITORING: &str = "cost-monitoring";
pub const QUALITY_EVALUATION: &str = "quality-evaluation";
pub const ENHANCED_CACHE: &str = "enhanced-cache";
pub const AUTO_REPAIR: &str = "auto-repair";

pub const STABLE_FEATURES: &[&str] = &[GENERATION_LOGS, COST_MONITORING, QUALITY_EVALUATION];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub name: String,
    pub default_enabled: bool,
    pub description: String,
    #[serde(default)]
    pub min_schema_version: Option<u32>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl FeatureFlag {
    pub fn new(name: &str, default_enabled: bool, description: &str) -> Self {
        Self {
            name: name.to_string(),
            default_enabled,
            description: description.to_string(),
            min_schema_version: None,
            dependencies: Vec::new(),
        }
    }

    pub fn requires_schema(mut self, version: u32) -> Self {
        self.min_schema_version = Some(version);
        self
    }

    pub fn depends_on(mut self, dep: &str) -> Self {
        self.dependencies.push(dep.to_string());
        self
    }
}

pub fn builtin_flags() -> Vec<FeatureFlag> {
    vec![
        FeatureFlag::new(GENERATION_LOGS, true, "Read access to the generation audit log")
            .requires_schema(1),
        FeatureFlag::new(COST_MONITORING, true, "Token and cost aggregation per project")
            .requires_schema(1)
            .depends_on(GENERATION_LOGS),
        FeatureFlag::new(QUALITY_EVALUATION, true, "Score and rule-check model output")
            .requires_schema(2)
            .depends_on(GENERATION_LOGS),
        FeatureFlag::new(ENHANCED_CACHE, false, "Semantic and template cache tiers")
            .requires_schema(2)
            .depends_on(GENERATION_LOGS),
        FeatureFlag::new(AUTO_REPAIR, false, "Repair rule violations before returning output")
            .requires_schema(3)
            .depends_on(QUALITY_EVALUATION),
    ]
}
