use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation key for one logical generation request.
pub type ExecutionId = Uuid;

/// Model class the router can dispatch to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelTier {
    Small,
    Big,
}

impl ModelTier {
    pub const fn as_str(self) -> &'static str {
        match self {
            ModelTier::Small => "small",
            ModelTier::Big => "big",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling parameters forwarded to the model. They are part of the exact fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Where in the manuscript the request originates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestContext {
    pub project_id: String,
    #[serde(default)]
    pub chapter_id: Option<String>,
    #[serde(default)]
    pub scene_id: Option<String>,
}

/// Caller hint that biases strategy selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelPreference {
    Auto,
    PreferSmall,
    PreferBig,
    /// Small model only, never escalate.
    SmallOnly,
}

/// A generation request as submitted by the writing surfaces.
///
/// Treated as immutable once it enters the pipeline; the pipeline only ever
/// borrows it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub template_id: String,
    pub template_version: u32,
    pub rendered_prompt: String,
    /// Template variable fill-ins. Only the names feed the template signature.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    pub model_class: String,
    #[serde(default)]
    pub params: GenerationParams,
    pub context: RequestContext,
    #[serde(default)]
    pub hints: Option<ModelPreference>,
    /// Entities (characters, places) the output is expected to mention.
    #[serde(default)]
    pub required_entities: Vec<String>,
}

impl GenerationRequest {
    /// Rough token estimate used for routing and cost previews.
    pub fn est_tokens(&self) -> usize {
        self.rendered_prompt.split_whitespace().count().max(1)
    }
}

/// Cache tiers in lookup precedence order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Exact,
    Semantic,
    Template,
}

impl CacheTier {
    pub const PRECEDENCE: [CacheTier; 3] = [CacheTier::Exact, CacheTier::Semantic, CacheTier::Template];

    pub const fn as_str(self) -> &'static str {
        match self {
            CacheTier::Exact => "exact",
            CacheTier::Semantic => "semantic",
            CacheTier::Template => "template",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStrategy {
    Cache,
    SmallModel,
    SmallWithFallback,
    BigModel,
}

impl RouteStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            RouteStrategy::Cache => "cache",
            RouteStrategy::SmallModel => "small-model",
            RouteStrategy::SmallWithFallback => "small-with-fallback",
            RouteStrategy::BigModel => "big-model",
        }
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// States of the per-request routing state machine, recorded in order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteState {
    Start,
    CacheCheck,
    Hit,
    Miss,
    StrategySelect,
    SmallModel,
    FallbackBigModel,
    BigModel,
    QualityCheck,
    Repair,
    Retry,
    Done,
    Failed,
}

/// One weighted input to the routing score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub name: String,
    pub value: f64,
    pub contribution: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub strategy: RouteStrategy,
    pub rationale: String,
    pub score: f64,
    pub confidence: f64,
    pub top_features: Vec<FeatureContribution>,
    pub transitions: Vec<RouteState>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub overall: f64,
    pub completeness: f64,
    pub consistency: f64,
    pub coherence: f64,
    pub fluency: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    /// Offending text, when the rule can point at it.
    #[serde(default)]
    pub span: Option<String>,
}

impl RuleViolation {
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairMethod {
    Deterministic,
    ModelAssisted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    pub violation: String,
    pub original: String,
    pub replacement: String,
    pub method: RepairMethod,
    pub confidence: f64,
}

/// Failure classification shared by model calls, the pipeline and the audit log.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Api,
    Parse,
    Validation,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are eligible for the bounded retry policy.
    pub const fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::Timeout)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Api => "api",
            ErrorKind::Parse => "parse",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra detail kept for parse/validation failures so repair rules can be written offline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    #[serde(default)]
    pub raw_snippet: Option<String>,
    #[serde(default)]
    pub parse_error: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

const SNIPPET_CHARS: usize = 240;

/// Clip raw model output for diagnostics.
pub fn snippet(raw: &str) -> String {
    raw.chars().take(SNIPPET_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_serializes_kebab_case() {
        let s = serde_json::to_string(&RouteStrategy::SmallWithFallback).unwrap();
        assert_eq!(s, "\"small-with-fallback\"");
        assert_eq!(RouteStrategy::SmallWithFallback.as_str(), "small-with-fallback");
    }

    #[test]
    fn only_network_and_timeout_are_transient() {
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::Timeout.is_transient());
        assert!(!ErrorKind::Api.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
    }

    #[test]
    fn snippet_is_bounded() {
        let raw = "x".repeat(1000);
        assert_eq!(snippet(&raw).len(), 240);
    }
}
