//! Append-only audit trail of generation executions.
//!
//! One entry per logical request, written once at its terminal outcome. Entries
//! are hash-chained so any in-place edit is detectable; corrections are new
//! entries that reference the execution they correct.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quill_types::{
    CacheTier, Diagnostics, ErrorKind, ExecutionId, GenerationParams, ModelTier, QualityScore,
    RepairAction, RouteDecision, RuleViolation,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod jsonl;
pub use jsonl::{verify_log, JsonlGenerationLog};

pub mod memory;
pub use memory::InMemoryGenerationLog;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("execution {0} already recorded")]
    Duplicate(ExecutionId),
    #[error("hash chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationLogEntry {
    pub execution_id: ExecutionId,
    pub project_id: String,
    pub chapter_id: Option<String>,
    pub scene_id: Option<String>,
    pub template_id: String,
    pub template_version: u32,
    /// Digest of the rendered prompt; raw prompt text is never logged.
    pub prompt_hash: String,
    pub model_id: Option<String>,
    pub model_version: Option<String>,
    pub model_tier: Option<ModelTier>,
    pub parameters: GenerationParams,
    pub route_decision: RouteDecision,
    pub cache_tier: Option<CacheTier>,
    pub cache_hit_count: Option<u64>,
    pub response_hash: Option<String>,
    pub response_summary: Option<String>,
    pub tokens_used: u32,
    pub cost: f64,
    pub quality_score: Option<QualityScore>,
    pub rule_violations: Vec<RuleViolation>,
    pub repair_actions: Vec<RepairAction>,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub outcome: Outcome,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub diagnostics: Option<Diagnostics>,
    /// Non-fatal degradations, e.g. an unavailable embedding provider.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Set on correction entries.
    #[serde(default)]
    pub corrects: Option<ExecutionId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub prev_hash: Option<String>,
    #[serde(default)]
    pub chain_hash: String,
}

impl GenerationLogEntry {
    /// Chain hash over the entry with its own hash blanked.
    pub fn compute_chain_hash(&self) -> Result<String, LogError> {
        let mut unsealed = self.clone();
        unsealed.chain_hash = String::new();
        let body = serde_json::to_vec(&unsealed).map_err(|e| LogError::Parse(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&body)))
    }

    pub(crate) fn seal(&mut self, prev: Option<String>) -> Result<(), LogError> {
        self.prev_hash = prev;
        self.chain_hash = self.compute_chain_hash()?;
        Ok(())
    }
}

/// Read-side filter for the audit API.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFilter {
    pub project_id: Option<String>,
    pub cache_tier: Option<CacheTier>,
    pub min_quality: Option<f64>,
    pub offset: usize,
    /// Zero means the default page size.
    pub limit: usize,
}

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

impl LogFilter {
    pub fn matches(&self, e: &GenerationLogEntry) -> bool {
        if let Some(p) = &self.project_id {
            if &e.project_id != p {
                return false;
            }
        }
        if let Some(tier) = self.cache_tier {
            if e.cache_tier != Some(tier) {
                return false;
            }
        }
        if let Some(min) = self.min_quality {
            match &e.quality_score {
                Some(q) if q.overall >= min => {}
                _ => return false,
            }
        }
        true
    }

    pub fn page_size(&self) -> usize {
        match self.limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    /// Apply filter and pagination to entries in log order.
    pub fn page<'a>(&self, entries: impl Iterator<Item = &'a GenerationLogEntry>) -> LogPage {
        let matching: Vec<&GenerationLogEntry> = entries.filter(|e| self.matches(e)).collect();
        let limit = self.page_size();
        LogPage {
            total: matching.len(),
            offset: self.offset,
            limit,
            entries: matching
                .into_iter()
                .skip(self.offset)
                .take(limit)
                .cloned()
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    pub entries: Vec<GenerationLogEntry>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLine {
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Spend per model tier and per cache path for one project.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub project_id: String,
    pub total: CostLine,
    pub by_tier: BTreeMap<String, CostLine>,
    pub by_cache_path: BTreeMap<String, CostLine>,
    pub failures: u64,
}

impl CostSummary {
    pub fn from_entries<'a>(
        project_id: &str,
        entries: impl Iterator<Item = &'a GenerationLogEntry>,
    ) -> Self {
        let mut s = CostSummary {
            project_id: project_id.to_string(),
            ..Default::default()
        };
        for e in entries.filter(|e| e.project_id == project_id) {
            let add = |line: &mut CostLine| {
                line.requests += 1;
                line.tokens += u64::from(e.tokens_used);
                line.cost += e.cost;
            };
            add(&mut s.total);
            let tier = e.model_tier.map_or("none", ModelTier::as_str);
            add(s.by_tier.entry(tier.to_string()).or_default());
            let path = e.cache_tier.map_or("miss", CacheTier::as_str);
            add(s.by_cache_path.entry(path.to_string()).or_default());
            if e.outcome == Outcome::Failure {
                s.failures += 1;
            }
        }
        s
    }
}

/// The system of record. `record` must be durable before it returns `Ok`.
#[async_trait]
pub trait GenerationLogger: Send + Sync {
    /// Append one sealed entry and return it as stored.
    async fn record(&self, entry: GenerationLogEntry) -> Result<GenerationLogEntry, LogError>;

    async fn query(&self, filter: &LogFilter) -> Result<LogPage, LogError>;

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<GenerationLogEntry>, LogError>;

    async fn cost_summary(&self, project_id: &str) -> Result<CostSummary, LogError>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::entry;
    use super::*;

    #[test]
    fn filter_and_paginate() {
        let entries = vec![
            entry("p1", Some(CacheTier::Exact), Some(0.9)),
            entry("p1", None, Some(0.4)),
            entry("p2", Some(CacheTier::Exact), Some(0.95)),
            entry("p1", Some(CacheTier::Exact), Some(0.7)),
        ];
        let f = LogFilter {
            project_id: Some("p1".into()),
            cache_tier: Some(CacheTier::Exact),
            min_quality: Some(0.5),
            offset: 1,
            limit: 1,
        };
        let page = f.page(entries.iter());
        assert_eq!(page.total, 2);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].execution_id, entries[3].execution_id);
    }

    #[test]
    fn min_quality_excludes_unscored_entries() {
        let e = entry("p1", None, None);
        let f = LogFilter {
            min_quality: Some(0.1),
            ..Default::default()
        };
        assert!(!f.matches(&e));
    }

    #[test]
    fn cost_summary_groups_by_tier_and_path() {
        let mut cached = entry("p1", Some(CacheTier::Exact), None);
        cached.model_tier = None;
        cached.tokens_used = 0;
        cached.cost = 0.0;
        let entries = vec![entry("p1", None, None), cached, entry("p2", None, None)];
        let s = CostSummary::from_entries("p1", entries.iter());
        assert_eq!(s.total.requests, 2);
        assert_eq!(s.by_tier["small"].tokens, 100);
        assert_eq!(s.by_cache_path["exact"].requests, 1);
        assert_eq!(s.by_cache_path["miss"].requests, 1);
    }
}
