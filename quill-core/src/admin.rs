//! In-process administrative surface: audit reads, cost accounting, cache
//! maintenance, feature administration and the schema report.

use chrono::Utc;
use quill_audit::{CostSummary, GenerationLogEntry, LogFilter, LogPage};
use quill_cache::CacheStats;
use quill_features::{FlagState, COST_MONITORING, GENERATION_LOGS};
use quill_schema::SchemaCompatibilityReport;
use quill_types::ExecutionId;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::GenerationPipeline;

impl GenerationPipeline {
    fn require(&self, feature: &str) -> Result<(), PipelineError> {
        if self.components().features.is_enabled(feature) {
            Ok(())
        } else {
            Err(PipelineError::FeatureDisabled(feature.to_string()))
        }
    }

    pub async fn list_logs(&self, filter: &LogFilter) -> Result<LogPage, PipelineError> {
        self.require(GENERATION_LOGS)?;
        Ok(self.components().audit.query(filter).await?)
    }

    pub async fn get_log(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<GenerationLogEntry>, PipelineError> {
        self.require(GENERATION_LOGS)?;
        Ok(self.components().audit.get(execution_id).await?)
    }

    /// Append a correction for an earlier execution. The original entry is
    /// left untouched.
    pub async fn append_correction(
        &self,
        corrects: ExecutionId,
        note: &str,
    ) -> Result<GenerationLogEntry, PipelineError> {
        self.require(GENERATION_LOGS)?;
        let audit = &self.components().audit;
        let original = audit.get(corrects).await?.ok_or_else(|| {
            PipelineError::InvalidRequest(format!("no execution {corrects} to correct"))
        })?;
        let mut correction = original;
        correction.execution_id = Uuid::new_v4();
        correction.corrects = Some(corrects);
        correction.warnings.push(format!("correction: {note}"));
        correction.timestamp = Utc::now();
        tracing::info!(%corrects, correction = %correction.execution_id, "appending correction");
        Ok(audit.record(correction).await?)
    }

    pub async fn cost_summary(&self, project_id: &str) -> Result<CostSummary, PipelineError> {
        self.require(COST_MONITORING)?;
        Ok(self.components().audit.cost_summary(project_id).await?)
    }

    pub async fn cleanup_cache(&self, days_old: u32) -> Result<usize, PipelineError> {
        let removed = self.components().cache.cleanup(days_old, Utc::now()).await?;
        tracing::info!(days_old, removed, "cache cleanup");
        Ok(removed)
    }

    pub async fn sweep_expired(&self) -> Result<usize, PipelineError> {
        Ok(self.components().cache.sweep_expired(Utc::now()).await?)
    }

    pub async fn purge_cache(&self) -> Result<usize, PipelineError> {
        let removed = self.components().cache.purge_all().await?;
        tracing::warn!(removed, "cache purged");
        Ok(removed)
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, PipelineError> {
        Ok(self.components().cache.stats().await?)
    }

    pub fn feature_states(&self) -> Vec<FlagState> {
        self.components().features.list()
    }

    pub fn set_feature_override(&self, name: &str, enabled: bool) -> Result<(), PipelineError> {
        let gate = &self.components().features;
        if enabled {
            gate.enable(name)?;
        } else {
            gate.disable(name)?;
        }
        Ok(())
    }

    pub fn clear_feature_override(&self, name: &str) -> Result<(), PipelineError> {
        Ok(self.components().features.clear_override(name)?)
    }

    pub fn enable_stable_features(&self) -> Result<(), PipelineError> {
        Ok(self.components().features.enable_stable_features()?)
    }

    pub fn rollback_to_legacy(&self) -> Result<(), PipelineError> {
        Ok(self.components().features.rollback_to_legacy()?)
    }

    pub fn schema_report(&self) -> Result<SchemaCompatibilityReport, PipelineError> {
        Ok(self.components().schema.check_compatibility()?)
    }
}
