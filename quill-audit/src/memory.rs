use std::sync::Mutex;

use async_trait::async_trait;
use quill_types::ExecutionId;

use crate::{CostSummary, GenerationLogEntry, GenerationLogger, LogError, LogFilter, LogPage};

/// Process-local log with the same chaining and uniqueness rules as the file
/// log. Used by tests and the demo.
#[derive(Default)]
pub struct InMemoryGenerationLog {
    entries: Mutex<Vec<GenerationLogEntry>>,
}

impl InMemoryGenerationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Result<Vec<GenerationLogEntry>, LogError> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .map_err(|_| LogError::Io("lock".into()))
    }
}

#[async_trait]
impl GenerationLogger for InMemoryGenerationLog {
    async fn record(&self, mut entry: GenerationLogEntry) -> Result<GenerationLogEntry, LogError> {
        let mut entries = self.entries.lock().map_err(|_| LogError::Io("lock".into()))?;
        if entries.iter().any(|e| e.execution_id == entry.execution_id) {
            return Err(LogError::Duplicate(entry.execution_id));
        }
        entry.seal(entries.last().map(|e| e.chain_hash.clone()))?;
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn query(&self, filter: &LogFilter) -> Result<LogPage, LogError> {
        let entries = self.entries.lock().map_err(|_| LogError::Io("lock".into()))?;
        Ok(filter.page(entries.iter()))
    }

    async fn get(&self, execution_id: ExecutionId) -> Result<Option<GenerationLogEntry>, LogError> {
        let entries = self.entries.lock().map_err(|_| LogError::Io("lock".into()))?;
        Ok(entries.iter().find(|e| e.execution_id == execution_id).cloned())
    }

    async fn cost_summary(&self, project_id: &str) -> Result<CostSummary, LogError> {
        let entries = self.entries.lock().map_err(|_| LogError::Io("lock".into()))?;
        Ok(CostSummary::from_entries(project_id, entries.iter()))
    }
}
