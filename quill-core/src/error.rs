use quill_audit::LogError;
use quill_cache::CacheError;
use quill_features::FeatureError;
use quill_schema::SchemaError;
use quill_types::{Diagnostics, ErrorKind, ExecutionId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The request ran and ended in failure; the failure is in the audit log.
    #[error("generation {execution_id} failed ({kind}): {message}")]
    Terminal {
        execution_id: ExecutionId,
        kind: ErrorKind,
        message: String,
        diagnostics: Diagnostics,
    },
    /// The audit append failed, so the result cannot be used.
    #[error("generation {execution_id} could not be audited: {source}")]
    AuditWrite {
        execution_id: ExecutionId,
        #[source]
        source: LogError,
    },
    #[error("feature disabled: {0}")]
    FeatureDisabled(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Terminal { kind, .. } => *kind,
            PipelineError::FeatureDisabled(_) | PipelineError::InvalidRequest(_) => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Unknown,
        }
    }

    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            PipelineError::Terminal { execution_id, .. }
            | PipelineError::AuditWrite { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }
}
