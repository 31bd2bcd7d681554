#![forbid(unsafe_code)]
//! Declared storage layout for generation records and the checker that
//! compares it with what the durable store actually exposes.

use arrow::datatypes::{DataType, Field, Schema};
use thiserror::Error;

pub mod macros;

pub mod inventory;
pub use inventory::{SchemaInventory, StaticInventory};

pub mod checker;
pub use checker::{MissingColumn, SchemaCompatibilityChecker, SchemaCompatibilityReport};

/// Schema version this build of the pipeline expects.
pub const REQUIRED_SCHEMA_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("inventory unavailable: {0}")]
    Inventory(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Clone, Debug)]
pub struct TableDef {
    pub name: &'static str,
    pub since: u32,
    pub schema: Schema,
}

impl TableDef {
    /// Columns that exist at `version`.
    pub fn columns_at(&self, version: u32) -> impl Iterator<Item = &Field> {
        self.schema
            .fields()
            .iter()
            .map(|f| f.as_ref())
            .filter(move |f| column_since(f) <= version)
    }
}

/// Version that introduced a column. Columns without metadata date from v1.
pub fn column_since(field: &Field) -> u32 {
    field
        .metadata()
        .get(macros::SINCE_KEY)
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

pub mod generated {
    use crate::define_tables;

    define_tables! {
        table GenerationLogs {
            name: "generation_logs",
            since: 1,
            fields: {
                execution_id: Utf8 @ 1,
                project_id: Utf8 @ 1,
                chapter_id: Utf8 @ 1,
                scene_id: Utf8 @ 1,
                template_id: Utf8 @ 1,
                template_version: UInt32 @ 1,
                prompt_hash: Utf8 @ 1,
                model_id: Utf8 @ 1,
                model_version: Utf8 @ 1,
                parameters: Utf8 @ 1,
                route_decision: Utf8 @ 1,
                cache_tier: Utf8 @ 1,
                response_hash: Utf8 @ 1,
                retry_count: UInt32 @ 1,
                duration_ms: UInt64 @ 1,
                error_kind: Utf8 @ 1,
                diagnostics: Utf8 @ 1,
                chain_hash: Utf8 @ 1,
                created_at: TimestampMsUtc @ 1,
                tokens_used: UInt32 @ 1,
                cost: Float64 @ 1,
                quality_score: Float64 @ 2,
                rule_violations: Utf8 @ 2,
                repair_actions: Utf8 @ 3
            }
        },

        table CacheEntries {
            name: "cache_entries",
            since: 2,
            fields: {
                cache_key: Utf8 @ 2,
                tier: Utf8 @ 2,
                payload: Utf8 @ 2,
                metadata: Utf8 @ 2,
                hit_count: UInt64 @ 2,
                semantic_hash: Utf8 @ 2,
                template_hash: Utf8 @ 2,
                embedding: FixedSizeListF32(256) @ 2,
                created_at: TimestampMsUtc @ 2,
                expires_at: TimestampMsUtc @ 2
            }
        }
    }
}

pub use generated::*;

/// Storage a named feature needs before it can run.
#[derive(Clone, Copy, Debug)]
pub struct FeatureRequirement {
    pub feature: &'static str,
    pub columns: &'static [(&'static str, &'static str)],
}

pub const FEATURE_REQUIREMENTS: &[FeatureRequirement] = &[
    FeatureRequirement {
        feature: "generation-logs",
        columns: &[
            ("generation_logs", "execution_id"),
            ("generation_logs", "project_id"),
            ("generation_logs", "template_id"),
            ("generation_logs", "template_version"),
            ("generation_logs", "prompt_hash"),
            ("generation_logs", "model_id"),
            ("generation_logs", "route_decision"),
            ("generation_logs", "cache_tier"),
            ("generation_logs", "retry_count"),
            ("generation_logs", "duration_ms"),
            ("generation_logs", "error_kind"),
            ("generation_logs", "created_at"),
        ],
    },
    FeatureRequirement {
        feature: "cost-monitoring",
        columns: &[("generation_logs", "tokens_used"), ("generation_logs", "cost")],
    },
    FeatureRequirement {
        feature: "quality-evaluation",
        columns: &[
            ("generation_logs", "quality_score"),
            ("generation_logs", "rule_violations"),
        ],
    },
    FeatureRequirement {
        feature: "enhanced-cache",
        columns: &[
            ("cache_entries", "cache_key"),
            ("cache_entries", "tier"),
            ("cache_entries", "payload"),
            ("cache_entries", "semantic_hash"),
            ("cache_entries", "template_hash"),
            ("cache_entries", "embedding"),
        ],
    },
    FeatureRequirement {
        feature: "auto-repair",
        columns: &[("generation_logs", "repair_actions")],
    },
];

pub fn feature_requirement(feature: &str) -> Option<&'static FeatureRequirement> {
    FEATURE_REQUIREMENTS.iter().find(|r| r.feature == feature)
}

/// SQL column type used in upgrade instructions.
pub fn sql_type(ty: &DataType) -> &'static str {
    match ty {
        DataType::Utf8 | DataType::LargeUtf8 => "TEXT",
        DataType::UInt32 | DataType::Int32 | DataType::UInt16 | DataType::Int16 => "INTEGER",
        DataType::UInt64 | DataType::Int64 => "BIGINT",
        DataType::Float32 => "REAL",
        DataType::Float64 => "DOUBLE PRECISION",
        DataType::Boolean => "BOOLEAN",
        DataType::Timestamp(_, Some(_)) => "TIMESTAMPTZ",
        DataType::Timestamp(_, None) => "TIMESTAMP",
        DataType::FixedSizeList(_, _) | DataType::List(_) => "REAL[]",
        _ => "TEXT",
    }
}
