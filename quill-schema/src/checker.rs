use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{
    column_since, feature_requirement, sql_type, table_defs, SchemaError, SchemaInventory,
    REQUIRED_SCHEMA_VERSION,
};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MissingColumn {
    pub table: String,
    pub column: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCompatibilityReport {
    pub current_version: u32,
    pub required_version: u32,
    pub missing_tables: Vec<String>,
    pub missing_columns: Vec<MissingColumn>,
    pub upgrade_required: bool,
    pub instructions: Vec<String>,
}

impl SchemaCompatibilityReport {
    pub fn is_missing(&self, table: &str, column: &str) -> bool {
        self.missing_tables.iter().any(|t| t == table)
            || self
                .missing_columns
                .iter()
                .any(|m| m.table == table && m.column == column)
    }
}

/// Compares the store inventory against the declared tables. Results are
/// memoized for `ttl`; a zero ttl disables the memo.
pub struct SchemaCompatibilityChecker {
    inventory: Arc<dyn SchemaInventory>,
    ttl: Duration,
    memo: Mutex<Option<(Instant, SchemaCompatibilityReport)>>,
}

impl SchemaCompatibilityChecker {
    pub fn new(inventory: Arc<dyn SchemaInventory>, ttl: Duration) -> Self {
        Self {
            inventory,
            ttl,
            memo: Mutex::new(None),
        }
    }

    pub fn check_compatibility(&self) -> Result<SchemaCompatibilityReport, SchemaError> {
        if let Ok(memo) = self.memo.lock() {
            if let Some((at, report)) = memo.as_ref() {
                if at.elapsed() < self.ttl {
                    return Ok(report.clone());
                }
            }
        }
        let report = self.inspect()?;
        if let Ok(mut memo) = self.memo.lock() {
            *memo = Some((Instant::now(), report.clone()));
        }
        Ok(report)
    }

    /// Drop the memoized report, e.g. right after a migration.
    pub fn invalidate(&self) {
        if let Ok(mut memo) = self.memo.lock() {
            *memo = None;
        }
    }

    /// True only when every table and column the feature needs is present.
    pub fn is_feature_available(&self, feature: &str) -> bool {
        let Some(req) = feature_requirement(feature) else {
            return true;
        };
        match self.check_compatibility() {
            Ok(report) => req
                .columns
                .iter()
                .all(|(table, column)| !report.is_missing(table, column)),
            Err(err) => {
                tracing::warn!(feature, error = %err, "schema inventory unavailable");
                false
            }
        }
    }

    pub fn current_version(&self) -> Result<u32, SchemaError> {
        self.check_compatibility().map(|r| r.current_version)
    }

    fn inspect(&self) -> Result<SchemaCompatibilityReport, SchemaError> {
        let current_version = self.inventory.schema_version()?;
        let actual = self.inventory.columns()?;

        let mut missing_tables = Vec::new();
        let mut missing_columns = BTreeSet::new();
        let mut instructions = Vec::new();

        for def in table_defs() {
            if def.since > REQUIRED_SCHEMA_VERSION {
                continue;
            }
            let required: Vec<_> = def.columns_at(REQUIRED_SCHEMA_VERSION).collect();
            match actual.get(def.name) {
                None => {
                    missing_tables.push(def.name.to_string());
                    let cols: Vec<String> = required
                        .iter()
                        .map(|f| format!("{} {}", f.name(), sql_type(f.data_type())))
                        .collect();
                    instructions.push(format!(
                        "CREATE TABLE {} ({});",
                        def.name,
                        cols.join(", ")
                    ));
                }
                Some(present) => {
                    for field in required {
                        if present.contains(field.name()) {
                            continue;
                        }
                        missing_columns.insert(MissingColumn {
                            table: def.name.to_string(),
                            column: field.name().clone(),
                        });
                        instructions.push(format!(
                            "ALTER TABLE {} ADD COLUMN {} {}; -- added in v{}",
                            def.name,
                            field.name(),
                            sql_type(field.data_type()),
                            column_since(field)
                        ));
                    }
                }
            }
        }

        if current_version < REQUIRED_SCHEMA_VERSION {
            instructions.push(format!(
                "Record schema version {REQUIRED_SCHEMA_VERSION} (currently {current_version}) once the statements above are applied."
            ));
        }

        let upgrade_required = current_version < REQUIRED_SCHEMA_VERSION
            || !missing_tables.is_empty()
            || !missing_columns.is_empty();
        if upgrade_required {
            tracing::info!(
                current_version,
                missing_tables = missing_tables.len(),
                missing_columns = missing_columns.len(),
                "schema upgrade required"
            );
        }

        Ok(SchemaCompatibilityReport {
            current_version,
            required_version: REQUIRED_SCHEMA_VERSION,
            missing_tables,
            missing_columns: missing_columns.into_iter().collect(),
            upgrade_required,
            instructions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticInventory;

    fn checker(inv: StaticInventory) -> SchemaCompatibilityChecker {
        SchemaCompatibilityChecker::new(Arc::new(inv), Duration::ZERO)
    }

    #[test]
    fn fully_migrated_store_needs_nothing() {
        let report = checker(StaticInventory::declared(3)).check_compatibility().unwrap();
        assert!(!report.upgrade_required);
        assert!(report.missing_tables.is_empty());
        assert!(report.missing_columns.is_empty());
        assert!(report.instructions.is_empty());
    }

    #[test]
    fn v1_store_reports_exact_gaps() {
        let report = checker(StaticInventory::declared(1)).check_compatibility().unwrap();
        assert!(report.upgrade_required);
        assert_eq!(report.missing_tables, vec!["cache_entries".to_string()]);
        let cols: Vec<_> = report.missing_columns.iter().map(|m| m.column.as_str()).collect();
        assert_eq!(cols, vec!["quality_score", "repair_actions", "rule_violations"]);
        assert!(report
            .instructions
            .iter()
            .any(|i| i.starts_with("ALTER TABLE generation_logs ADD COLUMN quality_score DOUBLE PRECISION")));
        assert!(report.instructions.iter().any(|i| i.starts_with("CREATE TABLE cache_entries (")));
    }

    #[test]
    fn feature_availability_tracks_columns() {
        let c = checker(StaticInventory::declared(3).without_column("generation_logs", "quality_score"));
        assert!(c.is_feature_available("generation-logs"));
        assert!(c.is_feature_available("auto-repair"));
        assert!(!c.is_feature_available("quality-evaluation"));
        assert!(c.is_feature_available("not-a-storage-feature"));
    }

    #[test]
    fn dropped_cache_table_blocks_enhanced_cache_only() {
        let c = checker(StaticInventory::declared(3).without_table("cache_entries"));
        let report = c.check_compatibility().unwrap();
        assert_eq!(report.current_version, 3);
        assert!(report.upgrade_required);
        assert!(report.is_missing("cache_entries", "embedding"));
        assert!(!c.is_feature_available("enhanced-cache"));
        assert!(c.is_feature_available("auto-repair"));
    }
}
