use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{table_defs, SchemaError};

/// Read-only view of the durable store's metadata.
pub trait SchemaInventory: Send + Sync {
    fn schema_version(&self) -> Result<u32, SchemaError>;

    /// Table name -> column names.
    fn columns(&self) -> Result<BTreeMap<String, BTreeSet<String>>, SchemaError>;
}

/// Inventory held in memory or loaded from a YAML description of the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticInventory {
    pub version: u32,
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeSet<String>>,
}

impl StaticInventory {
    /// The layout a store fully migrated to `version` would report.
    pub fn declared(version: u32) -> Self {
        let tables = table_defs()
            .iter()
            .filter(|def| def.since <= version)
            .map(|def| {
                let cols = def.columns_at(version).map(|f| f.name().clone()).collect();
                (def.name.to_string(), cols)
            })
            .collect();
        Self { version, tables }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let text = std::fs::read_to_string(path).map_err(|e| SchemaError::Io(e.to_string()))?;
        serde_yaml::from_str(&text).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    pub fn without_table(mut self, table: &str) -> Self {
        self.tables.remove(table);
        self
    }

    pub fn without_column(mut self, table: &str, column: &str) -> Self {
        if let Some(cols) = self.tables.get_mut(table) {
            cols.remove(column);
        }
        self
    }
}

impl SchemaInventory for StaticInventory {
    fn schema_version(&self) -> Result<u32, SchemaError> {
        Ok(self.version)
    }

    fn columns(&self) -> Result<BTreeMap<String, BTreeSet<String>>, SchemaError> {
        Ok(self.tables.clone())
    }
}
