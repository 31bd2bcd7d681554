use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::FeatureError;

/// Override layer. Implementations decide whether overrides outlive the
/// process; the in-memory store forgets them on restart.
pub trait OverrideStore: Send + Sync {
    fn get(&self, name: &str) -> Option<bool>;
    fn set(&self, name: &str, enabled: bool) -> Result<(), FeatureError>;
    fn clear(&self, name: &str) -> Result<(), FeatureError>;
    fn all(&self) -> BTreeMap<String, bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryOverrides {
    map: RwLock<BTreeMap<String, bool>>,
}

impl InMemoryOverrides {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> FeatureError {
    FeatureError::OverrideStore("override map lock poisoned".into())
}

impl OverrideStore for InMemoryOverrides {
    // Reads tolerate poison: a plain map of bools cannot be left half-updated.
    fn get(&self, name: &str) -> Option<bool> {
        let m = self.map.read().unwrap_or_else(PoisonError::into_inner);
        m.get(name).copied()
    }

    fn set(&self, name: &str, enabled: bool) -> Result<(), FeatureError> {
        self.map
            .write()
            .map_err(poisoned)?
            .insert(name.to_string(), enabled);
        Ok(())
    }

    fn clear(&self, name: &str) -> Result<(), FeatureError> {
        self.map.write().map_err(poisoned)?.remove(name);
        Ok(())
    }

    fn all(&self) -> BTreeMap<String, bool> {
        self.map.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
