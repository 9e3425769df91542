use super::CounterStore;
use crate::StoreError;
use parking_lot::Mutex;
use std::collections::HashMap;

/// An in-process coordination store.
///
/// Counters live in this process only, so ids are distinct only among
/// generators sharing the same `MemoryStore` (wrap it in an `Arc`). Useful for
/// single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, if it was ever incremented or set.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.counters.lock().get(key).copied()
    }

    /// Overwrites a counter. An administrative operation: moving a counter
    /// backward can make the engine reissue ids.
    pub fn set(&self, key: &str, value: u64) {
        self.counters.lock().insert(key.to_owned(), value);
    }

    pub fn clear(&self) {
        self.counters.lock().clear();
    }
}

impl CounterStore for MemoryStore {
    async fn incr_by(&self, key: &str, by: u64) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(key.to_owned()).or_default();
        *counter = counter
            .checked_add(by)
            .ok_or_else(|| StoreError::Overflow(key.to_owned()))?;
        Ok(*counter)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
