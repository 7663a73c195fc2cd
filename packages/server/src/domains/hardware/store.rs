use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::models::{rank, HardwareKind, HardwareValue};

/// Latest published values, shared between the reactor thread and HTTP handlers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    /// Ranked values per kind
    pub values: BTreeMap<HardwareKind, Vec<HardwareValue>>,
    pub refreshed_at: Option<DateTime<Utc>>,
    pub refreshes: u64,
    /// Kinds whose last fetch failed; their previous values are kept
    pub failed_kinds: Vec<HardwareKind>,
}

impl Snapshot {
    pub fn listing_count(&self) -> usize {
        self.values.values().map(Vec::len).sum()
    }
}

/// Thread-safe handle to the current [`Snapshot`].
#[derive(Debug, Clone, Default)]
pub struct ValueStore {
    inner: Arc<RwLock<Snapshot>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the values of every kind present in `values`.
    ///
    /// Kinds missing from `values` keep what they had. Returns the prices
    /// previously stored for the replaced kinds, keyed by listing id.
    pub fn publish(
        &self,
        values: &BTreeMap<HardwareKind, Vec<HardwareValue>>,
        failed_kinds: &[HardwareKind],
        refreshed_at: DateTime<Utc>,
    ) -> HashMap<String, f64> {
        let mut snapshot = self.write();
        let mut previous = HashMap::new();

        for (kind, fresh) in values {
            if let Some(old) = snapshot.values.insert(*kind, rank(fresh.clone())) {
                previous.extend(old.into_iter().map(|value| (value.id, value.price)));
            }
        }
        snapshot.failed_kinds = failed_kinds.to_vec();
        snapshot.refreshed_at = Some(refreshed_at);
        snapshot.refreshes += 1;

        previous
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read().clone()
    }

    /// Ranked values for `kind`, or across every kind when `None`.
    pub fn ranked(&self, kind: Option<HardwareKind>, limit: Option<usize>) -> Vec<HardwareValue> {
        let snapshot = self.read();
        let values = match kind {
            Some(kind) => snapshot.values.get(&kind).cloned().unwrap_or_default(),
            None => rank(snapshot.values.values().flatten().cloned().collect()),
        };
        match limit {
            Some(limit) => values.into_iter().take(limit).collect(),
            None => values,
        }
    }

    pub fn best(&self, kind: HardwareKind) -> Option<HardwareValue> {
        self.read()
            .values
            .get(&kind)
            .and_then(|values| values.first().cloned())
    }

    // A panic while holding the lock leaves the snapshot as it was last
    // written, so a poisoned lock is still readable.
    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
