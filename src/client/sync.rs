//! In-memory synchronization state.
//!
//! Holds the latest observed value per concrete key, the global VTS → key
//! index used by advance reconciliation, the committed RVTS checkpoint per
//! subscription slot, and the set of slots with an advance loop in flight.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::Value;

/// The RVTS ledger is indexed by ACL scope + pattern; the scope is the
/// static `*` placeholder for every subscription this client makes.
pub(crate) fn rvts_slot(pattern: &str) -> String {
    format!("*.{pattern}")
}

#[derive(Debug, Default)]
pub(crate) struct SyncState {
    /// Latest value per concrete key. Patterns never appear here.
    memory_db: HashMap<String, Value>,
    /// Every VTS ever stored, mapped to its concrete key.
    vts_index: HashMap<u64, String>,
    /// Highest committed RVTS per subscription slot.
    rvts: HashMap<String, u64>,
    /// Slots currently driving an advance loop.
    advance_scheduled: HashSet<String>,
    last_cts: u64,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next creation timestamp: monotonically non-decreasing, anchored to
    /// wall-clock milliseconds.
    pub fn next_cts(&mut self) -> u64 {
        let wallclock = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        self.last_cts = (self.last_cts + 1).max(wallclock);
        self.last_cts
    }

    pub fn latest(&self, key: &str) -> Option<&Value> {
        self.memory_db.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.memory_db.values()
    }

    /// Stores a value unless an entry with an equal or higher VTS is
    /// already present for its key. Returns whether the value was stored.
    /// A tombstone supersedes a live value under the same rule: strictly
    /// greater VTS.
    pub fn record(&mut self, value: Value) -> bool {
        if let Some(existing) = self.memory_db.get(&value.key) {
            if value.vts <= existing.vts {
                return false;
            }
        }
        self.vts_index.insert(value.vts, value.key.clone());
        self.memory_db.insert(value.key.clone(), value);
        true
    }

    /// The cached value that covers `vts`, if any: the VTS is known and the
    /// stored value for its key is at least as new.
    pub fn covering(&self, vts: u64) -> Option<&Value> {
        let key = self.vts_index.get(&vts)?;
        self.memory_db.get(key).filter(|value| value.vts >= vts)
    }

    pub fn rvts_for(&self, slot: &str) -> u64 {
        self.rvts.get(slot).copied().unwrap_or(0)
    }

    pub fn commit_rvts(&mut self, slot: &str, rvts: u64) {
        self.rvts.insert(slot.to_owned(), rvts);
    }

    /// Marks an advance loop as running. Returns false when one already is.
    pub fn begin_advance(&mut self, slot: &str) -> bool {
        self.advance_scheduled.insert(slot.to_owned())
    }

    pub fn end_advance(&mut self, slot: &str) {
        self.advance_scheduled.remove(slot);
    }

    #[cfg(test)]
    pub fn advance_in_flight(&self, slot: &str) -> bool {
        self.advance_scheduled.contains(slot)
    }
}
