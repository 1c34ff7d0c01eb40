//! Event statistics.
//!
//! Every decoded feed event is counted under its `TYPE-CHANGE` key
//! (for example `APP-ADD`), whether or not a handler acted on it.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use yhs_events::EventKey;

/// Thread-safe per-key event counts.
#[derive(Debug, Default)]
pub struct EventCounters {
    counts: RwLock<HashMap<EventKey, u64>>,
}

impl EventCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: EventKey) {
        if let Ok(mut counts) = self.counts.write() {
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    pub fn get(&self, key: EventKey) -> u64 {
        self.counts
            .read()
            .ok()
            .and_then(|counts| counts.get(&key).copied())
            .unwrap_or(0)
    }

    /// Counts keyed by display name, sorted.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .read()
            .map(|counts| counts.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default()
    }
}
