//! Query-time resolution of the "current record" per logical event.
//!
//! Two phases: group rows by their dedup key, then reduce every group to the
//! row with the highest `source_version`. Equal versions resolve to the row
//! that arrived last. Input must be in arrival order.

use std::collections::HashMap;
use std::hash::Hash;

use crate::model::tick::TickEvent;

pub trait Versioned {
    type Key: Eq + Hash + Clone;

    fn dedup_key(&self) -> Self::Key;
    fn version(&self) -> u64;
}

impl Versioned for TickEvent {
    type Key = (String, u64);

    fn dedup_key(&self) -> Self::Key {
        (self.symbol.clone(), self.seq_id)
    }

    fn version(&self) -> u64 {
        self.source_version
    }
}

/// Keep exactly one row per key. Survivors are returned in the arrival order
/// of the surviving row.
pub fn resolve_current<T: Versioned>(rows: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut groups: HashMap<T::Key, Vec<(usize, T)>> = HashMap::new();
    for (arrival, row) in rows.into_iter().enumerate() {
        groups.entry(row.dedup_key()).or_default().push((arrival, row));
    }

    let mut survivors: Vec<(usize, T)> = groups
        .into_values()
        .filter_map(|group| {
            group
                .into_iter()
                .max_by_key(|(arrival, row)| (row.version(), *arrival))
        })
        .collect();
    survivors.sort_by_key(|(arrival, _)| *arrival);
    survivors.into_iter().map(|(_, row)| row).collect()
}

pub fn count_current<T: Versioned>(rows: impl IntoIterator<Item = T>) -> usize {
    resolve_current(rows).len()
}
