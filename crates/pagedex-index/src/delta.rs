//! Delta calculation between a persisted keyed set and a fresh one.
//!
//! The same calculation drives both derived stores: semantic units are keyed
//! by unit id and compared by fingerprint, link edges are keyed by their full
//! identity and only ever added or removed.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Partition of a keyed set into the work needed to move from the previous
/// state to the current one. All lists are sorted by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta<K> {
    /// Keys present now but not before.
    pub to_add: Vec<K>,
    /// Keys present in both whose value changed.
    pub to_update: Vec<K>,
    /// Keys present before but not now.
    pub to_remove: Vec<K>,
}

impl<K> Default for Delta<K> {
    fn default() -> Self {
        Self {
            to_add: Vec::new(),
            to_update: Vec::new(),
            to_remove: Vec::new(),
        }
    }
}

impl<K> Delta<K> {
    /// True when the two states are identical.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }

    /// Total number of keys that need work.
    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_update.len() + self.to_remove.len()
    }
}

/// Compute the delta between `previous` and `current`.
///
/// Values are compared with `PartialEq`; for semantic units the value is the
/// fingerprint, so an unchanged text never shows up in `to_update`.
pub fn compute_delta<K, V>(previous: &HashMap<K, V>, current: &HashMap<K, V>) -> Delta<K>
where
    K: Eq + Hash + Ord + Clone,
    V: PartialEq,
{
    let mut delta = Delta::default();

    for (key, value) in current {
        match previous.get(key) {
            None => delta.to_add.push(key.clone()),
            Some(old) if old != value => delta.to_update.push(key.clone()),
            Some(_) => {}
        }
    }

    delta.to_remove = previous
        .keys()
        .filter(|key| !current.contains_key(*key))
        .cloned()
        .collect();

    delta.to_add.sort();
    delta.to_update.sort();
    delta.to_remove.sort();
    delta
}

/// Compute an add/remove-only delta between two sets.
///
/// Used when the key is the whole identity of the item and there is no
/// notion of an in-place update.
pub fn compute_set_delta<K>(previous: &BTreeSet<K>, current: &BTreeSet<K>) -> Delta<K>
where
    K: Ord + Clone,
{
    Delta {
        to_add: current.difference(previous).cloned().collect(),
        to_update: Vec::new(),
        to_remove: previous.difference(current).cloned().collect(),
    }
}
