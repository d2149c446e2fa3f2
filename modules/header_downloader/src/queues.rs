//! Priority views over the link/anchor forest.

use std::{
    collections::{BTreeSet, HashMap},
    hash::Hash,
};

/// An ordered set of handles with a key per handle.
///
/// The queue does not own what the handles point at. Changing the state the
/// key was derived from has no effect until [`IndexedQueue::reschedule`] is
/// called with the new key.
#[derive(Debug)]
pub struct IndexedQueue<K, H> {
    order: BTreeSet<(K, H)>,
    keys: HashMap<H, K>,
}

impl<K, H> Default for IndexedQueue<K, H> {
    fn default() -> Self {
        Self {
            order: BTreeSet::new(),
            keys: HashMap::new(),
        }
    }
}

impl<K, H> IndexedQueue<K, H>
where
    K: Ord + Copy,
    H: Ord + Copy + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handle` with `key`, replacing any previous key.
    pub fn insert(&mut self, handle: H, key: K) {
        if let Some(old) = self.keys.insert(handle, key) {
            self.order.remove(&(old, handle));
        }
        self.order.insert((key, handle));
    }

    /// Remove `handle`, returning its key if it was queued.
    pub fn remove(&mut self, handle: H) -> Option<K> {
        let key = self.keys.remove(&handle)?;
        self.order.remove(&(key, handle));
        Some(key)
    }

    /// Move an already queued `handle` to `key`. Returns false if the handle
    /// is not queued.
    pub fn reschedule(&mut self, handle: H, key: K) -> bool {
        if !self.keys.contains_key(&handle) {
            return false;
        }
        self.insert(handle, key);
        true
    }

    /// Smallest entry.
    pub fn peek(&self) -> Option<(K, H)> {
        self.order.first().copied()
    }

    pub fn contains(&self, handle: H) -> bool {
        self.keys.contains_key(&handle)
    }

    pub fn key(&self, handle: H) -> Option<K> {
        self.keys.get(&handle).copied()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (K, H)> + '_ {
        self.order.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The two internal indexes agree.
    pub fn is_consistent(&self) -> bool {
        self.order.len() == self.keys.len()
            && self.order.iter().all(|(key, handle)| self.keys.get(handle) == Some(key))
    }
}
