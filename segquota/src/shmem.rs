//! Fixed-capacity maps standing in for the node-wide shared memory region.
//!
//! Every process on a node sees the same instance through an `Arc`; each map
//! pairs a bounded slot arena with one reader/writer lock, and all
//! operations hold the lock for strictly bounded work. Lock poisoning is
//! swallowed rather than propagated so that a panicked writer elsewhere can
//! never take the write path down with it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// What happened to an insert attempt against a bounded map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    /// All slots taken; the entry was dropped.
    Full,
}

pub struct ShmemMap<K, V> {
    name: &'static str,
    capacity: usize,
    slots: RwLock<HashMap<K, V>>,
}

impl<K, V> ShmemMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            slots: RwLock::new(HashMap::with_capacity(capacity.min(1024))),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, key: K, value: V) -> InsertOutcome {
        let mut slots = self.write_slots();
        if slots.contains_key(&key) {
            slots.insert(key, value);
            return InsertOutcome::AlreadyPresent;
        }
        if slots.len() >= self.capacity {
            return InsertOutcome::Full;
        }
        slots.insert(key, value);
        InsertOutcome::Inserted
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.write_slots().remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.read_slots().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_slots().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.read_slots().keys().cloned().collect()
    }

    pub fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        self.write_slots().retain(f);
    }

    pub fn clear(&self) {
        self.write_slots().clear();
    }

    /// Take every entry out under one write-lock hold, leaving the map
    /// empty. Callers drain into a local buffer first so that a cancelled
    /// pass can `restore` what it did not consume.
    pub fn drain(&self) -> HashMap<K, V> {
        std::mem::take(&mut *self.write_slots())
    }

    /// Run a closure against the slots under one writer-lock hold, for
    /// multi-entry diffs that readers must never observe half-applied. The
    /// closure is handed the capacity and must honor it.
    pub fn with_write<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut HashMap<K, V>, usize) -> R,
    {
        f(&mut self.write_slots(), self.capacity)
    }

    /// Put entries back (after a drain whose consumer could not resolve
    /// them). Returns how many no longer fit.
    pub fn restore<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut slots = self.write_slots();
        let mut dropped = 0;
        for (key, value) in entries {
            if slots.len() >= self.capacity && !slots.contains_key(&key) {
                dropped += 1;
                continue;
            }
            slots.insert(key, value);
        }
        dropped
    }
}

impl<K, V> ShmemMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn get_cloned(&self, key: &K) -> Option<V> {
        self.read_slots().get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.read_slots().clone()
    }
}

impl<K, V> std::fmt::Debug for ShmemMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemMap")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_honors_capacity() {
        let map: ShmemMap<u32, ()> = ShmemMap::new("test", 2);
        assert_eq!(map.insert(1, ()), InsertOutcome::Inserted);
        assert_eq!(map.insert(2, ()), InsertOutcome::Inserted);
        assert_eq!(map.insert(3, ()), InsertOutcome::Full);
        assert_eq!(map.len(), 2);

        // Re-inserting an existing key is not an overflow.
        assert_eq!(map.insert(1, ()), InsertOutcome::AlreadyPresent);
    }

    #[test]
    fn drain_then_restore() {
        let map: ShmemMap<u32, u32> = ShmemMap::new("test", 4);
        for i in 0..4 {
            map.insert(i, i * 10);
        }
        let drained = map.drain();
        assert_eq!(drained.len(), 4);
        assert!(map.is_empty());

        // Unconsumed entries go back; capacity still binds.
        let dropped = map.restore(drained);
        assert_eq!(dropped, 0);
        assert_eq!(map.len(), 4);
        assert_eq!(map.restore(vec![(9, 90)]), 1);
    }
}
