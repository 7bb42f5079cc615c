//! Window map implementation.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use tracing::trace;

/// A map whose keys carry a monotonic sequence number.
///
/// Only keys whose sequence number is at or above the window floor may be
/// present. Raising the floor with [`shift_window`](Self::shift_window)
/// evicts every entry that fell below it; nothing is evicted any other way.
///
/// The sequence number is read from the key by an extractor injected at
/// construction, so one container serves every sequence basis (generation,
/// birth round, ...).
///
/// # Example
///
/// ```
/// use tessera_sequence::SequenceWindowMap;
///
/// // Keys are (sequence, id) pairs; the extractor returns the sequence.
/// let mut map = SequenceWindowMap::new(0, |k: &(u64, u32)| k.0);
/// map.compute_if_absent((3, 1), |_| "three");
/// map.compute_if_absent((7, 2), |_| "seven");
///
/// map.shift_window(5);
/// assert!(!map.contains_key(&(3, 1)));
/// assert!(map.contains_key(&(7, 2)));
/// ```
pub struct SequenceWindowMap<K, V, S> {
    /// Values by key.
    entries: HashMap<K, V>,

    /// Keys grouped by sequence number, for eviction without a full scan.
    by_sequence: BTreeMap<u64, HashSet<K>>,

    /// Lowest sequence number allowed in the map.
    floor: u64,

    /// Floor restored by `clear()`.
    initial_floor: u64,

    /// Reads the sequence number from a key.
    extractor: S,
}

impl<K, V, S> SequenceWindowMap<K, V, S>
where
    K: Eq + Hash + Clone,
    S: Fn(&K) -> u64,
{
    /// Create an empty map with the given initial floor and key extractor.
    pub fn new(initial_floor: u64, extractor: S) -> Self {
        Self {
            entries: HashMap::new(),
            by_sequence: BTreeMap::new(),
            floor: initial_floor,
            initial_floor,
            extractor,
        }
    }

    /// Create an empty map with room for `capacity` keys.
    pub fn with_capacity(initial_floor: u64, capacity: usize, extractor: S) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            ..Self::new(initial_floor, extractor)
        }
    }

    /// Lowest sequence number currently allowed in the map.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    /// Sequence number of `key`.
    pub fn sequence_of(&self, key: &K) -> u64 {
        (self.extractor)(key)
    }

    /// Whether `key`'s sequence number is inside the window.
    pub fn is_in_window(&self, key: &K) -> bool {
        self.sequence_of(key) >= self.floor
    }

    /// Get the value for a key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Get a mutable reference to the value for a key.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Get the value for `key`, inserting `make(&key)` if it is absent.
    ///
    /// This is the only way to insert. Returns `None` without inserting if
    /// the key's sequence number is below the floor.
    pub fn compute_if_absent<F>(&mut self, key: K, make: F) -> Option<&mut V>
    where
        F: FnOnce(&K) -> V,
    {
        let sequence = (self.extractor)(&key);
        if sequence < self.floor {
            return None;
        }

        match self.entries.entry(key) {
            Entry::Occupied(occupied) => Some(occupied.into_mut()),
            Entry::Vacant(vacant) => {
                self.by_sequence
                    .entry(sequence)
                    .or_default()
                    .insert(vacant.key().clone());
                let value = make(vacant.key());
                Some(vacant.insert(value))
            }
        }
    }

    /// Remove a single key.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        let sequence = (self.extractor)(key);
        if let Some(keys) = self.by_sequence.get_mut(&sequence) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_sequence.remove(&sequence);
            }
        }
        Some(value)
    }

    /// Keys with exactly this sequence number.
    pub fn keys_with_sequence(&self, sequence: u64) -> impl Iterator<Item = &K> {
        self.by_sequence.get(&sequence).into_iter().flatten()
    }

    /// Remove and return every entry with exactly this sequence number.
    pub fn remove_sequence(&mut self, sequence: u64) -> Vec<(K, V)> {
        let Some(keys) = self.by_sequence.remove(&sequence) else {
            return Vec::new();
        };
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|value| (key, value)))
            .collect()
    }

    /// Raise the floor, discarding every entry below it.
    ///
    /// Returns the number of entries evicted.
    ///
    /// # Panics
    ///
    /// Panics if `new_floor` is below the current floor.
    pub fn shift_window(&mut self, new_floor: u64) -> usize {
        self.shift_window_with(new_floor, |_, _| {})
    }

    /// Raise the floor, handing every evicted entry to `on_evict`.
    ///
    /// Returns the number of entries evicted.
    ///
    /// # Panics
    ///
    /// Panics if `new_floor` is below the current floor.
    pub fn shift_window_with<F>(&mut self, new_floor: u64, mut on_evict: F) -> usize
    where
        F: FnMut(K, V),
    {
        assert!(
            new_floor >= self.floor,
            "window floor must not move backwards: {} -> {}",
            self.floor,
            new_floor
        );

        let retained = self.by_sequence.split_off(&new_floor);
        let expired = std::mem::replace(&mut self.by_sequence, retained);

        let mut evicted = 0;
        for key in expired.into_values().flatten() {
            if let Some(value) = self.entries.remove(&key) {
                on_evict(key, value);
                evicted += 1;
            }
        }

        trace!(
            old_floor = self.floor,
            new_floor,
            evicted,
            "Shifted sequence window"
        );
        self.floor = new_floor;
        evicted
    }

    /// Drop every entry and restore the initial floor.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_sequence.clear();
        self.floor = self.initial_floor;
    }

    /// Iterate over all entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V, S> std::fmt::Debug for SequenceWindowMap<K, V, S>
where
    K: std::fmt::Debug,
    V: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceWindowMap")
            .field("floor", &self.floor)
            .field("entries", &self.entries)
            .finish()
    }
}
