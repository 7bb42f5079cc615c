//! Copy-on-write in-memory state root.

use crate::storage::{write_atomically, Change, StateStorage};
use crate::{FlushPolicy, MergeError, StorageError, VersionedStateRoot};
use im::OrdMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tessera_types::Hash;
use tracing::debug;

/// Changes made by one copy. `None` records a deletion.
type Delta = OrdMap<Vec<u8>, Option<Vec<u8>>>;

/// A standalone snapshot written by [`MemoryStateRoot::detach`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSnapshot {
    pub version: u64,

    /// Hex-encoded hash of the detached copy.
    pub hash: String,

    /// Every key and value visible in the copy, hex-encoded, sorted by key.
    pub entries: Vec<(String, String)>,
}

impl DetachedSnapshot {
    /// Read a snapshot file.
    pub fn read(path: &Path) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }

    /// Decoded entries.
    pub fn decoded_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        self.entries
            .iter()
            .map(|(key, value)| {
                Ok((
                    crate::storage::decode_hex(key)?,
                    crate::storage::decode_hex(value)?,
                ))
            })
            .collect()
    }
}

/// A key-value state copy that records only its own changes.
///
/// Each copy holds the changes made while it was the mutable copy. Reads
/// fall through to older copies that have not yet been flushed or merged,
/// and finally to [`StateStorage`]. Making a new copy with
/// [`copy`](Self::copy) freezes this one.
///
/// The hash of a copy chains the previous copy's hash with this copy's
/// sorted changes, so hashes must be computed oldest first.
pub struct MemoryStateRoot {
    version: u64,
    delta: RwLock<Delta>,

    /// Next older copy still holding changes not yet in storage.
    predecessor: RwLock<Option<Arc<MemoryStateRoot>>>,

    /// Copy this one was made from, held until this copy is hashed.
    parent: RwLock<Option<Arc<MemoryStateRoot>>>,

    storage: Arc<dyn StateStorage>,
    policy: FlushPolicy,

    hash: OnceLock<Hash>,
    immutable: AtomicBool,
    flush_requested: AtomicBool,
    flushed: AtomicBool,
    merged: AtomicBool,
    detached: AtomicBool,
    shut_down: AtomicBool,
}

impl MemoryStateRoot {
    /// The first mutable copy, continuing after whatever `storage` holds.
    pub fn genesis(storage: Arc<dyn StateStorage>, policy: FlushPolicy) -> Arc<Self> {
        let version = storage.latest_version().map_or(0, |v| v + 1);
        Arc::new(Self::new(version, None, storage, policy))
    }

    fn new(
        version: u64,
        predecessor: Option<Arc<Self>>,
        storage: Arc<dyn StateStorage>,
        policy: FlushPolicy,
    ) -> Self {
        Self {
            version,
            delta: RwLock::new(Delta::new()),
            parent: RwLock::new(predecessor.clone()),
            predecessor: RwLock::new(predecessor),
            storage,
            policy,
            hash: OnceLock::new(),
            immutable: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
            merged: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Freeze this copy and return the next mutable one.
    ///
    /// The flush policy decides here, once, whether this copy will be
    /// flushed.
    ///
    /// # Panics
    ///
    /// Panics if this copy is already immutable.
    pub fn copy(self: &Arc<Self>) -> Arc<Self> {
        let was_immutable = self.immutable.swap(true, Ordering::AcqRel);
        assert!(!was_immutable, "copy {} is immutable and cannot be copied", self.version);

        let delta_len = self.delta.read().len();
        if self.policy.should_flush(self.version, delta_len) {
            self.flush_requested.store(true, Ordering::Release);
        }

        self.prune_retired();
        Arc::new(Self::new(
            self.version + 1,
            Some(Arc::clone(self)),
            Arc::clone(&self.storage),
            self.policy,
        ))
    }

    /// Ask for this copy to be flushed when it retires.
    ///
    /// # Panics
    ///
    /// Panics if this copy is already immutable.
    pub fn request_flush(&self) {
        assert!(
            !self.is_immutable(),
            "flush of copy {} must be requested while it is mutable",
            self.version
        );
        self.flush_requested.store(true, Ordering::Release);
    }

    /// Set `key` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if this copy is immutable.
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.write(key.into(), Some(value.into()));
    }

    /// Delete `key`.
    ///
    /// # Panics
    ///
    /// Panics if this copy is immutable.
    pub fn delete(&self, key: impl Into<Vec<u8>>) {
        self.write(key.into(), None);
    }

    fn write(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        assert!(
            !self.is_immutable(),
            "copy {} is immutable and cannot be modified",
            self.version
        );
        self.delta.write().insert(key, value);
    }

    /// Read `key` as seen by this copy.
    ///
    /// Each copy's changes and its predecessor link are read under the same
    /// lock a merge holds while rewriting them, so a concurrent merge never
    /// hides a value.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let mut next = {
            let delta = self.delta.read();
            if let Some(value) = delta.get(key) {
                return Ok(value.clone());
            }
            self.predecessor.read().clone()
        };

        while let Some(root) = next {
            if root.is_flushed() {
                break;
            }
            let delta = root.delta.read();
            if let Some(value) = delta.get(key) {
                return Ok(value.clone());
            }
            next = root.predecessor.read().clone();
        }

        self.storage.get(key)
    }

    /// Number of keys changed by this copy (including merged-in copies).
    pub fn delta_len(&self) -> usize {
        self.delta.read().len()
    }

    /// The hash, once computed.
    pub fn hash(&self) -> Option<Hash> {
        self.hash.get().copied()
    }

    /// Whether `on_shutdown` has been delivered.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Drop links to flushed copies so their memory can be reclaimed.
    fn prune_retired(&self) {
        let mut next = self.cut_if_retired();
        while let Some(root) = next {
            next = root.cut_if_retired();
        }
    }

    fn cut_if_retired(&self) -> Option<Arc<Self>> {
        let mut predecessor = self.predecessor.write();
        if predecessor.as_ref().is_some_and(|p| p.is_flushed()) {
            *predecessor = None;
            None
        } else {
            predecessor.clone()
        }
    }

    fn delta_and_predecessor(&self) -> (Delta, Option<Arc<Self>>) {
        let delta = self.delta.read();
        (delta.clone(), self.predecessor.read().clone())
    }

    /// All visible entries: storage overlaid with every un-retired copy up to
    /// and including this one.
    fn materialise(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let (delta, mut next) = self.delta_and_predecessor();
        let mut chain: Vec<Delta> = vec![delta];
        while let Some(root) = next {
            if root.is_flushed() {
                break;
            }
            let (delta, predecessor) = root.delta_and_predecessor();
            chain.push(delta);
            next = predecessor;
        }

        let mut entries = self.storage.entries()?;
        for delta in chain.iter().rev() {
            for (key, value) in delta {
                match value {
                    Some(value) => {
                        entries.insert(key.clone(), value.clone());
                    }
                    None => {
                        entries.remove(key);
                    }
                }
            }
        }
        Ok(entries.into_iter().collect())
    }
}

impl VersionedStateRoot for MemoryStateRoot {
    fn fast_copy_version(&self) -> u64 {
        self.version
    }

    fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }

    fn requested_to_flush(&self) -> bool {
        self.flush_requested.load(Ordering::Acquire)
    }

    /// # Panics
    ///
    /// Panics if the copy is still mutable, was already hashed, or its
    /// parent has not been hashed.
    fn compute_hash(&self) -> Hash {
        assert!(
            self.is_immutable(),
            "copy {} must be immutable to be hashed",
            self.version
        );

        let parent_hash = match self.parent.write().take() {
            Some(parent) => parent.hash().unwrap_or_else(|| {
                panic!(
                    "copy {} hashed before its parent {}",
                    self.version, parent.version
                )
            }),
            None => Hash::ZERO,
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(parent_hash.as_bytes());
        hasher.update(&self.version.to_le_bytes());
        for (key, value) in self.delta.read().iter() {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key);
            match value {
                Some(value) => {
                    hasher.update(&[1]);
                    hasher.update(&(value.len() as u64).to_le_bytes());
                    hasher.update(value);
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        let hash = Hash::from_raw(*hasher.finalize().as_bytes());

        if self.hash.set(hash).is_err() {
            panic!("copy {} hashed twice", self.version);
        }
        debug!(version = self.version, %hash, "Hashed copy");
        hash
    }

    fn is_hashed(&self) -> bool {
        self.hash.get().is_some()
    }

    fn flush(&self) -> Result<(), StorageError> {
        assert!(
            self.is_hashed() && self.requested_to_flush(),
            "copy {} must be hashed and flagged for flushing before it is flushed",
            self.version
        );

        let changes: Vec<Change> = self
            .delta
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        self.storage.persist(self.version, &changes)?;
        self.flushed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    /// # Panics
    ///
    /// Panics if this copy was flagged for flushing.
    fn merge(&self, newer: &Self) -> Result<(), MergeError> {
        assert!(
            !self.requested_to_flush(),
            "copy {} is flagged for flushing and must not be merged",
            self.version
        );
        if newer.version != self.version + 1 {
            return Err(MergeError::NotAdjacent {
                older: self.version,
                newer: newer.version,
            });
        }
        if !self.is_hashed() {
            return Err(MergeError::NotHashed(self.version));
        }
        if !newer.is_hashed() {
            return Err(MergeError::NotHashed(newer.version));
        }
        if self.is_merged() || self.is_flushed() {
            return Err(MergeError::AlreadyRetired(self.version));
        }

        // Newer changes win over older ones.
        let older = self.delta.read().clone();
        {
            let mut delta = newer.delta.write();
            let combined = delta.clone().union(older);
            *delta = combined;
            *newer.predecessor.write() = self.predecessor.read().clone();
        }
        self.merged.store(true, Ordering::Release);
        Ok(())
    }

    fn is_merged(&self) -> bool {
        self.merged.load(Ordering::Acquire)
    }

    fn detach(&self, destination: &Path) -> Result<(), StorageError> {
        let hash = self.hash().ok_or_else(|| {
            StorageError::Corrupt(format!("copy {} detached before hashing", self.version))
        })?;

        let snapshot = DetachedSnapshot {
            version: self.version,
            hash: hash.to_hex(),
            entries: self
                .materialise()?
                .into_iter()
                .map(|(key, value)| (hex::encode(key), hex::encode(value)))
                .collect(),
        };
        write_atomically(destination, &serde_json::to_vec_pretty(&snapshot)?)?;
        self.detached.store(true, Ordering::Release);

        debug!(
            version = self.version,
            destination = %destination.display(),
            entries = snapshot.entries.len(),
            "Detached copy"
        );
        Ok(())
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn on_shutdown(&self, immediately: bool) {
        self.shut_down.store(true, Ordering::Release);
        debug!(version = self.version, immediately, "Copy notified of shutdown");
    }
}

impl std::fmt::Debug for MemoryStateRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateRoot")
            .field("version", &self.version)
            .field("delta_len", &self.delta_len())
            .field("immutable", &self.is_immutable())
            .field("hash", &self.hash())
            .field("flush_requested", &self.requested_to_flush())
            .field("flushed", &self.is_flushed())
            .field("merged", &self.is_merged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    fn genesis(policy: FlushPolicy) -> Arc<MemoryStateRoot> {
        MemoryStateRoot::genesis(Arc::new(MemoryStorage::new()), policy)
    }

    #[test]
    fn test_copy_freezes_source() {
        let v0 = genesis(FlushPolicy::never());
        v0.put("a", "1");
        let v1 = v0.copy();

        assert!(v0.is_immutable());
        assert!(!v1.is_immutable());
        assert_eq!(v1.fast_copy_version(), 1);
        assert_eq!(v1.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    #[should_panic(expected = "cannot be modified")]
    fn test_immutable_copy_rejects_writes() {
        let v0 = genesis(FlushPolicy::never());
        let _v1 = v0.copy();
        v0.put("a", "1");
    }

    #[test]
    fn test_reads_prefer_newest_change() {
        let v0 = genesis(FlushPolicy::never());
        v0.put("a", "1");
        v0.put("b", "1");
        let v1 = v0.copy();
        v1.put("a", "2");
        v1.delete("b");

        assert_eq!(v1.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(v1.get(b"b").unwrap(), None);
        assert_eq!(v0.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_hash_chains_parent() {
        let a0 = genesis(FlushPolicy::never());
        a0.put("k", "v");
        let a1 = a0.copy();
        let _a2 = a1.copy();
        a0.compute_hash();
        let chained = a1.compute_hash();

        // Same changes in copy 1, different parent content.
        let b0 = genesis(FlushPolicy::never());
        b0.put("k", "other");
        let b1 = b0.copy();
        let _b2 = b1.copy();
        b0.compute_hash();

        assert_ne!(chained, b1.compute_hash());
    }

    #[test]
    #[should_panic(expected = "hashed before its parent")]
    fn test_hashing_out_of_order_panics() {
        let v0 = genesis(FlushPolicy::never());
        let v1 = v0.copy();
        let _v2 = v1.copy();
        v1.compute_hash();
    }

    #[test]
    #[should_panic(expected = "hashed twice")]
    fn test_hashing_twice_panics() {
        let v0 = genesis(FlushPolicy::never());
        let _v1 = v0.copy();
        v0.compute_hash();
        v0.compute_hash();
    }

    #[test]
    fn test_flush_policy_applied_on_copy() {
        let v0 = genesis(FlushPolicy::every(2));
        let v1 = v0.copy();
        let v2 = v1.copy();
        let _v3 = v2.copy();
        assert!(v0.requested_to_flush());
        assert!(!v1.requested_to_flush());
        assert!(v2.requested_to_flush());
    }

    #[test]
    fn test_merge_folds_changes_into_newer() {
        let v0 = genesis(FlushPolicy::never());
        v0.put("a", "1");
        v0.put("b", "1");
        let v1 = v0.copy();
        v1.put("b", "2");
        let _v2 = v1.copy();
        v0.compute_hash();
        v1.compute_hash();

        v0.merge(&v1).unwrap();
        assert!(v0.is_merged());
        assert_eq!(v1.delta_len(), 2);
        assert_eq!(v1.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(v1.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_merge_requires_hashed_newer() {
        let v0 = genesis(FlushPolicy::never());
        let v1 = v0.copy();
        v0.compute_hash();
        assert_eq!(v0.merge(&v1), Err(MergeError::NotHashed(1)));
    }

    #[test]
    #[should_panic(expected = "must not be merged")]
    fn test_merging_flush_requested_copy_panics() {
        let v0 = genesis(FlushPolicy::never());
        v0.request_flush();
        let v1 = v0.copy();
        let _ = v0.merge(&v1);
    }

    #[test]
    fn test_flush_persists_and_reads_fall_through() {
        let storage = Arc::new(MemoryStorage::new());
        let v0 = MemoryStateRoot::genesis(storage.clone(), FlushPolicy::never());
        v0.put("a", "1");
        v0.request_flush();
        let v1 = v0.copy();
        v0.compute_hash();
        v0.flush().unwrap();

        assert!(v0.is_flushed());
        assert_eq!(storage.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(v1.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_genesis_continues_after_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage.persist(7, &[]).unwrap();
        let root = MemoryStateRoot::genesis(storage, FlushPolicy::never());
        assert_eq!(root.fast_copy_version(), 8);
    }
}
