//! Durable storage behind flushed state copies.

use crate::StorageError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One change in a flushed batch. `None` deletes the key.
pub type Change = (Vec<u8>, Option<Vec<u8>>);

/// Storage that receives flushed copies.
///
/// Batches are applied in version order; each batch is the full set of
/// changes a copy (plus every copy merged into it) made since the last flush.
pub trait StateStorage: Send + Sync + std::fmt::Debug {
    /// Durably apply the changes of copy `version`.
    ///
    /// Either the whole batch is applied or none of it is.
    fn persist(&self, version: u64, changes: &[Change]) -> Result<(), StorageError>;

    /// Read a key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Version of the last persisted batch.
    fn latest_version(&self) -> Option<u64>;

    /// Every stored key and value.
    fn entries(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError>;
}

#[derive(Debug, Default)]
struct Contents {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    latest_version: Option<u64>,
}

impl Contents {
    fn check_order(&self, version: u64) -> Result<(), StorageError> {
        match self.latest_version {
            Some(latest) if version <= latest => Err(StorageError::Corrupt(format!(
                "batch {version} persisted after batch {latest}"
            ))),
            _ => Ok(()),
        }
    }

    fn apply(&mut self, version: u64, changes: &[Change]) {
        for (key, value) in changes {
            match value {
                Some(value) => {
                    self.data.insert(key.clone(), value.clone());
                }
                None => {
                    self.data.remove(key);
                }
            }
        }
        self.latest_version = Some(version);
    }
}

/// Storage held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: RwLock<Contents>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStorage {
    fn persist(&self, version: u64, changes: &[Change]) -> Result<(), StorageError> {
        let mut contents = self.contents.write();
        contents.check_order(version)?;
        contents.apply(version, changes);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.contents.read().data.get(key).cloned())
    }

    fn latest_version(&self) -> Option<u64> {
        self.contents.read().latest_version
    }

    fn entries(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
        Ok(self.contents.read().data.clone())
    }
}

/// A batch as written to disk, keys and values hex-encoded.
#[derive(Debug, Serialize, Deserialize)]
struct BatchFile {
    version: u64,
    changes: Vec<(String, Option<String>)>,
}

impl BatchFile {
    fn encode(version: u64, changes: &[Change]) -> Self {
        Self {
            version,
            changes: changes
                .iter()
                .map(|(key, value)| (hex::encode(key), value.as_ref().map(hex::encode)))
                .collect(),
        }
    }

    fn decode(self) -> Result<(u64, Vec<Change>), StorageError> {
        let changes = self
            .changes
            .into_iter()
            .map(|(key, value)| {
                let key = decode_hex(&key)?;
                let value = value.as_deref().map(decode_hex).transpose()?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, StorageError>>()?;
        Ok((self.version, changes))
    }
}

pub(crate) fn decode_hex(text: &str) -> Result<Vec<u8>, StorageError> {
    hex::decode(text).map_err(|e| StorageError::Corrupt(format!("invalid hex: {e}")))
}

/// Write `bytes` to `path` through a temporary file and a rename, so a crash
/// never leaves a partially written file under the final name.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let tmp = temp_path(path)?;
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// `path` with `.tmp` appended to its file name, so distinct targets never
/// share a temp file and a target ending in `.tmp` is not its own temp file.
fn temp_path(path: &Path) -> Result<PathBuf, StorageError> {
    let Some(name) = path.file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} does not name a file", path.display()),
        )
        .into());
    };
    let mut name = name.to_os_string();
    name.push(".tmp");
    Ok(path.with_file_name(name))
}

/// Storage that writes one JSON file per flushed batch.
///
/// Files are named by zero-padded version so a directory listing sorts in
/// apply order. The in-memory index is rebuilt from the files on open.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    contents: RwLock<Contents>,
}

impl FileStorage {
    /// Open (or create) storage in `dir`, replaying every batch found there.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut batch_paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("json") => batch_paths.push(path),
                Some("tmp") => {
                    warn!(path = %path.display(), "Removing incomplete batch file");
                    fs::remove_file(&path)?;
                }
                _ => {}
            }
        }
        batch_paths.sort();

        let mut contents = Contents::default();
        for path in &batch_paths {
            let batch: BatchFile = serde_json::from_slice(&fs::read(path)?)?;
            let (version, changes) = batch.decode()?;
            contents.check_order(version)?;
            contents.apply(version, &changes);
        }

        info!(
            dir = %dir.display(),
            batches = batch_paths.len(),
            keys = contents.data.len(),
            latest_version = ?contents.latest_version,
            "Opened file storage"
        );

        Ok(Self {
            dir,
            contents: RwLock::new(contents),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn batch_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{version:020}.json"))
    }
}

impl StateStorage for FileStorage {
    fn persist(&self, version: u64, changes: &[Change]) -> Result<(), StorageError> {
        let mut contents = self.contents.write();
        contents.check_order(version)?;

        let bytes = serde_json::to_vec(&BatchFile::encode(version, changes))?;
        write_atomically(&self.batch_path(version), &bytes)?;
        contents.apply(version, changes);

        debug!(version, changes = changes.len(), "Persisted batch");
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.contents.read().data.get(key).cloned())
    }

    fn latest_version(&self) -> Option<u64> {
        self.contents.read().latest_version
    }

    fn entries(&self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StorageError> {
        Ok(self.contents.read().data.clone())
    }
}
