//! Round-by-round state copies.

use crate::StateConfig;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tessera_pipeline::{
    FileStorage, MemoryStateRoot, MemoryStorage, PipelineConfig, PipelineError, StatePipeline,
    StateStorage, StorageError, VersionedStateRoot,
};
use tessera_types::Hash;
use tracing::{debug, info};

/// Owns the mutable state copy and hands finished copies to the pipeline.
///
/// Application code writes to [`current`](Self::current). At the end of a
/// consensus round [`advance_round`](Self::advance_round) freezes it, makes
/// the next copy current, and releases the frozen one for hashing and
/// retirement.
pub struct StateManager {
    current: RwLock<Arc<MemoryStateRoot>>,
    /// Serialises `advance_round`; `current` is only write-locked for the swap.
    advancing: Mutex<()>,
    pipeline: StatePipeline<MemoryStateRoot>,
}

impl StateManager {
    /// Open the storage named by `config` and start a pipeline on top of it.
    pub fn open(config: &StateConfig) -> Result<Self, StorageError> {
        let storage: Arc<dyn StateStorage> = match &config.storage_dir {
            Some(dir) => Arc::new(FileStorage::open(dir)?),
            None => Arc::new(MemoryStorage::new()),
        };
        Ok(Self::with_storage(config, storage))
    }

    /// Start a pipeline on `storage`. The first copy continues after the
    /// last version in storage.
    pub fn with_storage(config: &StateConfig, storage: Arc<dyn StateStorage>) -> Self {
        let genesis = MemoryStateRoot::genesis(storage, config.flush_policy());
        let pipeline = StatePipeline::new(
            PipelineConfig::default().with_counter(config.counter()),
            Arc::clone(&genesis),
        );
        info!(first_version = genesis.fast_copy_version(), "State manager started");
        Self {
            current: RwLock::new(genesis),
            advancing: Mutex::new(()),
            pipeline,
        }
    }

    /// The mutable copy.
    pub fn current(&self) -> Arc<MemoryStateRoot> {
        self.current.read().clone()
    }

    pub fn current_version(&self) -> u64 {
        self.current.read().fast_copy_version()
    }

    /// Read `key` from the mutable copy.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        self.current().get(key)
    }

    /// Flush the mutable copy when it retires, regardless of policy.
    pub fn request_flush(&self) {
        self.current.read().request_flush();
    }

    /// Finish the round: freeze the mutable copy, start the next one, and
    /// release the finished copy. Returns the finished copy's version.
    ///
    /// Blocks while the pipeline holds its maximum of unretired copies;
    /// readers keep seeing the finished copy meanwhile. A stopped pipeline
    /// is reported before anything is frozen.
    pub fn advance_round(&self) -> Result<u64, PipelineError> {
        let _advancing = self.advancing.lock();
        self.pipeline.ensure_running()?;

        let finished = self.current();
        let version = finished.fast_copy_version();
        let next = finished.copy();

        // Even if the pipeline stopped in the meantime, the new copy is the
        // only one that can still be written to.
        let registered = self.pipeline.register_copy(Arc::clone(&next));
        *self.current.write() = next;
        registered?;

        self.pipeline.release_copy(version)?;
        debug!(finished = version, "Advanced state round");
        Ok(version)
    }

    /// Block until copy `version` is hashed.
    pub fn wait_until_hashed(&self, version: u64) -> Result<Hash, PipelineError> {
        self.pipeline.wait_until_hashed(version)
    }

    /// Write copy `version` to `destination` as a standalone snapshot.
    pub fn detach(&self, version: u64, destination: &Path) -> Result<(), PipelineError> {
        self.pipeline.detach_copy(version, destination)
    }

    pub fn pipeline(&self) -> &StatePipeline<MemoryStateRoot> {
        &self.pipeline
    }

    /// Stop the pipeline and wait for it.
    ///
    /// The pipeline's own failure, if any, is returned.
    pub fn shutdown(&self, immediately: bool) -> Result<(), PipelineError> {
        self.pipeline.terminate(immediately);
        self.pipeline.await_termination();
        match self.pipeline.failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;
    use tessera_pipeline::Retirement;
    use tracing_test::traced_test;

    fn config() -> StateConfig {
        StateConfig {
            flush_interval: 0,
            flush_threshold: 0,
            ..StateConfig::default()
        }
    }

    #[traced_test]
    #[test]
    fn test_rounds_carry_state_forward() {
        let manager = StateManager::open(&config()).unwrap();
        manager.current().put("balance", "10");
        let first = manager.advance_round().unwrap();
        manager.current().put("balance", "7");
        manager.advance_round().unwrap();

        assert_eq!(first, 0);
        assert_eq!(manager.current_version(), 2);
        assert_eq!(manager.get(b"balance").unwrap(), Some(b"7".to_vec()));
        assert_eq!(
            manager.pipeline().wait_until_retired(0).unwrap(),
            Retirement::Merged
        );
        assert!(logs_contain("Advanced state round"));
    }

    #[test]
    fn test_requested_flush_reaches_disk() {
        let dir = TempDir::new().unwrap();
        let config = StateConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..config()
        };

        let manager = StateManager::open(&config).unwrap();
        manager.current().put("k", "v");
        manager.request_flush();
        let version = manager.advance_round().unwrap();
        manager.pipeline().wait_until_flushed(version).unwrap();
        manager.shutdown(false).unwrap();

        let reopened = StateManager::open(&config).unwrap();
        assert_eq!(reopened.current_version(), version + 1);
        assert_eq!(reopened.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_two_copy_limit_keeps_advancing() {
        let manager = Arc::new(
            StateManager::open(&StateConfig {
                max_unretired_copies: 2,
                ..config()
            })
            .unwrap(),
        );

        let (done, rounds) = channel::unbounded();
        let worker = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for round in 0..5u64 {
                    manager.current().put(format!("round-{round}"), "x");
                    done.send(manager.advance_round().unwrap()).unwrap();
                }
            })
        };

        for expected in 0..5u64 {
            let finished = rounds.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(finished, expected);
        }
        worker.join().unwrap();

        assert_eq!(manager.get(b"round-0").unwrap(), Some(b"x".to_vec()));
        assert_eq!(
            manager.pipeline().wait_until_retired(3).unwrap(),
            Retirement::Merged
        );
    }

    #[test]
    fn test_stopped_pipeline_leaves_current_writable() {
        let manager = StateManager::open(&config()).unwrap();
        manager.current().put("k", "1");
        manager.pipeline().terminate(false);

        for _ in 0..2 {
            assert!(matches!(
                manager.advance_round(),
                Err(PipelineError::Terminated)
            ));
        }
        assert_eq!(manager.current_version(), 0);
        manager.current().put("k", "2");
        assert_eq!(manager.get(b"k").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_reads_continue_while_round_waits_for_room() {
        let manager = Arc::new(
            StateManager::open(&StateConfig {
                max_unretired_copies: 2,
                ..config()
            })
            .unwrap(),
        );
        manager.current().put("k", "v");
        manager.advance_round().unwrap();

        // Nothing retires while paused, so the next round waits for room.
        let advancing = manager.pipeline().pause_and_run(|| {
            let advancing = {
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.advance_round())
            };
            thread::sleep(Duration::from_millis(30));

            assert!(!advancing.is_finished());
            assert_eq!(manager.current_version(), 1);
            assert_eq!(manager.get(b"k").unwrap(), Some(b"v".to_vec()));
            advancing
        });

        assert_eq!(advancing.join().unwrap().unwrap(), 1);
        assert_eq!(manager.current_version(), 2);
    }
}
