//! Scheduler that hashes, flushes and merges state copies in version order.

use crate::{PipelineConfig, PipelineError, VersionedStateRoot};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tessera_counters::ObjectCounter;
use tessera_types::Hash;
use tracing::{debug, error, info, warn};

/// Retired versions remembered for `is_flushed` and the wait methods.
const RETIREMENT_HISTORY: usize = 1024;

/// How often an idle worker re-checks a copy that is still mutable. Roots
/// become immutable without telling the pipeline.
const IMMUTABILITY_POLL: Duration = Duration::from_millis(10);

/// How a copy left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    Flushed,
    Merged,
}

/// A registered copy and what the pipeline knows about it.
struct Slot<R> {
    root: Arc<R>,
    released: bool,
    hash: Option<Hash>,
}

impl<R: VersionedStateRoot> Slot<R> {
    fn version(&self) -> u64 {
        self.root.fast_copy_version()
    }
}

/// Work the worker thread does outside the state lock.
enum Task<R> {
    Hash(Arc<R>),
    Flush(Arc<R>),
    Merge { older: Arc<R>, newer: Arc<R> },
}

struct State<R> {
    /// Registered copies, oldest first.
    copies: VecDeque<Slot<R>>,

    /// Recently retired versions.
    retired: BTreeMap<u64, (Hash, Retirement)>,

    latest_version: Option<u64>,

    /// Worker is running a task outside the lock.
    busy: bool,

    /// Outstanding `pause_and_run` calls.
    pauses: usize,

    /// `Some(immediately)` once termination was requested.
    shutdown: Option<bool>,

    /// Worker has exited.
    terminated: bool,

    /// Fatal error that stopped the pipeline.
    failure: Option<PipelineError>,
}

impl<R: VersionedStateRoot> State<R> {
    fn slot(&self, version: u64) -> Option<&Slot<R>> {
        self.copies.iter().find(|slot| slot.version() == version)
    }

    fn slot_mut(&mut self, version: u64) -> Option<&mut Slot<R>> {
        self.copies.iter_mut().find(|slot| slot.version() == version)
    }

    fn is_known(&self, version: u64) -> bool {
        self.slot(version).is_some() || self.retired.contains_key(&version)
    }

    /// Fail fast once the pipeline is stopped.
    fn check_running(&self) -> Result<(), PipelineError> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        if self.terminated || self.shutdown.is_some() {
            return Err(PipelineError::Terminated);
        }
        Ok(())
    }

    /// The oldest un-hashed copy is still mutable.
    fn awaits_immutability(&self) -> bool {
        self.copies
            .iter()
            .find(|slot| slot.hash.is_none())
            .is_some_and(|slot| !slot.root.is_immutable())
    }

    /// Error for a waiter whose condition can no longer become true.
    fn stopped(&self) -> Option<PipelineError> {
        if let Some(failure) = &self.failure {
            return Some(failure.clone());
        }
        self.terminated.then_some(PipelineError::Terminated)
    }

    /// The next task, if any is ready.
    ///
    /// Hashing comes first and always picks the oldest un-hashed copy. Copies
    /// retire strictly from the front.
    fn next_task(&self) -> Option<Task<R>> {
        if let Some(slot) = self.copies.iter().find(|slot| slot.hash.is_none()) {
            if slot.root.is_immutable() {
                return Some(Task::Hash(Arc::clone(&slot.root)));
            }
        }

        let oldest = self.copies.front()?;
        if !oldest.released || oldest.hash.is_none() {
            return None;
        }
        if oldest.root.requested_to_flush() {
            return Some(Task::Flush(Arc::clone(&oldest.root)));
        }
        let next = self.copies.get(1)?;
        next.hash.is_some().then(|| Task::Merge {
            older: Arc::clone(&oldest.root),
            newer: Arc::clone(&next.root),
        })
    }

    fn retire_front(&mut self, version: u64, how: Retirement) {
        let slot = self
            .copies
            .pop_front()
            .filter(|slot| slot.version() == version);
        let Some(Slot {
            hash: Some(hash), ..
        }) = slot
        else {
            panic!("copy {version} retired out of order");
        };

        self.retired.insert(version, (hash, how));
        while self.retired.len() > RETIREMENT_HISTORY {
            self.retired.pop_first();
        }
    }
}

struct Shared<R> {
    name: String,
    counter: Arc<dyn ObjectCounter>,
    state: Mutex<State<R>>,
    changed: Condvar,
}

impl<R: VersionedStateRoot> Shared<R> {
    fn lock(&self) -> MutexGuard<'_, State<R>> {
        self.state.lock()
    }

    /// Block until `check` yields a value.
    fn wait_for<T>(
        &self,
        mut check: impl FnMut(&State<R>) -> Option<Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        let mut state = self.lock();
        loop {
            if let Some(result) = check(&state) {
                return result;
            }
            self.changed.wait(&mut state);
        }
    }
}

/// Takes immutable state copies through hash and then flush or merge, one
/// version at a time, on a dedicated worker thread.
///
/// The owner registers each new copy with [`register_copy`](Self::register_copy)
/// and hands it over with [`release_copy`](Self::release_copy) once it no
/// longer needs it. The worker then:
///
/// 1. hashes every immutable copy that is not hashed yet, oldest first;
/// 2. retires copies from the oldest: a released, hashed copy is flushed if
///    it asked to be, and otherwise merged into the next copy once that one
///    is hashed. It stops at the first copy that cannot retire.
///
/// Every registered copy is on-ramped on the configured counter and
/// off-ramped when it retires, so a bounded counter limits how many copies
/// can wait in the pipeline.
///
/// A flush failure is fatal: the pipeline stops and every waiter gets the
/// error. A merge failure is a logic error and panics the worker in debug
/// builds.
pub struct StatePipeline<R: VersionedStateRoot> {
    shared: Arc<Shared<R>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<R: VersionedStateRoot> StatePipeline<R> {
    /// Start a pipeline whose first copy is `initial`.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn new(config: PipelineConfig, initial: Arc<R>) -> Self {
        let version = initial.fast_copy_version();
        config.counter.force_on_ramp();

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            counter: config.counter,
            state: Mutex::new(State {
                copies: VecDeque::from([Slot {
                    root: initial,
                    released: false,
                    hash: None,
                }]),
                retired: BTreeMap::new(),
                latest_version: Some(version),
                busy: false,
                pauses: 0,
                shutdown: None,
                terminated: false,
                failure: None,
            }),
            changed: Condvar::new(),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(config.name)
                .spawn(move || run_worker(&shared))
                .unwrap_or_else(|e| panic!("failed to spawn state pipeline worker: {e}"))
        };

        info!(pipeline = %shared.name, first_version = version, "State pipeline started");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Add the newest copy. Blocks while the pipeline's counter is full.
    ///
    /// # Panics
    ///
    /// Panics if `root` is not newer than every registered copy, or if the
    /// previous newest copy is still mutable.
    pub fn register_copy(&self, root: Arc<R>) -> Result<(), PipelineError> {
        {
            let state = self.shared.lock();
            state.check_running()?;
            // The caller has just frozen the newest copy. Retiring older
            // copies may wait on its hash, and that is what frees the counter.
            self.shared.changed.notify_all();
        }
        self.shared.counter.on_ramp();

        let mut state = self.shared.lock();
        if let Err(err) = state.check_running() {
            drop(state);
            self.shared.counter.off_ramp();
            return Err(err);
        }

        let version = root.fast_copy_version();
        if let Some(latest) = state.latest_version {
            assert!(
                version > latest,
                "copies must be registered in increasing version order: {version} after {latest}"
            );
        }
        if let Some(newest) = state.copies.back() {
            assert!(
                newest.root.is_immutable(),
                "copy {} must be immutable before copy {version} is registered",
                newest.version()
            );
        }

        state.copies.push_back(Slot {
            root,
            released: false,
            hash: None,
        });
        state.latest_version = Some(version);
        debug!(pipeline = %self.shared.name, version, retained = state.copies.len(), "Registered copy");
        self.shared.changed.notify_all();
        Ok(())
    }

    /// The owner no longer needs `version`; it may now be flushed or merged.
    pub fn release_copy(&self, version: u64) -> Result<(), PipelineError> {
        let mut state = self.shared.lock();
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        let slot = state
            .slot_mut(version)
            .ok_or(PipelineError::UnknownVersion(version))?;
        slot.released = true;
        debug!(pipeline = %self.shared.name, version, "Released copy");
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Block until `version` is hashed and return its hash.
    pub fn wait_until_hashed(&self, version: u64) -> Result<Hash, PipelineError> {
        self.shared.wait_for(|state| {
            if let Some(hash) = state.slot(version).and_then(|slot| slot.hash) {
                return Some(Ok(hash));
            }
            if let Some((hash, _)) = state.retired.get(&version) {
                return Some(Ok(*hash));
            }
            if !state.is_known(version) {
                return Some(Err(PipelineError::UnknownVersion(version)));
            }
            state.stopped().map(Err)
        })
    }

    /// Whether `version` has been flushed.
    pub fn is_flushed(&self, version: u64) -> bool {
        matches!(
            self.shared.lock().retired.get(&version),
            Some((_, Retirement::Flushed))
        )
    }

    /// Block until `version` has left the pipeline and report how.
    pub fn wait_until_retired(&self, version: u64) -> Result<Retirement, PipelineError> {
        self.shared.wait_for(|state| {
            if let Some((_, how)) = state.retired.get(&version) {
                return Some(Ok(*how));
            }
            if !state.is_known(version) {
                return Some(Err(PipelineError::UnknownVersion(version)));
            }
            state.stopped().map(Err)
        })
    }

    /// Block until `version` is flushed.
    ///
    /// Returns [`PipelineError::NotFlushed`] if it was merged instead.
    pub fn wait_until_flushed(&self, version: u64) -> Result<(), PipelineError> {
        match self.wait_until_retired(version)? {
            Retirement::Flushed => Ok(()),
            Retirement::Merged => Err(PipelineError::NotFlushed(version)),
        }
    }

    /// Wait until `version` is hashed, then detach it with the worker paused.
    ///
    /// The copy stays in the pipeline afterwards and retires normally.
    pub fn detach_copy(&self, version: u64, destination: &Path) -> Result<(), PipelineError> {
        self.wait_until_hashed(version)?;
        self.pause_and_run(|| {
            let root = self
                .shared
                .lock()
                .slot(version)
                .map(|slot| Arc::clone(&slot.root))
                .ok_or(PipelineError::UnknownVersion(version))?;
            root.detach(destination)
                .map_err(|source| PipelineError::Detach {
                    version,
                    source: Arc::new(source),
                })?;
            info!(
                pipeline = %self.shared.name,
                version,
                destination = %destination.display(),
                "Detached copy"
            );
            Ok(())
        })
    }

    /// Run `f` while the worker is idle and cannot start new work.
    pub fn pause_and_run<T>(&self, f: impl FnOnce() -> T) -> T {
        {
            let mut state = self.shared.lock();
            state.pauses += 1;
            while state.busy {
                self.shared.changed.wait(&mut state);
            }
        }

        let _resume = Resume(&self.shared);
        f()
    }

    /// Ask the worker to stop.
    ///
    /// With `immediately` false the worker first finishes every task that can
    /// run; otherwise it stops after the task in progress. Either way the
    /// newest remaining copy then receives `on_shutdown(immediately)`.
    pub fn terminate(&self, immediately: bool) {
        let mut state = self.shared.lock();
        let immediately = immediately || state.shutdown.unwrap_or(false);
        state.shutdown = Some(immediately);
        info!(pipeline = %self.shared.name, immediately, "Terminating state pipeline");
        self.shared.changed.notify_all();
    }

    /// Block until the worker has exited.
    ///
    /// A panic on the worker thread is resumed on the caller.
    pub fn await_termination(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(panic) = handle.join() {
                std::panic::resume_unwind(panic);
            }
        }
        let _ = self.shared.wait_for(|state| state.terminated.then_some(Ok(())));
    }

    /// Versions still registered, oldest first.
    pub fn retained_versions(&self) -> Vec<u64> {
        self.shared.lock().copies.iter().map(Slot::version).collect()
    }

    /// The fatal error that stopped the pipeline, if any.
    pub fn failure(&self) -> Option<PipelineError> {
        self.shared.lock().failure.clone()
    }

    /// `Ok` while the pipeline accepts new copies.
    pub fn ensure_running(&self) -> Result<(), PipelineError> {
        self.shared.lock().check_running()
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminated
    }
}

impl<R: VersionedStateRoot> Drop for StatePipeline<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.get_mut().take() {
            self.terminate(true);
            let _ = handle.join();
        }
    }
}

/// Lifts one pause when dropped.
struct Resume<'a, R: VersionedStateRoot>(&'a Shared<R>);

impl<R: VersionedStateRoot> Drop for Resume<'_, R> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.pauses -= 1;
        self.0.changed.notify_all();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════

fn run_worker<R: VersionedStateRoot>(shared: &Shared<R>) {
    while let Some(task) = next_task(shared) {
        run_task(shared, task);
    }
    shut_down(shared);
}

/// Wait for the next task; `None` means the worker should exit.
fn next_task<R: VersionedStateRoot>(shared: &Shared<R>) -> Option<Task<R>> {
    let mut state = shared.lock();
    loop {
        if state.failure.is_some() || state.shutdown == Some(true) {
            return None;
        }
        if state.pauses == 0 {
            if let Some(task) = state.next_task() {
                state.busy = true;
                return Some(task);
            }
            if state.shutdown.is_some() {
                return None;
            }
        }
        if state.awaits_immutability() {
            shared.changed.wait_for(&mut state, IMMUTABILITY_POLL);
        } else {
            shared.changed.wait(&mut state);
        }
    }
}

fn run_task<R: VersionedStateRoot>(shared: &Shared<R>, task: Task<R>) {
    match task {
        Task::Hash(root) => {
            let version = root.fast_copy_version();
            let hash = root.compute_hash();

            let mut state = shared.lock();
            if let Some(slot) = state.slot_mut(version) {
                slot.hash = Some(hash);
            }
            state.busy = false;
            debug!(pipeline = %shared.name, version, %hash, "Hashed copy");
        }
        Task::Flush(root) => {
            let version = root.fast_copy_version();
            let result = root.flush();

            let mut state = shared.lock();
            state.busy = false;
            match result {
                Ok(()) => {
                    state.retire_front(version, Retirement::Flushed);
                    shared.counter.off_ramp();
                    debug!(pipeline = %shared.name, version, "Flushed copy");
                }
                Err(err) => {
                    error!(pipeline = %shared.name, version, error = %err, "Flush failed, stopping state pipeline");
                    state.failure = Some(PipelineError::Flush {
                        version,
                        source: Arc::new(err),
                    });
                }
            }
        }
        Task::Merge { older, newer } => {
            let version = older.fast_copy_version();
            let result = older.merge(&newer);

            let mut state = shared.lock();
            state.busy = false;
            match result {
                Ok(()) => {
                    state.retire_front(version, Retirement::Merged);
                    shared.counter.off_ramp();
                    debug!(
                        pipeline = %shared.name,
                        version,
                        into = newer.fast_copy_version(),
                        "Merged copy"
                    );
                }
                Err(err) => {
                    error!(pipeline = %shared.name, version, error = %err, "Merge failed, stopping state pipeline");
                    state.failure = Some(PipelineError::Merge {
                        version,
                        source: err,
                    });
                }
            }
        }
    }
    shared.changed.notify_all();
}

/// Deliver `on_shutdown`, release the counter, and wake every waiter.
fn shut_down<R: VersionedStateRoot>(shared: &Shared<R>) {
    let (newest, immediately, remaining, failure) = {
        let state = shared.lock();
        (
            state.copies.back().map(|slot| Arc::clone(&slot.root)),
            state.shutdown.unwrap_or(true),
            state.copies.len(),
            state.failure.clone(),
        )
    };

    if let Some(newest) = newest {
        newest.on_shutdown(immediately);
    }
    for _ in 0..remaining {
        shared.counter.off_ramp();
    }

    {
        let mut state = shared.lock();
        state.terminated = true;
    }
    shared.changed.notify_all();

    match failure {
        Some(PipelineError::Merge { version, source }) if cfg!(debug_assertions) => {
            panic!("merge of copy {version} failed: {source}");
        }
        Some(failure) => warn!(pipeline = %shared.name, error = %failure, "State pipeline stopped"),
        None => info!(pipeline = %shared.name, remaining, "State pipeline terminated"),
    }
}
