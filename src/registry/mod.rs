// src/registry/mod.rs

//! The unit registry: consistent reads, optimistic commits, freeze barrier
//!
//! [`Registry`] owns the authoritative state of all installed units and is
//! the only way collaborators touch it. Two locks protect it:
//!
//! - the **write lock** over [`RegistryState`], held by every mutation;
//! - the **snapshot lock**, serializing the check-invalidation/rebuild
//!   sequence among readers.
//!
//! The snapshot lock is always acquired *before* the write lock, never
//! after. This ordering is a hard invariant; violating it could deadlock
//! the rebuild path against a writer.
//!
//! Readers call [`Registry::snapshot`] and get an immutable, transaction-
//! consistent [`Snapshot`] shared by all concurrent readers until the next
//! commit invalidates it. Writers go through the commit protocol
//! ([`Registry::commit`], [`Registry::commit_bulk`]), or freeze units for
//! surgery through [`Registry::freeze`].
//!
//! # Example
//!
//! ```
//! use registrar::{Registry, RegistryConfig, RegistryQueries, RegistryUnit, ParsedMetadata};
//! use semver::Version;
//! use std::sync::Arc;
//!
//! let registry = Registry::new(RegistryConfig::new());
//! let result = registry.commit_bulk(None, |state| {
//!     let unit = RegistryUnit::new(
//!         "com.example.mail",
//!         Version::parse("1.0.0").unwrap(),
//!         Arc::new(ParsedMetadata::minimal("com.example.mail")),
//!     );
//!     state.add_unit(unit).unwrap();
//! });
//! assert!(result.is_committed());
//!
//! let snapshot = registry.snapshot();
//! assert!(snapshot.unit("com.example.mail").is_some());
//! ```

mod freeze;
mod mutator;
mod snapshot;
mod state;
mod watched;

pub use freeze::{FreezeGuard, FreezeReason, NullProcessController, ProcessController};
pub use mutator::{MutationResult, SequenceToken, UnitPatch};
pub use snapshot::Snapshot;
pub use state::{qualified_component, RegistryQueries, RegistryState};
pub use watched::{ChangeObserver, WatchedMap};

use crate::error::Result;
use crate::units::UserId;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use snapshot::SnapshotInvalidator;

/// Registry construction knobs
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Users present at construction; user creation later goes through a
    /// bulk commit
    pub initial_users: Vec<UserId>,
    /// Whether `freeze` asks the process controller to stop running
    /// instances
    pub stop_on_freeze: bool,
    /// Log snapshot rebuild latency and usage counts
    pub snapshot_diagnostics: bool,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self {
            initial_users: vec![crate::units::OWNER_USER],
            stop_on_freeze: true,
            snapshot_diagnostics: true,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Event delivered to `on_units_changed` listeners after a successful
/// commit
///
/// `units` names the mutated units for targeted commits; bulk commits
/// cannot name what they touched, so they deliver an empty list.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Sequence number the commit produced
    pub sequence: u64,
    pub units: Vec<String>,
}

type ChangeListener = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// The authoritative registry of installed software units
///
/// Cheap to clone; clones share the same state. All mutation goes through
/// the commit protocol, all shared reading through [`Registry::snapshot`].
#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    /// The write lock and the state it protects
    state: Mutex<RegistryState>,
    /// The snapshot lock and the cached snapshot it protects
    cache: Mutex<Option<Arc<Snapshot>>>,
    /// Single global observer all watched collections report to
    pub(crate) invalidator: Arc<SnapshotInvalidator>,
    /// Lock-free mirror of the sequence number, for token capture
    pub(crate) sequence_mirror: AtomicU64,
    /// Token of the thread currently holding the write lock, 0 if none
    write_owner: AtomicU64,
    listeners: RwLock<Vec<ChangeListener>>,
    pub(crate) config: RegistryConfig,
    pub(crate) process_controller: Arc<dyn ProcessController>,
}

impl std::fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryInner")
            .field("sequence_mirror", &self.sequence_mirror)
            .field("write_owner", &self.write_owner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Write-lock guard that tracks its owning thread, so reentrant
/// acquisition is caught as a contract violation instead of deadlocking
pub(crate) struct StateGuard<'a> {
    owner: &'a AtomicU64,
    guard: MutexGuard<'a, RegistryState>,
}

impl Deref for StateGuard<'_> {
    type Target = RegistryState;

    fn deref(&self) -> &RegistryState {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut RegistryState {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.owner.store(0, Ordering::Release);
    }
}

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

impl RegistryInner {
    /// Acquire the write lock
    ///
    /// Panics if the calling thread already holds it: the write path hands
    /// live state to its closures, so a reentrant acquisition is always a
    /// programming error and would otherwise deadlock.
    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        self.assert_not_write_owner("lock_state");
        let guard = self.state.lock();
        self.write_owner
            .store(current_thread_token(), Ordering::Release);
        StateGuard {
            owner: &self.write_owner,
            guard,
        }
    }

    pub(crate) fn assert_not_write_owner(&self, operation: &str) {
        if self.write_owner.load(Ordering::Acquire) == current_thread_token() {
            error!(operation, "reentrant registry access from the write path");
            panic!(
                "registry {}() called while the calling thread holds the write lock; \
                 commit closures must use the state they were given",
                operation
            );
        }
    }
}

impl Registry {
    /// Create a registry with no process-management collaborator
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_process_controller(config, Arc::new(NullProcessController))
    }

    /// Create a registry that delegates stop requests for frozen units to
    /// `controller`
    pub fn with_process_controller(
        config: RegistryConfig,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        let invalidator = Arc::new(SnapshotInvalidator::default());
        let mut state = RegistryState::new(invalidator.clone() as Arc<dyn ChangeObserver>);
        for user in &config.initial_users {
            state.add_user(*user);
        }

        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(state),
                cache: Mutex::new(None),
                invalidator,
                sequence_mirror: AtomicU64::new(0),
                write_owner: AtomicU64::new(0),
                listeners: RwLock::new(Vec::new()),
                config,
                process_controller: controller,
            }),
        }
    }

    /// A transactionally consistent, immutable view of the registry
    ///
    /// Returns the cached snapshot when nothing changed since it was
    /// built; this is the allocation-free common path. Otherwise exactly
    /// one rebuild runs, under both locks, and the fresh snapshot is
    /// shared with every subsequent reader until the next commit. Two
    /// calls with no intervening commit return the identical `Arc`.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.assert_not_write_owner("snapshot");

        // Snapshot lock first, write lock (inside the rebuild) second.
        let mut cache = self.inner.cache.lock();
        let was_stale = self.inner.invalidator.take();
        if !was_stale && let Some(snapshot) = cache.as_ref() {
            snapshot.mark_used();
            return snapshot.clone();
        }

        // Null the cache before copying: if the deep copy panics, the next
        // caller must rebuild rather than be handed the superseded
        // snapshot (these locks do not poison).
        let prior_usage = cache.as_ref().map(|s| s.usage_count()).unwrap_or(0);
        *cache = None;

        let started = Instant::now();
        let snapshot = {
            let state = self.inner.lock_state();
            Arc::new(Snapshot::capture(&state))
        };
        *cache = Some(snapshot.clone());

        if self.inner.config.snapshot_diagnostics {
            debug!(
                elapsed_us = started.elapsed().as_micros() as u64,
                prior_usage,
                sequence = snapshot.sequence(),
                "rebuilt registry snapshot"
            );
        }
        snapshot.mark_used();
        snapshot
    }

    /// Register a listener invoked after every successful commit
    ///
    /// Listeners run outside the write lock, on the committing thread.
    /// They must be fast and must not register further listeners from
    /// inside the callback.
    pub fn on_units_changed<F>(&self, listener: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.write().push(Box::new(listener));
    }

    pub(crate) fn notify_units_changed(&self, sequence: u64, units: Vec<String>) {
        let event = ChangeEvent { sequence, units };
        let listeners = self.inner.listeners.read();
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Launch gate: reject launching a unit that is missing or frozen
    pub fn ensure_launchable(&self, name: &str) -> Result<()> {
        self.snapshot().ensure_launchable(name)
    }
}
