// src/registry/snapshot.rs

//! Immutable registry snapshots and the invalidation flag
//!
//! A [`Snapshot`] is a deep copy of every watched collection plus the
//! scalar state, taken atomically with respect to the write lock. It is
//! never mutated after construction, which is what makes it safe to hand
//! the same `Arc<Snapshot>` to any number of threads without locking.
//!
//! [`SnapshotInvalidator`] is the single global observer the watched
//! collections report to. Its callback only flips an atomic flag; it runs
//! inside the write path on every mutation and must stay that cheap.

use crate::units::{ComponentRef, RegistryUnit, SharedLibrary, UserId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::state::{RegistryState, StateStore};
use super::watched::ChangeObserver;

/// The global "cached snapshot may be stale" flag
///
/// Set by every watched-collection mutation and by the commit path;
/// cleared only by the rebuilding thread, as a single atomic exchange,
/// while it holds the snapshot lock.
#[derive(Debug, Default)]
pub(crate) struct SnapshotInvalidator {
    stale: AtomicBool,
}

impl SnapshotInvalidator {
    /// Mark the cached snapshot stale
    pub(crate) fn mark(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Atomically observe-and-clear the flag
    pub(crate) fn take(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }
}

impl ChangeObserver for SnapshotInvalidator {
    fn on_change(&self, collection: &str) {
        self.mark();
        tracing::trace!(collection, "registry collection changed");
    }
}

/// Immutable, shared read-only view of the registry as of one instant
///
/// Obtained from [`crate::registry::Registry::snapshot`]. Implements
/// [`crate::registry::RegistryQueries`] like the live state does. Two
/// snapshots taken without an intervening commit are the same `Arc`
/// (compare with `Arc::ptr_eq`), which makes staleness checks by callers
/// that cache one across a logical operation cheap.
#[derive(Debug)]
pub struct Snapshot {
    units: BTreeMap<String, RegistryUnit>,
    libraries: BTreeMap<String, SharedLibrary>,
    components: BTreeMap<String, ComponentRef>,
    frozen: BTreeMap<String, u32>,
    sequence: u64,
    known_users: Vec<UserId>,
    default_installer: Option<String>,
    /// How many times this snapshot was handed to a reader
    usage: AtomicU64,
}

impl Snapshot {
    /// Deep-copy the live state; caller must hold the write lock
    pub(crate) fn capture(state: &RegistryState) -> Self {
        Self {
            units: state.units.clone_inner(),
            libraries: state.libraries.clone_inner(),
            components: state.components.clone_inner(),
            frozen: state.frozen.clone_inner(),
            sequence: state.sequence,
            known_users: state.known_users.clone(),
            default_installer: state.default_installer.clone(),
            usage: AtomicU64::new(0),
        }
    }

    pub(crate) fn mark_used(&self) {
        self.usage.fetch_add(1, Ordering::Relaxed);
    }

    /// How many readers this snapshot has been handed to
    pub fn usage_count(&self) -> u64 {
        self.usage.load(Ordering::Relaxed)
    }
}

impl StateStore for Snapshot {
    fn units_map(&self) -> &BTreeMap<String, RegistryUnit> {
        &self.units
    }

    fn libraries_map(&self) -> &BTreeMap<String, SharedLibrary> {
        &self.libraries
    }

    fn components_map(&self) -> &BTreeMap<String, ComponentRef> {
        &self.components
    }

    fn frozen_map(&self) -> &BTreeMap<String, u32> {
        &self.frozen
    }

    fn sequence_field(&self) -> u64 {
        self.sequence
    }

    fn known_users_field(&self) -> &[UserId] {
        &self.known_users
    }

    fn default_installer_field(&self) -> Option<&str> {
        self.default_installer.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryQueries;
    use crate::units::ParsedMetadata;
    use semver::Version;
    use std::sync::Arc;

    #[test]
    fn test_invalidator_take_clears() {
        let invalidator = SnapshotInvalidator::default();
        assert!(!invalidator.take());

        invalidator.mark();
        assert!(invalidator.take());
        assert!(!invalidator.take());
    }

    #[test]
    fn test_capture_is_detached_from_live_state() {
        let invalidator: Arc<SnapshotInvalidator> = Arc::new(SnapshotInvalidator::default());
        let mut state = RegistryState::new(invalidator as Arc<dyn ChangeObserver>);
        let unit = RegistryUnit::new(
            "com.example.mail",
            Version::parse("1.0.0").unwrap(),
            Arc::new(ParsedMetadata::minimal("com.example.mail")),
        );
        state.add_unit(unit).unwrap();
        state.sequence = 1;

        let snapshot = Snapshot::capture(&state);
        state.remove_unit("com.example.mail");
        state.sequence = 2;

        assert!(snapshot.unit("com.example.mail").is_some());
        assert_eq!(snapshot.sequence(), 1);
        assert_eq!(state.unit_count(), 0);
    }

    #[test]
    fn test_usage_counter() {
        let invalidator: Arc<SnapshotInvalidator> = Arc::new(SnapshotInvalidator::default());
        let state = RegistryState::new(invalidator as Arc<dyn ChangeObserver>);
        let snapshot = Snapshot::capture(&state);

        assert_eq!(snapshot.usage_count(), 0);
        snapshot.mark_used();
        snapshot.mark_used();
        assert_eq!(snapshot.usage_count(), 2);
    }
}
