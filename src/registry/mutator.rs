// src/registry/mutator.rs

//! Optimistic compare-and-commit mutation protocol
//!
//! Narrow mutations are computed against a cheap snapshot read, then
//! committed through [`Registry::commit`], which holds the write lock only
//! for the apply itself. A token captured with [`Registry::begin`] lets
//! the commit detect that any other structural change landed in between
//! and report a conflict instead of applying.
//!
//! The canonical caller pattern is [`Registry::update_unit`]: one
//! optimistic attempt, then on conflict exactly one pessimistic attempt
//! that replans and applies inside a single write-lock section. No
//! unbounded retry loops.

use crate::units::RegistryUnit;
use std::sync::atomic::Ordering;
use tracing::debug;

use super::state::RegistryQueries;
use super::Registry;

/// Opaque capture of the registry's sequence number
///
/// Record one with [`Registry::begin`] before read-then-write logic over a
/// snapshot; hand it to [`Registry::commit`] to detect intervening
/// commits. Comparing two tokens tells you whether *any* structural change
/// occurred between them, not which one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceToken {
    pub(crate) sequence: u64,
}

/// Outcome of a commit attempt
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationResult {
    /// Applied; `sequence` is the registry's new sequence number
    Committed { sequence: u64 },
    /// The token's sequence number no longer matches; nothing was applied.
    /// Recompute against a fresh snapshot and retry, or escalate to a
    /// pessimistic attempt.
    Conflict,
    /// The target unit is not in the registry; nothing was applied
    NotFound,
}

impl MutationResult {
    pub fn is_committed(&self) -> bool {
        matches!(self, MutationResult::Committed { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MutationResult::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MutationResult::NotFound)
    }
}

/// Owned mutation produced by an [`Registry::update_unit`] planner
pub type UnitPatch = Box<dyn FnOnce(&mut RegistryUnit) + Send>;

impl Registry {
    /// Capture the current sequence number without taking any lock
    pub fn begin(&self) -> SequenceToken {
        SequenceToken {
            sequence: self.inner.sequence_mirror.load(Ordering::Acquire),
        }
    }

    /// Apply a targeted mutation to one unit under the write lock
    ///
    /// With a token, the commit is rejected as [`MutationResult::Conflict`]
    /// if any other commit landed since the token was recorded. With
    /// `None` the mutation is unconditional: it applies regardless of
    /// intervening changes.
    pub fn commit<F>(&self, token: Option<SequenceToken>, name: &str, mutate: F) -> MutationResult
    where
        F: FnOnce(&mut RegistryUnit),
    {
        let sequence;
        {
            let mut state = self.inner.lock_state();
            if let Some(token) = token
                && token.sequence != state.sequence
            {
                debug!(
                    unit = name,
                    recorded = token.sequence,
                    current = state.sequence,
                    "commit conflict"
                );
                return MutationResult::Conflict;
            }
            let Some(unit) = state.unit_mut(name) else {
                return MutationResult::NotFound;
            };
            mutate(unit);
            sequence = self.finish_commit(&mut state);
        }
        self.notify_units_changed(sequence, vec![name.to_string()]);
        MutationResult::Committed { sequence }
    }

    /// Apply a mutation over the whole registry state in one locked section
    ///
    /// The bulk variant for multi-unit work: install and uninstall use
    /// this to add or remove a unit together with its component index and
    /// shared-library entries. Never returns
    /// [`MutationResult::NotFound`].
    pub fn commit_bulk<F>(&self, token: Option<SequenceToken>, mutate: F) -> MutationResult
    where
        F: FnOnce(&mut super::RegistryState),
    {
        let sequence;
        {
            let mut state = self.inner.lock_state();
            if let Some(token) = token
                && token.sequence != state.sequence
            {
                debug!(
                    recorded = token.sequence,
                    current = state.sequence,
                    "bulk commit conflict"
                );
                return MutationResult::Conflict;
            }
            mutate(&mut state);
            sequence = self.finish_commit(&mut state);
        }
        self.notify_units_changed(sequence, Vec::new());
        MutationResult::Committed { sequence }
    }

    /// Optimistic-then-pessimistic update of one unit
    ///
    /// The planner computes the intended mutation from a read-only view.
    /// First attempt: planned against a snapshot, committed with a token.
    /// On conflict, the planner runs once more against the live state
    /// inside the write lock and the result is applied in the same locked
    /// section, guaranteeing forward progress without retry loops.
    pub fn update_unit<P>(&self, name: &str, mut plan: P) -> MutationResult
    where
        P: FnMut(&dyn RegistryQueries) -> UnitPatch,
    {
        let token = self.begin();
        let snapshot = self.snapshot();
        let patch = plan(snapshot.as_ref());
        match self.commit(Some(token), name, patch) {
            MutationResult::Conflict => {}
            outcome => return outcome,
        }
        debug!(unit = name, "optimistic update lost the race, retrying pessimistically");

        let sequence;
        {
            let mut state = self.inner.lock_state();
            let patch = plan(&*state);
            let Some(unit) = state.unit_mut(name) else {
                return MutationResult::NotFound;
            };
            patch(unit);
            sequence = self.finish_commit(&mut state);
        }
        self.notify_units_changed(sequence, vec![name.to_string()]);
        MutationResult::Committed { sequence }
    }

    /// Bump the sequence number and flag the snapshot stale; caller holds
    /// the write lock
    fn finish_commit(&self, state: &mut super::RegistryState) -> u64 {
        state.sequence += 1;
        self.inner
            .sequence_mirror
            .store(state.sequence, Ordering::Release);
        self.inner.invalidator.mark();
        state.sequence
    }
}
