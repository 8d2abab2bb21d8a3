// src/lib.rs

//! Registrar - Installed Unit Registry
//!
//! Authoritative in-memory registry of the software units installed on a
//! device: per-unit metadata, per-user enablement and visibility, signing
//! identity, installer attribution, shared-library linkage, and transient
//! freeze state.
//!
//! # Architecture
//!
//! - Consistent reads: every reader gets an immutable, transaction-
//!   consistent snapshot; readers never serialize behind the write lock
//! - Optimistic commits: narrow mutations are planned against a snapshot
//!   and committed with conflict detection, retried pessimistically at
//!   most once
//! - Watched collections: every structural mutation invalidates the
//!   cached snapshot before the mutating call returns
//! - Freeze barrier: reference-counted, RAII-scoped launch blocking for
//!   units undergoing install or uninstall surgery
//!
//! Persistence, package parsing, resolution, and process management are
//! collaborators behind the registry's interfaces, not part of this
//! crate.

mod error;
pub mod registry;
pub mod units;

pub use error::{Error, Result};
pub use registry::{
    ChangeEvent, ChangeObserver, FreezeGuard, FreezeReason, MutationResult,
    NullProcessController, ProcessController, Registry, RegistryConfig, RegistryQueries,
    RegistryState, SequenceToken, Snapshot, UnitPatch, WatchedMap,
};
pub use units::{
    ComponentDecl, ComponentKind, ComponentRef, EnabledState, InstallOrigin, InstallerInfo,
    LibraryKind, ParsedMetadata, RegistryUnit, SharedLibrary, SigningInfo, UnitCategory,
    UnitUserState, UserId, OWNER_USER,
};
