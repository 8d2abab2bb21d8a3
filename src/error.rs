// src/error.rs

//! Error types for registry operations
//!
//! Everything here is a recoverable rejection a caller is expected to
//! handle. Commit races and missing commit targets are not errors at all;
//! they are variants of [`crate::registry::MutationResult`]. Contract
//! violations (reentrant lock acquisition) panic instead of returning.

use thiserror::Error;

/// Errors surfaced by registry operations
#[derive(Debug, Error)]
pub enum Error {
    /// The unit is currently frozen for surgery and must not be launched
    #[error("Unit is frozen: {0}")]
    UnitFrozen(String),

    /// The named unit is not in the registry
    #[error("Unknown unit: {0}")]
    UnknownUnit(String),

    /// The user id is not known to the registry
    #[error("Unknown user: {0}")]
    UnknownUser(u32),

    /// A unit with this name is already registered
    #[error("Unit already registered: {0}")]
    DuplicateUnit(String),
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, Error>;
