// src/registry/freeze.rs

//! Reference-counted freeze barrier for units under surgery
//!
//! Install and uninstall pipelines freeze a unit before touching its code
//! or data so that nothing launches it mid-operation. Freezing is
//! reference counted: nested freezes of the same unit stack, and the unit
//! thaws only when the last [`FreezeGuard`] is dropped. The guard releases
//! on every exit path, including panics, so a failed operation can never
//! leave a unit permanently frozen.

use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Registry, RegistryInner};

/// Why a unit is being frozen; handed to the process controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeReason {
    Install,
    Update,
    Uninstall,
    Suspension,
}

impl FreezeReason {
    pub fn as_str(&self) -> &str {
        match self {
            FreezeReason::Install => "install",
            FreezeReason::Update => "update",
            FreezeReason::Uninstall => "uninstall",
            FreezeReason::Suspension => "suspension",
        }
    }
}

impl FromStr for FreezeReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "install" => Ok(FreezeReason::Install),
            "update" => Ok(FreezeReason::Update),
            "uninstall" => Ok(FreezeReason::Uninstall),
            "suspension" => Ok(FreezeReason::Suspension),
            _ => Err(format!("Invalid freeze reason: {}", s)),
        }
    }
}

/// Process-management collaborator asked to stop running instances of a
/// unit when it is frozen
pub trait ProcessController: Send + Sync {
    fn request_stop(&self, unit: &str, reason: FreezeReason);
}

/// Process controller that never stops anything
///
/// The default for registries constructed without a collaborator, and
/// useful in tests.
#[derive(Debug, Default)]
pub struct NullProcessController;

impl ProcessController for NullProcessController {
    fn request_stop(&self, _unit: &str, _reason: FreezeReason) {}
}

/// Scoped hold on a unit's frozen state
///
/// Obtained from [`Registry::freeze`]. Dropping the guard decrements the
/// unit's freeze count exactly once; the last drop removes the entry and
/// the unit may launch again. Must not be dropped from inside a commit
/// closure (the drop takes the write lock).
#[must_use = "the unit thaws as soon as the guard is dropped"]
#[derive(Debug)]
pub struct FreezeGuard {
    registry: Option<Arc<RegistryInner>>,
    name: String,
}

impl FreezeGuard {
    /// The unit this guard is holding frozen
    pub fn unit(&self) -> &str {
        &self.name
    }

    /// Whether this guard actually holds a freeze count
    pub fn is_armed(&self) -> bool {
        self.registry.is_some()
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        let Some(inner) = self.registry.take() else {
            return;
        };
        {
            let mut state = inner.lock_state();
            match state.frozen.get(self.name.as_str()).copied() {
                Some(1) => {
                    state.frozen.remove(self.name.as_str());
                }
                Some(count) => {
                    state.frozen.insert(self.name.clone(), count - 1);
                }
                None => {
                    warn!(unit = self.name.as_str(), "unbalanced unfreeze");
                    return;
                }
            }
        }
        debug!(unit = self.name.as_str(), "unit unfrozen");
    }
}

impl Registry {
    /// Freeze a unit for surgery and ask the process controller to stop
    /// any running instance
    ///
    /// Stacks with other freezes of the same unit. The returned guard
    /// thaws the unit when dropped.
    pub fn freeze(&self, name: &str, reason: FreezeReason) -> FreezeGuard {
        self.freeze_with_stop(name, reason, self.inner.config.stop_on_freeze)
    }

    /// Freeze a unit without stopping its running instance
    ///
    /// For callers performing surgery that does not invalidate running
    /// code (e.g. a data-only migration).
    pub fn freeze_without_stop(&self, name: &str, reason: FreezeReason) -> FreezeGuard {
        self.freeze_with_stop(name, reason, false)
    }

    /// Degenerate freezer for callers that explicitly opted out of
    /// freezing: participates in the scoped-release contract but never
    /// touches the freeze table or the process controller
    pub fn noop_freezer(&self, name: &str) -> FreezeGuard {
        FreezeGuard {
            registry: None,
            name: name.to_string(),
        }
    }

    fn freeze_with_stop(&self, name: &str, reason: FreezeReason, stop: bool) -> FreezeGuard {
        {
            let mut state = self.inner.lock_state();
            let count = state.frozen.get(name).copied().unwrap_or(0);
            state.frozen.insert(name.to_string(), count + 1);
        }
        if stop {
            self.inner.process_controller.request_stop(name, reason);
        }
        debug!(unit = name, reason = reason.as_str(), "unit frozen");
        FreezeGuard {
            registry: Some(self.inner.clone()),
            name: name.to_string(),
        }
    }
}
