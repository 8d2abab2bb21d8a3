// src/units/mod.rs

//! Data model for installed software units
//!
//! A [`RegistryUnit`] is the registry's record of one installed unit:
//! identity, version, signing identity, installer attribution, a shared
//! reference to its parsed metadata, and mutable per-user state. Units are
//! owned exclusively by the registry state; snapshots hold deep copies,
//! never references.
//!
//! `ParsedMetadata` is immutable after parse, so it is shared between the
//! live state and snapshots through an `Arc` instead of being copied.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// Per-user identifier. User 0 is the device owner.
pub type UserId = u32;

/// The device owner user, present on every device.
pub const OWNER_USER: UserId = 0;

/// Distraction flag: hide the unit's launcher icon.
pub const DISTRACTION_HIDE_ICON: u32 = 1 << 0;

/// Distraction flag: hide the unit's notifications.
pub const DISTRACTION_HIDE_NOTIFICATIONS: u32 = 1 << 1;

/// Per-user enablement override for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnabledState {
    /// No override; the unit's own metadata decides (enabled)
    #[default]
    Default,
    /// Explicitly enabled
    Enabled,
    /// Disabled by policy or an installer
    Disabled,
    /// Disabled by the user themselves
    DisabledUser,
}

impl EnabledState {
    /// Whether this state resolves to "may be launched"
    pub fn is_enabled(&self) -> bool {
        matches!(self, EnabledState::Default | EnabledState::Enabled)
    }

    pub fn as_str(&self) -> &str {
        match self {
            EnabledState::Default => "default",
            EnabledState::Enabled => "enabled",
            EnabledState::Disabled => "disabled",
            EnabledState::DisabledUser => "disabled-user",
        }
    }
}

impl FromStr for EnabledState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "default" => Ok(EnabledState::Default),
            "enabled" => Ok(EnabledState::Enabled),
            "disabled" => Ok(EnabledState::Disabled),
            "disabled-user" => Ok(EnabledState::DisabledUser),
            _ => Err(format!("Invalid enabled state: {}", s)),
        }
    }
}

/// How a unit originally arrived on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstallOrigin {
    /// Installed by an explicit user action
    User,
    /// Preloaded during device setup
    DeviceSetup,
    /// Restored from a backup of another device
    Restore,
    #[default]
    Unknown,
}

impl InstallOrigin {
    pub fn as_str(&self) -> &str {
        match self {
            InstallOrigin::User => "user",
            InstallOrigin::DeviceSetup => "device-setup",
            InstallOrigin::Restore => "restore",
            InstallOrigin::Unknown => "unknown",
        }
    }
}

/// Coarse category a unit presents itself under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitCategory {
    Game,
    Audio,
    Video,
    Image,
    Social,
    News,
    Maps,
    Productivity,
    Accessibility,
}

/// Kind of a declared component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    /// User-facing entry point
    Activity,
    /// Long-running background work
    Service,
    /// Data provider queried by other units
    Provider,
    /// Event receiver
    Receiver,
}

/// One component declared in a unit's metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDecl {
    /// Component name, unique within the declaring unit
    pub name: String,
    pub kind: ComponentKind,
    /// Whether other units may address this component
    pub exported: bool,
}

/// Entry in the registry's component index: which unit owns a component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRef {
    pub unit: String,
    pub kind: ComponentKind,
}

/// Kind of a shared library exposed to other units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LibraryKind {
    /// Shipped with the platform image
    Builtin,
    /// Provided by an installed unit, loaded at runtime
    Dynamic,
    /// Linked into dependents at install time
    Static,
}

/// A shared library known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedLibrary {
    /// Library name dependents declare against
    pub name: String,
    pub version: Version,
    /// Unit that provides the implementation
    pub provider: String,
    pub kind: LibraryKind,
}

/// Immutable parsed metadata of a unit
///
/// Produced by the (external) parsing pipeline once per install/update and
/// never mutated afterwards, which is what makes sharing it by `Arc`
/// between live state and snapshots safe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMetadata {
    /// Unit name this metadata was parsed for
    pub unit_name: String,
    /// Components the unit declares
    pub components: Vec<ComponentDecl>,
    /// Shared libraries the unit links against
    pub declared_libraries: Vec<String>,
    /// Category the unit declares for itself
    pub category: Option<UnitCategory>,
    /// Splash theme the unit declares, overridable per user
    pub splash_theme: Option<String>,
}

impl ParsedMetadata {
    /// Minimal metadata for a unit with no components or libraries
    pub fn minimal(unit_name: &str) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            components: Vec::new(),
            declared_libraries: Vec::new(),
            category: None,
            splash_theme: None,
        }
    }
}

/// Signing identity of a unit
///
/// The digest lineage holds hex SHA-256 digests of the signing
/// certificates, oldest first; the last entry is the current signer.
/// Rotated-away signers stay in the lineage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningInfo {
    pub cert_digests: Vec<String>,
    pub scheme_version: u32,
}

impl SigningInfo {
    pub fn new(digest: impl Into<String>, scheme_version: u32) -> Self {
        Self {
            cert_digests: vec![digest.into()],
            scheme_version,
        }
    }

    /// The current signing certificate digest, if any
    pub fn current_signer(&self) -> Option<&str> {
        self.cert_digests.last().map(|s| s.as_str())
    }

    /// Whether two units share a current signer
    pub fn same_signer(&self, other: &SigningInfo) -> bool {
        match (self.current_signer(), other.current_signer()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Record a key rotation to a new certificate digest
    pub fn rotate_to(&mut self, digest: impl Into<String>) {
        self.cert_digests.push(digest.into());
    }
}

/// Who installed a unit and on whose behalf
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerInfo {
    /// Unit that performed the install (e.g. a store client)
    pub installing_unit: Option<String>,
    /// Unit that initiated the install, if different (e.g. a browser
    /// handing off to the store client)
    pub initiating_unit: Option<String>,
    pub origin: InstallOrigin,
}

/// Mutable per-user state of one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitUserState {
    /// Whether the unit is installed for this user
    pub installed: bool,
    pub enabled: EnabledState,
    /// Hidden from launchers and queries for this user
    pub hidden: bool,
    /// Suspended by `suspending_agent`; launches are blocked
    pub suspended: bool,
    /// Unit that suspended this one, when `suspended` is set
    pub suspending_agent: Option<String>,
    /// Bitmask of `DISTRACTION_*` flags
    pub distraction_flags: u32,
    /// Per-user category override, wins over metadata
    pub category_override: Option<UnitCategory>,
    /// Per-user splash theme override, wins over metadata
    pub splash_override: Option<String>,
}

impl Default for UnitUserState {
    fn default() -> Self {
        Self {
            installed: true,
            enabled: EnabledState::Default,
            hidden: false,
            suspended: false,
            suspending_agent: None,
            distraction_flags: 0,
            category_override: None,
            splash_override: None,
        }
    }
}

/// One installed software unit as recorded by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryUnit {
    name: String,
    version: Version,
    pub signing: SigningInfo,
    pub installer: InstallerInfo,
    metadata: Arc<ParsedMetadata>,
    user_state: BTreeMap<UserId, UnitUserState>,
    pub first_install_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl RegistryUnit {
    /// Create a unit record at install time
    pub fn new(name: impl Into<String>, version: Version, metadata: Arc<ParsedMetadata>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            version,
            signing: SigningInfo::default(),
            installer: InstallerInfo::default(),
            metadata,
            user_state: BTreeMap::new(),
            first_install_time: now,
            last_update_time: now,
        }
    }

    pub fn with_signing(mut self, signing: SigningInfo) -> Self {
        self.signing = signing;
        self
    }

    pub fn with_installer(mut self, installer: InstallerInfo) -> Self {
        self.installer = installer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn metadata(&self) -> &Arc<ParsedMetadata> {
        &self.metadata
    }

    /// Record an update to a new version and metadata
    pub fn record_update(&mut self, version: Version, metadata: Arc<ParsedMetadata>) {
        self.version = version;
        self.metadata = metadata;
        self.last_update_time = Utc::now();
    }

    /// Per-user state, if the unit has any for this user
    pub fn user_state(&self, user: UserId) -> Option<&UnitUserState> {
        self.user_state.get(&user)
    }

    /// Per-user state, created with defaults on first touch
    pub fn user_state_mut(&mut self, user: UserId) -> &mut UnitUserState {
        self.user_state.entry(user).or_default()
    }

    /// Users this unit has per-user state for
    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.user_state.keys().copied()
    }

    /// Drop all per-user state for a removed user
    pub fn forget_user(&mut self, user: UserId) {
        self.user_state.remove(&user);
    }

    pub fn set_installed(&mut self, user: UserId, installed: bool) {
        self.user_state_mut(user).installed = installed;
    }

    pub fn set_enabled(&mut self, user: UserId, enabled: EnabledState) {
        self.user_state_mut(user).enabled = enabled;
    }

    pub fn set_hidden(&mut self, user: UserId, hidden: bool) {
        self.user_state_mut(user).hidden = hidden;
    }

    /// Suspend the unit for a user on behalf of `agent`
    pub fn suspend(&mut self, user: UserId, agent: impl Into<String>) {
        let state = self.user_state_mut(user);
        state.suspended = true;
        state.suspending_agent = Some(agent.into());
    }

    pub fn unsuspend(&mut self, user: UserId) {
        let state = self.user_state_mut(user);
        state.suspended = false;
        state.suspending_agent = None;
    }

    pub fn set_distraction_flags(&mut self, user: UserId, flags: u32) {
        self.user_state_mut(user).distraction_flags = flags;
    }

    pub fn set_category_override(&mut self, user: UserId, category: Option<UnitCategory>) {
        self.user_state_mut(user).category_override = category;
    }

    pub fn set_splash_override(&mut self, user: UserId, splash: Option<String>) {
        self.user_state_mut(user).splash_override = splash;
    }

    /// Whether the unit is installed for a user (no state means no)
    pub fn is_installed_for(&self, user: UserId) -> bool {
        self.user_state(user).map(|s| s.installed).unwrap_or(false)
    }

    /// Whether the unit may be launched by this user: installed, not
    /// disabled, not suspended
    pub fn is_enabled_for(&self, user: UserId) -> bool {
        match self.user_state(user) {
            Some(s) => s.installed && s.enabled.is_enabled() && !s.suspended,
            None => false,
        }
    }

    /// Whether the unit shows up in queries for this user
    pub fn is_visible_for(&self, user: UserId) -> bool {
        match self.user_state(user) {
            Some(s) => s.installed && !s.hidden,
            None => false,
        }
    }

    /// Effective category for a user: override first, then metadata
    pub fn category_for(&self, user: UserId) -> Option<UnitCategory> {
        self.user_state(user)
            .and_then(|s| s.category_override)
            .or(self.metadata.category)
    }

    /// Effective splash theme for a user: override first, then metadata
    pub fn splash_for(&self, user: UserId) -> Option<&str> {
        if let Some(theme) = self.user_state(user).and_then(|s| s.splash_override.as_deref()) {
            return Some(theme);
        }
        self.metadata.splash_theme.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_unit(name: &str, version: &str) -> RegistryUnit {
        RegistryUnit::new(
            name,
            Version::parse(version).unwrap(),
            Arc::new(ParsedMetadata::minimal(name)),
        )
    }

    #[test]
    fn test_user_state_defaults() {
        let mut unit = make_unit("com.example.mail", "1.0.0");
        assert!(!unit.is_installed_for(OWNER_USER));

        unit.set_installed(OWNER_USER, true);
        assert!(unit.is_installed_for(OWNER_USER));
        assert!(unit.is_enabled_for(OWNER_USER));
        assert!(unit.is_visible_for(OWNER_USER));
    }

    #[test]
    fn test_disable_blocks_launch_but_not_visibility() {
        let mut unit = make_unit("com.example.mail", "1.0.0");
        unit.set_installed(OWNER_USER, true);
        unit.set_enabled(OWNER_USER, EnabledState::DisabledUser);

        assert!(!unit.is_enabled_for(OWNER_USER));
        assert!(unit.is_visible_for(OWNER_USER));
    }

    #[test]
    fn test_suspend_round_trip() {
        let mut unit = make_unit("com.example.game", "2.1.0");
        unit.set_installed(OWNER_USER, true);

        unit.suspend(OWNER_USER, "com.example.wellbeing");
        assert!(!unit.is_enabled_for(OWNER_USER));
        assert_eq!(
            unit.user_state(OWNER_USER).unwrap().suspending_agent.as_deref(),
            Some("com.example.wellbeing")
        );

        unit.unsuspend(OWNER_USER);
        assert!(unit.is_enabled_for(OWNER_USER));
        assert!(unit.user_state(OWNER_USER).unwrap().suspending_agent.is_none());
    }

    #[test]
    fn test_hidden_blocks_visibility() {
        let mut unit = make_unit("com.example.game", "2.1.0");
        unit.set_installed(OWNER_USER, true);
        unit.set_hidden(OWNER_USER, true);

        assert!(!unit.is_visible_for(OWNER_USER));
        // Hiding is per user
        unit.set_installed(7, true);
        assert!(unit.is_visible_for(7));
    }

    #[test]
    fn test_category_override_wins() {
        let metadata = ParsedMetadata {
            category: Some(UnitCategory::Productivity),
            ..ParsedMetadata::minimal("com.example.notes")
        };
        let mut unit =
            RegistryUnit::new("com.example.notes", Version::parse("1.0.0").unwrap(), Arc::new(metadata));

        assert_eq!(unit.category_for(OWNER_USER), Some(UnitCategory::Productivity));
        unit.set_category_override(OWNER_USER, Some(UnitCategory::Game));
        assert_eq!(unit.category_for(OWNER_USER), Some(UnitCategory::Game));
        unit.set_category_override(OWNER_USER, None);
        assert_eq!(unit.category_for(OWNER_USER), Some(UnitCategory::Productivity));
    }

    #[test]
    fn test_record_update_bumps_version_and_time() {
        let mut unit = make_unit("com.example.mail", "1.0.0");
        let before = unit.last_update_time;

        unit.record_update(
            Version::parse("1.1.0").unwrap(),
            Arc::new(ParsedMetadata::minimal("com.example.mail")),
        );
        assert_eq!(unit.version(), &Version::parse("1.1.0").unwrap());
        assert!(unit.last_update_time >= before);
    }

    #[test]
    fn test_signing_rotation() {
        let mut signing = SigningInfo::new("aa".repeat(32), 3);
        assert_eq!(signing.current_signer(), Some("aa".repeat(32).as_str()));

        signing.rotate_to("bb".repeat(32));
        assert_eq!(signing.current_signer(), Some("bb".repeat(32).as_str()));
        assert_eq!(signing.cert_digests.len(), 2);

        let other = SigningInfo::new("bb".repeat(32), 3);
        assert!(signing.same_signer(&other));
    }

    #[test]
    fn test_enabled_state_parse() {
        assert_eq!("disabled-user".parse::<EnabledState>().unwrap(), EnabledState::DisabledUser);
        assert!("bogus".parse::<EnabledState>().is_err());
        assert_eq!(EnabledState::Enabled.as_str(), "enabled");
    }
}
