// src/registry/state.rs

//! Authoritative registry state and the shared read-only query surface
//!
//! [`RegistryState`] is the truth: the watched collections (units, shared
//! libraries, component index, freeze table) plus scalar fields (sequence
//! number, known users, default installer). It is only ever mutated under
//! the registry's write lock; commit closures receive it directly and so
//! read their own writes at zero copy cost.
//!
//! [`RegistryQueries`] is the read-only view both the live state and
//! [`crate::registry::Snapshot`] expose. Callers never need to know which
//! variant they hold.

use crate::error::{Error, Result};
use crate::units::{ComponentRef, RegistryUnit, SharedLibrary, UserId};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::watched::{ChangeObserver, WatchedMap};

/// The authoritative, lock-protected registry state
#[derive(Debug)]
pub struct RegistryState {
    pub(crate) units: WatchedMap<String, RegistryUnit>,
    pub(crate) libraries: WatchedMap<String, SharedLibrary>,
    pub(crate) components: WatchedMap<String, ComponentRef>,
    pub(crate) frozen: WatchedMap<String, u32>,
    /// Bumped exactly once per successful structural commit
    pub(crate) sequence: u64,
    pub(crate) known_users: Vec<UserId>,
    pub(crate) default_installer: Option<String>,
}

impl RegistryState {
    pub(crate) fn new(observer: Arc<dyn ChangeObserver>) -> Self {
        Self {
            units: WatchedMap::new("units", observer.clone()),
            libraries: WatchedMap::new("libraries", observer.clone()),
            components: WatchedMap::new("components", observer.clone()),
            frozen: WatchedMap::new("frozen", observer),
            sequence: 0,
            known_users: vec![crate::units::OWNER_USER],
            default_installer: None,
        }
    }

    /// Register a new unit and index its declared components
    ///
    /// Used by the install pipeline inside a bulk commit.
    pub fn add_unit(&mut self, unit: RegistryUnit) -> Result<()> {
        if self.units.contains_key(unit.name()) {
            return Err(Error::DuplicateUnit(unit.name().to_string()));
        }

        let name = unit.name().to_string();
        for component in &unit.metadata().components {
            self.components.insert(
                qualified_component(&name, &component.name),
                ComponentRef {
                    unit: name.clone(),
                    kind: component.kind,
                },
            );
        }
        self.units.insert(name, unit);
        Ok(())
    }

    /// Remove a unit, its component index entries, and the shared
    /// libraries it provided
    ///
    /// Used by the uninstall pipeline inside a bulk commit. Returns the
    /// removed record so the caller can archive it.
    pub fn remove_unit(&mut self, name: &str) -> Option<RegistryUnit> {
        let removed = self.units.remove(name)?;
        self.components.retain(|_, r| r.unit != name);
        self.libraries.retain(|_, lib| lib.provider != name);
        Some(removed)
    }

    /// Mutable access to a unit's live record
    pub fn unit_mut(&mut self, name: &str) -> Option<&mut RegistryUnit> {
        self.units.get_mut(name)
    }

    /// Register a shared library, keyed by name
    pub fn add_library(&mut self, library: SharedLibrary) {
        self.libraries.insert(library.name.clone(), library);
    }

    pub fn remove_library(&mut self, name: &str) -> Option<SharedLibrary> {
        self.libraries.remove(name)
    }

    /// Record a newly created user
    pub fn add_user(&mut self, user: UserId) {
        if !self.known_users.contains(&user) {
            self.known_users.push(user);
        }
    }

    /// Remove a user and prune all per-unit state for them
    pub fn remove_user(&mut self, user: UserId) {
        self.known_users.retain(|u| *u != user);
        let names: Vec<String> = self.units.keys().cloned().collect();
        for name in names {
            if let Some(unit) = self.units.get_mut(&name) {
                unit.forget_user(user);
            }
        }
    }

    pub fn set_default_installer(&mut self, installer: Option<String>) {
        self.default_installer = installer;
    }
}

/// Qualified component name used as the component index key
pub fn qualified_component(unit: &str, component: &str) -> String {
    format!("{}/{}", unit, component)
}

/// Storage accessor shared by the live state and snapshots; lets the
/// query logic below be written once
pub(crate) trait StateStore {
    fn units_map(&self) -> &BTreeMap<String, RegistryUnit>;
    fn libraries_map(&self) -> &BTreeMap<String, SharedLibrary>;
    fn components_map(&self) -> &BTreeMap<String, ComponentRef>;
    fn frozen_map(&self) -> &BTreeMap<String, u32>;
    fn sequence_field(&self) -> u64;
    fn known_users_field(&self) -> &[UserId];
    fn default_installer_field(&self) -> Option<&str>;
}

impl StateStore for RegistryState {
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

/// Read-only query surface over registry state
///
/// Implemented by both the live state (valid only inside a commit
/// closure) and by [`crate::registry::Snapshot`] (valid anywhere, shared
/// between threads without locking).
pub trait RegistryQueries {
    /// Look up a unit by name
    fn unit(&self, name: &str) -> Option<&RegistryUnit>;

    /// All units, in name order
    fn units(&self) -> Box<dyn Iterator<Item = &RegistryUnit> + '_>;

    fn unit_count(&self) -> usize;

    /// Sequence number of the state this view reflects
    fn sequence(&self) -> u64;

    /// Users known to the registry
    fn known_users(&self) -> &[UserId];

    /// Default installer unit, if one is configured
    fn default_installer(&self) -> Option<&str>;

    /// Whether the unit is currently frozen for surgery
    fn is_frozen(&self, name: &str) -> bool;

    /// Names of all currently frozen units
    fn frozen_units(&self) -> Vec<&str>;

    /// Look up a shared library by name
    fn library(&self, name: &str) -> Option<&SharedLibrary>;

    /// Units whose metadata declares a dependency on the library
    fn library_dependents(&self, library: &str) -> Vec<&str>;

    /// Resolve a qualified component name ("unit/component")
    fn resolve_component(&self, qualified: &str) -> Option<&ComponentRef>;

    /// Units installed and visible for a user, in name order
    fn visible_units(&self, user: UserId) -> Result<Vec<&RegistryUnit>>;

    /// Reject launching a unit that is missing or frozen
    fn ensure_launchable(&self, name: &str) -> Result<()> {
        if self.unit(name).is_none() {
            return Err(Error::UnknownUnit(name.to_string()));
        }
        if self.is_frozen(name) {
            return Err(Error::UnitFrozen(name.to_string()));
        }
        Ok(())
    }
}

impl<T: StateStore> RegistryQueries for T {
    fn unit(&self, name: &str) -> Option<&RegistryUnit> {
        self.units_map().get(name)
    }

    fn units(&self) -> Box<dyn Iterator<Item = &RegistryUnit> + '_> {
        Box::new(self.units_map().values())
    }

    fn unit_count(&self) -> usize {
        self.units_map().len()
    }

    fn sequence(&self) -> u64 {
        self.sequence_field()
    }

    fn known_users(&self) -> &[UserId] {
        self.known_users_field()
    }

    fn default_installer(&self) -> Option<&str> {
        self.default_installer_field()
    }

    fn is_frozen(&self, name: &str) -> bool {
        self.frozen_map().get(name).copied().unwrap_or(0) > 0
    }

    fn frozen_units(&self) -> Vec<&str> {
        self.frozen_map()
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    fn library(&self, name: &str) -> Option<&SharedLibrary> {
        self.libraries_map().get(name)
    }

    fn library_dependents(&self, library: &str) -> Vec<&str> {
        self.units_map()
            .values()
            .filter(|unit| {
                unit.metadata()
                    .declared_libraries
                    .iter()
                    .any(|dep| dep == library)
            })
            .map(|unit| unit.name())
            .collect()
    }

    fn resolve_component(&self, qualified: &str) -> Option<&ComponentRef> {
        self.components_map().get(qualified)
    }

    fn visible_units(&self, user: UserId) -> Result<Vec<&RegistryUnit>> {
        if !self.known_users_field().contains(&user) {
            return Err(Error::UnknownUser(user));
        }
        Ok(self
            .units_map()
            .values()
            .filter(|unit| unit.is_visible_for(user))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{
        ComponentDecl, ComponentKind, LibraryKind, ParsedMetadata, OWNER_USER,
    };
    use semver::Version;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        changes: AtomicUsize,
    }

    impl ChangeObserver for CountingObserver {
        fn on_change(&self, _collection: &str) {
            self.changes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn make_state() -> (RegistryState, Arc<CountingObserver>) {
        let observer = Arc::new(CountingObserver::default());
        let state = RegistryState::new(observer.clone() as Arc<dyn ChangeObserver>);
        (state, observer)
    }

    fn make_unit(name: &str) -> RegistryUnit {
        let metadata = ParsedMetadata {
            components: vec![ComponentDecl {
                name: "Main".to_string(),
                kind: ComponentKind::Activity,
                exported: true,
            }],
            declared_libraries: vec!["libmedia".to_string()],
            ..ParsedMetadata::minimal(name)
        };
        let mut unit = RegistryUnit::new(name, Version::parse("1.0.0").unwrap(), Arc::new(metadata));
        unit.set_installed(OWNER_USER, true);
        unit
    }

    #[test]
    fn test_add_unit_indexes_components() {
        let (mut state, _) = make_state();
        state.add_unit(make_unit("com.example.mail")).unwrap();

        let component = state.resolve_component("com.example.mail/Main").unwrap();
        assert_eq!(component.unit, "com.example.mail");
        assert_eq!(component.kind, ComponentKind::Activity);
    }

    #[test]
    fn test_add_duplicate_unit_rejected() {
        let (mut state, _) = make_state();
        state.add_unit(make_unit("com.example.mail")).unwrap();

        let result = state.add_unit(make_unit("com.example.mail"));
        assert!(matches!(result, Err(Error::DuplicateUnit(_))));
        assert_eq!(state.unit_count(), 1);
    }

    #[test]
    fn test_remove_unit_cleans_index_and_libraries() {
        let (mut state, _) = make_state();
        state.add_unit(make_unit("com.example.media")).unwrap();
        state.add_library(SharedLibrary {
            name: "libmedia".to_string(),
            version: Version::parse("2.0.0").unwrap(),
            provider: "com.example.media".to_string(),
            kind: LibraryKind::Dynamic,
        });

        let removed = state.remove_unit("com.example.media").unwrap();
        assert_eq!(removed.name(), "com.example.media");
        assert!(state.resolve_component("com.example.media/Main").is_none());
        assert!(state.library("libmedia").is_none());
    }

    #[test]
    fn test_library_dependents() {
        let (mut state, _) = make_state();
        state.add_unit(make_unit("com.example.a")).unwrap();
        state.add_unit(make_unit("com.example.b")).unwrap();

        let dependents = state.library_dependents("libmedia");
        assert_eq!(dependents, vec!["com.example.a", "com.example.b"]);
        assert!(state.library_dependents("libother").is_empty());
    }

    #[test]
    fn test_visible_units_unknown_user() {
        let (state, _) = make_state();
        assert!(matches!(state.visible_units(99), Err(Error::UnknownUser(99))));
    }

    #[test]
    fn test_remove_user_prunes_unit_state() {
        let (mut state, _) = make_state();
        state.add_user(7);
        state.add_unit(make_unit("com.example.mail")).unwrap();
        state.unit_mut("com.example.mail").unwrap().set_installed(7, true);

        state.remove_user(7);
        assert!(!state.known_users.contains(&7));
        let unit = state.unit("com.example.mail").unwrap();
        assert!(unit.user_state(7).is_none());
    }

    #[test]
    fn test_mutations_notify_observer() {
        let (mut state, observer) = make_state();
        state.add_unit(make_unit("com.example.mail")).unwrap();
        assert!(observer.changes.load(Ordering::Relaxed) >= 2); // components + units

        let before = observer.changes.load(Ordering::Relaxed);
        state.remove_unit("com.example.mail");
        assert!(observer.changes.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn test_ensure_launchable() {
        let (mut state, _) = make_state();
        state.add_unit(make_unit("com.example.mail")).unwrap();

        assert!(state.ensure_launchable("com.example.mail").is_ok());
        assert!(matches!(
            state.ensure_launchable("com.example.gone"),
            Err(Error::UnknownUnit(_))
        ));

        state.frozen.insert("com.example.mail".to_string(), 1);
        assert!(matches!(
            state.ensure_launchable("com.example.mail"),
            Err(Error::UnitFrozen(_))
        ));
    }
}
