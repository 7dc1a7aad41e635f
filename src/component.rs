//! Component type registration and metadata.
//!
//! Every component type used in the ECS is registered at runtime in a
//! [`ComponentRegistry`]. Registration produces a dense, array-indexable
//! [`ComponentTypeId`] and records whether the type is trivially
//! relocatable -- whether a `memcpy` of N values is semantically
//! equivalent to move-constructing N values -- which the [`crate::column`]
//! and [`crate::transition`] machinery uses to choose a bulk-copy fast path.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Dense, process-local identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
///
/// Type-erased drop/clone operations live in
/// [`crate::archetype::ComponentVtable`]; this struct holds only the plain
/// metadata the registry, archetype manager, and transition plan consult.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub id: ComponentTypeId,
    pub name: String,
    pub size: usize,
    pub align: usize,
    pub type_id: TypeId,
    /// True iff a `memcpy` of N values of this type is semantically
    /// equivalent to move-constructing N values -- i.e. the type is `Copy`.
    /// Non-`Copy` `Clone` types are conservatively treated as
    /// non-trivially-relocatable and migrated element-by-element.
    pub trivially_relocatable: bool,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// A type can only be registered once; subsequent registrations of the same
/// Rust `TypeId` return the existing [`ComponentTypeId`] (spec.md §4.2:
/// "Registration is idempotent").
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<String, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `Clone + Send + Sync + 'static` component type. The caller
    /// asserts `trivially_relocatable`: pass `true` only if a bitwise copy of
    /// `T`'s bytes to a new location, without running `T::clone` or `Drop`
    /// on the old location, is a valid move (e.g. `T: Copy`, or a struct of
    /// only such fields) -- the archetype migration path uses this flag to
    /// choose `memcpy` over a per-value clone/drop.
    ///
    /// Idempotent: re-registering the same Rust type returns the existing id
    /// and ignores `name` and `trivially_relocatable`.
    pub fn register<T>(&mut self, name: &str, trivially_relocatable: bool) -> ComponentTypeId
    where
        T: Clone + Send + Sync + 'static,
    {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return existing;
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        let info = ComponentInfo {
            id,
            name: name.to_owned(),
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: rust_type_id,
            trivially_relocatable,
        };
        self.infos.push(info);
        self.by_type.insert(rust_type_id, id);
        if self.by_name.contains_key(name) {
            panic!(
                "component name '{}' is already registered for a different type",
                name
            );
        }
        self.by_name.insert(name.to_owned(), id);
        id
    }

    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone)]
    struct Name(String);

    #[test]
    fn register_and_lookup() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>("position", true);
        assert_eq!(reg.lookup::<Pos>(), Some(id));
    }

    #[test]
    fn same_type_same_id() {
        let mut reg = ComponentRegistry::new();
        let id1 = reg.register::<Pos>("position", true);
        let id2 = reg.register::<Pos>("position_again", true);
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn different_types_different_ids() {
        let mut reg = ComponentRegistry::new();
        let p = reg.register::<Pos>("position", true);
        let n = reg.register::<Name>("name", false);
        assert_ne!(p, n);
    }

    #[test]
    fn trivially_relocatable_recorded() {
        let mut reg = ComponentRegistry::new();
        let p = reg.register::<Pos>("position", true);
        let n = reg.register::<Name>("name", false);
        assert!(reg.get_info(p).unwrap().trivially_relocatable);
        assert!(!reg.get_info(n).unwrap().trivially_relocatable);
    }

    #[test]
    fn info_correctness() {
        let mut reg = ComponentRegistry::new();
        let id = reg.register::<Pos>("position", true);
        let info = reg.get_info(id).unwrap();
        assert_eq!(info.name, "position");
        assert_eq!(info.size, std::mem::size_of::<Pos>());
        assert_eq!(info.align, std::mem::align_of::<Pos>());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_name_different_type_panics() {
        let mut reg = ComponentRegistry::new();
        reg.register::<Pos>("thing", true);
        reg.register::<Name>("thing", false);
    }
}
