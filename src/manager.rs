//! The archetype catalog: creates archetypes lazily, caches add/remove
//! edges and transition plans between them.
//!
//! Grounds on the teacher's `World::get_or_create_archetype` /
//! `matching_archetypes` (a `HashMap<Vec<ComponentTypeId>, ArchetypeId>`
//! plus a linear scan for superset queries), generalized into its own type
//! and extended with the `with_added`/`with_removed` edge cache spec.md
//! §4.5 requires ("O(1) after first lookup") and the
//! [`crate::transition::TransitionPlan`] cache spec.md §4.7 requires.

use std::collections::HashMap;

use crate::archetype::{Archetype, ArchetypeId, ComponentVtable, EMPTY_ARCHETYPE};
use crate::component::ComponentTypeId;
use crate::transition::TransitionPlan;

/// Per-component-type vtable and relocatability, indexed densely by
/// [`ComponentTypeId`]. Populated by `World::register_component`.
#[derive(Default)]
pub struct VtableRegistry {
    entries: Vec<Option<(ComponentVtable, bool)>>,
}

impl VtableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ComponentTypeId, vtable: ComponentVtable, trivially_relocatable: bool) {
        let index = id.index();
        if index >= self.entries.len() {
            self.entries.resize(index + 1, None);
        }
        self.entries[index] = Some((vtable, trivially_relocatable));
    }

    pub fn get(&self, id: ComponentTypeId) -> Option<(ComponentVtable, bool)> {
        self.entries.get(id.index()).copied().flatten()
    }
}

/// Catalog of archetypes indexed by signature, with cached structural
/// edges and migration plans.
pub struct ArchetypeManager {
    archetypes: Vec<Archetype>,
    by_signature: HashMap<Vec<ComponentTypeId>, ArchetypeId>,
    added_edges: HashMap<(ArchetypeId, ComponentTypeId), ArchetypeId>,
    removed_edges: HashMap<(ArchetypeId, ComponentTypeId), ArchetypeId>,
    plans: HashMap<(ArchetypeId, ArchetypeId), TransitionPlan>,
}

impl ArchetypeManager {
    pub fn new() -> Self {
        let empty = Archetype::new(EMPTY_ARCHETYPE, Vec::new(), &[]);
        let mut by_signature = HashMap::new();
        by_signature.insert(Vec::new(), EMPTY_ARCHETYPE);
        Self {
            archetypes: vec![empty],
            by_signature,
            added_edges: HashMap::new(),
            removed_edges: HashMap::new(),
            plans: HashMap::new(),
        }
    }

    pub fn get(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id.index()]
    }

    pub fn get_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id.index()]
    }

    /// Mutable access to two distinct archetypes at once, for migration.
    /// Panics if `a == b` (a migration never targets its own archetype).
    pub fn get_two_mut(&mut self, a: ArchetypeId, b: ArchetypeId) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b, "cannot migrate an archetype into itself");
        let (lo, hi) = if a.index() < b.index() { (a, b) } else { (b, a) };
        let (left, right) = self.archetypes.split_at_mut(hi.index());
        let lo_ref = &mut left[lo.index()];
        let hi_ref = &mut right[0];
        if a.index() < b.index() {
            (lo_ref, hi_ref)
        } else {
            (hi_ref, lo_ref)
        }
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    /// Find or lazily create the archetype whose signature is exactly
    /// `signature` (sorted, deduplicated by the caller).
    pub fn get_or_create(&mut self, signature: Vec<ComponentTypeId>, vtables: &VtableRegistry) -> ArchetypeId {
        if let Some(&id) = self.by_signature.get(&signature) {
            return id;
        }
        let id = ArchetypeId(self.archetypes.len() as u32);
        let triples: Vec<(ComponentTypeId, ComponentVtable, bool)> = signature
            .iter()
            .map(|&t| {
                let (vtable, trivial) = vtables.get(t).expect("component type not registered with a vtable");
                (t, vtable, trivial)
            })
            .collect();
        let archetype = Archetype::new(id, signature.clone(), &triples);
        self.archetypes.push(archetype);
        self.by_signature.insert(signature, id);
        id
    }

    /// The archetype whose signature is `archetype_id`'s signature plus
    /// `added`. Cached after first lookup.
    pub fn with_added(&mut self, archetype_id: ArchetypeId, added: ComponentTypeId, vtables: &VtableRegistry) -> ArchetypeId {
        if let Some(&cached) = self.added_edges.get(&(archetype_id, added)) {
            return cached;
        }
        let mut signature = self.get(archetype_id).signature().to_vec();
        if !signature.contains(&added) {
            signature.push(added);
            signature.sort_unstable();
        }
        let dst = self.get_or_create(signature, vtables);
        self.added_edges.insert((archetype_id, added), dst);
        dst
    }

    /// The archetype whose signature is `archetype_id`'s signature minus
    /// `removed`. Cached after first lookup.
    pub fn with_removed(&mut self, archetype_id: ArchetypeId, removed: ComponentTypeId, vtables: &VtableRegistry) -> ArchetypeId {
        if let Some(&cached) = self.removed_edges.get(&(archetype_id, removed)) {
            return cached;
        }
        let signature: Vec<ComponentTypeId> = self
            .get(archetype_id)
            .signature()
            .iter()
            .copied()
            .filter(|&t| t != removed)
            .collect();
        let dst = self.get_or_create(signature, vtables);
        self.removed_edges.insert((archetype_id, removed), dst);
        dst
    }

    /// All archetype ids whose signature is a superset of `required`.
    pub fn archetypes_with_all(&self, required: &[ComponentTypeId]) -> Vec<ArchetypeId> {
        self.archetypes
            .iter()
            .filter(|a| required.iter().all(|t| a.has_component(*t)))
            .map(|a| a.id())
            .collect()
    }

    /// Fetch (computing and caching if necessary) the transition plan for
    /// migrating rows from `src` to `dst`.
    pub fn plan_for(&mut self, src: ArchetypeId, dst: ArchetypeId) -> &TransitionPlan {
        if !self.plans.contains_key(&(src, dst)) {
            let plan = TransitionPlan::compute(self.get(src), self.get(dst));
            self.plans.insert((src, dst), plan);
        }
        &self.plans[&(src, dst)]
    }

    /// Destroy all archetypes and recreate the empty archetype, per
    /// spec.md §4.5 `clear()`.
    pub fn clear(&mut self) {
        self.archetypes.clear();
        self.by_signature.clear();
        self.added_edges.clear();
        self.removed_edges.clear();
        self.plans.clear();
        let empty = Archetype::new(EMPTY_ARCHETYPE, Vec::new(), &[]);
        self.archetypes.push(empty);
        self.by_signature.insert(Vec::new(), EMPTY_ARCHETYPE);
    }
}

impl Default for ArchetypeManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;

    #[derive(Debug, Clone, Copy)]
    struct Pos {
        #[allow(dead_code)]
        x: f32,
    }

    fn vtables_with(reg: &mut ComponentRegistry) -> (ComponentTypeId, VtableRegistry) {
        let id = reg.register::<Pos>("pos", true);
        let mut v = VtableRegistry::new();
        v.register(id, ComponentVtable::new::<Pos>(), true);
        (id, v)
    }

    #[test]
    fn empty_archetype_always_present() {
        let manager = ArchetypeManager::new();
        assert_eq!(manager.archetype_count(), 1);
        assert_eq!(manager.get(EMPTY_ARCHETYPE).signature().len(), 0);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let mut reg = ComponentRegistry::new();
        let (pos_id, vtables) = vtables_with(&mut reg);
        let mut manager = ArchetypeManager::new();
        let a = manager.get_or_create(vec![pos_id], &vtables);
        let b = manager.get_or_create(vec![pos_id], &vtables);
        assert_eq!(a, b);
        assert_eq!(manager.archetype_count(), 2);
    }

    #[test]
    fn with_added_is_cached() {
        let mut reg = ComponentRegistry::new();
        let (pos_id, vtables) = vtables_with(&mut reg);
        let mut manager = ArchetypeManager::new();
        let a = manager.with_added(EMPTY_ARCHETYPE, pos_id, &vtables);
        let b = manager.with_added(EMPTY_ARCHETYPE, pos_id, &vtables);
        assert_eq!(a, b);
        assert_eq!(manager.archetype_count(), 2);
    }

    #[test]
    fn with_added_then_removed_returns_to_empty() {
        let mut reg = ComponentRegistry::new();
        let (pos_id, vtables) = vtables_with(&mut reg);
        let mut manager = ArchetypeManager::new();
        let with_pos = manager.with_added(EMPTY_ARCHETYPE, pos_id, &vtables);
        let back = manager.with_removed(with_pos, pos_id, &vtables);
        assert_eq!(back, EMPTY_ARCHETYPE);
    }

    #[test]
    fn archetypes_with_all_is_superset_match() {
        #[derive(Debug, Clone, Copy)]
        struct Vel {
            #[allow(dead_code)]
            dx: f32,
        }
        let mut reg = ComponentRegistry::new();
        let pos_id = reg.register::<Pos>("pos", true);
        let vel_id = reg.register::<Vel>("vel", true);
        let mut vtables = VtableRegistry::new();
        vtables.register(pos_id, ComponentVtable::new::<Pos>(), true);
        vtables.register(vel_id, ComponentVtable::new::<Vel>(), true);

        let mut manager = ArchetypeManager::new();
        let pos_only = manager.get_or_create(vec![pos_id], &vtables);
        let pos_vel = manager.get_or_create(vec![pos_id, vel_id], &vtables);

        let matches = manager.archetypes_with_all(&[pos_id]);
        assert!(matches.contains(&pos_only));
        assert!(matches.contains(&pos_vel));
        assert!(!matches.contains(&EMPTY_ARCHETYPE));
    }

    #[test]
    fn clear_resets_to_empty_only() {
        let mut reg = ComponentRegistry::new();
        let (pos_id, vtables) = vtables_with(&mut reg);
        let mut manager = ArchetypeManager::new();
        manager.get_or_create(vec![pos_id], &vtables);
        manager.clear();
        assert_eq!(manager.archetype_count(), 1);
    }
}
