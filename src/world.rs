//! The [`World`]: the single owner of all entities, archetypes, component
//! storage, the deferred command buffer, and the named PRNG streams.
//!
//! Grounds on the teacher's `world.rs` `World` struct (entity lifecycle +
//! component access gathered behind one owning type) but is rebuilt around
//! the dedicated [`crate::manager::ArchetypeManager`] / [`EntityIndex`] /
//! [`crate::transition::TransitionPlan`] types this crate factors out, and
//! adds the iteration-depth-gated deferred path spec.md §4.8/§4.9 requires
//! (absent from the teacher, which has no `for_each` callback API and no
//! command buffer integrated into `World` itself).

#![allow(unsafe_code)]

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::archetype::{ArchetypeId, ComponentVtable, EMPTY_ARCHETYPE};
use crate::command::{CommandBuffer, DeferredCommand, RawValue};
use crate::component::{ComponentRegistry, ComponentTypeId};
use crate::entity::{EntityAllocator, EntityHandle, EntityIndex, EntityLocation};
use crate::manager::{ArchetypeManager, VtableRegistry};
use crate::random::RngRegistry;
use crate::snapshot::SerdeRegistry;

/// The top-level ECS container (spec.md §3 "Ownership").
///
/// Owns the entity allocator, the entity index, the component registry, the
/// archetype catalog, the deferred command buffer, and the named PRNG
/// streams. Systems and queries only ever reach component storage through a
/// `&World`/`&mut World` borrow.
pub struct World {
    pub(crate) allocator: EntityAllocator,
    pub(crate) entity_index: EntityIndex,
    pub(crate) registry: ComponentRegistry,
    pub(crate) vtables: VtableRegistry,
    pub(crate) serde_registry: SerdeRegistry,
    pub(crate) manager: ArchetypeManager,
    pub(crate) commands: CommandBuffer,
    pub(crate) rng: RngRegistry,
    iteration_depth: Cell<u32>,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.allocator.alive_count())
            .field("archetype_count", &self.manager.archetype_count())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self {
            allocator: EntityAllocator::new(),
            entity_index: EntityIndex::new(),
            registry: ComponentRegistry::new(),
            vtables: VtableRegistry::new(),
            serde_registry: SerdeRegistry::new(),
            manager: ArchetypeManager::new(),
            commands: CommandBuffer::new(),
            rng: RngRegistry::new(),
            iteration_depth: Cell::new(0),
        }
    }

    // -- registration --------------------------------------------------

    /// Register a component type (spec.md §4.2). Idempotent: re-registering
    /// the same Rust type returns the existing id.
    ///
    /// `T` additionally carries `serde` bounds beyond spec.md's bare data
    /// model, so the type can participate in the replay snapshot/diff
    /// machinery (§4.11) -- mirroring the teacher's `register_component`,
    /// which requires the same bounds for the same reason.
    pub fn register_component<T>(&mut self, name: &str, trivially_relocatable: bool) -> ComponentTypeId
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let id = self.registry.register::<T>(name, trivially_relocatable);
        self.vtables.register(id, ComponentVtable::new::<T>(), trivially_relocatable);
        self.serde_registry.register::<T>(id, name);
        id
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn component_type_id<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.registry.lookup::<T>()
    }

    // -- archetype accessors (used by crate::query) ---------------------

    pub(crate) fn archetype_manager_ref(&self) -> &ArchetypeManager {
        &self.manager
    }

    pub(crate) fn archetype(&self, id: ArchetypeId) -> &crate::archetype::Archetype {
        self.manager.get(id)
    }

    pub(crate) fn archetype_mut(&mut self, id: ArchetypeId) -> &mut crate::archetype::Archetype {
        self.manager.get_mut(id)
    }

    pub fn archetype_count(&self) -> usize {
        self.manager.archetype_count()
    }

    // -- iteration depth (spec.md §4.8/§4.9) -----------------------------

    pub(crate) fn enter_iteration(&mut self) {
        self.iteration_depth.set(self.iteration_depth.get() + 1);
    }

    pub(crate) fn leave_iteration(&mut self) {
        let depth = self.iteration_depth.get() - 1;
        self.iteration_depth.set(depth);
        if depth == 0 {
            self.flush_deferred();
        }
    }

    pub fn is_iterating(&self) -> bool {
        self.iteration_depth.get() > 0
    }

    // -- entity lifecycle -------------------------------------------------

    /// Allocate a new live handle in the empty archetype (spec.md §4.1).
    pub fn create_entity(&mut self) -> EntityHandle {
        let handle = self.allocator.create_entity();
        if handle.is_null() {
            return handle;
        }
        let row = unsafe { self.manager.get_mut(EMPTY_ARCHETYPE).push(handle, &[]) };
        self.entity_index.set(
            handle,
            EntityLocation {
                archetype: EMPTY_ARCHETYPE,
                row: row as u32,
            },
        );
        handle
    }

    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        self.allocator.is_alive(handle)
    }

    /// Force `handle` to exist (in the empty archetype) if it is not
    /// already alive. Used by replay reconciliation to recreate an entity
    /// under its originally recorded handle rather than the next one
    /// `create_entity` would hand out.
    pub(crate) fn ensure_entity(&mut self, handle: EntityHandle) {
        if self.allocator.ensure_alive(handle) {
            let row = unsafe { self.manager.get_mut(EMPTY_ARCHETYPE).push(handle, &[]) };
            self.entity_index.set(
                handle,
                EntityLocation {
                    archetype: EMPTY_ARCHETYPE,
                    row: row as u32,
                },
            );
        }
    }

    /// Destroy a live entity; deferred while iterating (spec.md §4.8).
    pub fn destroy_entity(&mut self, handle: EntityHandle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        if self.iteration_depth.get() > 0 {
            self.commands.enqueue(DeferredCommand::Destroy { entity: handle });
            return true;
        }
        self.destroy_entity_immediate(handle)
    }

    fn destroy_entity_immediate(&mut self, handle: EntityHandle) -> bool {
        let Some(loc) = self.entity_index.try_get(handle) else {
            return false;
        };
        if !self.allocator.is_alive(handle) {
            return false;
        }
        if let Some(swapped) = self.manager.get_mut(loc.archetype).swap_remove(loc.row as usize) {
            let mut swapped_loc = self.entity_index.get(swapped);
            swapped_loc.row = loc.row;
            self.entity_index.set(swapped, swapped_loc);
        }
        self.allocator.destroy_entity(handle);
        true
    }

    // -- component access ---------------------------------------------------

    pub fn has_component<T: 'static>(&self, handle: EntityHandle) -> bool {
        if !self.is_alive(handle) {
            return false;
        }
        let Some(type_id) = self.registry.lookup::<T>() else {
            return false;
        };
        let Some(loc) = self.entity_index.try_get(handle) else {
            return false;
        };
        self.manager.get(loc.archetype).has_component(type_id)
    }

    pub fn get_component<T: 'static>(&self, handle: EntityHandle) -> Option<&T> {
        if !self.is_alive(handle) {
            return None;
        }
        let type_id = self.registry.lookup::<T>()?;
        let loc = self.entity_index.try_get(handle)?;
        self.manager.get(loc.archetype).get_component::<T>(type_id, loc.row as usize)
    }

    pub fn get_component_mut<T: 'static>(&mut self, handle: EntityHandle) -> Option<&mut T> {
        if !self.is_alive(handle) {
            return None;
        }
        let type_id = self.registry.lookup::<T>()?;
        let loc = self.entity_index.try_get(handle)?;
        self.manager
            .get_mut(loc.archetype)
            .get_component_mut::<T>(type_id, loc.row as usize)
    }

    /// Add (or overwrite) a component on a live entity. Migrates the entity
    /// to a new archetype if it does not already carry `T`. Deferred while
    /// iterating -- per spec.md §9, the returned reference points at the
    /// storage backing the queued command, not at a column, so it can still
    /// be written into before flush.
    pub fn add_component<T>(&mut self, handle: EntityHandle, value: T) -> Option<&mut T>
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let type_id = self
            .registry
            .lookup::<T>()
            .expect("component type not registered -- call World::register_component::<T>() first");

        if self.iteration_depth.get() > 0 {
            if !self.allocator.is_alive(handle) {
                return None;
            }
            let raw = RawValue::from_value(value);
            let ptr = raw.as_ptr() as *mut T;
            self.commands.enqueue(DeferredCommand::Add {
                entity: handle,
                type_id,
                value: raw,
            });
            return Some(unsafe { &mut *ptr });
        }

        let applied = unsafe { self.add_component_raw(handle, type_id, &value as *const T as *const u8) };
        if applied {
            std::mem::forget(value);
            self.get_component_mut::<T>(handle)
        } else {
            None
        }
    }

    /// Remove a component type from a live entity, migrating to an
    /// archetype without it. No-op if the entity does not have `T`.
    /// Deferred while iterating (spec.md §4.8).
    pub fn remove_component<T>(&mut self, handle: EntityHandle) -> bool
    where
        T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        let Some(type_id) = self.registry.lookup::<T>() else {
            return false;
        };
        if self.iteration_depth.get() > 0 {
            if !self.allocator.is_alive(handle) {
                return false;
            }
            self.commands.enqueue(DeferredCommand::Remove { entity: handle, type_id });
            return true;
        }
        self.remove_component_raw(handle, type_id)
    }

    /// Type-erased add used both by the immediate typed API and by deferred
    /// flush (spec.md §9: the deferred API moves the value into the column
    /// at flush time). Returns `false` (a no-op) if `handle` is dead.
    ///
    /// # Safety
    /// `value_ptr` must point to a live, properly aligned value of the
    /// registered type for `type_id`; on success (`true`) ownership of
    /// those bytes has moved into the archetype column and the caller must
    /// not drop the source again.
    pub(crate) unsafe fn add_component_raw(&mut self, handle: EntityHandle, type_id: ComponentTypeId, value_ptr: *const u8) -> bool {
        if !self.allocator.is_alive(handle) {
            return false;
        }
        let Some(loc) = self.entity_index.try_get(handle) else {
            return false;
        };
        let src_id = loc.archetype;

        if self.manager.get(src_id).has_component(type_id) {
            let vtable = *self.manager.get(src_id).vtable(type_id).expect("vtable for archetype column");
            let archetype = self.manager.get_mut(src_id);
            let column = archetype.column_mut(type_id).expect("column for registered component");
            let dst_ptr = column.ptr_at(loc.row as usize);
            vtable.drop_value(dst_ptr);
            if vtable.size > 0 {
                ptr::copy_nonoverlapping(value_ptr, dst_ptr, vtable.size);
            }
            return true;
        }

        let dst_id = self.manager.with_added(src_id, type_id, &self.vtables);
        let plan = self.manager.plan_for(src_id, dst_id).clone();
        let (src_arch, dst_arch) = self.manager.get_two_mut(src_id, dst_id);
        let (dst_row, swapped) = plan.migrate_one(src_arch, dst_arch, loc.row as usize, handle, Some((type_id, value_ptr)));
        if let Some(swapped_handle) = swapped {
            let mut swapped_loc = self.entity_index.get(swapped_handle);
            swapped_loc.row = loc.row;
            self.entity_index.set(swapped_handle, swapped_loc);
        }
        self.entity_index.set(
            handle,
            EntityLocation {
                archetype: dst_id,
                row: dst_row as u32,
            },
        );
        true
    }

    /// Type-erased remove, shared by the immediate typed API and deferred
    /// flush. No-op (returns `false`) if `handle` is dead or does not carry
    /// `type_id`.
    pub(crate) fn remove_component_raw(&mut self, handle: EntityHandle, type_id: ComponentTypeId) -> bool {
        if !self.allocator.is_alive(handle) {
            return false;
        }
        let Some(loc) = self.entity_index.try_get(handle) else {
            return false;
        };
        let src_id = loc.archetype;
        if !self.manager.get(src_id).has_component(type_id) {
            return false;
        }
        let dst_id = self.manager.with_removed(src_id, type_id, &self.vtables);
        let plan = self.manager.plan_for(src_id, dst_id).clone();
        let (src_arch, dst_arch) = self.manager.get_two_mut(src_id, dst_id);
        let (dst_row, swapped) = unsafe { plan.migrate_one(src_arch, dst_arch, loc.row as usize, handle, None) };
        if let Some(swapped_handle) = swapped {
            let mut swapped_loc = self.entity_index.get(swapped_handle);
            swapped_loc.row = loc.row;
            self.entity_index.set(swapped_handle, swapped_loc);
        }
        self.entity_index.set(
            handle,
            EntityLocation {
                archetype: dst_id,
                row: dst_row as u32,
            },
        );
        true
    }

    // -- deferred command buffer (spec.md §4.8) --------------------------

    /// Apply every queued command in insertion order, if not currently
    /// iterating. A no-op while iterating (callers rely on
    /// [`leave_iteration`](Self::leave_iteration) to flush at depth zero).
    ///
    /// Adjacent `Remove` commands for the same component type are coalesced
    /// into a single batch migration via `TransitionPlan::execute_batch`
    /// (spec.md §4.7: "a single-row migration and a batch migration share
    /// the same code path") -- the shape a system removing a tag from many
    /// entities in one tick produces.
    pub fn flush_deferred(&mut self) {
        if self.iteration_depth.get() > 0 {
            return;
        }
        let mut commands = self.commands.drain().into_iter().peekable();
        while let Some(command) = commands.next() {
            match command {
                DeferredCommand::Add { entity, type_id, mut value } => {
                    let applied = unsafe { self.add_component_raw(entity, type_id, value.as_ptr()) };
                    if !applied {
                        if let Some((vtable, _)) = self.vtables.get(type_id) {
                            unsafe { value.drop_value(&vtable) };
                        }
                        tracing::warn!(?entity, ?type_id, "deferred add_component applied to a dead entity, dropped");
                    }
                }
                DeferredCommand::Remove { entity, type_id } => {
                    let mut group = vec![entity];
                    while let Some(DeferredCommand::Remove { type_id: next_type, .. }) = commands.peek() {
                        if *next_type != type_id {
                            break;
                        }
                        let Some(DeferredCommand::Remove { entity: next_entity, .. }) = commands.next() else {
                            unreachable!()
                        };
                        group.push(next_entity);
                    }
                    if group.len() > 1 {
                        self.remove_component_batch(&group, type_id);
                    } else {
                        self.remove_component_raw(group[0], type_id);
                    }
                }
                DeferredCommand::Destroy { entity } => {
                    self.destroy_entity_immediate(entity);
                }
            }
        }
    }

    /// Remove `type_id` from every entity in `entities` at once, grouped by
    /// current source archetype and migrated through a single
    /// `TransitionPlan::execute_batch` call per group instead of one
    /// `remove_component_raw` call per entity. Dead handles and entities
    /// that do not carry `type_id` are silently skipped, matching
    /// `remove_component_raw`'s no-op policy on each one individually.
    fn remove_component_batch(&mut self, entities: &[EntityHandle], type_id: ComponentTypeId) {
        let mut by_archetype: HashMap<ArchetypeId, Vec<usize>> = HashMap::new();
        for &handle in entities {
            if !self.allocator.is_alive(handle) {
                continue;
            }
            let Some(loc) = self.entity_index.try_get(handle) else { continue };
            if !self.manager.get(loc.archetype).has_component(type_id) {
                continue;
            }
            by_archetype.entry(loc.archetype).or_default().push(loc.row as usize);
        }

        for (src_id, rows) in by_archetype {
            let dst_id = self.manager.with_removed(src_id, type_id, &self.vtables);
            let plan = self.manager.plan_for(src_id, dst_id).clone();
            let (src_arch, dst_arch) = self.manager.get_two_mut(src_id, dst_id);
            let results = unsafe { plan.execute_batch(src_arch, dst_arch, &rows) };
            for (handle, dst_row) in results {
                self.entity_index.set(handle, EntityLocation { archetype: dst_id, row: dst_row as u32 });
            }

            // `execute_batch` swap-removes the migrated rows out of `src`,
            // which can relocate entities not in this batch to new rows;
            // re-sync every entity still left in `src` against its actual
            // position rather than tracking individual swaps.
            let remaining: Vec<(EntityHandle, usize)> =
                self.manager.get(src_id).entities().iter().copied().enumerate().map(|(row, h)| (h, row)).collect();
            for (handle, row) in remaining {
                self.entity_index.set(handle, EntityLocation { archetype: src_id, row: row as u32 });
            }
        }
    }

    pub fn pending_command_count(&self) -> usize {
        self.commands.len()
    }

    /// Destroy all entities and archetypes, resetting the world (spec.md
    /// §4.5 `clear()`). Any still-queued deferred `Add` values are dropped
    /// (via their vtable) rather than silently leaked.
    pub fn clear(&mut self) {
        for command in self.commands.drain() {
            if let DeferredCommand::Add { type_id, mut value, .. } = command {
                if let Some((vtable, _)) = self.vtables.get(type_id) {
                    unsafe { value.drop_value(&vtable) };
                }
            }
        }
        self.manager.clear();
        self.allocator.clear();
        self.entity_index.clear();
        self.iteration_depth.set(0);
    }

    pub fn entity_count(&self) -> usize {
        self.allocator.alive_count()
    }
}

// ---------------------------------------------------------------------------
// Bundle -- ergonomic multi-component spawn on top of create_entity/add_component
// ---------------------------------------------------------------------------

/// A tuple of owned, registered component values that can be spawned as one
/// new entity in a single archetype placement, instead of `create_entity`
/// followed by N `add_component` migrations.
///
/// Implemented for tuples of 1 to 6 elements via the macro below.
pub trait Bundle {
    #[doc(hidden)]
    fn spawn_into(self, world: &mut World) -> EntityHandle;
}

macro_rules! impl_bundle_tuple {
    ($(($T:ident, $v:ident)),+) => {
        impl<$($T),+> Bundle for ($($T,)+)
        where
            $($T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,)+
        {
            #[allow(non_snake_case)]
            fn spawn_into(self, world: &mut World) -> EntityHandle {
                let ($($v,)+) = self;
                let handle = world.allocator.create_entity();
                if handle.is_null() {
                    return handle;
                }

                let mut pairs: Vec<(ComponentTypeId, *const u8)> = Vec::new();
                $(
                    let type_id = world
                        .registry
                        .lookup::<$T>()
                        .expect("component type not registered -- call World::register_component::<T>() first");
                    pairs.push((type_id, &$v as *const $T as *const u8));
                )+
                pairs.sort_by_key(|(id, _)| *id);

                let signature: Vec<ComponentTypeId> = pairs.iter().map(|(id, _)| *id).collect();
                let archetype_id = world.manager.get_or_create(signature, &world.vtables);
                let row = unsafe { world.manager.get_mut(archetype_id).push(handle, &pairs) };
                world.entity_index.set(
                    handle,
                    EntityLocation {
                        archetype: archetype_id,
                        row: row as u32,
                    },
                );

                $( std::mem::forget($v); )+
                handle
            }
        }
    };
}

impl_bundle_tuple!((A, a));
impl_bundle_tuple!((A, a), (B, b));
impl_bundle_tuple!((A, a), (B, b), (C, c));
impl_bundle_tuple!((A, a), (B, b), (C, c), (D, d));
impl_bundle_tuple!((A, a), (B, b), (C, c), (D, d), (E, e));
impl_bundle_tuple!((A, a), (B, b), (C, c), (D, d), (E, e), (F, f));

impl World {
    /// Spawn a new entity with all components of `bundle` placed directly
    /// in their target archetype (no intermediate migrations).
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> EntityHandle {
        bundle.spawn_into(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
