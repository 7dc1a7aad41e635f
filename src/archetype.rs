//! Type-erased component columns and archetype storage.
//!
//! A [`Column`] is a manually-managed, densely-packed, growable array of one
//! component type's values, identified only by size/alignment at runtime. An
//! [`Archetype`] groups one column per component type in its signature plus
//! a dense `entities` vector, and keeps them all the same length.
//!
//! The column/archetype storage is the one place in this crate where
//! `unsafe` is load-bearing: component values are moved in and out of
//! heap-allocated byte buffers by raw pointer, because the set of component
//! types is only known at runtime.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, realloc, Layout};
use std::ptr;

use crate::component::{ComponentInfo, ComponentTypeId};
use crate::entity::EntityHandle;

/// Stable index into the archetype catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The reserved id of the empty-signature archetype, always present.
pub const EMPTY_ARCHETYPE: ArchetypeId = ArchetypeId(0);

// ---------------------------------------------------------------------------
// ComponentVtable
// ---------------------------------------------------------------------------

/// Type-erased drop/clone operations for one component type, created once
/// at registration time via monomorphized function pointers.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    drop_fn: unsafe fn(*mut u8),
    #[allow(dead_code)] // reserved for a future clone-based snapshot path
    clone_fn: unsafe fn(*const u8, *mut u8),
    pub size: usize,
    pub align: usize,
}

unsafe impl Send for ComponentVtable {}
unsafe impl Sync for ComponentVtable {}

unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
    ptr::drop_in_place(ptr as *mut T);
}

unsafe fn clone_fn_impl<T: Clone>(src: *const u8, dst: *mut u8) {
    let value = (*(src as *const T)).clone();
    ptr::write(dst as *mut T, value);
}

impl ComponentVtable {
    pub fn new<T: Clone + 'static>() -> Self {
        Self {
            drop_fn: drop_fn_impl::<T>,
            clone_fn: clone_fn_impl::<T>,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
        }
    }

    /// Build a vtable from already-known size/align, for use sites that
    /// only have a [`ComponentInfo`] and not a concrete `T` (the archetype
    /// manager, building columns from a signature).
    pub fn from_info(info: &ComponentInfo, drop_fn: unsafe fn(*mut u8), clone_fn: unsafe fn(*const u8, *mut u8)) -> Self {
        Self {
            drop_fn,
            clone_fn,
            size: info.size,
            align: info.align,
        }
    }

    #[inline]
    pub unsafe fn drop_value(&self, ptr: *mut u8) {
        (self.drop_fn)(ptr)
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// Type-erased, densely-packed, growable array of one component type's
/// values.
///
/// Invariant: `len == archetype.entities.len()` at every external
/// observation point (enforced by [`Archetype`], not by `Column` itself,
/// since `Column` has no notion of the entity list).
pub struct Column {
    data: *mut u8,
    len: usize,
    capacity: usize,
    item_size: usize,
    item_align: usize,
    trivially_relocatable: bool,
}

unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    pub fn new(item_size: usize, item_align: usize, trivially_relocatable: bool) -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            item_size,
            item_align,
            trivially_relocatable,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn trivially_relocatable(&self) -> bool {
        self.trivially_relocatable
    }

    fn layout_for(&self, capacity: usize) -> Layout {
        Layout::from_size_align(self.item_size * capacity, self.item_align.max(1))
            .expect("component column layout overflow")
    }

    fn grow_to(&mut self, new_capacity: usize) {
        if self.item_size == 0 {
            self.capacity = new_capacity;
            return;
        }
        let new_layout = self.layout_for(new_capacity);
        let new_data = if self.data.is_null() {
            unsafe { alloc(new_layout) }
        } else {
            let old_layout = self.layout_for(self.capacity);
            unsafe { realloc(self.data, old_layout, new_layout.size()) }
        };
        if new_data.is_null() {
            std::alloc::handle_alloc_error(new_layout);
        }
        self.data = new_data;
        self.capacity = new_capacity;
    }

    fn grow_if_needed(&mut self, additional: usize) {
        let required = self.len + additional;
        if required <= self.capacity {
            return;
        }
        let new_capacity = if self.capacity == 0 {
            required.max(4)
        } else {
            (self.capacity * 2).max(required)
        };
        self.grow_to(new_capacity);
    }

    #[inline]
    pub fn ptr_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        if self.item_size == 0 {
            return self.data; // dangling, never dereferenced for a ZST
        }
        unsafe { self.data.add(index * self.item_size) }
    }

    /// Append one value, copying `item_size` bytes from `value_ptr`. Caller
    /// retains responsibility for not double-dropping `value_ptr`'s source.
    pub unsafe fn push_raw(&mut self, value_ptr: *const u8) {
        self.grow_if_needed(1);
        let dst = if self.item_size == 0 {
            self.data
        } else {
            self.data.add(self.len * self.item_size)
        };
        if self.item_size > 0 {
            ptr::copy_nonoverlapping(value_ptr, dst, self.item_size);
        }
        self.len += 1;
    }

    /// Append `count` values copied from `src` starting at `src_row`. If
    /// both columns are trivially relocatable this is a single `memcpy`
    /// (spec.md §4.3 `append_range`); non-trivial columns fall back to a
    /// sequence of per-element moves so move constructors/destructors are
    /// never skipped for types where that would be unsound.
    ///
    /// `src` rows `[src_row, src_row + count)` are left logically moved-out:
    /// the caller is responsible for removing them from `src` afterwards
    /// (e.g. via descending swap-removes) without dropping them again.
    pub unsafe fn append_range(&mut self, src: &Column, src_row: usize, count: usize) {
        if count == 0 {
            return;
        }
        debug_assert_eq!(self.item_size, src.item_size);
        self.grow_if_needed(count);
        if self.item_size == 0 {
            self.len += count;
            return;
        }
        let dst = self.data.add(self.len * self.item_size);
        let src_ptr = src.data.add(src_row * self.item_size);
        if self.trivially_relocatable && src.trivially_relocatable {
            ptr::copy_nonoverlapping(src_ptr, dst, count * self.item_size);
        } else {
            for i in 0..count {
                let s = src_ptr.add(i * self.item_size);
                let d = dst.add(i * self.item_size);
                ptr::copy_nonoverlapping(s, d, self.item_size);
            }
        }
        self.len += count;
    }

    /// Overwrite `row` with the last element and shrink by one, dropping
    /// the overwritten value. O(1).
    pub unsafe fn swap_remove(&mut self, row: usize, vtable: &ComponentVtable) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        let row_ptr = self.ptr_at(row);
        vtable.drop_value(row_ptr);
        if row != last && self.item_size > 0 {
            let last_ptr = self.ptr_at(last);
            ptr::copy_nonoverlapping(last_ptr, row_ptr, self.item_size);
        }
        self.len -= 1;
    }

    /// Like [`swap_remove`](Self::swap_remove) but copies the removed
    /// value's bytes to `out_ptr` instead of dropping it -- used during
    /// archetype migration where the value is moved, not destroyed.
    pub unsafe fn swap_remove_and_move(&mut self, row: usize, out_ptr: *mut u8) {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        let row_ptr = self.ptr_at(row);
        if self.item_size > 0 {
            ptr::copy_nonoverlapping(row_ptr, out_ptr, self.item_size);
            if row != last {
                let last_ptr = self.ptr_at(last);
                ptr::copy_nonoverlapping(last_ptr, row_ptr, self.item_size);
            }
        }
        self.len -= 1;
    }

    pub unsafe fn drop_all(&mut self, vtable: &ComponentVtable) {
        for i in 0..self.len {
            vtable.drop_value(self.ptr_at(i));
        }
        self.len = 0;
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        // Values must already have been dropped via `drop_all` by the owning
        // `Archetype`'s `Drop` impl; here we only free the backing buffer.
        if !self.data.is_null() && self.capacity > 0 && self.item_size > 0 {
            let layout = self.layout_for(self.capacity);
            unsafe { dealloc(self.data, layout) };
        }
    }
}

struct ColumnEntry {
    column: Column,
    vtable: ComponentVtable,
}

// ---------------------------------------------------------------------------
// Archetype
// ---------------------------------------------------------------------------

/// Initial column capacity reserved on archetype creation, to avoid
/// realloc thrashing for small archetypes (spec.md §4.4 policy).
const INITIAL_RESERVE: usize = 64;

/// A set of columns sharing a component signature, plus a dense vector of
/// entity handles at matching rows.
pub struct Archetype {
    id: ArchetypeId,
    signature: Vec<ComponentTypeId>,
    columns: Vec<(ComponentTypeId, ColumnEntry)>,
    entities: Vec<EntityHandle>,
}

impl Archetype {
    pub fn new(id: ArchetypeId, mut signature: Vec<ComponentTypeId>, vtables: &[(ComponentTypeId, ComponentVtable, bool)]) -> Self {
        signature.sort_unstable();
        let mut columns: Vec<(ComponentTypeId, ColumnEntry)> = signature
            .iter()
            .map(|&type_id| {
                let (_, vtable, trivial) = vtables
                    .iter()
                    .find(|(t, _, _)| *t == type_id)
                    .expect("vtable missing for signature component");
                let mut column = Column::new(vtable.size, vtable.align, *trivial);
                if vtable.size > 0 {
                    column.grow_to(INITIAL_RESERVE);
                }
                (type_id, ColumnEntry { column, vtable: *vtable })
            })
            .collect();
        columns.sort_by_key(|(id, _)| *id);
        Self {
            id,
            signature,
            columns,
            entities: Vec::with_capacity(INITIAL_RESERVE),
        }
    }

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn signature(&self) -> &[ComponentTypeId] {
        &self.signature
    }

    pub fn has_component(&self, type_id: ComponentTypeId) -> bool {
        self.column_index(type_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[EntityHandle] {
        &self.entities
    }

    pub(crate) fn column_index(&self, type_id: ComponentTypeId) -> Option<usize> {
        self.columns.binary_search_by_key(&type_id, |(id, _)| *id).ok()
    }

    pub(crate) fn column(&self, type_id: ComponentTypeId) -> Option<&Column> {
        self.column_index(type_id).map(|i| &self.columns[i].1.column)
    }

    pub(crate) fn column_mut(&mut self, type_id: ComponentTypeId) -> Option<&mut Column> {
        self.column_index(type_id).map(move |i| &mut self.columns[i].1.column)
    }

    pub(crate) fn vtable(&self, type_id: ComponentTypeId) -> Option<&ComponentVtable> {
        self.column_index(type_id).map(|i| &self.columns[i].1.vtable)
    }

    /// All `(type_id, vtable)` pairs in signature order.
    pub(crate) fn vtables(&self) -> impl Iterator<Item = (ComponentTypeId, &ComponentVtable)> {
        self.columns.iter().map(|(id, entry)| (*id, &entry.vtable))
    }

    /// Append `handle` with component values supplied as `(type_id, ptr)`
    /// pairs matching the archetype's sorted column order exactly.
    ///
    /// # Safety
    /// Each `ptr` must point to a valid, live value of the column's
    /// registered type; ownership of the bytes transfers to the column.
    pub unsafe fn push(&mut self, handle: EntityHandle, values: &[(ComponentTypeId, *const u8)]) -> usize {
        debug_assert_eq!(values.len(), self.columns.len());
        let row = self.entities.len();
        self.entities.push(handle);
        for (i, (type_id, entry)) in self.columns.iter_mut().enumerate() {
            let (value_type, ptr) = values[i];
            debug_assert_eq!(*type_id, value_type);
            entry.column.push_raw(ptr);
        }
        row
    }

    /// Swap-remove `row`. Returns the handle now occupying `row`, or `None`
    /// if `row` was the last row.
    pub fn swap_remove(&mut self, row: usize) -> Option<EntityHandle> {
        let last = self.entities.len() - 1;
        for (_, entry) in &mut self.columns {
            unsafe { entry.column.swap_remove(row, &entry.vtable) };
        }
        self.entities.swap_remove(row);
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Like [`swap_remove`](Self::swap_remove) but moves each removed
    /// component's bytes out (via `out`) instead of dropping them, for use
    /// during archetype migration. `out` receives `(type_id, src_ptr,
    /// vtable)` for each column and must copy the bytes out before
    /// returning -- afterwards the source bytes are considered moved-from
    /// and will not be dropped by this column.
    ///
    /// # Safety
    /// `out` must copy exactly `vtable.size` bytes out of `src_ptr` for
    /// each call before returning.
    pub unsafe fn swap_remove_and_extract(
        &mut self,
        row: usize,
        mut out: impl FnMut(ComponentTypeId, *mut u8, &ComponentVtable),
    ) -> Option<EntityHandle> {
        let last = self.entities.len() - 1;
        for (type_id, entry) in &mut self.columns {
            let size = entry.vtable.size.max(1);
            let layout = Layout::from_size_align(size, entry.vtable.align.max(1)).unwrap();
            let temp = if entry.vtable.size > 0 { alloc(layout) } else { ptr::null_mut() };
            entry.column.swap_remove_and_move(row, temp);
            out(*type_id, temp, &entry.vtable);
            if entry.vtable.size > 0 {
                dealloc(temp, layout);
            }
        }
        self.entities.swap_remove(row);
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Append an entity handle without touching any column. Used by the
    /// transition-plan batch path after it has already bulk-appended every
    /// common column's values via [`Column::append_range`]; the caller is
    /// responsible for keeping column lengths in lockstep with `entities`.
    pub(crate) fn push_entity_only(&mut self, handle: EntityHandle) -> usize {
        let row = self.entities.len();
        self.entities.push(handle);
        row
    }

    /// Remove each row in `rows_desc` (must be strictly descending, and
    /// refer to this archetype's *original* row numbering) from this
    /// archetype. For component types listed in `relocated`, the value is
    /// moved out and discarded without running its destructor (the caller
    /// has already bulk-copied these bytes elsewhere via
    /// [`Column::append_range`]); every other column's value is dropped
    /// normally. Used by the transition-plan batch migration path.
    ///
    /// # Safety
    /// Every type in `relocated` must be present in this archetype's
    /// signature, and the caller must already have copied those bytes to
    /// their new owner before calling this.
    pub unsafe fn remove_rows_relocating(&mut self, rows_desc: &[usize], relocated: &[ComponentTypeId]) {
        for &row in rows_desc {
            for (type_id, entry) in &mut self.columns {
                if relocated.contains(type_id) {
                    let size = entry.vtable.size;
                    if size > 0 {
                        let layout = Layout::from_size_align(size, entry.vtable.align.max(1)).unwrap();
                        let scratch = alloc(layout);
                        entry.column.swap_remove_and_move(row, scratch);
                        dealloc(scratch, layout);
                    } else {
                        entry.column.swap_remove_and_move(row, ptr::null_mut());
                    }
                } else {
                    entry.column.swap_remove(row, &entry.vtable);
                }
            }
            self.entities.swap_remove(row);
        }
    }

    pub fn get_component<T: 'static>(&self, type_id: ComponentTypeId, row: usize) -> Option<&T> {
        let column = self.column(type_id)?;
        if row >= column.len() {
            return None;
        }
        Some(unsafe { &*(column.ptr_at(row) as *const T) })
    }

    pub fn get_component_mut<T: 'static>(&mut self, type_id: ComponentTypeId, row: usize) -> Option<&mut T> {
        let column = self.column_mut(type_id)?;
        if row >= column.len() {
            return None;
        }
        Some(unsafe { &mut *(column.ptr_at(row) as *mut T) })
    }

    /// All columns have length equal to `entities.len()`.
    pub fn validate_integrity(&self) -> bool {
        self.columns.iter().all(|(_, entry)| entry.column.len() == self.entities.len())
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for (_, entry) in &mut self.columns {
            unsafe { entry.column.drop_all(&entry.vtable) };
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentRegistry;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    fn pos_vtable() -> ComponentVtable {
        ComponentVtable::new::<Pos>()
    }

    #[test]
    fn push_and_get_component() {
        let mut reg = ComponentRegistry::new();
        let pos_id = reg.register::<Pos>("pos", true);
        let vtables = [(pos_id, pos_vtable(), true)];
        let mut arch = Archetype::new(ArchetypeId(1), vec![pos_id], &vtables);

        let value = Pos { x: 1.0, y: 2.0 };
        let row = unsafe { arch.push(EntityHandle::new(0, 0), &[(pos_id, &value as *const Pos as *const u8)]) };
        assert_eq!(row, 0);
        assert_eq!(arch.get_component::<Pos>(pos_id, 0), Some(&value));
        assert!(arch.validate_integrity());
    }

    #[test]
    fn swap_remove_updates_occupant() {
        let mut reg = ComponentRegistry::new();
        let pos_id = reg.register::<Pos>("pos", true);
        let vtables = [(pos_id, pos_vtable(), true)];
        let mut arch = Archetype::new(ArchetypeId(1), vec![pos_id], &vtables);

        for i in 0..3u32 {
            let value = Pos { x: i as f32, y: 0.0 };
            unsafe { arch.push(EntityHandle::new(i, 0), &[(pos_id, &value as *const Pos as *const u8)]) };
        }
        let swapped = arch.swap_remove(0);
        assert_eq!(swapped, Some(EntityHandle::new(2, 0)));
        assert_eq!(arch.len(), 2);
        assert!(arch.validate_integrity());
    }

    #[test]
    fn multiple_components_independent() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        struct Vel {
            dx: f32,
        }
        let mut reg = ComponentRegistry::new();
        let pos_id = reg.register::<Pos>("pos", true);
        let vel_id = reg.register::<Vel>("vel", true);
        let mut ids = vec![pos_id, vel_id];
        ids.sort();
        let vtables = [
            (pos_id, pos_vtable(), true),
            (vel_id, ComponentVtable::new::<Vel>(), true),
        ];
        let mut arch = Archetype::new(ArchetypeId(1), ids, &vtables);

        let pos = Pos { x: 1.0, y: 2.0 };
        let vel = Vel { dx: 3.0 };
        let mut pairs: Vec<(ComponentTypeId, *const u8)> = vec![
            (pos_id, &pos as *const Pos as *const u8),
            (vel_id, &vel as *const Vel as *const u8),
        ];
        pairs.sort_by_key(|(id, _)| *id);
        unsafe { arch.push(EntityHandle::new(0, 0), &pairs) };

        assert_eq!(arch.get_component::<Pos>(pos_id, 0), Some(&pos));
        assert_eq!(arch.get_component::<Vel>(vel_id, 0), Some(&vel));
    }
}
