//! Archetype migration via cached transition plans.
//!
//! A [`TransitionPlan`] precomputes, for an ordered pair of archetypes, the
//! component types common to both signatures and whether each is
//! trivially relocatable. [`crate::manager::ArchetypeManager`] caches one
//! plan per `(src, dst)` pair (spec.md §4.7: "Plans are cached and
//! reused"); the plan itself exposes a single-entity migration path used by
//! `add_component`/`remove_component`, and a batch path that coalesces
//! contiguous rows into one bulk `memcpy` per common trivially-relocatable
//! column (spec.md's "adjacent rows ... coalesced into a single range").
//!
//! There is no direct counterpart to this module in the teacher crate
//! (`nomai-ecs`'s `Archetype::remove_entity_and_move`/`add_entity` always
//! moves one entity at a time through individually-allocated temporary
//! buffers); the coalesced-range shape is grounded on
//! `examples/original_source/engine/ecs/TransitionPlan.h`'s
//! `OperationSet`/`CopyRange` design.

#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::ptr;

use crate::archetype::{Archetype, Column};
use crate::component::ComponentTypeId;
use crate::entity::EntityHandle;

/// Precomputed shared-column plan for migrating entities from one archetype
/// signature to another.
#[derive(Debug, Clone)]
pub struct TransitionPlan {
    /// `(type_id, trivially_relocatable)` for every type in both
    /// signatures, sorted ascending by type id.
    common: Vec<(ComponentTypeId, bool)>,
}

impl TransitionPlan {
    /// Build a plan for migrating rows from `src` to `dst`.
    pub fn compute(src: &Archetype, dst: &Archetype) -> Self {
        let mut common = Vec::new();
        for &type_id in src.signature() {
            if dst.has_component(type_id) {
                let trivial = src
                    .column(type_id)
                    .expect("signature type must have a column")
                    .trivially_relocatable();
                common.push((type_id, trivial));
            }
        }
        Self { common }
    }

    pub fn common_types(&self) -> &[(ComponentTypeId, bool)] {
        &self.common
    }

    /// Migrate a single entity out of `src_row` of `src` into `dst`,
    /// carrying every common component's existing value, optionally
    /// emplacing one additional brand-new component (`extra`, used by
    /// `add_component`) that exists in `dst`'s signature but not `src`'s.
    /// Component types present in `src` but absent from `dst` are dropped.
    ///
    /// Returns the new row in `dst` and the handle (if any) that now
    /// occupies the vacated `src_row` after `src`'s internal swap-remove.
    ///
    /// # Safety
    /// `extra`, if given, must point to a valid, live value of the
    /// matching registered type; ownership transfers to `dst`'s column.
    pub unsafe fn migrate_one(
        &self,
        src: &mut Archetype,
        dst: &mut Archetype,
        src_row: usize,
        handle: EntityHandle,
        extra: Option<(ComponentTypeId, *const u8)>,
    ) -> (usize, Option<EntityHandle>) {
        let mut carried: Vec<(ComponentTypeId, *mut u8, Layout)> = Vec::new();
        let swapped = src.swap_remove_and_extract(src_row, |type_id, ptr, vtable| {
            if dst.has_component(type_id) {
                let size = vtable.size;
                let layout = Layout::from_size_align(size.max(1), vtable.align.max(1)).unwrap();
                let owned = if size > 0 { alloc(layout) } else { ptr::null_mut() };
                if size > 0 {
                    ptr::copy_nonoverlapping(ptr, owned, size);
                }
                carried.push((type_id, owned, layout));
            } else {
                vtable.drop_value(ptr);
            }
        });

        let mut pairs: Vec<(ComponentTypeId, *const u8)> =
            carried.iter().map(|(t, p, _)| (*t, *p as *const u8)).collect();
        if let Some(e) = extra {
            pairs.push(e);
        }
        pairs.sort_by_key(|(t, _)| *t);
        let dst_row = dst.push(handle, &pairs);

        for (_, ptr, layout) in carried {
            if layout.size() > 0 {
                dealloc(ptr, layout);
            }
        }

        debug_assert!(src.validate_integrity());
        debug_assert!(dst.validate_integrity());
        (dst_row, swapped)
    }

    /// Migrate a batch of rows from `src` to `dst` where `dst`'s signature
    /// has no components outside the common set (i.e. no per-entity
    /// "extra" value is needed -- the usual shape of a bulk
    /// `remove_component` flush hitting many entities of the same
    /// archetype at once). Contiguous runs of rows are coalesced into a
    /// single `memcpy` per common column via [`Column::append_range`].
    ///
    /// Returns `(handle, new_dst_row)` pairs in ascending original-row
    /// order. `rows` need not be sorted or deduplicated on input.
    ///
    /// # Safety
    /// `dst`'s signature must be a subset of `src`'s signature union the
    /// common set (no uninitialized columns are left in `dst`).
    pub unsafe fn execute_batch(
        &self,
        src: &mut Archetype,
        dst: &mut Archetype,
        rows: &[usize],
    ) -> Vec<(EntityHandle, usize)> {
        let mut sorted: Vec<usize> = rows.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut results = Vec::with_capacity(sorted.len());
        let mut i = 0;
        while i < sorted.len() {
            let mut j = i + 1;
            while j < sorted.len() && sorted[j] == sorted[j - 1] + 1 {
                j += 1;
            }
            let run_start = sorted[i];
            let run_len = j - i;

            for &(type_id, _) in &self.common {
                let src_col: *const Column = src.column(type_id).expect("common column missing in src");
                let dst_col = dst.column_mut(type_id).expect("common column missing in dst");
                dst_col.append_range(&*src_col, run_start, run_len);
            }
            let handles: Vec<EntityHandle> = src.entities()[run_start..run_start + run_len].to_vec();
            for h in handles {
                let dst_row = dst.push_entity_only(h);
                results.push((h, dst_row));
            }
            i = j;
        }

        let common_ids: Vec<ComponentTypeId> = self.common.iter().map(|(t, _)| *t).collect();
        let mut descending = sorted;
        descending.sort_unstable_by(|a, b| b.cmp(a));
        src.remove_rows_relocating(&descending, &common_ids);

        debug_assert!(src.validate_integrity());
        debug_assert!(dst.validate_integrity());
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::{ArchetypeId, ComponentVtable};
    use crate::component::ComponentRegistry;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
    }
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Vel {
        dx: f32,
    }

    fn make_archetype(id: u32, types: &[(ComponentTypeId, ComponentVtable, bool)], sig: Vec<ComponentTypeId>) -> Archetype {
        Archetype::new(ArchetypeId(id), sig, types)
    }

    #[test]
    fn migrate_one_carries_common_and_adds_extra() {
        let mut reg = ComponentRegistry::new();
        let pos_id = reg.register::<Pos>("pos", true);
        let vel_id = reg.register::<Vel>("vel", true);
        let vtables = [
            (pos_id, ComponentVtable::new::<Pos>(), true),
            (vel_id, ComponentVtable::new::<Vel>(), true),
        ];

        let mut src = make_archetype(0, &vtables, vec![pos_id]);
        let mut dst = make_archetype(1, &vtables, vec![pos_id, vel_id]);

        let pos = Pos { x: 9.0 };
        let handle = EntityHandle::new(0, 0);
        unsafe { src.push(handle, &[(pos_id, &pos as *const Pos as *const u8)]) };

        let vel = Vel { dx: 1.0 };
        let plan = TransitionPlan::compute(&src, &dst);
        let (dst_row, swapped) = unsafe {
            plan.migrate_one(&mut src, &mut dst, 0, handle, Some((vel_id, &vel as *const Vel as *const u8)))
        };

        assert_eq!(dst_row, 0);
        assert!(swapped.is_none());
        assert_eq!(dst.get_component::<Pos>(pos_id, 0), Some(&pos));
        assert_eq!(dst.get_component::<Vel>(vel_id, 0), Some(&vel));
        assert_eq!(src.len(), 0);
    }

    #[test]
    fn batch_migrate_contiguous_rows() {
        let mut reg = ComponentRegistry::new();
        let pos_id = reg.register::<Pos>("pos", true);
        let vel_id = reg.register::<Vel>("vel", true);
        let vtables = [
            (pos_id, ComponentVtable::new::<Pos>(), true),
            (vel_id, ComponentVtable::new::<Vel>(), true),
        ];

        let mut src = make_archetype(0, &vtables, vec![pos_id, vel_id]);
        let mut dst = make_archetype(1, &vtables, vec![pos_id]);

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let pos = Pos { x: i as f32 };
            let vel = Vel { dx: i as f32 };
            let h = EntityHandle::new(i, 0);
            let mut pairs = vec![(pos_id, &pos as *const Pos as *const u8), (vel_id, &vel as *const Vel as *const u8)];
            pairs.sort_by_key(|(t, _)| *t);
            unsafe { src.push(h, &pairs) };
            handles.push(h);
        }

        let plan = TransitionPlan::compute(&src, &dst);
        let results = unsafe { plan.execute_batch(&mut src, &mut dst, &[0, 1, 2, 3]) };

        assert_eq!(results.len(), 4);
        assert_eq!(src.len(), 0);
        assert_eq!(dst.len(), 4);
        for (i, (handle, row)) in results.iter().enumerate() {
            assert_eq!(*handle, handles[i]);
            assert_eq!(dst.get_component::<Pos>(pos_id, *row), Some(&Pos { x: i as f32 }));
        }
        assert!(dst.validate_integrity());
    }
}
