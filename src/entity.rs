//! Entity handles and the entity allocator.
//!
//! An [`EntityHandle`] packs a 24-bit index and an 8-bit generation into a
//! single `u32`. The [`EntityAllocator`] hands out live handles, recycles
//! dead slots through a FIFO free list, and bumps a slot's generation
//! (wrapping modulo 2^8) each time it is recycled so stale handles into the
//! same slot are never mistaken for the new occupant.
//!
//! [`EntityIndex`] is the companion structure from the spec's "Entity Index"
//! module (4.6): it maps `handle.index()` to `(archetype_id, row)` and is
//! kept in lockstep with the allocator by [`crate::world::World`] on every
//! archetype push / swap-remove.

use std::collections::VecDeque;
use std::fmt;

use crate::archetype::ArchetypeId;

/// Number of bits reserved for the index portion of a handle.
const INDEX_BITS: u32 = 24;
/// Mask selecting the low 24 bits.
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Reserved sentinel index: all 24 index bits set. Never allocated.
pub const NULL_INDEX: u32 = INDEX_MASK;

/// A versioned entity handle: 24-bit index packed with an 8-bit generation.
///
/// Two handles are equal iff both index and generation match. A handle is
/// *live* iff the allocator's metadata at `index` has the same generation
/// and its `alive` flag is set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(u32);

impl EntityHandle {
    /// The null handle: reserved index, generation 0. Never returned by
    /// [`EntityAllocator::create_entity`]; useful as a sentinel default.
    pub const NULL: EntityHandle = EntityHandle(NULL_INDEX);

    #[inline]
    pub(crate) fn new(index: u32, generation: u8) -> Self {
        debug_assert!(index <= INDEX_MASK, "entity index overflows 24 bits");
        Self(((generation as u32) << INDEX_BITS) | (index & INDEX_MASK))
    }

    /// The 24-bit slot index.
    #[inline]
    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    /// The 8-bit generation.
    #[inline]
    pub fn generation(self) -> u8 {
        (self.0 >> INDEX_BITS) as u8
    }

    /// Whether this is the reserved null handle.
    #[inline]
    pub fn is_null(self) -> bool {
        self.index() == NULL_INDEX
    }

    /// Pack from raw parts. Used by replay deserialization.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    /// Unpack from raw parts. Used by replay deserialization.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

impl serde::Serialize for EntityHandle {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EntityHandle {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        u32::deserialize(d).map(EntityHandle)
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out [`EntityHandle`]s, tracks liveness, recycles slots through a
/// FIFO free list.
///
/// Generation wraps silently modulo 2^8 (per spec.md §4.1: "increments the
/// generation modulo 2^8"). This means a slot recycled 256 times produces a
/// handle bit-identical to one from 256 cycles earlier; the crate documents
/// this rather than guarding against it, matching the specified policy. See
/// `generation_wraps_after_256_recycles` below for a reproduction of the
/// wrap.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u8>,
    alive: Vec<bool>,
    free_indices: VecDeque<u32>,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self {
            generations: Vec::new(),
            alive: Vec::new(),
            free_indices: VecDeque::new(),
        }
    }

    /// Allocate a new live handle, reusing a free slot if one exists.
    ///
    /// Returns [`EntityHandle::NULL`] if the 24-bit index space is
    /// saturated (spec.md §8 boundary behavior: creating 2^24 live entities
    /// saturates the index space).
    pub fn create_entity(&mut self) -> EntityHandle {
        if let Some(index) = self.free_indices.pop_front() {
            self.alive[index as usize] = true;
            return EntityHandle::new(index, self.generations[index as usize]);
        }

        let index = self.generations.len() as u32;
        if index >= NULL_INDEX {
            return EntityHandle::NULL;
        }
        self.generations.push(0);
        self.alive.push(true);
        EntityHandle::new(index, 0)
    }

    /// Destroy a handle if it is currently live.
    ///
    /// Returns `true` if the handle was live and is now destroyed, `false`
    /// if it was already dead or out of range (a no-op per spec.md §4.1
    /// failure policy).
    pub fn destroy_entity(&mut self, handle: EntityHandle) -> bool {
        let index = handle.index() as usize;
        if index >= self.generations.len() {
            return false;
        }
        if !self.alive[index] || self.generations[index] != handle.generation() {
            return false;
        }
        self.alive[index] = false;
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.free_indices.push_back(index as u32);
        true
    }

    /// Whether `handle` refers to a currently-live entity.
    pub fn is_alive(&self, handle: EntityHandle) -> bool {
        let index = handle.index() as usize;
        index < self.generations.len()
            && self.alive[index]
            && self.generations[index] == handle.generation()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.iter().filter(|&&a| a).count()
    }

    /// Destroy every entity and reset all allocator state -- generations,
    /// liveness, and the free list all start over from empty, so indices
    /// are handed out again from zero exactly as they would be for a
    /// brand-new allocator. A handle from before `clear` is never alive
    /// afterwards (`is_alive` also checks `index < self.generations.len()`),
    /// but it is not otherwise distinguished from a handle that simply
    /// never existed.
    pub fn clear(&mut self) {
        self.generations.clear();
        self.alive.clear();
        self.free_indices.clear();
    }

    pub fn capacity(&self) -> usize {
        self.generations.len()
    }

    /// Capture allocator state for a replay/determinism snapshot.
    pub fn snapshot_state(&self) -> (Vec<u8>, Vec<bool>, Vec<u32>) {
        (
            self.generations.clone(),
            self.alive.clone(),
            self.free_indices.iter().copied().collect(),
        )
    }

    /// Force `handle` to be live with its exact index and generation,
    /// growing the slot table and patching the free list as needed.
    ///
    /// Used by replay reconciliation ([`crate::snapshot::apply_deltas`]) to
    /// recreate an entity that did not exist yet under the same handle it
    /// was originally recorded with, rather than the next handle
    /// `create_entity` would hand out. Returns `true` if the slot was
    /// (re)created by this call, `false` if `handle` was already exactly
    /// this live handle.
    pub fn ensure_alive(&mut self, handle: EntityHandle) -> bool {
        let index = handle.index() as usize;
        let old_len = self.generations.len();
        if index >= old_len {
            self.generations.resize(index + 1, 0);
            self.alive.resize(index + 1, false);
            for i in old_len..index {
                self.free_indices.push_back(i as u32);
            }
        }
        if self.alive[index] && self.generations[index] == handle.generation() {
            return false;
        }
        self.free_indices.retain(|&i| i as usize != index);
        self.generations[index] = handle.generation();
        self.alive[index] = true;
        true
    }

    /// Rebuild an allocator from a previously captured snapshot.
    pub fn restore_from_snapshot(generations: Vec<u8>, alive: Vec<bool>, free_indices: Vec<u32>) -> Self {
        Self {
            generations,
            alive,
            free_indices: free_indices.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityIndex (spec.md §4.6)
// ---------------------------------------------------------------------------

/// Where a live entity's components currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: ArchetypeId,
    pub row: u32,
}

/// Dense, index-addressed map from `handle.index()` to the entity's current
/// archetype and row.
///
/// Kept consistent with archetype pushes and swap-removes by
/// [`crate::world::World`]; per spec.md §4.6, entries for dead slots are
/// undefined and must not be read (callers always check `is_alive` first).
#[derive(Debug, Default)]
pub struct EntityIndex {
    locations: Vec<EntityLocation>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self { locations: Vec::new() }
    }

    #[inline]
    fn ensure_len(&mut self, index: usize) {
        if index >= self.locations.len() {
            self.locations.resize(
                index + 1,
                EntityLocation { archetype: ArchetypeId(0), row: 0 },
            );
        }
    }

    pub fn set(&mut self, handle: EntityHandle, location: EntityLocation) {
        let index = handle.index() as usize;
        self.ensure_len(index);
        self.locations[index] = location;
    }

    pub fn get(&self, handle: EntityHandle) -> EntityLocation {
        self.locations[handle.index() as usize]
    }

    pub fn try_get(&self, handle: EntityHandle) -> Option<EntityLocation> {
        self.locations.get(handle.index() as usize).copied()
    }

    pub fn clear(&mut self) {
        self.locations.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_unique_ids() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create_entity();
        let b = alloc.create_entity();
        assert_ne!(a, b);
        assert_eq!(alloc.alive_count(), 2);
    }

    #[test]
    fn generation_increments_on_recycle() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create_entity();
        assert!(alloc.destroy_entity(a));
        let b = alloc.create_entity();
        assert_eq!(a.index(), b.index());
        assert_eq!(b.generation(), a.generation().wrapping_add(1));
    }

    #[test]
    fn stale_handle_detected() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create_entity();
        alloc.destroy_entity(a);
        let _b = alloc.create_entity();
        assert!(!alloc.is_alive(a));
    }

    #[test]
    fn double_destroy_returns_false() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create_entity();
        assert!(alloc.destroy_entity(a));
        assert!(!alloc.destroy_entity(a));
    }

    #[test]
    fn destroy_out_of_range_is_noop() {
        let mut alloc = EntityAllocator::new();
        assert!(!alloc.destroy_entity(EntityHandle::new(42, 0)));
    }

    #[test]
    fn generation_wraps_after_256_recycles() {
        let mut alloc = EntityAllocator::new();
        let first = alloc.create_entity();
        let mut current = first;
        for _ in 0..256 {
            alloc.destroy_entity(current);
            current = alloc.create_entity();
        }
        // After exactly 256 recycles the generation has wrapped back to the
        // original value: the handle is bit-identical to `first`, which is
        // the documented (not guarded-against) wrap behavior.
        assert_eq!(current, first);
    }

    #[test]
    fn ensure_alive_recreates_exact_handle_beyond_current_capacity() {
        let mut alloc = EntityAllocator::new();
        let target = EntityHandle::new(10, 3);
        assert!(alloc.ensure_alive(target));
        assert!(alloc.is_alive(target));
        assert_eq!(alloc.alive_count(), 1);

        // The skipped slots 0..10 are available for ordinary allocation.
        let first = alloc.create_entity();
        assert!(first.index() < 10);
    }

    #[test]
    fn ensure_alive_is_noop_when_already_exactly_live() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create_entity();
        assert!(!alloc.ensure_alive(a));
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut alloc = EntityAllocator::new();
        let a = alloc.create_entity();
        let _b = alloc.create_entity();
        alloc.destroy_entity(a);
        let (gens, alive, free) = alloc.snapshot_state();
        let restored = EntityAllocator::restore_from_snapshot(gens, alive, free);
        assert!(!restored.is_alive(a));
        assert_eq!(restored.alive_count(), 1);
    }
}
