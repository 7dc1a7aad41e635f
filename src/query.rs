//! Multi-component query and iteration, serial and parallel-chunked.
//!
//! [`QueryItem`] describes fetching a single `&T`/`&mut T` out of an
//! archetype row; [`Query`] composes 1-4 of them into a tuple fetch. Both
//! traits are GAT-based (`type Item<'w>`) so the borrow returned by
//! `fetch`/`fetch_row` can outlive the call without tying it to `&self`.
//! This mirrors the teacher's `query.rs` design verbatim for the traversal
//! machinery; what's added here is the callback-style `for_each`/
//! `par_for_each` the spec requires on top of the teacher's
//! `Iterator`-returning `query`/`query_mut`.
//!
//! Mutable fetches cast the `&World` borrow to a raw pointer and back to
//! `&mut`, exactly as the teacher's `impl QueryItem for &mut T` does. This
//! is sound only because `fetch`/`fetch_row` are reachable exclusively
//! through `World::query_mut`, `World::for_each`, and `World::par_for_each`,
//! each of which holds `&mut World` (or, for `par_for_each`, partitions
//! disjoint row ranges across threads) for the duration of the traversal,
//! so no two live references to the same row's data can exist at once.

#![allow(unsafe_code)]

use crate::archetype::ArchetypeId;
use crate::component::ComponentTypeId;
use crate::entity::EntityHandle;
use crate::world::World;

// ---------------------------------------------------------------------------
// QueryItem
// ---------------------------------------------------------------------------

pub trait QueryItem {
    type Item<'w>;
    const MUTABLE: bool;

    fn component_type_id(world: &World) -> Option<ComponentTypeId>;
    fn fetch(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_>;
}

impl<T: 'static> QueryItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn component_type_id(world: &World) -> Option<ComponentTypeId> {
        world.component_type_id::<T>()
    }

    fn fetch(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
        let type_id = Self::component_type_id(world).expect("component type not registered");
        world
            .archetype(archetype)
            .get_component::<T>(type_id, row)
            .expect("row must contain the queried component")
    }
}

impl<T: 'static> QueryItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn component_type_id(world: &World) -> Option<ComponentTypeId> {
        world.component_type_id::<T>()
    }

    fn fetch(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
        let type_id = Self::component_type_id(world).expect("component type not registered");
        // Safety: see module-level soundness note -- this is only invoked
        // through traversal entry points that guarantee exclusive,
        // non-overlapping access to `row` for the duration of the fetch.
        let world_mut = unsafe { &mut *(world as *const World as *mut World) };
        world_mut
            .archetype_mut(archetype)
            .get_component_mut::<T>(type_id, row)
            .expect("row must contain the queried component")
    }
}

// ---------------------------------------------------------------------------
// Query (tuples)
// ---------------------------------------------------------------------------

pub trait Query {
    type Item<'w>;
    const HAS_MUTABLE: bool;

    fn type_ids(world: &World) -> Option<Vec<ComponentTypeId>>;
    fn validate_no_duplicate_muts(world: &World);
    fn fetch_row(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_>;
}

fn validate_no_access_conflicts(items: &[(bool, Option<ComponentTypeId>)]) {
    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            let (mut_i, type_i) = items[i];
            let (mut_j, type_j) = items[j];
            if let (Some(a), Some(b)) = (type_i, type_j) {
                if a == b && (mut_i || mut_j) {
                    panic!(
                        "query requests conflicting access to the same component type in positions {} and {}",
                        i, j
                    );
                }
            }
        }
    }
}

macro_rules! impl_query_tuple {
    ($($t:ident),+) => {
        impl<$($t: QueryItem),+> Query for ($($t,)+) {
            type Item<'w> = ($($t::Item<'w>,)+);
            const HAS_MUTABLE: bool = { false $(|| $t::MUTABLE)+ };

            fn type_ids(world: &World) -> Option<Vec<ComponentTypeId>> {
                let mut ids = Vec::new();
                $(
                    ids.push($t::component_type_id(world)?);
                )+
                Some(ids)
            }

            fn validate_no_duplicate_muts(world: &World) {
                let items: Vec<(bool, Option<ComponentTypeId>)> = vec![
                    $(($t::MUTABLE, $t::component_type_id(world)),)+
                ];
                validate_no_access_conflicts(&items);
            }

            #[allow(non_snake_case)]
            fn fetch_row(world: &World, archetype: ArchetypeId, row: usize) -> Self::Item<'_> {
                $(
                    let $t = $t::fetch(world, archetype, row);
                )+
                ($($t,)+)
            }
        }
    };
}

impl_query_tuple!(A);
impl_query_tuple!(A, B);
impl_query_tuple!(A, B, C);
impl_query_tuple!(A, B, C, D);

// ---------------------------------------------------------------------------
// Iterator-style queries (read-only and exclusive)
// ---------------------------------------------------------------------------

pub struct QueryIter<'w, Q: Query> {
    world: &'w World,
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (EntityHandle, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let archetype_id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.world.archetype(archetype_id);
            if self.row_cursor >= archetype.len() {
                self.arch_cursor += 1;
                self.row_cursor = 0;
                continue;
            }
            let row = self.row_cursor;
            self.row_cursor += 1;
            let handle = archetype.entities()[row];
            return Some((handle, Q::fetch_row(self.world, archetype_id, row)));
        }
    }
}

pub struct QueryIterMut<'w, Q: Query> {
    world: &'w World,
    archetypes: Vec<ArchetypeId>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: std::marker::PhantomData<Q>,
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (EntityHandle, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let archetype_id = *self.archetypes.get(self.arch_cursor)?;
            let archetype = self.world.archetype(archetype_id);
            if self.row_cursor >= archetype.len() {
                self.arch_cursor += 1;
                self.row_cursor = 0;
                continue;
            }
            let row = self.row_cursor;
            self.row_cursor += 1;
            let handle = archetype.entities()[row];
            return Some((handle, Q::fetch_row(self.world, archetype_id, row)));
        }
    }
}

impl World {
    /// Read-only iteration over every archetype whose signature is a
    /// superset of `Q`'s component set, ascending by archetype id then row.
    /// Panics if `Q` contains any `&mut T` item (use `query_mut`).
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        assert!(!Q::HAS_MUTABLE, "use World::query_mut for queries containing &mut T");
        let archetypes = match Q::type_ids(self) {
            Some(ids) => self.archetype_manager_ref().archetypes_with_all(&ids),
            None => Vec::new(),
        };
        QueryIter { world: self, archetypes, arch_cursor: 0, row_cursor: 0, _marker: std::marker::PhantomData }
    }

    /// Iteration allowing `&mut T` items. Requires `&mut self` so no other
    /// borrow of the world can be live concurrently.
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        Q::validate_no_duplicate_muts(self);
        let archetypes = match Q::type_ids(self) {
            Some(ids) => self.archetype_manager_ref().archetypes_with_all(&ids),
            None => Vec::new(),
        };
        QueryIterMut { world: self, archetypes, arch_cursor: 0, row_cursor: 0, _marker: std::marker::PhantomData }
    }

    /// Invoke `f(handle, items)` for every row of every archetype whose
    /// signature is a superset of `Q`'s component set, in ascending
    /// archetype-id then ascending-row order (spec.md §4.9). Mutations
    /// issued from inside `f` are deferred until the call returns.
    pub fn for_each<Q: Query>(&mut self, mut f: impl FnMut(EntityHandle, Q::Item<'_>)) {
        Q::validate_no_duplicate_muts(self);
        let Some(required) = Q::type_ids(self) else { return };
        self.enter_iteration();
        let archetypes = self.archetype_manager_ref().archetypes_with_all(&required);
        for archetype_id in archetypes {
            let len = self.archetype(archetype_id).len();
            for row in 0..len {
                let handle = self.archetype(archetype_id).entities()[row];
                let item = Q::fetch_row(self, archetype_id, row);
                f(handle, item);
            }
        }
        self.leave_iteration();
    }

    /// Same traversal as [`for_each`](Self::for_each), but each matching
    /// archetype's row range is partitioned into up to `thread_count`
    /// contiguous chunks processed on a dedicated `rayon` thread pool sized
    /// to `thread_count`. Archetypes are still processed one at a time: the
    /// parallel section for one archetype completes (`rayon::scope` joins
    /// every spawned chunk) before the next archetype is entered (spec.md
    /// §4.9/§5).
    pub fn par_for_each<Q>(&mut self, thread_count: usize, f: impl Fn(EntityHandle, Q::Item<'_>) + Sync)
    where
        Q: Query,
    {
        Q::validate_no_duplicate_muts(self);
        let Some(required) = Q::type_ids(self) else { return };
        self.enter_iteration();

        struct WorldPtr(*mut World);
        // Safety: each spawned task below operates on a disjoint row range
        // within the one archetype currently being processed, and
        // `rayon::Scope::scope` joins every task for that archetype before
        // the next archetype's chunks are spawned.
        unsafe impl Send for WorldPtr {}
        unsafe impl Sync for WorldPtr {}
        let world_ptr = WorldPtr(self as *mut World);

        let archetypes = self.archetype_manager_ref().archetypes_with_all(&required);
        let thread_count = thread_count.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .build()
            .expect("failed to build rayon thread pool for par_for_each");

        for archetype_id in archetypes {
            let len = self.archetype(archetype_id).len();
            if len == 0 {
                continue;
            }
            // Degrades to one chunk per row when there are fewer rows than
            // threads (spec.md §8 boundary behavior).
            let chunks = thread_count.min(len);
            let chunk_size = len.div_ceil(chunks);
            pool.scope(|scope| {
                for c in 0..chunks {
                    let start = c * chunk_size;
                    let end = ((c + 1) * chunk_size).min(len);
                    if start >= end {
                        continue;
                    }
                    let f = &f;
                    let world_ptr = &world_ptr;
                    scope.spawn(move |_| {
                        let world: &World = unsafe { &*world_ptr.0 };
                        let archetype = world.archetype(archetype_id);
                        for row in start..end {
                            let handle = archetype.entities()[row];
                            let item = Q::fetch_row(world, archetype_id, row);
                            f(handle, item);
                        }
                    });
                }
            });
        }

        self.leave_iteration();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::World;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
    }
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Vel {
        dx: f32,
    }

    #[test]
    fn query_matching_only() {
        let mut world = World::new();
        world.register_component::<Pos>("pos", true);
        world.register_component::<Vel>("vel", true);
        world.spawn((Pos { x: 1.0 },));
        world.spawn((Pos { x: 2.0 }, Vel { dx: 1.0 }));

        let count = world.query::<(&Pos,)>().count();
        assert_eq!(count, 2);
        let count = world.query::<(&Pos, &Vel)>().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn query_mut_modifies_values() {
        let mut world = World::new();
        world.register_component::<Pos>("pos", true);
        world.spawn((Pos { x: 1.0 },));
        world.spawn((Pos { x: 2.0 },));

        for (_, (pos,)) in world.query_mut::<(&mut Pos,)>() {
            pos.x += 10.0;
        }
        let values: Vec<f32> = world.query::<(&Pos,)>().map(|(_, (p,))| p.x).collect();
        assert_eq!(values, vec![11.0, 12.0]);
    }

    #[test]
    #[should_panic]
    fn query_mut_rejects_duplicate_mutable() {
        let mut world = World::new();
        world.register_component::<Pos>("pos", true);
        world.spawn((Pos { x: 1.0 },));
        let _ = world.query_mut::<(&mut Pos, &mut Pos)>().count();
    }

    #[test]
    fn for_each_visits_every_matching_row() {
        let mut world = World::new();
        world.register_component::<Pos>("pos", true);
        world.spawn((Pos { x: 1.0 },));
        world.spawn((Pos { x: 2.0 },));
        world.spawn((Pos { x: 3.0 },));

        let mut sum = 0.0;
        world.for_each::<(&Pos,)>(|_, (p,)| sum += p.x);
        assert_eq!(sum, 6.0);
    }

    #[test]
    fn par_for_each_visits_every_row_exactly_once() {
        let mut world = World::new();
        world.register_component::<Pos>("pos", true);
        for i in 0..37 {
            world.spawn((Pos { x: i as f32 },));
        }
        let counter = std::sync::atomic::AtomicUsize::new(0);
        world.par_for_each::<(&Pos,)>(4, |_, (_p,)| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 37);
    }
}
