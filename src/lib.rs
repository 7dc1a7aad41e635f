//! Archetype-based ECS storage core.
//!
//! Entities live in archetypes -- one per distinct set of component types --
//! stored Structure-of-Arrays for cache-friendly iteration. A versioned
//! [`entity::EntityHandle`] (24-bit index, 8-bit generation) identifies an
//! entity across its lifetime; stale handles into a recycled slot are
//! rejected by generation mismatch rather than detected some other way.
//!
//! # Quick Start
//!
//! ```
//! use archetype_ecs_core::prelude::*;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position", true);
//! world.register_component::<Velocity>("velocity", true);
//!
//! let e = world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }));
//!
//! for (_entity, (pos, vel)) in world.query_mut::<(&mut Position, &Velocity)>() {
//!     pos.x += vel.dx;
//!     pos.y += vel.dy;
//! }
//!
//! assert_eq!(world.get_component::<Position>(e), Some(&Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
pub mod command;
pub mod component;
pub mod entity;
pub mod manager;
#[allow(unsafe_code)]
pub mod query;
pub mod random;
pub mod replay;
pub mod scheduler;
pub mod snapshot;
#[allow(unsafe_code)]
pub mod transition;
#[allow(unsafe_code)]
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Structural failures surfaced to the host (spec.md §7: dead-handle and
/// missing-component conditions stay `Option`/no-op throughout the crate and
/// never reach this enum -- it is reserved for conditions a caller cannot
/// route around by simply checking liveness first).
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// A snapshot referenced a component name that is not registered on the
    /// restoring `World`.
    #[error("snapshot references unregistered component '{name}'")]
    UnknownComponentInSnapshot { name: String },

    /// Two or more systems in the same phase form a dependency cycle and
    /// cannot be topologically ordered.
    #[error("systems in phase {phase} form a dependency cycle: {systems:?}")]
    CyclicSystemDependency { phase: &'static str, systems: Vec<String> },

    /// A system panicked while executing; the tick was aborted at that
    /// point.
    #[error("system '{system}' panicked during update")]
    SystemPanicked { system: String },

    /// A replay log's header checksum did not match the checksum computed
    /// from its own first frame -- the file is corrupt or was hand-edited.
    #[error("replay header checksum mismatch: expected {expected}, file contains {actual}")]
    ReplayChecksumMismatch { expected: String, actual: String },

    /// A replay log violates a structural invariant (no frames, first frame
    /// not a full snapshot, a later frame that is).
    #[error("malformed replay log: {reason}")]
    ReplayMalformed { reason: String },

    #[error("failed to encode replay log: {0}")]
    ReplayEncode(#[from] bincode::error::EncodeError),

    #[error("failed to decode replay log: {0}")]
    ReplayDecode(#[from] bincode::error::DecodeError),

    #[error("replay file I/O failed: {0}")]
    ReplayIo(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, EMPTY_ARCHETYPE};
    pub use crate::command::{CommandBuffer, DeferredCommand, RawValue};
    pub use crate::component::{ComponentInfo, ComponentRegistry, ComponentTypeId};
    pub use crate::entity::{EntityHandle, EntityLocation};
    pub use crate::query::{Query, QueryItem, QueryIter, QueryIterMut};
    pub use crate::random::{RngRegistry, GLOBAL_STREAM};
    pub use crate::replay::{Player, PlaybackStep, Recorder, ReplayLog, ReplayOutcome};
    pub use crate::scheduler::{ComponentAccess, Phase, Scheduler, SystemDescriptor};
    pub use crate::snapshot::{EntityDelta, EntityDiff, WorldSnapshot};
    pub use crate::world::{Bundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Position>("position", true);
        world.register_component::<Velocity>("velocity", true);
        world.register_component::<Health>("health", false);
        world
    }

    #[test]
    fn spawn_entities_with_components_and_query_back() {
        let mut world = setup_world();
        let e1 = world.spawn((Position { x: 1.0, y: 2.0 }, Velocity { dx: 3.0, dy: 4.0 }));
        let _e2 = world.spawn((Position { x: 10.0, y: 20.0 },));

        assert_eq!(world.get_component::<Position>(e1), Some(&Position { x: 1.0, y: 2.0 }));
        assert_eq!(world.get_component::<Velocity>(e1), Some(&Velocity { dx: 3.0, dy: 4.0 }));

        let results: Vec<_> = world.query::<(&Position, &Velocity)>().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, e1);
    }

    #[test]
    fn destroy_entity_then_verify_gone() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        assert!(world.destroy_entity(e));
        assert!(!world.is_alive(e));
        assert_eq!(world.get_component::<Position>(e), None);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn add_component_triggers_migration() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 1.0, y: 2.0 },));
        let archetype_count_before = world.archetype_count();

        world.add_component(e, Velocity { dx: 5.0, dy: 6.0 });

        assert!(world.has_component::<Velocity>(e));
        assert_eq!(world.get_component::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));
        assert!(world.archetype_count() > archetype_count_before);
    }

    #[test]
    fn remove_component_triggers_migration() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 1.0, y: 2.0 }, Velocity { dx: 3.0, dy: 4.0 }));

        world.remove_component::<Velocity>(e);

        assert!(!world.has_component::<Velocity>(e));
        assert_eq!(world.get_component::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn query_skips_entities_missing_required_component() {
        let mut world = setup_world();
        for i in 0..5 {
            world.spawn((Position { x: i as f32, y: 0.0 },));
        }
        let count = world.query::<(&Position, &Velocity)>().count();
        assert_eq!(count, 0);
    }

    #[test]
    fn mutable_query_modifies_components() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 2.0 }));

        for (_entity, (pos, vel)) in world.query_mut::<(&mut Position, &Velocity)>() {
            pos.x += vel.dx;
            pos.y += vel.dy;
        }

        assert_eq!(world.get_component::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));
    }

    #[test]
    fn scale_10k_entities() {
        let mut world = setup_world();
        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let e = world.spawn((
                Position { x: i as f32, y: i as f32 * 2.0 },
                Velocity { dx: 1.0, dy: -1.0 },
            ));
            entities.push(e);
        }

        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 10_000);

        for (_entity, (vel,)) in world.query_mut::<(&mut Velocity,)>() {
            vel.dx *= 2.0;
            vel.dy *= 2.0;
        }
        let vel = world.get_component::<Velocity>(entities[0]).unwrap();
        assert_eq!(vel.dx, 2.0);
        assert_eq!(vel.dy, -2.0);

        for e in entities.iter().take(5_000) {
            world.destroy_entity(*e);
        }
        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 5_000);
        assert_eq!(world.entity_count(), 5_000);
    }

    #[test]
    fn stale_entity_operations_are_noops_not_errors() {
        // spec.md §7: the core crate never errors on a stale handle, unlike
        // the teacher's `StaleEntity` error -- callers check `is_alive`.
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.destroy_entity(e);
        assert!(!world.destroy_entity(e));
        assert!(world.add_component(e, Velocity { dx: 1.0, dy: 1.0 }).is_none());
    }

    #[test]
    fn scheduler_runs_phases_and_replay_reproduces_result() {
        let mut world = setup_world();
        let e = world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 1.0 }));

        let mut scheduler = Scheduler::new();
        scheduler.register_system(SystemDescriptor::new("movement", Phase::Simulation, |world, dt| {
            for (_entity, (pos, vel)) in world.query_mut::<(&mut Position, &Velocity)>() {
                pos.x += vel.dx * dt as f32;
                pos.y += vel.dy * dt as f32;
            }
        }));

        let mut recorder = Recorder::start_recording(0);
        for tick in 0..4u64 {
            scheduler.update(&mut world, 1.0).unwrap();
            recorder.record_tick(&world, tick, tick as f64, serde_json::json!({}));
        }
        let expected = *world.get_component::<Position>(e).unwrap();
        let log = recorder.stop_recording();

        let mut replay_world = setup_world();
        let mut player = Player::from_log(log);
        let outcome = player.play_replay(&mut replay_world).unwrap();

        assert_eq!(outcome.ticks_replayed, 4);
        assert!(outcome.first_divergence.is_none());
        assert_eq!(replay_world.get_component::<Position>(e), Some(&expected));
    }
}
