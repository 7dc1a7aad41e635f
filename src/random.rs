//! Deterministic, named pseudo-random streams (spec.md §4.11 "Deterministic
//! Random & Replay").
//!
//! There is no PRNG implementation anywhere in the teacher's workspace to
//! ground this on directly -- `rand`/`rand_pcg` are declared in the
//! workspace's `Cargo.toml` but never used inside `nomai-ecs` itself. This
//! module is the first thing in the crate to actually reach for them.
//! `Pcg64` is chosen over a hand-rolled xoshiro/splitmix variant because it
//! is the closest fully-specified, bit-reproducible, already-in-the-tree
//! choice: same seed, same call sequence, same output, on any platform.
//!
//! `original_source/engine/ecs/System.cpp` references a
//! `SetRandomManager(DeterministicRandom*)` hook with no further detail
//! available in the retrieved source, confirming named-stream determinism
//! was part of the original design without dictating its concrete
//! implementation.

use std::collections::HashMap;

use rand::RngCore;
use rand_pcg::Pcg64;

/// The stream name every [`RngRegistry`] seeds by default.
pub const GLOBAL_STREAM: &str = "global";

/// A named collection of independent PRNG streams.
///
/// Systems draw from streams by name (spec.md: "systems requiring
/// randomness consume values from a named stream rather than from a
/// global, unscoped source, so that adding an unrelated system never
/// perturbs another system's random sequence"). Re-seeding a stream
/// discards its prior state.
#[derive(Debug, Default)]
pub struct RngRegistry {
    streams: HashMap<String, Pcg64>,
}

impl RngRegistry {
    pub fn new() -> Self {
        let mut registry = Self { streams: HashMap::new() };
        registry.seed_stream(GLOBAL_STREAM, 0);
        registry
    }

    /// (Re-)seed a named stream, creating it if it does not yet exist.
    pub fn seed_stream(&mut self, name: &str, seed: u64) {
        self.streams.insert(name.to_owned(), new_pcg64(seed));
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.streams.contains_key(name)
    }

    pub fn stream_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.streams.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn stream_mut(&mut self, name: &str) -> &mut Pcg64 {
        self.streams
            .get_mut(name)
            .unwrap_or_else(|| panic!("rng stream '{name}' has not been seeded -- call seed_stream first"))
    }

    pub fn next_u32(&mut self, stream: &str) -> u32 {
        self.stream_mut(stream).next_u32()
    }

    pub fn next_u64(&mut self, stream: &str) -> u64 {
        self.stream_mut(stream).next_u64()
    }

    /// A uniform `f64` in `[0, 1)`, the precision game/simulation code most
    /// often actually wants out of a random stream.
    pub fn next_f64(&mut self, stream: &str) -> f64 {
        (self.next_u64(stream) >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Snapshot every stream's internal state as an opaque, serializable
    /// blob per stream name -- used by the replay recorder (spec.md §6
    /// "PRNG state table"). `Pcg64`'s own 128-bit state does not collapse
    /// to the spec's illustrative "8 bytes per stream"; the full state is
    /// persisted instead so playback is bit-exact (see DESIGN.md).
    pub fn snapshot(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        self.streams
            .iter()
            .map(|(name, rng)| (name.clone(), serde_json::to_value(rng).expect("Pcg64 state always serializes")))
            .collect()
    }

    /// Restore every stream from a previously captured [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, state: &std::collections::BTreeMap<String, serde_json::Value>) {
        self.streams.clear();
        for (name, value) in state {
            let rng: Pcg64 = serde_json::from_value(value.clone()).expect("rng snapshot value must be a valid Pcg64 state");
            self.streams.insert(name.clone(), rng);
        }
    }

    pub fn clear(&mut self) {
        self.streams.clear();
        self.seed_stream(GLOBAL_STREAM, 0);
    }
}

fn new_pcg64(seed: u64) -> Pcg64 {
    use rand::SeedableRng;
    Pcg64::seed_from_u64(seed)
}

impl crate::world::World {
    /// (Re-)seed a named PRNG stream. `"global"` is always seeded to `0` by
    /// default; call this to give it (or any other stream) a specific seed
    /// before the first tick of a recording.
    pub fn seed_rng_stream(&mut self, name: &str, seed: u64) {
        self.rng.seed_stream(name, seed);
    }

    pub fn rng_next_u32(&mut self, stream: &str) -> u32 {
        self.rng.next_u32(stream)
    }

    pub fn rng_next_u64(&mut self, stream: &str) -> u64 {
        self.rng.next_u64(stream)
    }

    pub fn rng_next_f64(&mut self, stream: &str) -> f64 {
        self.rng.next_f64(stream)
    }
}
