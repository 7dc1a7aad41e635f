//! System scheduler (spec.md §4.12 "System Scheduler").
//!
//! Grounded on `original_source/engine/ecs/System.cpp`'s `SystemManager`:
//! systems are registered with a phase and a declared set of component
//! accesses, the schedule is built once and cached until systems change
//! (`BuildSchedule`/`scheduleDirty_`), same-phase systems with overlapping
//! write access are flagged (`EmitComponentConflicts`/`HasComponentConflict`)
//! rather than rejected, and a dependency map can be exported as a document
//! (`ExportDocumentation`). The teacher's workspace has no scheduler of its
//! own to generalize, so this module's control flow is new code written in
//! the teacher's idiom (`tracing` diagnostics, `thiserror`-surfaced
//! failures) rather than a modification of an existing file.
//!
//! Ordering within a phase is topological over declared system-to-system
//! dependencies (Kahn's algorithm), tie-broken by registration order so two
//! runs that register the same systems in the same order always schedule
//! them identically.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::component::ComponentTypeId;
use crate::world::World;
use crate::EcsError;

/// The three fixed update phases (spec.md §4.12), run in this order every
/// tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Input,
    Simulation,
    RenderPrep,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::Input, Phase::Simulation, Phase::RenderPrep];

    fn as_str(self) -> &'static str {
        match self {
            Phase::Input => "Input",
            Phase::Simulation => "Simulation",
            Phase::RenderPrep => "Render Prep",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a system touches one of its declared component types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentAccess {
    Read,
    Write,
    ReadWrite,
}

impl ComponentAccess {
    fn writes(self) -> bool {
        matches!(self, ComponentAccess::Write | ComponentAccess::ReadWrite)
    }

    fn as_str(self) -> &'static str {
        match self {
            ComponentAccess::Read => "Read",
            ComponentAccess::Write => "Write",
            ComponentAccess::ReadWrite => "Read/Write",
        }
    }
}

type SystemFn = Box<dyn FnMut(&mut World, f64) + Send>;

/// One registered system: its update phase, a name for documentation and
/// diagnostics, the component types it declares access to, any other
/// systems it must run after within the same phase, and the closure it
/// runs every matching tick.
pub struct SystemDescriptor {
    name: String,
    phase: Phase,
    component_access: Vec<(ComponentTypeId, ComponentAccess)>,
    runs_after: Vec<String>,
    update: SystemFn,
}

impl SystemDescriptor {
    pub fn new(name: impl Into<String>, phase: Phase, update: impl FnMut(&mut World, f64) + Send + 'static) -> Self {
        Self {
            name: name.into(),
            phase,
            component_access: Vec::new(),
            runs_after: Vec::new(),
            update: Box::new(update),
        }
    }

    #[must_use]
    pub fn accesses(mut self, type_id: ComponentTypeId, access: ComponentAccess) -> Self {
        self.component_access.push((type_id, access));
        self
    }

    #[must_use]
    pub fn after(mut self, system_name: impl Into<String>) -> Self {
        self.runs_after.push(system_name.into());
        self
    }
}

impl fmt::Debug for SystemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDescriptor")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("runs_after", &self.runs_after)
            .finish_non_exhaustive()
    }
}

/// Registers systems, builds a cached schedule, and runs every phase in
/// order each tick.
#[derive(Default)]
pub struct Scheduler {
    systems: Vec<SystemDescriptor>,
    schedule: Option<Vec<usize>>,
    documentation_path: Option<std::path::PathBuf>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a system under `system.name`. Re-registering an already
    /// used identifier replaces the prior registration in place (spec.md
    /// §4.10: "re-registration of the same identifier replaces the prior
    /// registration") rather than running both.
    pub fn register_system(&mut self, system: SystemDescriptor) {
        self.systems.retain(|s| s.name != system.name);
        self.systems.push(system);
        self.schedule = None;
    }

    /// Discard every registered system (spec.md: schedule rebuilds from
    /// scratch on next `update`).
    pub fn clear(&mut self) {
        self.systems.clear();
        self.schedule = None;
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// Write a Markdown dependency map to `path` every time the schedule is
    /// rebuilt (mirrors `SetDocumentationOutputPath` / `ExportDocumentation`
    /// in the grounding source). Pass `None` to stop exporting.
    pub fn set_documentation_output(&mut self, path: Option<std::path::PathBuf>) {
        self.documentation_path = path;
    }

    /// Rebuild the cached execution order if systems have changed since the
    /// last build. Detects same-phase write conflicts (logged, not fatal)
    /// and dependency cycles (fatal, per system `runs_after` edges).
    pub fn build_schedule(&mut self) -> Result<(), EcsError> {
        if self.schedule.is_some() {
            return Ok(());
        }

        let mut order = Vec::with_capacity(self.systems.len());
        for phase in Phase::ALL {
            order.extend(self.topo_sort_phase(phase)?);
        }

        self.emit_component_conflicts();
        if let Some(path) = self.documentation_path.clone() {
            self.export_documentation(&path);
        }

        self.schedule = Some(order);
        Ok(())
    }

    /// Kahn's algorithm over the systems in `phase`, edges from
    /// `runs_after`, ties broken by registration order.
    fn topo_sort_phase(&self, phase: Phase) -> Result<Vec<usize>, EcsError> {
        let indices: Vec<usize> = self
            .systems
            .iter()
            .enumerate()
            .filter(|(_, s)| s.phase == phase)
            .map(|(i, _)| i)
            .collect();

        let name_to_index: HashMap<&str, usize> =
            indices.iter().map(|&i| (self.systems[i].name.as_str(), i)).collect();

        let mut in_degree: HashMap<usize, usize> = indices.iter().map(|&i| (i, 0)).collect();
        let mut dependents: HashMap<usize, Vec<usize>> = indices.iter().map(|&i| (i, Vec::new())).collect();

        for &i in &indices {
            for dep_name in &self.systems[i].runs_after {
                let Some(&dep_index) = name_to_index.get(dep_name.as_str()) else {
                    tracing::warn!(
                        system = %self.systems[i].name,
                        dependency = %dep_name,
                        "system declares a dependency not registered in the same phase, ignored",
                    );
                    continue;
                };
                *in_degree.get_mut(&i).unwrap() += 1;
                dependents.get_mut(&dep_index).unwrap().push(i);
            }
        }

        // `indices` is already in registration order, so the initial ready
        // set built from it stays tie-broken correctly without re-sorting.
        let mut ready: VecDeque<usize> = indices.iter().copied().filter(|i| in_degree[i] == 0).collect();

        let mut order = Vec::with_capacity(indices.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            let mut unlocked = Vec::new();
            for &dependent in &dependents[&i] {
                let degree = in_degree.get_mut(&dependent).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    unlocked.push(dependent);
                }
            }
            unlocked.sort_unstable();
            for u in unlocked {
                ready.push_back(u);
            }
        }

        if order.len() != indices.len() {
            let mut cycle: Vec<String> = indices
                .into_iter()
                .filter(|i| !order.contains(i))
                .map(|i| self.systems[i].name.clone())
                .collect();
            cycle.sort();
            return Err(EcsError::CyclicSystemDependency { phase: phase.as_str(), systems: cycle });
        }

        Ok(order)
    }

    fn emit_component_conflicts(&self) {
        for phase in Phase::ALL {
            let in_phase: Vec<&SystemDescriptor> = self.systems.iter().filter(|s| s.phase == phase).collect();
            for i in 0..in_phase.len() {
                for j in (i + 1)..in_phase.len() {
                    if has_component_conflict(&in_phase[i].component_access, &in_phase[j].component_access) {
                        tracing::warn!(
                            phase = %phase,
                            system_a = %in_phase[i].name,
                            system_b = %in_phase[j].name,
                            "component access conflict detected between systems in the same phase",
                        );
                    }
                }
            }
        }
    }

    /// Render the current registration as a Markdown dependency map, one
    /// table per phase, and write it to `path`.
    fn export_documentation(&self, path: &std::path::Path) {
        let mut out = String::from("# System Dependency Map\n\n");
        if self.systems.is_empty() {
            out.push_str("_No systems registered._\n");
        } else {
            for phase in Phase::ALL {
                let in_phase: Vec<&SystemDescriptor> = self.systems.iter().filter(|s| s.phase == phase).collect();
                if in_phase.is_empty() {
                    continue;
                }
                out.push_str(&format!("## Phase: {phase}\n\n"));
                out.push_str("| System | Component Access | Runs After |\n");
                out.push_str("| --- | --- | --- |\n");
                for system in in_phase {
                    let access = if system.component_access.is_empty() {
                        "None".to_owned()
                    } else {
                        system
                            .component_access
                            .iter()
                            .map(|(id, access)| format!("{id:?} ({})", access.as_str()))
                            .collect::<Vec<_>>()
                            .join("<br/>")
                    };
                    let deps = if system.runs_after.is_empty() {
                        "None".to_owned()
                    } else {
                        system.runs_after.join("<br/>")
                    };
                    out.push_str(&format!("| {} | {} | {} |\n", system.name, access, deps));
                }
                out.push('\n');
            }
        }

        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                tracing::warn!(?err, path = %parent.display(), "failed to create documentation directory");
                return;
            }
        }
        if let Err(err) = std::fs::write(path, out) {
            tracing::warn!(?err, path = %path.display(), "failed to write system dependency documentation");
        }
    }

    /// Run every phase's systems, in schedule order, once, flushing the
    /// deferred command buffer after the last system of each phase (spec.md
    /// §4.10 point 4). Rebuilds the schedule first if it is stale.
    ///
    /// A panicking system aborts the rest of the current tick -- later
    /// phases do not run -- but the deferred buffer is flushed before the
    /// error is returned so archetype invariants are restored even on
    /// failure (spec.md §4.12 Failure: "the deferred buffer is still
    /// flushed to restore invariants"). The unwind is isolated per system
    /// via `catch_unwind`.
    pub fn update(&mut self, world: &mut World, dt: f64) -> Result<(), EcsError> {
        self.build_schedule()?;
        let order = self.schedule.clone().expect("just built");

        for phase in Phase::ALL {
            for &index in order.iter().filter(|&&i| self.systems[i].phase == phase) {
                let system = &mut self.systems[index];
                let name = system.name.clone();
                let update = &mut system.update;
                let result = catch_unwind(AssertUnwindSafe(|| update(world, dt)));
                if result.is_err() {
                    tracing::error!(system = %name, "system panicked during update, tick continues without it");
                    world.flush_deferred();
                    return Err(EcsError::SystemPanicked { system: name });
                }
            }
            world.flush_deferred();
        }
        Ok(())
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("system_count", &self.systems.len())
            .field("schedule_built", &self.schedule.is_some())
            .finish()
    }
}

/// Mirrors `HasComponentConflict`: two systems conflict if they share a
/// component type and at least one of them writes it.
fn has_component_conflict(a: &[(ComponentTypeId, ComponentAccess)], b: &[(ComponentTypeId, ComponentAccess)]) -> bool {
    for &(type_a, access_a) in a {
        for &(type_b, access_b) in b {
            if type_a == type_b && (access_a.writes() || access_b.writes()) {
                return true;
            }
        }
    }
    false
}
