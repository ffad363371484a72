use super::{Behavior, Phase};
use crate::ecs::World;

/// Who registered a behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BehaviorOwner {
    /// Host-defined, survives reloads
    Builtin,
    /// Contributed by the named module
    Module(String),
}

struct Entry {
    owner: BehaviorOwner,
    behavior: Box<dyn Behavior>,
}

/// Ordered input, simulation and render groups
#[derive(Default)]
pub struct Schedule {
    input: Vec<Entry>,
    simulation: Vec<Entry>,
    render: Vec<Entry>,
    initialized: bool,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    fn group_mut(&mut self, phase: Phase) -> &mut Vec<Entry> {
        match phase {
            Phase::Input => &mut self.input,
            Phase::Simulation => &mut self.simulation,
            Phase::Render => &mut self.render,
        }
    }

    fn group(&self, phase: Phase) -> &[Entry] {
        match phase {
            Phase::Input => &self.input,
            Phase::Simulation => &self.simulation,
            Phase::Render => &self.render,
        }
    }

    fn push(&mut self, owner: BehaviorOwner, behavior: Box<dyn Behavior>) {
        log::debug!(
            "Registered {} behavior {} ({:?})",
            phase_name(behavior.phase()),
            behavior.name(),
            owner
        );
        self.group_mut(behavior.phase()).push(Entry { owner, behavior });
    }

    /// Add a host-defined behavior
    pub fn add_builtin(&mut self, behavior: Box<dyn Behavior>) {
        self.push(BehaviorOwner::Builtin, behavior);
    }

    /// Add the behaviors of one module, in the order given
    pub fn register_module(&mut self, module: &str, behaviors: Vec<Box<dyn Behavior>>) -> usize {
        let count = behaviors.len();
        for behavior in behaviors {
            self.push(BehaviorOwner::Module(module.to_string()), behavior);
        }
        count
    }

    /// Remove and dispose every module-owned behavior, keeping builtins
    pub fn teardown_modules(&mut self, world: &mut World) -> usize {
        let mut disposed = 0;
        for phase in [Phase::Input, Phase::Simulation, Phase::Render] {
            let group = std::mem::take(self.group_mut(phase));
            let mut kept = Vec::with_capacity(group.len());
            for mut entry in group {
                if entry.owner == BehaviorOwner::Builtin {
                    kept.push(entry);
                } else {
                    entry.behavior.dispose(world);
                    disposed += 1;
                }
            }
            *self.group_mut(phase) = kept;
        }
        disposed
    }

    /// Run `initialize` on every current behavior. Only the first call does
    /// anything; behaviors registered later are never initialized.
    pub fn initialize(&mut self, world: &mut World) -> bool {
        if self.initialized {
            return false;
        }
        self.initialized = true;
        for phase in [Phase::Input, Phase::Simulation, Phase::Render] {
            for entry in self.group_mut(phase).iter_mut() {
                entry.behavior.initialize(world);
            }
        }
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// One step of a phase group: every `before_update`, then every
    /// `update`, then every `after_update`
    pub fn run_phase(&mut self, phase: Phase, world: &mut World, delta_time: f32) {
        let group = self.group_mut(phase);
        for entry in group.iter_mut() {
            entry.behavior.before_update(world, delta_time);
        }
        for entry in group.iter_mut() {
            entry.behavior.update(world, delta_time);
        }
        for entry in group.iter_mut() {
            entry.behavior.after_update(world, delta_time);
        }
    }

    pub fn len(&self, phase: Phase) -> usize {
        self.group(phase).len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.simulation.is_empty() && self.render.is_empty()
    }

    /// Names of one phase group in run order
    pub fn behavior_names(&self, phase: Phase) -> Vec<String> {
        self.group(phase).iter().map(|e| e.behavior.name().to_string()).collect()
    }

    /// Dispose and drop every behavior
    pub fn shutdown(&mut self, world: &mut World) {
        for phase in [Phase::Input, Phase::Simulation, Phase::Render] {
            for mut entry in std::mem::take(self.group_mut(phase)) {
                entry.behavior.dispose(world);
            }
        }
    }
}

fn phase_name(phase: Phase) -> &'static str {
    match phase {
        Phase::Input => "input",
        Phase::Simulation => "simulation",
        Phase::Render => "render",
    }
}
