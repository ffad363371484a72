//! Behaviors and modules
//!
//! A module is the unit a reloadable package contributes. It hands the host a
//! list of behaviors, each tagged with the frame phase it runs in.

pub mod schedule;

pub use schedule::{BehaviorOwner, Schedule};

use serde::{Deserialize, Serialize};

use crate::ecs::World;

/// Frame phase a behavior runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Once per frame, before simulation
    Input,
    /// Once per fixed simulation step
    Simulation,
    /// Once per rendered frame
    Render,
}

/// Per-frame logic operating on the world
pub trait Behavior: Send {
    /// Phase group this behavior is registered in
    fn phase(&self) -> Phase;

    /// Get the name of this behavior for debugging
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once when the host starts
    fn initialize(&mut self, _world: &mut World) {}

    fn before_update(&mut self, _world: &mut World, _delta_time: f32) {}

    /// Called every step of the behavior's phase
    fn update(&mut self, world: &mut World, delta_time: f32);

    fn after_update(&mut self, _world: &mut World, _delta_time: f32) {}

    /// Called when the behavior is torn down by a reload or at shutdown
    fn dispose(&mut self, _world: &mut World) {}
}

/// Named unit of behaviors contributed by a package
pub trait Module: Send {
    fn name(&self) -> &str;

    /// Create this module's behaviors, in registration order
    fn behaviors(&mut self, world: &mut World) -> Vec<Box<dyn Behavior>>;
}
