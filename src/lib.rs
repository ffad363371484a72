//! Simulation host with live reload of module code and shader binaries.
//!
//! Module packages are dynamic libraries built against this crate. When a
//! package is rebuilt the host loads it beside the running one, migrates
//! every live component to the new layouts and swaps the module behaviors,
//! all between two frames.

pub mod behavior;
pub mod config;
pub mod ecs;
pub mod error;
pub mod gfx;
pub mod host;
pub mod hot_reload;

pub use behavior::{Behavior, BehaviorOwner, Module, Phase, Schedule};
pub use config::{FrameConfig, GraphicsConfig, HostConfig, HotReloadConfig};
pub use ecs::{
    Component, ComponentId, Entity, FieldKind, FieldManifest, PrimitiveKind, TypeManifest, World,
};
pub use error::{EngineError, EngineResult};
pub use gfx::{
    Backend, GraphicsDevice, HeadlessDevice, ProgramHandle, ShaderHandle, ShaderProgramSpec,
};
pub use host::{FrameClock, FrameSteps, Host, ReloadOutcome};
pub use hot_reload::{ModuleLoader, ModulePackage, PackageRegistrar, PackageSource, StaticPackage};
