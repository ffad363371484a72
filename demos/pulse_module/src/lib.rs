//! Sample module package
//!
//! Build with `cargo build -p pulse_module`; the host stages the library
//! into its plugin directory and swaps it in while running. Edit
//! `PULSE_RATE` or add a field to `Pulse` to watch live entities migrate.

use hotswap_engine::component;
use hotswap_engine::{
    Behavior, Module, PackageRegistrar, Phase, ProgramHandle, ShaderProgramSpec, World,
};

const PULSE_RATE: f32 = 2.0;
const PULSE_COUNT: u32 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Pulse {
    pub phase: f32,
    pub amplitude: f32,
    pub beats: u32,
}

component!(Pulse as "pulse::Pulse" { phase: f32, amplitude: f32, beats: u32 });

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PulseGlow {
    pub program: ProgramHandle,
    pub intensity: u16,
}

component!(PulseGlow as "pulse::PulseGlow" {
    program: ProgramHandle => ShaderProgramSpec::graphics("vs_pulse", "fs_pulse"),
    intensity: u16,
});

/// Spawns the pulses the first time the module is loaded
struct Spawner;

impl Behavior for Spawner {
    fn phase(&self) -> Phase {
        Phase::Simulation
    }

    fn name(&self) -> &str {
        "pulse spawner"
    }

    fn update(&mut self, world: &mut World, _delta_time: f32) {
        if !world.query::<Pulse>().is_empty() {
            return;
        }
        for i in 0..PULSE_COUNT {
            let pulse = Pulse {
                phase: i as f32 / PULSE_COUNT as f32,
                amplitude: 1.0,
                beats: 0,
            };
            if let Err(e) = world.spawn().with(pulse).build() {
                log::error!("Failed to spawn pulse: {}", e);
                return;
            }
        }
        log::info!("Spawned {} pulses", PULSE_COUNT);
    }
}

struct Beat;

impl Behavior for Beat {
    fn phase(&self) -> Phase {
        Phase::Simulation
    }

    fn name(&self) -> &str {
        "pulse beat"
    }

    fn update(&mut self, world: &mut World, delta_time: f32) {
        world.for_each_mut::<Pulse>(|_, pulse| {
            pulse.phase += delta_time * PULSE_RATE;
            if pulse.phase >= 1.0 {
                pulse.phase -= 1.0;
                pulse.beats += 1;
            }
        });
    }
}

struct PulseModule;

impl Module for PulseModule {
    fn name(&self) -> &str {
        "pulse"
    }

    fn behaviors(&mut self, _world: &mut World) -> Vec<Box<dyn Behavior>> {
        vec![Box::new(Spawner), Box::new(Beat)]
    }
}

fn pulse_module() -> Box<dyn Module> {
    Box::new(PulseModule)
}

pub fn register(registrar: &mut PackageRegistrar) {
    registrar
        .component::<Pulse>()
        .component::<PulseGlow>()
        .module(pulse_module);
}

hotswap_engine::declare_package!(register);
