//! Host lifecycle
//!
//! `Host` owns the entity store, the behavior schedule and every reload
//! collaborator. It is the only writer of the world: background pipelines
//! post events, and `tick` applies them on the calling thread before any
//! behavior runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::behavior::{Behavior, Phase, Schedule};
use crate::config::HostConfig;
use crate::ecs::World;
use crate::error::EngineResult;
use crate::gfx::{GraphicsDevice, ShaderLibrary};
use crate::hot_reload::{
    migrate, ArtifactStager, BuildCycle, BuildInvoker, ChangeWatcher, EventQueue, EventSender,
    FileFilter, MigrationReport, ModulePackage, PackageSource, PipelineReport, ReloadEvent,
    ShaderCompileCycle, ShaderCompiler, ShaderHotSwap, WatchPipeline,
};

/// Steps owed for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSteps {
    /// Clamped time since the previous frame
    pub input_dt: f32,
    /// Fixed simulation steps to run
    pub ticks: u32,
    pub tick_dt: f32,
    /// Time since the previous render when a render is due
    pub render_dt: Option<f32>,
}

/// Fixed-step frame pacing
#[derive(Debug, Clone)]
pub struct FrameClock {
    tick_step: f64,
    frame_step: f64,
    max_frame_time: f64,
    tick_accumulator: f64,
    frame_accumulator: f64,
}

impl FrameClock {
    pub fn new(tick_rate: f64, frame_rate: f64, max_frame_time: f64) -> Self {
        Self {
            tick_step: 1.0 / tick_rate.max(1.0),
            frame_step: 1.0 / frame_rate.max(1.0),
            max_frame_time: max_frame_time.max(0.0),
            tick_accumulator: 0.0,
            frame_accumulator: 0.0,
        }
    }

    pub fn tick_step(&self) -> f64 {
        self.tick_step
    }

    /// Account for `elapsed` wall time and report the steps owed
    pub fn advance(&mut self, elapsed: Duration) -> FrameSteps {
        let dt = elapsed.as_secs_f64().min(self.max_frame_time);
        self.tick_accumulator += dt;
        self.frame_accumulator += dt;

        let mut ticks = 0;
        while self.tick_accumulator >= self.tick_step {
            self.tick_accumulator -= self.tick_step;
            ticks += 1;
        }

        let render_dt = if self.frame_accumulator >= self.frame_step {
            let since_render = self.frame_accumulator;
            self.frame_accumulator = 0.0;
            Some(since_render as f32)
        } else {
            None
        };

        FrameSteps {
            input_dt: dt as f32,
            ticks,
            tick_dt: self.tick_step as f32,
            render_dt,
        }
    }

    /// Time until the next simulation step is owed
    pub fn until_next_tick(&self) -> Duration {
        Duration::from_secs_f64((self.tick_step - self.tick_accumulator).max(0.0))
    }
}

/// Result of applying one reload event
#[derive(Debug, Clone, PartialEq)]
pub enum ReloadOutcome {
    /// The source returned the package already in use
    Unchanged,
    Applied {
        report: MigrationReport,
        behaviors: usize,
    },
}

/// Simulation host
pub struct Host<S: PackageSource> {
    config: HostConfig,
    world: World,
    schedule: Schedule,
    source: S,
    package: Option<Arc<ModulePackage>>,
    reloads: EventQueue<ReloadEvent>,
    reports: EventQueue<PipelineReport>,
    shaders: ShaderHotSwap,
    device: Box<dyn GraphicsDevice>,
    clock: FrameClock,
    pipelines: Vec<WatchPipeline>,
    reloads_applied: u64,
    running: bool,
}

impl<S: PackageSource> Host<S> {
    pub fn new(config: HostConfig, source: S, device: Box<dyn GraphicsDevice>) -> Self {
        let clock = FrameClock::new(
            config.frame.tick_rate,
            config.frame.frame_rate,
            config.frame.max_frame_time,
        );
        let shaders = ShaderHotSwap::new(ShaderLibrary::new(config.shader_root()));
        Self {
            config,
            world: World::new(),
            schedule: Schedule::new(),
            source,
            package: None,
            reloads: EventQueue::new(),
            reports: EventQueue::new(),
            shaders,
            device,
            clock,
            pipelines: Vec::new(),
            reloads_applied: 0,
            running: false,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Package whose modules are currently registered
    pub fn package(&self) -> Option<&Arc<ModulePackage>> {
        self.package.as_ref()
    }

    pub fn shader_swap(&self) -> &ShaderHotSwap {
        &self.shaders
    }

    /// Shader swap together with the world and device it writes to
    pub fn shader_swap_mut(&mut self) -> (&mut ShaderHotSwap, &mut World, &mut dyn GraphicsDevice) {
        (&mut self.shaders, &mut self.world, self.device.as_mut())
    }

    pub fn device(&self) -> &dyn GraphicsDevice {
        self.device.as_ref()
    }

    /// Reloads applied since start, excluding no-ops
    pub fn reloads_applied(&self) -> u64 {
        self.reloads_applied
    }

    /// Producer handle for reload-ready notifications
    pub fn reload_sender(&self) -> EventSender<ReloadEvent> {
        self.reloads.sender()
    }

    pub fn pending_reloads(&self) -> usize {
        self.reloads.len()
    }

    /// Register a host behavior; it survives every reload
    pub fn add_builtin(&mut self, behavior: Box<dyn Behavior>) {
        self.schedule.add_builtin(behavior);
    }

    /// Load the package, register its types and behaviors, then initialize
    /// every behavior once. A missing package is not fatal: builtins still
    /// run and a later reload event can bring the package in.
    pub fn init(&mut self) -> EngineResult<()> {
        if self.running {
            return Ok(());
        }

        match self.source.load_package() {
            Ok(package) => {
                let report = migrate(&mut self.world, &package)?;
                log::info!(
                    "Registered {} component types from package {}",
                    report.registered_types.len(),
                    package.name()
                );
                self.register_modules(&package);
                self.package = Some(package);
            }
            Err(e) => log::warn!("No module package loaded, running builtins only: {}", e),
        }

        self.schedule.initialize(&mut self.world);
        self.running = true;
        Ok(())
    }

    fn register_modules(&mut self, package: &ModulePackage) -> usize {
        let mut registered = 0;
        for mut module in package.instantiate_modules() {
            let behaviors = module.behaviors(&mut self.world);
            registered += self.schedule.register_module(module.name(), behaviors);
        }
        registered
    }

    /// Load the current build and swap it in.
    ///
    /// Data is migrated before any module behavior is torn down, so a failed
    /// load or migration leaves the running modules in place.
    pub fn reload(&mut self) -> EngineResult<ReloadOutcome> {
        let package = self.source.load_package()?;
        if let Some(current) = &self.package {
            if Arc::ptr_eq(current, &package) {
                log::debug!("Package {} unchanged, nothing to reload", package.name());
                return Ok(ReloadOutcome::Unchanged);
            }
        }

        let started = Instant::now();
        let report = migrate(&mut self.world, &package)?;
        let disposed = self.schedule.teardown_modules(&mut self.world);
        let behaviors = self.register_modules(&package);
        self.package = Some(package);
        self.reloads_applied += 1;

        log::info!(
            "Reloaded package: {} types migrated, {} rows rewritten, \
             {} behaviors replaced by {} in {:?}",
            report.migrated_types.len(),
            report.migrated_rows,
            disposed,
            behaviors,
            started.elapsed()
        );
        Ok(ReloadOutcome::Applied { report, behaviors })
    }

    /// Apply every queued reload event in arrival order. Returns the number
    /// of events consumed.
    pub fn drain_reloads(&mut self) -> usize {
        let mut consumed = 0;
        while let Some(event) = self.reloads.try_pop() {
            consumed += 1;
            log::debug!(
                "Reload #{} for {} waited {:?}",
                event.sequence,
                event.package.display(),
                event.raised_at.elapsed()
            );
            if let Err(e) = self.reload() {
                log::warn!(
                    "Reload of {} failed, keeping current build: {}",
                    event.package.display(),
                    e
                );
            }
        }
        consumed
    }

    fn log_pipeline_reports(&mut self) {
        for report in self.reports.drain() {
            match report.result {
                Ok(()) => log::debug!("{} finished ({} changes)", report.pipeline, report.changes),
                Err(e) => log::error!(
                    "{} failed after {} changes: {}",
                    report.pipeline,
                    report.changes,
                    e
                ),
            }
        }
    }

    /// Run one frame: reloads, shader swaps, then the behavior phases
    pub fn tick(&mut self, elapsed: Duration) -> FrameSteps {
        self.drain_reloads();
        self.shaders.process_pending(&mut self.world, self.device.as_mut());
        self.log_pipeline_reports();

        let steps = self.clock.advance(elapsed);
        self.schedule.run_phase(Phase::Input, &mut self.world, steps.input_dt);
        for _ in 0..steps.ticks {
            self.schedule.run_phase(Phase::Simulation, &mut self.world, steps.tick_dt);
        }
        if let Some(render_dt) = steps.render_dt {
            self.schedule.run_phase(Phase::Render, &mut self.world, render_dt);
        }
        steps
    }

    /// Tick until a behavior requests quit
    pub fn run(&mut self) -> EngineResult<()> {
        self.init()?;
        log::info!("Host running");

        let mut last = Instant::now();
        while !self.world.quit_requested() {
            let now = Instant::now();
            let steps = self.tick(now - last);
            last = now;
            if steps.ticks == 0 && steps.render_dt.is_none() {
                std::thread::sleep(self.clock.until_next_tick().min(Duration::from_millis(1)));
            }
        }

        log::info!("Quit requested");
        Ok(())
    }

    /// Wire the background pipelines enabled by the configuration. Each
    /// piece that cannot start is disabled with one log line.
    pub fn start_hot_reload(&mut self) {
        let settings = self.config.hot_reload.clone();
        if !settings.enabled {
            log::info!("Hot reload disabled");
            return;
        }

        let plugin_dir = settings.resolved_plugin_dir();
        if let Err(e) = std::fs::create_dir_all(&plugin_dir) {
            log::warn!("Cannot create plugin directory {}: {}", plugin_dir.display(), e);
        }

        let extensions: Vec<&str> = settings.source_extensions.iter().map(String::as_str).collect();
        let build = ChangeWatcher::new(&settings.source_dir, FileFilter::new(extensions))
            .and_then(|watcher| {
                let invoker = BuildInvoker::new(
                    settings.build_command.as_str(),
                    settings.max_build_attempts,
                );
                let stager = ArtifactStager::new(
                    settings.resolved_artifact_dir(),
                    &plugin_dir,
                    settings.package.as_str(),
                );
                let cycle = BuildCycle::new(invoker, &settings.source_dir, stager);
                WatchPipeline::spawn(watcher, cycle, Some(self.reports.sender()))
            });
        self.adopt_pipeline("Source rebuild", build);

        if let Err(e) = self.source.watch(self.reloads.sender()) {
            log::warn!("Package watching disabled: {}", e);
        }

        let backend = self.device.backend();
        let extensions: Vec<&str> = settings.shader_extensions.iter().map(String::as_str).collect();
        let compile = ChangeWatcher::new(&settings.shader_source_dir, FileFilter::new(extensions))
            .and_then(|watcher| {
                let mut compiler = ShaderCompiler::new(
                    &settings.shader_compiler,
                    self.config.shader_root(),
                    backend,
                );
                if let Some(include_dir) = &settings.shader_include_dir {
                    compiler = compiler.with_include_dir(include_dir);
                }
                let cycle = ShaderCompileCycle::new(compiler);
                WatchPipeline::spawn(watcher, cycle, Some(self.reports.sender()))
            });
        self.adopt_pipeline("Shader compile", compile);

        let binaries: PathBuf = self.shaders.library().root().join(backend.shader_dir());
        if let Err(e) = std::fs::create_dir_all(&binaries) {
            log::warn!("Cannot create shader directory {}: {}", binaries.display(), e);
        }
        if let Err(e) = self.shaders.watch(backend) {
            log::warn!("Shader hot-swap disabled: {}", e);
        }
    }

    fn adopt_pipeline(&mut self, what: &str, pipeline: EngineResult<WatchPipeline>) {
        match pipeline {
            Ok(pipeline) => {
                log::info!("{} pipeline started", what);
                self.pipelines.push(pipeline);
            }
            Err(e) => log::warn!("{} disabled: {}", what, e),
        }
    }

    /// Number of background pipelines owned by the host
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Dispose every behavior, stop background work, then release the
    /// loaded packages
    pub fn shutdown(&mut self) {
        self.schedule.shutdown(&mut self.world);
        for mut pipeline in self.pipelines.drain(..) {
            pipeline.stop();
        }
        self.shaders.shutdown(&self.world, self.device.as_mut());
        self.package = None;
        self.source.shutdown();
        self.running = false;
        log::info!("Host shut down");
    }
}
