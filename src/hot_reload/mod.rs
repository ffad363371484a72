/// Hot-Reload System
///
/// Swaps rebuilt module packages and recompiled shader binaries into a
/// running host without restarting it or losing entity state.
///
/// Key pieces:
/// - Change watching with pausable delivery
/// - Out-of-process builds with retries and artifact staging
/// - Package loading behind a versioned two-symbol contract
/// - Per-tick reload queue drained on the simulation thread
/// - Component data migration by field name
/// - Shader program recreation keyed by shader name

pub mod build_invoker;
pub mod error;
pub mod loader;
pub mod migrate;
pub mod pipeline;
pub mod queue;
pub mod shader_compiler;
pub mod shader_reload;
pub mod watcher;

pub use build_invoker::{
    is_error_line, ArtifactStager, BuildInvoker, HostPlatform, DEFAULT_BUILD_ATTEMPTS,
};
pub use error::HotReloadResult;
pub use loader::{
    library_file_name, LoaderState, ModuleFactory, ModuleLoader, ModulePackage, PackageRegistrar,
    PackageSource, PackageType, StaticPackage, MODULE_API_VERSION,
};
pub use migrate::{migrate, CopyOp, CopyPlan, MigrationReport};
pub use pipeline::{BuildCycle, ChangeHandler, PipelineReport, WatchPipeline};
pub use queue::{EventQueue, EventSender, ReloadEvent, ShaderEvent};
pub use shader_compiler::{CompileOutcome, ShaderCompileCycle, ShaderCompiler};
pub use shader_reload::{ShaderBinding, ShaderHotSwap};
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher, FileFilter, PauseGuard};
