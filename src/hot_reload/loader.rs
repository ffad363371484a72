//! Module package loading
//!
//! A package is a dynamic library built against this crate. It exposes two
//! symbols, generated by [`declare_package!`](crate::declare_package): an API
//! version and a register function that fills a [`PackageRegistrar`] with
//! component manifests and module factories. The registrar also carries the
//! host's logger, which the package installs before registering.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use libloading::{Library, Symbol};
use rustc_hash::FxHashSet;

use super::error::{package_load_error, HotReloadResult};
use super::pipeline::{ChangeHandler, WatchPipeline};
use super::queue::{EventSender, ReloadEvent};
use super::watcher::{ChangeEvent, ChangeKind, ChangeWatcher, FileFilter};
use crate::behavior::Module;
use crate::ecs::{Component, TypeManifest, TypeToken};
use crate::error::{EngineError, EngineResult, IoContext};

/// Package API version; packages built for another version are rejected
pub const MODULE_API_VERSION: u32 = 1;

/// Exported symbol returning the package's API version
pub const API_VERSION_SYMBOL: &[u8] = b"hotswap_package_api_version\0";

/// Exported symbol filling a registrar
pub const REGISTER_SYMBOL: &[u8] = b"hotswap_package_register\0";

type ApiVersionFn = unsafe extern "C" fn() -> u32;
type RegisterFn = unsafe extern "C" fn(*mut PackageRegistrar);

/// Creates one module with no arguments
pub type ModuleFactory = fn() -> Box<dyn Module>;

/// What a package declares while registering
pub struct PackageRegistrar {
    types: Vec<TypeManifest>,
    factories: Vec<ModuleFactory>,
    logger: &'static dyn log::Log,
    max_level: log::LevelFilter,
}

impl Default for PackageRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageRegistrar {
    /// Empty registrar holding the calling image's logger
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            factories: Vec::new(),
            logger: log::logger(),
            max_level: log::max_level(),
        }
    }

    /// Route the calling image's `log` macros to the registrar's logger
    ///
    /// Called by [`declare_package!`](crate::declare_package) inside the
    /// package. A package image keeps the first logger it was given.
    pub fn install_logger(&self) {
        if log::set_logger(self.logger).is_err() {
            log::trace!("Package logger already installed");
        }
        log::set_max_level(self.max_level);
    }

    pub fn max_level(&self) -> log::LevelFilter {
        self.max_level
    }

    /// Declare a component type owned by the package
    pub fn component<T: Component>(&mut self) -> &mut Self {
        self.types.push(T::manifest());
        self
    }

    /// Declare a component type from its manifest alone
    pub fn manifest(&mut self, manifest: TypeManifest) -> &mut Self {
        self.types.push(manifest);
        self
    }

    /// Declare a module; modules are instantiated in declaration order
    pub fn module(&mut self, factory: ModuleFactory) -> &mut Self {
        self.factories.push(factory);
        self
    }
}

/// A component type of one loaded package build
#[derive(Debug, Clone)]
pub struct PackageType {
    pub manifest: Arc<TypeManifest>,
    pub token: TypeToken,
}

/// One loaded build of a package
pub struct ModulePackage {
    name: String,
    fingerprint: u32,
    generation: u64,
    types: Vec<PackageType>,
    factories: Vec<ModuleFactory>,
}

impl std::fmt::Debug for ModulePackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModulePackage")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("generation", &self.generation)
            .field("types", &self.types.len())
            .field("modules", &self.factories.len())
            .finish()
    }
}

impl ModulePackage {
    /// Validate a registrar's declarations and mint fresh tokens for them
    pub fn from_registrar(
        name: impl Into<String>,
        registrar: PackageRegistrar,
        fingerprint: u32,
        generation: u64,
    ) -> EngineResult<Self> {
        let name = name.into();
        let mut seen = FxHashSet::default();
        let mut types = Vec::with_capacity(registrar.types.len());
        for manifest in registrar.types {
            manifest.validate()?;
            if !seen.insert(manifest.name.clone()) {
                return Err(EngineError::InvalidManifest {
                    name: manifest.name,
                    reason: format!("declared twice by package {}", name),
                });
            }
            types.push(PackageType {
                manifest: Arc::new(manifest),
                token: TypeToken::mint(),
            });
        }

        Ok(Self {
            name,
            fingerprint,
            generation,
            types,
            factories: registrar.factories,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checksum of the build this package was loaded from
    pub fn fingerprint(&self) -> u32 {
        self.fingerprint
    }

    /// Number of loads before this one
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn types(&self) -> &[PackageType] {
        &self.types
    }

    pub fn type_named(&self, name: &str) -> Option<&PackageType> {
        self.types.iter().find(|t| t.manifest.name == name)
    }

    pub fn module_count(&self) -> usize {
        self.factories.len()
    }

    /// Create every declared module
    pub fn instantiate_modules(&self) -> Vec<Box<dyn Module>> {
        self.factories.iter().map(|factory| factory()).collect()
    }
}

/// Where the host gets packages from
pub trait PackageSource {
    /// Load the current build, or return the loaded package when the build
    /// has not changed
    fn load_package(&mut self) -> EngineResult<Arc<ModulePackage>>;

    fn current(&self) -> Option<Arc<ModulePackage>>;

    /// Post a reload event whenever a new build becomes available
    fn watch(&mut self, _sender: EventSender<ReloadEvent>) -> EngineResult<()> {
        Ok(())
    }

    /// Release everything the source holds; no package may be used after
    fn shutdown(&mut self) {}
}

/// Loader state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Unloaded,
    Loaded,
    Reloading,
}

/// Platform file name of a package library
pub fn library_file_name(package: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        package,
        std::env::consts::DLL_SUFFIX
    )
}

/// Loads a package library from the plugin directory
pub struct ModuleLoader {
    plugin_dir: PathBuf,
    package_name: String,
    shadow_dir: PathBuf,
    reload_counter: u64,
    state: LoaderState,
    current: Option<Arc<ModulePackage>>,
    /// Every image ever mapped; unloaded only at shutdown
    libraries: Vec<Library>,
    watcher: Option<WatchPipeline>,
}

impl ModuleLoader {
    /// Create new loader for `<plugin_dir>/<platform library name of package>`
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        package_name: impl Into<String>,
    ) -> EngineResult<Self> {
        let package_name = package_name.into();
        let shadow_dir = std::env::temp_dir()
            .join(format!("hotswap_{}_{}", package_name, std::process::id()));
        fs::create_dir_all(&shadow_dir).io_context(&shadow_dir)?;

        Ok(Self {
            plugin_dir: plugin_dir.into(),
            package_name,
            shadow_dir,
            reload_counter: 0,
            state: LoaderState::Unloaded,
            current: None,
            libraries: Vec::new(),
            watcher: None,
        })
    }

    pub fn package_path(&self) -> PathBuf {
        self.plugin_dir.join(library_file_name(&self.package_name))
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Images mapped so far, including retired ones
    pub fn loaded_images(&self) -> usize {
        self.libraries.len()
    }

    fn load_image(
        &mut self,
        path: &Path,
        bytes: &[u8],
        fingerprint: u32,
    ) -> HotReloadResult<ModulePackage> {
        let load_failed = |error: libloading::Error| package_load_error(path, error);

        // A fresh file name per load keeps the OS from handing back the
        // image it already mapped, and leaves the plugin file writable.
        self.reload_counter += 1;
        let shadow = self.shadow_dir.join(format!(
            "{}_{}",
            self.reload_counter,
            library_file_name(&self.package_name)
        ));
        fs::write(&shadow, bytes).io_context(&shadow)?;

        // SAFETY: loading runs the library's initializers. Packages are
        // built against this crate by the same toolchain as the host.
        let library = unsafe { Library::new(&shadow) }.map_err(load_failed)?;

        let version = unsafe {
            let api_version: Symbol<ApiVersionFn> =
                library.get(API_VERSION_SYMBOL).map_err(load_failed)?;
            api_version()
        };
        if version != MODULE_API_VERSION {
            return Err(EngineError::ApiVersionMismatch {
                got: version,
                expected: MODULE_API_VERSION,
            });
        }

        let mut registrar = PackageRegistrar::new();
        unsafe {
            let register: Symbol<RegisterFn> =
                library.get(REGISTER_SYMBOL).map_err(load_failed)?;
            register(&mut registrar);
        }

        let package = ModulePackage::from_registrar(
            self.package_name.clone(),
            registrar,
            fingerprint,
            self.reload_counter - 1,
        )?;
        self.libraries.push(library);
        Ok(package)
    }
}

impl PackageSource for ModuleLoader {
    fn load_package(&mut self) -> EngineResult<Arc<ModulePackage>> {
        let path = self.package_path();
        let bytes = fs::read(&path).map_err(|e| package_load_error(&path, e))?;
        let fingerprint = crc32fast::hash(&bytes);

        if let Some(current) = &self.current {
            if current.fingerprint() == fingerprint {
                log::debug!("Package {} unchanged, keeping loaded build", self.package_name);
                return Ok(current.clone());
            }
        }

        self.state = match self.state {
            LoaderState::Unloaded => LoaderState::Unloaded,
            _ => LoaderState::Reloading,
        };
        match self.load_image(&path, &bytes, fingerprint) {
            Ok(package) => {
                log::info!(
                    "Loaded package {} ({} types, {} modules, crc {:08x})",
                    package.name(),
                    package.types().len(),
                    package.module_count(),
                    fingerprint
                );
                let package = Arc::new(package);
                self.current = Some(package.clone());
                self.state = LoaderState::Loaded;
                Ok(package)
            }
            Err(e) => {
                self.state = if self.current.is_some() {
                    LoaderState::Loaded
                } else {
                    LoaderState::Unloaded
                };
                Err(e)
            }
        }
    }

    fn current(&self) -> Option<Arc<ModulePackage>> {
        self.current.clone()
    }

    fn watch(&mut self, sender: EventSender<ReloadEvent>) -> EngineResult<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let extension = std::env::consts::DLL_EXTENSION;
        let watcher = ChangeWatcher::new(&self.plugin_dir, FileFilter::new(vec![extension]))?;
        let notifier = PackageNotifier {
            package: self.package_path(),
            sender,
            sequence: 0,
        };
        self.watcher = Some(WatchPipeline::spawn(watcher, notifier, None)?);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(current) = self.current.take() {
            if Arc::strong_count(&current) > 1 {
                log::warn!("Package {} still referenced at shutdown", current.name());
            }
        }
        while let Some(library) = self.libraries.pop() {
            if let Err(e) = library.close() {
                log::warn!("Failed to unload package image: {}", e);
            }
        }
        if let Err(e) = fs::remove_dir_all(&self.shadow_dir) {
            log::debug!("Could not remove {}: {}", self.shadow_dir.display(), e);
        }
        self.state = LoaderState::Unloaded;
    }
}

/// Posts a reload event when the package file is replaced
struct PackageNotifier {
    package: PathBuf,
    sender: EventSender<ReloadEvent>,
    sequence: u64,
}

impl PackageNotifier {
    fn touches_package(&self, change: &ChangeEvent) -> bool {
        let name = self.package.file_name();
        match &change.kind {
            ChangeKind::Deleted => false,
            ChangeKind::Renamed { to, .. } => to.file_name() == name,
            _ => change.path.file_name() == name,
        }
    }
}

impl ChangeHandler for PackageNotifier {
    fn name(&self) -> &str {
        "package watch"
    }

    fn handle(&mut self, changes: &[ChangeEvent]) -> EngineResult<()> {
        if changes.iter().any(|c| self.touches_package(c)) {
            self.sequence += 1;
            log::info!("Package {} changed, queueing reload", self.package.display());
            self.sender.send(ReloadEvent {
                package: self.package.clone(),
                sequence: self.sequence,
                raised_at: Instant::now(),
            });
        }
        Ok(())
    }
}

/// In-process package: a register function linked into the host.
///
/// `rebuild` stands in for an external build finishing; the next load mints
/// fresh tokens for every type.
pub struct StaticPackage {
    name: String,
    register: fn(&mut PackageRegistrar),
    revision: u32,
    loads: u64,
    current: Option<Arc<ModulePackage>>,
    sender: Option<EventSender<ReloadEvent>>,
    sequence: u64,
}

impl StaticPackage {
    pub fn new(name: impl Into<String>, register: fn(&mut PackageRegistrar)) -> Self {
        Self {
            name: name.into(),
            register,
            revision: 1,
            loads: 0,
            current: None,
            sender: None,
            sequence: 0,
        }
    }

    /// Swap in another build's register function without announcing it
    pub fn set_register(&mut self, register: fn(&mut PackageRegistrar)) {
        self.register = register;
    }

    /// Mark a new build as available and post a reload event when watched
    pub fn rebuild(&mut self) {
        self.revision = self.revision.wrapping_add(1);
        if let Some(sender) = &self.sender {
            self.sequence += 1;
            sender.send(ReloadEvent {
                package: PathBuf::from(&self.name),
                sequence: self.sequence,
                raised_at: Instant::now(),
            });
        }
    }
}

impl PackageSource for StaticPackage {
    fn load_package(&mut self) -> EngineResult<Arc<ModulePackage>> {
        if let Some(current) = &self.current {
            if current.fingerprint() == self.revision {
                return Ok(current.clone());
            }
        }

        let mut registrar = PackageRegistrar::new();
        (self.register)(&mut registrar);
        let package = Arc::new(ModulePackage::from_registrar(
            self.name.clone(),
            registrar,
            self.revision,
            self.loads,
        )?);
        self.loads += 1;
        self.current = Some(package.clone());
        Ok(package)
    }

    fn current(&self) -> Option<Arc<ModulePackage>> {
        self.current.clone()
    }

    fn watch(&mut self, sender: EventSender<ReloadEvent>) -> EngineResult<()> {
        self.sender = Some(sender);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.current = None;
        self.sender = None;
    }
}

/// Export the package entry points for a register function.
///
/// ```ignore
/// fn pulse_module() -> Box<dyn Module> {
///     Box::new(PulseModule)
/// }
///
/// fn register(registrar: &mut PackageRegistrar) {
///     registrar.component::<Pulse>().module(pulse_module);
/// }
///
/// hotswap_engine::declare_package!(register);
/// ```
#[macro_export]
macro_rules! declare_package {
    ($register:path) => {
        #[no_mangle]
        pub extern "C" fn hotswap_package_api_version() -> u32 {
            $crate::hot_reload::MODULE_API_VERSION
        }

        /// # Safety
        ///
        /// `registrar` must be null or point to a live registrar.
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn hotswap_package_register(
            registrar: *mut $crate::hot_reload::PackageRegistrar,
        ) {
            if let Some(registrar) = registrar.as_mut() {
                registrar.install_logger();
                $register(registrar);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{Behavior, Phase};
    use crate::ecs::{FieldKind, FieldManifest, PrimitiveKind, World};
    use crate::hot_reload::queue::EventQueue;
    use tempfile::TempDir;

    struct Idle;

    impl Behavior for Idle {
        fn phase(&self) -> Phase {
            Phase::Simulation
        }

        fn update(&mut self, _world: &mut World, _delta_time: f32) {}
    }

    struct IdleModule;

    impl Module for IdleModule {
        fn name(&self) -> &str {
            "idle"
        }

        fn behaviors(&mut self, _world: &mut World) -> Vec<Box<dyn Behavior>> {
            vec![Box::new(Idle)]
        }
    }

    fn counter_manifest() -> TypeManifest {
        TypeManifest::new(
            "test::Counter",
            4,
            vec![FieldManifest::new("value", 0, FieldKind::Primitive(PrimitiveKind::U32))],
        )
    }

    fn idle_module() -> Box<dyn Module> {
        Box::new(IdleModule)
    }

    fn register(registrar: &mut PackageRegistrar) {
        registrar.manifest(counter_manifest()).module(idle_module);
    }

    fn register_twice(registrar: &mut PackageRegistrar) {
        registrar.manifest(counter_manifest()).manifest(counter_manifest());
    }

    #[test]
    fn test_static_package_reuses_unchanged_build() {
        let mut source = StaticPackage::new("game", register);
        let first = source.load_package().expect("load");
        let again = source.load_package().expect("load again");
        assert!(Arc::ptr_eq(&first, &again));

        source.rebuild();
        let rebuilt = source.load_package().expect("reload");
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        let old = first.type_named("test::Counter").expect("type");
        let new = rebuilt.type_named("test::Counter").expect("type");
        assert_ne!(old.token, new.token);
        assert_eq!(old.manifest, new.manifest);
        assert_eq!(rebuilt.generation(), 1);
    }

    #[test]
    fn test_rebuild_posts_event_when_watched() {
        let queue = EventQueue::new();
        let mut source = StaticPackage::new("game", register);
        source.rebuild();
        assert!(queue.is_empty());

        source.watch(queue.sender()).expect("watch");
        source.rebuild();
        let events = queue.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
    }

    #[test]
    fn test_instantiate_modules() {
        let mut source = StaticPackage::new("game", register);
        let package = source.load_package().expect("load");
        let mut world = World::new();
        let mut modules = package.instantiate_modules();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].name(), "idle");
        assert_eq!(modules[0].behaviors(&mut world).len(), 1);
    }

    #[test]
    fn test_duplicate_types_rejected() {
        let mut source = StaticPackage::new("game", register_twice);
        assert!(matches!(
            source.load_package(),
            Err(EngineError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_missing_library() {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut loader = ModuleLoader::new(temp_dir.path(), "missing_package").expect("loader");
        assert!(matches!(
            loader.load_package(),
            Err(EngineError::PackageLoadFailed { .. })
        ));
        assert_eq!(loader.state(), LoaderState::Unloaded);
        loader.shutdown();
    }

    #[test]
    fn test_garbage_library_is_rejected() {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut loader = ModuleLoader::new(temp_dir.path(), "garbage_package").expect("loader");
        fs::write(loader.package_path(), b"not a shared object").expect("write");

        assert!(loader.load_package().is_err());
        assert_eq!(loader.state(), LoaderState::Unloaded);
        assert_eq!(loader.loaded_images(), 0);
        loader.shutdown();
    }

    #[test]
    fn test_watch_posts_reload_when_package_file_changes() {
        let temp_dir = TempDir::new().expect("temp dir");
        let mut loader = ModuleLoader::new(temp_dir.path(), "watched_package").expect("loader");
        let queue = EventQueue::new();
        loader.watch(queue.sender()).expect("watch");

        let other = temp_dir.path().join(library_file_name("other_package"));
        fs::write(other, b"other").expect("write other");
        fs::write(loader.package_path(), b"new build").expect("write package");

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        let mut event = queue.try_pop();
        while event.is_none() && Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
            event = queue.try_pop();
        }
        let event = event.expect("reload event for the package file");
        assert_eq!(event.package, loader.package_path());
        assert_eq!(event.sequence, 1);
        loader.shutdown();
    }

    #[test]
    fn test_registrar_carries_log_level() {
        let registrar = PackageRegistrar::new();
        assert_eq!(registrar.max_level(), log::max_level());
        registrar.install_logger();
        assert_eq!(log::max_level(), registrar.max_level());
    }

    #[test]
    fn test_library_file_name() {
        let name = library_file_name("pulse_module");
        assert!(name.contains("pulse_module"));
        assert!(name.ends_with(std::env::consts::DLL_SUFFIX));
    }
}
