//! Host configuration
//!
//! Loaded from a TOML file. Every key is optional; missing keys take the
//! defaults below.
//!
//! ```toml
//! [hot_reload]
//! source_dir = "game"
//! build_command = "cargo build --lib --offline"
//! package = "pulse_module"
//!
//! [frame]
//! tick_rate = 60.0
//!
//! [graphics]
//! backend = "vulkan"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, IoContext};
use crate::gfx::Backend;
use crate::hot_reload::DEFAULT_BUILD_ATTEMPTS;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "hotswap.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub hot_reload: HotReloadConfig,
    pub frame: FrameConfig,
    pub graphics: GraphicsConfig,
}

/// Hot-reload configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Master switch for every watcher and pipeline
    pub enabled: bool,

    /// Package source tree the build command runs in
    pub source_dir: PathBuf,

    /// Extensions that trigger a rebuild
    pub source_extensions: Vec<String>,

    pub build_command: String,

    pub max_build_attempts: u32,

    /// Where the build writes its artifacts, relative to `source_dir`
    pub artifact_dir: PathBuf,

    /// Package name; the library file name is derived from it
    pub package: String,

    /// Directory the package is loaded from; relative paths are resolved
    /// against the executable's directory
    pub plugin_dir: PathBuf,

    /// Shader sources compiled on change
    pub shader_source_dir: PathBuf,

    pub shader_extensions: Vec<String>,

    /// Shader compiler executable and leading arguments
    pub shader_compiler: String,

    pub shader_include_dir: Option<PathBuf>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_dir: PathBuf::from("game"),
            source_extensions: vec!["rs".to_string()],
            build_command: "cargo build --lib --offline".to_string(),
            max_build_attempts: DEFAULT_BUILD_ATTEMPTS,
            artifact_dir: PathBuf::from("target"),
            package: "game".to_string(),
            plugin_dir: PathBuf::from("plugins"),
            shader_source_dir: PathBuf::from("shaders"),
            shader_extensions: vec!["sc".to_string()],
            shader_compiler: "shaderc".to_string(),
            shader_include_dir: None,
        }
    }
}

impl HotReloadConfig {
    /// Plugin directory as an absolute path
    pub fn resolved_plugin_dir(&self) -> PathBuf {
        if self.plugin_dir.is_absolute() {
            return self.plugin_dir.clone();
        }
        match std::env::current_exe() {
            Ok(exe) => exe
                .parent()
                .map(|dir| dir.join(&self.plugin_dir))
                .unwrap_or_else(|| self.plugin_dir.clone()),
            Err(e) => {
                log::warn!("Cannot locate executable ({}), using {}", e, self.plugin_dir.display());
                self.plugin_dir.clone()
            }
        }
    }

    /// Artifact directory as seen from the working directory
    pub fn resolved_artifact_dir(&self) -> PathBuf {
        if self.artifact_dir.is_absolute() {
            self.artifact_dir.clone()
        } else {
            self.source_dir.join(&self.artifact_dir)
        }
    }
}

/// Frame pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Simulation steps per second
    pub tick_rate: f64,
    /// Upper bound on render steps per second
    pub frame_rate: f64,
    /// Longest frame the clock will account for, in seconds
    pub max_frame_time: f64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            frame_rate: 240.0,
            max_frame_time: 0.1,
        }
    }
}

/// Graphics boundary settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub backend: Backend,
    /// Root of compiled shader binaries; defaults to `<plugin_dir>/shaders`
    pub shader_root: Option<PathBuf>,
}

impl HostConfig {
    pub fn from_toml_str(raw: &str) -> EngineResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).io_context(path)?;
        let config = Self::from_toml_str(&raw)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Root of compiled shader binaries
    pub fn shader_root(&self) -> PathBuf {
        self.graphics
            .shader_root
            .clone()
            .unwrap_or_else(|| self.hot_reload.resolved_plugin_dir().join("shaders"))
    }
}
