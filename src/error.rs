//! Engine-wide error type
//!
//! Every subsystem returns `EngineResult<T>`. None of these errors is fatal to
//! the host process: callers log them and keep the previous state alive.

use std::path::Path;

/// Errors raised by the entity store, the module loader and the hot-reload
/// pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error at {path}: {error}")]
    IoError { path: String, error: String },

    #[error("Watch error at {path}: {error}")]
    WatchError { path: String, error: String },

    #[error("Build tool not found: {tool}")]
    BuildToolMissing { tool: String },

    #[error("Unsupported host platform: {platform}")]
    UnsupportedPlatform { platform: String },

    #[error("Build failed after {attempts} attempts")]
    BuildFailed { attempts: u32 },

    #[error("Artifact copy failed for {path}: {error}")]
    ArtifactCopyFailed { path: String, error: String },

    #[error("Failed to load module package {path}: {error}")]
    PackageLoadFailed { path: String, error: String },

    #[error("Module API version mismatch: got {got}, expected {expected}")]
    ApiVersionMismatch { got: u32, expected: u32 },

    #[error("Shader compilation failed for {name}: {error}")]
    ShaderCompileFailed { name: String, error: String },

    #[error("Shader reload failed for {name}: {error}")]
    ShaderReloadFailed { name: String, error: String },

    #[error("Failed to create {resource}: {error}")]
    ResourceCreationFailed { resource: String, error: String },

    #[error("Entity {entity} does not exist")]
    EntityNotFound { entity: String },

    #[error("Component type not registered: {name}")]
    ComponentNotRegistered { name: String },

    #[error("Component layout mismatch for {name}: expected {expected} bytes, found {found}")]
    LayoutMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid manifest for {name}: {reason}")]
    InvalidManifest { name: String, reason: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Result alias used across the crate
pub type EngineResult<T> = Result<T, EngineError>;

impl From<notify::Error> for EngineError {
    fn from(err: notify::Error) -> Self {
        let path = err
            .paths
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        EngineError::WatchError {
            path,
            error: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Config {
            message: err.to_string(),
        }
    }
}

/// Attach a path to `std::io::Error` results
pub trait IoContext<T> {
    fn io_context(self, path: impl AsRef<Path>) -> EngineResult<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, path: impl AsRef<Path>) -> EngineResult<T> {
        self.map_err(|e| EngineError::IoError {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })
    }
}
