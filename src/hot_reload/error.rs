//! Hot reload error handling
//!
//! Type alias and constructors shared by the reload pipeline.

use std::path::Path;

use crate::error::{EngineError, EngineResult};

/// Type alias for hot reload results
pub type HotReloadResult<T> = EngineResult<T>;

/// Create a package load error
pub fn package_load_error(path: &Path, error: impl std::fmt::Display) -> EngineError {
    EngineError::PackageLoadFailed {
        path: path.display().to_string(),
        error: error.to_string(),
    }
}

/// Create a shader reload error
pub fn shader_reload_error(shader: &str, error: impl std::fmt::Display) -> EngineError {
    EngineError::ShaderReloadFailed {
        name: shader.to_string(),
        error: error.to_string(),
    }
}
