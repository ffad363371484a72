use std::path::{Path, PathBuf};

use super::{GraphicsDevice, ProgramHandle, ShaderHandle, ShaderProgramSpec};
use crate::error::{EngineError, EngineResult, IoContext};

/// Compiled shader binaries laid out as `<root>/<backend dir>/<name>.bin`
#[derive(Debug, Clone)]
pub struct ShaderLibrary {
    root: PathBuf,
}

impl ShaderLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a binary for the device's active backend
    pub fn binary_path(&self, device: &dyn GraphicsDevice, name: &str) -> PathBuf {
        self.root
            .join(device.backend().shader_dir())
            .join(format!("{}.bin", name))
    }

    /// Read one stage from disk and hand it to the device
    pub fn load_shader(
        &self,
        device: &mut dyn GraphicsDevice,
        name: &str,
    ) -> EngineResult<ShaderHandle> {
        let path = self.binary_path(device, name);
        if !path.exists() {
            return Err(EngineError::ResourceCreationFailed {
                resource: format!("shader {}", name),
                error: format!("{} not found", path.display()),
            });
        }

        let bytes = std::fs::read(&path).io_context(&path)?;
        if bytes.is_empty() {
            return Err(EngineError::ResourceCreationFailed {
                resource: format!("shader {}", name),
                error: "binary is empty".to_string(),
            });
        }

        let handle = device.create_shader(name, &bytes)?;
        if !handle.is_valid() {
            return Err(EngineError::ResourceCreationFailed {
                resource: format!("shader {}", name),
                error: "shader model not supported by backend".to_string(),
            });
        }
        Ok(handle)
    }

    /// Load every stage of `spec` and link them
    pub fn create_program(
        &self,
        device: &mut dyn GraphicsDevice,
        spec: &ShaderProgramSpec,
    ) -> EngineResult<ProgramHandle> {
        let program = match spec {
            ShaderProgramSpec::Graphics { vertex, fragment } => {
                let vs = self.load_shader(device, vertex)?;
                let fs = match self.load_shader(device, fragment) {
                    Ok(fs) => fs,
                    Err(e) => {
                        device.destroy_shader(vs);
                        return Err(e);
                    }
                };
                device.create_program(vs, fs).map_err(|e| {
                    device.destroy_shader(vs);
                    device.destroy_shader(fs);
                    e
                })?
            }
            ShaderProgramSpec::Compute { compute } => {
                let cs = self.load_shader(device, compute)?;
                device.create_compute_program(cs).map_err(|e| {
                    device.destroy_shader(cs);
                    e
                })?
            }
        };

        if !program.is_valid() {
            return Err(EngineError::ResourceCreationFailed {
                resource: "program".to_string(),
                error: format!("device returned an invalid handle for {:?}", spec),
            });
        }
        Ok(program)
    }
}
