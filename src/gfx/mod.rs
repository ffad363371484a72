//! Graphics boundary
//!
//! The draw pipeline lives outside this crate. What the hot-reload path needs
//! from it is narrow: plain-data handles stored inside components, the active
//! backend (which decides where compiled shader binaries live) and a device
//! that can create and destroy shader programs.

pub mod device;
pub mod shader_library;

pub use device::{GraphicsDevice, HeadlessDevice};
pub use shader_library::ShaderLibrary;

use serde::{Deserialize, Serialize};

use crate::ecs::{FieldKind, FieldType};

/// Handle to a compiled shader stage
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ShaderHandle(pub u16);

impl ShaderHandle {
    pub const INVALID: Self = Self(u16::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Handle to a linked program, stored in component fields
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ProgramHandle(pub u16);

impl ProgramHandle {
    pub const INVALID: Self = Self(u16::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl FieldType for ProgramHandle {
    fn kind() -> FieldKind {
        FieldKind::Opaque {
            type_name: "ProgramHandle".to_string(),
            size: std::mem::size_of::<ProgramHandle>(),
        }
    }
}

/// Pipeline stage of a shader binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    /// Stage implied by the `vs_` / `fs_` / `cs_` file name prefix
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("vs_") {
            Some(ShaderStage::Vertex)
        } else if name.starts_with("fs_") {
            Some(ShaderStage::Fragment)
        } else if name.starts_with("cs_") {
            Some(ShaderStage::Compute)
        } else {
            None
        }
    }
}

/// Active rendering backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Noop,
    #[serde(rename = "d3d9")]
    Direct3D9,
    #[serde(rename = "d3d11")]
    Direct3D11,
    #[serde(rename = "d3d12")]
    Direct3D12,
    Gnm,
    Metal,
    OpenGL,
    #[serde(rename = "gles")]
    OpenGLES,
    Vulkan,
}

impl Backend {
    /// Folder under the shader root holding this backend's binaries
    pub fn shader_dir(self) -> &'static str {
        match self {
            Backend::Noop | Backend::Direct3D9 => "dx9",
            Backend::Direct3D11 | Backend::Direct3D12 => "dx11",
            Backend::Gnm => "pssl",
            Backend::Metal => "metal",
            Backend::OpenGL => "glsl",
            Backend::OpenGLES => "essl",
            Backend::Vulkan => "spirv",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(windows) {
            Backend::Direct3D11
        } else if cfg!(target_os = "macos") {
            Backend::Metal
        } else {
            Backend::Vulkan
        }
    }
}

/// Shader stages a program-handle field is built from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderProgramSpec {
    Graphics { vertex: String, fragment: String },
    Compute { compute: String },
}

impl ShaderProgramSpec {
    pub fn graphics(vertex: impl Into<String>, fragment: impl Into<String>) -> Self {
        ShaderProgramSpec::Graphics {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }

    pub fn compute(compute: impl Into<String>) -> Self {
        ShaderProgramSpec::Compute {
            compute: compute.into(),
        }
    }

    /// Every stage name the program needs
    pub fn stages(&self) -> Vec<&str> {
        match self {
            ShaderProgramSpec::Graphics { vertex, fragment } => {
                vec![vertex.as_str(), fragment.as_str()]
            }
            ShaderProgramSpec::Compute { compute } => vec![compute.as_str()],
        }
    }

    pub fn references(&self, shader_name: &str) -> bool {
        self.stages().iter().any(|s| *s == shader_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_shader_dirs() {
        assert_eq!(Backend::Direct3D12.shader_dir(), "dx11");
        assert_eq!(Backend::OpenGL.shader_dir(), "glsl");
        assert_eq!(Backend::Vulkan.shader_dir(), "spirv");
        assert_eq!(Backend::Noop.shader_dir(), "dx9");
    }

    #[test]
    fn test_program_spec_references() {
        let spec = ShaderProgramSpec::graphics("vs_forward", "fs_forward");
        assert!(spec.references("fs_forward"));
        assert!(!spec.references("fs_deferred"));
        assert_eq!(ShaderProgramSpec::compute("cs_cull").stages(), vec!["cs_cull"]);
    }

    #[test]
    fn test_stage_from_prefix() {
        assert_eq!(ShaderStage::from_name("vs_sky"), Some(ShaderStage::Vertex));
        assert_eq!(ShaderStage::from_name("fs_sky"), Some(ShaderStage::Fragment));
        assert_eq!(ShaderStage::from_name("cs_lights"), Some(ShaderStage::Compute));
        assert_eq!(ShaderStage::from_name("sky"), None);
    }
}
