//! Shader source compilation
//!
//! Invokes the offline shader compiler once per changed source file and
//! writes `<output>/<backend dir>/<stem>.bin`, the layout the shader library
//! loads from.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::build_invoker::is_error_line;
use super::pipeline::ChangeHandler;
use super::watcher::{ChangeEvent, ChangeKind};
use crate::error::{EngineError, EngineResult, IoContext};
use crate::gfx::{Backend, ShaderStage};

/// Result of compiling one source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Compiled(PathBuf),
    /// Output is newer than the source
    UpToDate,
    /// Not a compilable stage
    Skipped(String),
}

/// Compiler profile for a backend and stage
pub fn profile(backend: Backend, stage: ShaderStage) -> Option<&'static str> {
    let profile = match backend {
        Backend::Noop => return None,
        Backend::Direct3D9 => match stage {
            ShaderStage::Vertex => "vs_3_0",
            ShaderStage::Fragment => "ps_3_0",
            ShaderStage::Compute => return None,
        },
        Backend::Direct3D11 | Backend::Direct3D12 => match stage {
            ShaderStage::Vertex => "vs_5_0",
            ShaderStage::Fragment => "ps_5_0",
            ShaderStage::Compute => "cs_5_0",
        },
        Backend::Gnm => "pssl",
        Backend::Metal => "metal",
        Backend::OpenGL => "430",
        Backend::OpenGLES => "100_es",
        Backend::Vulkan => "spirv",
    };
    Some(profile)
}

fn platform(backend: Backend) -> &'static str {
    match backend {
        Backend::Direct3D9 | Backend::Direct3D11 | Backend::Direct3D12 | Backend::Noop => "windows",
        Backend::Gnm => "orbis",
        Backend::Metal => "osx",
        Backend::OpenGL | Backend::Vulkan => "linux",
        Backend::OpenGLES => "android",
    }
}

fn stage_type(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Vertex => "vertex",
        ShaderStage::Fragment => "fragment",
        ShaderStage::Compute => "compute",
    }
}

/// Wrapper around the offline shader compiler
#[derive(Debug, Clone)]
pub struct ShaderCompiler {
    program: String,
    base_args: Vec<String>,
    include_dir: Option<PathBuf>,
    output_dir: PathBuf,
    backend: Backend,
}

impl ShaderCompiler {
    /// `command` is the compiler executable, optionally followed by
    /// arguments passed before the per-file ones
    pub fn new(command: &str, output_dir: impl Into<PathBuf>, backend: Backend) -> Self {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "shaderc".to_string());
        Self {
            program,
            base_args: parts.collect(),
            include_dir: None,
            output_dir: output_dir.into(),
            backend,
        }
    }

    pub fn with_include_dir(mut self, include_dir: impl Into<PathBuf>) -> Self {
        self.include_dir = Some(include_dir.into());
        self
    }

    /// Where the binary compiled from `source` is written
    pub fn output_path(&self, source: &Path) -> PathBuf {
        let stem = source.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        self.output_dir
            .join(self.backend.shader_dir())
            .join(format!("{}.bin", stem))
    }

    /// Compile one source file if its output is stale
    pub fn compile(&self, source: &Path) -> EngineResult<CompileOutcome> {
        let name = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        if name.contains("varying") {
            return Ok(CompileOutcome::Skipped(format!("{} is a varying definition", name)));
        }
        let Some(stage) = ShaderStage::from_name(&name) else {
            log::error!("Unknown shader type {}", name);
            return Ok(CompileOutcome::Skipped(format!("unknown shader type {}", name)));
        };
        let Some(profile) = profile(self.backend, stage) else {
            return Ok(CompileOutcome::Skipped(format!(
                "no {:?} profile for {:?}",
                stage, self.backend
            )));
        };

        let output = self.output_path(source);
        if is_newer(&output, source) {
            return Ok(CompileOutcome::UpToDate);
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).io_context(parent)?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("-f")
            .arg(source)
            .arg("-o")
            .arg(&output)
            .arg("--type")
            .arg(stage_type(stage))
            .arg("--platform")
            .arg(platform(self.backend))
            .arg("-p")
            .arg(profile);
        if let Some(include_dir) = &self.include_dir {
            cmd.arg("-i").arg(include_dir);
        }

        log::info!("Compiling {}", name);
        let result = cmd.stdin(Stdio::null()).output().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::BuildToolMissing {
                tool: self.program.clone(),
            },
            _ => EngineError::ShaderCompileFailed {
                name: name.clone(),
                error: e.to_string(),
            },
        })?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let detail = stderr
                .lines()
                .chain(String::from_utf8_lossy(&result.stdout).lines())
                .find(|l| is_error_line(l))
                .map(str::to_string)
                .unwrap_or_else(|| result.status.to_string());
            return Err(EngineError::ShaderCompileFailed { name, error: detail });
        }
        Ok(CompileOutcome::Compiled(output))
    }
}

fn is_newer(output: &Path, source: &Path) -> bool {
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified()).ok();
    match (modified(output), modified(source)) {
        (Some(out), Some(src)) => out > src,
        _ => false,
    }
}

/// Compiles every shader source touched in a cycle
pub struct ShaderCompileCycle {
    compiler: ShaderCompiler,
}

impl ShaderCompileCycle {
    pub fn new(compiler: ShaderCompiler) -> Self {
        Self { compiler }
    }
}

impl ChangeHandler for ShaderCompileCycle {
    fn name(&self) -> &str {
        "shader compile"
    }

    fn handle(&mut self, changes: &[ChangeEvent]) -> EngineResult<()> {
        let mut sources: Vec<&Path> = changes
            .iter()
            .filter(|c| c.kind != ChangeKind::Deleted)
            .map(|c| c.path.as_path())
            .collect();
        sources.sort();
        sources.dedup();

        let mut first_error = None;
        for source in sources {
            if !source.is_file() {
                continue;
            }
            match self.compiler.compile(source) {
                Ok(CompileOutcome::Compiled(output)) => log::debug!("Wrote {}", output.display()),
                Ok(CompileOutcome::UpToDate) => log::trace!("{} is up to date", source.display()),
                Ok(CompileOutcome::Skipped(reason)) => {
                    log::debug!("Skipped {}: {}", source.display(), reason)
                }
                Err(e) => {
                    log::error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
