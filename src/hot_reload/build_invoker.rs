//! External build invocation
//!
//! Runs the configured build command through the host shell, retries the
//! whole invocation on failure and stages the resulting artifacts into the
//! plugin directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::{EngineError, EngineResult, IoContext};

/// Default number of attempts before a build cycle is abandoned
pub const DEFAULT_BUILD_ATTEMPTS: u32 = 3;

/// Output lines naming these are never reported as build errors
pub const DEBUG_SYMBOL_MARKERS: &[&str] = &[".pdb", ".dSYM", ".dwp"];

/// Shell exit code for "command not found"
#[cfg(unix)]
const COMMAND_NOT_FOUND: i32 = 127;

/// Shell used to run build commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPlatform {
    Windows,
    Unix,
    Unsupported(String),
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(windows) {
            HostPlatform::Windows
        } else if cfg!(unix) {
            HostPlatform::Unix
        } else {
            HostPlatform::Unsupported(std::env::consts::OS.to_string())
        }
    }

    /// Command running `command` through this platform's shell
    pub fn shell_command(&self, command: &str) -> EngineResult<Command> {
        match self {
            HostPlatform::Windows => {
                let mut cmd = Command::new("cmd.exe");
                cmd.arg("/C").arg(command);
                Ok(cmd)
            }
            HostPlatform::Unix => {
                let mut cmd = Command::new("/bin/sh");
                cmd.arg("-c").arg(command);
                Ok(cmd)
            }
            HostPlatform::Unsupported(platform) => Err(EngineError::UnsupportedPlatform {
                platform: platform.clone(),
            }),
        }
    }

    fn shell_name(&self) -> &str {
        match self {
            HostPlatform::Windows => "cmd.exe",
            HostPlatform::Unix => "/bin/sh",
            HostPlatform::Unsupported(platform) => platform,
        }
    }
}

/// Whether a line of build output should be surfaced
pub fn is_error_line(line: &str) -> bool {
    line.contains("error") && !DEBUG_SYMBOL_MARKERS.iter().any(|m| line.contains(m))
}

#[cfg(unix)]
fn command_not_found(status: &ExitStatus) -> bool {
    status.code() == Some(COMMAND_NOT_FOUND)
}

#[cfg(not(unix))]
fn command_not_found(_status: &ExitStatus) -> bool {
    false
}

fn report_output(bytes: &[u8]) -> usize {
    let mut errors = 0;
    for line in String::from_utf8_lossy(bytes).lines() {
        if is_error_line(line) {
            log::error!("{}", line);
            errors += 1;
        } else {
            log::trace!("{}", line);
        }
    }
    errors
}

/// Runs one build command with retries
#[derive(Debug, Clone)]
pub struct BuildInvoker {
    command: String,
    max_attempts: u32,
    platform: HostPlatform,
}

impl BuildInvoker {
    pub fn new(command: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            command: command.into(),
            max_attempts: max_attempts.max(1),
            platform: HostPlatform::current(),
        }
    }

    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run the command once in `working_dir` and wait for it
    pub fn invoke(&self, working_dir: &Path) -> EngineResult<ExitStatus> {
        let mut cmd = self.platform.shell_command(&self.command)?;
        let output = cmd
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => EngineError::BuildToolMissing {
                    tool: self.platform.shell_name().to_string(),
                },
                _ => EngineError::IoError {
                    path: working_dir.display().to_string(),
                    error: e.to_string(),
                },
            })?;

        report_output(&output.stdout);
        report_output(&output.stderr);

        if command_not_found(&output.status) {
            let tool = self.command.split_whitespace().next().unwrap_or_default();
            return Err(EngineError::BuildToolMissing { tool: tool.to_string() });
        }

        Ok(output.status)
    }

    /// Run the command until it succeeds, up to the attempt limit.
    ///
    /// Returns the number of attempts used.
    pub fn invoke_with_retry(&self, working_dir: &Path) -> EngineResult<u32> {
        for attempt in 1..=self.max_attempts {
            match self.invoke(working_dir) {
                Ok(status) if status.success() => {
                    log::info!("Build succeeded on attempt {}", attempt);
                    return Ok(attempt);
                }
                Ok(status) => {
                    log::warn!(
                        "Build attempt {}/{} failed with {}",
                        attempt,
                        self.max_attempts,
                        status
                    );
                }
                Err(
                    e @ (EngineError::BuildToolMissing { .. }
                    | EngineError::UnsupportedPlatform { .. }),
                ) => {
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Build attempt {}/{} failed: {}", attempt, self.max_attempts, e);
                }
            }
        }
        Err(EngineError::BuildFailed {
            attempts: self.max_attempts,
        })
    }
}

/// Copies build artifacts of one package into the plugin directory
#[derive(Debug, Clone)]
pub struct ArtifactStager {
    artifact_dir: PathBuf,
    plugin_dir: PathBuf,
    stem: String,
}

impl ArtifactStager {
    pub fn new(
        artifact_dir: impl Into<PathBuf>,
        plugin_dir: impl Into<PathBuf>,
        stem: impl Into<String>,
    ) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            plugin_dir: plugin_dir.into(),
            stem: stem.into(),
        }
    }

    /// Whether a file name belongs to the package
    pub fn is_artifact(&self, file_name: &str) -> bool {
        let plain = format!("{}.", self.stem);
        let prefixed = format!("{}{}.", std::env::consts::DLL_PREFIX, self.stem);
        file_name.starts_with(&plain) || file_name.starts_with(&prefixed)
    }

    /// Copy every artifact under the artifact directory, overwriting
    /// existing copies. Returns the staged paths.
    pub fn stage(&self) -> EngineResult<Vec<PathBuf>> {
        let mut found = Vec::new();
        self.collect(&self.artifact_dir, &mut found)?;
        found.sort();

        fs::create_dir_all(&self.plugin_dir).io_context(&self.plugin_dir)?;
        let mut staged = Vec::with_capacity(found.len());
        for source in found {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = self.plugin_dir.join(name);
            let temp = self.plugin_dir.join(format!(".{}.staging", name.to_string_lossy()));
            let copy_failed = |e: std::io::Error| EngineError::ArtifactCopyFailed {
                path: source.display().to_string(),
                error: e.to_string(),
            };
            fs::copy(&source, &temp).map_err(copy_failed)?;
            fs::rename(&temp, &target).map_err(copy_failed)?;
            log::debug!("Staged {} -> {}", source.display(), target.display());
            staged.push(target);
        }
        Ok(staged)
    }

    fn collect(&self, dir: &Path, found: &mut Vec<PathBuf>) -> EngineResult<()> {
        if dir == self.plugin_dir {
            return Ok(());
        }
        for entry in fs::read_dir(dir).io_context(dir)? {
            let path = entry.io_context(dir)?.path();
            if path.is_dir() {
                self.collect(&path, found)?;
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| self.is_artifact(n))
                .unwrap_or(false)
            {
                found.push(path);
            }
        }
        Ok(())
    }
}
