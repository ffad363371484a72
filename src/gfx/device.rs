use rustc_hash::FxHashSet;

use super::{Backend, ProgramHandle, ShaderHandle};
use crate::error::{EngineError, EngineResult};

/// Resource-creation surface of the graphics backend
///
/// A created program owns its stages: the caller must not destroy a stage
/// handle once a program was linked from it. When program creation fails the
/// stages stay with the caller.
pub trait GraphicsDevice {
    fn backend(&self) -> Backend;

    fn create_shader(&mut self, name: &str, bytes: &[u8]) -> EngineResult<ShaderHandle>;

    fn create_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> EngineResult<ProgramHandle>;

    fn create_compute_program(&mut self, compute: ShaderHandle) -> EngineResult<ProgramHandle>;

    /// Release a stage no program took ownership of
    fn destroy_shader(&mut self, shader: ShaderHandle);

    fn destroy_program(&mut self, program: ProgramHandle);
}

/// Device that hands out handles without talking to a GPU
///
/// Used when the host runs without a renderer attached and in tests.
#[derive(Debug)]
pub struct HeadlessDevice {
    backend: Backend,
    next_handle: u16,
    live_shaders: FxHashSet<ShaderHandle>,
    live_programs: FxHashSet<ProgramHandle>,
    destroyed: Vec<ProgramHandle>,
}

impl HeadlessDevice {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            next_handle: 0,
            live_shaders: FxHashSet::default(),
            live_programs: FxHashSet::default(),
            destroyed: Vec::new(),
        }
    }

    fn allocate(&mut self, resource: &str) -> EngineResult<u16> {
        if self.next_handle == u16::MAX {
            return Err(EngineError::ResourceCreationFailed {
                resource: resource.to_string(),
                error: "handle space exhausted".to_string(),
            });
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        Ok(handle)
    }

    /// Consume every stage, or none when one of them is not live
    fn take_stages(&mut self, stages: &[ShaderHandle]) -> EngineResult<()> {
        if let Some(stage) = stages.iter().find(|s| !self.live_shaders.contains(*s)) {
            return Err(EngineError::ResourceCreationFailed {
                resource: "program".to_string(),
                error: format!("invalid shader stage {:?}", stage),
            });
        }
        for stage in stages {
            self.live_shaders.remove(stage);
        }
        Ok(())
    }

    pub fn is_live(&self, program: ProgramHandle) -> bool {
        self.live_programs.contains(&program)
    }

    pub fn live_shader_count(&self) -> usize {
        self.live_shaders.len()
    }

    pub fn live_program_count(&self) -> usize {
        self.live_programs.len()
    }

    /// Programs destroyed so far, in destruction order
    pub fn destroyed_programs(&self) -> &[ProgramHandle] {
        &self.destroyed
    }
}

impl GraphicsDevice for HeadlessDevice {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn create_shader(&mut self, name: &str, bytes: &[u8]) -> EngineResult<ShaderHandle> {
        if bytes.is_empty() {
            return Err(EngineError::ResourceCreationFailed {
                resource: format!("shader {}", name),
                error: "empty shader binary".to_string(),
            });
        }
        let handle = ShaderHandle(self.allocate("shader")?);
        self.live_shaders.insert(handle);
        Ok(handle)
    }

    fn create_program(
        &mut self,
        vertex: ShaderHandle,
        fragment: ShaderHandle,
    ) -> EngineResult<ProgramHandle> {
        self.take_stages(&[vertex, fragment])?;
        let handle = ProgramHandle(self.allocate("program")?);
        self.live_programs.insert(handle);
        Ok(handle)
    }

    fn create_compute_program(&mut self, compute: ShaderHandle) -> EngineResult<ProgramHandle> {
        self.take_stages(&[compute])?;
        let handle = ProgramHandle(self.allocate("compute program")?);
        self.live_programs.insert(handle);
        Ok(handle)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        if !self.live_shaders.remove(&shader) {
            log::warn!("Destroying unknown shader {:?}", shader);
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        if self.live_programs.remove(&program) {
            self.destroyed.push(program);
        } else {
            log::warn!("Destroying unknown program {:?}", program);
        }
    }
}
