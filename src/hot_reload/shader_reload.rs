use std::path::Path;

use rustc_hash::{FxHashMap, FxHashSet};

use super::error::shader_reload_error;
use super::pipeline::{ChangeHandler, WatchPipeline};
use super::queue::{EventQueue, EventSender, ShaderEvent};
use super::watcher::{ChangeEvent, ChangeKind, ChangeWatcher, FileFilter};
use crate::ecs::{Component, ComponentId, Entity, World};
use crate::error::{EngineError, EngineResult};
use crate::gfx::{Backend, GraphicsDevice, ProgramHandle, ShaderLibrary, ShaderProgramSpec};

/// A program-handle field populated from shader binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinding {
    pub entity: Entity,
    pub component: ComponentId,
    /// Dotted path of the handle field inside the component
    pub field: String,
    pub spec: ShaderProgramSpec,
}

type Owner = (Entity, ComponentId);

/// Shader hot-swap manager
///
/// Keeps a back reference from every shader name to the components whose
/// program fields were built from it, and rebuilds those programs when a
/// recompiled binary is announced.
pub struct ShaderHotSwap {
    library: ShaderLibrary,
    /// Owner -> bindings of that owner's field group
    bindings: FxHashMap<Owner, Vec<ShaderBinding>>,
    /// Shader name -> owners using it
    index: FxHashMap<String, Vec<Owner>>,
    queue: EventQueue<ShaderEvent>,
    watcher: Option<WatchPipeline>,
}

impl ShaderHotSwap {
    pub fn new(library: ShaderLibrary) -> Self {
        Self {
            library,
            bindings: FxHashMap::default(),
            index: FxHashMap::default(),
            queue: EventQueue::new(),
            watcher: None,
        }
    }

    pub fn library(&self) -> &ShaderLibrary {
        &self.library
    }

    /// Producer handle for recompiled-shader notifications
    pub fn sender(&self) -> EventSender<ShaderEvent> {
        self.queue.sender()
    }

    /// Bindings recorded for one component of an entity
    pub fn bindings_of(&self, entity: Entity, component: ComponentId) -> &[ShaderBinding] {
        self.bindings
            .get(&(entity, component))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of owners bound to a shader
    pub fn owner_count(&self, shader: &str) -> usize {
        self.index.get(shader).map(Vec::len).unwrap_or(0)
    }

    /// Create the programs of every annotated field of one component and
    /// record their bindings. A field whose program cannot be created is set
    /// to an invalid handle and still bound, so a later reload can fix it.
    ///
    /// Returns the number of programs created.
    pub fn load_shaders(
        &mut self,
        world: &mut World,
        device: &mut dyn GraphicsDevice,
        entity: Entity,
        component: ComponentId,
    ) -> EngineResult<usize> {
        let descriptor = world
            .registry()
            .get(component)
            .ok_or_else(|| EngineError::ComponentNotRegistered {
                name: format!("{:?}", component),
            })?;
        let manifest = descriptor.manifest.clone();
        if !world.has(entity, component) {
            return Err(EngineError::EntityNotFound {
                entity: format!("{} with {}", entity, manifest.name),
            });
        }

        self.forget_owner((entity, component));
        let mut created = 0;
        let mut bindings = Vec::new();
        for (path, field) in manifest.shader_fields() {
            let Some(spec) = field.shader.clone() else {
                continue;
            };
            let program = match self.library.create_program(device, &spec) {
                Ok(program) => {
                    created += 1;
                    program
                }
                Err(e) => {
                    log::error!("{}.{}: {}", manifest.name, path, e);
                    ProgramHandle::INVALID
                }
            };
            world.write_field(entity, component, &path, program)?;
            bindings.push(ShaderBinding {
                entity,
                component,
                field: path,
                spec,
            });
        }

        if !bindings.is_empty() {
            let owner = (entity, component);
            let mut names: Vec<&str> = bindings.iter().flat_map(|b| b.spec.stages()).collect();
            names.sort_unstable();
            names.dedup();
            for name in names {
                self.index.entry(name.to_string()).or_default().push(owner);
            }
            self.bindings.insert(owner, bindings);
        }
        Ok(created)
    }

    /// Typed convenience over [`load_shaders`](Self::load_shaders)
    pub fn load_shaders_for<T: Component>(
        &mut self,
        world: &mut World,
        device: &mut dyn GraphicsDevice,
        entity: Entity,
    ) -> EngineResult<usize> {
        let component = world
            .component_id::<T>()
            .ok_or_else(|| EngineError::ComponentNotRegistered {
                name: T::NAME.to_string(),
            })?;
        self.load_shaders(world, device, entity, component)
    }

    /// Drop every binding of an entity
    pub fn forget_entity(&mut self, entity: Entity) {
        let owners: Vec<Owner> =
            self.bindings.keys().filter(|(e, _)| *e == entity).copied().collect();
        for owner in owners {
            self.forget_owner(owner);
        }
    }

    fn forget_owner(&mut self, owner: Owner) {
        if self.bindings.remove(&owner).is_none() {
            return;
        }
        self.index.retain(|_, owners| {
            owners.retain(|o| *o != owner);
            !owners.is_empty()
        });
    }

    fn prune(&mut self, world: &World) {
        let stale: Vec<Owner> = self
            .bindings
            .keys()
            .filter(|(entity, component)| !world.has(*entity, *component))
            .copied()
            .collect();
        for owner in stale {
            log::debug!("Dropping shader bindings of despawned {}", owner.0);
            self.forget_owner(owner);
        }
    }

    /// Rebuild every program that uses `shader`.
    ///
    /// All replacement programs are created before any field is written or
    /// any old program destroyed. A program that fails to build leaves its
    /// field untouched. Returns the number of programs replaced.
    pub fn reload(
        &mut self,
        world: &mut World,
        device: &mut dyn GraphicsDevice,
        shader: &str,
    ) -> usize {
        self.prune(world);
        let Some(owners) = self.index.get(shader).cloned() else {
            log::debug!("No programs use shader {}", shader);
            return 0;
        };

        let mut created: Vec<(ShaderBinding, ProgramHandle)> = Vec::new();
        for owner in &owners {
            let Some(bindings) = self.bindings.get(owner) else {
                continue;
            };
            for binding in bindings {
                match self.library.create_program(device, &binding.spec) {
                    Ok(program) => created.push((binding.clone(), program)),
                    Err(e) => {
                        let error = shader_reload_error(shader, e);
                        log::error!("{} ({} field {})", error, binding.entity, binding.field);
                    }
                }
            }
        }

        let mut replaced = 0;
        for (binding, program) in created {
            let old = world.read_field::<ProgramHandle>(
                binding.entity,
                binding.component,
                &binding.field,
            );
            match world.write_field(binding.entity, binding.component, &binding.field, program) {
                Ok(()) => {
                    if let Some(old) = old.filter(|h| h.is_valid()) {
                        device.destroy_program(old);
                    }
                    replaced += 1;
                }
                Err(e) => {
                    log::warn!("Shader field {} is gone: {}", binding.field, e);
                    device.destroy_program(program);
                }
            }
        }

        log::info!("Reloaded shader {} ({} programs)", shader, replaced);
        replaced
    }

    /// Apply every queued notification. Returns the programs replaced.
    pub fn process_pending(&mut self, world: &mut World, device: &mut dyn GraphicsDevice) -> usize {
        let mut replaced = 0;
        for event in self.queue.drain() {
            replaced += self.reload(world, device, &event.shader);
        }
        replaced
    }

    /// Watch the backend's binary folder and queue a notification for every
    /// rewritten binary
    pub fn watch(&mut self, backend: Backend) -> EngineResult<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        let dir = self.library.root().join(backend.shader_dir());
        let watcher = ChangeWatcher::new(&dir, FileFilter::new(vec!["bin"]))?;
        let notifier = BinaryNotifier {
            sender: self.queue.sender(),
        };
        self.watcher = Some(WatchPipeline::spawn(watcher, notifier, None)?);
        Ok(())
    }

    /// Stop watching; bindings are kept
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
    }

    /// Destroy every bound program that is still live and forget all
    /// bindings
    pub fn shutdown(&mut self, world: &World, device: &mut dyn GraphicsDevice) {
        self.stop();
        for (_, bindings) in self.bindings.drain() {
            for binding in bindings {
                let handle = world.read_field::<ProgramHandle>(
                    binding.entity,
                    binding.component,
                    &binding.field,
                );
                if let Some(handle) = handle.filter(|h| h.is_valid()) {
                    device.destroy_program(handle);
                }
            }
        }
        self.index.clear();
    }
}

fn shader_name(path: &Path) -> Option<String> {
    path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
}

/// Posts a shader event per rewritten binary
struct BinaryNotifier {
    sender: EventSender<ShaderEvent>,
}

impl ChangeHandler for BinaryNotifier {
    fn name(&self) -> &str {
        "shader watch"
    }

    fn handle(&mut self, changes: &[ChangeEvent]) -> EngineResult<()> {
        let mut seen = FxHashSet::default();
        for change in changes {
            if change.kind == ChangeKind::Deleted {
                continue;
            }
            if let Some(shader) = shader_name(&change.path) {
                if seen.insert(shader.clone()) {
                    log::debug!("Shader binary {} changed", shader);
                    self.sender.send(ShaderEvent { shader });
                }
            }
        }
        Ok(())
    }
}
