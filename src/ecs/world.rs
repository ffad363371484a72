use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::archetype::{Archetype, DEFAULT_CHUNK_CAPACITY};
use super::entity::{Entity, EntityAllocator};
use super::manifest::{Component, TypeManifest};
use super::registry::{
    ComponentDescriptor, ComponentId, ComponentRegistry, ComponentType, TypeToken,
};
use crate::error::{EngineError, EngineResult};

/// Where an entity's row lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityLocation {
    pub archetype: usize,
    pub chunk: usize,
    pub row: usize,
}

/// Raw value for one component of an entity
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentValue {
    pub id: ComponentId,
    pub bytes: Vec<u8>,
}

impl ComponentValue {
    pub fn new(id: ComponentId, bytes: Vec<u8>) -> Self {
        Self { id, bytes }
    }
}

/// The entity store: archetypes, chunks and the component type registry
pub struct World {
    entities: EntityAllocator,
    locations: Vec<Option<EntityLocation>>,
    archetypes: Vec<Archetype>,
    archetype_index: FxHashMap<Vec<ComponentId>, usize>,
    registry: ComponentRegistry,
    /// Resolved in the image that created the world, so package code
    /// registering a type on demand mints from the host's sequence
    mint_token: fn() -> TypeToken,
    chunk_capacity: usize,
    quit_requested: bool,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self::with_chunk_capacity(DEFAULT_CHUNK_CAPACITY)
    }

    /// Replace the token source used by on-demand registration
    pub fn with_token_minter(mut self, mint: fn() -> TypeToken) -> Self {
        self.mint_token = mint;
        self
    }

    pub fn with_chunk_capacity(chunk_capacity: usize) -> Self {
        Self {
            entities: EntityAllocator::new(),
            locations: Vec::new(),
            archetypes: Vec::new(),
            archetype_index: FxHashMap::default(),
            registry: ComponentRegistry::new(),
            mint_token: TypeToken::mint,
            chunk_capacity: chunk_capacity.max(1),
            quit_requested: false,
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub(crate) fn archetypes_mut(&mut self) -> &mut [Archetype] {
        &mut self.archetypes
    }

    /// Register a host-defined component type
    pub fn register_component<T: Component>(&mut self) -> EngineResult<ComponentId> {
        self.register_manifest(Arc::new(T::manifest()))
    }

    /// Register a type from its manifest alone, minting a token for it
    pub fn register_manifest(&mut self, manifest: Arc<TypeManifest>) -> EngineResult<ComponentId> {
        let token = (self.mint_token)();
        self.registry.register(manifest, token)
    }

    pub fn component_id<T: Component>(&self) -> Option<ComponentId> {
        self.registry.id_of(T::NAME)
    }

    pub fn descriptor(&self, id: ComponentId) -> Option<&ComponentDescriptor> {
        self.registry.get(id)
    }

    /// Start building an entity
    pub fn spawn(&mut self) -> EntityBuilder<'_> {
        EntityBuilder {
            world: self,
            values: Vec::new(),
            error: None,
        }
    }

    /// Create an entity from raw component values
    pub fn spawn_raw(&mut self, mut values: Vec<ComponentValue>) -> EngineResult<Entity> {
        values.sort_by_key(|v| v.id);
        if values.windows(2).any(|w| w[0].id == w[1].id) {
            return Err(EngineError::Internal {
                message: "duplicate component in spawn".to_string(),
            });
        }

        let mut types = Vec::with_capacity(values.len());
        for value in &values {
            let descriptor = self.registry.get(value.id).ok_or_else(|| {
                EngineError::ComponentNotRegistered {
                    name: format!("{:?}", value.id),
                }
            })?;
            if descriptor.size != value.bytes.len() {
                return Err(EngineError::LayoutMismatch {
                    name: descriptor.name().to_string(),
                    expected: descriptor.size,
                    found: value.bytes.len(),
                });
            }
            types.push(descriptor.component_type());
        }

        let archetype_index = self.archetype_for(types);
        let entity = self.entities.create();
        let rows: Vec<&[u8]> = values.iter().map(|v| v.bytes.as_slice()).collect();
        let (chunk, row) = self.archetypes[archetype_index].push(entity, &rows);

        if self.locations.len() <= entity.idx() {
            self.locations.resize(entity.idx() + 1, None);
        }
        self.locations[entity.idx()] = Some(EntityLocation {
            archetype: archetype_index,
            chunk,
            row,
        });
        Ok(entity)
    }

    fn archetype_for(&mut self, types: Vec<ComponentType>) -> usize {
        let key: Vec<ComponentId> = types.iter().map(|t| t.id).collect();
        if let Some(&index) = self.archetype_index.get(&key) {
            return index;
        }
        let index = self.archetypes.len();
        self.archetypes.push(Archetype::new(types, self.chunk_capacity));
        self.archetype_index.insert(key, index);
        index
    }

    /// Destroy an entity and all its components
    pub fn despawn(&mut self, entity: Entity) -> bool {
        let Some(location) = self.location(entity) else {
            return false;
        };

        let chunk = &mut self.archetypes[location.archetype].chunks_mut()[location.chunk];
        if let Some(moved) = chunk.swap_remove(location.row) {
            self.locations[moved.idx()] = Some(location);
        }
        self.locations[entity.idx()] = None;
        self.entities.destroy(entity)
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.entities.exists(entity)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.count()
    }

    pub fn location(&self, entity: Entity) -> Option<EntityLocation> {
        if !self.entities.exists(entity) {
            return None;
        }
        self.locations.get(entity.idx()).copied().flatten()
    }

    /// Component types of the entity's archetype
    pub fn archetype_of(&self, entity: Entity) -> Option<&[ComponentType]> {
        let location = self.location(entity)?;
        Some(self.archetypes[location.archetype].types())
    }

    pub fn has(&self, entity: Entity, id: ComponentId) -> bool {
        self.location(entity)
            .map(|l| self.archetypes[l.archetype].contains(id))
            .unwrap_or(false)
    }

    /// Raw bytes of one component
    pub fn get_raw(&self, entity: Entity, id: ComponentId) -> Option<&[u8]> {
        let location = self.location(entity)?;
        let archetype = &self.archetypes[location.archetype];
        let column = archetype.column_index(id)?;
        Some(archetype.chunks()[location.chunk].column(column).row(location.row))
    }

    pub fn get_raw_mut(&mut self, entity: Entity, id: ComponentId) -> Option<&mut [u8]> {
        let location = self.location(entity)?;
        let archetype = &mut self.archetypes[location.archetype];
        let column = archetype.column_index(id)?;
        Some(
            archetype.chunks_mut()[location.chunk]
                .column_mut(column)
                .row_mut(location.row),
        )
    }

    /// Id of `T` after checking its layout against the current build
    fn typed_id<T: Component>(&self) -> EngineResult<ComponentId> {
        let descriptor = self
            .registry
            .get_by_name(T::NAME)
            .ok_or_else(|| EngineError::ComponentNotRegistered {
                name: T::NAME.to_string(),
            })?;
        let size = std::mem::size_of::<T>();
        if descriptor.size != size {
            return Err(EngineError::LayoutMismatch {
                name: T::NAME.to_string(),
                expected: descriptor.size,
                found: size,
            });
        }
        Ok(descriptor.id)
    }

    /// Copy of a typed component
    pub fn get<T: Component>(&self, entity: Entity) -> Option<T> {
        let id = self.typed_id::<T>().ok()?;
        self.get_raw(entity, id).map(bytemuck::pod_read_unaligned)
    }

    /// Overwrite a typed component the entity already has
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> EngineResult<()> {
        let id = self.typed_id::<T>()?;
        let row = self
            .get_raw_mut(entity, id)
            .ok_or_else(|| EngineError::EntityNotFound {
                entity: format!("{} with {}", entity, T::NAME),
            })?;
        row.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Read-modify-write a typed component
    pub fn update<T: Component>(
        &mut self,
        entity: Entity,
        f: impl FnOnce(&mut T),
    ) -> EngineResult<()> {
        let mut value = self.get::<T>(entity).ok_or_else(|| EngineError::EntityNotFound {
            entity: format!("{} with {}", entity, T::NAME),
        })?;
        f(&mut value);
        self.set(entity, value)
    }

    /// Read a field by dotted path through the current manifest
    pub fn read_field<F: bytemuck::Pod>(
        &self,
        entity: Entity,
        id: ComponentId,
        path: &str,
    ) -> Option<F> {
        let manifest = &self.registry.get(id)?.manifest;
        let (offset, field) = manifest.resolve_path(path)?;
        if field.size() != std::mem::size_of::<F>() {
            return None;
        }
        let row = self.get_raw(entity, id)?;
        Some(bytemuck::pod_read_unaligned(&row[offset..offset + field.size()]))
    }

    /// Write a field by dotted path through the current manifest
    pub fn write_field<F: bytemuck::Pod>(
        &mut self,
        entity: Entity,
        id: ComponentId,
        path: &str,
        value: F,
    ) -> EngineResult<()> {
        let descriptor = self.registry.get(id).ok_or_else(|| EngineError::ComponentNotRegistered {
            name: format!("{:?}", id),
        })?;
        let (offset, field) = descriptor
            .manifest
            .resolve_path(path)
            .ok_or_else(|| EngineError::Internal {
                message: format!("{} has no field {}", descriptor.name(), path),
            })?;
        let size = field.size();
        if size != std::mem::size_of::<F>() {
            return Err(EngineError::LayoutMismatch {
                name: format!("{}.{}", descriptor.name(), path),
                expected: size,
                found: std::mem::size_of::<F>(),
            });
        }

        let row = self.get_raw_mut(entity, id).ok_or_else(|| EngineError::EntityNotFound {
            entity: entity.to_string(),
        })?;
        row[offset..offset + size].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }

    /// Every live entity carrying `id`
    pub fn entities_with(&self, id: ComponentId) -> Vec<Entity> {
        self.archetypes
            .iter()
            .filter(|a| a.contains(id))
            .flat_map(|a| a.chunks().iter().flat_map(|c| c.entities().iter().copied()))
            .collect()
    }

    /// Snapshot of every `T` in the world
    pub fn query<T: Component>(&self) -> Vec<(Entity, T)> {
        let Ok(id) = self.typed_id::<T>() else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for archetype in self.archetypes.iter() {
            let Some(column) = archetype.column_index(id) else {
                continue;
            };
            for chunk in archetype.chunks() {
                let column = chunk.column(column);
                for (row, entity) in chunk.entities().iter().enumerate() {
                    found.push((*entity, bytemuck::pod_read_unaligned(column.row(row))));
                }
            }
        }
        found
    }

    /// Visit every `T` mutably
    pub fn for_each_mut<T: Component>(&mut self, mut f: impl FnMut(Entity, &mut T)) {
        let Ok(id) = self.typed_id::<T>() else {
            return;
        };
        for archetype in self.archetypes.iter_mut() {
            let Some(column) = archetype.column_index(id) else {
                continue;
            };
            for chunk in archetype.chunks_mut() {
                let entities = chunk.entities().to_vec();
                let column = chunk.column_mut(column);
                for (row, entity) in entities.into_iter().enumerate() {
                    let bytes = column.row_mut(row);
                    let mut value: T = bytemuck::pod_read_unaligned(bytes);
                    f(entity, &mut value);
                    bytes.copy_from_slice(bytemuck::bytes_of(&value));
                }
            }
        }
    }

    /// Ask the host loop to stop after the current tick
    pub fn request_quit(&mut self) {
        self.quit_requested = true;
    }

    pub fn quit_requested(&self) -> bool {
        self.quit_requested
    }

    /// Remove every entity and registration
    pub fn clear(&mut self) {
        self.entities = EntityAllocator::new();
        self.locations.clear();
        self.archetypes.clear();
        self.archetype_index.clear();
        self.registry.clear();
    }
}

/// Builder for creating entities with components
pub struct EntityBuilder<'a> {
    world: &'a mut World,
    values: Vec<ComponentValue>,
    error: Option<EngineError>,
}

impl<'a> EntityBuilder<'a> {
    /// Add a typed component, registering its type on first use
    pub fn with<T: Component>(mut self, component: T) -> Self {
        if self.error.is_some() {
            return self;
        }
        let id = match self.world.component_id::<T>() {
            Some(id) => Ok(id),
            None => self.world.register_component::<T>(),
        };
        match id {
            Ok(id) => self
                .values
                .push(ComponentValue::new(id, bytemuck::bytes_of(&component).to_vec())),
            Err(e) => self.error = Some(e),
        }
        self
    }

    /// Add a component by slot and raw bytes
    pub fn with_raw(mut self, id: ComponentId, bytes: Vec<u8>) -> Self {
        self.values.push(ComponentValue::new(id, bytes));
        self
    }

    /// Finish building and return the entity
    pub fn build(self) -> EngineResult<Entity> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.world.spawn_raw(self.values)
    }
}
