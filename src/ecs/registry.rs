use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::manifest::TypeManifest;
use crate::error::{EngineError, EngineResult};

/// Slot of a component type in the registry
///
/// Slots are stable for the lifetime of the process: a reload replaces the
/// descriptor stored in a slot but never moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

impl ComponentId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Runtime identity of one build of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl TypeToken {
    /// Fresh token, never equal to any previously minted one
    ///
    /// Every loaded package image links its own counter; package code reaches
    /// the host's through [`World`](crate::ecs::World) instead of calling this.
    pub fn mint() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Per-archetype view of a component type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentType {
    pub id: ComponentId,
    pub token: TypeToken,
    pub size: usize,
    pub zero_sized: bool,
}

/// Registry entry for a component type
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub id: ComponentId,
    pub token: TypeToken,
    pub size: usize,
    pub zero_sized: bool,
    pub manifest: Arc<TypeManifest>,
}

impl ComponentDescriptor {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn component_type(&self) -> ComponentType {
        ComponentType {
            id: self.id,
            token: self.token,
            size: self.size,
            zero_sized: self.zero_sized,
        }
    }
}

/// Mapping from slot to descriptor, with lookups by stable name and by the
/// token of the current build
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    descriptors: Vec<ComponentDescriptor>,
    by_name: FxHashMap<String, ComponentId>,
    by_token: FxHashMap<TypeToken, ComponentId>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type, or return the slot already holding its name
    pub fn register(
        &mut self,
        manifest: Arc<TypeManifest>,
        token: TypeToken,
    ) -> EngineResult<ComponentId> {
        if let Some(&id) = self.by_name.get(&manifest.name) {
            return Ok(id);
        }
        manifest.validate()?;
        if let Some(holder) = self.by_token.get(&token) {
            return Err(EngineError::Internal {
                message: format!("token {} already names {:?}", token.raw(), holder),
            });
        }

        let id = ComponentId(self.descriptors.len() as u32);
        log::debug!("Registered component {} as {:?}", manifest.name, id);
        self.by_name.insert(manifest.name.clone(), id);
        self.by_token.insert(token, id);
        self.descriptors.push(ComponentDescriptor {
            id,
            token,
            size: manifest.size,
            zero_sized: manifest.is_zero_sized(),
            manifest,
        });
        Ok(id)
    }

    /// Swap the descriptor in `id` for a new build of the same type.
    ///
    /// The stable name keeps resolving to `id`; the old token stops
    /// resolving. Returns the replaced descriptor.
    pub fn replace(
        &mut self,
        id: ComponentId,
        manifest: Arc<TypeManifest>,
        token: TypeToken,
    ) -> EngineResult<ComponentDescriptor> {
        manifest.validate()?;
        if let Some(holder) = self.by_token.get(&token).filter(|holder| **holder != id) {
            return Err(EngineError::Internal {
                message: format!("token {} already names {:?}", token.raw(), holder),
            });
        }
        let slot = self
            .descriptors
            .get_mut(id.idx())
            .ok_or_else(|| EngineError::Internal {
                message: format!("no component slot {:?}", id),
            })?;
        if slot.manifest.name != manifest.name {
            return Err(EngineError::Internal {
                message: format!(
                    "slot {:?} holds {}, cannot replace with {}",
                    id, slot.manifest.name, manifest.name
                ),
            });
        }

        let replacement = ComponentDescriptor {
            id,
            token,
            size: manifest.size,
            zero_sized: manifest.is_zero_sized(),
            manifest,
        };
        let old = std::mem::replace(slot, replacement);
        self.by_token.remove(&old.token);
        self.by_token.insert(token, id);
        Ok(old)
    }

    pub fn get(&self, id: ComponentId) -> Option<&ComponentDescriptor> {
        self.descriptors.get(id.idx())
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn get_by_token(&self, token: TypeToken) -> Option<&ComponentDescriptor> {
        self.by_token.get(&token).and_then(|id| self.get(*id))
    }

    pub fn id_of(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Drop every entry; part of host shutdown
    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.by_name.clear();
        self.by_token.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{FieldKind, FieldManifest, PrimitiveKind};

    fn manifest(name: &str, fields: &[(&str, usize, PrimitiveKind)]) -> Arc<TypeManifest> {
        let size = fields.iter().map(|(_, o, k)| o + k.size()).max().unwrap_or(0);
        Arc::new(TypeManifest::new(
            name,
            size,
            fields
                .iter()
                .map(|(n, o, k)| FieldManifest::new(*n, *o, FieldKind::Primitive(*k)))
                .collect(),
        ))
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = TypeToken::mint();
        let b = TypeToken::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_is_idempotent_by_name() {
        let mut registry = ComponentRegistry::new();
        let first = registry
            .register(manifest("Health", &[("value", 0, PrimitiveKind::F32)]), TypeToken::mint())
            .expect("register");
        let again = registry
            .register(manifest("Health", &[("value", 0, PrimitiveKind::F32)]), TypeToken::mint())
            .expect("register again");
        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_replace_keeps_slot_and_retires_token() {
        let mut registry = ComponentRegistry::new();
        let old_token = TypeToken::mint();
        let id = registry
            .register(manifest("Light", &[("intensity", 0, PrimitiveKind::F32)]), old_token)
            .expect("register");

        let new_token = TypeToken::mint();
        let old = registry
            .replace(
                id,
                manifest(
                    "Light",
                    &[("intensity", 0, PrimitiveKind::F32), ("range", 4, PrimitiveKind::F32)],
                ),
                new_token,
            )
            .expect("replace");

        assert_eq!(old.token, old_token);
        assert_eq!(registry.id_of("Light"), Some(id));
        assert_eq!(registry.get(id).map(|d| d.size), Some(8));
        assert!(registry.get_by_token(old_token).is_none());
        assert_eq!(registry.get_by_token(new_token).map(|d| d.id), Some(id));
    }

    #[test]
    fn test_replace_rejects_other_name() {
        let mut registry = ComponentRegistry::new();
        let id = registry
            .register(manifest("A", &[("x", 0, PrimitiveKind::U8)]), TypeToken::mint())
            .expect("register");
        assert!(registry
            .replace(id, manifest("B", &[("x", 0, PrimitiveKind::U8)]), TypeToken::mint())
            .is_err());
    }

    #[test]
    fn test_token_in_use_is_rejected() {
        let mut registry = ComponentRegistry::new();
        let token = TypeToken::mint();
        let pulse = registry
            .register(manifest("Pulse", &[("phase", 0, PrimitiveKind::F32)]), token)
            .expect("register");
        assert!(registry
            .register(manifest("Glow", &[("level", 0, PrimitiveKind::U16)]), token)
            .is_err());

        let glow = registry
            .register(manifest("Glow", &[("level", 0, PrimitiveKind::U16)]), TypeToken::mint())
            .expect("register");
        assert!(registry
            .replace(glow, manifest("Glow", &[("level", 0, PrimitiveKind::U16)]), token)
            .is_err());
        assert_eq!(registry.get_by_token(token).map(|d| d.id), Some(pulse));
    }
}
