//! Chunked archetype entity store
//!
//! Component values are stored as type-erased byte columns described by
//! [`TypeManifest`]s, so a reload can rebuild a column under a new layout
//! without knowing the Rust type that produced it.

pub mod archetype;
pub mod entity;
pub mod manifest;
pub mod registry;
pub mod world;

pub use archetype::{Archetype, Chunk, Column, DEFAULT_CHUNK_CAPACITY};
pub use entity::{Entity, EntityAllocator};
pub use manifest::{Component, FieldKind, FieldManifest, FieldType, PrimitiveKind, TypeManifest};
pub use registry::{ComponentDescriptor, ComponentId, ComponentRegistry, ComponentType, TypeToken};
pub use world::{ComponentValue, EntityBuilder, EntityLocation, World};
