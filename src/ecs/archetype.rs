/// Archetype and chunk storage
///
/// Entities that share the same set of component types live in one
/// archetype. An archetype stores its rows in fixed-capacity chunks; each
/// chunk keeps one type-erased byte column per component type. Every column
/// in a chunk holds exactly `chunk.len()` elements.

use super::entity::Entity;
use super::registry::{ComponentId, ComponentType};

/// Default number of rows per chunk
pub const DEFAULT_CHUNK_CAPACITY: usize = 128;

/// Byte array holding one component type for every row of a chunk
#[derive(Debug, Clone)]
pub struct Column {
    ty: ComponentType,
    data: Vec<u8>,
    len: usize,
}

impl Column {
    pub fn new(ty: ComponentType, capacity: usize) -> Self {
        Self {
            ty,
            data: Vec::with_capacity(ty.size * capacity),
            len: 0,
        }
    }

    /// Element type of the stored values
    pub fn component_type(&self) -> ComponentType {
        self.ty
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn row(&self, row: usize) -> &[u8] {
        let size = self.ty.size;
        &self.data[row * size..(row + 1) * size]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let size = self.ty.size;
        &mut self.data[row * size..(row + 1) * size]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn push(&mut self, value: &[u8]) {
        debug_assert_eq!(value.len(), self.ty.size);
        self.data.extend_from_slice(value);
        self.len += 1;
    }

    fn swap_remove(&mut self, row: usize) {
        let last = self.len - 1;
        let size = self.ty.size;
        if row != last && size > 0 {
            let (head, tail) = self.data.split_at_mut(last * size);
            head[row * size..(row + 1) * size].copy_from_slice(&tail[..size]);
        }
        self.data.truncate(last * size);
        self.len -= 1;
    }

    /// Switch to a layout-identical build of the element type
    pub(crate) fn retag(&mut self, ty: ComponentType) {
        debug_assert_eq!(ty.size, self.ty.size);
        self.ty = ty;
    }

    /// Install storage of a different element type.
    ///
    /// `data` must hold exactly `self.len()` elements of `ty`.
    pub(crate) fn replace_storage(&mut self, ty: ComponentType, data: Vec<u8>) {
        debug_assert_eq!(data.len(), ty.size * self.len);
        self.ty = ty;
        self.data = data;
    }
}

/// Fixed-capacity block of rows for one archetype
#[derive(Debug, Clone)]
pub struct Chunk {
    capacity: usize,
    entities: Vec<Entity>,
    columns: Vec<Column>,
}

impl Chunk {
    pub fn new(types: &[ComponentType], capacity: usize) -> Self {
        Self {
            capacity,
            entities: Vec::with_capacity(capacity),
            columns: types.iter().map(|ty| Column::new(*ty, capacity)).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live entity count
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entities.len() >= self.capacity
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub(crate) fn columns_mut(&mut self) -> &mut [Column] {
        &mut self.columns
    }

    pub fn column(&self, index: usize) -> &Column {
        &self.columns[index]
    }

    pub fn column_mut(&mut self, index: usize) -> &mut Column {
        &mut self.columns[index]
    }

    /// Append a row; `values` are ordered like the archetype's types
    pub(crate) fn push(&mut self, entity: Entity, values: &[&[u8]]) -> usize {
        debug_assert!(!self.is_full());
        debug_assert_eq!(values.len(), self.columns.len());
        for (column, value) in self.columns.iter_mut().zip(values) {
            column.push(value);
        }
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Remove a row by moving the last row into it.
    ///
    /// Returns the entity that now occupies `row`, if any moved.
    pub(crate) fn swap_remove(&mut self, row: usize) -> Option<Entity> {
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        self.entities.swap_remove(row);
        self.entities.get(row).copied()
    }

    /// Whether every column matches the live count
    pub fn is_consistent(&self) -> bool {
        self.columns.iter().all(|c| {
            c.len() == self.entities.len() && c.bytes().len() == c.len() * c.component_type().size
        })
    }
}

/// Entities sharing one set of component types
#[derive(Debug, Clone)]
pub struct Archetype {
    types: Vec<ComponentType>,
    chunks: Vec<Chunk>,
    chunk_capacity: usize,
}

impl Archetype {
    /// `types` must be sorted by id and free of duplicates
    pub fn new(types: Vec<ComponentType>, chunk_capacity: usize) -> Self {
        debug_assert!(types.windows(2).all(|w| w[0].id < w[1].id));
        Self {
            types,
            chunks: Vec::new(),
            chunk_capacity,
        }
    }

    pub fn types(&self) -> &[ComponentType] {
        &self.types
    }

    pub(crate) fn types_mut(&mut self) -> &mut [ComponentType] {
        &mut self.types
    }

    pub fn ids(&self) -> Vec<ComponentId> {
        self.types.iter().map(|t| t.id).collect()
    }

    pub fn column_index(&self, id: ComponentId) -> Option<usize> {
        self.types.binary_search_by_key(&id, |t| t.id).ok()
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.column_index(id).is_some()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub(crate) fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Total live rows over all chunks
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a row in the first chunk with room, opening a chunk if needed
    pub(crate) fn push(&mut self, entity: Entity, values: &[&[u8]]) -> (usize, usize) {
        let chunk_index = match self.chunks.iter().position(|c| !c.is_full()) {
            Some(index) => index,
            None => {
                self.chunks.push(Chunk::new(&self.types, self.chunk_capacity));
                self.chunks.len() - 1
            }
        };
        let row = self.chunks[chunk_index].push(entity, values);
        (chunk_index, row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::TypeToken;

    fn ty(id: u32, size: usize) -> ComponentType {
        ComponentType {
            id: ComponentId(id),
            token: TypeToken::mint(),
            size,
            zero_sized: size == 0,
        }
    }

    fn entity(index: u32) -> Entity {
        Entity { index, generation: 0 }
    }

    #[test]
    fn test_chunk_push_and_swap_remove() {
        let mut chunk = Chunk::new(&[ty(0, 4), ty(1, 0)], 4);
        chunk.push(entity(0), &[&1u32.to_ne_bytes(), &[]]);
        chunk.push(entity(1), &[&2u32.to_ne_bytes(), &[]]);
        chunk.push(entity(2), &[&3u32.to_ne_bytes(), &[]]);
        assert!(chunk.is_consistent());

        let moved = chunk.swap_remove(0);
        assert_eq!(moved, Some(entity(2)));
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.column(0).row(0), &3u32.to_ne_bytes());
        assert_eq!(chunk.column(1).len(), 2);
        assert!(chunk.is_consistent());

        assert_eq!(chunk.swap_remove(1), None);
        assert!(chunk.is_consistent());
    }

    #[test]
    fn test_archetype_opens_chunks_when_full() {
        let mut archetype = Archetype::new(vec![ty(3, 2)], 2);
        for i in 0..5 {
            archetype.push(entity(i), &[&(i as u16).to_ne_bytes()]);
        }
        assert_eq!(archetype.chunks().len(), 3);
        assert_eq!(archetype.len(), 5);
        assert!(archetype.chunks().iter().all(Chunk::is_consistent));
    }
}
