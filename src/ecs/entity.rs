use std::collections::VecDeque;
use std::fmt;

/// Unique identifier for an entity
///
/// The generation detects stale handles to recycled slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    pub index: u32,
    pub generation: u32,
}

impl Entity {
    pub const INVALID: Entity = Entity {
        index: u32::MAX,
        generation: 0,
    };

    pub fn idx(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Manages entity creation and destruction
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    recycled: VecDeque<u32>,
    count: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new entity
    pub fn create(&mut self) -> Entity {
        let index = if let Some(recycled) = self.recycled.pop_front() {
            recycled
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            self.alive.push(false);
            index
        };

        self.alive[index as usize] = true;
        self.count += 1;
        Entity {
            index,
            generation: self.generations[index as usize],
        }
    }

    /// Destroy an entity
    pub fn destroy(&mut self, entity: Entity) -> bool {
        if !self.exists(entity) {
            return false;
        }
        let idx = entity.idx();
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.recycled.push_back(entity.index);
        self.count -= 1;
        true
    }

    /// Check if an entity exists
    pub fn exists(&self, entity: Entity) -> bool {
        let idx = entity.idx();
        idx < self.alive.len() && self.alive[idx] && self.generations[idx] == entity.generation
    }

    /// Get the number of active entities
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of slots ever handed out
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}
