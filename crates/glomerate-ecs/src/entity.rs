use std::collections::VecDeque;
use std::fmt;

/// A generational entity handle. Uses compact u32 index + generation for cache performance.
///
/// Index 0 is reserved for [`Entity::NULL`] and is never handed out by the allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Entity {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl Entity {
    /// The permanently invalid entity.
    pub const NULL: Entity = Entity {
        index: 0,
        generation: 0,
    };

    /// Create an entity from raw parts (mainly for testing).
    pub fn from_raw(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The slot index of this entity.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The generation of this entity (incremented on reuse).
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether this is the reserved null entity.
    pub fn is_null(&self) -> bool {
        self.index == 0
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Allocates and recycles entity slots with generational tracking.
///
/// Freed indices are queued and only handed out again once at least
/// `recycle_threshold` of them have accumulated, so a destroyed index is not
/// immediately reused.
pub(crate) struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free_queue: VecDeque<u32>,
    recycle_threshold: usize,
    len: usize,
}

impl EntityAllocator {
    pub fn new(recycle_threshold: usize) -> Self {
        // slot 0 belongs to the null entity, which is never alive
        Self {
            generations: vec![0],
            alive: vec![false],
            free_queue: VecDeque::new(),
            recycle_threshold,
            len: 0,
        }
    }

    /// Allocate a new entity. The flag is `true` when a fresh slot was appended
    /// and `false` when a freed slot was recycled.
    pub fn allocate(&mut self) -> (Entity, bool) {
        self.len += 1;
        // a threshold of zero still needs something in the queue to recycle
        if !self.free_queue.is_empty() && self.free_queue.len() >= self.recycle_threshold {
            if let Some(index) = self.free_queue.pop_front() {
                self.alive[index as usize] = true;
                let entity = Entity {
                    index,
                    generation: self.generations[index as usize],
                };
                return (entity, false);
            }
        }

        let index = u32::try_from(self.generations.len()).expect("entity index space exhausted");
        self.generations.push(0);
        self.alive.push(true);
        (
            Entity {
                index,
                generation: 0,
            },
            true,
        )
    }

    /// Deallocate an entity. Returns `true` if it was alive.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }
        let idx = entity.index as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free_queue.push_back(entity.index);
        self.len -= 1;
        true
    }

    /// Check if an entity is currently alive.
    pub fn is_alive(&self, entity: Entity) -> bool {
        let idx = entity.index as usize;
        !entity.is_null()
            && idx < self.alive.len()
            && self.alive[idx]
            && self.generations[idx] == entity.generation
    }

    /// The live entity occupying `index`, if any.
    pub fn live_at(&self, index: u32) -> Option<Entity> {
        let idx = index as usize;
        if index == 0 || !self.alive.get(idx).copied().unwrap_or(false) {
            return None;
        }
        Some(Entity {
            index,
            generation: self.generations[idx],
        })
    }

    /// Number of slots ever allocated, including the null slot.
    pub fn slot_count(&self) -> usize {
        self.generations.len()
    }

    /// Number of currently alive entities.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of indices waiting to be recycled.
    pub fn free_count(&self) -> usize {
        self.free_queue.len()
    }
}
