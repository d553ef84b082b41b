use std::any::{type_name, Any};
use std::cell::{Cell, RefCell};
use std::ops::Range;

use tracing::trace;

use crate::entity::Entity;
use crate::error::{EcsError, Result};

/// Marker trait for types that can be stored as components.
pub trait Component: 'static {}

/// Blanket implementation: any `'static` type is a valid component.
impl<T: 'static> Component for T {}

/// Hook a pool calls whenever a slot's contents change, so a secondary index
/// can follow slots around as they are appended, dropped and swap-compacted.
pub trait SlotIndex<T>: 'static {
    fn slot_inserted(&mut self, value: &T, slot: usize);
    fn slot_removed(&mut self, value: &T, slot: usize);
    fn slot_moved(&mut self, value: &T, from: usize, to: usize);
}

/// The index of a plain pool: nothing to maintain.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIndex;

impl<T> SlotIndex<T> for NoIndex {
    fn slot_inserted(&mut self, _value: &T, _slot: usize) {}
    fn slot_removed(&mut self, _value: &T, _slot: usize) {}
    fn slot_moved(&mut self, _value: &T, _from: usize, _to: usize) {}
}

/// Type-erased component storage interface.
///
/// Every pool kind implements this so the registry can remove, traverse and
/// lock pools without knowing their component type.
pub trait ComponentStorage: Any {
    fn as_any(&self) -> &dyn Any;

    /// Name of the stored component type, for error messages.
    fn component_name(&self) -> &'static str;

    /// Insert or overwrite from an erased `&mut Option<T>`, taking the value out.
    ///
    /// # Panics
    /// Panics if `value` is not an `Option` of this pool's component type.
    fn insert_erased(&mut self, entity: Entity, value: &mut dyn Any);

    fn remove(&mut self, entity: Entity) -> Result<()>;
    fn has(&self, entity: Entity) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owner of `slot`; [`Entity::NULL`] for a soft-removed slot.
    fn entity_at(&self, slot: usize) -> Option<Entity>;

    fn entities(&self) -> SlotCursor;

    fn lock_iteration(&self);

    /// Returns `true` when the last lock was released and deferred removals are waiting.
    fn unlock_iteration(&self) -> bool;

    fn compact_deferred(&mut self);
}

/// Dense storage for a single component type.
///
/// Values live in a packed array with no holes; removing a value moves the
/// last slot into its place. Slot positions are therefore not stable and a
/// reference into the pool is only good until the next insert or remove.
///
/// While an iteration lock is held, removals only null the slot owner and queue
/// the slot, so positions stay put for any traversal in flight. Releasing the
/// last lock compacts the queued slots in the order they were removed.
pub struct ComponentPool<T, I = NoIndex> {
    /// Maps entity index → slot. `None` means the entity has no component.
    sparse: Vec<Option<usize>>,
    /// Owner of each slot, `Entity::NULL` once soft-removed.
    owners: Vec<Entity>,
    /// Packed component values.
    values: Vec<T>,
    pub(crate) index: I,
    lock_depth: Cell<usize>,
    /// Soft-removed slots in removal order, indexed by ticket.
    deferred: Vec<usize>,
    /// Ticket of each soft-removed slot, parallel to `owners`.
    tickets: Vec<Option<usize>>,
}

impl<T, I: Default> ComponentPool<T, I> {
    pub fn new() -> Self {
        Self {
            sparse: Vec::new(),
            owners: Vec::new(),
            values: Vec::new(),
            index: I::default(),
            lock_depth: Cell::new(0),
            deferred: Vec::new(),
            tickets: Vec::new(),
        }
    }
}

impl<T, I: Default> Default for ComponentPool<T, I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, I> ComponentPool<T, I> {
    fn slot_of(&self, entity: Entity) -> Option<usize> {
        let slot = (*self.sparse.get(entity.index as usize)?)?;
        (self.owners[slot] == entity).then_some(slot)
    }

    /// Get an immutable reference to the component for an entity.
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.slot_of(entity).map(|slot| &self.values[slot])
    }

    pub fn has(&self, entity: Entity) -> bool {
        self.slot_of(entity).is_some()
    }

    /// Number of occupied slots, soft-removed ones included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn entity_at(&self, slot: usize) -> Option<Entity> {
        self.owners.get(slot).copied()
    }

    /// Cursor over every slot that exists right now. Slots appended later are
    /// past its end and are never visited.
    pub fn entities(&self) -> SlotCursor {
        SlotCursor::range(0..self.len())
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth.get() > 0
    }

    /// Number of soft-removed slots awaiting compaction.
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    pub fn lock_iteration(&self) {
        self.lock_depth.set(self.lock_depth.get() + 1);
    }

    pub fn unlock_iteration(&self) -> bool {
        let depth = self.lock_depth.get();
        assert!(depth > 0, "iteration lock released more times than acquired");
        self.lock_depth.set(depth - 1);
        depth == 1 && !self.deferred.is_empty()
    }
}

impl<T: Component, I: SlotIndex<T>> ComponentPool<T, I> {
    /// Insert or replace a component for the given entity.
    ///
    /// The returned reference must not be kept across a removal from this pool.
    pub fn insert(&mut self, entity: Entity, value: T) -> &T {
        self.catch_up();

        if let Some(slot) = self.slot_of(entity) {
            self.index.slot_removed(&self.values[slot], slot);
            self.values[slot] = value;
            self.index.slot_inserted(&self.values[slot], slot);
            return &self.values[slot];
        }

        let idx = entity.index as usize;
        if idx >= self.sparse.len() {
            self.sparse.resize(idx + 1, None);
        }
        let slot = self.values.len();
        self.values.push(value);
        self.owners.push(entity);
        self.tickets.push(None);
        self.sparse[idx] = Some(slot);
        self.index.slot_inserted(&self.values[slot], slot);
        &self.values[slot]
    }

    /// Remove the entity's component, immediately or deferred if locked.
    pub fn remove(&mut self, entity: Entity) -> Result<()> {
        self.catch_up();

        let Some(slot) = self.slot_of(entity) else {
            return Err(EcsError::MissingComponent {
                entity,
                component: type_name::<T>(),
            });
        };
        self.sparse[entity.index as usize] = None;

        if self.is_locked() {
            self.owners[slot] = Entity::NULL;
            self.tickets[slot] = Some(self.deferred.len());
            self.deferred.push(slot);
            trace!("soft-removed {} of {entity} at slot {slot}", type_name::<T>());
        } else {
            self.swap_remove(slot);
        }
        Ok(())
    }

    /// Apply every deferred removal, oldest first.
    pub fn compact_deferred(&mut self) {
        let count = self.deferred.len();
        for ticket in 0..count {
            let slot = self.deferred[ticket];
            self.swap_remove(slot);
            // the slot that was last now lives at `slot`; it may be queued too
            if let Some(moved) = self.tickets.get(slot).copied().flatten() {
                self.deferred[moved] = slot;
            }
        }
        self.deferred.clear();
        if count > 0 {
            trace!("compacted {count} deferred {} slots", type_name::<T>());
        }
    }

    /// Removals queued under a lock that was released while the pool was
    /// borrowed are applied before the next structural change.
    fn catch_up(&mut self) {
        if !self.is_locked() && !self.deferred.is_empty() {
            self.compact_deferred();
        }
    }

    fn swap_remove(&mut self, slot: usize) {
        let last = self.values.len() - 1;
        let removed = self.values.swap_remove(slot);
        self.owners.swap_remove(slot);
        self.tickets.swap_remove(slot);
        self.index.slot_removed(&removed, slot);

        if slot != last {
            self.index.slot_moved(&self.values[slot], last, slot);
            // soft-removed owners have already dropped their mapping
            let moved = self.owners[slot];
            if !moved.is_null() {
                self.sparse[moved.index as usize] = Some(slot);
            }
        }
    }
}

impl<T: Component, I: SlotIndex<T>> ComponentStorage for ComponentPool<T, I> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn component_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn insert_erased(&mut self, entity: Entity, value: &mut dyn Any) {
        let value = value
            .downcast_mut::<Option<T>>()
            .and_then(Option::take)
            .expect("component type mismatch");
        self.insert(entity, value);
    }

    fn remove(&mut self, entity: Entity) -> Result<()> {
        Self::remove(self, entity)
    }

    fn has(&self, entity: Entity) -> bool {
        Self::has(self, entity)
    }

    fn len(&self) -> usize {
        Self::len(self)
    }

    fn entity_at(&self, slot: usize) -> Option<Entity> {
        Self::entity_at(self, slot)
    }

    fn entities(&self) -> SlotCursor {
        Self::entities(self)
    }

    fn lock_iteration(&self) {
        Self::lock_iteration(self)
    }

    fn unlock_iteration(&self) -> bool {
        Self::unlock_iteration(self)
    }

    fn compact_deferred(&mut self) {
        Self::compact_deferred(self)
    }
}

/// Scoped guard that keeps a pool in soft-remove mode.
///
/// Guards nest; deferred removals are compacted when the last one drops. If the
/// pool happens to be borrowed at that moment, compaction runs at the pool's
/// next insert or remove instead.
pub struct IterationLock<'a, P: ComponentStorage + ?Sized> {
    pool: &'a RefCell<P>,
}

impl<'a, P: ComponentStorage + ?Sized> IterationLock<'a, P> {
    pub fn acquire(pool: &'a RefCell<P>) -> Self {
        pool.borrow().lock_iteration();
        Self { pool }
    }

    pub fn pool(&self) -> &'a RefCell<P> {
        self.pool
    }
}

impl<P: ComponentStorage + ?Sized> Drop for IterationLock<'_, P> {
    fn drop(&mut self) {
        let compact = self.pool.borrow().unlock_iteration();
        if compact {
            if let Ok(mut pool) = self.pool.try_borrow_mut() {
                pool.compact_deferred();
            }
        }
    }
}

/// A single-pass walk over a fixed set of pool slots.
///
/// The set is fixed when the cursor is created: either every slot that existed
/// then, or an explicit list of slots from a keyed bucket.
#[derive(Debug, Clone)]
pub struct SlotCursor {
    slots: Slots,
}

#[derive(Debug, Clone)]
enum Slots {
    Range(Range<usize>),
    Listed(std::vec::IntoIter<usize>),
}

impl SlotCursor {
    pub fn empty() -> Self {
        Self::range(0..0)
    }

    pub(crate) fn range(range: Range<usize>) -> Self {
        Self {
            slots: Slots::Range(range),
        }
    }

    pub(crate) fn listed(slots: Vec<usize>) -> Self {
        Self {
            slots: Slots::Listed(slots.into_iter()),
        }
    }

    pub fn next_slot(&mut self) -> Option<usize> {
        match &mut self.slots {
            Slots::Range(range) => range.next(),
            Slots::Listed(slots) => slots.next(),
        }
    }

    /// Owner of the next slot, or [`Entity::NULL`] if it was soft-removed.
    pub fn next_entity<P: ComponentStorage + ?Sized>(&mut self, pool: &P) -> Option<Entity> {
        let slot = self.next_slot()?;
        Some(pool.entity_at(slot).unwrap_or(Entity::NULL))
    }
}

/// Iterator over a pool's slot owners that only borrows the pool per step,
/// so the pool can be mutated between steps.
pub struct PoolEntities<'a, P: ComponentStorage + ?Sized> {
    pool: &'a RefCell<P>,
    cursor: SlotCursor,
}

impl<'a, P: ComponentStorage + ?Sized> PoolEntities<'a, P> {
    pub fn new(pool: &'a RefCell<P>, cursor: SlotCursor) -> Self {
        Self { pool, cursor }
    }

    /// Every slot currently in the pool.
    pub fn all(pool: &'a RefCell<P>) -> Self {
        let cursor = pool.borrow().entities();
        Self::new(pool, cursor)
    }
}

impl<P: ComponentStorage + ?Sized> Iterator for PoolEntities<'_, P> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        let pool = self.pool.borrow();
        self.cursor.next_entity(&*pool)
    }
}
