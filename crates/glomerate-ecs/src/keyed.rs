use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use crate::component::{Component, ComponentPool, SlotCursor, SlotIndex};
use crate::entity::Entity;

/// Components whose value doubles as a lookup key.
pub trait KeyedComponent: Component + Hash + Eq + Clone {}

impl<T: Component + Hash + Eq + Clone> KeyedComponent for T {}

/// Secondary index from component value to the slots holding that value.
///
/// Buckets are ordered by slot and are dropped as soon as they empty out.
pub struct KeyIndex<K> {
    buckets: HashMap<K, BTreeSet<usize>>,
}

impl<K> Default for KeyIndex<K> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq> KeyIndex<K> {
    pub fn slots(&self, key: &K) -> Option<&BTreeSet<usize>> {
        self.buckets.get(key)
    }

    /// Number of distinct values currently indexed.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

impl<K: KeyedComponent> SlotIndex<K> for KeyIndex<K> {
    fn slot_inserted(&mut self, value: &K, slot: usize) {
        if let Some(bucket) = self.buckets.get_mut(value) {
            bucket.insert(slot);
        } else {
            self.buckets.insert(value.clone(), BTreeSet::from([slot]));
        }
    }

    fn slot_removed(&mut self, value: &K, slot: usize) {
        let Some(bucket) = self.buckets.get_mut(value) else {
            return;
        };
        bucket.remove(&slot);
        if bucket.is_empty() {
            self.buckets.remove(value);
        }
    }

    fn slot_moved(&mut self, value: &K, from: usize, to: usize) {
        if let Some(bucket) = self.buckets.get_mut(value) {
            if bucket.remove(&from) {
                bucket.insert(to);
            }
        }
    }
}

/// A [`ComponentPool`] that can also look entities up by component value.
pub type KeyedComponentPool<K> = ComponentPool<K, KeyIndex<K>>;

impl<K: KeyedComponent> ComponentPool<K, KeyIndex<K>> {
    /// Cursor over exactly the slots holding `key` right now.
    pub fn keyed_entities(&self, key: &K) -> SlotCursor {
        match self.index.slots(key) {
            Some(slots) => SlotCursor::listed(slots.iter().copied().collect()),
            None => SlotCursor::empty(),
        }
    }

    /// First live entity holding `key`, or [`Entity::NULL`].
    pub fn keyed_entity(&self, key: &K) -> Entity {
        self.index
            .slots(key)
            .into_iter()
            .flatten()
            .filter_map(|slot| self.entity_at(*slot))
            .find(|entity| !entity.is_null())
            .unwrap_or(Entity::NULL)
    }

    pub fn has_value(&self, entity: Entity, key: &K) -> bool {
        self.get(entity) == Some(key)
    }

    pub fn key_count(&self) -> usize {
        self.index.key_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{IterationLock, PoolEntities};
    use std::cell::RefCell;

    fn e(index: u32) -> Entity {
        Entity::from_raw(index, 0)
    }

    fn keyed(pool: &KeyedComponentPool<&'static str>, key: &'static str) -> Vec<Entity> {
        let mut cursor = pool.keyed_entities(&key);
        std::iter::from_fn(|| cursor.next_entity(pool)).collect()
    }

    #[test]
    fn shared_value_lookup_and_bucket_cleanup() {
        let mut pool = KeyedComponentPool::<&'static str>::new();
        pool.insert(e(1), "x");
        pool.insert(e(2), "x");
        pool.insert(e(3), "y");
        assert_eq!(keyed(&pool, "x"), vec![e(1), e(2)]);
        assert_eq!(pool.key_count(), 2);

        pool.remove(e(1)).unwrap();
        assert_eq!(keyed(&pool, "x"), vec![e(2)]);

        pool.remove(e(2)).unwrap();
        assert!(keyed(&pool, "x").is_empty());
        assert_eq!(pool.key_count(), 1, "empty bucket must be erased");
        assert!(pool.index.slots(&"x").is_none());
    }

    #[test]
    fn unknown_value_is_empty() {
        let pool = KeyedComponentPool::<&'static str>::new();
        assert!(keyed(&pool, "nope").is_empty());
        assert_eq!(pool.keyed_entity(&"nope"), Entity::NULL);
    }

    #[test]
    fn swap_compaction_keeps_index_pointing_at_moved_slots() {
        let mut pool = KeyedComponentPool::<&'static str>::new();
        pool.insert(e(1), "a");
        pool.insert(e(2), "b");
        pool.insert(e(3), "a");
        pool.remove(e(1)).unwrap();

        // e3 moved from slot 2 into slot 0
        assert_eq!(pool.index.slots(&"a"), Some(&BTreeSet::from([0])));
        assert_eq!(pool.keyed_entity(&"a"), e(3));
        assert_eq!(pool.keyed_entity(&"b"), e(2));
    }

    #[test]
    fn overwrite_moves_entity_between_buckets() {
        let mut pool = KeyedComponentPool::<&'static str>::new();
        pool.insert(e(1), "old");
        pool.insert(e(1), "new");
        assert!(keyed(&pool, "old").is_empty());
        assert_eq!(keyed(&pool, "new"), vec![e(1)]);
        assert_eq!(pool.key_count(), 1);
        assert!(pool.has_value(e(1), &"new"));
        assert!(!pool.has_value(e(1), &"old"));
    }

    #[test]
    fn keyed_traversal_under_lock() {
        let pool = RefCell::new(KeyedComponentPool::<&'static str>::new());
        pool.borrow_mut().insert(e(1), "k");
        pool.borrow_mut().insert(e(2), "k");

        let seen: Vec<Entity> = {
            let _lock = IterationLock::acquire(&pool);
            let cursor = pool.borrow().keyed_entities(&"k");
            let mut seen = Vec::new();
            for entity in PoolEntities::new(&pool, cursor) {
                seen.push(entity);
                if entity == e(1) {
                    pool.borrow_mut().remove(e(2)).unwrap();
                    pool.borrow_mut().insert(e(3), "k");
                }
            }
            seen
        };
        assert_eq!(seen, vec![e(1), Entity::NULL]);

        let p = pool.borrow();
        let mut cursor = p.keyed_entities(&"k");
        let after: Vec<Entity> = std::iter::from_fn(|| cursor.next_entity(&*p)).collect();
        assert_eq!(after, vec![e(1), e(3)]);
    }

    #[test]
    fn removing_every_holder_of_a_shared_key() {
        let n = 10_000u32;
        let mut pool = KeyedComponentPool::<u32>::new();
        for i in 1..=n {
            pool.insert(e(i), 7);
        }
        pool.insert(e(n + 1), 8);

        // front to back: every removal moves the last slot into the hole
        for i in 1..=n {
            pool.remove(e(i)).unwrap();
        }
        assert!(pool.index.slots(&7).is_none());
        assert_eq!(pool.key_count(), 1);
        assert_eq!(pool.keyed_entity(&8), e(n + 1));
        assert_eq!(pool.index.slots(&8), Some(&BTreeSet::from([0])));
    }

    #[test]
    fn keyed_entity_skips_soft_removed() {
        let pool = RefCell::new(KeyedComponentPool::<u32>::new());
        pool.borrow_mut().insert(e(1), 7);
        pool.borrow_mut().insert(e(2), 7);

        let _lock = IterationLock::acquire(&pool);
        pool.borrow_mut().remove(e(1)).unwrap();
        assert_eq!(pool.borrow().keyed_entity(&7), e(2));
    }
}
