use crate::component::{ComponentStorage, IterationLock, PoolEntities, SlotCursor};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::keyed::{KeyedComponent, KeyedComponentPool};
use crate::manager::EntityManager;
use crate::registry::{ComponentMask, ComponentSet, StorageCell};

/// Entities holding every component of a mask.
///
/// Walks one pool (the smallest of the mask at creation) in slot order and
/// keeps it under an iteration lock until dropped, so the manager can be
/// mutated freely while iterating:
///
/// - an entity destroyed or stripped before it is reached is skipped;
/// - entities or components added during the walk are not visited;
/// - nothing is visited twice.
pub struct EntityCollection<'m> {
    manager: &'m EntityManager,
    mask: ComponentMask,
    source: Source<'m>,
    filter: Option<Box<dyn Fn(Entity) -> bool + 'm>>,
}

enum Source<'m> {
    Empty,
    Pool {
        entities: PoolEntities<'m, dyn ComponentStorage>,
        _lock: IterationLock<'m, dyn ComponentStorage>,
    },
    /// Entities alive when the collection was made, for the empty mask.
    Directory(std::vec::IntoIter<Entity>),
}

impl<'m> EntityCollection<'m> {
    fn empty(manager: &'m EntityManager, mask: ComponentMask) -> Self {
        Self {
            manager,
            mask,
            source: Source::Empty,
            filter: None,
        }
    }

    fn alive(manager: &'m EntityManager) -> Self {
        Self {
            manager,
            mask: ComponentMask::EMPTY,
            source: Source::Directory(manager.live_entities().into_iter()),
            filter: None,
        }
    }

    fn over_pool(
        manager: &'m EntityManager,
        mask: ComponentMask,
        pool: &'m StorageCell,
        cursor: impl FnOnce(&dyn ComponentStorage) -> SlotCursor,
    ) -> Self {
        let lock = IterationLock::acquire(pool);
        let cursor = cursor(&*pool.borrow());
        Self {
            manager,
            mask,
            source: Source::Pool {
                entities: PoolEntities::new(pool, cursor),
                _lock: lock,
            },
            filter: None,
        }
    }

    fn with_filter(mut self, filter: impl Fn(Entity) -> bool + 'm) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn mask(&self) -> ComponentMask {
        self.mask
    }
}

impl Iterator for EntityCollection<'_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        loop {
            let entity = match &mut self.source {
                Source::Empty => return None,
                Source::Pool { entities, .. } => entities.next()?,
                Source::Directory(entities) => {
                    let entity = entities.next()?;
                    if !self.manager.valid(entity) {
                        continue;
                    }
                    entity
                }
            };
            if entity.is_null() {
                continue;
            }
            if !self.manager.components.mask(entity).contains_all(self.mask) {
                continue;
            }
            if self.filter.as_ref().map_or(true, |keep| keep(entity)) {
                return Some(entity);
            }
        }
    }
}

impl EntityManager {
    /// All entities holding every component in `S`.
    ///
    /// ```ignore
    /// for e in em.entities_with::<(Position, Direction)>()? {
    ///     let dir = em.get::<Direction>(e)?.clone();
    ///     em.attach(e, em.get::<Position>(e)?.moved(&dir))?;
    /// }
    /// ```
    pub fn entities_with<S: ComponentSet>(&self) -> Result<EntityCollection<'_>> {
        let mask = self.components.build_mask::<S>()?;
        Ok(self.entities_with_mask(mask))
    }

    pub fn entities_with_mask(&self, mask: ComponentMask) -> EntityCollection<'_> {
        if mask.is_empty() {
            return EntityCollection::alive(self);
        }

        let mut smallest: Option<(usize, &StorageCell)> = None;
        for id in mask.ids() {
            let Some(pool) = self.components.pool(id) else {
                return EntityCollection::empty(self, mask);
            };
            let len = pool.borrow().len();
            // strict comparison keeps the earliest registered on ties
            if smallest.map_or(true, |(best, _)| len < best) {
                smallest = Some((len, pool));
            }
        }

        match smallest {
            Some((_, pool)) => {
                EntityCollection::over_pool(self, mask, pool, |storage| storage.entities())
            }
            None => EntityCollection::empty(self, mask),
        }
    }

    /// Entities whose `K` equals `key` and that also hold every component in `S`.
    pub fn entities_with_key<K: KeyedComponent, S: ComponentSet>(
        &self,
        key: &K,
    ) -> Result<EntityCollection<'_>> {
        let id = self
            .components
            .id_of::<K>()
            .ok_or(EcsError::UnknownType(std::any::type_name::<K>()))?;
        let mask = self.components.build_mask::<S>()?.with(id);
        let Some(pool) = self.components.pool(id) else {
            return Ok(EntityCollection::empty(self, mask));
        };
        if !pool.borrow().as_any().is::<KeyedComponentPool<K>>() {
            return Ok(EntityCollection::empty(self, mask));
        }

        let collection = EntityCollection::over_pool(self, mask, pool, |storage| {
            storage
                .as_any()
                .downcast_ref::<KeyedComponentPool<K>>()
                .map_or_else(SlotCursor::empty, |keyed| keyed.keyed_entities(key))
        });
        // the bucket is a snapshot; an entity may be re-keyed before it is reached
        let key = key.clone();
        Ok(collection.with_filter(move |entity| {
            self.components.has_value(entity, &key).unwrap_or(false)
        }))
    }

    /// Some entity whose `K` equals `key`, or [`Entity::NULL`].
    pub fn entity_with<K: KeyedComponent>(&self, key: &K) -> Result<Entity> {
        let id = self
            .components
            .id_of::<K>()
            .ok_or(EcsError::UnknownType(std::any::type_name::<K>()))?;
        let Some(pool) = self.components.pool(id) else {
            return Ok(Entity::NULL);
        };
        let storage = pool.borrow();
        Ok(storage
            .as_any()
            .downcast_ref::<KeyedComponentPool<K>>()
            .map_or(Entity::NULL, |keyed| keyed.keyed_entity(key)))
    }
}
