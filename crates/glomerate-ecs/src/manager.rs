use std::cell::{Ref, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::component::Component;
use crate::config::EcsConfig;
use crate::entity::{Entity, EntityAllocator};
use crate::error::{EcsError, Result};
use crate::event::{EntityCallback, EntityDestroyed, EventBus, GlobalCallback, Subscription};
use crate::keyed::KeyedComponent;
use crate::registry::{ComponentId, ComponentMask, ComponentRegistry, ComponentSet};

/// The central ECS container. Owns all entities, their components and the
/// event subscriptions attached to them.
///
/// Every operation takes `&self`, so entities can be created, destroyed and
/// edited from inside a query loop or an event callback. The manager is meant
/// for a single thread and is not `Sync`.
pub struct EntityManager {
    config: EcsConfig,
    entities: RefCell<EntityAllocator>,
    pub(crate) components: ComponentRegistry,
    events: EventBus,
    /// Entities whose destruction observers are running.
    dying: RefCell<Vec<Entity>>,
}

impl EntityManager {
    pub fn new() -> Self {
        Self::with_config(EcsConfig::default())
    }

    pub fn with_config(config: EcsConfig) -> Self {
        Self {
            entities: RefCell::new(EntityAllocator::new(config.recycle_threshold)),
            components: ComponentRegistry::new(),
            events: EventBus::new(),
            dying: RefCell::new(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &EcsConfig {
        &self.config
    }

    // ---- Entity management ----

    /// Create a new entity with no components.
    pub fn create(&self) -> Entity {
        let (entity, fresh) = self.entities.borrow_mut().allocate();
        if fresh {
            self.components.push_mask();
        } else {
            assert!(
                self.components.mask(entity).is_empty(),
                "recycled entity {entity} still has components"
            );
        }
        assert_eq!(
            self.entities.borrow().slot_count(),
            self.components.mask_count(),
            "entity and component mask tables out of step"
        );
        entity
    }

    /// Destroy an entity, removing all its components.
    ///
    /// [`EntityDestroyed`] observers run first and still see the components.
    pub fn destroy(&self, entity: Entity) -> Result<()> {
        self.ensure_valid(entity)?;

        // an observer destroying the same entity skips straight to teardown
        let announce = !self.dying.borrow().contains(&entity);
        if announce {
            self.dying.borrow_mut().push(entity);
            self.events.emit(self, entity, &EntityDestroyed);
            self.dying.borrow_mut().retain(|e| *e != entity);
            if !self.valid(entity) {
                return Ok(());
            }
        }

        self.events.clear_entity(entity);
        self.components.detach_all(entity)?;
        let mut entities = self.entities.borrow_mut();
        entities.deallocate(entity);
        debug!(
            "destroyed entity {entity}, {} indices awaiting reuse",
            entities.free_count()
        );
        Ok(())
    }

    /// Destroy every entity alive when the call starts.
    pub fn destroy_all(&self) -> Result<()> {
        for entity in self.live_entities() {
            // observers may already have destroyed later entities
            if self.valid(entity) {
                self.destroy(entity)?;
            }
        }
        Ok(())
    }

    /// Destroy every entity whose `K` equals `key` and that also has all of `S`.
    pub fn destroy_all_with<K: KeyedComponent, S: ComponentSet>(&self, key: &K) -> Result<()> {
        for entity in self.entities_with_key::<K, S>(key)? {
            self.destroy(entity)?;
        }
        Ok(())
    }

    /// Check whether an entity is alive.
    pub fn valid(&self, entity: Entity) -> bool {
        self.entities.borrow().is_alive(entity)
    }

    /// Number of alive entities.
    pub fn entity_count(&self) -> usize {
        self.entities.borrow().len()
    }

    pub(crate) fn live_entities(&self) -> Vec<Entity> {
        let entities = self.entities.borrow();
        (1..entities.slot_count() as u32)
            .filter_map(|index| entities.live_at(index))
            .collect()
    }

    fn ensure_valid(&self, entity: Entity) -> Result<()> {
        if self.valid(entity) {
            Ok(())
        } else {
            Err(EcsError::InvalidEntity(entity))
        }
    }

    // ---- Component management ----

    pub fn register<T: Component>(&self) -> Result<ComponentId> {
        self.components.register::<T>()
    }

    /// Register `K` with a value index so entities can be looked up by it.
    pub fn register_keyed<K: KeyedComponent>(&self) -> Result<ComponentId> {
        self.components.register_keyed::<K>()
    }

    pub fn component_id<T: Component>(&self) -> Option<ComponentId> {
        self.components.id_of::<T>()
    }

    /// Number of registered component types.
    pub fn component_type_count(&self) -> usize {
        self.components.len()
    }

    /// Attach a component, replacing any existing one of the same type.
    ///
    /// The returned borrow must be dropped before the pool for `T` changes
    /// again; holding it across such a change panics.
    pub fn attach<T: Component>(&self, entity: Entity, component: T) -> Result<Ref<'_, T>> {
        self.ensure_valid(entity)?;
        self.components.attach(entity, component)
    }

    /// Attach an indexed component. `K` is registered as keyed on first use.
    pub fn attach_key<K: KeyedComponent>(&self, entity: Entity, key: K) -> Result<Ref<'_, K>> {
        self.ensure_valid(entity)?;
        self.components.attach_key(entity, key)
    }

    pub fn detach<T: Component>(&self, entity: Entity) -> Result<()> {
        if self.components.id_of::<T>().is_none() {
            return Err(EcsError::UnknownType(std::any::type_name::<T>()));
        }
        self.ensure_valid(entity)?;
        self.components.detach::<T>(entity)
    }

    pub fn detach_all(&self, entity: Entity) -> Result<()> {
        self.ensure_valid(entity)?;
        self.components.detach_all(entity)
    }

    pub fn has<T: Component>(&self, entity: Entity) -> Result<bool> {
        let has = self.components.has::<T>(entity)?;
        Ok(has && self.valid(entity))
    }

    pub fn has_value<T: Component + PartialEq>(&self, entity: Entity, value: &T) -> Result<bool> {
        if !self.valid(entity) {
            // still report unknown types
            return self.components.has::<T>(entity).map(|_| false);
        }
        self.components.has_value(entity, value)
    }

    /// Borrow a component. Same borrow rules as [`attach`](Self::attach).
    pub fn get<T: Component>(&self, entity: Entity) -> Result<Ref<'_, T>> {
        if self.components.id_of::<T>().is_none() {
            return Err(EcsError::UnknownType(std::any::type_name::<T>()));
        }
        self.ensure_valid(entity)?;
        self.components.get(entity)
    }

    pub fn build_mask<S: ComponentSet>(&self) -> Result<ComponentMask> {
        self.components.build_mask::<S>()
    }

    /// Components currently attached to `entity`; empty for invalid entities.
    pub fn mask(&self, entity: Entity) -> ComponentMask {
        if self.valid(entity) {
            self.components.mask(entity)
        } else {
            ComponentMask::EMPTY
        }
    }

    // ---- Events ----

    /// Call `callback` whenever `E` is emitted for any entity.
    pub fn subscribe<E: 'static>(
        &self,
        callback: impl Fn(&EntityManager, Entity, &E) + 'static,
    ) -> Subscription {
        let callback: EntityCallback<E> = Rc::new(callback);
        self.events.subscribe(callback)
    }

    /// Call `callback` whenever `E` is emitted for `entity`. The subscription
    /// ends when the entity is destroyed.
    pub fn subscribe_entity<E: 'static>(
        &self,
        entity: Entity,
        callback: impl Fn(&EntityManager, Entity, &E) + 'static,
    ) -> Result<Subscription> {
        self.ensure_valid(entity)?;
        let callback: EntityCallback<E> = Rc::new(callback);
        Ok(self.events.subscribe_entity(entity, callback))
    }

    pub fn subscribe_global<E: 'static>(
        &self,
        callback: impl Fn(&EntityManager, &E) + 'static,
    ) -> Subscription {
        let callback: GlobalCallback<E> = Rc::new(callback);
        self.events.subscribe_global(callback)
    }

    pub fn emit<E: 'static>(&self, entity: Entity, event: &E) {
        self.events.emit(self, entity, event);
    }

    pub fn emit_global<E: 'static>(&self, event: &E) {
        self.events.emit_global(self, event);
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Direction {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(i32);

    fn recycling_manager() -> EntityManager {
        EntityManager::with_config(EcsConfig {
            recycle_threshold: 0,
        })
    }

    #[test]
    fn create_and_destroy() {
        let em = EntityManager::new();
        let e = em.create();
        assert!(em.valid(e));
        assert_eq!(em.entity_count(), 1);

        em.destroy(e).unwrap();
        assert!(!em.valid(e));
        assert_eq!(em.entity_count(), 0);
    }

    #[test]
    fn null_and_unknown_entities_are_invalid() {
        let em = EntityManager::new();
        em.create();
        assert!(!em.valid(Entity::NULL));
        assert!(!em.valid(Entity::default()));
        assert!(!em.valid(Entity::from_raw(7, 0)));
    }

    #[test]
    fn destroy_twice_fails() {
        let em = EntityManager::new();
        let e = em.create();
        em.destroy(e).unwrap();
        assert_eq!(em.destroy(e), Err(EcsError::InvalidEntity(e)));
    }

    #[test]
    fn recycled_index_gets_new_generation_and_no_components() {
        let em = recycling_manager();
        let first = em.create();
        em.attach(first, Health(10)).unwrap();
        em.destroy(first).unwrap();

        let second = em.create();
        assert_eq!(second.index(), first.index());
        assert!(second.generation() > first.generation());
        assert_ne!(first, second);
        assert!(!em.valid(first));
        assert!(!em.has::<Health>(second).unwrap());
        assert!(!em.has::<Health>(first).unwrap());

        em.destroy(second).unwrap();
        let third = em.create();
        assert!(third.generation() > second.generation());
    }

    #[test]
    fn recycling_starts_after_threshold() {
        let em = EntityManager::with_config(EcsConfig {
            recycle_threshold: 4,
        });
        let batch: Vec<Entity> = (0..4).map(|_| em.create()).collect();
        for e in &batch[..3] {
            em.destroy(*e).unwrap();
        }
        let fresh = em.create();
        assert_eq!(fresh.index(), 5, "three free indices are not enough");

        em.destroy(batch[3]).unwrap();
        let reused = em.create();
        assert_eq!(reused.index(), batch[0].index());
        assert_eq!(reused.generation(), 1);
    }

    #[test]
    fn default_config_does_not_reuse_early() {
        let em = EntityManager::new();
        let e = em.create();
        em.destroy(e).unwrap();
        let next = em.create();
        assert_ne!(next.index(), e.index());
    }

    #[test]
    fn attach_get_round_trip() {
        let em = EntityManager::new();
        let e = em.create();
        let pos = em.attach(e, Position { x: 1.0, y: 2.0 }).unwrap().clone();
        assert_eq!(pos, Position { x: 1.0, y: 2.0 });
        assert_eq!(*em.get::<Position>(e).unwrap(), pos);
        assert!(em.has::<Position>(e).unwrap());
        assert!(em.has_value(e, &Position { x: 1.0, y: 2.0 }).unwrap());
        assert!(!em.has_value(e, &Position { x: 0.0, y: 2.0 }).unwrap());

        em.detach::<Position>(e).unwrap();
        assert!(!em.has::<Position>(e).unwrap());
        assert!(matches!(
            em.get::<Position>(e),
            Err(EcsError::MissingComponent { .. })
        ));
        assert!(matches!(
            em.detach::<Position>(e),
            Err(EcsError::MissingComponent { .. })
        ));
    }

    #[test]
    fn attach_overwrites() {
        let em = EntityManager::new();
        let e = em.create();
        em.attach(e, Health(1)).unwrap();
        let health = em.attach(e, Health(2)).unwrap().0;
        assert_eq!(health, 2);
        assert_eq!(em.get::<Health>(e).unwrap().0, 2);
    }

    #[test]
    fn reattach_after_detach_sees_new_value() {
        let em = EntityManager::new();
        let e = em.create();
        em.attach(e, Position { x: 1.0, y: 2.0 }).unwrap();
        em.detach::<Position>(e).unwrap();
        em.attach(e, Position { x: 3.0, y: 4.0 }).unwrap();
        assert_eq!(*em.get::<Position>(e).unwrap(), Position { x: 3.0, y: 4.0 });
    }

    #[test]
    fn component_access_on_invalid_entity() {
        let em = EntityManager::new();
        em.register::<Health>().unwrap();
        let e = em.create();
        em.attach(e, Health(3)).unwrap();
        em.destroy(e).unwrap();

        assert_eq!(
            em.attach(e, Health(4)).map(|h| h.0),
            Err(EcsError::InvalidEntity(e))
        );
        assert!(matches!(em.get::<Health>(e), Err(EcsError::InvalidEntity(_))));
        assert!(matches!(em.detach::<Health>(e), Err(EcsError::InvalidEntity(_))));
        assert_eq!(em.detach_all(e), Err(EcsError::InvalidEntity(e)));
        assert!(!em.has::<Health>(e).unwrap());
        assert!(!em.has_value(e, &Health(3)).unwrap());
        assert!(em.mask(e).is_empty());
    }

    #[test]
    fn unknown_types_are_reported() {
        let em = EntityManager::new();
        let e = em.create();
        assert!(matches!(em.has::<Health>(e), Err(EcsError::UnknownType(_))));
        assert!(matches!(em.has_value(e, &Health(1)), Err(EcsError::UnknownType(_))));
        assert!(matches!(em.get::<Health>(e), Err(EcsError::UnknownType(_))));
        assert!(matches!(em.detach::<Health>(e), Err(EcsError::UnknownType(_))));
        assert!(matches!(
            em.build_mask::<(Health,)>(),
            Err(EcsError::UnknownType(_))
        ));

        em.register::<Health>().unwrap();
        assert!(!em.has::<Health>(e).unwrap());
        assert_eq!(em.component_type_count(), 1);
    }

    #[test]
    fn detach_all_is_repeatable() {
        let em = EntityManager::new();
        let e = em.create();
        em.attach(e, Position { x: 0.0, y: 0.0 }).unwrap();
        em.attach(e, Direction { x: 1.0, y: 0.0 }).unwrap();
        em.attach_key(e, String::from("ship")).unwrap();

        em.detach_all(e).unwrap();
        assert!(!em.has::<Position>(e).unwrap());
        assert!(!em.has::<Direction>(e).unwrap());
        assert!(!em.has::<String>(e).unwrap());
        assert!(em.mask(e).is_empty());
        em.detach_all(e).unwrap();
        assert!(em.valid(e));
    }

    #[test]
    fn other_entities_keep_their_values_across_removal() {
        let em = EntityManager::new();
        let a = em.create();
        let b = em.create();
        em.attach(a, Position { x: 1.0, y: 1.0 }).unwrap();
        em.attach(b, Position { x: 2.0, y: 2.0 }).unwrap();

        // b's value moves into a's slot
        em.detach::<Position>(a).unwrap();
        assert_eq!(*em.get::<Position>(b).unwrap(), Position { x: 2.0, y: 2.0 });
    }

    #[test]
    #[should_panic]
    fn holding_a_component_across_removal_panics() {
        let em = EntityManager::new();
        let a = em.create();
        let b = em.create();
        em.attach(a, Health(1)).unwrap();
        em.attach(b, Health(2)).unwrap();

        let held = em.get::<Health>(b).unwrap();
        let _ = em.detach::<Health>(a);
        drop(held);
    }

    #[test]
    fn destroy_all_variants() {
        let em = EntityManager::new();
        em.destroy_all().unwrap();

        let entities: Vec<Entity> = (0..100).map(|_| em.create()).collect();
        for (i, e) in entities.iter().enumerate() {
            em.attach(*e, Health(i as i32)).unwrap();
        }
        em.destroy_all().unwrap();
        assert_eq!(em.entity_count(), 0);
        assert!(entities.iter().all(|e| !em.valid(*e)));

        em.destroy_all().unwrap();
        assert_eq!(em.entity_count(), 0);
    }

    #[test]
    fn destroy_observer_sees_components() {
        let em = EntityManager::new();
        let seen = Rc::new(Cell::new(0));
        let counter = Rc::clone(&seen);
        em.subscribe::<EntityDestroyed>(move |em, entity, _| {
            let health = em.get::<Health>(entity).map(|h| h.0).unwrap_or(-1);
            counter.set(health);
        });

        let e = em.create();
        em.attach(e, Health(42)).unwrap();
        em.destroy(e).unwrap();
        assert_eq!(seen.get(), 42);
    }

    #[test]
    fn destroy_observer_may_destroy_other_entities() {
        let em = EntityManager::new();
        let a = em.create();
        let b = em.create();
        em.attach(b, Health(1)).unwrap();

        em.subscribe_entity::<EntityDestroyed>(a, move |em, _, _| {
            em.destroy(b).unwrap();
        })
        .unwrap();

        em.destroy(a).unwrap();
        assert!(!em.valid(a));
        assert!(!em.valid(b));
        assert_eq!(em.entity_count(), 0);
    }

    #[test]
    fn destroy_observer_may_destroy_the_entity_itself() {
        let em = EntityManager::new();
        em.subscribe::<EntityDestroyed>(|em, entity, _| {
            if em.valid(entity) {
                em.destroy(entity).unwrap();
            }
        });

        let e = em.create();
        em.attach(e, Health(1)).unwrap();
        em.destroy(e).unwrap();
        assert!(!em.valid(e));
        assert_eq!(em.entity_count(), 0);
    }

    #[test]
    fn destroy_all_tolerates_cascading_destruction() {
        let em = EntityManager::new();
        let entities: Vec<Entity> = (0..4).map(|_| em.create()).collect();
        let victim = entities[3];
        em.subscribe_entity::<EntityDestroyed>(entities[0], move |em, _, _| {
            em.destroy(victim).unwrap();
        })
        .unwrap();

        em.destroy_all().unwrap();
        assert_eq!(em.entity_count(), 0);
    }

    #[test]
    fn entity_subscriptions_end_with_the_entity() {
        struct Ping;

        let em = recycling_manager();
        let hits = Rc::new(Cell::new(0));
        let e = em.create();
        let counter = Rc::clone(&hits);
        let sub = em
            .subscribe_entity::<Ping>(e, move |_, _, _| counter.set(counter.get() + 1))
            .unwrap();

        em.emit(e, &Ping);
        assert_eq!(hits.get(), 1);
        assert!(sub.is_active());

        em.destroy(e).unwrap();
        assert!(!sub.is_active());

        // same index, new generation: the old callback must not fire
        let again = em.create();
        assert_eq!(again.index(), e.index());
        em.emit(again, &Ping);
        assert_eq!(hits.get(), 1);

        assert!(em.subscribe_entity::<Ping>(e, |_, _, _| {}).is_err());
    }

    #[test]
    fn type_subscribers_run_before_entity_subscribers() {
        struct Hit(u32);

        let em = EntityManager::new();
        let e = em.create();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        em.subscribe_entity::<Hit>(e, move |_, _, hit| l.borrow_mut().push(("entity", hit.0)))
            .unwrap();
        let l = Rc::clone(&log);
        em.subscribe::<Hit>(move |_, _, hit| l.borrow_mut().push(("any", hit.0)));

        em.emit(e, &Hit(5));
        assert_eq!(*log.borrow(), vec![("any", 5), ("entity", 5)]);
    }

    #[test]
    fn unsubscribe_stops_callbacks() {
        struct Tick;

        let em = EntityManager::new();
        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let mut sub = em.subscribe_global::<Tick>(move |_, _| counter.set(counter.get() + 1));

        em.emit_global(&Tick);
        sub.unsubscribe();
        assert!(!sub.is_active());
        em.emit_global(&Tick);
        sub.unsubscribe();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn unsubscribe_during_dispatch_skips_later_callbacks() {
        struct Tick;

        let em = EntityManager::new();
        let second_ran = Rc::new(Cell::new(false));
        let second: Rc<RefCell<Subscription>> = Rc::new(RefCell::new(Subscription::default()));

        let target = Rc::clone(&second);
        em.subscribe_global::<Tick>(move |_, _| target.borrow_mut().unsubscribe());
        let flag = Rc::clone(&second_ran);
        *second.borrow_mut() = em.subscribe_global::<Tick>(move |_, _| flag.set(true));

        em.emit_global(&Tick);
        assert!(!second_ran.get());
    }

    #[test]
    fn callbacks_may_emit_and_create() {
        struct Spawn(u32);

        let em = EntityManager::new();
        em.subscribe_global::<Spawn>(|em, spawn| {
            let e = em.create();
            em.attach(e, Health(spawn.0 as i32)).unwrap();
            if spawn.0 > 0 {
                em.emit_global(&Spawn(spawn.0 - 1));
            }
        });

        em.emit_global(&Spawn(3));
        assert_eq!(em.entity_count(), 4);
    }
}
