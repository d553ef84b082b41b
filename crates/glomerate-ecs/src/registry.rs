use std::any::{type_name, TypeId};
use std::cell::{Cell, OnceCell, Ref, RefCell};
use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace};

use crate::component::{Component, ComponentPool, ComponentStorage};
use crate::config::MAX_COMPONENTS;
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::keyed::{KeyedComponent, KeyedComponentPool};

/// Shared cell holding one type-erased pool.
pub type StorageCell = RefCell<dyn ComponentStorage>;

/// Bit position assigned to a component type, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(usize);

impl ComponentId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fixed-width set of component types, one bit per [`ComponentId`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ComponentMask(u64);

impl ComponentMask {
    pub const EMPTY: ComponentMask = ComponentMask(0);

    pub fn with(mut self, id: ComponentId) -> Self {
        self.insert(id);
        self
    }

    pub fn insert(&mut self, id: ComponentId) {
        self.0 |= 1 << id.0;
    }

    pub fn remove(&mut self, id: ComponentId) {
        self.0 &= !(1 << id.0);
    }

    pub fn contains(self, id: ComponentId) -> bool {
        self.0 & (1 << id.0) != 0
    }

    /// Whether every bit of `other` is also set here.
    pub fn contains_all(self, other: ComponentMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set bits in ascending order, which is registration order.
    pub fn ids(self) -> impl Iterator<Item = ComponentId> {
        (0..MAX_COMPONENTS)
            .filter(move |bit| self.0 & (1 << *bit) != 0)
            .map(ComponentId)
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ComponentMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentMask({:#b})", self.0)
    }
}

/// A static list of component types, implemented for tuples.
pub trait ComponentSet {
    fn type_ids() -> Vec<(TypeId, &'static str)>;
}

impl ComponentSet for () {
    fn type_ids() -> Vec<(TypeId, &'static str)> {
        Vec::new()
    }
}

macro_rules! impl_component_set_tuple {
    ($($name:ident),+) => {
        impl<$($name: Component),+> ComponentSet for ($($name,)+) {
            fn type_ids() -> Vec<(TypeId, &'static str)> {
                vec![$((TypeId::of::<$name>(), type_name::<$name>()),)+]
            }
        }
    };
}

impl_component_set_tuple!(A);
impl_component_set_tuple!(A, B);
impl_component_set_tuple!(A, B, C);
impl_component_set_tuple!(A, B, C, D);
impl_component_set_tuple!(A, B, C, D, E);
impl_component_set_tuple!(A, B, C, D, E, F);
impl_component_set_tuple!(A, B, C, D, E, F, G);
impl_component_set_tuple!(A, B, C, D, E, F, G, H);

/// Reads a `T` out of either pool kind.
pub(crate) fn lookup<T: Component>(storage: &dyn ComponentStorage, entity: Entity) -> Option<&T> {
    let any = storage.as_any();
    if let Some(pool) = any.downcast_ref::<ComponentPool<T>>() {
        return pool.get(entity);
    }
    any.downcast_ref::<KeyedComponentPool<T>>()?.get(entity)
}

/// Maps component types to pools and tracks which components each entity holds.
///
/// Entities are addressed by index only; the entity manager is responsible for
/// checking liveness before calling in.
pub struct ComponentRegistry {
    types: RefCell<HashMap<TypeId, ComponentId>>,
    pools: [OnceCell<Box<StorageCell>>; MAX_COMPONENTS],
    count: Cell<usize>,
    masks: RefCell<Vec<ComponentMask>>,
}

impl ComponentRegistry {
    pub(crate) fn new() -> Self {
        Self {
            types: RefCell::new(HashMap::new()),
            pools: std::array::from_fn(|_| OnceCell::new()),
            count: Cell::new(0),
            // mask for the null entity
            masks: RefCell::new(vec![ComponentMask::EMPTY]),
        }
    }

    // ---- Registration ----

    pub fn register<T: Component>(&self) -> Result<ComponentId> {
        self.register_storage::<T>(Box::new(RefCell::new(ComponentPool::<T>::new())))
    }

    pub fn register_keyed<K: KeyedComponent>(&self) -> Result<ComponentId> {
        self.register_storage::<K>(Box::new(RefCell::new(KeyedComponentPool::<K>::new())))
    }

    fn register_storage<T: Component>(&self, storage: Box<StorageCell>) -> Result<ComponentId> {
        let name = type_name::<T>();
        if self.id_of::<T>().is_some() {
            return Err(EcsError::DuplicateType(name));
        }
        let index = self.count.get();
        if index >= MAX_COMPONENTS {
            return Err(EcsError::CapacityExceeded {
                component: name,
                max: MAX_COMPONENTS,
            });
        }

        let placed = self.pools[index].set(storage).is_ok();
        assert!(placed, "component slot {index} already holds a pool");
        let id = ComponentId(index);
        self.types.borrow_mut().insert(TypeId::of::<T>(), id);
        self.count.set(index + 1);
        debug!("registered component type {name} as {id}");
        Ok(id)
    }

    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.types.borrow().get(&TypeId::of::<T>()).copied()
    }

    fn require<T: Component>(&self) -> Result<ComponentId> {
        self.id_of::<T>()
            .ok_or(EcsError::UnknownType(type_name::<T>()))
    }

    pub(crate) fn pool(&self, id: ComponentId) -> Option<&StorageCell> {
        self.pools.get(id.0)?.get().map(|pool| &**pool)
    }

    fn typed_pool<T: Component>(&self) -> Result<(ComponentId, &StorageCell)> {
        let id = self.require::<T>()?;
        let pool = self
            .pool(id)
            .ok_or(EcsError::UnknownType(type_name::<T>()))?;
        Ok((id, pool))
    }

    /// Number of registered component types.
    pub fn len(&self) -> usize {
        self.count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn build_mask<S: ComponentSet>(&self) -> Result<ComponentMask> {
        let types = self.types.borrow();
        S::type_ids()
            .into_iter()
            .try_fold(ComponentMask::EMPTY, |mask, (type_id, name)| {
                let id = types.get(&type_id).ok_or(EcsError::UnknownType(name))?;
                Ok(mask.with(*id))
            })
    }

    // ---- Per-entity masks ----

    pub(crate) fn push_mask(&self) {
        self.masks.borrow_mut().push(ComponentMask::EMPTY);
    }

    pub(crate) fn mask_count(&self) -> usize {
        self.masks.borrow().len()
    }

    pub fn mask(&self, entity: Entity) -> ComponentMask {
        self.masks
            .borrow()
            .get(entity.index as usize)
            .copied()
            .unwrap_or_default()
    }

    fn update_mask(&self, entity: Entity, update: impl FnOnce(&mut ComponentMask)) {
        let mut masks = self.masks.borrow_mut();
        let mask = masks
            .get_mut(entity.index as usize)
            .expect("entity has no component mask");
        update(mask);
    }

    // ---- Component access ----

    /// Attach `value`, registering a plain pool for `T` on first use.
    pub(crate) fn attach<T: Component>(&self, entity: Entity, value: T) -> Result<Ref<'_, T>> {
        let id = match self.id_of::<T>() {
            Some(id) => id,
            None => self.register::<T>()?,
        };
        self.insert(id, entity, value)
    }

    /// Attach `value`, registering a keyed pool for `K` on first use.
    pub(crate) fn attach_key<K: KeyedComponent>(
        &self,
        entity: Entity,
        value: K,
    ) -> Result<Ref<'_, K>> {
        let id = match self.id_of::<K>() {
            Some(id) => id,
            None => self.register_keyed::<K>()?,
        };
        self.insert(id, entity, value)
    }

    fn insert<T: Component>(&self, id: ComponentId, entity: Entity, value: T) -> Result<Ref<'_, T>> {
        let pool = self
            .pool(id)
            .ok_or(EcsError::UnknownType(type_name::<T>()))?;
        self.update_mask(entity, |mask| mask.insert(id));
        pool.borrow_mut().insert_erased(entity, &mut Some(value));
        Self::fetch(pool, entity)
    }

    fn fetch<T: Component>(pool: &StorageCell, entity: Entity) -> Result<Ref<'_, T>> {
        Ref::filter_map(pool.borrow(), |storage| lookup::<T>(storage, entity)).map_err(|_| {
            EcsError::MissingComponent {
                entity,
                component: type_name::<T>(),
            }
        })
    }

    pub(crate) fn detach<T: Component>(&self, entity: Entity) -> Result<()> {
        let (id, pool) = self.typed_pool::<T>()?;
        if !self.mask(entity).contains(id) {
            return Err(EcsError::MissingComponent {
                entity,
                component: type_name::<T>(),
            });
        }
        pool.borrow_mut().remove(entity)?;
        self.update_mask(entity, |mask| mask.remove(id));
        Ok(())
    }

    /// Remove every component the entity holds. Each set bit has a matching
    /// slot, so no removal can fail part way through.
    pub(crate) fn detach_all(&self, entity: Entity) -> Result<()> {
        for id in self.mask(entity).ids() {
            let Some(pool) = self.pool(id) else {
                continue;
            };
            pool.borrow_mut().remove(entity)?;
            self.update_mask(entity, |mask| mask.remove(id));
            trace!("detached {} from {entity}", pool.borrow().component_name());
        }
        assert!(
            self.mask(entity).is_empty(),
            "component mask of {entity} not empty after detaching everything"
        );
        Ok(())
    }

    pub(crate) fn has<T: Component>(&self, entity: Entity) -> Result<bool> {
        let id = self.require::<T>()?;
        Ok(self.mask(entity).contains(id))
    }

    pub(crate) fn has_value<T: Component + PartialEq>(&self, entity: Entity, value: &T) -> Result<bool> {
        let (id, pool) = self.typed_pool::<T>()?;
        if !self.mask(entity).contains(id) {
            return Ok(false);
        }
        let storage = pool.borrow();
        Ok(lookup::<T>(&*storage, entity) == Some(value))
    }

    pub(crate) fn get<T: Component>(&self, entity: Entity) -> Result<Ref<'_, T>> {
        let (id, pool) = self.typed_pool::<T>()?;
        if !self.mask(entity).contains(id) {
            return Err(EcsError::MissingComponent {
                entity,
                component: type_name::<T>(),
            });
        }
        Self::fetch(pool, entity)
    }
}
