//! Glomerate ECS - Entity Component System
//!
//! An in-memory store for entities whose data is split into densely packed,
//! per-type component pools. Entities are generational indices; components are
//! found by type, queried by the set of types an entity holds, and optionally
//! indexed by value ("keyed" components).
//!
//! Queries hold an iteration lock on the pool they walk, so entities and
//! components can be created and destroyed from inside the loop:
//!
//! ```
//! use glomerate_ecs::EntityManager;
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Health(i32);
//!
//! let em = EntityManager::new();
//! for hp in [0, 5, 0] {
//!     let e = em.create();
//!     em.attach(e, Health(hp)).unwrap();
//! }
//!
//! for e in em.entities_with::<(Health,)>().unwrap() {
//!     if em.get::<Health>(e).unwrap().0 == 0 {
//!         em.destroy(e).unwrap();
//!     }
//! }
//! assert_eq!(em.entity_count(), 1);
//! ```

mod component;
mod config;
mod entity;
mod error;
mod event;
mod keyed;
mod manager;
mod query;
mod registry;

pub use component::{
    Component, ComponentPool, ComponentStorage, IterationLock, NoIndex, PoolEntities, SlotCursor,
    SlotIndex,
};
pub use config::{EcsConfig, MAX_COMPONENTS};
pub use entity::Entity;
pub use error::{EcsError, Result};
pub use event::{EntityDestroyed, Subscription};
pub use keyed::{KeyIndex, KeyedComponent, KeyedComponentPool};
pub use manager::EntityManager;
pub use query::EntityCollection;
pub use registry::{ComponentId, ComponentMask, ComponentRegistry, ComponentSet, StorageCell};
