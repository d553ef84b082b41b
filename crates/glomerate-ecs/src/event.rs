use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use parking_lot::ReentrantMutex;

use crate::entity::Entity;
use crate::manager::EntityManager;

/// Emitted for an entity right before its components are removed and its
/// slot is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDestroyed;

pub(crate) type EntityCallback<E> = Rc<dyn Fn(&EntityManager, Entity, &E)>;
pub(crate) type GlobalCallback<E> = Rc<dyn Fn(&EntityManager, &E)>;

struct Listener {
    id: u64,
    /// An `EntityCallback<E>` or `GlobalCallback<E>` for the list's event type.
    callback: Box<dyn Any>,
}

type ListenerList = Rc<RefCell<Vec<Listener>>>;

/// Handle to a registered callback.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Default)]
pub struct Subscription {
    list: Weak<RefCell<Vec<Listener>>>,
    id: u64,
}

impl Subscription {
    /// Whether the callback will still be called for new events.
    pub fn is_active(&self) -> bool {
        self.list
            .upgrade()
            .is_some_and(|list| list.borrow().iter().any(|l| l.id == self.id))
    }

    /// Stop the callback from being called. Safe to call more than once,
    /// and from inside a callback.
    pub fn unsubscribe(&mut self) {
        if let Some(list) = self.list.upgrade() {
            list.borrow_mut().retain(|l| l.id != self.id);
        }
        self.list = Weak::new();
    }
}

/// Ordered callback lists keyed by event type, and by entity for
/// entity-specific subscriptions.
///
/// Dispatch holds a re-entrant lock so a callback may emit further events or
/// mutate the manager. No cell borrow is held while a callback runs.
pub(crate) struct EventBus {
    dispatch: ReentrantMutex<()>,
    next_id: Cell<u64>,
    entity_events: RefCell<HashMap<TypeId, ListenerList>>,
    global_events: RefCell<HashMap<TypeId, ListenerList>>,
    per_entity: RefCell<HashMap<Entity, HashMap<TypeId, ListenerList>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            dispatch: ReentrantMutex::new(()),
            next_id: Cell::new(1),
            entity_events: RefCell::new(HashMap::new()),
            global_events: RefCell::new(HashMap::new()),
            per_entity: RefCell::new(HashMap::new()),
        }
    }

    fn list_for(map: &RefCell<HashMap<TypeId, ListenerList>>, type_id: TypeId) -> ListenerList {
        Rc::clone(map.borrow_mut().entry(type_id).or_default())
    }

    fn add(&self, list: &ListenerList, callback: Box<dyn Any>) -> Subscription {
        let _guard = self.dispatch.lock();
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        list.borrow_mut().push(Listener { id, callback });
        Subscription {
            list: Rc::downgrade(list),
            id,
        }
    }

    pub fn subscribe<E: 'static>(&self, callback: EntityCallback<E>) -> Subscription {
        let list = Self::list_for(&self.entity_events, TypeId::of::<E>());
        self.add(&list, Box::new(callback))
    }

    pub fn subscribe_entity<E: 'static>(
        &self,
        entity: Entity,
        callback: EntityCallback<E>,
    ) -> Subscription {
        let list = {
            let mut per_entity = self.per_entity.borrow_mut();
            Rc::clone(
                per_entity
                    .entry(entity)
                    .or_default()
                    .entry(TypeId::of::<E>())
                    .or_default(),
            )
        };
        self.add(&list, Box::new(callback))
    }

    pub fn subscribe_global<E: 'static>(&self, callback: GlobalCallback<E>) -> Subscription {
        let list = Self::list_for(&self.global_events, TypeId::of::<E>());
        self.add(&list, Box::new(callback))
    }

    fn snapshot<C: Clone + 'static>(list: &ListenerList) -> Vec<(u64, C)> {
        list.borrow()
            .iter()
            .filter_map(|l| l.callback.downcast_ref::<C>().map(|c| (l.id, c.clone())))
            .collect()
    }

    fn still_listening(list: &ListenerList, id: u64) -> bool {
        list.borrow().iter().any(|l| l.id == id)
    }

    fn dispatch_entity<E: 'static>(
        list: &ListenerList,
        manager: &EntityManager,
        entity: Entity,
        event: &E,
    ) {
        for (id, callback) in Self::snapshot::<EntityCallback<E>>(list) {
            // an earlier callback may have unsubscribed this one
            if Self::still_listening(list, id) {
                callback(manager, entity, event);
            }
        }
    }

    /// Notify subscribers of `E`, then the subscribers of `E` on `entity`,
    /// each in subscription order.
    pub fn emit<E: 'static>(&self, manager: &EntityManager, entity: Entity, event: &E) {
        let _guard = self.dispatch.lock();
        let type_id = TypeId::of::<E>();

        let shared = self.entity_events.borrow().get(&type_id).cloned();
        if let Some(list) = shared {
            Self::dispatch_entity(&list, manager, entity, event);
        }

        let own = self
            .per_entity
            .borrow()
            .get(&entity)
            .and_then(|lists| lists.get(&type_id))
            .cloned();
        if let Some(list) = own {
            Self::dispatch_entity(&list, manager, entity, event);
        }
    }

    pub fn emit_global<E: 'static>(&self, manager: &EntityManager, event: &E) {
        let _guard = self.dispatch.lock();
        let list = self.global_events.borrow().get(&TypeId::of::<E>()).cloned();
        let Some(list) = list else {
            return;
        };
        for (id, callback) in Self::snapshot::<GlobalCallback<E>>(&list) {
            if Self::still_listening(&list, id) {
                callback(manager, event);
            }
        }
    }

    /// Drop every entity-specific subscription of `entity`.
    pub fn clear_entity(&self, entity: Entity) {
        let _guard = self.dispatch.lock();
        let lists = self.per_entity.borrow_mut().remove(&entity);
        for list in lists.into_iter().flat_map(HashMap::into_values) {
            // emptied rather than just dropped: a dispatch in progress holds a clone
            let removed = std::mem::take(&mut *list.borrow_mut());
            drop(removed);
        }
    }
}
