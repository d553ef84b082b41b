use crate::entity::Entity;

/// Errors returned by entity and component operations.
///
/// Every variant describes a caller mistake; none of them is transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EcsError {
    #[error("entity {0} is not valid; it may have already been destroyed")]
    InvalidEntity(Entity),

    #[error("component type {0} is not recognized; register it with the entity manager first")]
    UnknownType(&'static str),

    #[error("component type {0} is already registered")]
    DuplicateType(&'static str),

    #[error("entity {entity} does not have a component of type {component}")]
    MissingComponent {
        entity: Entity,
        component: &'static str,
    },

    #[error("cannot register component type {component}: all {max} component slots are in use")]
    CapacityExceeded { component: &'static str, max: usize },
}

pub type Result<T> = std::result::Result<T, EcsError>;
