use serde::{Deserialize, Serialize};

/// Width of a [`ComponentMask`](crate::ComponentMask), and therefore the maximum
/// number of component types one [`EntityManager`](crate::EntityManager) can register.
pub const MAX_COMPONENTS: usize = 64;

/// Runtime tunables for an [`EntityManager`](crate::EntityManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcsConfig {
    /// How many destroyed entity indices must be queued before they start being
    /// reused. This delays reuse; it does not guarantee a grace period.
    pub recycle_threshold: usize,
}

impl Default for EcsConfig {
    fn default() -> Self {
        Self {
            recycle_threshold: 1024,
        }
    }
}
