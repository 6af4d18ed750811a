//! Who is performing an operation.

use gradeguard_state::{ActorId, TenantId};
use serde::{Deserialize, Serialize};

/// The authenticated identity an operation runs as.
///
/// Authentication happens upstream; the core trusts the pair it is given
/// and only uses it for attribution and tenant scoping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub tenant: TenantId,
}

impl Actor {
    pub fn new(id: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            id: ActorId::new(id),
            tenant: TenantId::new(tenant),
        }
    }

    /// Whether a record owned by `tenant` is visible to this actor.
    pub fn can_see(&self, tenant: &TenantId) -> bool {
        &self.tenant == tenant
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.tenant)
    }
}
