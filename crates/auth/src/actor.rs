use serde::{Deserialize, Serialize};

use provenance_core::ActorId;

use crate::Role;

/// A pre-authenticated caller: who is acting, and in which role.
///
/// Produced by an [`crate::IdentityProvider`]; the registry trusts it as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: ActorId,
    pub role: Role,
}

impl Actor {
    pub fn new(actor_id: impl Into<ActorId>, role: Role) -> Self {
        Self {
            actor_id: actor_id.into(),
            role,
        }
    }

    pub fn id(&self) -> &ActorId {
        &self.actor_id
    }
}

impl core::fmt::Display for Actor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}({})", self.actor_id, self.role)
    }
}
