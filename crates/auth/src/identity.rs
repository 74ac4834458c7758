//! Identity provider boundary.
//!
//! Token issuance and verification live outside this system; the provider
//! only turns a presented credential into a trusted [`Actor`].

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use thiserror::Error;

use crate::{Actor, IdentityClaims, TokenValidationError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("unknown credential")]
    UnknownCredential,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] TokenValidationError),
}

/// Resolves a credential into a pre-verified actor.
pub trait IdentityProvider: Send + Sync {
    fn resolve(&self, credential: &str) -> Result<Actor, IdentityError>;
}

/// Credential table keyed by opaque bearer string (dev/test).
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    claims: RwLock<HashMap<String, IdentityClaims>>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, credential: impl Into<String>, claims: IdentityClaims) {
        if let Ok(mut map) = self.claims.write() {
            map.insert(credential.into(), claims);
        }
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve(&self, credential: &str) -> Result<Actor, IdentityError> {
        let claims = self
            .claims
            .read()
            .ok()
            .and_then(|map| map.get(credential).cloned())
            .ok_or(IdentityError::UnknownCredential)?;
        Ok(claims.into_actor(Utc::now())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;
    use chrono::Duration;
    use provenance_core::ActorId;

    #[test]
    fn resolves_registered_credentials_only() {
        let provider = StaticIdentityProvider::new();
        let now = Utc::now();
        provider.register(
            "tok-inspector",
            IdentityClaims {
                sub: ActorId::new("inspector1"),
                role: Role::Inspector,
                issued_at: now - Duration::minutes(1),
                expires_at: now + Duration::hours(1),
            },
        );

        let actor = provider.resolve("tok-inspector").unwrap();
        assert_eq!(actor.role, Role::Inspector);
        assert_eq!(provider.resolve("nope"), Err(IdentityError::UnknownCredential));
    }

    #[test]
    fn expired_claims_surface_as_invalid_token() {
        let provider = StaticIdentityProvider::new();
        let now = Utc::now();
        provider.register(
            "old",
            IdentityClaims {
                sub: ActorId::new("U9"),
                role: Role::Seller,
                issued_at: now - Duration::hours(2),
                expires_at: now - Duration::hours(1),
            },
        );
        assert_eq!(
            provider.resolve("old"),
            Err(IdentityError::InvalidToken(TokenValidationError::Expired))
        );
    }
}
