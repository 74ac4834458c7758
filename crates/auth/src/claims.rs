use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use provenance_core::ActorId;

use crate::{Actor, Role};

/// Claims as handed over by the token issuer once the token is decoded and
/// its signature verified (transport-agnostic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject / actor identifier.
    pub sub: ActorId,

    /// Custody-chain role granted to the subject.
    pub role: Role,

    pub issued_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (issued_at is in the future)")]
    NotYetValid,

    #[error("invalid token time window (expires_at <= issued_at)")]
    InvalidTimeWindow,

    #[error("token subject is empty")]
    MissingSubject,
}

/// Deterministically validate claims against `now`.
///
/// Signature verification / decoding is outside this crate.
pub fn validate_claims(claims: &IdentityClaims, now: DateTime<Utc>) -> Result<(), TokenValidationError> {
    if claims.sub.is_blank() {
        return Err(TokenValidationError::MissingSubject);
    }
    if claims.expires_at <= claims.issued_at {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now < claims.issued_at {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.expires_at {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

impl IdentityClaims {
    /// Validate and turn the claims into the actor the registry acts on behalf of.
    pub fn into_actor(self, now: DateTime<Utc>) -> Result<Actor, TokenValidationError> {
        validate_claims(&self, now)?;
        Ok(Actor::new(self.sub, self.role))
    }
}
