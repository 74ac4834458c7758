//! `provenance-auth` - identity boundary for the custody chain.
//!
//! Callers arrive pre-authenticated; this crate models who they are
//! ([`Actor`]) and in which [`Role`]. What each role may do lives with the
//! product state machine, not here.

pub mod actor;
pub mod claims;
pub mod identity;
pub mod roles;

pub use actor::Actor;
pub use claims::{IdentityClaims, TokenValidationError, validate_claims};
pub use identity::{IdentityError, IdentityProvider, StaticIdentityProvider};
pub use roles::Role;
