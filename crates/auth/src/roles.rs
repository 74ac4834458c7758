use core::str::FromStr;

use serde::{Deserialize, Serialize};

use provenance_core::DomainError;

/// Role of an actor in the custody chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Manufacturer,
    Packager,
    Wholesaler,
    Seller,
    Inspector,
    Admin,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Manufacturer,
        Role::Packager,
        Role::Wholesaler,
        Role::Seller,
        Role::Inspector,
        Role::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Manufacturer => "manufacturer",
            Role::Packager => "packager",
            Role::Wholesaler => "wholesaler",
            Role::Seller => "seller",
            Role::Inspector => "inspector",
            Role::Admin => "admin",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown role '{s}'")))
    }
}
