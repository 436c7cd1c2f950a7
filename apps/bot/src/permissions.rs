//! Command permission levels and resolution.

use serde::{Deserialize, Serialize};

/// Minimum standing a sender needs for a command.
///
/// Ordered: `Member < Admin < Owner < SuperUser`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    Member,
    Admin,
    Owner,
    SuperUser,
}

/// A sender's role inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    /// Parse the `sender.role` field. Unknown strings are treated as members.
    pub fn parse(role: &str) -> Self {
        match role {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            _ => Self::Member,
        }
    }

    pub fn permission(self) -> Permission {
        match self {
            Self::Member => Permission::Member,
            Self::Admin => Permission::Admin,
            Self::Owner => Permission::Owner,
        }
    }
}

/// Check whether a sender satisfies `required`.
///
/// Super users pass everything. `SuperUser` itself is never granted by a
/// group role.
pub fn is_permitted(required: Permission, role: Role, is_super_user: bool) -> bool {
    if is_super_user {
        return true;
    }
    required != Permission::SuperUser && role.permission() >= required
}
