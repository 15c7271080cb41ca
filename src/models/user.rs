//! User-related models

use serde::{Deserialize, Serialize};

/// Account role, as reported by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    #[default]
    User,
    Admin,
    Superadmin,
}

impl Role {
    /// Admins may resolve open chats.
    pub fn can_resolve(&self) -> bool {
        matches!(self, Role::Admin | Role::Superadmin)
    }
}

/// The local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: Role,
}

/// User carried by a `typing` / `userTyping` event.
///
/// Remote clients are not required to send a name or role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl From<&Identity> for TypingUser {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            name: Some(identity.name.clone()),
            role: Some(identity.role),
        }
    }
}
