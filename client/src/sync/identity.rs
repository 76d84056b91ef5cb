use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Maximum identity id length (bytes).
pub const MAX_ID_LENGTH: usize = 128;

/// Which dashboard a channel is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            other => Err(format!("unknown role {other:?} (expected admin or teacher)")),
        }
    }
}

/// The role + id pair a channel announces itself as. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    role: Role,
    id: String,
}

impl Identity {
    /// Build an identity. The id must be non-empty, at most 128 bytes and free of
    /// control characters.
    pub fn new(role: Role, id: impl Into<String>) -> Result<Self, ChannelError> {
        let id = id.into();
        validate_id(&id).map_err(ChannelError::InvalidIdentity)?;
        Ok(Self { role, id })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}

fn validate_id(id: &str) -> Result<(), String> {
    if id.trim().is_empty() {
        return Err("id cannot be empty".into());
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(format!("id too long (max {} bytes)", MAX_ID_LENGTH));
    }
    if id.chars().any(char::is_control) {
        return Err("id cannot contain control characters".into());
    }
    Ok(())
}
