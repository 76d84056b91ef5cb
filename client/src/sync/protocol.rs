use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identity::{Identity, Role};
use crate::error::ProtocolError;

/// Message sent from the client to the roster server.
///
/// Wire format: `{"type": "IDENTIFY", "data": {"role": "teacher", "id": "T1"}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Sent once, immediately after the connection opens.
    Identify { role: Role, id: String },
}

impl ClientMessage {
    pub fn identify(identity: &Identity) -> Self {
        ClientMessage::Identify {
            role: identity.role(),
            id: identity.id().to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Message pushed by the roster server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Full roster replacement, sent once after a successful identify.
    Snapshot {
        #[serde(rename = "onlineIds")]
        online_ids: Vec<String>,
    },
    /// One subject came online.
    EntryAdded { id: String },
    /// One subject went offline.
    EntryRemoved { id: String },
    /// Identify failed; the server will close the connection.
    Rejected {
        #[serde(default)]
        reason: String,
    },
}

const KNOWN_TYPES: [&str; 4] = ["SNAPSHOT", "ENTRY_ADDED", "ENTRY_REMOVED", "REJECTED"];

impl ServerMessage {
    /// Parse one text frame. Distinguishes frames that are not messages at all from
    /// messages of an unknown type and known types carrying bad data.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = match value.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            Some(_) => return Err(ProtocolError::Malformed("\"type\" is not a string".into())),
            None => return Err(ProtocolError::Malformed("missing \"type\" field".into())),
        };

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidData {
            kind,
            detail: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
