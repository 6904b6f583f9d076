//! Message codec
//!
//! Messages travel as a JSON envelope whose `data` object depends on `type`.
//! Decoding validates the envelope and the payload for that type in one pass,
//! so a [`Message`] that exists is always fully populated.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::command::{CommandRequest, CommandResult};
use super::{PROTOCOL_MAGIC, PROTOCOL_VERSION};
use crate::{Error, Result};

/// Free-form node metadata carried by `ping` and `pong`
pub type Attributes = serde_json::Map<String, Value>;

/// Wire `type` of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    OpenConnection,
    CloseConnection,
    Command,
    CommandResult,
}

impl MessageType {
    /// Wire name of this type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::OpenConnection => "open_connection",
            Self::CloseConnection => "close_connection",
            Self::Command => "command",
            Self::CommandResult => "command_result",
        }
    }

    /// Parse a wire name
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "open_connection" => Some(Self::OpenConnection),
            "close_connection" => Some(Self::CloseConnection),
            "command" => Some(Self::Command),
            "command_result" => Some(Self::CommandResult),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `open_connection` payload: where the addressed node should dial in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenConnection {
    pub command_ip: String,
    pub command_port: u16,
}

/// Type-specific message body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping(Attributes),
    Pong(Attributes),
    OpenConnection(OpenConnection),
    CloseConnection,
    Command(CommandRequest),
    CommandResult(CommandResult),
}

impl Payload {
    /// Wire type for this payload
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::OpenConnection(_) => MessageType::OpenConnection,
            Self::CloseConnection => MessageType::CloseConnection,
            Self::Command(_) => MessageType::Command,
            Self::CommandResult(_) => MessageType::CommandResult,
        }
    }

    fn to_data(&self) -> serde_json::Result<Option<Value>> {
        match self {
            Self::Ping(attributes) | Self::Pong(attributes) => Ok((!attributes.is_empty())
                .then(|| Value::Object(attributes.clone()))),
            Self::OpenConnection(open) => serde_json::to_value(open).map(Some),
            Self::CloseConnection => Ok(None),
            Self::Command(request) => serde_json::to_value(request).map(Some),
            Self::CommandResult(result) => serde_json::to_value(result).map(Some),
        }
    }

    fn from_data(kind: MessageType, data: Option<Value>) -> std::result::Result<Self, DecodeError> {
        let invalid = |reason: String| DecodeError::InvalidPayload { kind, reason };
        let required = |data: Option<Value>| data.ok_or_else(|| invalid("missing data".to_string()));

        match kind {
            MessageType::Ping | MessageType::Pong => {
                let attributes = match data {
                    None | Some(Value::Null) => Attributes::new(),
                    Some(Value::Object(map)) => map,
                    Some(other) => return Err(invalid(format!("expected object, got {other}"))),
                };
                Ok(if kind == MessageType::Ping {
                    Self::Ping(attributes)
                } else {
                    Self::Pong(attributes)
                })
            }
            MessageType::OpenConnection => serde_json::from_value(required(data)?)
                .map(Self::OpenConnection)
                .map_err(|e| invalid(e.to_string())),
            MessageType::CloseConnection => Ok(Self::CloseConnection),
            MessageType::Command => serde_json::from_value(required(data)?)
                .map(Self::Command)
                .map_err(|e| invalid(e.to_string())),
            MessageType::CommandResult => serde_json::from_value(required(data)?)
                .map(Self::CommandResult)
                .map_err(|e| invalid(e.to_string())),
        }
    }
}

/// A single protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub version: u32,
    pub magic: String,
    pub source: String,
    /// Addressed node; `None` reaches every node on the group
    pub dest: Option<String>,
    pub payload: Payload,
}

impl Message {
    /// Build a message from `source` with the current protocol version and magic
    #[must_use]
    pub fn new(source: impl Into<String>, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            magic: PROTOCOL_MAGIC.to_string(),
            source: source.into(),
            dest: None,
            payload,
        }
    }

    /// Address this message to a single node
    #[must_use]
    pub fn to(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    /// Wire type of this message
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

/// Why a received message was discarded
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not a JSON envelope
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Foreign protocol
    #[error("magic mismatch: {0:?}")]
    MagicMismatch(String),

    /// Incompatible protocol revision
    #[error("version mismatch: {0}")]
    VersionMismatch(u32),

    /// Unrecognised `type`
    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    /// Empty `source`
    #[error("message has no source")]
    MissingSource,

    /// `data` does not fit the schema for `type`
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    version: u32,
    magic: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dest: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    version: u32,
    magic: String,
    #[serde(rename = "type")]
    kind: String,
    source: String,
    #[serde(default)]
    dest: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Encode a message as compact UTF-8 JSON
///
/// An empty `dest` is treated as absent
///
/// # Errors
///
/// Returns [`Error::Encoding`] if `source` is empty or the payload cannot be serialized
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    if message.source.is_empty() {
        return Err(Error::Encoding("message source is empty".to_string()));
    }

    let data = message
        .payload
        .to_data()
        .map_err(|e| Error::Encoding(e.to_string()))?;

    let envelope = OutgoingEnvelope {
        version: message.version,
        magic: &message.magic,
        kind: message.message_type().as_str(),
        source: &message.source,
        dest: message.dest.as_deref().filter(|d| !d.is_empty()),
        data,
    };

    serde_json::to_vec(&envelope).map_err(|e| Error::Encoding(e.to_string()))
}

/// Decode a message, rejecting anything that is not this protocol
///
/// # Errors
///
/// Returns a [`DecodeError`] describing why the bytes were discarded. Receivers
/// drop such messages rather than propagating the error.
pub fn decode(bytes: &[u8]) -> std::result::Result<Message, DecodeError> {
    let envelope: IncomingEnvelope =
        serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;

    if envelope.magic != PROTOCOL_MAGIC {
        return Err(DecodeError::MagicMismatch(envelope.magic));
    }
    if envelope.version != PROTOCOL_VERSION {
        return Err(DecodeError::VersionMismatch(envelope.version));
    }

    let kind = MessageType::from_wire(&envelope.kind)
        .ok_or(DecodeError::UnknownType(envelope.kind))?;

    if envelope.source.is_empty() {
        return Err(DecodeError::MissingSource);
    }

    let payload = Payload::from_data(kind, envelope.data)?;

    Ok(Message {
        version: envelope.version,
        magic: envelope.magic,
        source: envelope.source,
        dest: envelope.dest.filter(|d| !d.is_empty()),
        payload,
    })
}

/// Whether a received message is meant for `local_node_id`
///
/// Drops our own multicast echoes and traffic addressed to other nodes
#[must_use]
pub fn passes_receive_filter(message: &Message, local_node_id: &str) -> bool {
    if message.source == local_node_id {
        return false;
    }
    message.dest.as_deref().is_none_or(|dest| dest == local_node_id)
}
