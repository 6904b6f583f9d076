//! Wire protocol shared by the discovery and command transports
//!
//! Every message is a single JSON object:
//!
//! ```text
//! {"version": 1, "magic": "ue_py", "type": "pong",
//!  "source": "<node-id>", "dest": "<node-id>", "data": {...}}
//! ```
//!
//! `dest` is omitted for messages addressed to every node on the group.
//! Messages whose `version` or `magic` differ are dropped on receipt.

pub mod command;
pub mod framing;
pub mod message;

pub use command::{CommandRequest, CommandResult, ExecMode};
pub use framing::read_frame;
pub use message::{
    Attributes, DecodeError, Message, MessageType, OpenConnection, Payload, decode, encode,
    passes_receive_filter,
};

/// Protocol version; must match exactly on receipt
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol magic; must match exactly on receipt
pub const PROTOCOL_MAGIC: &str = "ue_py";
