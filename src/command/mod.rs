//! Command execution over a dedicated TCP connection

pub mod channel;
pub mod retry;

pub use channel::{AbortHandle, CommandChannel};
pub use retry::HandshakePolicy;
