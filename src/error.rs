//! Error types for beacon remote

use thiserror::Error;

/// Result type alias for beacon remote operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while discovering nodes or running commands
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A message could not be encoded for the wire
    #[error("encoding error: {0}")]
    Encoding(String),

    /// No remote dialed back within the handshake budget
    #[error("timed out waiting for node {node_id} to connect after {attempts} attempts")]
    ConnectionTimeout {
        /// Node that was asked to connect
        node_id: String,
        /// Number of `open_connection` requests sent
        attempts: u32,
    },

    /// A command response had the wrong type or source
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The remote reported the command as failed
    #[error("remote command failed: {0}")]
    RemoteCommand(String),

    /// Socket I/O failure; the affected connection must be reopened
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// `run_command` was called without an open command connection
    #[error("no active command connection")]
    NoActiveConnection,

    /// The session has not been started
    #[error("session not started")]
    NotStarted,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error means the command connection is no longer usable
    #[must_use]
    pub const fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Socket(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_command_message_carries_result_text() {
        let err = Error::RemoteCommand("boom".to_string());
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn only_socket_errors_are_connection_fatal() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(Error::Socket(io).is_connection_fatal());
        assert!(!Error::ProtocolMismatch("x".to_string()).is_connection_fatal());
        assert!(!Error::NoActiveConnection.is_connection_fatal());
    }
}
