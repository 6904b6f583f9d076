//! Configuration management for beacon remote

pub mod file;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

pub use file::RemoteConfigFile;

use crate::command::HandshakePolicy;
use crate::protocol::framing::DEFAULT_MAX_MESSAGE_BYTES;
use crate::{Error, Result};

/// Default multicast group for discovery
pub const DEFAULT_MULTICAST_GROUP: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 1), 6766);

/// Default address remotes dial back to
pub const DEFAULT_COMMAND_ENDPOINT: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6776);

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Nodes are evicted after this many silent heartbeat intervals
pub const NODE_TIMEOUT_HEARTBEATS: u32 = 5;

/// Upper bound on a single blocking receive in the listener loop
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Beacon remote configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Discovery transport
    pub broadcast: BroadcastConfig,

    /// Command transport
    pub command: CommandConfig,
}

/// Multicast discovery configuration
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Multicast group and port
    pub group: SocketAddrV4,

    /// Local interface to bind and join on (`0.0.0.0` for any)
    pub bind_address: Ipv4Addr,

    /// Multicast time-to-live (0 keeps traffic on this host)
    pub ttl: u32,

    /// Interval between `ping` heartbeats
    pub heartbeat_interval: Duration,

    /// Upper bound on one receive before the listener re-checks timers
    pub receive_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_MULTICAST_GROUP,
            bind_address: Ipv4Addr::UNSPECIFIED,
            ttl: 0,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }
}

impl BroadcastConfig {
    /// How long a node may stay silent before it is evicted
    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        self.heartbeat_interval.saturating_mul(NODE_TIMEOUT_HEARTBEATS)
    }
}

/// Command channel configuration
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Address to listen on and advertise in `open_connection` (port 0 picks one)
    ///
    /// Remotes dial this address as-is, so it cannot be `0.0.0.0`
    pub endpoint: SocketAddrV4,

    /// Handshake retry policy
    pub handshake: HandshakePolicy,

    /// Largest accepted command response
    pub max_message_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_COMMAND_ENDPOINT,
            handshake: HandshakePolicy::default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl Config {
    /// Load configuration from environment variables and the config file
    ///
    /// Precedence: env > `config.toml` > defaults
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is unusable
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        let config = Self::resolve(&fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Layer `lookup` (usually the environment) over a parsed config file
    #[must_use]
    pub fn resolve(fc: &RemoteConfigFile, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let value = |key: &str, from_file: Option<String>| lookup(key).or(from_file);

        let broadcast = BroadcastConfig {
            group: parse_value(
                "BEACON_REMOTE_MULTICAST_GROUP",
                value("BEACON_REMOTE_MULTICAST_GROUP", fc.broadcast.group.clone()),
            )
            .unwrap_or(defaults.broadcast.group),
            bind_address: parse_value(
                "BEACON_REMOTE_BIND_ADDRESS",
                value("BEACON_REMOTE_BIND_ADDRESS", fc.broadcast.bind_address.clone()),
            )
            .unwrap_or(defaults.broadcast.bind_address),
            ttl: parse_value(
                "BEACON_REMOTE_MULTICAST_TTL",
                value(
                    "BEACON_REMOTE_MULTICAST_TTL",
                    fc.broadcast.ttl.map(|v| v.to_string()),
                ),
            )
            .unwrap_or(defaults.broadcast.ttl),
            heartbeat_interval: parse_value(
                "BEACON_REMOTE_HEARTBEAT_MS",
                value(
                    "BEACON_REMOTE_HEARTBEAT_MS",
                    fc.broadcast.heartbeat_ms.map(|v| v.to_string()),
                ),
            )
            .map_or(defaults.broadcast.heartbeat_interval, Duration::from_millis),
            receive_timeout: defaults.broadcast.receive_timeout,
        };

        let handshake = HandshakePolicy {
            attempts: parse_value(
                "BEACON_REMOTE_HANDSHAKE_ATTEMPTS",
                value(
                    "BEACON_REMOTE_HANDSHAKE_ATTEMPTS",
                    fc.command.handshake_attempts.map(|v| v.to_string()),
                ),
            )
            .unwrap_or(defaults.command.handshake.attempts),
            interval: parse_value(
                "BEACON_REMOTE_HANDSHAKE_INTERVAL_MS",
                value(
                    "BEACON_REMOTE_HANDSHAKE_INTERVAL_MS",
                    fc.command.handshake_interval_ms.map(|v| v.to_string()),
                ),
            )
            .map_or(defaults.command.handshake.interval, Duration::from_millis),
        };

        let command = CommandConfig {
            endpoint: parse_value(
                "BEACON_REMOTE_COMMAND_ENDPOINT",
                value("BEACON_REMOTE_COMMAND_ENDPOINT", fc.command.endpoint.clone()),
            )
            .unwrap_or(defaults.command.endpoint),
            handshake,
            max_message_bytes: parse_value(
                "BEACON_REMOTE_MAX_MESSAGE_BYTES",
                value(
                    "BEACON_REMOTE_MAX_MESSAGE_BYTES",
                    fc.command.max_message_bytes.map(|v| v.to_string()),
                ),
            )
            .unwrap_or(defaults.command.max_message_bytes),
        };

        Self { broadcast, command }
    }

    /// Check the configuration can drive a session
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if !self.broadcast.group.ip().is_multicast() {
            return Err(Error::Config(format!(
                "{} is not a multicast group",
                self.broadcast.group
            )));
        }
        if self.broadcast.heartbeat_interval.is_zero() {
            return Err(Error::Config("heartbeat interval must be non-zero".to_string()));
        }
        if self.broadcast.receive_timeout.is_zero() {
            return Err(Error::Config("receive timeout must be non-zero".to_string()));
        }
        if self.command.endpoint.ip().is_unspecified() {
            return Err(Error::Config(format!(
                "command endpoint {} is advertised to remotes and must be a dialable address",
                self.command.endpoint
            )));
        }
        if self.command.handshake.attempts == 0 {
            return Err(Error::Config("handshake needs at least one attempt".to_string()));
        }
        if self.command.max_message_bytes == 0 {
            return Err(Error::Config("max message size must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Parse an optional raw value, warning about and ignoring anything malformed
fn parse_value<T: FromStr>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid config value");
            None
        }
    }
}
