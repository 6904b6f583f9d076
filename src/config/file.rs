//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-remote/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfigFile {
    /// Discovery transport
    #[serde(default)]
    pub broadcast: BroadcastFileConfig,

    /// Command transport
    #[serde(default)]
    pub command: CommandFileConfig,
}

/// Discovery transport configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastFileConfig {
    /// Multicast group and port (e.g. "239.0.0.1:6766")
    pub group: Option<String>,

    /// Local interface address to bind and join on
    pub bind_address: Option<String>,

    /// Multicast time-to-live (0 keeps traffic on this host)
    pub ttl: Option<u32>,

    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: Option<u64>,
}

/// Command transport configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandFileConfig {
    /// Address remotes dial back to (e.g. "127.0.0.1:6776")
    pub endpoint: Option<String>,

    /// Number of `open_connection` requests before giving up
    pub handshake_attempts: Option<u32>,

    /// Wait after each request, in milliseconds
    pub handshake_interval_ms: Option<u64>,

    /// Largest accepted command response
    pub max_message_bytes: Option<usize>,
}

impl RemoteConfigFile {
    /// Parse TOML content
    ///
    /// # Errors
    ///
    /// Returns error if the content is not valid TOML for this schema
    pub fn parse(content: &str) -> crate::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Load the TOML config file from the standard path
///
/// Returns `RemoteConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> RemoteConfigFile {
    let Some(path) = config_file_path() else {
        return RemoteConfigFile::default();
    };

    if !path.exists() {
        return RemoteConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match RemoteConfigFile::parse(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                RemoteConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            RemoteConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-remote/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-remote")
            .join("config.toml")
    })
}
