//! Beacon Remote - discovery and command execution for script-capable nodes
//!
//! This library lets a local control process find remote application
//! instances on the network and drive them interactively:
//! - Discovery of nodes through multicast `ping`/`pong` heartbeats
//! - A directed handshake asking one node to dial back over TCP
//! - Synchronous command/result exchange on that connection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Session                          │
//! │   start/stop  │  remote_nodes  │  run_command        │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │                              │
//! ┌──────────▼───────────────┐   ┌──────────▼───────────┐
//! │   Broadcast Channel      │   │   Command Channel    │
//! │ UDP multicast listener   │──▶│ TCP listen + accept  │
//! │ heartbeats, handshake    │   │ request/response     │
//! └──────────┬───────────────┘   └──────────────────────┘
//!            │
//! ┌──────────▼───────────────┐
//! │     Node Registry        │
//! └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use beacon_remote::{Config, ExecMode, Session};
//!
//! # async fn example() -> beacon_remote::Result<()> {
//! let session = Session::new(Config::load()?);
//! session.start().await?;
//!
//! if let Some(node) = session.wait_for_node(None, Duration::from_secs(3)).await {
//!     session.open_command_connection(&node.node_id).await?;
//!     let result = session
//!         .run_command("1+1", true, ExecMode::EvaluateStatement, true)
//!         .await?;
//!     println!("{}", result.result);
//! }
//!
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod nodes;
pub mod protocol;
pub mod session;

pub use command::{AbortHandle, CommandChannel, HandshakePolicy};
pub use config::{BroadcastConfig, CommandConfig, Config};
pub use discovery::BroadcastChannel;
pub use error::{Error, Result};
pub use nodes::{NodeInfo, NodeRegistry};
pub use protocol::{CommandRequest, CommandResult, ExecMode, Message, Payload};
pub use session::Session;
