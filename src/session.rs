//! Session facade
//!
//! Owns the broadcast channel and at most one command channel, and exposes
//! the operations external tooling builds on: start/stop, listing nodes,
//! opening a command connection, and running commands.
//!
//! ```text
//! Stopped ──start──▶ Started ──open_command_connection──▶ CommandConnected
//!    ▲                  │  ◀──close_command_connection───────┘
//!    └──────stop────────┘
//! ```
//!
//! Lock order is always command, then broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::command::{AbortHandle, CommandChannel};
use crate::config::Config;
use crate::discovery::BroadcastChannel;
use crate::nodes::NodeInfo;
use crate::protocol::{CommandRequest, CommandResult, ExecMode};
use crate::{Error, Result};

/// How often [`Session::wait_for_node`] re-checks the registry
const NODE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long `stop` waits on a busy command lock before aborting again
const STOP_ABORT_RETRY: Duration = Duration::from_millis(50);

/// A discovery-and-command session
pub struct Session {
    config: Config,
    broadcast: RwLock<Option<BroadcastChannel>>,
    /// Held for the whole request/response exchange
    command: Mutex<Option<CommandChannel>>,
    /// Reachable while `command` is locked by a handshake or an exchange
    abort: StdMutex<Option<AbortHandle>>,
    /// Set only while an opened command channel is stored
    connected: AtomicBool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Session {
    /// Create a stopped session
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            broadcast: RwLock::new(None),
            command: Mutex::new(None),
            abort: StdMutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Session configuration
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Generate a node id and start discovery
    ///
    /// Starting an already started session does nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the multicast socket
    /// cannot be opened
    pub async fn start(&self) -> Result<()> {
        let mut broadcast = self.broadcast.write().await;
        if broadcast.is_some() {
            tracing::debug!("session already started");
            return Ok(());
        }

        self.config.validate()?;
        let node_id = Uuid::new_v4().to_string();
        *broadcast = Some(BroadcastChannel::open(node_id, &self.config.broadcast)?);
        Ok(())
    }

    /// Close any command connection, stop discovery, and forget all nodes
    ///
    /// A pending handshake or a command still waiting for its result is
    /// aborted first.
    pub async fn stop(&self) {
        let mut command = loop {
            if let Ok(guard) = self.command.try_lock() {
                break guard;
            }
            // The handle may not be installed yet, so keep aborting until the lock frees
            tracing::debug!("aborting in-flight command connection work to stop session");
            self.abort_command();
            if let Ok(guard) = tokio::time::timeout(STOP_ABORT_RETRY, self.command.lock()).await {
                break guard;
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut channel) = command.take() {
            let broadcast = self.broadcast.read().await;
            if let Some(broadcast) = broadcast.as_ref() {
                channel.close(broadcast).await;
            }
        }
        self.set_abort_handle(None);
        drop(command);

        let mut broadcast = self.broadcast.write().await;
        if let Some(mut channel) = broadcast.take() {
            channel.close().await;
        }
    }

    /// Whether discovery is running
    pub async fn is_started(&self) -> bool {
        self.broadcast.read().await.is_some()
    }

    /// Local node id, while started
    pub async fn node_id(&self) -> Option<String> {
        self.broadcast
            .read()
            .await
            .as_ref()
            .map(|b| b.node_id().to_string())
    }

    /// Copies of every currently discovered node, sorted by id
    ///
    /// Empty while stopped
    pub async fn remote_nodes(&self) -> Vec<NodeInfo> {
        self.broadcast
            .read()
            .await
            .as_ref()
            .map(|b| b.registry().snapshot())
            .unwrap_or_default()
    }

    /// Wait until `node_id` (or any node, if `None`) has been discovered
    ///
    /// Returns `None` if nothing matching appears within `timeout`
    pub async fn wait_for_node(&self, node_id: Option<&str>, timeout: Duration) -> Option<NodeInfo> {
        let deadline = Instant::now() + timeout;
        loop {
            let found = self
                .remote_nodes()
                .await
                .into_iter()
                .find(|n| node_id.is_none_or(|id| n.node_id == id));
            if found.is_some() || Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(NODE_POLL_INTERVAL).await;
        }
    }

    /// Replace any command connection with a new one to `node_id`
    ///
    /// Blocks for up to the handshake budget while the remote is asked to dial
    /// in. [`Session::abort_command`] or [`Session::stop`] end the wait early.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before `start`, [`Error::ConnectionTimeout`]
    /// if the remote never connects, or a socket error (including an abort)
    pub async fn open_command_connection(&self, node_id: &str) -> Result<()> {
        let mut command = self.command.lock().await;
        let broadcast = self.broadcast.read().await;
        let broadcast = broadcast.as_ref().ok_or(Error::NotStarted)?;

        if let Some(mut existing) = command.take() {
            self.connected.store(false, Ordering::SeqCst);
            existing.close(broadcast).await;
        }

        let abort = AbortHandle::new();
        self.set_abort_handle(Some(abort.clone()));

        match CommandChannel::open(broadcast, node_id, &self.config.command, abort).await {
            Ok(channel) => {
                *command = Some(channel);
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.set_abort_handle(None);
                Err(e)
            }
        }
    }

    /// Whether a command connection is open
    ///
    /// A connection busy with a command counts as open; a handshake still
    /// waiting for the remote does not
    #[must_use]
    pub fn is_command_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Run one command on the connected node
    ///
    /// Calls are serialized; a second caller waits until the first result
    /// arrives. There is no timeout: use [`Session::abort_command`] from
    /// another task to give up. A socket failure (including an abort) drops
    /// the connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveConnection`] without a connection,
    /// [`Error::RemoteCommand`] with the result text when `raise_on_failure`
    /// is set and the remote reports failure, and otherwise whatever the
    /// exchange produced ([`Error::Socket`], [`Error::ProtocolMismatch`])
    pub async fn run_command(
        &self,
        command: &str,
        unattended: bool,
        exec_mode: ExecMode,
        raise_on_failure: bool,
    ) -> Result<CommandResult> {
        let mut guard = self.command.lock().await;
        let channel = guard.as_mut().ok_or(Error::NoActiveConnection)?;

        let request = CommandRequest::new(command, unattended, exec_mode);
        match channel.run_command(request).await {
            Ok(result) if raise_on_failure && !result.success => {
                Err(Error::RemoteCommand(result.result))
            }
            Ok(result) => Ok(result),
            Err(e) => {
                if e.is_connection_fatal() {
                    self.connected.store(false, Ordering::SeqCst);
                    if let Some(mut lost) = guard.take() {
                        let broadcast = self.broadcast.read().await;
                        if let Some(broadcast) = broadcast.as_ref() {
                            lost.close(broadcast).await;
                        }
                    }
                    self.set_abort_handle(None);
                }
                Err(e)
            }
        }
    }

    /// Close the command connection, if any
    pub async fn close_command_connection(&self) {
        let mut command = self.command.lock().await;
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut channel) = command.take() {
            let broadcast = self.broadcast.read().await;
            if let Some(broadcast) = broadcast.as_ref() {
                channel.close(broadcast).await;
            }
        }
        self.set_abort_handle(None);
    }

    /// Abort the pending handshake or in-flight command from any task
    ///
    /// A blocked [`Session::open_command_connection`] or
    /// [`Session::run_command`] fails with a socket error and the connection is
    /// dropped. Returns false if there is nothing to abort.
    pub fn abort_command(&self) -> bool {
        let abort = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
        abort.as_ref().is_some_and(|handle| {
            handle.abort();
            true
        })
    }

    fn set_abort_handle(&self, handle: Option<AbortHandle>) {
        *self.abort.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }
}
