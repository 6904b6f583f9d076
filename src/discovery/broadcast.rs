//! Broadcast channel: heartbeats and connection handshakes over multicast
//!
//! A background listener task owns the receive side. Each iteration waits at
//! most `receive_timeout` for a datagram, records `pong` replies in the node
//! registry, and once per heartbeat interval sends a `ping` to the group and
//! sweeps nodes that went silent.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::socket::bind_multicast;
use crate::Result;
use crate::config::BroadcastConfig;
use crate::nodes::NodeRegistry;
use crate::protocol::{
    self, Attributes, Message, OpenConnection, Payload, passes_receive_filter,
};

/// Datagram receive buffer size
pub const RECEIVE_BUFFER_BYTES: usize = 8192;

/// Multicast discovery transport owned by one session
pub struct BroadcastChannel {
    node_id: String,
    group: SocketAddrV4,
    socket: Option<Arc<UdpSocket>>,
    registry: Arc<NodeRegistry>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    listener: Option<JoinHandle<()>>,
}

impl BroadcastChannel {
    /// Join the multicast group and start the listener task
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the multicast socket cannot be created
    pub fn open(node_id: impl Into<String>, config: &BroadcastConfig) -> Result<Self> {
        let node_id = node_id.into();
        let socket = Arc::new(bind_multicast(config)?);
        let registry = Arc::new(NodeRegistry::new(config.node_timeout()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let listener = Listener {
            node_id: node_id.clone(),
            group: SocketAddr::V4(config.group),
            socket: Arc::clone(&socket),
            registry: Arc::clone(&registry),
            heartbeat_interval: config.heartbeat_interval,
            receive_timeout: config.receive_timeout,
        };
        let handle = tokio::spawn(listener.run(shutdown_rx));

        tracing::info!(
            node_id = %node_id,
            group = %config.group,
            ttl = config.ttl,
            heartbeat_ms = u64::try_from(config.heartbeat_interval.as_millis()).unwrap_or(u64::MAX),
            "broadcast channel open"
        );

        Ok(Self {
            node_id,
            group: config.group,
            socket: Some(socket),
            registry,
            shutdown_tx: Some(shutdown_tx),
            listener: Some(handle),
        })
    }

    /// Local node id used as `source` on every message
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Registry of nodes discovered by this channel
    #[must_use]
    pub const fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Whether the socket is still open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    /// Encode and send `message` to the multicast group
    ///
    /// # Errors
    ///
    /// Returns error if the message cannot be encoded, the channel is closed,
    /// or the send fails
    pub async fn send(&self, message: &Message) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "broadcast channel closed"))?;

        let bytes = protocol::encode(message)?;
        socket.send_to(&bytes, SocketAddr::V4(self.group)).await?;
        Ok(())
    }

    /// Ask `target` to dial in to the command listener at `command_endpoint`
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent
    pub async fn open_connection(&self, target: &str, command_endpoint: SocketAddrV4) -> Result<()> {
        let message = Message::new(
            self.node_id.as_str(),
            Payload::OpenConnection(OpenConnection {
                command_ip: command_endpoint.ip().to_string(),
                command_port: command_endpoint.port(),
            }),
        )
        .to(target);

        tracing::debug!(target_node = target, endpoint = %command_endpoint, "sending open_connection");
        self.send(&message).await
    }

    /// Tell `target` to drop its command connection; no reply is expected
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent
    pub async fn close_connection(&self, target: &str) -> Result<()> {
        let message = Message::new(self.node_id.as_str(), Payload::CloseConnection).to(target);

        tracing::debug!(target_node = target, "sending close_connection");
        self.send(&message).await
    }

    /// Stop the listener, wait for it to finish, and close the socket
    pub async fn close(&mut self) {
        // Dropping the sender wakes the listener
        self.shutdown_tx.take();

        if let Some(handle) = self.listener.take()
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "broadcast listener ended abnormally");
        }

        if self.socket.take().is_some() {
            tracing::info!(node_id = %self.node_id, "broadcast channel closed");
        }
    }
}

impl Drop for BroadcastChannel {
    fn drop(&mut self) {
        // Best effort when the channel was never closed explicitly
        if let Some(handle) = self.listener.take() {
            handle.abort();
        }
    }
}

/// Receive side of the broadcast channel, run as a background task
struct Listener {
    node_id: String,
    group: SocketAddr,
    socket: Arc<UdpSocket>,
    registry: Arc<NodeRegistry>,
    heartbeat_interval: Duration,
    receive_timeout: Duration,
}

impl Listener {
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut buf = vec![0u8; RECEIVE_BUFFER_BYTES];
        let mut last_ping: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                received = tokio::time::timeout(self.receive_timeout, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Ok(Ok((len, from))) => self.handle_datagram(&buf[..len], from),
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "broadcast receive failed");
                            tokio::time::sleep(self.receive_timeout).await;
                        }
                        // Nothing pending; fall through to the heartbeat check
                        Err(_) => {}
                    }
                }
            }

            let now = Instant::now();
            if last_ping.is_none_or(|sent| now.duration_since(sent) >= self.heartbeat_interval) {
                if let Err(e) = self.send_ping().await {
                    tracing::warn!(error = %e, "failed to send heartbeat");
                }
                self.registry.sweep_timeouts(now);
                last_ping = Some(now);
            }
        }

        tracing::debug!(node_id = %self.node_id, "broadcast listener stopped");
    }

    fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        match protocol::decode(bytes) {
            Ok(message) => {
                record_heartbeat(&self.registry, &self.node_id, message, Instant::now());
            }
            Err(e) => tracing::trace!(%from, error = %e, "dropping datagram"),
        }
    }

    async fn send_ping(&self) -> Result<()> {
        let message = Message::new(self.node_id.as_str(), Payload::Ping(Attributes::new()));
        let bytes = protocol::encode(&message)?;
        self.socket.send_to(&bytes, self.group).await?;
        tracing::trace!(node_id = %self.node_id, "heartbeat sent");
        Ok(())
    }
}

/// Apply one decoded message to the registry
///
/// Only `pong` messages that pass the receive filter are recorded. Returns
/// true if the registry was updated.
fn record_heartbeat(
    registry: &NodeRegistry,
    local_node_id: &str,
    message: Message,
    now: Instant,
) -> bool {
    if !passes_receive_filter(&message, local_node_id) {
        return false;
    }

    match message.payload {
        Payload::Pong(attributes) => {
            registry.update(&message.source, attributes, now);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(Duration::from_secs(5))
    }

    fn pong_from(source: &str) -> Message {
        let mut attributes = Attributes::new();
        attributes.insert("project_name".to_string(), json!("Demo"));
        Message::new(source, Payload::Pong(attributes))
    }

    #[test]
    fn pong_from_other_node_is_recorded() {
        let registry = registry();
        assert!(record_heartbeat(&registry, "local", pong_from("remote"), Instant::now()));

        let node = registry.get("remote").unwrap();
        assert_eq!(node.attribute("project_name"), Some("Demo"));
    }

    #[test]
    fn own_pong_is_ignored() {
        let registry = registry();
        assert!(!record_heartbeat(&registry, "local", pong_from("local"), Instant::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn pong_addressed_elsewhere_is_ignored() {
        let registry = registry();
        let message = pong_from("remote").to("someone-else");
        assert!(!record_heartbeat(&registry, "local", message, Instant::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn pong_addressed_to_us_is_recorded() {
        let registry = registry();
        let message = pong_from("remote").to("local");
        assert!(record_heartbeat(&registry, "local", message, Instant::now()));
        assert!(registry.contains("remote"));
    }

    #[test]
    fn other_message_types_do_not_register_nodes() {
        let registry = registry();
        let now = Instant::now();

        let ping = Message::new("remote", Payload::Ping(Attributes::new()));
        let close = Message::new("remote", Payload::CloseConnection).to("local");

        assert!(!record_heartbeat(&registry, "local", ping, now));
        assert!(!record_heartbeat(&registry, "local", close, now));
        assert!(registry.is_empty());
    }
}
