//! Command channel: synchronous request/response over TCP
//!
//! The local side listens; the remote is told where to dial in through the
//! broadcast channel. Once connected, each `command` is answered by exactly
//! one `command_result` before the next may be sent.

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::config::CommandConfig;
use crate::discovery::BroadcastChannel;
use crate::protocol::{self, CommandRequest, CommandResult, Message, Payload, read_frame};
use crate::{Error, Result};

/// Backlog for the command listener; only the target node should connect
const LISTEN_BACKLOG: i32 = 1;

/// Cancels a pending handshake or a blocked [`CommandChannel::run_command`]
/// from another task
///
/// Aborting is permanent: the channel must be reopened afterwards
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    /// Create a handle that has not been aborted
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Abort the handshake or in-flight command, if any, and any later ones
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`AbortHandle::abort`] has been called
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Point-to-point connection to a single remote node
#[derive(Debug)]
pub struct CommandChannel {
    local_node_id: String,
    target_node_id: String,
    stream: Option<TcpStream>,
    abort: AbortHandle,
    abort_rx: watch::Receiver<bool>,
    max_message_bytes: usize,
    closed: bool,
}

impl CommandChannel {
    /// Listen for `target_node_id` and ask it to connect until it does, the
    /// handshake budget runs out, or `abort` fires
    ///
    /// The same `abort` handle later cancels commands on the opened channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionTimeout`] if the remote never dials in, or a
    /// socket error if the listener cannot be created, a request cannot be
    /// sent, or the handshake was aborted
    pub async fn open(
        broadcast: &BroadcastChannel,
        target_node_id: &str,
        config: &CommandConfig,
        abort: AbortHandle,
    ) -> Result<Self> {
        let mut abort_rx = abort.subscribe();
        let listener = bind_listener(config.endpoint)?;
        let advertised = match listener.local_addr()? {
            std::net::SocketAddr::V4(addr) => addr,
            std::net::SocketAddr::V6(_) => {
                return Err(Error::Config("command listener bound to IPv6".to_string()));
            }
        };

        let policy = config.handshake;
        let started = Instant::now();
        let mut attempt = 0;

        while let Some(wait) = policy.wait_for_attempt(attempt) {
            attempt += 1;
            tracing::debug!(
                target_node = target_node_id,
                attempt,
                of = policy.attempts,
                "requesting command connection"
            );
            broadcast.open_connection(target_node_id, advertised).await?;

            let accepted = tokio::select! {
                biased;
                () = wait_for_abort(&mut abort_rx) => {
                    tracing::info!(target_node = target_node_id, attempt, "handshake aborted");
                    return Err(aborted().into());
                }
                accepted = tokio::time::timeout(wait, listener.accept()) => accepted,
            };

            match accepted {
                Ok(Ok((stream, peer))) => {
                    stream.set_nodelay(true)?;
                    tracing::info!(
                        target_node = target_node_id,
                        %peer,
                        attempt,
                        "command connection established"
                    );

                    return Ok(Self {
                        local_node_id: broadcast.node_id().to_string(),
                        target_node_id: target_node_id.to_string(),
                        stream: Some(stream),
                        abort,
                        abort_rx,
                        max_message_bytes: config.max_message_bytes,
                        closed: false,
                    });
                }
                Ok(Err(e)) => return Err(e.into()),
                // Nobody dialed in yet; ask again
                Err(_) => {}
            }
        }

        tracing::warn!(
            target_node = target_node_id,
            attempts = attempt,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "remote never connected"
        );
        Err(Error::ConnectionTimeout {
            node_id: target_node_id.to_string(),
            attempts: attempt,
        })
    }

    /// Node this channel talks to
    #[must_use]
    pub fn target_node_id(&self) -> &str {
        &self.target_node_id
    }

    /// Whether the socket is still open
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Handle that can cancel a blocked command from another task
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Send one command and wait for its result
    ///
    /// There is no built-in timeout; use [`CommandChannel::abort_handle`] to
    /// cancel. Any socket error closes the channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] on I/O failure or abort, and
    /// [`Error::ProtocolMismatch`] if the reply is not a `command_result` from
    /// the target node
    pub async fn run_command(&mut self, request: CommandRequest) -> Result<CommandResult> {
        let result = self.exchange(request).await;
        if let Err(e) = &result
            && e.is_connection_fatal()
        {
            tracing::warn!(target_node = %self.target_node_id, error = %e, "command connection lost");
            self.stream = None;
        }
        result
    }

    async fn exchange(&mut self, request: CommandRequest) -> Result<CommandResult> {
        if *self.abort_rx.borrow_and_update() {
            return Err(aborted().into());
        }
        let stream = self.stream.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "command channel closed")
        })?;

        let exec_mode = request.exec_mode;
        let message = Message::new(self.local_node_id.as_str(), Payload::Command(request))
            .to(self.target_node_id.as_str());
        let bytes = protocol::encode(&message)?;

        tracing::debug!(
            target_node = %self.target_node_id,
            %exec_mode,
            bytes = bytes.len(),
            "sending command"
        );

        let max = self.max_message_bytes;
        let abort_rx = &mut self.abort_rx;
        let response = tokio::select! {
            biased;
            () = wait_for_abort(abort_rx) => return Err(aborted().into()),
            response = send_and_receive(stream, &bytes, max) => response?,
        };

        tracing::debug!(target_node = %self.target_node_id, bytes = response.len(), "received response");
        self.parse_response(&response)
    }

    fn parse_response(&self, bytes: &[u8]) -> Result<CommandResult> {
        let message = protocol::decode(bytes)
            .map_err(|e| Error::ProtocolMismatch(format!("undecodable response: {e}")))?;

        if message.source != self.target_node_id {
            return Err(Error::ProtocolMismatch(format!(
                "response from {} but connected to {}",
                message.source, self.target_node_id
            )));
        }

        match message.payload {
            Payload::CommandResult(result) => Ok(result),
            other => Err(Error::ProtocolMismatch(format!(
                "expected command_result, got {}",
                other.message_type()
            ))),
        }
    }

    /// Tell the remote to disconnect and close the socket
    ///
    /// Best effort and idempotent. The remote is notified even if the socket
    /// was already lost.
    pub async fn close(&mut self, broadcast: &BroadcastChannel) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = broadcast.close_connection(&self.target_node_id).await {
            tracing::warn!(target_node = %self.target_node_id, error = %e, "failed to send close_connection");
        }
        if let Some(mut stream) = self.stream.take()
            && let Err(e) = stream.shutdown().await
        {
            tracing::debug!(error = %e, "command socket shutdown failed");
        }

        tracing::info!(target_node = %self.target_node_id, "command connection closed");
    }
}

/// Write one request and read back one framed response
async fn send_and_receive(stream: &mut TcpStream, request: &[u8], max_len: usize) -> io::Result<Vec<u8>> {
    stream.write_all(request).await?;
    stream.flush().await?;
    read_frame(stream, max_len).await
}

/// Resolves once the abort flag is set, including when it already was
async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|aborted| *aborted).await.is_err();
    if sender_gone {
        // Nothing can abort any more
        std::future::pending::<()>().await;
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "command aborted")
}

/// Bind the command listener with address and port reuse so it can be reopened at once
fn bind_listener(endpoint: SocketAddrV4) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SockAddr::from(endpoint))?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::protocol::ExecMode;

    /// Connected channel plus the remote end of its socket
    async fn connected_pair() -> (CommandChannel, TcpStream) {
        let listener = bind_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let remote = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let abort = AbortHandle::new();
        let channel = CommandChannel {
            local_node_id: "local".to_string(),
            target_node_id: "remote".to_string(),
            stream: Some(stream),
            abort_rx: abort.subscribe(),
            abort,
            max_message_bytes: 1024 * 1024,
            closed: false,
        };
        (channel, remote)
    }

    async fn reply(remote: &mut TcpStream, message: &Message) -> Message {
        let request = read_frame(remote, 1024 * 1024).await.unwrap();
        remote.write_all(&protocol::encode(message).unwrap()).await.unwrap();
        protocol::decode(&request).unwrap()
    }

    fn request() -> CommandRequest {
        CommandRequest::new("1+1", true, ExecMode::EvaluateStatement)
    }

    #[tokio::test]
    async fn command_result_is_returned() {
        let (mut channel, mut remote) = connected_pair().await;
        let response =
            Message::new("remote", Payload::CommandResult(CommandResult::ok("2"))).to("local");

        let (result, sent) = tokio::join!(channel.run_command(request()), reply(&mut remote, &response));

        assert_eq!(result.unwrap(), CommandResult::ok("2"));
        assert_eq!(sent.source, "local");
        assert_eq!(sent.dest.as_deref(), Some("remote"));
        assert_eq!(sent.payload, Payload::Command(request()));
    }

    #[tokio::test]
    async fn response_from_wrong_source_is_mismatch() {
        let (mut channel, mut remote) = connected_pair().await;
        let response =
            Message::new("impostor", Payload::CommandResult(CommandResult::ok("2"))).to("local");

        let (result, _) = tokio::join!(channel.run_command(request()), reply(&mut remote, &response));

        assert!(matches!(result, Err(Error::ProtocolMismatch(_))));
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn response_of_wrong_type_is_mismatch() {
        let (mut channel, mut remote) = connected_pair().await;
        let response = Message::new("remote", Payload::CloseConnection).to("local");

        let (result, _) = tokio::join!(channel.run_command(request()), reply(&mut remote, &response));

        assert!(matches!(result, Err(Error::ProtocolMismatch(m)) if m.contains("close_connection")));
    }

    #[tokio::test]
    async fn peer_disconnect_is_socket_error_and_closes_channel() {
        let (mut channel, remote) = connected_pair().await;
        drop(remote);

        let result = channel.run_command(request()).await;

        assert!(matches!(result, Err(Error::Socket(_))));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn abort_unblocks_pending_command() {
        let (mut channel, mut remote) = connected_pair().await;
        let handle = channel.abort_handle();

        let aborter = async {
            // Wait until the request is on the wire, then never reply
            let mut buf = [0u8; 64];
            let _ = remote.read(&mut buf).await;
            handle.abort();
        };

        let (result, ()) = tokio::join!(channel.run_command(request()), aborter);

        match result {
            Err(Error::Socket(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionAborted),
            other => panic!("expected aborted socket error, got {other:?}"),
        }
        assert!(!channel.is_connected());
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn command_after_abort_fails_without_sending() {
        let (mut channel, mut remote) = connected_pair().await;
        channel.abort_handle().abort();

        let result = channel.run_command(request()).await;
        assert!(matches!(result, Err(Error::Socket(e)) if e.kind() == io::ErrorKind::ConnectionAborted));

        drop(channel);
        let mut buf = Vec::new();
        remote.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn fresh_abort_handle_is_not_aborted() {
        let handle = AbortHandle::default();
        assert!(!handle.is_aborted());
        handle.clone().abort();
        assert!(handle.is_aborted());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn listener_port_can_be_shared() {
        let first = bind_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = first.local_addr().unwrap().port();

        let second = bind_listener(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        assert!(second.is_ok(), "rebinding port {port} failed: {:?}", second.err());
    }
}
