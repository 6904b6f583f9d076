//! Shared test utilities
//!
//! [`StubNode`] plays the remote side of the protocol: it answers pings with
//! pongs, dials back on `open_connection`, and serves commands with a
//! configurable reply.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use beacon_remote::discovery::bind_multicast;
use beacon_remote::protocol::{self, Attributes, read_frame};
use beacon_remote::{
    BroadcastConfig, CommandConfig, CommandRequest, CommandResult, Config, HandshakePolicy,
    Message, Payload,
};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Heartbeat used by test sessions
pub const TEST_HEARTBEAT: Duration = Duration::from_millis(100);

/// Configuration for a test session on its own multicast port
///
/// Each test uses a distinct `port` so parallel tests never see each other
#[must_use]
pub fn test_config(port: u16) -> Config {
    Config {
        broadcast: BroadcastConfig {
            group: SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 1), port),
            heartbeat_interval: TEST_HEARTBEAT,
            receive_timeout: Duration::from_millis(20),
            ..BroadcastConfig::default()
        },
        command: CommandConfig {
            endpoint: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            handshake: HandshakePolicy {
                attempts: 3,
                interval: Duration::from_millis(300),
            },
            ..CommandConfig::default()
        },
    }
}

/// How the stub answers commands
#[derive(Clone)]
pub enum Reply {
    /// Evaluate the request and answer from the stub's own id
    With(Arc<dyn Fn(&CommandRequest) -> CommandResult + Send + Sync>),
    /// Read requests but never answer
    Silent,
    /// Answer, but claim to be a different node
    Impostor,
}

impl Reply {
    /// A tiny evaluator: `1+1` is `2`, `boom` fails, anything else echoes
    #[must_use]
    pub fn calculator() -> Self {
        Self::With(Arc::new(|request: &CommandRequest| match request.command.as_str() {
            "1+1" => CommandResult::ok("2"),
            "boom" => CommandResult::failed("boom: command raised"),
            other => CommandResult::ok(other),
        }))
    }

    /// Answer every command with `result`
    #[must_use]
    pub fn constant(result: CommandResult) -> Self {
        Self::With(Arc::new(move |_: &CommandRequest| result.clone()))
    }
}

/// Counters observed by tests
#[derive(Default)]
pub struct StubStats {
    pub pings: AtomicUsize,
    pub open_requests: AtomicUsize,
    pub close_requests: AtomicUsize,
    pub commands: Mutex<Vec<CommandRequest>>,
}

impl StubStats {
    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn open_requests(&self) -> usize {
        self.open_requests.load(Ordering::SeqCst)
    }

    pub fn close_requests(&self) -> usize {
        self.close_requests.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<CommandRequest> {
        self.commands.lock().unwrap().clone()
    }
}

/// A fake remote node on the test multicast group
pub struct StubNode {
    pub node_id: String,
    pub stats: Arc<StubStats>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StubNode {
    /// Join the group described by `config` and start answering
    pub fn spawn(node_id: &str, config: &Config, reply: Reply) -> Self {
        let socket = bind_multicast(&config.broadcast).expect("stub multicast socket");
        let stats = Arc::new(StubStats::default());
        let (shutdown, shutdown_rx) = oneshot::channel();

        let stub = Stub {
            node_id: node_id.to_string(),
            group: SocketAddr::V4(config.broadcast.group),
            socket,
            reply,
            stats: Arc::clone(&stats),
            connection: None,
        };
        let task = tokio::spawn(stub.run(shutdown_rx));

        Self {
            node_id: node_id.to_string(),
            stats,
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    /// Stop answering and drop any command connection
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for StubNode {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Stub {
    node_id: String,
    group: SocketAddr,
    socket: UdpSocket,
    reply: Reply,
    stats: Arc<StubStats>,
    connection: Option<JoinHandle<()>>,
}

impl Stub {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                received = self.socket.recv_from(&mut buf) => {
                    let Ok((len, _)) = received else { continue };
                    let Ok(message) = protocol::decode(&buf[..len]) else { continue };
                    if protocol::passes_receive_filter(&message, &self.node_id) {
                        self.handle(message).await;
                    }
                }
            }
        }
        self.drop_connection();
    }

    async fn handle(&mut self, message: Message) {
        match message.payload {
            Payload::Ping(_) => {
                self.stats.pings.fetch_add(1, Ordering::SeqCst);
                let mut attributes = Attributes::new();
                attributes.insert("project_name".to_string(), json!("StubProject"));
                attributes.insert("machine".to_string(), json!("stub-host"));
                let pong = Message::new(self.node_id.as_str(), Payload::Pong(attributes))
                    .to(message.source);
                let bytes = protocol::encode(&pong).unwrap();
                let _ = self.socket.send_to(&bytes, self.group).await;
            }
            Payload::OpenConnection(open) => {
                self.stats.open_requests.fetch_add(1, Ordering::SeqCst);
                if self.connection.as_ref().is_some_and(|c| !c.is_finished()) {
                    return;
                }
                let addr = format!("{}:{}", open.command_ip, open.command_port);
                let Ok(stream) = TcpStream::connect(addr).await else { return };
                self.connection = Some(tokio::spawn(serve(
                    stream,
                    self.node_id.clone(),
                    message.source,
                    self.reply.clone(),
                    Arc::clone(&self.stats),
                )));
            }
            Payload::CloseConnection => {
                self.stats.close_requests.fetch_add(1, Ordering::SeqCst);
                self.drop_connection();
            }
            _ => {}
        }
    }

    fn drop_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

/// Answer commands on one connection until it closes
async fn serve(
    mut stream: TcpStream,
    node_id: String,
    controller: String,
    reply: Reply,
    stats: Arc<StubStats>,
) {
    loop {
        let Ok(frame) = read_frame(&mut stream, 1024 * 1024).await else { return };
        let Ok(message) = protocol::decode(&frame) else { return };
        let Payload::Command(request) = message.payload else { continue };
        stats.commands.lock().unwrap().push(request.clone());

        let response = match &reply {
            Reply::With(evaluate) => {
                Message::new(node_id.as_str(), Payload::CommandResult(evaluate(&request)))
                    .to(controller.as_str())
            }
            Reply::Silent => continue,
            Reply::Impostor => Message::new("impostor", Payload::CommandResult(CommandResult::ok("?")))
                .to(controller.as_str()),
        };

        let bytes = protocol::encode(&response).unwrap();
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

/// Records every decodable message on the test group without answering
pub struct GroupListener {
    messages: Arc<Mutex<Vec<Message>>>,
    task: JoinHandle<()>,
}

impl GroupListener {
    pub fn spawn(config: &Config) -> Self {
        let socket = bind_multicast(&config.broadcast).expect("listener multicast socket");
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            while let Ok((len, _)) = socket.recv_from(&mut buf).await {
                if let Ok(message) = protocol::decode(&buf[..len]) {
                    sink.lock().unwrap().push(message);
                }
            }
        });

        Self { messages, task }
    }

    /// Number of `open_connection` requests addressed to `target`
    pub fn open_requests_to(&self, target: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m.payload, Payload::OpenConnection(_)))
            .filter(|m| m.dest.as_deref() == Some(target))
            .count()
    }
}

impl Drop for GroupListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
