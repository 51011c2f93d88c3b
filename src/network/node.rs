//! Bridge event loop
//!
//! One task owns the connection table, the router's pending acks and the
//! statistics. Everything else talks to it through a `BridgeHandle`, which
//! submits commands and waits for replies. Dialing, handshakes, socket I/O
//! and handler execution run in their own tasks and report back to the loop.

use crate::config::{BridgeConfig, ConfigError};
use crate::crypto::{KeyError, KeyPair};
use crate::network::message::{
    Ack, AckStatus, Capabilities, CodecError, Frame, Handshake, Message, MessageType,
};
use crate::network::peer::{ActivityOutcome, ConnectionManager, PeerConnection, PeerError};
use crate::network::router::{AckMatch, MessageHandler, MessageRouter, RouterError};
use crate::network::server::{
    dial, handshake_inbound, handshake_outbound, spawn_connection, ConnectionError,
    ConnectionEvent, FramedStream, Server,
};
use crate::network::stats::SyncStatistics;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};

/// Bridge lifecycle errors
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Bridge is shut down")]
    Closed,
}

/// Who this bridge is on the network
#[derive(Debug)]
pub struct BridgeIdentity {
    instance_id: String,
    capabilities: Capabilities,
    keys: KeyPair,
}

impl BridgeIdentity {
    pub fn new(instance_id: impl Into<String>, capabilities: Capabilities, keys: KeyPair) -> Self {
        Self {
            instance_id: instance_id.into(),
            capabilities,
            keys,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn public_key_hex(&self) -> String {
        self.keys.public_key_hex()
    }

    pub fn fingerprint(&self) -> String {
        self.keys.fingerprint()
    }

    /// Fresh signed handshake
    pub fn handshake(&self, listen_addr: Option<String>) -> Result<Handshake, KeyError> {
        Handshake::new(&self.keys, &self.instance_id, self.capabilities, listen_addr)
    }

    /// Build a message sent by this bridge
    pub fn message(&self, message_type: MessageType, payload: Value) -> Result<Message, CodecError> {
        Message::new(message_type, self.instance_id.clone(), payload)
    }

    /// Like `message`, from a string tag
    pub fn create_message(&self, message_type: &str, payload: Value) -> Result<Message, CodecError> {
        crate::network::message::create_message(message_type, self.instance_id.clone(), payload)
    }
}

/// Overall bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Disconnected,
    Connected,
    ShuttingDown,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Disconnected => "disconnected",
            BridgeStatus::Connected => "connected",
            BridgeStatus::ShuttingDown => "shutting_down",
        }
    }
}

/// Point-in-time view of the loop's state
#[derive(Debug, Clone, Serialize)]
pub struct BridgeSnapshot {
    pub instance_id: String,
    pub status: BridgeStatus,
    pub listen_addr: Option<String>,
    pub connected_peers: usize,
    pub pending_acks: usize,
    pub registered_types: Vec<String>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect {
        peer_uri: String,
        reply: ConnectReply,
    },
    Send {
        peer_id: String,
        message: Message,
        reply: Reply<Result<oneshot::Receiver<Ack>, RouterError>>,
    },
    /// The sender stopped waiting for an ack
    Expire {
        peer_id: String,
        message_id: String,
    },
    RegisterHandler {
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
        reply: Reply<bool>,
    },
    SetFallback {
        handler: Arc<dyn MessageHandler>,
    },
    GetConnection {
        peer_id: String,
        reply: Reply<Result<PeerConnection, PeerError>>,
    },
    ListActive {
        reply: Reply<Vec<PeerConnection>>,
    },
    Close {
        peer_id: String,
        reply: Reply<bool>,
    },
    Stats {
        reply: Reply<SyncStatistics>,
    },
    Snapshot {
        reply: Reply<BridgeSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

type ConnectReply = Reply<Result<PeerConnection, ConnectionError>>;

/// Completions posted back by tasks the loop spawned
enum Internal {
    Dialed {
        peer_uri: String,
        result: Result<(FramedStream, Handshake), ConnectionError>,
    },
    Accepted {
        peer_uri: String,
        framed: FramedStream,
        handshake: Handshake,
    },
    Dispatched {
        peer_id: String,
        ack: Ack,
    },
}

/// Cloneable client of a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<Command>,
    identity: Arc<BridgeIdentity>,
    config: Arc<BridgeConfig>,
    listen_addr: Option<SocketAddr>,
}

impl BridgeHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    pub fn identity(&self) -> &BridgeIdentity {
        &self.identity
    }

    pub fn instance_id(&self) -> &str {
        self.identity.instance_id()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Address the listener is bound to, if inbound connections are enabled
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Dial and handshake with a peer.
    ///
    /// Idempotent: a usable connection already made on `peer_uri` is
    /// returned as is, and callers racing a dial still in flight share its
    /// outcome.
    pub async fn establish_connection(
        &self,
        peer_uri: &str,
    ) -> Result<PeerConnection, ConnectionError> {
        let peer_uri = peer_uri.to_string();
        self.request(|reply| Command::Connect { peer_uri, reply })
            .await
            .unwrap_or(Err(ConnectionError::BridgeClosed))
    }

    pub async fn get_connection(&self, peer_id: &str) -> Result<PeerConnection, PeerError> {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::GetConnection { peer_id, reply })
            .await
            .unwrap_or(Err(PeerError::BridgeClosed))
    }

    /// Usable connections in establishment order; empty once shut down
    pub async fn list_active(&self) -> Vec<PeerConnection> {
        self.request(|reply| Command::ListActive { reply })
            .await
            .unwrap_or_default()
    }

    /// Disconnect a peer. Returns false if it was not connected.
    pub async fn close(&self, peer_id: &str) -> bool {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::Close { peer_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Install the handler for a message type. Returns true if one was replaced.
    pub async fn register_handler(
        &self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> bool {
        self.request(|reply| Command::RegisterHandler {
            message_type,
            handler,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Replace the handler used for types with no registration
    pub async fn set_fallback_handler(&self, handler: Arc<dyn MessageHandler>) {
        let _ = self.commands.send(Command::SetFallback { handler }).await;
    }

    /// Send a message and wait up to `timeout` for the peer's ack.
    ///
    /// A positive ack (ok or warning) is returned; a rejection becomes
    /// `HandlerFailure`. On timeout the peer's failure counter goes up by one.
    pub async fn send(
        &self,
        peer_id: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Ack, RouterError> {
        if !message.message_type().is_known() {
            return Err(RouterError::UnknownMessageType(
                message.message_type().to_string(),
            ));
        }

        let message_id = message.message_id().to_string();
        let owned_peer = peer_id.to_string();
        let mut ack_rx = self
            .request(|reply| Command::Send {
                peer_id: owned_peer,
                message,
                reply,
            })
            .await
            .ok_or(RouterError::BridgeClosed)??;

        match tokio::time::timeout(timeout, &mut ack_rx).await {
            Ok(Ok(ack)) => ack_result(peer_id, ack),
            Ok(Err(_)) => Err(RouterError::Disconnected(peer_id.to_string())),
            Err(_) => {
                ack_rx.close();
                if let Ok(ack) = ack_rx.try_recv() {
                    return ack_result(peer_id, ack);
                }

                let _ = self
                    .commands
                    .send(Command::Expire {
                        peer_id: peer_id.to_string(),
                        message_id,
                    })
                    .await;
                Err(RouterError::SendTimeout {
                    peer_id: peer_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Copy of the running counters
    pub async fn statistics(&self) -> Result<SyncStatistics, BridgeError> {
        self.request(|reply| Command::Stats { reply })
            .await
            .ok_or(BridgeError::Closed)
    }

    pub async fn snapshot(&self) -> Result<BridgeSnapshot, BridgeError> {
        self.request(|reply| Command::Snapshot { reply })
            .await
            .ok_or(BridgeError::Closed)
    }

    pub async fn registered_types(&self) -> Vec<String> {
        self.snapshot()
            .await
            .map(|s| s.registered_types)
            .unwrap_or_default()
    }

    /// Close every connection and stop the loop
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_some() {
            log::info!("Bridge {} shut down", self.instance_id());
        }
    }
}

fn ack_result(peer_id: &str, ack: Ack) -> Result<Ack, RouterError> {
    if ack.is_positive() {
        Ok(ack)
    } else {
        Err(RouterError::HandlerFailure {
            peer_id: peer_id.to_string(),
            reason: ack.detail.unwrap_or_else(|| "rejected".to_string()),
        })
    }
}

/// Address to advertise in handshakes for a bound listener
fn advertised(addr: SocketAddr) -> Option<String> {
    if addr.ip().is_unspecified() {
        None
    } else {
        Some(addr.to_string())
    }
}

/// The event loop state
pub struct Bridge {
    identity: Arc<BridgeIdentity>,
    config: Arc<BridgeConfig>,
    listen_addr: Option<String>,
    connections: ConnectionManager,
    router: MessageRouter,
    stats: SyncStatistics,
    /// Callers waiting on a dial still in flight, by uri
    dialing: HashMap<String, Vec<ConnectReply>>,
    internal_tx: mpsc::Sender<Internal>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    background: Vec<AbortHandle>,
}

impl Bridge {
    /// Start a bridge on the current runtime
    pub async fn start(config: BridgeConfig) -> Result<BridgeHandle, BridgeError> {
        let (handle, _task) = Self::launch(config).await?;
        Ok(handle)
    }

    /// Start a bridge on its own thread with a single-threaded runtime.
    ///
    /// The thread exits after `shutdown`.
    pub fn start_dedicated(
        config: BridgeConfig,
    ) -> Result<(BridgeHandle, std::thread::JoinHandle<()>), BridgeError> {
        let (tx, rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("bridge-loop".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = tx.send(Err(BridgeError::Io(e)));
                        return;
                    }
                };

                runtime.block_on(async move {
                    match Bridge::launch(config).await {
                        Ok((handle, task)) => {
                            let _ = tx.send(Ok(handle));
                            let _ = task.await;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                        }
                    }
                });
            })?;

        let handle = rx.recv().map_err(|_| BridgeError::Closed)??;
        Ok((handle, thread))
    }

    async fn launch(config: BridgeConfig) -> Result<(BridgeHandle, JoinHandle<()>), BridgeError> {
        config.validate()?;

        let keys = match &config.private_key_hex {
            Some(hex) => KeyPair::from_private_key_hex(hex)?,
            None => KeyPair::generate(),
        };
        let identity = Arc::new(BridgeIdentity::new(
            config.instance_id.clone(),
            config.capabilities,
            keys,
        ));
        log::info!(
            "Starting bridge {} (key {})",
            identity.instance_id(),
            identity.fingerprint()
        );

        let server = match config.listen_port {
            Some(port) => Some(Server::bind(&config.listen_host, port).await?),
            None => None,
        };
        let bound = server.as_ref().map(|s| s.local_addr());
        let listen_addr = config
            .advertise_addr
            .clone()
            .or_else(|| bound.and_then(advertised));

        let config = Arc::new(config);
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer);
        let (internal_tx, internal_rx) = mpsc::channel(config.command_buffer);
        let (events_tx, events_rx) = mpsc::channel(config.command_buffer);

        let mut bridge = Bridge {
            identity: identity.clone(),
            config: config.clone(),
            listen_addr: listen_addr.clone(),
            connections: ConnectionManager::new(
                config.degrade_after_failures,
                config.close_after_failures,
            ),
            router: MessageRouter::new(identity.instance_id()),
            stats: SyncStatistics::new(),
            dialing: HashMap::new(),
            internal_tx: internal_tx.clone(),
            events_tx,
            background: Vec::new(),
        };

        if let Some(server) = server {
            let acceptor = tokio::spawn(accept_loop(
                server,
                identity.clone(),
                listen_addr,
                internal_tx,
                config.handshake_timeout(),
            ));
            bridge.background.push(acceptor.abort_handle());
        }

        let handle = BridgeHandle {
            commands: commands_tx,
            identity,
            config: config.clone(),
            listen_addr: bound,
        };

        let task = tokio::spawn(bridge.run(commands_rx, internal_rx, events_rx));

        for peer_uri in config.bootstrap_peers.iter().cloned() {
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = handle.establish_connection(&peer_uri).await {
                    log::warn!("Bootstrap peer {} unreachable: {}", peer_uri, e);
                }
            });
        }

        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::Receiver<Internal>,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(done) = internal.recv() => self.handle_internal(done),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { peer_uri, reply } => self.connect(peer_uri, reply),
            Command::Send {
                peer_id,
                message,
                reply,
            } => {
                let _ = reply.send(self.send(&peer_id, message));
            }
            Command::Expire {
                peer_id,
                message_id,
            } => {
                if let Some(message_type) = self.router.expire(&message_id) {
                    self.stats.record_failed(&message_type);
                }
                self.record_failure(&peer_id);
            }
            Command::RegisterHandler {
                message_type,
                handler,
                reply,
            } => {
                let _ = reply.send(self.router.register_handler(message_type, handler));
            }
            Command::SetFallback { handler } => self.router.set_fallback(handler),
            Command::GetConnection { peer_id, reply } => {
                let _ = reply.send(self.connections.get_connection(&peer_id));
            }
            Command::ListActive { reply } => {
                let _ = reply.send(self.connections.list_active());
            }
            Command::Close { peer_id, reply } => {
                let closed = self.connections.close(&peer_id).is_some();
                if closed {
                    self.fail_pending(&peer_id);
                }
                let _ = reply.send(closed);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, peer_uri: String, reply: ConnectReply) {
        if let Some(existing) = self.connections.find_by_uri(&peer_uri) {
            let _ = reply.send(Ok(existing));
            return;
        }
        if let Some(waiters) = self.dialing.get_mut(&peer_uri) {
            log::debug!("Joining dial already in flight to {}", peer_uri);
            waiters.push(reply);
            return;
        }

        let handshake = match self.identity.handshake(self.listen_addr.clone()) {
            Ok(handshake) => handshake,
            Err(e) => {
                let _ = reply.send(Err(ConnectionError::HandshakeRejected(e.to_string())));
                return;
            }
        };

        let local_id = self.identity.instance_id().to_string();
        let internal = self.internal_tx.clone();
        let connect_timeout = self.config.connect_timeout();
        let handshake_timeout = self.config.handshake_timeout();

        self.dialing.insert(peer_uri.clone(), vec![reply]);
        tokio::spawn(async move {
            let result = async {
                let stream = dial(&peer_uri, connect_timeout).await?;
                handshake_outbound(stream, &peer_uri, handshake, &local_id, handshake_timeout).await
            }
            .await;

            if let Err(e) = &result {
                log::warn!("Failed to connect to {}: {}", peer_uri, e);
            }
            let _ = internal.send(Internal::Dialed { peer_uri, result }).await;
        });
    }

    fn send(
        &mut self,
        peer_id: &str,
        message: Message,
    ) -> Result<oneshot::Receiver<Ack>, RouterError> {
        let handle = self
            .connections
            .handle(peer_id)
            .map_err(|_| RouterError::NotFound(peer_id.to_string()))?;

        let message_type = message.message_type().clone();
        let message_id = message.message_id().to_string();
        let ack_rx = self.router.track(peer_id, &message);

        match handle.try_send(Frame::Envelope(message)) {
            Ok(()) => {
                self.stats.record_sent(&message_type);
                log::debug!("Sent {} {} to {}", message_type, message_id, peer_id);
                Ok(ack_rx)
            }
            Err(e) => {
                log::warn!("Failed to queue {} for {}: {}", message_type, peer_id, e);
                self.router.expire(&message_id);
                self.stats.record_failed(&message_type);
                self.record_failure(peer_id);
                Err(RouterError::Disconnected(peer_id.to_string()))
            }
        }
    }

    fn handle_internal(&mut self, done: Internal) {
        match done {
            Internal::Dialed { peer_uri, result } => {
                let waiters = self.dialing.remove(&peer_uri).unwrap_or_default();
                let outcome = result
                    .map(|(framed, handshake)| self.register(peer_uri, true, framed, handshake));
                for reply in waiters {
                    let _ = reply.send(outcome.clone());
                }
            }
            Internal::Accepted {
                peer_uri,
                framed,
                handshake,
            } => {
                self.register(peer_uri, false, framed, handshake);
            }
            Internal::Dispatched { peer_id, ack } => {
                if ack.status == AckStatus::Rejected {
                    self.stats.record_handler_failure();
                }
                match self.connections.handle(&peer_id) {
                    Ok(handle) => {
                        if handle.try_send(Frame::Ack(ack)).is_err() {
                            log::warn!("Could not return ack to {}", peer_id);
                        }
                    }
                    Err(_) => log::debug!("Dropping ack for departed peer {}", peer_id),
                }
            }
        }
    }

    /// Whether an existing connection wins over a new one to the same peer
    fn keep_existing(&self, existing: &PeerConnection, outbound: bool) -> bool {
        if !existing.is_usable() {
            return false;
        }
        if existing.outbound == outbound {
            // Dials to one uri are coalesced, so a second connection in the
            // same direction is a reconnect and the newest wins on both ends.
            return false;
        }

        // Both sides dialed each other: both keep the one dialed by the lower id
        let local_id = self.identity.instance_id();
        let dialer = |dialed_by_us: bool| {
            if dialed_by_us {
                local_id
            } else {
                existing.peer_id.as_str()
            }
        };
        dialer(existing.outbound) <= dialer(outbound)
    }

    fn register(
        &mut self,
        peer_uri: String,
        outbound: bool,
        framed: FramedStream,
        handshake: Handshake,
    ) -> PeerConnection {
        if let Ok(existing) = self.connections.get_connection(&handshake.instance_id) {
            if self.keep_existing(&existing, outbound) {
                log::debug!(
                    "Keeping existing connection to {}, dropping new one on {}",
                    existing.peer_id,
                    peer_uri
                );
                return existing;
            }
        }

        let session = self.connections.next_session();
        let connection = PeerConnection::from_handshake(&peer_uri, &handshake, outbound, session);
        let (handle, tasks) = spawn_connection(
            framed,
            &connection.peer_id,
            session,
            self.events_tx.clone(),
        );

        let peer_id = connection.peer_id.clone();
        if let Some(replaced) = self.connections.insert(connection, handle, tasks) {
            log::info!(
                "Replaced session {} for peer {}",
                replaced.session,
                replaced.peer_id
            );
            self.fail_pending(&peer_id);
        }

        match self.connections.get_connection(&peer_id) {
            Ok(connection) => connection,
            Err(_) => PeerConnection::from_handshake(&peer_uri, &handshake, outbound, session),
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Frame {
                peer_id,
                session,
                frame,
            } => self.handle_frame(peer_id, session, frame),
            ConnectionEvent::Closed {
                peer_id,
                session,
                reason,
            } => {
                if self.connections.close_session(&peer_id, session).is_some() {
                    log::info!("Connection to {} ended: {}", peer_id, reason);
                    self.fail_pending(&peer_id);
                }
            }
        }
    }

    fn handle_frame(&mut self, peer_id: String, session: u64, frame: Frame) {
        match frame {
            Frame::Envelope(message) => {
                if message.sender_id() != peer_id {
                    log::warn!(
                        "Message {} on {}'s connection claims sender {}",
                        message.message_id(),
                        peer_id,
                        message.sender_id()
                    );
                }
                self.connections.mark_activity(&peer_id, true);
                self.stats.record_received(message.message_type());
                log::debug!(
                    "Received {} {} from {}",
                    message.message_type(),
                    message.message_id(),
                    peer_id
                );

                let dispatch = self.router.dispatch(message);
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let ack = dispatch.await;
                    let _ = internal.send(Internal::Dispatched { peer_id, ack }).await;
                });
            }
            Frame::Ack(ack) => match self.router.complete(ack) {
                AckMatch::Delivered {
                    peer_id: acked_by,
                    message_type,
                    stamped_at,
                    positive,
                } => {
                    self.connections.mark_activity(&acked_by, true);
                    if positive {
                        self.stats.record_acknowledged(&message_type);
                        // Entries changed after the message was built were not in it
                        if message_type == MessageType::KnowledgeSync {
                            self.stats.record_sync(&acked_by, stamped_at);
                        }
                    } else {
                        self.stats.record_failed(&message_type);
                    }
                }
                AckMatch::Late {
                    peer_id: acked_by,
                    message_type,
                } => {
                    log::info!("Late ack for {} from {}", message_type, acked_by);
                    self.stats.record_late_ack();
                    self.stats.record_failed(&message_type);
                }
                AckMatch::Unmatched => {
                    log::debug!("Dropping unmatched ack from {}", peer_id);
                    self.stats.record_late_ack();
                }
            },
            Frame::HandshakeReject { reason, .. } => {
                log::warn!("Peer {} dropped us: {}", peer_id, reason);
                if self.connections.close_session(&peer_id, session).is_some() {
                    self.fail_pending(&peer_id);
                }
            }
            Frame::Handshake(_) => {
                log::debug!("Ignoring repeated handshake from {}", peer_id);
            }
        }
    }

    fn record_failure(&mut self, peer_id: &str) {
        if self.connections.mark_activity(peer_id, false) == ActivityOutcome::Closed {
            self.fail_pending(peer_id);
        }
    }

    /// Count and release every send still waiting on a departed peer
    fn fail_pending(&mut self, peer_id: &str) {
        for message_type in self.router.fail_peer(peer_id) {
            self.stats.record_failed(&message_type);
        }
    }

    fn snapshot(&self) -> BridgeSnapshot {
        let connected_peers = self.connections.active_count();
        BridgeSnapshot {
            instance_id: self.identity.instance_id().to_string(),
            status: if connected_peers > 0 {
                BridgeStatus::Connected
            } else {
                BridgeStatus::Disconnected
            },
            listen_addr: self.listen_addr.clone(),
            connected_peers,
            pending_acks: self.router.pending_count(),
            registered_types: self.router.registered_types(),
        }
    }

    fn shutdown(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
        let closed = self.connections.close_all();
        log::info!(
            "Bridge {} stopping, closed {} connections",
            self.identity.instance_id(),
            closed
        );
    }
}

async fn accept_loop(
    server: Server,
    identity: Arc<BridgeIdentity>,
    listen_addr: Option<String>,
    internal: mpsc::Sender<Internal>,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, remote) = match server.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::error!("Accept error: {}", e);
                continue;
            }
        };
        log::info!("Incoming connection from {}", remote);

        let handshake = match identity.handshake(listen_addr.clone()) {
            Ok(handshake) => handshake,
            Err(e) => {
                log::error!("Failed to sign handshake: {}", e);
                continue;
            }
        };

        let local_id = identity.instance_id().to_string();
        let internal = internal.clone();
        tokio::spawn(async move {
            stream.set_nodelay(true).ok();
            match handshake_inbound(stream, remote, handshake, &local_id, handshake_timeout).await {
                Ok((framed, theirs)) => {
                    let peer_uri = theirs
                        .listen_addr
                        .clone()
                        .unwrap_or_else(|| remote.to_string());
                    let _ = internal
                        .send(Internal::Accepted {
                            peer_uri,
                            framed,
                            handshake: theirs,
                        })
                        .await;
                }
                Err(e) => log::warn!("Handshake with {} failed: {}", remote, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::PeerStatus;
    use crate::network::router::{handler_fn, HandlerReply};
    use crate::test_support::{silent_peer, start_bridge, versioned_peer};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_advertised_address() {
        assert_eq!(advertised("0.0.0.0:7700".parse().unwrap()), None);
        assert_eq!(
            advertised("127.0.0.1:7700".parse().unwrap()),
            Some("127.0.0.1:7700".to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let alpha = start_bridge("alpha").await;
        let bravo = start_bridge("bravo").await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bravo
            .register_handler(
                MessageType::ExperienceShare,
                handler_fn(move |_msg| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(HandlerReply::Response(json!({"stored": true})))
                    }
                }),
            )
            .await;

        let uri = bravo.listen_addr().unwrap().to_string();
        let conn = alpha.establish_connection(&uri).await.unwrap();
        assert_eq!(conn.peer_id, "bravo");
        assert_eq!(conn.status, PeerStatus::Active);

        let msg = alpha
            .identity()
            .message(MessageType::ExperienceShare, json!({"lesson": "test"}))
            .unwrap();
        let ack = alpha
            .send("bravo", msg, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(ack.response, Some(json!({"stored": true})));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let stats = alpha.statistics().await.unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_acknowledged, 1);

        // The listener registered the dialer before reading its first message
        let inbound = bravo.get_connection("alpha").await.unwrap();
        assert!(!inbound.outbound);

        alpha.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_establish_is_idempotent() {
        let alpha = start_bridge("alpha").await;
        let bravo = start_bridge("bravo").await;
        let uri = bravo.listen_addr().unwrap().to_string();

        let first = alpha.establish_connection(&uri).await.unwrap();
        let second = alpha.establish_connection(&uri).await.unwrap();
        assert_eq!(first.session, second.session);
        assert_eq!(alpha.list_active().await.len(), 1);

        alpha.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_overlapping_dials_share_one_connection() {
        let alpha = start_bridge("alpha").await;
        let bravo = start_bridge("bravo").await;
        let uri = bravo.listen_addr().unwrap().to_string();

        let (first, second) = tokio::join!(
            alpha.establish_connection(&uri),
            alpha.establish_connection(&uri)
        );
        assert_eq!(first.unwrap().session, second.unwrap().session);

        // Give a duplicate socket time to be torn down on either side
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(alpha.list_active().await.len(), 1);
        assert_eq!(bravo.list_active().await.len(), 1);

        let msg = alpha
            .identity()
            .message(MessageType::HealthCheck, json!({}))
            .unwrap();
        assert!(alpha.send("bravo", msg, Duration::from_secs(2)).await.is_ok());

        alpha.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_incompatible_listener_is_version_mismatch() {
        let alpha = start_bridge("alpha").await;
        let uri = versioned_peer("bravo", "2.0").await;

        let result = alpha.establish_connection(&uri).await;
        assert_eq!(
            result.unwrap_err(),
            ConnectionError::VersionMismatch {
                ours: "1.0".to_string(),
                theirs: "2.0".to_string(),
            }
        );
        assert!(alpha.list_active().await.is_empty());
        alpha.shutdown().await;
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let alpha = start_bridge("alpha").await;
        // Nothing listens on a port we just released
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = alpha
            .establish_connection(&format!("127.0.0.1:{}", port))
            .await;
        assert!(matches!(result, Err(ConnectionError::DialFailure { .. })));
        assert!(alpha.list_active().await.is_empty());
        alpha.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_timeout_counts_one_failure() {
        let alpha = start_bridge("alpha").await;
        let uri = silent_peer("charlie").await;
        alpha.establish_connection(&uri).await.unwrap();

        let msg = alpha
            .identity()
            .message(MessageType::HealthCheck, json!({}))
            .unwrap();
        let result = alpha
            .send("charlie", msg, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(RouterError::SendTimeout { .. })));

        let conn = alpha.get_connection("charlie").await.unwrap();
        assert_eq!(conn.consecutive_failures, 1);
        assert_eq!(conn.status, PeerStatus::Active);

        let stats = alpha.statistics().await.unwrap();
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(alpha.snapshot().await.unwrap().pending_acks, 0);
        alpha.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejection_is_handler_failure() {
        let alpha = start_bridge("alpha").await;
        let bravo = start_bridge("bravo").await;
        bravo
            .register_handler(
                MessageType::ErrorReport,
                handler_fn(|_msg| async {
                    Err::<HandlerReply, _>(crate::network::router::HandlerError::Failed(
                        "cannot learn from this".into(),
                    ))
                }),
            )
            .await;

        let uri = bravo.listen_addr().unwrap().to_string();
        alpha.establish_connection(&uri).await.unwrap();

        let msg = alpha
            .identity()
            .message(MessageType::ErrorReport, json!({"error": "x"}))
            .unwrap();
        let result = alpha.send("bravo", msg, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(RouterError::HandlerFailure { .. })));

        // The peer answered, so it stays healthy
        let conn = alpha.get_connection("bravo").await.unwrap();
        assert_eq!(conn.consecutive_failures, 0);

        alpha.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_peer_and_close() {
        let alpha = start_bridge("alpha").await;
        let bravo = start_bridge("bravo").await;
        let uri = bravo.listen_addr().unwrap().to_string();
        alpha.establish_connection(&uri).await.unwrap();

        let msg = alpha
            .identity()
            .message(MessageType::HealthCheck, json!({}))
            .unwrap();
        let result = alpha.send("nobody", msg, Duration::from_secs(1)).await;
        assert_eq!(result, Err(RouterError::NotFound("nobody".into())));

        assert!(alpha.close("bravo").await);
        assert!(!alpha.close("bravo").await);
        assert!(matches!(
            alpha.get_connection("bravo").await,
            Err(PeerError::NotFound(_))
        ));

        alpha.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_self_connection_refused() {
        let alpha = start_bridge("alpha").await;
        let uri = alpha.listen_addr().unwrap().to_string();

        let result = alpha.establish_connection(&uri).await;
        assert_eq!(result.unwrap_err(), ConnectionError::SelfConnection);
        alpha.shutdown().await;
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let alpha = start_bridge("alpha").await;
        alpha.shutdown().await;

        assert!(alpha.list_active().await.is_empty());
        assert!(matches!(alpha.statistics().await, Err(BridgeError::Closed)));
        assert_eq!(
            alpha.establish_connection("127.0.0.1:1").await.unwrap_err(),
            ConnectionError::BridgeClosed
        );
    }

    #[test]
    fn test_dedicated_runtime() {
        let config = crate::test_support::test_config("alpha");
        let (handle, thread) = Bridge::start_dedicated(config).unwrap();

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let snapshot = handle.snapshot().await.unwrap();
            assert_eq!(snapshot.status, BridgeStatus::Disconnected);
            handle.shutdown().await;
        });
        thread.join().unwrap();
    }
}
