//! Peer connection table
//!
//! Tracks every established peer, its lifecycle state and health metadata.
//! The table is owned by the bridge event loop; nothing else mutates it.
//! Readers get cloned `PeerConnection` snapshots.

use crate::network::message::{Capabilities, Frame, Handshake};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Consecutive failures before a peer is marked Degraded
pub const DEFAULT_DEGRADE_AFTER: u32 = 2;

/// Consecutive failures before a peer is closed and evicted
pub const DEFAULT_CLOSE_AFTER: u32 = 5;

/// Peer table errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("Peer not found: {0}")]
    NotFound(String),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Bridge is shut down")]
    BridgeClosed,
}

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connecting,
    Active,
    Degraded,
    Closed,
}

/// Snapshot of one established peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerConnection {
    /// Stable logical identity (the peer's instance id)
    pub peer_id: String,
    /// Address this connection was made on
    pub peer_uri: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub capabilities: Capabilities,
    pub status: PeerStatus,
    pub consecutive_failures: u32,
    /// Whether we dialed this peer
    pub outbound: bool,
    /// Public key presented at handshake (hex)
    pub public_key: String,
    /// Distinguishes reconnects of the same peer
    pub session: u64,
}

impl PeerConnection {
    pub fn from_handshake(
        peer_uri: &str,
        handshake: &Handshake,
        outbound: bool,
        session: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            peer_id: handshake.instance_id.clone(),
            peer_uri: peer_uri.to_string(),
            connected_at: now,
            last_activity: now,
            capabilities: handshake.capabilities(),
            status: PeerStatus::Connecting,
            consecutive_failures: 0,
            outbound,
            public_key: handshake.public_key.clone(),
            session,
        }
    }

    /// Active and Degraded peers still carry traffic
    pub fn is_usable(&self) -> bool {
        matches!(self.status, PeerStatus::Active | PeerStatus::Degraded)
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn connected_duration(&self, now: DateTime<Utc>) -> Duration {
        now - self.connected_at
    }
}

/// Handle for sending frames to a peer's writer task
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub peer_id: String,
    pub tx: mpsc::Sender<Frame>,
}

impl PeerHandle {
    /// Non-blocking send for use inside the event loop
    pub fn try_send(&self, frame: Frame) -> Result<(), PeerError> {
        self.tx.try_send(frame).map_err(|_| PeerError::Disconnected)
    }
}

/// Result of recording activity for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    /// The peer is not in the table
    Unknown,
    Updated,
    /// Came back from Degraded
    Recovered,
    Degraded,
    /// Crossed the close threshold and was evicted
    Closed,
}

struct PeerEntry {
    connection: PeerConnection,
    handle: PeerHandle,
    tasks: Vec<AbortHandle>,
}

impl PeerEntry {
    fn shutdown(mut self) -> PeerConnection {
        for task in &self.tasks {
            task.abort();
        }
        self.connection.status = PeerStatus::Closed;
        self.connection
    }
}

/// Owns the table of peer connections
pub struct ConnectionManager {
    peers: HashMap<String, PeerEntry>,
    /// Peer ids in establishment order
    order: Vec<String>,
    degrade_after: u32,
    close_after: u32,
    next_session: u64,
}

impl ConnectionManager {
    pub fn new(degrade_after: u32, close_after: u32) -> Self {
        Self {
            peers: HashMap::new(),
            order: Vec::new(),
            degrade_after: degrade_after.max(1),
            close_after: close_after.max(degrade_after.max(1)),
            next_session: 1,
        }
    }

    /// Allocate a session number for a new connection
    pub fn next_session(&mut self) -> u64 {
        let session = self.next_session;
        self.next_session += 1;
        session
    }

    /// Add a freshly handshaken connection and mark it Active.
    ///
    /// An existing connection for the same peer id is closed and returned.
    pub fn insert(
        &mut self,
        mut connection: PeerConnection,
        handle: PeerHandle,
        tasks: Vec<AbortHandle>,
    ) -> Option<PeerConnection> {
        let peer_id = connection.peer_id.clone();
        let replaced = self.evict(&peer_id);

        connection.status = PeerStatus::Active;
        log::info!(
            "Added peer: {} at {} (outbound: {}, session: {})",
            peer_id,
            connection.peer_uri,
            connection.outbound,
            connection.session
        );

        self.order.push(peer_id.clone());
        self.peers.insert(
            peer_id,
            PeerEntry {
                connection,
                handle,
                tasks,
            },
        );

        replaced
    }

    /// Get peer info
    pub fn get_connection(&self, peer_id: &str) -> Result<PeerConnection, PeerError> {
        self.peers
            .get(peer_id)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| PeerError::NotFound(peer_id.to_string()))
    }

    /// Find a usable connection dialed on `peer_uri`
    pub fn find_by_uri(&self, peer_uri: &str) -> Option<PeerConnection> {
        self.order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .map(|entry| &entry.connection)
            .find(|conn| conn.peer_uri == peer_uri && conn.is_usable())
            .cloned()
    }

    /// Writer handle for a usable peer
    pub fn handle(&self, peer_id: &str) -> Result<PeerHandle, PeerError> {
        match self.peers.get(peer_id) {
            Some(entry) if entry.connection.is_usable() => Ok(entry.handle.clone()),
            _ => Err(PeerError::NotFound(peer_id.to_string())),
        }
    }

    /// Usable connections in establishment order
    pub fn list_active(&self) -> Vec<PeerConnection> {
        self.order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter(|entry| entry.connection.is_usable())
            .map(|entry| entry.connection.clone())
            .collect()
    }

    /// Get peer count
    pub fn active_count(&self) -> usize {
        self.peers
            .values()
            .filter(|entry| entry.connection.is_usable())
            .count()
    }

    /// Record the result of an exchange with a peer
    pub fn mark_activity(&mut self, peer_id: &str, success: bool) -> ActivityOutcome {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return ActivityOutcome::Unknown;
        };
        let conn = &mut entry.connection;

        if success {
            conn.last_activity = conn.last_activity.max(Utc::now());
            conn.consecutive_failures = 0;
            if conn.status == PeerStatus::Degraded {
                conn.status = PeerStatus::Active;
                log::info!("Peer {} recovered", peer_id);
                return ActivityOutcome::Recovered;
            }
            return ActivityOutcome::Updated;
        }

        conn.consecutive_failures += 1;
        let failures = conn.consecutive_failures;

        if failures >= self.close_after {
            log::warn!(
                "Peer {} failed {} times in a row, closing",
                peer_id,
                failures
            );
            self.evict(peer_id);
            return ActivityOutcome::Closed;
        }

        if failures >= self.degrade_after && conn.status == PeerStatus::Active {
            conn.status = PeerStatus::Degraded;
            log::warn!("Peer {} degraded after {} failures", peer_id, failures);
            return ActivityOutcome::Degraded;
        }

        ActivityOutcome::Updated
    }

    /// Explicit disconnect; unknown peers are a no-op
    pub fn close(&mut self, peer_id: &str) -> Option<PeerConnection> {
        let closed = self.evict(peer_id);
        if closed.is_some() {
            log::info!("Closed peer: {}", peer_id);
        }
        closed
    }

    /// Close a peer only if `session` is still the current connection.
    ///
    /// Used when a transport ends so a stale reader cannot evict a
    /// connection that replaced it.
    pub fn close_session(&mut self, peer_id: &str, session: u64) -> Option<PeerConnection> {
        match self.peers.get(peer_id) {
            Some(entry) if entry.connection.session == session => self.close(peer_id),
            _ => None,
        }
    }

    /// Close every peer
    pub fn close_all(&mut self) -> usize {
        let ids: Vec<String> = self.order.clone();
        ids.iter().filter(|id| self.close(id).is_some()).count()
    }

    fn evict(&mut self, peer_id: &str) -> Option<PeerConnection> {
        let entry = self.peers.remove(peer_id)?;
        self.order.retain(|id| id != peer_id);
        Some(entry.shutdown())
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_DEGRADE_AFTER, DEFAULT_CLOSE_AFTER)
    }
}
