//! Peer networking
//!
//! Connects cooperating bridges over TCP and synchronizes knowledge between
//! them.
//!
//! # Features
//! - Length-prefixed JSON framing
//! - Signed handshakes with version and capability negotiation
//! - Single-owner event loop with request/reply handles
//! - Per-type message handlers with acknowledgments
//! - Failure-threshold peer health
//! - Concurrent broadcast with per-peer outcomes

pub mod health;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;
pub mod server;
pub mod stats;
pub mod sync;

pub use health::{HealthMonitor, NetworkHealth, PeerHealth};
pub use message::{
    create_message, Ack, AckStatus, Capabilities, CodecError, Frame, Handshake, Message,
    MessageType, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use node::{
    Bridge, BridgeError, BridgeHandle, BridgeIdentity, BridgeSnapshot, BridgeStatus,
};
pub use peer::{
    ConnectionManager, PeerConnection, PeerError, PeerHandle, PeerStatus, DEFAULT_CLOSE_AFTER,
    DEFAULT_DEGRADE_AFTER,
};
pub use router::{
    handler_fn, HandlerError, HandlerReply, MessageHandler, MessageRouter, RouterError,
};
pub use server::{ConnectionError, FrameCodec, Server};
pub use stats::{SyncStatistics, TypeCounts};
pub use sync::{
    BroadcastReport, EmergencyRequest, PeerOutcome, SupportResponder, SyncEngine, SyncError,
    SyncResult,
};
