//! Peer Bridge: knowledge synchronization between cooperating AI instances
//!
//! This crate connects a small trust network of bridges over TCP and
//! provides:
//! - Signed handshakes (secp256k1) with capability negotiation
//! - Typed messages with per-message acknowledgments and timeouts
//! - Knowledge sync, experience sharing, error reports and support requests
//! - Concurrent broadcasts with per-peer outcomes
//! - Health probing with failure-threshold degradation
//! - JSON configuration and a JSON-file knowledge store
//!
//! # Example
//!
//! ```rust,no_run
//! use peer_bridge::config::BridgeConfig;
//! use peer_bridge::network::{Bridge, SyncEngine};
//! use peer_bridge::storage::MemoryKnowledgeStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = Bridge::start(BridgeConfig::default()).await?;
//! let engine = SyncEngine::new(bridge.clone(), Arc::new(MemoryKnowledgeStore::new()));
//! engine.install_handlers().await;
//!
//! let peer = bridge.establish_connection("127.0.0.1:7701").await?;
//! let result = engine.sync_knowledge_to_peer(&peer.peer_id, Some("biology")).await?;
//! println!("Sent {} entries", result.entries_sent);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use api::BridgeApi;
pub use config::BridgeConfig;
pub use crypto::KeyPair;
pub use network::{Bridge, BridgeHandle, Message, MessageType, SyncEngine};
pub use storage::{KnowledgeEntry, KnowledgeStore, MemoryKnowledgeStore};
