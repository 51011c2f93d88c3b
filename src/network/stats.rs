//! Running synchronization statistics
//!
//! Process-wide counters kept by the event loop. Callers only ever see
//! cloned snapshots.

use crate::network::message::MessageType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Counters for one message type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub sent: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub received: u64,
}

/// Snapshot of the bridge's traffic counters
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
    pub messages_sent: u64,
    pub messages_acknowledged: u64,
    pub messages_failed: u64,
    pub messages_received: u64,
    /// Acks that arrived after their sender stopped waiting
    pub late_acks: u64,
    /// Inbound messages whose handler failed
    pub handler_failures: u64,
    pub per_type: BTreeMap<String, TypeCounts>,
    /// Last successful knowledge sync per peer
    pub last_sync_time: HashMap<String, DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
}

impl SyncStatistics {
    pub fn new() -> Self {
        Self {
            messages_sent: 0,
            messages_acknowledged: 0,
            messages_failed: 0,
            messages_received: 0,
            late_acks: 0,
            handler_failures: 0,
            per_type: BTreeMap::new(),
            last_sync_time: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    fn counts(&mut self, message_type: &MessageType) -> &mut TypeCounts {
        self.per_type
            .entry(message_type.as_str().to_string())
            .or_default()
    }

    pub fn record_sent(&mut self, message_type: &MessageType) {
        self.messages_sent += 1;
        self.counts(message_type).sent += 1;
    }

    pub fn record_acknowledged(&mut self, message_type: &MessageType) {
        self.messages_acknowledged += 1;
        self.counts(message_type).acknowledged += 1;
    }

    pub fn record_failed(&mut self, message_type: &MessageType) {
        self.messages_failed += 1;
        self.counts(message_type).failed += 1;
    }

    pub fn record_received(&mut self, message_type: &MessageType) {
        self.messages_received += 1;
        self.counts(message_type).received += 1;
    }

    pub fn record_late_ack(&mut self) {
        self.late_acks += 1;
    }

    pub fn record_handler_failure(&mut self) {
        self.handler_failures += 1;
    }

    /// Advance a peer's sync watermark; an older ack never moves it back
    pub fn record_sync(&mut self, peer_id: &str, at: DateTime<Utc>) {
        self.last_sync_time
            .entry(peer_id.to_string())
            .and_modify(|t| *t = (*t).max(at))
            .or_insert(at);
    }

    pub fn last_sync(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.last_sync_time.get(peer_id).copied()
    }
}

impl Default for SyncStatistics {
    fn default() -> Self {
        Self::new()
    }
}
