//! Network health checks
//!
//! Sends a `health_check` to every active peer at once and reports who
//! answered. A failed check only counts toward the peer's failure threshold;
//! the monitor never disconnects anyone itself.

use crate::network::message::MessageType;
use crate::network::node::{BridgeError, BridgeHandle, BridgeStatus};
use crate::network::peer::PeerConnection;
use crate::network::stats::SyncStatistics;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Health check result for one peer
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeerHealth {
    CheckSent {
        last_activity: DateTime<Utc>,
        connected_duration_secs: i64,
        round_trip_ms: u64,
        response: Option<Value>,
    },
    Error {
        error: String,
    },
}

impl PeerHealth {
    pub fn is_responsive(&self) -> bool {
        matches!(self, PeerHealth::CheckSent { .. })
    }
}

/// One round of health checks
#[derive(Debug, Clone, Serialize)]
pub struct NetworkHealth {
    pub peers: BTreeMap<String, PeerHealth>,
    pub total_peers: usize,
    pub responsive_peers: usize,
    pub bridge_status: BridgeStatus,
    pub sync_statistics: SyncStatistics,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    bridge: BridgeHandle,
}

impl HealthMonitor {
    pub fn new(bridge: BridgeHandle) -> Self {
        Self { bridge }
    }

    async fn check_peer(&self, peer: &PeerConnection, timeout: Duration) -> PeerHealth {
        let message = match self
            .bridge
            .identity()
            .message(MessageType::HealthCheck, json!({ "ping": Utc::now() }))
        {
            Ok(message) => message,
            Err(e) => {
                return PeerHealth::Error {
                    error: e.to_string(),
                }
            }
        };

        let started = Instant::now();
        match self.bridge.send(&peer.peer_id, message, timeout).await {
            Ok(ack) => {
                let round_trip_ms = started.elapsed().as_millis() as u64;
                // The ack refreshed the table entry; report what it holds now
                let last_activity = self
                    .bridge
                    .get_connection(&peer.peer_id)
                    .await
                    .map(|c| c.last_activity)
                    .unwrap_or(peer.last_activity);
                let now = Utc::now();
                PeerHealth::CheckSent {
                    last_activity,
                    connected_duration_secs: peer.connected_duration(now).num_seconds(),
                    round_trip_ms,
                    response: ack.response,
                }
            }
            Err(e) => PeerHealth::Error {
                error: e.to_string(),
            },
        }
    }

    /// Check every active peer concurrently with the health timeout
    pub async fn check_network_health(&self) -> Result<NetworkHealth, BridgeError> {
        let peers = self.bridge.list_active().await;
        let timeout = self.bridge.config().health_timeout();

        let checks = peers.iter().map(|peer| async move {
            (peer.peer_id.clone(), self.check_peer(peer, timeout).await)
        });
        let results: BTreeMap<String, PeerHealth> = join_all(checks).await.into_iter().collect();

        let snapshot = self.bridge.snapshot().await?;
        let sync_statistics = self.bridge.statistics().await?;

        let responsive_peers = results.values().filter(|h| h.is_responsive()).count();
        Ok(NetworkHealth {
            total_peers: results.len(),
            responsive_peers,
            peers: results,
            bridge_status: snapshot.status,
            sync_statistics,
            checked_at: Utc::now(),
        })
    }

    /// Run a check every `interval` until the bridge shuts down
    pub fn spawn_periodic(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.check_network_health().await {
                    Ok(report) => log::info!(
                        "Health check: {} of {} peers responsive",
                        report.responsive_peers,
                        report.total_peers
                    ),
                    Err(_) => {
                        log::debug!("Bridge closed, stopping health checks");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::PeerStatus;
    use crate::network::sync::SyncEngine;
    use crate::storage::MemoryKnowledgeStore;
    use crate::test_support::{silent_peer, start_bridge};
    use std::sync::Arc;

    async fn responsive(id: &str) -> BridgeHandle {
        let bridge = start_bridge(id).await;
        SyncEngine::new(bridge.clone(), Arc::new(MemoryKnowledgeStore::new()))
            .install_handlers()
            .await;
        bridge
    }

    #[tokio::test]
    async fn test_unresponsive_peer_reported_not_evicted() {
        let hub = start_bridge("hub").await;
        let alpha = responsive("alpha").await;
        let bravo = responsive("bravo").await;

        for peer in [&alpha, &bravo] {
            let uri = peer.listen_addr().unwrap().to_string();
            hub.establish_connection(&uri).await.unwrap();
        }
        let silent = silent_peer("charlie").await;
        hub.establish_connection(&silent).await.unwrap();

        let report = HealthMonitor::new(hub.clone())
            .check_network_health()
            .await
            .unwrap();

        assert_eq!(report.total_peers, 3);
        assert_eq!(report.responsive_peers, 2);
        assert!(report.peers["alpha"].is_responsive());
        assert!(report.peers["bravo"].is_responsive());
        assert!(matches!(report.peers["charlie"], PeerHealth::Error { .. }));
        assert_eq!(report.bridge_status, BridgeStatus::Connected);

        let alpha_entry = hub.get_connection("alpha").await.unwrap();
        match &report.peers["alpha"] {
            PeerHealth::CheckSent { last_activity, .. } => {
                assert_eq!(*last_activity, alpha_entry.last_activity);
                assert!(*last_activity >= alpha_entry.connected_at);
            }
            other => panic!("alpha not checked: {:?}", other),
        }

        let charlie = hub.get_connection("charlie").await.unwrap();
        assert_eq!(charlie.status, PeerStatus::Active);
        assert_eq!(charlie.consecutive_failures, 1);

        for bridge in [&hub, &alpha, &bravo] {
            bridge.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_empty_network() {
        let hub = start_bridge("hub").await;
        let report = HealthMonitor::new(hub.clone())
            .check_network_health()
            .await
            .unwrap();

        assert_eq!(report.total_peers, 0);
        assert_eq!(report.bridge_status, BridgeStatus::Disconnected);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_stops_after_shutdown() {
        let hub = start_bridge("hub").await;
        let task = HealthMonitor::new(hub.clone()).spawn_periodic(Duration::from_millis(50));

        hub.shutdown().await;
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
