//! Bridge API handlers
//!
//! Plain async methods returning serializable responses, ready to be mounted
//! behind any transport.

use crate::network::health::{HealthMonitor, NetworkHealth};
use crate::network::message::{MessageType, PROTOCOL_VERSION};
use crate::network::node::{BridgeError, BridgeHandle, BridgeStatus};
use crate::network::sync::{BroadcastReport, EmergencyRequest, SyncEngine, SyncError, SyncResult};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Application-facing entry point to a running bridge
#[derive(Clone)]
pub struct BridgeApi {
    bridge: BridgeHandle,
    engine: SyncEngine,
    health: HealthMonitor,
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub status: String,
    pub connected_peers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeConfigView {
    pub instance_id: String,
    pub status: String,
    pub capabilities: Vec<String>,
    pub registered_message_types: Vec<String>,
    pub supported_message_types: Vec<String>,
    pub protocol_version: String,
    pub encryption_enabled: bool,
    pub listen_addr: Option<String>,
    pub public_key_fingerprint: String,
    pub facility: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Peer {peer_id} did not accept {message_type}")]
    NotDelivered {
        peer_id: String,
        message_type: String,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

fn delivered(ok: bool, peer_id: &str, message_type: MessageType) -> ApiResult<()> {
    if ok {
        Ok(())
    } else {
        Err(ApiError::NotDelivered {
            peer_id: peer_id.to_string(),
            message_type: message_type.to_string(),
        })
    }
}

impl BridgeApi {
    pub fn new(engine: SyncEngine) -> Self {
        let bridge = engine.bridge().clone();
        Self {
            health: HealthMonitor::new(bridge.clone()),
            bridge,
            engine,
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn get_connection_status(&self) -> ConnectionStatus {
        match self.bridge.snapshot().await {
            Ok(snapshot) => ConnectionStatus {
                status: snapshot.status.as_str().to_string(),
                connected_peers: snapshot.connected_peers,
            },
            Err(_) => ConnectionStatus {
                status: BridgeStatus::ShuttingDown.as_str().to_string(),
                connected_peers: 0,
            },
        }
    }

    pub async fn establish_connection(&self, peer_uri: &str) -> bool {
        match self.bridge.establish_connection(peer_uri).await {
            Ok(connection) => {
                log::info!("Connected to {} at {}", connection.peer_id, peer_uri);
                true
            }
            Err(e) => {
                log::error!("Failed to connect to {}: {}", peer_uri, e);
                false
            }
        }
    }

    pub async fn sync_knowledge_to_peer(
        &self,
        peer_id: &str,
        category: Option<&str>,
    ) -> ApiResult<SyncResult> {
        Ok(self.engine.sync_knowledge_to_peer(peer_id, category).await?)
    }

    pub async fn share_experience_with_peer(&self, peer_id: &str, experience: Value) -> ApiResult<()> {
        let ok = self
            .engine
            .share_experience_with_peer(peer_id, experience)
            .await?;
        delivered(ok, peer_id, MessageType::ExperienceShare)
    }

    pub async fn report_error_to_peer(&self, peer_id: &str, error_data: Value) -> ApiResult<()> {
        let ok = self.engine.report_error_to_peer(peer_id, error_data).await?;
        delivered(ok, peer_id, MessageType::ErrorReport)
    }

    pub async fn request_support_from_peer(&self, peer_id: &str, request: Value) -> ApiResult<()> {
        let ok = self
            .engine
            .request_support_from_peer(peer_id, request)
            .await?;
        delivered(ok, peer_id, MessageType::SupportRequest)
    }

    pub async fn check_network_health(&self) -> ApiResult<NetworkHealth> {
        Ok(self.health.check_network_health().await?)
    }

    pub async fn get_bridge_config(&self) -> ApiResult<BridgeConfigView> {
        let snapshot = self.bridge.snapshot().await?;
        let identity = self.bridge.identity();

        Ok(BridgeConfigView {
            instance_id: snapshot.instance_id,
            status: snapshot.status.as_str().to_string(),
            capabilities: identity.capabilities().to_tags(),
            registered_message_types: snapshot.registered_types,
            supported_message_types: MessageType::KNOWN
                .iter()
                .map(|t| t.as_str().to_string())
                .collect(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            encryption_enabled: false,
            listen_addr: snapshot.listen_addr,
            public_key_fingerprint: identity.fingerprint(),
            facility: self.bridge.config().facility.clone(),
        })
    }

    pub async fn share_milestone(&self, milestone: &Value) -> ApiResult<BroadcastReport> {
        Ok(self.engine.share_milestone(milestone).await?)
    }

    pub async fn sync_facility_update(
        &self,
        sync_type: Option<&str>,
        data: &Value,
    ) -> ApiResult<BroadcastReport> {
        Ok(self.engine.sync_facility_update(sync_type, data).await?)
    }

    pub async fn request_emergency_support(
        &self,
        emergency_type: &str,
        description: &str,
        severity: Option<&str>,
    ) -> ApiResult<EmergencyRequest> {
        Ok(self
            .engine
            .request_emergency_support(emergency_type, description, severity)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKnowledgeStore;
    use crate::test_support::start_bridge;
    use serde_json::json;
    use std::sync::Arc;

    async fn api(id: &str) -> BridgeApi {
        let engine = SyncEngine::new(start_bridge(id).await, Arc::new(MemoryKnowledgeStore::new()));
        engine.install_handlers().await;
        BridgeApi::new(engine)
    }

    #[tokio::test]
    async fn test_status_follows_connections() {
        let alpha = api("alpha").await;
        let bravo = api("bravo").await;

        let status = alpha.get_connection_status().await;
        assert_eq!(status.status, "disconnected");
        assert_eq!(status.connected_peers, 0);

        let uri = bravo.bridge.listen_addr().unwrap().to_string();
        assert!(alpha.establish_connection(&uri).await);
        assert!(!alpha.establish_connection("127.0.0.1:1").await);

        let status = alpha.get_connection_status().await;
        assert_eq!(status.status, "connected");
        assert_eq!(status.connected_peers, 1);

        alpha
            .share_experience_with_peer("bravo", json!({"lesson": "retry later"}))
            .await
            .unwrap();

        alpha.bridge.shutdown().await;
        bravo.bridge.shutdown().await;
        assert_eq!(alpha.get_connection_status().await.status, "shutting_down");
    }

    #[tokio::test]
    async fn test_bridge_config_view() {
        let alpha = api("alpha").await;
        let view = alpha.get_bridge_config().await.unwrap();

        assert_eq!(view.instance_id, "alpha");
        assert_eq!(view.protocol_version, PROTOCOL_VERSION);
        assert!(!view.encryption_enabled);
        assert_eq!(view.supported_message_types.len(), 7);
        assert!(view
            .registered_message_types
            .contains(&"knowledge_sync".to_string()));
        assert_eq!(view.capabilities.len(), 7);

        let as_json = serde_json::to_value(&view).unwrap();
        assert_eq!(as_json["status"], "disconnected");
        alpha.bridge.shutdown().await;
    }
}
