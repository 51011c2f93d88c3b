//! Knowledge synchronization with peers
//!
//! Builds typed messages for the bridge's sync operations, sends them to one
//! peer or fans them out to every active peer, and installs the handlers that
//! answer the same operations when a peer sends them to us.

use crate::network::message::{Ack, Capabilities, CodecError, Message, MessageType};
use crate::network::node::BridgeHandle;
use crate::network::peer::{PeerConnection, PeerError};
use crate::network::router::{HandlerError, HandlerReply, MessageHandler, RouterError};
use crate::storage::{JournalKind, KnowledgeEntry, KnowledgeStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Sync errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("Peer {peer_id} does not advertise {capability}")]
    CapabilityMissing { peer_id: String, capability: String },
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<PeerError> for SyncError {
    fn from(e: PeerError) -> Self {
        let router = match e {
            PeerError::NotFound(peer_id) => RouterError::NotFound(peer_id),
            PeerError::Disconnected => RouterError::Disconnected(String::new()),
            PeerError::BridgeClosed => RouterError::BridgeClosed,
        };
        SyncError::Router(router)
    }
}

/// Produces replies to support requests
#[async_trait]
pub trait SupportResponder: Send + Sync {
    async fn chat(&self, message: &str, character: &str) -> Result<String, HandlerError>;
}

/// Result of a knowledge sync with one peer
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub peer_id: String,
    pub category: Option<String>,
    /// Lower bound used to select entries, if any
    pub since: Option<DateTime<Utc>>,
    pub entries_sent: usize,
    /// How many entries the peer reported as new
    pub entries_imported: Option<u64>,
    pub synced_at: DateTime<Utc>,
}

/// What happened to a broadcast at one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PeerOutcome {
    Delivered { response: Option<Value> },
    Failed { error: String },
    /// Not sent: the peer lacks the capability
    Skipped { reason: String },
}

impl PeerOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PeerOutcome::Delivered { .. })
    }
}

/// Per-peer outcomes of a broadcast
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    pub message_type: String,
    pub outcomes: BTreeMap<String, PeerOutcome>,
}

impl BroadcastReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn notified(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_delivered()).count()
    }

    /// Peers that were not notified, with the reason
    pub fn failures(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(peer, outcome)| match outcome {
                PeerOutcome::Delivered { .. } => None,
                PeerOutcome::Failed { error } => Some((peer.as_str(), error.as_str())),
                PeerOutcome::Skipped { reason } => Some((peer.as_str(), reason.as_str())),
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        format!("{} of {} peers notified", self.notified(), self.total())
    }
}

/// An emergency support broadcast
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyRequest {
    pub request_id: String,
    pub report: BroadcastReport,
}

fn text<'a>(value: &'a Value, key: &str, default: &'a str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or(default)
}

fn number(value: &Value, key: &str, default: f64) -> f64 {
    value.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Milestone payload with defaults filled in
pub fn milestone_payload(milestone: &Value, facility: &str, now: DateTime<Utc>) -> Value {
    json!({
        "title": text(milestone, "title", "Evolutionary Milestone"),
        "description": milestone.get("description").cloned().unwrap_or(Value::Null),
        "significance": text(milestone, "significance", "high"),
        "biological_impact": text(milestone, "biological_impact", "unknown"),
        "technological_advancement": milestone
            .get("tech_advancement")
            .or_else(|| milestone.get("technological_advancement"))
            .and_then(Value::as_str)
            .unwrap_or("significant"),
        "future_implications": milestone
            .get("future_implications")
            .cloned()
            .unwrap_or_else(|| json!([])),
        "importance_score": number(milestone, "importance_score", 0.9),
        "research_facility": facility,
        "ai_contribution": text(milestone, "ai_contribution", "Analysis and Documentation"),
        "timestamp": now,
        "milestone_data": milestone,
    })
}

/// Facility update payload with defaults filled in
pub fn facility_payload(
    sync_type: Option<&str>,
    data: &Value,
    facility: &str,
    now: DateTime<Utc>,
) -> Value {
    let update_type = sync_type.unwrap_or_else(|| text(data, "update_type", "research_update"));
    json!({
        "update_type": update_type,
        "content": data.get("content").cloned().unwrap_or_else(|| data.clone()),
        "research_domain": text(data, "research_domain", "general"),
        "evolutionary_stage": text(data, "evolutionary_stage", "development"),
        "importance_score": number(data, "importance_score", 0.8),
        "facility": facility,
        "timestamp": now,
    })
}

/// Emergency request payload; the request id is derived from `now`
pub fn emergency_payload(
    emergency_type: &str,
    description: &str,
    severity: Option<&str>,
    requesting_ai: &str,
    facility: &str,
    now: DateTime<Utc>,
) -> Value {
    json!({
        "request_type": "emergency_support",
        "emergency_type": emergency_type,
        "description": description,
        "severity": severity.unwrap_or("high"),
        "requesting_ai": requesting_ai,
        "facility": facility,
        "timestamp": now,
        "request_id": format!("emergency_{}", now.timestamp()),
    })
}

/// Synchronization operations over a running bridge
#[derive(Clone)]
pub struct SyncEngine {
    bridge: BridgeHandle,
    store: Arc<dyn KnowledgeStore>,
    responder: Option<Arc<dyn SupportResponder>>,
}

impl SyncEngine {
    pub fn new(bridge: BridgeHandle, store: Arc<dyn KnowledgeStore>) -> Self {
        Self {
            bridge,
            store,
            responder: None,
        }
    }

    pub fn with_responder(mut self, responder: Arc<dyn SupportResponder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn bridge(&self) -> &BridgeHandle {
        &self.bridge
    }

    pub fn store(&self) -> &Arc<dyn KnowledgeStore> {
        &self.store
    }

    /// Resolve a peer and check it advertised what `message_type` needs
    async fn target(
        &self,
        peer_id: &str,
        message_type: &MessageType,
    ) -> Result<PeerConnection, SyncError> {
        let peer = self.bridge.get_connection(peer_id).await?;
        if let Some(required) = message_type.required_capability() {
            if !peer.supports(required) {
                return Err(SyncError::CapabilityMissing {
                    peer_id: peer_id.to_string(),
                    capability: required.to_tags().join(","),
                });
            }
        }
        Ok(peer)
    }

    async fn deliver(
        &self,
        peer_id: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Result<Ack, SyncError> {
        self.target(peer_id, &message_type).await?;
        let message = self.bridge.identity().message(message_type, payload)?;
        let timeout = self.bridge.config().send_timeout();
        Ok(self.bridge.send(peer_id, message, timeout).await?)
    }

    /// Ok(false) when the message could not be delivered or was refused
    async fn deliver_flag(
        &self,
        peer_id: &str,
        message_type: MessageType,
        payload: Value,
    ) -> Result<bool, SyncError> {
        let name = message_type.to_string();
        match self.deliver(peer_id, message_type, payload).await {
            Ok(_) => Ok(true),
            Err(SyncError::Router(e)) if e.is_delivery_failure() => {
                log::warn!("{} to {} not delivered: {}", name, peer_id, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Push local knowledge to one peer.
    ///
    /// With a category, every entry in it is sent. Without one, every entry
    /// updated since the last successful sync with this peer is sent. The
    /// message is stamped before entries are selected, and that stamp becomes
    /// the peer's sync watermark once it acks.
    pub async fn sync_knowledge_to_peer(
        &self,
        peer_id: &str,
        category: Option<&str>,
    ) -> Result<SyncResult, SyncError> {
        let since = match category {
            Some(_) => None,
            None => self
                .bridge
                .statistics()
                .await
                .map_err(|_| RouterError::BridgeClosed)?
                .last_sync(peer_id),
        };

        self.target(peer_id, &MessageType::KnowledgeSync).await?;
        let message = self
            .bridge
            .identity()
            .message(MessageType::KnowledgeSync, Value::Null)?;

        let entries = self.store.entries(category, since)?;
        let entries_sent = entries.len();
        let message = message.with_payload(json!({
            "category": category,
            "since": since,
            "entry_count": entries_sent,
            "entries": entries,
        }));

        let timeout = self.bridge.config().send_timeout();
        let ack = self.bridge.send(peer_id, message, timeout).await?;
        let entries_imported = ack
            .response
            .as_ref()
            .and_then(|r| r.get("imported"))
            .and_then(Value::as_u64);

        log::info!(
            "Synced {} entries ({}) to {}",
            entries_sent,
            category.unwrap_or("all categories"),
            peer_id
        );

        Ok(SyncResult {
            peer_id: peer_id.to_string(),
            category: category.map(str::to_string),
            since,
            entries_sent,
            entries_imported,
            synced_at: Utc::now(),
        })
    }

    pub async fn share_experience_with_peer(
        &self,
        peer_id: &str,
        experience: Value,
    ) -> Result<bool, SyncError> {
        self.deliver_flag(peer_id, MessageType::ExperienceShare, experience)
            .await
    }

    pub async fn report_error_to_peer(
        &self,
        peer_id: &str,
        error_data: Value,
    ) -> Result<bool, SyncError> {
        self.deliver_flag(peer_id, MessageType::ErrorReport, error_data)
            .await
    }

    pub async fn request_support_from_peer(
        &self,
        peer_id: &str,
        request: Value,
    ) -> Result<bool, SyncError> {
        self.deliver_flag(peer_id, MessageType::SupportRequest, request)
            .await
    }

    /// Ask a peer for support and return its reply text, if it produced one
    pub async fn request_support_with_reply(
        &self,
        peer_id: &str,
        request: Value,
    ) -> Result<Option<String>, SyncError> {
        let ack = self
            .deliver(peer_id, MessageType::SupportRequest, request)
            .await?;
        Ok(ack
            .response
            .as_ref()
            .and_then(|r| r.get("reply"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Send to every active peer concurrently, each with its own timeout.
    ///
    /// Never fails because of a peer; failures are reported per peer.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        payload: Value,
    ) -> Result<BroadcastReport, SyncError> {
        if !message_type.is_known() {
            return Err(RouterError::UnknownMessageType(message_type.to_string()).into());
        }

        let peers = self.bridge.list_active().await;
        let timeout = self.bridge.config().send_timeout();
        let required = message_type.required_capability();

        let sends = peers.into_iter().map(|peer| {
            let message_type = message_type.clone();
            let payload = payload.clone();
            async move {
                let outcome = match required.filter(|c| !peer.supports(*c)) {
                    Some(missing) => PeerOutcome::Skipped {
                        reason: format!("missing capability {}", missing.to_tags().join(",")),
                    },
                    None => self.send_one(&peer.peer_id, message_type, payload, timeout).await,
                };
                (peer.peer_id, outcome)
            }
        });

        let report = BroadcastReport {
            message_type: message_type.to_string(),
            outcomes: join_all(sends).await.into_iter().collect(),
        };

        log::info!("Broadcast {}: {}", report.message_type, report.summary());
        for (peer, reason) in report.failures() {
            log::warn!("Broadcast {} to {} failed: {}", report.message_type, peer, reason);
        }

        Ok(report)
    }

    async fn send_one(
        &self,
        peer_id: &str,
        message_type: MessageType,
        payload: Value,
        timeout: std::time::Duration,
    ) -> PeerOutcome {
        // Each peer gets its own message id so acks match one send
        let message = match self.bridge.identity().message(message_type, payload) {
            Ok(message) => message,
            Err(e) => {
                return PeerOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        match self.bridge.send(peer_id, message, timeout).await {
            Ok(ack) => PeerOutcome::Delivered {
                response: ack.response,
            },
            Err(e) => PeerOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    pub async fn share_milestone(&self, milestone: &Value) -> Result<BroadcastReport, SyncError> {
        let payload = milestone_payload(milestone, &self.bridge.config().facility, Utc::now());
        self.broadcast(MessageType::EvolutionaryMilestone, payload)
            .await
    }

    pub async fn sync_facility_update(
        &self,
        sync_type: Option<&str>,
        data: &Value,
    ) -> Result<BroadcastReport, SyncError> {
        let payload = facility_payload(
            sync_type,
            data,
            &self.bridge.config().facility,
            Utc::now(),
        );
        self.broadcast(MessageType::TelstpUpdate, payload).await
    }

    pub async fn request_emergency_support(
        &self,
        emergency_type: &str,
        description: &str,
        severity: Option<&str>,
    ) -> Result<EmergencyRequest, SyncError> {
        let payload = emergency_payload(
            emergency_type,
            description,
            severity,
            self.bridge.instance_id(),
            &self.bridge.config().facility,
            Utc::now(),
        );
        let request_id = text(&payload, "request_id", "").to_string();
        log::warn!("Requesting emergency support {}: {}", request_id, description);

        let report = self.broadcast(MessageType::SupportRequest, payload).await?;
        Ok(EmergencyRequest { request_id, report })
    }

    /// Register the handlers that answer peers' sync traffic
    pub async fn install_handlers(&self) {
        let bridge = &self.bridge;

        bridge
            .register_handler(
                MessageType::KnowledgeSync,
                Arc::new(KnowledgeImportHandler {
                    store: self.store.clone(),
                }),
            )
            .await;

        let journaled = [
            (MessageType::ExperienceShare, JournalKind::Experience),
            (MessageType::ErrorReport, JournalKind::ErrorReport),
            (MessageType::EvolutionaryMilestone, JournalKind::Milestone),
            (MessageType::TelstpUpdate, JournalKind::FacilityUpdate),
        ];
        for (message_type, kind) in journaled {
            bridge
                .register_handler(
                    message_type,
                    Arc::new(JournalHandler {
                        store: self.store.clone(),
                        kind,
                    }),
                )
                .await;
        }

        bridge
            .register_handler(
                MessageType::SupportRequest,
                Arc::new(SupportHandler {
                    store: self.store.clone(),
                    responder: self.responder.clone(),
                }),
            )
            .await;

        bridge
            .register_handler(
                MessageType::HealthCheck,
                Arc::new(HealthCheckHandler {
                    instance_id: bridge.instance_id().to_string(),
                    capabilities: bridge.identity().capabilities(),
                    started: Instant::now(),
                }),
            )
            .await;

        log::debug!("Installed sync handlers on {}", bridge.instance_id());
    }
}

fn store_failure(e: StoreError) -> HandlerError {
    HandlerError::Failed(e.to_string())
}

struct KnowledgeImportHandler {
    store: Arc<dyn KnowledgeStore>,
}

#[async_trait]
impl MessageHandler for KnowledgeImportHandler {
    async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError> {
        let entries: Vec<KnowledgeEntry> = match message.payload().get("entries") {
            Some(entries) => serde_json::from_value(entries.clone())
                .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?,
            None => Vec::new(),
        };
        let received = entries.len();

        let imported = self
            .store
            .import(message.sender_id(), entries)
            .map_err(store_failure)?;
        log::info!(
            "Imported {} of {} entries from {}",
            imported,
            received,
            message.sender_id()
        );

        Ok(HandlerReply::Response(json!({ "imported": imported })))
    }
}

struct JournalHandler {
    store: Arc<dyn KnowledgeStore>,
    kind: JournalKind,
}

#[async_trait]
impl MessageHandler for JournalHandler {
    async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError> {
        log::info!("Received {} from {}", self.kind, message.sender_id());
        self.store
            .record(message.sender_id(), self.kind, message.payload().clone())
            .map_err(store_failure)?;
        Ok(HandlerReply::Done)
    }
}

struct SupportHandler {
    store: Arc<dyn KnowledgeStore>,
    responder: Option<Arc<dyn SupportResponder>>,
}

#[async_trait]
impl MessageHandler for SupportHandler {
    async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError> {
        let payload = message.payload();
        self.store
            .record(message.sender_id(), JournalKind::SupportRequest, payload.clone())
            .map_err(store_failure)?;

        let Some(responder) = &self.responder else {
            return Ok(HandlerReply::Done);
        };

        let prompt = payload
            .get("description")
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        let character = text(payload, "character", "support");

        let reply = responder.chat(&prompt, character).await?;
        Ok(HandlerReply::Response(json!({ "reply": reply })))
    }
}

struct HealthCheckHandler {
    instance_id: String,
    capabilities: Capabilities,
    started: Instant,
}

#[async_trait]
impl MessageHandler for HealthCheckHandler {
    async fn handle(&self, _message: Message) -> Result<HandlerReply, HandlerError> {
        Ok(HandlerReply::Response(json!({
            "status": "alive",
            "instance_id": self.instance_id,
            "capabilities": self.capabilities,
            "uptime_secs": self.started.elapsed().as_secs(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::PeerStatus;
    use crate::storage::MemoryKnowledgeStore;
    use crate::test_support::{silent_peer, start_with, test_config};

    struct EchoResponder;

    #[async_trait]
    impl SupportResponder for EchoResponder {
        async fn chat(&self, message: &str, character: &str) -> Result<String, HandlerError> {
            Ok(format!("[{}] {}", character, message))
        }
    }

    async fn node(id: &str) -> (SyncEngine, Arc<MemoryKnowledgeStore>) {
        node_with(test_config(id)).await
    }

    async fn node_with(
        config: crate::config::BridgeConfig,
    ) -> (SyncEngine, Arc<MemoryKnowledgeStore>) {
        let store = Arc::new(MemoryKnowledgeStore::new());
        let bridge = start_with(config).await;
        let engine = SyncEngine::new(bridge, store.clone()).with_responder(Arc::new(EchoResponder));
        engine.install_handlers().await;
        (engine, store)
    }

    async fn link(from: &SyncEngine, to: &SyncEngine) {
        let uri = to.bridge().listen_addr().unwrap().to_string();
        from.bridge().establish_connection(&uri).await.unwrap();
    }

    #[test]
    fn test_milestone_defaults() {
        let now = Utc::now();
        let payload = milestone_payload(&json!({"description": "first flight"}), "Lab", now);

        assert_eq!(payload["title"], "Evolutionary Milestone");
        assert_eq!(payload["significance"], "high");
        assert_eq!(payload["biological_impact"], "unknown");
        assert_eq!(payload["technological_advancement"], "significant");
        assert_eq!(payload["future_implications"], json!([]));
        assert_eq!(payload["importance_score"], 0.9);
        assert_eq!(payload["research_facility"], "Lab");
        assert_eq!(payload["ai_contribution"], "Analysis and Documentation");

        let custom = milestone_payload(
            &json!({
                "title": "T",
                "importance_score": 0.5,
                "tech_advancement": "modest",
                "ai_contribution": "pattern search",
            }),
            "Lab",
            now,
        );
        assert_eq!(custom["title"], "T");
        assert_eq!(custom["importance_score"], 0.5);
        assert_eq!(custom["technological_advancement"], "modest");
        assert_eq!(custom["ai_contribution"], "pattern search");

        let long_key = milestone_payload(
            &json!({"technological_advancement": "breakthrough"}),
            "Lab",
            now,
        );
        assert_eq!(long_key["technological_advancement"], "breakthrough");
    }

    #[test]
    fn test_facility_and_emergency_defaults() {
        let now = Utc::now();
        let update = facility_payload(None, &json!({"content": "new wing"}), "Lab", now);
        assert_eq!(update["update_type"], "research_update");
        assert_eq!(update["content"], "new wing");
        assert_eq!(update["research_domain"], "general");
        assert_eq!(update["evolutionary_stage"], "development");
        assert_eq!(update["importance_score"], 0.8);

        let typed = facility_payload(Some("equipment"), &json!({}), "Lab", now);
        assert_eq!(typed["update_type"], "equipment");

        let emergency = emergency_payload("outage", "power lost", None, "alpha", "Lab", now);
        assert_eq!(emergency["request_type"], "emergency_support");
        assert_eq!(emergency["severity"], "high");
        assert_eq!(
            emergency["request_id"],
            format!("emergency_{}", now.timestamp())
        );
    }

    #[test]
    fn test_report_summary() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert("alpha".to_string(), PeerOutcome::Delivered { response: None });
        outcomes.insert(
            "bravo".to_string(),
            PeerOutcome::Failed {
                error: "timed out".to_string(),
            },
        );
        let report = BroadcastReport {
            message_type: "experience_share".to_string(),
            outcomes,
        };

        assert_eq!(report.summary(), "1 of 2 peers notified");
        assert_eq!(report.failures(), vec![("bravo", "timed out")]);
    }

    #[tokio::test]
    async fn test_category_sync_reaches_only_target() {
        let (hub, hub_store) = node("hub").await;
        let (alpha, alpha_store) = node("alpha").await;
        let (bravo, bravo_store) = node("bravo").await;
        link(&hub, &alpha).await;
        link(&hub, &bravo).await;

        hub_store
            .upsert(KnowledgeEntry::new("biology", "Cells", "Cells divide"))
            .unwrap();
        hub_store
            .upsert(KnowledgeEntry::new("physics", "Gravity", "Things fall"))
            .unwrap();

        let result = hub
            .sync_knowledge_to_peer("bravo", Some("biology"))
            .await
            .unwrap();
        assert_eq!(result.entries_sent, 1);
        assert_eq!(result.entries_imported, Some(1));

        let received = bravo_store.entries(None, None).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].category, "biology");
        assert!(alpha_store.entries(None, None).unwrap().is_empty());

        let stats = hub.bridge().statistics().await.unwrap();
        assert!(stats.last_sync("bravo").is_some());
        assert!(stats.last_sync("alpha").is_none());
        assert_eq!(stats.per_type["knowledge_sync"].sent, 1);

        for engine in [&hub, &alpha, &bravo] {
            engine.bridge().shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_incremental_sync_sends_only_newer_entries() {
        let (hub, hub_store) = node("hub").await;
        let (bravo, bravo_store) = node("bravo").await;
        link(&hub, &bravo).await;

        hub_store
            .upsert(KnowledgeEntry::new("biology", "Cells", "Cells divide"))
            .unwrap();
        let first = hub.sync_knowledge_to_peer("bravo", None).await.unwrap();
        assert_eq!(first.entries_sent, 1);
        assert!(first.since.is_none());

        let second = hub.sync_knowledge_to_peer("bravo", None).await.unwrap();
        assert_eq!(second.entries_sent, 0);
        assert!(second.since.is_some());

        assert_eq!(bravo_store.entries(None, None).unwrap().len(), 1);
        hub.bridge().shutdown().await;
        bravo.bridge().shutdown().await;
    }

    /// Imports after a delay, like a peer with a slow store
    struct SlowImport(KnowledgeImportHandler);

    #[async_trait]
    impl MessageHandler for SlowImport {
        async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError> {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            self.0.handle(message).await
        }
    }

    #[tokio::test]
    async fn test_entry_written_during_sync_is_sent_next_time() {
        let (hub, hub_store) = node("hub").await;
        let (bravo, bravo_store) = node("bravo").await;
        let slow_store: Arc<dyn KnowledgeStore> = bravo_store.clone();
        bravo
            .bridge()
            .register_handler(
                MessageType::KnowledgeSync,
                Arc::new(SlowImport(KnowledgeImportHandler { store: slow_store })),
            )
            .await;
        link(&hub, &bravo).await;

        hub_store
            .upsert(KnowledgeEntry::new("biology", "Cells", "Cells divide"))
            .unwrap();
        let (first, _) = tokio::join!(hub.sync_knowledge_to_peer("bravo", None), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            hub_store
                .upsert(KnowledgeEntry::new("biology", "Mitosis", "Written mid-sync"))
                .unwrap();
        });
        assert_eq!(first.unwrap().entries_sent, 1);

        let second = hub.sync_knowledge_to_peer("bravo", None).await.unwrap();
        assert_eq!(second.entries_sent, 1);
        let titles: Vec<String> = bravo_store
            .entries(None, None)
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles.len(), 2);
        assert!(titles.contains(&"Mitosis".to_string()));

        hub.bridge().shutdown().await;
        bravo.bridge().shutdown().await;
    }

    #[tokio::test]
    async fn test_targeted_operations() {
        let (hub, _) = node("hub").await;
        let (bravo, bravo_store) = node("bravo").await;
        link(&hub, &bravo).await;

        assert!(hub
            .share_experience_with_peer("bravo", json!({"lesson": "cache results"}))
            .await
            .unwrap());
        assert!(hub
            .report_error_to_peer("bravo", json!({"error": "timeout"}))
            .await
            .unwrap());
        assert_eq!(bravo_store.journal(Some(JournalKind::Experience)).unwrap().len(), 1);
        assert_eq!(bravo_store.journal(Some(JournalKind::ErrorReport)).unwrap().len(), 1);

        let reply = hub
            .request_support_with_reply("bravo", json!({"description": "stuck"}))
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("[support] stuck"));

        let missing = hub.share_experience_with_peer("nobody", json!({})).await;
        assert!(matches!(
            missing,
            Err(SyncError::Router(RouterError::NotFound(_)))
        ));

        hub.bridge().shutdown().await;
        bravo.bridge().shutdown().await;
    }

    #[tokio::test]
    async fn test_capability_missing() {
        let (hub, _) = node("hub").await;
        let mut config = test_config("bravo");
        config.capabilities = Capabilities::HEALTH_CHECK;
        let (bravo, _) = node_with(config).await;
        link(&hub, &bravo).await;

        let result = hub.report_error_to_peer("bravo", json!({})).await;
        assert!(matches!(result, Err(SyncError::CapabilityMissing { .. })));

        let report = hub
            .broadcast(MessageType::ErrorReport, json!({}))
            .await
            .unwrap();
        assert_eq!(report.notified(), 0);
        assert!(matches!(
            report.outcomes["bravo"],
            PeerOutcome::Skipped { .. }
        ));

        hub.bridge().shutdown().await;
        bravo.bridge().shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let mut config = test_config("hub");
        config.send_timeout_ms = 400;
        let (hub, _) = node_with(config).await;
        let (alpha, alpha_store) = node("alpha").await;
        let (bravo, bravo_store) = node("bravo").await;
        link(&hub, &alpha).await;
        link(&hub, &bravo).await;
        let silent = silent_peer("charlie").await;
        hub.bridge().establish_connection(&silent).await.unwrap();

        let report = hub
            .share_milestone(&json!({"description": "first contact"}))
            .await
            .unwrap();

        assert_eq!(report.total(), 3);
        assert_eq!(report.notified(), 2);
        assert_eq!(report.summary(), "2 of 3 peers notified");
        let failures = report.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "charlie");

        assert_eq!(alpha_store.journal(Some(JournalKind::Milestone)).unwrap().len(), 1);
        assert_eq!(bravo_store.journal(Some(JournalKind::Milestone)).unwrap().len(), 1);

        // One timeout leaves the silent peer connected
        let charlie = hub.bridge().get_connection("charlie").await.unwrap();
        assert_eq!(charlie.status, PeerStatus::Active);

        for engine in [&hub, &alpha, &bravo] {
            engine.bridge().shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_network() {
        let (hub, _) = node("hub").await;
        let emergency = hub
            .request_emergency_support("outage", "power lost", None)
            .await
            .unwrap();

        assert!(emergency.request_id.starts_with("emergency_"));
        assert_eq!(emergency.report.summary(), "0 of 0 peers notified");
        hub.bridge().shutdown().await;
    }

    #[tokio::test]
    async fn test_last_registration_wins_over_installed_handler() {
        let (hub, _) = node("hub").await;
        let (bravo, bravo_store) = node("bravo").await;
        link(&hub, &bravo).await;

        bravo
            .bridge()
            .register_handler(
                MessageType::ErrorReport,
                crate::network::router::handler_fn(|_msg| async {
                    Ok(HandlerReply::Response(json!({"handled_by": "override"})))
                }),
            )
            .await;

        let message = hub
            .bridge()
            .identity()
            .message(MessageType::ErrorReport, json!({"error": "x"}))
            .unwrap();
        let ack = hub
            .bridge()
            .send("bravo", message, std::time::Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(ack.response, Some(json!({"handled_by": "override"})));
        assert!(bravo_store.journal(Some(JournalKind::ErrorReport)).unwrap().is_empty());

        hub.bridge().shutdown().await;
        bravo.bridge().shutdown().await;
    }
}
