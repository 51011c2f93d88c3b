//! Wire message types for peer synchronization
//!
//! Defines the message envelope exchanged between bridges, the handshake,
//! acknowledgments, and the frames that carry them over a connection.

use crate::crypto::hash::sha256_fields;
use crate::crypto::{public_key_from_hex, KeyError, KeyPair};
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol version carried by every message and handshake
pub const PROTOCOL_VERSION: &str = "1.0";

/// Magic bytes for frame delimiting
pub const MAGIC: [u8; 4] = *b"PBRG";

/// Largest frame body accepted from a peer (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Message type tags understood by this protocol version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    KnowledgeSync,
    ExperienceShare,
    ErrorReport,
    SupportRequest,
    HealthCheck,
    TelstpUpdate,
    EvolutionaryMilestone,
    /// A tag sent by a peer running a newer protocol; keeps the original tag
    Unknown(String),
}

impl MessageType {
    /// Every tag this version can construct
    pub const KNOWN: [MessageType; 7] = [
        MessageType::KnowledgeSync,
        MessageType::ExperienceShare,
        MessageType::ErrorReport,
        MessageType::SupportRequest,
        MessageType::HealthCheck,
        MessageType::TelstpUpdate,
        MessageType::EvolutionaryMilestone,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            MessageType::KnowledgeSync => "knowledge_sync",
            MessageType::ExperienceShare => "experience_share",
            MessageType::ErrorReport => "error_report",
            MessageType::SupportRequest => "support_request",
            MessageType::HealthCheck => "health_check",
            MessageType::TelstpUpdate => "telstp_update",
            MessageType::EvolutionaryMilestone => "evolutionary_milestone",
            MessageType::Unknown(tag) => tag,
        }
    }

    /// Lenient parse used when reading from the wire
    pub fn from_tag(tag: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|t| t.as_str() == tag)
            .cloned()
            .unwrap_or_else(|| MessageType::Unknown(tag.to_string()))
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }

    /// Capability a peer must advertise before it is sent this type
    pub fn required_capability(&self) -> Option<Capabilities> {
        match self {
            MessageType::KnowledgeSync => Some(Capabilities::KNOWLEDGE_SYNC),
            MessageType::ExperienceShare => Some(Capabilities::EXPERIENCE_SHARING),
            MessageType::ErrorReport => Some(Capabilities::ERROR_LEARNING),
            MessageType::SupportRequest => Some(Capabilities::SUPPORT_REQUESTS),
            MessageType::HealthCheck => Some(Capabilities::HEALTH_CHECK),
            MessageType::TelstpUpdate => Some(Capabilities::FACILITY_SYNC),
            MessageType::EvolutionaryMilestone => Some(Capabilities::MILESTONE_SHARING),
            MessageType::Unknown(_) => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strict parse: unrecognized tags are an error
impl FromStr for MessageType {
    type Err = CodecError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match Self::from_tag(tag) {
            MessageType::Unknown(tag) => Err(CodecError::UnknownMessageType(tag)),
            known => Ok(known),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(MessageType::from_tag(&tag))
    }
}

bitflags! {
    /// Features a bridge advertises at handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const KNOWLEDGE_SYNC = 1 << 0;
        const EXPERIENCE_SHARING = 1 << 1;
        const ERROR_LEARNING = 1 << 2;
        const SUPPORT_REQUESTS = 1 << 3;
        const HEALTH_CHECK = 1 << 4;
        const FACILITY_SYNC = 1 << 5;
        const MILESTONE_SHARING = 1 << 6;
    }
}

const CAPABILITY_TAGS: [(Capabilities, &str); 7] = [
    (Capabilities::KNOWLEDGE_SYNC, "knowledge_sync"),
    (Capabilities::EXPERIENCE_SHARING, "experience_sharing"),
    (Capabilities::ERROR_LEARNING, "error_learning"),
    (Capabilities::SUPPORT_REQUESTS, "support_requests"),
    (Capabilities::HEALTH_CHECK, "health_check"),
    (Capabilities::FACILITY_SYNC, "facility_sync"),
    (Capabilities::MILESTONE_SHARING, "milestone_sharing"),
];

impl Capabilities {
    /// Wire tags, in declaration order
    pub fn to_tags(self) -> Vec<String> {
        CAPABILITY_TAGS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, tag)| tag.to_string())
            .collect()
    }

    /// Tags this version does not know are ignored
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        tags.into_iter()
            .filter_map(|tag| {
                CAPABILITY_TAGS
                    .iter()
                    .find(|(_, known)| *known == tag.as_ref())
                    .map(|(flag, _)| *flag)
            })
            .fold(Capabilities::empty(), |acc, flag| acc | flag)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::all()
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_tags().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tags = Vec::<String>::deserialize(deserializer)?;
        Ok(Capabilities::from_tags(tags))
    }
}

/// Major component of a `major.minor` version string
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}

/// Peers are compatible when their major versions match
pub fn is_compatible(version: &str) -> bool {
    match (major_version(version), major_version(PROTOCOL_VERSION)) {
        (Some(theirs), Some(ours)) => theirs == ours,
        _ => false,
    }
}

/// The message envelope
///
/// Fields are private: a message is immutable once built. `with_metadata`
/// consumes the message and returns a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_id: String,
    #[serde(rename = "type")]
    message_type: MessageType,
    sender_id: String,
    timestamp: DateTime<Utc>,
    version: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
    #[serde(default)]
    payload: Value,
}

impl Message {
    /// Build a message of a known type with a fresh id
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        payload: Value,
    ) -> Result<Self, CodecError> {
        if let MessageType::Unknown(tag) = &message_type {
            return Err(CodecError::UnknownMessageType(tag.clone()));
        }

        Ok(Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            message_type,
            sender_id: sender_id.into(),
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
            metadata: Map::new(),
            payload,
        })
    }

    /// Replace the payload, keeping id and timestamp
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Build a message from a string tag, rejecting unknown tags up front
pub fn create_message(
    message_type: &str,
    sender_id: impl Into<String>,
    payload: Value,
) -> Result<Message, CodecError> {
    Message::new(message_type.parse()?, sender_id, payload)
}

/// Outcome reported by the receiver of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Warning,
    Rejected,
}

/// Acknowledgment of a single message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub message_id: String,
    pub responder_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl Ack {
    pub fn ok(message_id: &str, responder_id: &str, response: Option<Value>) -> Self {
        Self {
            message_id: message_id.to_string(),
            responder_id: responder_id.to_string(),
            status: AckStatus::Ok,
            detail: None,
            response,
        }
    }

    pub fn warning(message_id: &str, responder_id: &str, detail: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            responder_id: responder_id.to_string(),
            status: AckStatus::Warning,
            detail: Some(detail.into()),
            response: None,
        }
    }

    pub fn rejected(message_id: &str, responder_id: &str, reason: impl Into<String>) -> Self {
        Self {
            message_id: message_id.to_string(),
            responder_id: responder_id.to_string(),
            status: AckStatus::Rejected,
            detail: Some(reason.into()),
            response: None,
        }
    }

    /// Ok and Warning both count as delivered
    pub fn is_positive(&self) -> bool {
        self.status != AckStatus::Rejected
    }
}

/// Handshake exchanged when a connection opens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Sender's stable logical identity
    pub instance_id: String,
    /// Protocol version
    pub version: String,
    /// Advertised capability tags
    pub capabilities: Vec<String>,
    /// Compressed secp256k1 public key (hex)
    pub public_key: String,
    /// Random per-handshake nonce (hex)
    pub nonce: String,
    /// Compact ECDSA signature over the transcript (hex)
    pub signature: String,
    /// Address the sender accepts connections on, if any
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Whether the sender wants an encrypted session
    #[serde(default)]
    pub encryption: bool,
    pub user_agent: String,
}

impl Handshake {
    /// Create and sign a handshake
    pub fn new(
        keys: &KeyPair,
        instance_id: &str,
        capabilities: Capabilities,
        listen_addr: Option<String>,
    ) -> Result<Self, KeyError> {
        Self::with_version(keys, instance_id, capabilities, listen_addr, PROTOCOL_VERSION)
    }

    /// Create and sign a handshake advertising `version`
    pub fn with_version(
        keys: &KeyPair,
        instance_id: &str,
        capabilities: Capabilities,
        listen_addr: Option<String>,
        version: &str,
    ) -> Result<Self, KeyError> {
        let nonce = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
        let public_key = keys.public_key_hex();
        let digest = Self::transcript(instance_id, version, &nonce, &public_key);
        let signature = hex::encode(keys.sign(&digest)?);

        Ok(Self {
            instance_id: instance_id.to_string(),
            version: version.to_string(),
            capabilities: capabilities.to_tags(),
            public_key,
            nonce,
            signature,
            listen_addr,
            encryption: false,
            user_agent: format!("peer-bridge/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    fn transcript(instance_id: &str, version: &str, nonce: &str, public_key: &str) -> Vec<u8> {
        sha256_fields(&[
            instance_id.as_bytes(),
            version.as_bytes(),
            nonce.as_bytes(),
            public_key.as_bytes(),
        ])
    }

    /// Check the signature against the embedded public key
    pub fn verify(&self) -> Result<bool, KeyError> {
        let public_key = public_key_from_hex(&self.public_key)?;
        let signature = hex::decode(&self.signature).map_err(|_| KeyError::InvalidSignature)?;
        let digest =
            Self::transcript(&self.instance_id, &self.version, &self.nonce, &self.public_key);
        crate::crypto::verify_signature(&public_key, &digest, &signature)
    }

    pub fn is_compatible(&self) -> bool {
        is_compatible(&self.version)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::from_tags(&self.capabilities)
    }
}

/// Everything that travels over a peer connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum Frame {
    Handshake(Handshake),
    /// Sent instead of a handshake when the remote side is refused
    HandshakeReject { reason: String, version: String },
    Envelope(Message),
    Ack(Ack),
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get frame type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Handshake(_) => "Handshake",
            Frame::HandshakeReject { .. } => "HandshakeReject",
            Frame::Envelope(_) => "Envelope",
            Frame::Ack(_) => "Ack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization() {
        let msg = create_message("knowledge_sync", "alpha", json!({"category": "biology"}))
            .unwrap()
            .with_metadata("priority", json!(3));

        let bytes = msg.to_bytes().unwrap();
        let decoded = Message::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.message_id(), msg.message_id());
        assert_eq!(decoded.message_type(), &MessageType::KnowledgeSync);
        assert_eq!(decoded.payload()["category"], "biology");
    }

    #[test]
    fn test_unknown_type_rejected_at_construction() {
        let err = create_message("quantum_entangle", "alpha", json!({})).unwrap_err();
        assert!(matches!(err, CodecError::UnknownMessageType(tag) if tag == "quantum_entangle"));

        let err = Message::new(MessageType::Unknown("x".into()), "alpha", Value::Null);
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_type_survives_deserialization() {
        let raw = json!({
            "message_id": "m-1",
            "type": "dream_share",
            "sender_id": "beta",
            "timestamp": "2026-01-01T00:00:00Z",
            "version": "1.4",
            "payload": {"x": 1}
        });
        let msg = Message::from_bytes(raw.to_string().as_bytes()).unwrap();

        assert_eq!(msg.message_type(), &MessageType::Unknown("dream_share".into()));
        assert_eq!(msg.message_id(), "m-1");

        let again = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(again.message_type().as_str(), "dream_share");
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::new(MessageType::HealthCheck, "alpha", Value::Null).unwrap();
        let b = Message::new(MessageType::HealthCheck, "alpha", Value::Null).unwrap();
        assert_ne!(a.message_id(), b.message_id());
        assert_eq!(a.version(), PROTOCOL_VERSION);
    }

    #[test]
    fn test_capability_tags() {
        let caps = Capabilities::KNOWLEDGE_SYNC | Capabilities::HEALTH_CHECK;
        let tags = caps.to_tags();
        assert_eq!(tags, vec!["knowledge_sync", "health_check"]);

        let parsed = Capabilities::from_tags(["health_check", "telepathy", "knowledge_sync"]);
        assert_eq!(parsed, caps);
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible("1.0"));
        assert!(is_compatible("1.7"));
        assert!(!is_compatible("2.0"));
        assert!(!is_compatible("garbage"));
        assert_eq!(major_version("3.1"), Some(3));
    }

    #[test]
    fn test_handshake_signature() {
        let keys = KeyPair::generate();
        let mut handshake = Handshake::new(&keys, "alpha", Capabilities::all(), None).unwrap();
        assert!(handshake.verify().unwrap());
        assert!(handshake.is_compatible());
        assert_eq!(handshake.capabilities(), Capabilities::all());

        handshake.instance_id = "mallory".to_string();
        assert!(!handshake.verify().unwrap());
    }

    #[test]
    fn test_frame_round_trip() {
        let ack = Ack::rejected("m-1", "beta", "handler failed");
        let frame = Frame::Ack(ack.clone());
        let decoded = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();

        match decoded {
            Frame::Ack(decoded) => {
                assert_eq!(decoded, ack);
                assert!(!decoded.is_positive());
            }
            other => panic!("Wrong frame type: {}", other.type_name()),
        }
    }
}
