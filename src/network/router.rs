//! Message routing
//!
//! Inbound messages are dispatched to one handler per message type.
//! Outbound sends are tracked until their acknowledgment arrives or the
//! sender gives up waiting.

use crate::network::message::{Ack, Message, MessageType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors returned to callers of `send`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Send to {peer_id} timed out after {timeout_ms}ms")]
    SendTimeout { peer_id: String, timeout_ms: u64 },
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Peer {peer_id} rejected message: {reason}")]
    HandlerFailure { peer_id: String, reason: String },
    #[error("Peer not found: {0}")]
    NotFound(String),
    #[error("Peer {0} disconnected")]
    Disconnected(String),
    #[error("Bridge is shut down")]
    BridgeClosed,
}

impl RouterError {
    /// The message went out (or was queued) but was not accepted
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            RouterError::SendTimeout { .. }
                | RouterError::HandlerFailure { .. }
                | RouterError::Disconnected(_)
        )
    }
}

/// Errors raised by message handlers
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("{0}")]
    Failed(String),
}

/// What a handler tells the sender
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    Done,
    Response(Value),
    Warning(String),
}

/// Handles inbound messages of one type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError>;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerReply, HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerReply, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Fallback for message types nobody registered
pub struct UnhandledTypeHandler;

#[async_trait]
impl MessageHandler for UnhandledTypeHandler {
    async fn handle(&self, message: Message) -> Result<HandlerReply, HandlerError> {
        log::warn!(
            "No handler for {} message {} from {}",
            message.message_type(),
            message.message_id(),
            message.sender_id()
        );
        Ok(HandlerReply::Warning(format!(
            "unhandled message type: {}",
            message.message_type()
        )))
    }
}

struct PendingSend {
    peer_id: String,
    message_type: MessageType,
    /// When the message was built; its content reflects state up to here
    stamped_at: DateTime<Utc>,
    reply: oneshot::Sender<Ack>,
    sent_at: Instant,
}

/// Result of matching an inbound ack against pending sends
#[derive(Debug, Clone, PartialEq)]
pub enum AckMatch {
    /// Handed to the waiting sender
    Delivered {
        peer_id: String,
        message_type: MessageType,
        stamped_at: DateTime<Utc>,
        positive: bool,
    },
    /// The sender already stopped waiting
    Late {
        peer_id: String,
        message_type: MessageType,
    },
    /// No send with this id is pending
    Unmatched,
}

/// Handler registry and pending-ack table
pub struct MessageRouter {
    local_id: String,
    handlers: HashMap<MessageType, Arc<dyn MessageHandler>>,
    fallback: Arc<dyn MessageHandler>,
    pending: HashMap<String, PendingSend>,
}

impl MessageRouter {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            handlers: HashMap::new(),
            fallback: Arc::new(UnhandledTypeHandler),
            pending: HashMap::new(),
        }
    }

    /// Register the handler for a type. Returns true if one was replaced.
    pub fn register_handler(
        &mut self,
        message_type: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> bool {
        let replaced = self.handlers.insert(message_type.clone(), handler).is_some();
        if replaced {
            log::debug!("Replaced handler for {}", message_type);
        }
        replaced
    }

    /// Replace the handler used for unregistered types
    pub fn set_fallback(&mut self, handler: Arc<dyn MessageHandler>) {
        self.fallback = handler;
    }

    /// Registered type tags, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .keys()
            .map(|t| t.as_str().to_string())
            .collect();
        types.sort();
        types
    }

    fn handler_for(&self, message_type: &MessageType) -> Arc<dyn MessageHandler> {
        self.handlers
            .get(message_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Run the handler for an inbound message and produce the ack to return.
    ///
    /// The returned future owns everything it needs, so the caller can spawn
    /// it. Handler errors and panics become a Rejected ack.
    pub fn dispatch(&self, message: Message) -> impl Future<Output = Ack> + Send + 'static {
        let handler = self.handler_for(message.message_type());
        let local_id = self.local_id.clone();

        async move {
            let message_id = message.message_id().to_string();
            let message_type = message.message_type().clone();
            let sender = message.sender_id().to_string();

            let outcome = tokio::spawn(async move { handler.handle(message).await }).await;

            match outcome {
                Ok(Ok(HandlerReply::Done)) => Ack::ok(&message_id, &local_id, None),
                Ok(Ok(HandlerReply::Response(value))) => {
                    Ack::ok(&message_id, &local_id, Some(value))
                }
                Ok(Ok(HandlerReply::Warning(detail))) => {
                    Ack::warning(&message_id, &local_id, detail)
                }
                Ok(Err(e)) => {
                    log::warn!(
                        "Handler for {} from {} failed: {}",
                        message_type,
                        sender,
                        e
                    );
                    Ack::rejected(&message_id, &local_id, e.to_string())
                }
                Err(e) => {
                    log::error!(
                        "Handler for {} from {} panicked: {}",
                        message_type,
                        sender,
                        e
                    );
                    Ack::rejected(&message_id, &local_id, "handler panicked")
                }
            }
        }
    }

    /// Start waiting for the ack of an outbound message
    pub fn track(&mut self, peer_id: &str, message: &Message) -> oneshot::Receiver<Ack> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            message.message_id().to_string(),
            PendingSend {
                peer_id: peer_id.to_string(),
                message_type: message.message_type().clone(),
                stamped_at: message.timestamp(),
                reply: tx,
                sent_at: Instant::now(),
            },
        );
        rx
    }

    /// Match an inbound ack
    pub fn complete(&mut self, ack: Ack) -> AckMatch {
        let Some(pending) = self.pending.remove(&ack.message_id) else {
            return AckMatch::Unmatched;
        };

        let positive = ack.is_positive();
        let elapsed = pending.sent_at.elapsed();
        if pending.reply.send(ack).is_err() {
            return AckMatch::Late {
                peer_id: pending.peer_id,
                message_type: pending.message_type,
            };
        }

        log::debug!(
            "Ack for {} from {} after {}ms",
            pending.message_type,
            pending.peer_id,
            elapsed.as_millis()
        );
        AckMatch::Delivered {
            peer_id: pending.peer_id,
            message_type: pending.message_type,
            stamped_at: pending.stamped_at,
            positive,
        }
    }

    /// Forget a send whose caller timed out
    pub fn expire(&mut self, message_id: &str) -> Option<MessageType> {
        self.pending.remove(message_id).map(|p| p.message_type)
    }

    /// Drop every pending send to a peer that went away.
    ///
    /// Waiters observe a closed channel.
    pub fn fail_peer(&mut self, peer_id: &str) -> Vec<MessageType> {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.peer_id == peer_id)
            .map(|(id, _)| id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.pending.remove(id))
            .map(|p| p.message_type)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::AckStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _message: Message) -> Result<HandlerReply, HandlerError> {
            panic!("boom")
        }
    }

    fn message(message_type: MessageType) -> Message {
        Message::new(message_type, "alpha", json!({"n": 1})).unwrap()
    }

    fn counting(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(HandlerReply::Done)
            }
        })
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut router = MessageRouter::new("bravo");
        assert!(!router.register_handler(MessageType::ErrorReport, counting(first.clone())));
        assert!(router.register_handler(MessageType::ErrorReport, counting(second.clone())));

        let ack = router.dispatch(message(MessageType::ErrorReport)).await;

        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.responder_id, "bravo");
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(router.registered_types(), vec!["error_report"]);
    }

    #[tokio::test]
    async fn test_unhandled_type_acks_with_warning() {
        let router = MessageRouter::new("bravo");
        let raw = json!({
            "message_id": "m-9",
            "type": "future_feature",
            "sender_id": "alpha",
            "timestamp": "2026-01-01T00:00:00Z",
            "version": "1.9",
            "payload": null
        });
        let msg = Message::from_bytes(raw.to_string().as_bytes()).unwrap();

        let ack = router.dispatch(msg).await;
        assert_eq!(ack.status, AckStatus::Warning);
        assert_eq!(ack.message_id, "m-9");
        assert!(ack.is_positive());
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_negative_ack() {
        let mut router = MessageRouter::new("bravo");
        router.register_handler(
            MessageType::SupportRequest,
            handler_fn(|_msg| async {
                Err::<HandlerReply, _>(HandlerError::Failed("out of ideas".into()))
            }),
        );
        router.register_handler(MessageType::HealthCheck, Arc::new(Panicking));

        let ack = router.dispatch(message(MessageType::SupportRequest)).await;
        assert_eq!(ack.status, AckStatus::Rejected);
        assert_eq!(ack.detail.as_deref(), Some("out of ideas"));

        let ack = router.dispatch(message(MessageType::HealthCheck)).await;
        assert_eq!(ack.status, AckStatus::Rejected);
    }

    #[tokio::test]
    async fn test_ack_matching() {
        let mut router = MessageRouter::new("alpha");
        let msg = message(MessageType::KnowledgeSync);
        let rx = router.track("bravo", &msg);
        assert_eq!(router.pending_count(), 1);

        let matched = router.complete(Ack::ok(msg.message_id(), "bravo", None));
        assert_eq!(
            matched,
            AckMatch::Delivered {
                peer_id: "bravo".into(),
                message_type: MessageType::KnowledgeSync,
                stamped_at: msg.timestamp(),
                positive: true,
            }
        );
        assert_eq!(rx.await.unwrap().responder_id, "bravo");

        // Duplicate ack
        let again = router.complete(Ack::ok(msg.message_id(), "bravo", None));
        assert_eq!(again, AckMatch::Unmatched);
    }

    #[tokio::test]
    async fn test_ack_after_waiter_gave_up_is_late() {
        let mut router = MessageRouter::new("alpha");
        let msg = message(MessageType::ErrorReport);
        let mut rx = router.track("bravo", &msg);
        rx.close();

        let matched = router.complete(Ack::ok(msg.message_id(), "bravo", None));
        assert_eq!(
            matched,
            AckMatch::Late {
                peer_id: "bravo".into(),
                message_type: MessageType::ErrorReport,
            }
        );
        assert!(router.expire(msg.message_id()).is_none());
    }

    #[tokio::test]
    async fn test_fail_peer_releases_waiters() {
        let mut router = MessageRouter::new("alpha");
        let a = message(MessageType::ExperienceShare);
        let b = message(MessageType::ErrorReport);
        let rx_a = router.track("bravo", &a);
        let _rx_b = router.track("charlie", &b);

        let failed = router.fail_peer("bravo");
        assert_eq!(failed, vec![MessageType::ExperienceShare]);
        assert!(rx_a.await.is_err());
        assert_eq!(router.pending_count(), 1);
    }
}
