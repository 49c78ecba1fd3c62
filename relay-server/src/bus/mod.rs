//! Fan-out Bus.
//!
//! Every process subscribes to one logical topic at startup and publishes each
//! broadcast to it, so a message accepted by one process reaches clients held
//! by every other process. The bus is best effort; durability lives in the
//! message log.

mod local;
mod postgres;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::models::{ClientEvent, MessageEvent, PresenceEvent, SequenceId};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::ConnectionId;

pub use local::LocalBus;
pub use postgres::PgNotifyBus;

/// Identifies one server process on the bus.
pub type NodeId = Uuid;

pub type SharedBus = Arc<dyn FanoutBus>;

/// Receiving half of a bus subscription.
pub type BusSubscription = mpsc::Receiver<BusSignal>;

/// Buffer between a bus driver and the task relaying its signals.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 1024;

/// Payload of a broadcast, as seen by every process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Message {
        sequence_id: SequenceId,
        author: String,
        content: String,
    },
    Presence {
        text: String,
    },
}

impl BroadcastEvent {
    pub fn presence(text: impl Into<String>) -> Self {
        Self::Presence { text: text.into() }
    }

    /// Renders the event for one receiving connection.
    #[must_use]
    pub fn to_client(&self, receiver_nickname: &str) -> ClientEvent {
        match self {
            Self::Message {
                sequence_id,
                author,
                content,
            } => ClientEvent::Message(MessageEvent {
                content: content.clone(),
                sequence_id: *sequence_id,
                author: author.clone(),
                is_own: author == receiver_nickname,
            }),
            Self::Presence { text } => ClientEvent::Presence(PresenceEvent { text: text.clone() }),
        }
    }
}

/// Which connections a broadcast is for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    All,
    AllExcept(ConnectionId),
}

impl Audience {
    #[must_use]
    pub fn includes(self, connection: ConnectionId) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(excluded) => excluded != connection,
        }
    }
}

/// What travels on the bus: the event itself, or the id of a stored message
/// that receivers load from the log when the event is too large to carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusPayload {
    Event(BroadcastEvent),
    StoredMessage(SequenceId),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusEnvelope {
    pub origin: NodeId,
    pub target: Audience,
    #[serde(flatten)]
    pub payload: BusPayload,
}

impl BusEnvelope {
    #[must_use]
    pub fn event(origin: NodeId, target: Audience, event: BroadcastEvent) -> Self {
        Self {
            origin,
            target,
            payload: BusPayload::Event(event),
        }
    }

    /// The same envelope pointing at the stored message instead of carrying it.
    ///
    /// `None` for anything that is not a stored message.
    #[must_use]
    pub fn by_reference(&self) -> Option<Self> {
        match &self.payload {
            BusPayload::Event(BroadcastEvent::Message { sequence_id, .. }) => Some(Self {
                origin: self.origin,
                target: self.target,
                payload: BusPayload::StoredMessage(*sequence_id),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusSignal {
    Envelope(BusEnvelope),
    /// The subscriber fell behind and this many envelopes were dropped.
    Lagged(u64),
    /// The connection to the bus was lost; envelopes may be missing.
    Disconnected,
    Reconnected,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("failed to connect to the bus: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("failed to publish to the bus: {0}")]
    Publish(String),
    /// The payload cannot travel on this bus. Says nothing about bus health.
    #[error("payload of {bytes} bytes exceeds the bus limit of {limit}")]
    Oversize { bytes: usize, limit: usize },
    #[error("failed to encode bus envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus is closed")]
    Closed,
}

#[async_trait]
pub trait FanoutBus: Send + Sync + Debug {
    async fn publish(&self, envelope: &BusEnvelope) -> Result<(), BusError>;

    /// Opens a subscription to the topic. Failing here is fatal at startup.
    async fn subscribe(&self) -> Result<BusSubscription, BusError>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_is_own_only_for_the_author() {
        let event = BroadcastEvent::Message {
            sequence_id: 4,
            author: "User-ab12".into(),
            content: "hi".into(),
        };

        let ClientEvent::Message(own) = event.to_client("User-ab12") else {
            panic!("expected message event");
        };
        let ClientEvent::Message(other) = event.to_client("User-cd34") else {
            panic!("expected message event");
        };

        assert!(own.is_own);
        assert!(!other.is_own);
        assert_eq!(other.sequence_id, 4);
    }

    #[test]
    fn audience_excludes_only_the_originator() {
        let origin = Uuid::new_v4();
        assert!(!Audience::AllExcept(origin).includes(origin));
        assert!(Audience::AllExcept(origin).includes(Uuid::new_v4()));
        assert!(Audience::All.includes(origin));
    }

    #[test]
    fn envelope_wire_format_is_stable() {
        let origin = Uuid::nil();
        let envelope = BusEnvelope::event(
            origin,
            Audience::All,
            BroadcastEvent::presence("User-0000 has connected"),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "origin": origin,
                "target": "all",
                "event": { "kind": "presence", "text": "User-0000 has connected" }
            })
        );
    }

    #[test]
    fn only_messages_travel_by_reference() {
        let origin = Uuid::nil();
        let message = BusEnvelope::event(
            origin,
            Audience::All,
            BroadcastEvent::Message {
                sequence_id: 12,
                author: "User-0000".into(),
                content: "long".into(),
            },
        );

        let reference = message.by_reference().unwrap();
        assert_eq!(reference.payload, BusPayload::StoredMessage(12));
        assert_eq!(
            serde_json::to_value(&reference).unwrap(),
            json!({ "origin": origin, "target": "all", "stored_message": 12 })
        );
        assert_eq!(
            serde_json::from_value::<BusEnvelope>(serde_json::to_value(&reference).unwrap())
                .unwrap(),
            reference
        );

        let presence = BusEnvelope::event(origin, Audience::All, BroadcastEvent::presence("hi"));
        assert!(presence.by_reference().is_none());
    }
}
