//! Idempotent Publisher.
//!
//! Publishing is an insert into the message log. The log's uniqueness
//! constraint on the idempotency token is what makes a client retry safe:
//! a retry of a publish that already landed comes back as a duplicate, is
//! acknowledged, and is not broadcast again.

use std::sync::Arc;

use shared::models::{NewMessage, PublishAck, SequenceId};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    bus::BroadcastEvent,
    fanout::Fanout,
    store::{InsertError, SharedLog, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted { sequence_id: SequenceId },
    /// An earlier attempt with the same token was stored and broadcast.
    Duplicate,
}

impl From<PublishOutcome> for PublishAck {
    fn from(outcome: PublishOutcome) -> Self {
        match outcome {
            PublishOutcome::Accepted { sequence_id } => Self::accepted(sequence_id),
            PublishOutcome::Duplicate => Self::duplicate(),
        }
    }
}

/// The publish was not acknowledged; the client retries with the same token.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("transient store failure: {0}")]
    TransientStore(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct Publisher {
    log: SharedLog,
    fanout: Arc<Fanout>,
}

impl Publisher {
    pub fn new(log: SharedLog, fanout: Arc<Fanout>) -> Self {
        Self { log, fanout }
    }

    /// Stores a message and, only when it is new, broadcasts it.
    ///
    /// # Errors
    /// Returns [`PublishError::TransientStore`] when the store fails for any
    /// reason other than a duplicate token. Nothing is broadcast then.
    pub async fn publish(
        &self,
        content: String,
        idempotency_token: Option<String>,
        author: String,
    ) -> Result<PublishOutcome, PublishError> {
        let message = NewMessage::new(content, idempotency_token, author);
        let (content, author) = (message.content.clone(), message.author.clone());

        match self.log.insert(message).await {
            Ok(sequence_id) => {
                metrics::counter!("relay_publish_total", "outcome" => "accepted").increment(1);
                info!(sequence_id, author = %author, "publish accepted");
                self.fanout
                    .broadcast_all(BroadcastEvent::Message {
                        sequence_id,
                        author,
                        content,
                    })
                    .await;
                Ok(PublishOutcome::Accepted { sequence_id })
            }
            Err(InsertError::Duplicate) => {
                metrics::counter!("relay_publish_total", "outcome" => "duplicate").increment(1);
                info!(author = %author, "publish duplicate; acknowledging without broadcast");
                Ok(PublishOutcome::Duplicate)
            }
            Err(InsertError::Store(err)) => {
                metrics::counter!("relay_publish_total", "outcome" => "transient").increment(1);
                warn!(error = %err, author = %author, "publish transient failure; not acknowledged");
                Err(PublishError::TransientStore(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::LocalBus, registry::Registry, store::MemoryMessageLog};
    use shared::{
        config::server::StreamConfig,
        models::{ClientEvent, MessageEvent},
    };
    use tokio::sync::mpsc;

    struct Harness {
        log: Arc<MemoryMessageLog>,
        registry: Arc<Registry>,
        publisher: Publisher,
    }

    fn harness() -> Harness {
        let log = Arc::new(MemoryMessageLog::new());
        let registry = Arc::new(Registry::new(&StreamConfig::default()));
        let fanout = Arc::new(Fanout::new(
            Arc::clone(&registry),
            Arc::new(LocalBus::new(16)),
            log.clone(),
        ));
        let publisher = Publisher::new(log.clone(), fanout);
        Harness {
            log,
            registry,
            publisher,
        }
    }

    fn drain(receiver: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn retried_publish_is_stored_and_broadcast_once() {
        let h = harness();
        let mut attached = h.registry.attach(None, 0).await;
        assert!(attached.connection.go_live().await);

        let first = h
            .publisher
            .publish("hi".into(), Some("t1".into()), "alice".into())
            .await
            .unwrap();
        let retry = h
            .publisher
            .publish("hi".into(), Some("t1".into()), "alice".into())
            .await
            .unwrap();

        assert_eq!(first, PublishOutcome::Accepted { sequence_id: 1 });
        assert_eq!(retry, PublishOutcome::Duplicate);
        assert_eq!(h.log.len().await, 1);

        let events = drain(&mut attached.receiver);
        assert_eq!(
            events,
            vec![ClientEvent::Message(MessageEvent {
                content: "hi".into(),
                sequence_id: 1,
                author: "alice".into(),
                is_own: false,
            })]
        );
    }

    #[tokio::test]
    async fn transient_failure_is_not_acknowledged_or_broadcast() {
        let h = harness();
        let mut attached = h.registry.attach(None, 0).await;
        assert!(attached.connection.go_live().await);
        h.log.fail_next_inserts(1);

        let err = h
            .publisher
            .publish("hi".into(), Some("t1".into()), "alice".into())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::TransientStore(_)));
        assert!(drain(&mut attached.receiver).is_empty());

        // The retry with the same token is a fresh accept.
        let retry = h
            .publisher
            .publish("hi".into(), Some("t1".into()), "alice".into())
            .await
            .unwrap();
        assert_eq!(retry, PublishOutcome::Accepted { sequence_id: 1 });
        assert_eq!(drain(&mut attached.receiver).len(), 1);
    }

    #[test]
    fn outcomes_map_to_acks() {
        assert_eq!(
            PublishAck::from(PublishOutcome::Accepted { sequence_id: 9 }),
            PublishAck::accepted(9)
        );
        assert_eq!(
            PublishAck::from(PublishOutcome::Duplicate),
            PublishAck::duplicate()
        );
    }
}
