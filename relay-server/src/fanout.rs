//! Cross-process broadcast coordinator.
//!
//! A broadcast is delivered to this process's registry first and then
//! published on the bus for every other process. The relay task feeds bus
//! envelopes from other processes into the local registry and ignores the
//! ones this process published itself, so each process delivers a broadcast
//! once. A message too large for the bus travels as its sequence id and is
//! loaded back from the log by the receiving process.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::models::SequenceId;

use crate::{
    bus::{
        Audience, BroadcastEvent, BusEnvelope, BusError, BusPayload, BusSignal, NodeId, SharedBus,
    },
    connection::ConnectionId,
    registry::Registry,
    store::SharedLog,
};

#[derive(Debug)]
pub struct Fanout {
    node_id: NodeId,
    registry: Arc<Registry>,
    bus: SharedBus,
    log: SharedLog,
    listening: AtomicBool,
    publishing: AtomicBool,
}

impl Fanout {
    pub fn new(registry: Arc<Registry>, bus: SharedBus, log: SharedLog) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            registry,
            bus,
            log,
            listening: AtomicBool::new(false),
            publishing: AtomicBool::new(true),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Subscribes to the bus and spawns the relay task.
    ///
    /// # Errors
    /// Returns the bus error when the subscription cannot be opened; the
    /// process cannot promise cross-process delivery without it.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.bus.subscribe().await?;
        self.set_listening(true);
        info!(bus = self.bus.name(), node_id = %self.node_id, "fan-out bus subscribed");

        let fanout = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(signal) = subscription.recv().await {
                fanout.handle_signal(signal).await;
            }
            fanout.set_listening(false);
            warn!("bus subscription ended; delivering locally only");
        }))
    }

    async fn handle_signal(&self, signal: BusSignal) {
        match signal {
            BusSignal::Envelope(envelope) if envelope.origin == self.node_id => {}
            BusSignal::Envelope(envelope) => {
                let BusEnvelope {
                    origin,
                    target,
                    payload,
                } = envelope;
                let event = match payload {
                    BusPayload::Event(event) => event,
                    BusPayload::StoredMessage(sequence_id) => {
                        match self.load_stored(sequence_id).await {
                            Some(event) => event,
                            None => return,
                        }
                    }
                };
                let delivered = self.registry.broadcast(&event, target).await;
                debug!(origin = %origin, delivered, "relayed bus envelope");
            }
            BusSignal::Lagged(skipped) => {
                warn!(skipped, "bus subscriber lagged; envelopes were dropped");
            }
            BusSignal::Disconnected => {
                warn!("bus listener lost");
                self.set_listening(false);
            }
            BusSignal::Reconnected => {
                info!("bus listener restored");
                self.set_listening(true);
            }
        }
    }

    async fn load_stored(&self, sequence_id: SequenceId) -> Option<BroadcastEvent> {
        let rows = match self.log.query_after(sequence_id.saturating_sub(1), 1).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(sequence_id, error = %err, "failed to load referenced message");
                metrics::counter!("relay_bus_reference_failures_total").increment(1);
                return None;
            }
        };
        match rows.into_iter().next() {
            Some(message) if message.sequence_id == sequence_id => Some(BroadcastEvent::Message {
                sequence_id,
                author: message.author,
                content: message.content,
            }),
            _ => {
                warn!(sequence_id, "referenced message not found in the log");
                metrics::counter!("relay_bus_reference_failures_total").increment(1);
                None
            }
        }
    }

    /// Delivers locally, then publishes for the other processes.
    ///
    /// A bus failure only costs cross-process visibility; it is logged,
    /// counted and reported through [`Fanout::bus_healthy`]. A payload the
    /// bus cannot carry is logged and counted but leaves health alone.
    pub async fn broadcast(&self, event: BroadcastEvent, target: Audience) {
        self.registry.broadcast(&event, target).await;

        let envelope = BusEnvelope::event(self.node_id, target, event);
        match self.bus.publish(&envelope).await {
            Ok(()) => self.set_publishing(true),
            Err(err @ BusError::Oversize { .. }) => {
                warn!(
                    error = %err,
                    bus = self.bus.name(),
                    "event too large for the bus; delivered locally only"
                );
                metrics::counter!("relay_bus_oversize_total").increment(1);
            }
            Err(err) => {
                warn!(error = %err, bus = self.bus.name(), "bus publish failed");
                metrics::counter!("relay_bus_publish_failures_total").increment(1);
                self.set_publishing(false);
            }
        }
    }

    pub async fn broadcast_all(&self, event: BroadcastEvent) {
        self.broadcast(event, Audience::All).await;
    }

    pub async fn broadcast_others(&self, origin: ConnectionId, event: BroadcastEvent) {
        self.broadcast(event, Audience::AllExcept(origin)).await;
    }

    pub fn bus_healthy(&self) -> bool {
        self.listening.load(Ordering::SeqCst) && self.publishing.load(Ordering::SeqCst)
    }

    fn set_listening(&self, value: bool) {
        self.listening.store(value, Ordering::SeqCst);
        self.record_health();
    }

    fn set_publishing(&self, value: bool) {
        self.publishing.store(value, Ordering::SeqCst);
        self.record_health();
    }

    fn record_health(&self) {
        metrics::gauge!("relay_bus_connected").set(if self.bus_healthy() { 1.0 } else { 0.0 });
    }
}
