//! Connection Registry.
//!
//! Tracks the connections held by this process and the recently dropped
//! sessions that may still be resumed. Nothing here is persisted; after a
//! restart clients recover from the message log.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use shared::{
    config::server::StreamConfig,
    models::{ClientEvent, SequenceId},
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::{
    bus::{Audience, BroadcastEvent},
    connection::{Connection, ConnectionId, ConnectionSeed, DeliveryFilter, Push},
};

/// A dropped connection kept around so its client can resume it.
#[derive(Debug)]
struct DetachedSession {
    nickname: String,
    filter: DeliveryFilter,
    /// Events the client has not been handed yet, oldest first.
    missed: Vec<ClientEvent>,
    /// Highest message sequence id handed to the transport before the drop.
    last_delivered: Option<SequenceId>,
    expires_at: Instant,
}

impl DetachedSession {
    /// Whether a client that has seen everything up to `offset` can pick up
    /// from the missed events alone.
    fn resumable_from(&self, offset: SequenceId) -> bool {
        self.last_delivered.is_none_or(|last| offset >= last)
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    live: HashMap<ConnectionId, Arc<Connection>>,
    detached: HashMap<ConnectionId, DetachedSession>,
}

impl RegistryInner {
    fn purge_expired(&mut self, now: Instant) {
        self.detached.retain(|id, session| {
            let keep = session.expires_at > now;
            if !keep {
                debug!(connection_id = %id, "detached session expired");
            }
            keep
        });
    }

    fn record_gauges(&self) {
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("relay_connections").set(self.live.len() as f64);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("relay_detached_sessions").set(self.detached.len() as f64);
    }
}

/// A connection that was just registered, with the receiver its transport drains.
#[derive(Debug)]
pub struct Attached {
    pub connection: Arc<Connection>,
    pub receiver: mpsc::Receiver<ClientEvent>,
    /// The client resumed a parked session and needs no store replay.
    pub recovered: bool,
}

#[derive(Debug)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
    channel_capacity: usize,
    dedup_window: usize,
    recovery_window: Duration,
    max_missed_events: usize,
}

impl Registry {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            channel_capacity: config.channel_capacity,
            dedup_window: config.dedup_window,
            recovery_window: Duration::from_secs(config.recovery_window_seconds),
            max_missed_events: config.max_missed_events,
        }
    }

    pub async fn register(&self, connection: Arc<Connection>) {
        let mut inner = self.inner.lock().await;
        info!(connection_id = %connection.id(), "connection registered");
        inner.live.insert(connection.id(), connection);
        inner.record_gauges();
    }

    pub async fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock().await;
        let removed = inner.live.remove(&id);
        if removed.is_some() {
            info!(connection_id = %id, "connection unregistered");
        }
        inner.record_gauges();
        removed
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.lock().await.live.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn detached_len(&self) -> usize {
        self.inner.lock().await.detached.len()
    }

    /// Registers a connection for a handshake, resuming `requested` if it is
    /// parked here.
    ///
    /// Resumption keeps the parked identity. It only skips replay when the
    /// client's `offset` covers everything handed to the old transport;
    /// otherwise the delivery state starts over and the caller replays from
    /// `offset`.
    pub async fn attach(&self, requested: Option<ConnectionId>, offset: SequenceId) -> Attached {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());

        let parked = requested.and_then(|id| inner.detached.remove(&id).map(|s| (id, s)));
        let (seed, recovered) = match parked {
            Some((id, session)) if session.resumable_from(offset) => (
                ConnectionSeed {
                    id,
                    nickname: session.nickname,
                    filter: session.filter,
                    backlog: session.missed,
                },
                true,
            ),
            Some((id, session)) => {
                debug!(
                    connection_id = %id,
                    offset,
                    last_delivered = ?session.last_delivered,
                    "client is behind its parked session; replaying from the log"
                );
                (
                    ConnectionSeed {
                        id,
                        nickname: session.nickname,
                        filter: DeliveryFilter::new(self.dedup_window),
                        backlog: Vec::new(),
                    },
                    false,
                )
            }
            None => (ConnectionSeed::fresh(self.dedup_window), false),
        };

        let (connection, receiver) =
            Connection::new(seed, self.channel_capacity, self.max_missed_events);
        let connection = Arc::new(connection);
        inner.live.insert(connection.id(), Arc::clone(&connection));
        inner.record_gauges();

        if recovered {
            metrics::counter!("relay_recovered_sessions_total").increment(1);
            info!(connection_id = %connection.id(), "connection resumed");
        } else {
            info!(connection_id = %connection.id(), "connection registered");
        }

        Attached {
            connection,
            receiver,
            recovered,
        }
    }

    /// Removes a connection whose transport went away and parks it for
    /// resumption when possible. Returns whether it was parked.
    ///
    /// `receiver` is the transport's channel; anything still queued in it is
    /// kept as missed.
    pub async fn detach(
        &self,
        connection: &Arc<Connection>,
        mut receiver: mpsc::Receiver<ClientEvent>,
        last_delivered: Option<SequenceId>,
    ) -> bool {
        let id = connection.id();
        let mut inner = self.inner.lock().await;

        let registered = inner
            .live
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current, connection));
        if !registered {
            // Already evicted or replaced.
            inner.record_gauges();
            return false;
        }
        inner.live.remove(&id);

        let mut missed = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            missed.push(event);
        }

        let parkable = !self.recovery_window.is_zero()
            && connection.is_live().await
            && missed.len() <= self.max_missed_events;
        if parkable {
            let session = DetachedSession {
                nickname: connection.nickname().await,
                filter: connection.filter().await,
                missed,
                last_delivered,
                expires_at: Instant::now() + self.recovery_window,
            };
            inner.detached.insert(id, session);
            info!(connection_id = %id, "connection detached");
        } else {
            info!(connection_id = %id, "connection unregistered");
        }
        inner.record_gauges();
        parkable
    }

    /// Delivers a broadcast to every local connection in `audience`,
    /// including parked sessions. Returns how many live connections got it.
    pub async fn broadcast(&self, event: &BroadcastEvent, audience: Audience) -> usize {
        let mut inner = self.inner.lock().await;
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for connection in inner.live.values() {
            if !audience.includes(connection.id()) {
                continue;
            }
            match connection.deliver(event).await {
                Push::Sent | Push::Buffered => delivered += 1,
                Push::Skipped | Push::Closed => {}
                Push::SlowConsumer => evicted.push(connection.id()),
            }
        }

        for id in evicted {
            if let Some(connection) = inner.live.remove(&id) {
                warn!(connection_id = %id, "disconnecting slow consumer");
                metrics::counter!("relay_slow_consumer_disconnects_total").increment(1);
                connection.close();
            }
        }

        self.park_event(&mut inner, event, audience);
        inner.record_gauges();
        delivered
    }

    fn park_event(&self, inner: &mut RegistryInner, event: &BroadcastEvent, audience: Audience) {
        inner.purge_expired(Instant::now());
        let max_missed = self.max_missed_events;
        inner.detached.retain(|id, session| {
            if !audience.includes(*id) {
                return true;
            }
            let rendered = event.to_client(&session.nickname);
            if session.filter.admits(&rendered) {
                session.missed.push(rendered);
            }
            let keep = session.missed.len() <= max_missed;
            if !keep {
                debug!(connection_id = %id, "detached session overflowed");
            }
            keep
        });
    }

    pub async fn broadcast_all(&self, event: &BroadcastEvent) -> usize {
        self.broadcast(event, Audience::All).await
    }

    pub async fn broadcast_others(&self, origin: ConnectionId, event: &BroadcastEvent) -> usize {
        self.broadcast(event, Audience::AllExcept(origin)).await
    }

    /// Ends every live transport, e.g. on shutdown. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let inner = self.inner.lock().await;
        for connection in inner.live.values() {
            connection.close();
        }
        inner.live.len()
    }

    /// Delivers an event to exactly one local connection.
    pub async fn emit_one(&self, id: ConnectionId, event: ClientEvent) -> bool {
        let Some(connection) = self.get(id).await else {
            return false;
        };
        match connection.emit(event).await {
            Push::Sent | Push::Buffered | Push::Skipped => true,
            Push::Closed => false,
            Push::SlowConsumer => {
                if self.unregister(id).await.is_some() {
                    warn!(connection_id = %id, "disconnecting slow consumer");
                    metrics::counter!("relay_slow_consumer_disconnects_total").increment(1);
                }
                connection.close();
                false
            }
        }
    }
}
