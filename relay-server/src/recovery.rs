//! Session Recovery Engine.
//!
//! Every connection is registered for live delivery before history is read,
//! so nothing published during replay can slip between the two paths; the
//! connection's delivery filter drops whatever both paths carry. Replay
//! failure never refuses a connection: it goes live with a
//! `history_incomplete` marker instead.

use std::sync::Arc;

use shared::{
    config::server::StreamConfig,
    models::{
        ClientEvent, HistoryIncompleteEvent, NicknameEvent, SequenceId, SessionEvent,
    },
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    bus::BroadcastEvent,
    connection::{Connection, ConnectionId},
    fanout::Fanout,
    registry::Registry,
    store::{SharedLog, StoreError},
};

/// What a client presents when it opens a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Highest sequence id the client has already seen.
    pub last_known_offset: SequenceId,
    /// Parked session the client wants to resume.
    pub session: Option<ConnectionId>,
}

#[derive(Debug, Error)]
#[error("replay stopped after sequence id {resume_offset}: {source}")]
pub struct ReplayError {
    pub resume_offset: SequenceId,
    #[source]
    pub source: StoreError,
}

#[derive(Debug)]
pub struct OpenedSession {
    pub connection: Arc<Connection>,
    pub receiver: mpsc::Receiver<ClientEvent>,
    pub recovered: bool,
}

#[derive(Debug)]
pub struct RecoveryEngine {
    log: SharedLog,
    fanout: Arc<Fanout>,
    replay_batch_size: usize,
}

impl RecoveryEngine {
    pub fn new(log: SharedLog, fanout: Arc<Fanout>, config: &StreamConfig) -> Self {
        Self {
            log,
            fanout,
            replay_batch_size: config.replay_batch_size.max(1),
        }
    }

    fn registry(&self) -> &Arc<Registry> {
        self.fanout.registry()
    }

    /// Registers a connection for the handshake and starts bringing it live.
    ///
    /// The returned receiver yields, in order: the `session` event, replayed
    /// messages (unless the session was recovered), an optional
    /// `history_incomplete` marker, the `nickname` event, then live events.
    pub async fn open(self: &Arc<Self>, handshake: Handshake) -> OpenedSession {
        let offset = handshake.last_known_offset.max(0);
        let attached = self.registry().attach(handshake.session, offset).await;
        let connection = Arc::clone(&attached.connection);
        let recovered = attached.recovered;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.bring_live(connection, offset, recovered).await;
        });

        OpenedSession {
            connection: attached.connection,
            receiver: attached.receiver,
            recovered,
        }
    }

    async fn bring_live(&self, connection: Arc<Connection>, offset: SequenceId, recovered: bool) {
        let id = connection.id();
        let nickname = connection.nickname().await;

        let session = ClientEvent::Session(SessionEvent {
            connection_id: id,
            nickname: nickname.clone(),
            recovered,
        });
        if !connection.send_direct(session).await {
            return;
        }

        self.fanout
            .broadcast_others(id, BroadcastEvent::presence(format!("{nickname} has connected")))
            .await;

        if !recovered {
            if let Err(err) = self.replay(&connection, offset).await {
                metrics::counter!("relay_replay_failures_total").increment(1);
                warn!(connection_id = %id, error = %err, "replay failed; continuing live only");
                let marker = ClientEvent::HistoryIncomplete(HistoryIncompleteEvent {
                    resume_offset: err.resume_offset,
                    reason: err.source.code().to_string(),
                });
                if !connection.send_direct(marker).await {
                    return;
                }
            }
        }

        let nickname = ClientEvent::Nickname(NicknameEvent {
            nickname: connection.nickname().await,
        });
        if !connection.send_direct(nickname).await {
            return;
        }

        if connection.go_live().await {
            debug!(connection_id = %id, "connection live");
        }
    }

    /// Replays the stored messages after `offset` up to the log head read
    /// when replay starts. Anything newer reaches the connection live.
    ///
    /// Stops quietly once the client is gone. Returns the number of messages
    /// sent.
    ///
    /// # Errors
    /// Returns a [`ReplayError`] naming the last sequence id replayed when a
    /// page cannot be read.
    pub async fn replay(
        &self,
        connection: &Connection,
        offset: SequenceId,
    ) -> Result<usize, ReplayError> {
        let id = connection.id();
        info!(connection_id = %id, offset, "replay started");

        let head = self
            .log
            .latest_sequence()
            .await
            .map_err(|source| ReplayError {
                resume_offset: offset,
                source,
            })?;

        let mut cursor = offset;
        let mut sent = 0usize;
        'pages: while cursor < head {
            let page = self
                .log
                .query_after(cursor, self.replay_batch_size)
                .await
                .map_err(|source| ReplayError {
                    resume_offset: cursor,
                    source,
                })?;
            let exhausted = page.len() < self.replay_batch_size;

            for message in &page {
                if message.sequence_id > head {
                    break 'pages;
                }
                if !connection.replay(message).await {
                    debug!(connection_id = %id, cursor, "client left during replay");
                    return Ok(sent);
                }
                cursor = message.sequence_id;
                sent += 1;
            }

            if exhausted {
                break;
            }
        }

        metrics::counter!("relay_replay_messages_total").increment(sent as u64);
        info!(connection_id = %id, replayed = sent, head, "replay completed");
        Ok(sent)
    }

    /// Tears a connection down after its transport went away.
    pub async fn close(
        &self,
        connection: Arc<Connection>,
        receiver: mpsc::Receiver<ClientEvent>,
        last_delivered: Option<SequenceId>,
    ) {
        let id = connection.id();
        let nickname = connection.nickname().await;
        self.registry()
            .detach(&connection, receiver, last_delivered)
            .await;
        self.fanout
            .broadcast_others(
                id,
                BroadcastEvent::presence(format!("{nickname} has disconnected")),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::LocalBus,
        connection::ConnectionSeed,
        publisher::Publisher,
        store::{InsertError, MemoryMessageLog, MessageLog},
    };
    use async_trait::async_trait;
    use shared::models::{Message, MessageEvent, NewMessage};
    use std::time::Duration;

    /// A log that gains a message every time it is paged.
    #[derive(Debug)]
    struct BusyLog(Arc<MemoryMessageLog>);

    #[async_trait]
    impl MessageLog for BusyLog {
        async fn insert(&self, message: NewMessage) -> Result<SequenceId, InsertError> {
            self.0.insert(message).await
        }

        async fn query_after(
            &self,
            after: SequenceId,
            limit: usize,
        ) -> Result<Vec<Message>, StoreError> {
            self.0
                .insert(NewMessage::new("late", None, "bob"))
                .await
                .map_err(|_| StoreError::Unavailable("insert failed".into()))?;
            self.0.query_after(after, limit).await
        }

        async fn latest_sequence(&self) -> Result<SequenceId, StoreError> {
            self.0.latest_sequence().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }

        fn name(&self) -> &'static str {
            "busy"
        }
    }

    struct Harness {
        log: Arc<MemoryMessageLog>,
        engine: Arc<RecoveryEngine>,
        publisher: Publisher,
    }

    fn harness(config: &StreamConfig) -> Harness {
        let log = Arc::new(MemoryMessageLog::new());
        let registry = Arc::new(Registry::new(config));
        let fanout = Arc::new(Fanout::new(
            registry,
            Arc::new(LocalBus::new(64)),
            log.clone(),
        ));
        Harness {
            log: log.clone(),
            engine: Arc::new(RecoveryEngine::new(log.clone(), fanout.clone(), config)),
            publisher: Publisher::new(log, fanout),
        }
    }

    fn small_pages() -> StreamConfig {
        StreamConfig {
            replay_batch_size: 2,
            ..StreamConfig::default()
        }
    }

    async fn publish(h: &Harness, range: std::ops::Range<usize>) {
        for index in range {
            h.publisher
                .publish(format!("m{index}"), Some(format!("t{index}")), "alice".into())
                .await
                .unwrap();
        }
    }

    async fn next(receiver: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    /// Reads events until the `nickname` event that ends the handshake.
    async fn handshake_events(receiver: &mut mpsc::Receiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        loop {
            let event = next(receiver).await;
            let done = matches!(event, ClientEvent::Nickname(_));
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn message_ids(events: &[ClientEvent]) -> Vec<SequenceId> {
        events.iter().filter_map(ClientEvent::sequence_id).collect()
    }

    async fn wait_live(connection: &Connection) {
        for _ in 0..100 {
            if connection.is_live().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection never went live");
    }

    #[tokio::test]
    async fn replays_everything_after_the_offset_then_goes_live() {
        let h = harness(&small_pages());
        publish(&h, 0..5).await;

        let mut opened = h
            .engine
            .open(Handshake {
                last_known_offset: 2,
                session: None,
            })
            .await;
        assert!(!opened.recovered);

        let events = handshake_events(&mut opened.receiver).await;
        assert_eq!(events[0].name(), ClientEvent::SESSION);
        assert_eq!(message_ids(&events), vec![3, 4, 5]);

        wait_live(&opened.connection).await;
        publish(&h, 5..6).await;
        let live = next(&mut opened.receiver).await;
        assert_eq!(live.sequence_id(), Some(6));
        assert!(opened.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn client_at_the_head_gets_no_replay() {
        let h = harness(&StreamConfig::default());
        publish(&h, 0..3).await;

        let mut opened = h
            .engine
            .open(Handshake {
                last_known_offset: 3,
                session: None,
            })
            .await;

        let events = handshake_events(&mut opened.receiver).await;
        assert!(message_ids(&events).is_empty());
    }

    #[tokio::test]
    async fn scenario_hi_is_replayed_once_to_a_new_client() {
        let h = harness(&StreamConfig::default());
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
        assert_eq!(first, crate::publisher::PublishOutcome::Accepted { sequence_id: 1 });
        assert_eq!(retry, crate::publisher::PublishOutcome::Duplicate);

        let mut opened = h.engine.open(Handshake::default()).await;
        let events = handshake_events(&mut opened.receiver).await;
        let messages: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ClientEvent::Message(message) => Some(message.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            messages,
            vec![MessageEvent {
                content: "hi".into(),
                sequence_id: 1,
                author: "alice".into(),
                is_own: false,
            }]
        );
    }

    #[tokio::test]
    async fn publishes_during_replay_arrive_exactly_once() {
        let h = harness(&small_pages());
        publish(&h, 0..20).await;

        let mut opened = h.engine.open(Handshake::default()).await;
        // Publish concurrently with the replay task.
        for index in 20..30 {
            h.publisher
                .publish(format!("m{index}"), Some(format!("t{index}")), "bob".into())
                .await
                .unwrap();
        }

        let mut ids = message_ids(&handshake_events(&mut opened.receiver).await);
        wait_live(&opened.connection).await;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), opened.receiver.recv()).await
        {
            ids.extend(event.sequence_id());
        }

        ids.sort_unstable();
        assert_eq!(ids, (1..=30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn replay_stops_at_the_head_seen_when_it_started() {
        let config = small_pages();
        let memory = Arc::new(MemoryMessageLog::new());
        for index in 0..3 {
            memory
                .insert(NewMessage::new(format!("m{index}"), None, "alice"))
                .await
                .unwrap();
        }
        let log: SharedLog = Arc::new(BusyLog(memory.clone()));
        let fanout = Arc::new(Fanout::new(
            Arc::new(Registry::new(&config)),
            Arc::new(LocalBus::new(8)),
            log.clone(),
        ));
        let engine = RecoveryEngine::new(log, fanout, &config);
        let (connection, mut receiver) = Connection::new(ConnectionSeed::fresh(64), 64, 64);

        assert_eq!(engine.replay(&connection, 0).await.unwrap(), 3);

        let mut ids = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            ids.extend(event.sequence_id());
        }
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(memory.latest_sequence().await.unwrap() > 3);
    }

    #[tokio::test]
    async fn replay_failure_goes_live_with_a_marker() {
        let h = harness(&StreamConfig::default());
        publish(&h, 0..2).await;
        h.log.fail_queries(true);

        let mut opened = h
            .engine
            .open(Handshake {
                last_known_offset: 1,
                session: None,
            })
            .await;
        let events = handshake_events(&mut opened.receiver).await;

        let marker = events
            .iter()
            .find_map(|event| match event {
                ClientEvent::HistoryIncomplete(marker) => Some(marker.clone()),
                _ => None,
            })
            .expect("history_incomplete marker");
        assert_eq!(marker.resume_offset, 1);
        assert_eq!(marker.reason, "store_unavailable");
        assert!(message_ids(&events).is_empty());

        wait_live(&opened.connection).await;
        h.log.fail_queries(false);
        publish(&h, 2..3).await;
        assert_eq!(next(&mut opened.receiver).await.sequence_id(), Some(3));
    }

    #[tokio::test]
    async fn new_connections_are_announced_to_others() {
        let h = harness(&StreamConfig::default());
        let mut first = h.engine.open(Handshake::default()).await;
        handshake_events(&mut first.receiver).await;
        wait_live(&first.connection).await;

        let mut second = h.engine.open(Handshake::default()).await;
        let nickname = second.connection.nickname().await;
        let own = handshake_events(&mut second.receiver).await;
        assert!(
            own.iter()
                .all(|event| event.name() != ClientEvent::PRESENCE)
        );

        match next(&mut first.receiver).await {
            ClientEvent::Presence(presence) => {
                assert_eq!(presence.text, format!("{nickname} has connected"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn resumed_session_skips_replay() {
        let h = harness(&StreamConfig::default());
        publish(&h, 0..2).await;

        let mut first = h.engine.open(Handshake::default()).await;
        let events = handshake_events(&mut first.receiver).await;
        assert_eq!(message_ids(&events), vec![1, 2]);
        wait_live(&first.connection).await;
        let id = first.connection.id();

        h.engine
            .close(Arc::clone(&first.connection), first.receiver, Some(2))
            .await;
        publish(&h, 2..3).await;

        let mut resumed = h
            .engine
            .open(Handshake {
                last_known_offset: 2,
                session: Some(id),
            })
            .await;
        assert!(resumed.recovered);

        let events = handshake_events(&mut resumed.receiver).await;
        match &events[0] {
            ClientEvent::Session(session) => {
                assert!(session.recovered);
                assert_eq!(session.connection_id, id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(message_ids(&events).is_empty());

        // Missed messages follow the handshake.
        wait_live(&resumed.connection).await;
        let mut ids = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), resumed.receiver.recv()).await
        {
            ids.extend(event.sequence_id());
        }
        assert_eq!(ids, vec![3]);
    }
}
