//! Per-connection delivery state.
//!
//! A connection starts in [`Phase::Recovering`]: live events are buffered
//! while history is replayed straight into the outbound channel. Going live
//! drains the buffer and from then on live events are pushed directly. A
//! [`DeliveryFilter`] sits in front of both paths so no sequence id reaches
//! the client twice. The recovery buffer is bounded; a connection whose
//! buffer overflows before it goes live is closed as a slow consumer.

use std::collections::BTreeSet;

use shared::models::{ClientEvent, Message, MessageEvent, SequenceId};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::BroadcastEvent;

pub type ConnectionId = Uuid;

/// Nickname assigned to a fresh connection: `User-` and four hex digits of its id.
#[must_use]
pub fn default_nickname(id: ConnectionId) -> String {
    let simple = id.simple().to_string();
    format!("User-{}", &simple[..4])
}

/// Remembers which message sequence ids were already handed to a client.
///
/// Holds the most recent `window` ids exactly. Once the window is full, ids
/// older than the oldest retained one count as delivered.
#[derive(Debug, Clone)]
pub struct DeliveryFilter {
    window: usize,
    seen: BTreeSet<SequenceId>,
}

impl DeliveryFilter {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            seen: BTreeSet::new(),
        }
    }

    /// Records `sequence_id` and returns whether it had not been delivered yet.
    pub fn admit(&mut self, sequence_id: SequenceId) -> bool {
        if self.seen.len() >= self.window {
            if let Some(&floor) = self.seen.first() {
                if sequence_id < floor {
                    return false;
                }
            }
        }
        if !self.seen.insert(sequence_id) {
            return false;
        }
        while self.seen.len() > self.window {
            self.seen.pop_first();
        }
        true
    }

    /// Like [`DeliveryFilter::admit`] for any event; events without a
    /// sequence id always pass.
    pub fn admits(&mut self, event: &ClientEvent) -> bool {
        event.sequence_id().is_none_or(|id| self.admit(id))
    }
}

#[derive(Debug)]
enum Phase {
    Recovering { buffered: Vec<ClientEvent> },
    Live,
}

#[derive(Debug)]
struct ConnectionState {
    nickname: String,
    phase: Phase,
    filter: DeliveryFilter,
    /// Already filtered events inherited from a parked session.
    backlog: Vec<ClientEvent>,
}

/// Result of pushing one event towards a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Sent,
    Buffered,
    /// Already delivered; dropped by the filter.
    Skipped,
    /// The outbound channel or the recovery buffer is full. The caller
    /// disconnects the client.
    SlowConsumer,
    Closed,
}

/// Everything a connection starts from.
#[derive(Debug)]
pub struct ConnectionSeed {
    pub id: ConnectionId,
    pub nickname: String,
    pub filter: DeliveryFilter,
    /// Events to deliver before anything live. They already passed `filter`.
    pub backlog: Vec<ClientEvent>,
}

impl ConnectionSeed {
    pub fn fresh(dedup_window: usize) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            nickname: default_nickname(id),
            filter: DeliveryFilter::new(dedup_window),
            backlog: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<ClientEvent>,
    closed: CancellationToken,
    buffer_limit: usize,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Creates a recovering connection and the receiver its transport drains.
    ///
    /// At most `buffer_limit` live events are held while recovering.
    pub fn new(
        seed: ConnectionSeed,
        capacity: usize,
        buffer_limit: usize,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let connection = Self {
            id: seed.id,
            sender,
            closed: CancellationToken::new(),
            buffer_limit: buffer_limit.max(1),
            state: Mutex::new(ConnectionState {
                nickname: seed.nickname,
                phase: Phase::Recovering {
                    buffered: Vec::new(),
                },
                filter: seed.filter,
                backlog: seed.backlog,
            }),
        };
        (connection, receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn nickname(&self) -> String {
        self.state.lock().await.nickname.clone()
    }

    /// Renames the connection and returns the previous nickname.
    pub async fn rename(&self, nickname: String) -> String {
        let mut state = self.state.lock().await;
        std::mem::replace(&mut state.nickname, nickname)
    }

    pub async fn is_live(&self) -> bool {
        matches!(self.state.lock().await.phase, Phase::Live)
    }

    /// Fires when the connection must stop streaming.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Sends an event ahead of everything else, waiting for channel space.
    pub async fn send_direct(&self, event: ClientEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }

    /// Delivers a broadcast rendered for this connection's nickname.
    pub async fn deliver(&self, event: &BroadcastEvent) -> Push {
        let mut state = self.state.lock().await;
        let rendered = event.to_client(&state.nickname);
        self.push_locked(&mut state, rendered)
    }

    /// Delivers an event addressed to this connection only.
    pub async fn emit(&self, event: ClientEvent) -> Push {
        let mut state = self.state.lock().await;
        self.push_locked(&mut state, event)
    }

    fn push_locked(&self, state: &mut ConnectionState, event: ClientEvent) -> Push {
        if self.closed.is_cancelled() {
            return Push::Closed;
        }
        match &mut state.phase {
            Phase::Recovering { buffered } => {
                if buffered.len() >= self.buffer_limit {
                    buffered.clear();
                    self.closed.cancel();
                    return Push::SlowConsumer;
                }
                buffered.push(event);
                Push::Buffered
            }
            Phase::Live => {
                if !state.filter.admits(&event) {
                    return Push::Skipped;
                }
                match self.sender.try_send(event) {
                    Ok(()) => Push::Sent,
                    Err(mpsc::error::TrySendError::Full(_)) => Push::SlowConsumer,
                    Err(mpsc::error::TrySendError::Closed(_)) => Push::Closed,
                }
            }
        }
    }

    /// Sends one replayed message; returns `false` once the client is gone.
    pub async fn replay(&self, message: &Message) -> bool {
        let event = {
            let mut state = self.state.lock().await;
            if !state.filter.admit(message.sequence_id) {
                return true;
            }
            ClientEvent::Message(MessageEvent {
                content: message.content.clone(),
                sequence_id: message.sequence_id,
                author: message.author.clone(),
                is_own: message.author == state.nickname,
            })
        };
        !self.closed.is_cancelled() && self.send_direct(event).await
    }

    /// Flushes buffered events in arrival order and switches to live delivery.
    ///
    /// Returns `false` if the connection was closed or the client went away
    /// while flushing.
    pub async fn go_live(&self) -> bool {
        loop {
            if self.closed.is_cancelled() {
                return false;
            }
            let pending = {
                let mut state = self.state.lock().await;
                let ConnectionState {
                    phase,
                    filter,
                    backlog,
                    ..
                } = &mut *state;
                let Phase::Recovering { buffered } = phase else {
                    return true;
                };
                if backlog.is_empty() && buffered.is_empty() {
                    *phase = Phase::Live;
                    return true;
                }
                let mut pending = std::mem::take(backlog);
                pending.extend(
                    std::mem::take(buffered)
                        .into_iter()
                        .filter(|event| filter.admits(event)),
                );
                pending
            };

            for event in pending {
                if self.closed.is_cancelled() || !self.send_direct(event).await {
                    return false;
                }
            }
        }
    }

    /// Snapshot of the delivery filter, carried into a parked session.
    pub async fn filter(&self) -> DeliveryFilter {
        self.state.lock().await.filter.clone()
    }
}
