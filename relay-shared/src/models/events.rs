//! Events pushed to a connected client over the stream.
//!
//! On the wire every event is an SSE frame whose `event:` field is
//! [`ClientEvent::name`] and whose `data:` field is the JSON body of the
//! variant. Message events also carry their sequence id as the SSE `id:`, so
//! a browser reconnect resumes through `Last-Event-ID`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::SequenceId;

/// First event on every stream: who the client is and how it was resumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEvent {
    pub connection_id: Uuid,
    pub nickname: String,
    /// True when the server resumed a dropped session without store replay.
    pub recovered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageEvent {
    pub content: String,
    pub sequence_id: SequenceId,
    pub author: String,
    /// Whether the receiving connection authored this message. Never persisted.
    pub is_own: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceEvent {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NicknameEvent {
    pub nickname: String,
}

/// Marks a hole in replayed history: replay stopped after `resume_offset`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryIncompleteEvent {
    pub resume_offset: SequenceId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Session(SessionEvent),
    Message(MessageEvent),
    Presence(PresenceEvent),
    Nickname(NicknameEvent),
    HistoryIncomplete(HistoryIncompleteEvent),
}

impl ClientEvent {
    pub const SESSION: &'static str = "session";
    pub const MESSAGE: &'static str = "message";
    pub const PRESENCE: &'static str = "presence";
    pub const NICKNAME: &'static str = "nickname";
    pub const HISTORY_INCOMPLETE: &'static str = "history_incomplete";

    /// SSE event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session(_) => Self::SESSION,
            Self::Message(_) => Self::MESSAGE,
            Self::Presence(_) => Self::PRESENCE,
            Self::Nickname(_) => Self::NICKNAME,
            Self::HistoryIncomplete(_) => Self::HISTORY_INCOMPLETE,
        }
    }

    /// Sequence id for message events, used as the SSE event id.
    #[must_use]
    pub fn sequence_id(&self) -> Option<SequenceId> {
        match self {
            Self::Message(message) => Some(message.sequence_id),
            _ => None,
        }
    }

    /// Serializes the event body.
    ///
    /// # Errors
    /// Returns an error if the body cannot be encoded as JSON.
    pub fn data_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Session(event) => serde_json::to_string(event),
            Self::Message(event) => serde_json::to_string(event),
            Self::Presence(event) => serde_json::to_string(event),
            Self::Nickname(event) => serde_json::to_string(event),
            Self::HistoryIncomplete(event) => serde_json::to_string(event),
        }
    }

    /// Rebuilds an event from an SSE event name and its data.
    ///
    /// Returns `Ok(None)` for event names this version does not know.
    ///
    /// # Errors
    /// Returns an error if the data does not match the named event.
    pub fn from_parts(name: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        let event = match name {
            Self::SESSION => Self::Session(serde_json::from_str(data)?),
            Self::MESSAGE => Self::Message(serde_json::from_str(data)?),
            Self::PRESENCE => Self::Presence(serde_json::from_str(data)?),
            Self::NICKNAME => Self::Nickname(serde_json::from_str(data)?),
            Self::HISTORY_INCOMPLETE => Self::HistoryIncomplete(serde_json::from_str(data)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_message_events_carry_a_sequence_id() {
        let message = ClientEvent::Message(MessageEvent {
            content: "hi".into(),
            sequence_id: 1,
            author: "User-0000".into(),
            is_own: false,
        });
        let presence = ClientEvent::Presence(PresenceEvent {
            text: "User-0000 has connected".into(),
        });

        assert_eq!(message.sequence_id(), Some(1));
        assert_eq!(presence.sequence_id(), None);
    }

    #[test]
    fn events_rebuild_from_wire_parts() {
        let event = ClientEvent::HistoryIncomplete(HistoryIncompleteEvent {
            resume_offset: 42,
            reason: "store unavailable".into(),
        });

        let data = event.data_json().unwrap();
        let rebuilt = ClientEvent::from_parts(event.name(), &data).unwrap();

        assert_eq!(rebuilt, Some(event));
    }

    #[test]
    fn unknown_event_names_are_ignored() {
        assert_eq!(ClientEvent::from_parts("ping", "{}").unwrap(), None);
        assert!(ClientEvent::from_parts("message", "{}").is_err());
    }
}
