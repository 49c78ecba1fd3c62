use serde::{Deserialize, Serialize};

/// Position of a message in the global durable order.
///
/// Assigned by the store at insert time; `0` means "nothing seen yet".
pub type SequenceId = i64;

/// A durably stored broadcast message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Store-assigned position in the global order.
    pub sequence_id: SequenceId,

    /// Client-chosen token that makes the publish safe to retry.
    pub idempotency_token: Option<String>,

    /// Nickname of the publisher at publish time.
    pub author: String,

    /// Opaque message body.
    pub content: String,
}

/// A message that has not been assigned a sequence id yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub idempotency_token: Option<String>,
    pub author: String,
}

impl NewMessage {
    pub fn new(
        content: impl Into<String>,
        idempotency_token: Option<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            idempotency_token,
            author: author.into(),
        }
    }

    /// Attaches the sequence id the store assigned.
    #[must_use]
    pub fn into_message(self, sequence_id: SequenceId) -> Message {
        Message {
            sequence_id,
            idempotency_token: self.idempotency_token,
            author: self.author,
            content: self.content,
        }
    }
}

/// Request body for publishing a message through a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishRequest {
    pub content: String,
    /// Reuse the same token when retrying an unacknowledged publish.
    #[serde(default)]
    pub idempotency_token: Option<String>,
}

/// How the server classified an acknowledged publish.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    Duplicate,
}

/// Acknowledgement returned for a publish.
///
/// Both statuses mean "stored"; a client must not retry after either one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishAck {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<SequenceId>,
}

impl PublishAck {
    #[must_use]
    pub fn accepted(sequence_id: SequenceId) -> Self {
        Self {
            status: AckStatus::Accepted,
            sequence_id: Some(sequence_id),
        }
    }

    #[must_use]
    pub fn duplicate() -> Self {
        Self {
            status: AckStatus::Duplicate,
            sequence_id: None,
        }
    }
}

/// Request body for changing a connection's nickname.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NicknameRequest {
    pub nickname: String,
}
