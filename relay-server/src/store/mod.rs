//! Durable Log Store.
//!
//! An append-only, totally ordered log of broadcast messages. The store alone
//! assigns sequence ids and enforces idempotency-token uniqueness; nothing
//! above it takes a lock to serialize publishes.

mod memory;
mod postgres;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use shared::models::{Message, NewMessage, SequenceId};
use thiserror::Error;

pub use memory::MemoryMessageLog;
pub use postgres::PgMessageLog;

pub type SharedLog = Arc<dyn MessageLog>;

/// A store failure that says nothing about whether a message exists.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Failure class safe to show clients; the detail stays in the logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_)
            | Self::Database(
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed,
            ) => "store_unavailable",
            Self::Database(_) => "store_error",
        }
    }
}

#[derive(Debug, Error)]
pub enum InsertError {
    /// The idempotency token is already stored: an earlier attempt succeeded.
    #[error("idempotency token already stored")]
    Duplicate,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait MessageLog: Send + Sync + Debug {
    /// Appends a message and returns the sequence id the store assigned.
    async fn insert(&self, message: NewMessage) -> Result<SequenceId, InsertError>;

    /// Returns up to `limit` messages with `sequence_id > after`, ascending.
    ///
    /// Callers page through larger ranges by re-issuing the query with the
    /// last sequence id they received.
    async fn query_after(
        &self,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Highest sequence id stored so far, or `0` for an empty log.
    async fn latest_sequence(&self) -> Result<SequenceId, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}
