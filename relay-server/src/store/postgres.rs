use async_trait::async_trait;
use shared::models::{Message, NewMessage, SequenceId};
use sqlx::PgPool;
use tracing::trace;

use super::{InsertError, MessageLog, StoreError};

/// Name of the unique constraint on `relay_messages.idempotency_token`.
pub(crate) const IDEMPOTENCY_CONSTRAINT: &str = "relay_messages_idempotency_token_key";

/// Message log backed by the `relay_messages` table.
#[derive(Debug, Clone)]
pub struct PgMessageLog {
    pool: PgPool,
}

impl PgMessageLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    sequence_id: i64,
    idempotency_token: Option<String>,
    author: String,
    content: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            sequence_id: row.sequence_id,
            idempotency_token: row.idempotency_token,
            author: row.author,
            content: row.content,
        }
    }
}

#[async_trait]
impl MessageLog for PgMessageLog {
    async fn insert(&self, message: NewMessage) -> Result<SequenceId, InsertError> {
        let sequence_id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO relay_messages (idempotency_token, author, content) VALUES ($1, $2, $3) RETURNING sequence_id",
        )
        .bind(message.idempotency_token)
        .bind(message.author)
        .bind(message.content)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_insert_error)?;

        trace!(sequence_id, "inserted message");
        Ok(sequence_id)
    }

    async fn query_after(
        &self,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT sequence_id, idempotency_token, author, content FROM relay_messages WHERE sequence_id > $1 ORDER BY sequence_id ASC LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn latest_sequence(&self) -> Result<SequenceId, StoreError> {
        let latest = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM relay_messages",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Maps an insert failure onto the publish taxonomy.
///
/// Only a unique violation on the idempotency constraint is a duplicate;
/// every other failure leaves the outcome unknown and must be retried.
fn classify_insert_error(err: sqlx::Error) -> InsertError {
    if let sqlx::Error::Database(db_err) = &err {
        let on_token = db_err
            .constraint()
            .is_none_or(|constraint| constraint == IDEMPOTENCY_CONSTRAINT);
        if db_err.is_unique_violation() && on_token {
            return InsertError::Duplicate;
        }
    }
    InsertError::Store(StoreError::Database(err))
}
