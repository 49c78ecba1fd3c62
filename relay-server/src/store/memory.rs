use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use shared::models::{Message, NewMessage, SequenceId};
use tokio::sync::RwLock;

use super::{InsertError, MessageLog, StoreError};

/// In-process message log.
///
/// Sequence ids are `1..=N` with no gaps, so `messages[i]` holds id `i + 1`.
/// Used by the test profile and by every test that needs a store.
#[derive(Debug, Default)]
pub struct MemoryMessageLog {
    inner: RwLock<MemoryState>,
    failing_inserts: AtomicUsize,
    failing_queries: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    messages: Vec<Message>,
    tokens: HashSet<String>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` inserts fail with a transient store error.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Makes every query fail until switched off again.
    pub fn fail_queries(&self, failing: bool) {
        self.failing_queries.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn take_insert_fault(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn check_query_fault(&self) -> Result<(), StoreError> {
        if self.failing_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("query failure injected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageLog for MemoryMessageLog {
    async fn insert(&self, message: NewMessage) -> Result<SequenceId, InsertError> {
        if self.take_insert_fault() {
            return Err(StoreError::Unavailable("insert failure injected".into()).into());
        }

        let mut state = self.inner.write().await;
        if let Some(token) = message.idempotency_token.as_ref() {
            if state.tokens.contains(token) {
                return Err(InsertError::Duplicate);
            }
        }

        let sequence_id = SequenceId::try_from(state.messages.len() + 1)
            .map_err(|_| StoreError::Unavailable("sequence space exhausted".into()))?;
        if let Some(token) = message.idempotency_token.clone() {
            state.tokens.insert(token);
        }
        state.messages.push(message.into_message(sequence_id));
        Ok(sequence_id)
    }

    async fn query_after(
        &self,
        after: SequenceId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        self.check_query_fault()?;
        let state = self.inner.read().await;
        let start = usize::try_from(after).unwrap_or(0);
        Ok(state
            .messages
            .get(start..)
            .unwrap_or_default()
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_sequence(&self) -> Result<SequenceId, StoreError> {
        self.check_query_fault()?;
        let state = self.inner.read().await;
        Ok(state
            .messages
            .last()
            .map_or(0, |message| message.sequence_id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_query_fault()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
