use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::envelope::Target;
use crate::error::Result;

/// One persisted outbox row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub owner_id: String,
    pub channel: String,
    pub data: String,
    pub target: String,
    pub target_server: Option<String>,
    pub created_at: i64,
    pub attempts: i32,
    pub last_attempt_at: i64,
}

/// Pluggable outbox persistence, keyed by owner so components sharing one
/// database never cross-deliver each other's rows.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn enqueue(
        &self,
        owner_id: &str,
        target: Target,
        target_server: Option<&str>,
        channel: &str,
        data: &str,
        created_at: i64,
    ) -> Result<i64>;

    /// Pending rows for this owner in insertion order, at most `limit`.
    async fn fetch_batch(&self, owner_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<()>;

    async fn record_attempt(&self, id: i64, now: i64) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryOutboxStore {
    ids: AtomicI64,
    messages: Mutex<BTreeMap<i64, StoredMessage>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn messages_lock(&self) -> MutexGuard<'_, BTreeMap<i64, StoredMessage>> {
        match self.messages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(
        &self,
        owner_id: &str,
        target: Target,
        target_server: Option<&str>,
        channel: &str,
        data: &str,
        created_at: i64,
    ) -> Result<i64> {
        let id = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        self.messages_lock().insert(
            id,
            StoredMessage {
                id,
                owner_id: owner_id.to_string(),
                channel: channel.to_string(),
                data: data.to_string(),
                target: target.as_str().to_string(),
                target_server: target_server.map(str::to_string),
                created_at,
                attempts: 0,
                last_attempt_at: 0,
            },
        );
        Ok(id)
    }

    async fn fetch_batch(&self, owner_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        if limit == 0 || owner_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .messages_lock()
            .values()
            .filter(|message| message.owner_id == owner_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<()> {
        let mut messages = self.messages_lock();
        for id in ids {
            messages.remove(id);
        }
        Ok(())
    }

    async fn record_attempt(&self, id: i64, now: i64) -> Result<()> {
        if let Some(message) = self.messages_lock().get_mut(&id) {
            message.attempts += 1;
            message.last_attempt_at = now;
        }
        Ok(())
    }
}
