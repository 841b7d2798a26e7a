use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CheckpointError, CheckpointStore};
use crate::models::Checkpoint;

struct Stored {
    checkpoint: Checkpoint,
    expires_at: Instant,
}

/// In-process checkpoint store with TTL.
pub struct MemoryCheckpointStore {
    ttl: Duration,
    rows: Mutex<HashMap<(String, String), Stored>>,
}

impl MemoryCheckpointStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Stored>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, user_id: &str, thread_id: &str) -> Result<Checkpoint, CheckpointError> {
        let rows = self.lock();
        let key = (user_id.to_string(), thread_id.to_string());
        Ok(match rows.get(&key) {
            Some(stored) if stored.expires_at > Instant::now() => stored.checkpoint.clone(),
            _ => Checkpoint::empty(user_id, thread_id),
        })
    }

    async fn save(
        &self,
        user_id: &str,
        thread_id: &str,
        update: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        let now = Instant::now();
        let mut rows = self.lock();
        let stored = rows
            .entry((user_id.to_string(), thread_id.to_string()))
            .or_insert_with(|| Stored {
                checkpoint: Checkpoint::empty(user_id, thread_id),
                expires_at: now,
            });
        if stored.expires_at <= now {
            stored.checkpoint = Checkpoint::empty(user_id, thread_id);
        }
        stored.checkpoint.merge(update);
        stored.expires_at = now + self.ttl;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, CheckpointError> {
        let now = Instant::now();
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|_, stored| stored.expires_at > now);
        Ok((before - rows.len()) as u64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
