//! Checkpoint store: durable per-(user, thread) progress
//!
//! Implementations:
//! - **Redis**: hash for scalars + set for side effect keys, TTL on both
//! - **Postgres**: one row per thread plus a side effect table, `expires_at`
//! - **Memory**: tests and `--dev`
//!
//! Every store honours the same write rules: scalars present in an update
//! win, `last_entry_id` never moves backwards, `side_effect_keys` is only ever
//! unioned, and every write refreshes the retention TTL.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::entry::EntryIdParseError;
use crate::models::{Checkpoint, EntryId, Event};

pub mod memory;
pub mod postgres;
pub mod redis_store;

pub use self::memory::MemoryCheckpointStore;
pub use self::postgres::PgCheckpointStore;
pub use self::redis_store::RedisCheckpointStore;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    InvalidId(#[from] EntryIdParseError),
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Current checkpoint, or a zero-value one when nothing was saved yet.
    async fn get(&self, user_id: &str, thread_id: &str) -> Result<Checkpoint, CheckpointError>;

    /// Field-level upsert of `update` (see module docs).
    async fn save(
        &self,
        user_id: &str,
        thread_id: &str,
        update: &Checkpoint,
    ) -> Result<(), CheckpointError>;

    /// Removes expired checkpoints. Returns how many were removed. Stores with
    /// native expiry return 0.
    async fn sweep_expired(&self) -> Result<u64, CheckpointError>;

    fn name(&self) -> &str;
}

/// True iff `id` is at or before the checkpoint's last processed entry.
pub fn should_skip(id: EntryId, last: Option<EntryId>) -> bool {
    last.is_some_and(|last| id <= last)
}

pub fn has_side_effect(checkpoint: &Checkpoint, key: &str) -> bool {
    checkpoint.side_effect_keys.contains(key)
}

// ============================================================================
// Idempotency keys
// ============================================================================

/// Joins the stable fields with `:`. `%` and `:` inside a field are
/// percent-encoded so distinct field tuples never share a suffix.
fn stable_suffix(event: &Event) -> String {
    event
        .payload
        .stable_fields()
        .into_iter()
        .map(escape_field)
        .collect::<Vec<_>>()
        .join(":")
}

fn escape_field(field: &str) -> String {
    field.replace('%', "%25").replace(':', "%3A")
}

/// Key of a user-facing prompt triggered by `event`.
pub fn prompt_key(event: &Event) -> String {
    format!("prompt:{}:{}:{}", event.source, event.kind, stable_suffix(event))
}

/// Key of a dispatch of `event` to `target`.
pub fn route_key(target: &str, event: &Event) -> String {
    format!(
        "route:{}:{}:{}:{}",
        target,
        event.source,
        event.kind,
        stable_suffix(event)
    )
}
