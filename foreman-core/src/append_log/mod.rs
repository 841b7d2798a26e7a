//! Append log: durable per-user streams of whiteboard entries
//!
//! Provides an `AppendLog` trait with implementations for:
//! - **Redis Streams**: production backend (`XADD` / `XREADGROUP` / `XAUTOCLAIM`)
//! - **Memory**: in-process backend with the same consumer-group semantics,
//!   used by tests and the `--dev` profile
//!
//! Two read paths exist and never share state:
//! - group reads (`read_group` + `ack`): at-least-once, the orchestrator's path
//! - tail reads (`read_after` / [`tail`]): best-effort, a private cursor per caller

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use thiserror::Error;

use crate::models::entry::EntryIdParseError;
use crate::models::{stream_key, Delivery, EntryId, LogEntry, Values};

pub mod memory;
pub mod redis_streams;

pub use self::memory::MemoryAppendLog;
pub use self::redis_streams::RedisAppendLog;

// ============================================================================
// Error types
// ============================================================================

/// Transport-level failures. Callers retry these with backoff; a failure never
/// moves a consumer group's position.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Consumer group {group} does not exist on {stream}")]
    MissingGroup { stream: String, group: String },

    #[error(transparent)]
    InvalidId(#[from] EntryIdParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LogError {
    pub fn is_missing_group(&self) -> bool {
        matches!(self, LogError::MissingGroup { .. })
    }
}

// ============================================================================
// Read parameters
// ============================================================================

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    Latest,
    Earliest,
}

/// One consumer-group read.
///
/// Pending entries (delivered but never acknowledged) that have been idle for
/// at least `reclaim_idle` are redelivered first, oldest id first, and with
/// their delivery count incremented. Only when none are eligible does the
/// read wait up to `block` for new entries. An empty result means the block
/// timeout elapsed.
#[derive(Debug, Clone)]
pub struct GroupRead {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub count: usize,
    pub block: Duration,
    pub reclaim_idle: Duration,
}

// ============================================================================
// AppendLog trait
// ============================================================================

#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Appends `values` to `stream` and returns the assigned id.
    async fn append_to(&self, stream: &str, values: Values) -> Result<EntryId, LogError>;

    /// Appends to a user's stream, stamping `ts` when absent and copying the
    /// thread id into the stored values.
    async fn append(
        &self,
        user_id: &str,
        thread_id: Option<&str>,
        mut values: Values,
    ) -> Result<EntryId, LogError> {
        if !values.contains_key("ts") {
            values.insert("ts".to_string(), Utc::now().to_rfc3339().into());
        }
        if let Some(thread) = thread_id.map(str::trim).filter(|t| !t.is_empty()) {
            values.insert("thread_id".to_string(), thread.into());
        }
        self.append_to(&stream_key(user_id), values).await
    }

    /// Creates the consumer group (and the stream) if missing. Idempotent.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), LogError>;

    /// At-least-once group read; every returned entry must later be `ack`ed.
    async fn read_group(&self, read: &GroupRead) -> Result<Vec<Delivery>, LogError>;

    /// Acknowledges entries for `group`. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError>;

    /// Entries with id strictly greater than `after`, waiting up to `block`
    /// when there are none. A zero `block` never waits.
    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError>;

    /// Id of the newest entry, or `None` for an empty or missing stream.
    async fn last_id(&self, stream: &str) -> Result<Option<EntryId>, LogError>;

    /// Trims the stream to roughly `max_len` newest entries. Returns the
    /// number of entries removed.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, LogError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Live tail
// ============================================================================

/// Starting point of a tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailFrom {
    /// Only entries appended after the tail is opened.
    Now,
    /// Resume after a cursor the caller already saw.
    After(EntryId),
}

impl TailFrom {
    /// Parses an optional resume cursor; blank or `$` means "now".
    pub fn parse(raw: Option<&str>) -> Result<Self, EntryIdParseError> {
        match raw.map(str::trim) {
            None | Some("") | Some("$") => Ok(TailFrom::Now),
            Some(id) => id.parse().map(TailFrom::After),
        }
    }
}

struct TailState {
    log: Arc<dyn AppendLog>,
    stream: String,
    cursor: EntryId,
    count: usize,
    block: Duration,
    buffered: VecDeque<LogEntry>,
}

/// Opens a lazy, unacknowledged tail over `stream`.
///
/// The cursor is private to the returned stream. Transport errors are
/// yielded as items and the tail keeps going from the same cursor, so the
/// caller decides whether to back off or stop. Dropping the stream stops it.
pub async fn tail(
    log: Arc<dyn AppendLog>,
    stream: String,
    from: TailFrom,
    count: usize,
    block: Duration,
) -> Result<impl Stream<Item = Result<LogEntry, LogError>> + Send + 'static, LogError> {
    let cursor = match from {
        TailFrom::After(id) => id,
        TailFrom::Now => log.last_id(&stream).await?.unwrap_or(EntryId::ZERO),
    };

    let state = TailState {
        log,
        stream,
        cursor,
        count: count.max(1),
        block,
        buffered: VecDeque::new(),
    };

    Ok(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(entry) = state.buffered.pop_front() {
                return Some((Ok(entry), state));
            }
            match state
                .log
                .read_after(&state.stream, state.cursor, state.count, state.block)
                .await
            {
                Ok(batch) => {
                    if let Some(last) = batch.last() {
                        state.cursor = last.id;
                    }
                    state.buffered.extend(batch);
                }
                Err(e) => return Some((Err(e), state)),
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn values(pairs: &[(&str, &str)]) -> Values {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_tail_from_parse() {
        assert_eq!(TailFrom::parse(None).unwrap(), TailFrom::Now);
        assert_eq!(TailFrom::parse(Some(" $ ")).unwrap(), TailFrom::Now);
        assert_eq!(
            TailFrom::parse(Some("5-1")).unwrap(),
            TailFrom::After(EntryId::new(5, 1))
        );
        assert!(TailFrom::parse(Some("nope")).is_err());
    }

    #[tokio::test]
    async fn test_append_stamps_ts_and_thread() {
        let log = MemoryAppendLog::new();
        let id = log
            .append("u1", Some(" t1 "), values(&[("type", "prod.nudge")]))
            .await
            .unwrap();
        let entries = log
            .read_after("user:u1:wb", EntryId::ZERO, 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].thread_id.as_deref(), Some("t1"));
        assert!(entries[0].values.contains_key("ts"));
    }

    #[tokio::test]
    async fn test_tail_now_skips_history_and_resume_does_not() {
        let log: Arc<dyn AppendLog> = Arc::new(MemoryAppendLog::new());
        let first = log
            .append("u1", Some("t1"), values(&[("n", "1")]))
            .await
            .unwrap();

        let mut live = Box::pin(
            tail(log.clone(), "user:u1:wb".into(), TailFrom::Now, 10, Duration::from_millis(50))
                .await
                .unwrap(),
        );
        let mut resumed = Box::pin(
            tail(
                log.clone(),
                "user:u1:wb".into(),
                TailFrom::After(EntryId::ZERO),
                10,
                Duration::from_millis(50),
            )
            .await
            .unwrap(),
        );

        let second = log
            .append("u1", Some("t1"), values(&[("n", "2")]))
            .await
            .unwrap();

        let got = live.next().await.unwrap().unwrap();
        assert_eq!(got.id, second, "live tail must not replay history");

        let a = resumed.next().await.unwrap().unwrap();
        let b = resumed.next().await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
    }
}
