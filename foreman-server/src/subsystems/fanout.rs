//! Live fanout: independent tails of a user stream for push subscribers.
//!
//! Each subscription owns a reader task with its own cursor, optionally
//! filtered to one thread, feeding a bounded buffer. A slow subscriber never
//! blocks its reader: on overflow the buffer either drops its oldest entry or
//! closes, per `[fanout] overflow`. Dropping the `Subscription` cancels the
//! reader, including a read blocked in the log.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foreman_core::append_log::{tail, TailFrom};
use foreman_core::config::{FanoutConfig, OverflowPolicy};
use foreman_core::models::{stream_key, LogEntry};
use foreman_core::{AppendLog, LogError};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::{CancellationToken, DropGuard};

const ERROR_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub user_id: String,
    pub thread_id: Option<String>,
    pub from: TailFrom,
}

// ============================================================================
// Bounded buffer
// ============================================================================

/// Sending half of one subscriber's channel, owned by its reader task.
/// Capacity is rounded up to a power of two, the granularity of the
/// underlying broadcast ring.
struct SubscriberBuffer {
    tx: broadcast::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
    closed: AtomicBool,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl SubscriberBuffer {
    fn new(capacity: usize, overflow: OverflowPolicy) -> (Self, broadcast::Receiver<LogEntry>) {
        let capacity = capacity.max(1).next_power_of_two();
        let (tx, rx) = broadcast::channel(capacity);
        let buffer = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            closed: AtomicBool::new(false),
            capacity,
            overflow,
        };
        (buffer, rx)
    }

    /// Never waits. Returns false once the buffer is closed or the
    /// subscriber is gone.
    fn push(&self, entry: LogEntry) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        if self.tx.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::DropOldest => {
                    // The send below overwrites the oldest unread entry.
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        user = %entry.user_id,
                        dropped = dropped,
                        "Subscriber buffer full, dropped oldest entry"
                    );
                }
                OverflowPolicy::Disconnect => {
                    tracing::warn!(user = %entry.user_id, "Subscriber buffer full, disconnecting");
                    self.closed.store(true, Ordering::Relaxed);
                    return false;
                }
            }
        }
        self.tx.send(entry).is_ok()
    }
}

/// Next buffered entry. A lag was already counted when the entry was
/// overwritten, so it is skipped here.
async fn next_entry(rx: &mut broadcast::Receiver<LogEntry>) -> Option<LogEntry> {
    loop {
        match rx.recv().await {
            Ok(entry) => return Some(entry),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped = skipped, "Subscriber lagged");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle held by one subscriber. Drop it to unsubscribe.
pub struct Subscription {
    rx: broadcast::Receiver<LogEntry>,
    dropped: Arc<AtomicU64>,
    _guard: DropGuard,
}

impl Subscription {
    /// Next entry, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        next_entry(&mut self.rx).await
    }

    /// Entries discarded by the drop-oldest policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn into_stream(self) -> impl Stream<Item = LogEntry> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|entry| (entry, sub))
        })
    }
}

// ============================================================================
// Fanout
// ============================================================================

pub struct Fanout {
    log: Arc<dyn AppendLog>,
    config: FanoutConfig,
}

impl Fanout {
    pub fn new(log: Arc<dyn AppendLog>, config: FanoutConfig) -> Self {
        Self { log, config }
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.config.keepalive_secs.max(1))
    }

    /// Opens a tail for `request`. The starting cursor is resolved before
    /// returning, so entries appended afterwards are always delivered.
    pub async fn subscribe(&self, request: SubscribeRequest) -> Result<Subscription, LogError> {
        let stream = stream_key(&request.user_id);
        let entries = tail(
            Arc::clone(&self.log),
            stream,
            request.from,
            self.config.batch_size,
            Duration::from_millis(self.config.block_ms),
        )
        .await?;

        let (buffer, rx) = SubscriberBuffer::new(self.config.buffer_capacity, self.config.overflow);
        let dropped = Arc::clone(&buffer.dropped);
        let cancel = CancellationToken::new();
        let thread_filter = request
            .thread_id
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        tracing::debug!(
            user = %request.user_id,
            thread = thread_filter.as_deref().unwrap_or("*"),
            "Subscriber attached"
        );
        tokio::spawn(pump(entries, thread_filter, buffer, cancel.clone()));

        Ok(Subscription {
            rx,
            dropped,
            _guard: cancel.drop_guard(),
        })
    }
}

async fn pump<S>(
    entries: S,
    thread_filter: Option<String>,
    buffer: SubscriberBuffer,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<LogEntry, LogError>> + Send,
{
    let mut entries = Box::pin(entries);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = entries.next() => next,
        };
        match next {
            Some(Ok(entry)) => {
                if let Some(thread) = &thread_filter {
                    if entry.thread_id.as_deref() != Some(thread.as_str()) {
                        continue;
                    }
                }
                if !buffer.push(entry) {
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Tail read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(ERROR_BACKOFF_MS)) => {}
                }
            }
            None => break,
        }
    }
    // Dropping the sender closes the subscription once it drains.
    drop(buffer);
    tracing::debug!("Subscriber detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::models::{EntryId, Values};

    fn entry(id: u64, thread: &str) -> LogEntry {
        let mut values = Values::new();
        values.insert("thread_id".into(), thread.into());
        LogEntry::from_stored(EntryId::new(id, 0), "user:u1:wb", values)
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let (buffer, mut rx) = SubscriberBuffer::new(2, OverflowPolicy::DropOldest);
        for id in 1..=4 {
            assert!(buffer.push(entry(id, "t1")));
        }
        assert_eq!(buffer.dropped.load(Ordering::Relaxed), 2);
        assert_eq!(next_entry(&mut rx).await.unwrap().id, EntryId::new(3, 0));
        assert_eq!(next_entry(&mut rx).await.unwrap().id, EntryId::new(4, 0));
    }

    #[tokio::test]
    async fn test_capacity_rounds_up_to_power_of_two() {
        let (buffer, mut rx) = SubscriberBuffer::new(3, OverflowPolicy::DropOldest);
        for id in 1..=5 {
            assert!(buffer.push(entry(id, "t1")));
        }
        assert_eq!(buffer.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(next_entry(&mut rx).await.unwrap().id, EntryId::new(2, 0));
    }

    #[tokio::test]
    async fn test_disconnect_closes_after_drain() {
        let (buffer, mut rx) = SubscriberBuffer::new(1, OverflowPolicy::Disconnect);
        assert!(buffer.push(entry(1, "t1")));
        assert!(!buffer.push(entry(2, "t1")));
        assert!(!buffer.push(entry(3, "t1")));
        drop(buffer);
        assert_eq!(next_entry(&mut rx).await.unwrap().id, EntryId::new(1, 0));
        assert!(next_entry(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_push_fails_once_subscriber_is_gone() {
        let (buffer, rx) = SubscriberBuffer::new(4, OverflowPolicy::DropOldest);
        assert!(buffer.push(entry(1, "t1")));
        drop(rx);
        assert!(!buffer.push(entry(2, "t1")));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (buffer, mut rx) = SubscriberBuffer::new(4, OverflowPolicy::DropOldest);
        let reader = tokio::spawn(async move { next_entry(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        buffer.push(entry(9, "t1"));
        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().id, EntryId::new(9, 0));
    }
}
