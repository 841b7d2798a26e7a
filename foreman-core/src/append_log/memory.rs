//! In-process append log with Redis-Streams-like group semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{AppendLog, GroupRead, GroupStart, LogError};
use crate::models::{Delivery, EntryId, LogEntry, Values};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivery_count: u64,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<LogEntry>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn position_after(&self, id: EntryId) -> usize {
        self.entries.partition_point(|e| e.id <= id)
    }
}

/// Memory-backed `AppendLog`. Nothing survives the process.
#[derive(Default)]
pub struct MemoryAppendLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl MemoryAppendLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of delivered-but-unacknowledged entries for a group.
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Snapshot of every retained entry of a stream, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<LogEntry> {
        self.lock()
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamState>> {
        // A poisoned lock only means another task panicked mid-update of
        // plain data; the map itself is still usable.
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_read_group(&self, read: &GroupRead) -> Result<Vec<Delivery>, LogError> {
        let mut streams = self.lock();
        let missing = || LogError::MissingGroup {
            stream: read.stream.clone(),
            group: read.group.clone(),
        };
        let state = streams.get_mut(&read.stream).ok_or_else(missing)?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group = groups.get_mut(&read.group).ok_or_else(missing)?;
        let now = Instant::now();

        // 1. Reclaim idle pending entries, oldest first. Entries trimmed away
        //    in the meantime are dropped from the pending list.
        let mut reclaimed = Vec::new();
        let mut vanished = Vec::new();
        for (id, pending) in group.pending.iter_mut() {
            if reclaimed.len() >= read.count {
                break;
            }
            if now.duration_since(pending.delivered_at) < read.reclaim_idle {
                continue;
            }
            match entries.binary_search_by(|e| e.id.cmp(id)) {
                Ok(idx) => {
                    pending.consumer = read.consumer.clone();
                    pending.delivery_count += 1;
                    pending.delivered_at = now;
                    reclaimed.push(Delivery {
                        entry: entries[idx].clone(),
                        delivery_count: pending.delivery_count,
                    });
                }
                Err(_) => vanished.push(*id),
            }
        }
        for id in vanished {
            group.pending.remove(&id);
        }
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        // 2. New entries past the group's last delivered id.
        let start = entries.partition_point(|e| e.id <= group.last_delivered);
        let fresh: Vec<Delivery> = entries[start..]
            .iter()
            .take(read.count)
            .map(|entry| Delivery {
                entry: entry.clone(),
                delivery_count: 1,
            })
            .collect();
        for delivery in &fresh {
            group.last_delivered = delivery.entry.id;
            group.pending.insert(
                delivery.entry.id,
                PendingEntry {
                    consumer: read.consumer.clone(),
                    delivery_count: 1,
                    delivered_at: now,
                },
            );
        }
        Ok(fresh)
    }

    fn try_read_after(&self, stream: &str, after: EntryId, count: usize) -> Vec<LogEntry> {
        let streams = self.lock();
        match streams.get(stream) {
            Some(state) => {
                let start = state.position_after(after);
                state.entries[start..].iter().take(count).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Runs `attempt` until it yields something or `block` elapses, waking on
    /// every append.
    async fn wait_for<T, F>(&self, block: Duration, mut attempt: F) -> Result<Vec<T>, LogError>
    where
        F: FnMut() -> Result<Vec<T>, LogError>,
    {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            // Register before checking so an append between the check and
            // the await is not missed.
            notified.as_mut().enable();

            let found = attempt()?;
            if !found.is_empty() || block.is_zero() {
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[async_trait]
impl AppendLog for MemoryAppendLog {
    async fn append_to(&self, stream: &str, values: Values) -> Result<EntryId, LogError> {
        let id = {
            let mut streams = self.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let now_ms = Utc::now().timestamp_millis().max(0) as u64;
            let id = EntryId::next_after(state.last_id, now_ms);
            state.last_id = id;
            state.entries.push(LogEntry::from_stored(id, stream, values));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), LogError> {
        let mut streams = self.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let last_id = state.last_id;
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                last_delivered: match start {
                    GroupStart::Latest => last_id,
                    GroupStart::Earliest => EntryId::ZERO,
                },
                pending: BTreeMap::new(),
            });
        Ok(())
    }

    async fn read_group(&self, read: &GroupRead) -> Result<Vec<Delivery>, LogError> {
        self.wait_for(read.block, || self.try_read_group(read)).await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
        let mut streams = self.lock();
        let Some(group) = streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| group.pending.remove(id).is_some())
            .count() as u64)
    }

    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.wait_for(block, || Ok(self.try_read_after(stream, after, count)))
            .await
    }

    async fn last_id(&self, stream: &str) -> Result<Option<EntryId>, LogError> {
        Ok(self
            .lock()
            .get(stream)
            .and_then(|s| s.entries.last().map(|e| e.id)))
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, LogError> {
        let mut streams = self.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let excess = state.entries.len().saturating_sub(max_len);
        state.entries.drain(..excess);
        Ok(excess as u64)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
