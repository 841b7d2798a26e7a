//! Orchestrator status counters, exposed on `/health` and IPC `health`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreman_core::models::EntryId;
use serde::Serialize;

use super::graph::Outcome;

#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub processed: u64,
    pub prompts: u64,
    pub recovered: u64,
    pub dispatches: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Last entry seen per `user/thread`.
    pub last_entries: BTreeMap<String, EntryId>,
    pub last_error: Option<LastError>,
}

/// Threads tracked in `last_entries`; beyond this the stalest is evicted.
const MAX_TRACKED_THREADS: usize = 1024;

#[derive(Default)]
struct Tracked {
    last_entries: BTreeMap<String, EntryId>,
    last_error: Option<LastError>,
}

impl Tracked {
    fn remember(&mut self, key: String, id: EntryId) {
        let full = self.last_entries.len() >= MAX_TRACKED_THREADS;
        if full && !self.last_entries.contains_key(&key) {
            let stalest = self
                .last_entries
                .iter()
                .min_by_key(|(_, id)| **id)
                .map(|(k, _)| k.clone());
            if let Some(stalest) = stalest {
                self.last_entries.remove(&stalest);
            }
        }
        self.last_entries.insert(key, id);
    }
}

pub struct Status {
    started_at: DateTime<Utc>,
    processed: AtomicU64,
    prompts: AtomicU64,
    recovered: AtomicU64,
    dispatches: AtomicU64,
    duplicates: AtomicU64,
    invalid: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    tracked: Mutex<Tracked>,
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            processed: AtomicU64::new(0),
            prompts: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            tracked: Mutex::new(Tracked::default()),
        }
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, user_id: &str, thread_id: Option<&str>, id: EntryId, outcome: &Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Prompted { .. } => Some(&self.prompts),
            Outcome::Recovered { .. } => Some(&self.recovered),
            Outcome::Routed { .. } => Some(&self.dispatches),
            Outcome::Duplicate { .. } => Some(&self.duplicates),
            Outcome::Invalid(_) | Outcome::NoThread => Some(&self.invalid),
            Outcome::Failed { .. } => Some(&self.failed),
            Outcome::DeadLettered { .. } => Some(&self.dead_lettered),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let mut tracked = self.tracked();
        if let Some(thread) = thread_id {
            tracked.remember(format!("{user_id}/{thread}"), id);
        }
        match outcome {
            Outcome::Failed { error } | Outcome::DeadLettered { error, .. } => {
                tracked.last_error = Some(LastError {
                    message: error.clone(),
                    at: Utc::now(),
                });
            }
            _ => {}
        }
    }

    /// Records a loop-level failure (transport, ack).
    pub fn record_error(&self, message: impl Into<String>) {
        self.tracked().last_error = Some(LastError {
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let tracked = self.tracked();
        StatusSnapshot {
            started_at: self.started_at,
            processed: self.processed.load(Ordering::Relaxed),
            prompts: self.prompts.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            dispatches: self.dispatches.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_entries: tracked.last_entries.clone(),
            last_error: tracked.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_and_tracks_threads() {
        let status = Status::new();
        status.record(
            "u1",
            Some("t1"),
            EntryId::new(1, 0),
            &Outcome::Prompted {
                prompt_id: EntryId::new(2, 0),
                key: "prompt:k".into(),
            },
        );
        status.record(
            "u1",
            Some("t1"),
            EntryId::new(3, 0),
            &Outcome::Duplicate {
                key: "prompt:k".into(),
            },
        );
        status.record("u1", None, EntryId::new(4, 0), &Outcome::NoThread);

        let snap = status.snapshot();
        assert_eq!(snap.processed, 3);
        assert_eq!(snap.prompts, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.invalid, 1);
        assert_eq!(snap.last_entries["u1/t1"], EntryId::new(3, 0));
        assert!(snap.last_error.is_none());
    }

    #[test]
    fn test_tracked_threads_are_bounded() {
        let status = Status::new();
        for n in 0..(MAX_TRACKED_THREADS as u64 + 10) {
            status.record(
                "u1",
                Some(&format!("t{n}")),
                EntryId::new(n + 1, 0),
                &Outcome::Duplicate { key: "k".into() },
            );
        }
        // Refreshing a tracked thread never evicts.
        status.record(
            "u1",
            Some("t20"),
            EntryId::new(5000, 0),
            &Outcome::Duplicate { key: "k".into() },
        );

        let snap = status.snapshot();
        assert_eq!(snap.last_entries.len(), MAX_TRACKED_THREADS);
        assert!(!snap.last_entries.contains_key("u1/t0"));
        assert!(!snap.last_entries.contains_key("u1/t9"));
        assert_eq!(snap.last_entries["u1/t10"], EntryId::new(11, 0));
        assert_eq!(snap.last_entries["u1/t20"], EntryId::new(5000, 0));
    }

    #[test]
    fn test_failures_set_last_error() {
        let status = Status::new();
        status.record(
            "u1",
            Some("t1"),
            EntryId::new(1, 0),
            &Outcome::Failed {
                error: "policy down".into(),
            },
        );
        assert_eq!(status.snapshot().last_error.unwrap().message, "policy down");

        status.record_error("redis gone");
        let snap = status.snapshot();
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.last_error.unwrap().message, "redis gone");
    }
}
