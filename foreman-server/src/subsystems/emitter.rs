//! Result emitter: writes orchestrator output back into the log.
//!
//! Prompts go to the user's own stream as `manager.prompt`, linked to the
//! triggering entry through `wb_parent_id`. Entries the orchestrator gives up
//! on go to the dead-letter stream.

use std::sync::Arc;
use std::time::Duration;

use foreman_core::models::{dead_letter_key, Delivery, EntryId, Event, LogEntry, Values};
use foreman_core::{AppendLog, LogError};
use serde_json::json;

pub const PROMPT_TYPE: &str = "manager.prompt";
pub const DEAD_LETTER_TYPE: &str = "manager.dead_letter";

const SCAN_BATCH: usize = 100;

pub fn is_prompt(entry: &LogEntry) -> bool {
    entry.entry_type() == Some(PROMPT_TYPE)
}

pub struct Emitter {
    log: Arc<dyn AppendLog>,
    recovery_scan_limit: usize,
}

impl Emitter {
    pub fn new(log: Arc<dyn AppendLog>, recovery_scan_limit: usize) -> Self {
        Self {
            log,
            recovery_scan_limit,
        }
    }

    pub async fn emit_prompt(
        &self,
        parent: &LogEntry,
        thread_id: &str,
        event: &Event,
        content: &str,
        idempotency_key: &str,
    ) -> Result<EntryId, LogError> {
        let mut values = Values::new();
        values.insert("type".into(), json!(PROMPT_TYPE));
        values.insert("source".into(), json!(event.source));
        values.insert("kind".into(), json!(event.kind));
        values.insert("wb_parent_id".into(), json!(parent.id.to_string()));
        values.insert("content".into(), json!(content));
        values.insert("idempotency_key".into(), json!(idempotency_key));

        let id = self
            .log
            .append(&parent.user_id, Some(thread_id), values)
            .await?;
        tracing::info!(
            user = %parent.user_id,
            thread = thread_id,
            entry = %parent.id,
            prompt = %id,
            "Prompt emitted"
        );
        Ok(id)
    }

    /// Looks forward from `parent` for a prompt already emitted for it.
    /// Bounded by the recovery scan limit.
    pub async fn find_prompt(&self, parent: &LogEntry) -> Result<Option<EntryId>, LogError> {
        let parent_id = parent.id.to_string();
        let mut cursor = parent.id;
        let mut scanned = 0;

        while scanned < self.recovery_scan_limit {
            let count = SCAN_BATCH.min(self.recovery_scan_limit - scanned);
            let batch = self
                .log
                .read_after(&parent.stream, cursor, count, Duration::ZERO)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = last.id;
            scanned += batch.len();

            let found = batch.iter().find(|entry| {
                is_prompt(entry)
                    && entry.values.get("wb_parent_id").and_then(|v| v.as_str())
                        == Some(parent_id.as_str())
            });
            if let Some(prompt) = found {
                return Ok(Some(prompt.id));
            }
        }
        Ok(None)
    }

    /// `attempts` counts actual processing attempts, which can be fewer than
    /// the log's delivery count when the entry waited behind a failure.
    pub async fn dead_letter(
        &self,
        delivery: &Delivery,
        attempts: u64,
        event: &Event,
        error: &str,
    ) -> Result<EntryId, LogError> {
        let entry = &delivery.entry;
        let mut values = Values::new();
        values.insert("type".into(), json!(DEAD_LETTER_TYPE));
        values.insert("wb_parent_id".into(), json!(entry.id.to_string()));
        values.insert("source".into(), json!(event.source));
        values.insert("kind".into(), json!(event.kind));
        values.insert("error".into(), json!(error));
        values.insert("attempts".into(), json!(attempts));
        values.insert("deliveries".into(), json!(delivery.delivery_count));
        if let Some(thread) = &entry.thread_id {
            values.insert("thread_id".into(), json!(thread));
        }
        self.log
            .append_to(&dead_letter_key(&entry.user_id), values)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::models::{stream_key, EventPayload, ProdSignal};
    use foreman_core::MemoryAppendLog;

    fn overrun() -> Event {
        Event {
            source: "prod".into(),
            kind: "overrun".into(),
            payload: EventPayload::Productivity {
                signal: ProdSignal::Overrun,
                block_id: "b1".into(),
                activity_label: "coding".into(),
            },
        }
    }

    async fn parent(log: &MemoryAppendLog) -> LogEntry {
        let mut values = Values::new();
        values.insert("type".into(), json!("prod.overrun"));
        let id = log.append("u1", Some("t1"), values).await.unwrap();
        log.entries(&stream_key("u1"))
            .into_iter()
            .find(|e| e.id == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_prompt_is_linked_and_found_again() {
        let log = Arc::new(MemoryAppendLog::new());
        let emitter = Emitter::new(log.clone(), 50);
        let parent = parent(&log).await;

        assert_eq!(emitter.find_prompt(&parent).await.unwrap(), None);

        let id = emitter
            .emit_prompt(&parent, "t1", &overrun(), "Extend coding?", "prompt:k")
            .await
            .unwrap();

        let stored = log.entries(&stream_key("u1"));
        let prompt = stored.iter().find(|e| e.id == id).unwrap();
        assert!(is_prompt(prompt));
        assert_eq!(prompt.values["wb_parent_id"], json!(parent.id.to_string()));
        assert_eq!(prompt.thread_id.as_deref(), Some("t1"));

        assert_eq!(emitter.find_prompt(&parent).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_scan_limit_bounds_recovery() {
        let log = Arc::new(MemoryAppendLog::new());
        let emitter = Emitter::new(log.clone(), 3);
        let parent = parent(&log).await;
        for _ in 0..5 {
            log.append("u1", Some("t1"), Values::new()).await.unwrap();
        }
        Emitter::new(log.clone(), 100)
            .emit_prompt(&parent, "t1", &overrun(), "late", "prompt:k")
            .await
            .unwrap();

        assert_eq!(emitter.find_prompt(&parent).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dead_letter_goes_to_dead_stream() {
        let log = Arc::new(MemoryAppendLog::new());
        let emitter = Emitter::new(log.clone(), 10);
        let entry = parent(&log).await;
        let delivery = Delivery {
            entry,
            delivery_count: 7,
        };
        emitter
            .dead_letter(&delivery, 5, &overrun(), "policy down")
            .await
            .unwrap();

        let dead = log.entries("user:u1:wb:dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].entry_type(), Some(DEAD_LETTER_TYPE));
        assert_eq!(dead[0].values["attempts"], json!(5));
        assert_eq!(dead[0].values["deliveries"], json!(7));
    }
}
