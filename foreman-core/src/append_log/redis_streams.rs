//! Redis Streams backend.
//!
//! Field values are stored as strings. Non-string JSON values are written as
//! JSON text; on read, text that parses as a JSON object or array is restored.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use serde_json::Value;

use super::{AppendLog, GroupRead, GroupStart, LogError};
use crate::models::{Delivery, EntryId, LogEntry, Values};

/// One raw XAUTOCLAIM entry: `[id, [field, value, ...]]`. Entries deleted
/// while pending come back as nil on older servers.
type ClaimedEntry = Option<(String, Vec<(String, String)>)>;

pub struct RedisAppendLog {
    client: redis::Client,
}

impl RedisAppendLog {
    pub fn new(url: &str) -> Result<Self, LogError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LogError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Round-trips a PING. Used by the health endpoint.
    pub async fn ping(&self) -> Result<(), LogError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn reclaim(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        read: &GroupRead,
    ) -> Result<Vec<Delivery>, LogError> {
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&read.stream)
            .arg(&read.group)
            .arg(&read.consumer)
            .arg(read.reclaim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(read.count)
            .query_async(conn)
            .await
            .map_err(|e| group_error(e, read))?;

        let claimed: Vec<ClaimedEntry> = match reply.get(1) {
            Some(value) => redis::from_redis_value(value)?,
            None => Vec::new(),
        };
        let mut entries = Vec::with_capacity(claimed.len());
        for (id, fields) in claimed.into_iter().flatten() {
            let id: EntryId = id.parse()?;
            entries.push(LogEntry::from_stored(id, &read.stream, decode_pairs(fields)));
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let counts = self.delivery_counts(conn, read, &entries).await?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let delivery_count = counts.get(&entry.id).copied().unwrap_or(2);
                Delivery {
                    entry,
                    delivery_count,
                }
            })
            .collect())
    }

    /// Delivery counts of freshly reclaimed entries, from XPENDING.
    async fn delivery_counts(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        read: &GroupRead,
        entries: &[LogEntry],
    ) -> Result<HashMap<EntryId, u64>, LogError> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.id, last.id),
            _ => return Ok(HashMap::new()),
        };
        // Rows are [id, consumer, idle_ms, delivery_count].
        let rows: Vec<Vec<redis::Value>> = redis::cmd("XPENDING")
            .arg(&read.stream)
            .arg(&read.group)
            .arg(first.to_string())
            .arg(last.to_string())
            .arg(entries.len())
            .arg(&read.consumer)
            .query_async(conn)
            .await
            .map_err(|e| group_error(e, read))?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in rows {
            if let (Some(id), Some(delivered)) = (row.first(), row.get(3)) {
                let id: String = redis::from_redis_value(id)?;
                let delivered: u64 = redis::from_redis_value(delivered)?;
                counts.insert(id.parse()?, delivered);
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl AppendLog for RedisAppendLog {
    async fn append_to(&self, stream: &str, values: Values) -> Result<EntryId, LogError> {
        let mut conn = self.connection().await?;
        let fields = encode_values(&values)?;
        let id: String = conn.xadd(stream, "*", fields.as_slice()).await?;
        Ok(id.parse()?)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), LogError> {
        let mut conn = self.connection().await?;
        let from = match start {
            GroupStart::Latest => "$",
            GroupStart::Earliest => "0",
        };
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(stream, group, from)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(&self, read: &GroupRead) -> Result<Vec<Delivery>, LogError> {
        let mut conn = self.connection().await?;

        let reclaimed = self.reclaim(&mut conn, read).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let mut opts = StreamReadOptions::default()
            .group(&read.group, &read.consumer)
            .count(read.count);
        if !read.block.is_zero() {
            opts = opts.block(read.block.as_millis() as usize);
        }
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&read.stream], &[">"], &opts)
            .await
            .map_err(|e| group_error(e, read))?;

        let mut out = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                out.push(Delivery {
                    entry: decode_entry(&key.key, id)?,
                    delivery_count: 1,
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let ids: Vec<String> = ids.iter().map(EntryId::to_string).collect();
        Ok(conn.xack(stream, group, &ids).await?)
    }

    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError> {
        let mut conn = self.connection().await?;
        let mut opts = StreamReadOptions::default().count(count);
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[after.to_string()], &opts)
            .await?;

        let mut out = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for id in key.ids {
                out.push(decode_entry(&key.key, id)?);
            }
        }
        Ok(out)
    }

    async fn last_id(&self, stream: &str) -> Result<Option<EntryId>, LogError> {
        let mut conn = self.connection().await?;
        let reply: StreamRangeReply = conn.xrevrange_count(stream, "+", "-", 1).await?;
        match reply.ids.first() {
            Some(newest) => Ok(Some(newest.id.parse()?)),
            None => Ok(None),
        }
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, LogError> {
        let mut conn = self.connection().await?;
        Ok(conn.xtrim(stream, StreamMaxlen::Approx(max_len)).await?)
    }

    fn name(&self) -> &str {
        "redis"
    }
}

fn group_error(e: RedisError, read: &GroupRead) -> LogError {
    if e.code() == Some("NOGROUP") {
        LogError::MissingGroup {
            stream: read.stream.clone(),
            group: read.group.clone(),
        }
    } else {
        e.into()
    }
}

// ============================================================================
// Value codec
// ============================================================================

pub(crate) fn encode_values(values: &Values) -> Result<Vec<(String, String)>, LogError> {
    values
        .iter()
        .map(|(k, v)| {
            let text = match v {
                Value::String(s) => s.clone(),
                other => serde_json::to_string(other)?,
            };
            Ok((k.clone(), text))
        })
        .collect()
}

pub(crate) fn decode_value(raw: String) -> Value {
    let looks_structured = matches!(raw.trim_start().as_bytes().first(), Some(b'{' | b'['));
    if looks_structured {
        if let Ok(parsed @ (Value::Object(_) | Value::Array(_))) = serde_json::from_str(&raw) {
            return parsed;
        }
    }
    Value::String(raw)
}

fn decode_pairs(fields: Vec<(String, String)>) -> Values {
    fields
        .into_iter()
        .map(|(k, v)| (k, decode_value(v)))
        .collect()
}

fn decode_entry(stream: &str, raw: StreamId) -> Result<LogEntry, LogError> {
    let id: EntryId = raw.id.parse()?;
    let mut values = Values::new();
    for (field, value) in raw.map {
        let text: String = redis::from_redis_value(&value)?;
        values.insert(field, decode_value(text));
    }
    Ok(LogEntry::from_stored(id, stream, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_stringifies_non_strings() {
        let mut values = Values::new();
        values.insert("type".into(), json!("prod.overrun"));
        values.insert("attempts".into(), json!(3));
        values.insert("payload".into(), json!({"block_id": "b1"}));

        let encoded: HashMap<String, String> = encode_values(&values).unwrap().into_iter().collect();
        assert_eq!(encoded["type"], "prod.overrun");
        assert_eq!(encoded["attempts"], "3");
        assert_eq!(encoded["payload"], r#"{"block_id":"b1"}"#);
    }

    #[test]
    fn test_decode_restores_structured_json_only() {
        assert_eq!(decode_value(r#"{"a":1}"#.into()), json!({"a": 1}));
        assert_eq!(decode_value("[1,2]".into()), json!([1, 2]));
        assert_eq!(decode_value("3".into()), json!("3"));
        assert_eq!(decode_value("{not json".into()), json!("{not json"));
        assert_eq!(decode_value("coding".into()), json!("coding"));
    }
}
