use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Untyped key/value map carried by a log entry. Only used at the
/// serialization boundary; the orchestrator works on normalized events.
pub type Values = serde_json::Map<String, serde_json::Value>;

const STREAM_PREFIX: &str = "user:";
const STREAM_SUFFIX: &str = ":wb";
const DEAD_LETTER_SUFFIX: &str = ":dead";

/// Canonical whiteboard stream key for a user.
pub fn stream_key(user_id: &str) -> String {
    format!("{}{}{}", STREAM_PREFIX, user_id.trim(), STREAM_SUFFIX)
}

/// Stream that receives entries the orchestrator gave up on.
pub fn dead_letter_key(user_id: &str) -> String {
    format!("{}{}", stream_key(user_id), DEAD_LETTER_SUFFIX)
}

/// Recovers the user id from a stream key, if it has the canonical shape.
pub fn user_from_stream(stream: &str) -> Option<&str> {
    stream
        .strip_prefix(STREAM_PREFIX)
        .and_then(|rest| rest.strip_suffix(STREAM_SUFFIX))
        .filter(|user| !user.is_empty())
}

/// Monotonic log entry id: milliseconds timestamp plus a per-millisecond
/// sequence. Ordering is on the `(ms, seq)` tuple, never on the string form
/// ("10-0" sorts after "9-5").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Next id for an append at wall-clock `now_ms`, given the last id in
    /// the stream. Clock regressions reuse the last timestamp.
    pub fn next_after(last: EntryId, now_ms: u64) -> EntryId {
        if now_ms > last.ms {
            EntryId::new(now_ms, 0)
        } else {
            EntryId::new(last.ms, last.seq + 1)
        }
    }

    /// Wall-clock time encoded in the id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.ms as i64)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl Ord for EntryId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ms, self.seq).cmp(&(other.ms, other.seq))
    }
}

impl PartialOrd for EntryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entry id {0:?}: expected <ms>-<seq>")]
pub struct EntryIdParseError(pub String);

impl FromStr for EntryId {
    type Err = EntryIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || EntryIdParseError(s.to_string());
        match trimmed.split_once('-') {
            Some((ms, seq)) => Ok(EntryId {
                ms: ms.parse().map_err(|_| err())?,
                seq: seq.parse().map_err(|_| err())?,
            }),
            // Redis accepts a bare timestamp and treats it as seq 0.
            None => Ok(EntryId {
                ms: trimmed.parse().map_err(|_| err())?,
                seq: 0,
            }),
        }
    }
}

impl Serialize for EntryId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntryId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One immutable entry of a per-user append log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: EntryId,
    pub stream: String,
    pub user_id: String,
    pub thread_id: Option<String>,
    pub values: Values,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    /// Builds an entry from its stored parts, deriving user and thread from
    /// the stream key and the `thread_id` value.
    pub fn from_stored(id: EntryId, stream: &str, values: Values) -> Self {
        let user_id = user_from_stream(stream).unwrap_or_default().to_string();
        let thread_id = values
            .get("thread_id")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Self {
            id,
            stream: stream.to_string(),
            user_id,
            thread_id,
            values,
            created_at: id.timestamp(),
        }
    }

    /// Value of the `type` field, if any.
    pub fn entry_type(&self) -> Option<&str> {
        self.values.get("type").and_then(|v| v.as_str())
    }
}

/// An entry handed out by a consumer group read, with the number of times
/// the group has delivered it (1 on first delivery).
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub entry: LogEntry,
    pub delivery_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_id_orders_numerically_not_lexically() {
        let a: EntryId = "9-5".parse().unwrap();
        let b: EntryId = "10-0".parse().unwrap();
        assert!(a < b);
        assert!("9-5" > "10-0", "string order would get this wrong");
    }

    #[test]
    fn test_entry_id_sequence_breaks_ties() {
        let a = EntryId::new(100, 1);
        let b = EntryId::new(100, 2);
        assert!(a < b);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_entry_id_parse_and_display() {
        let id: EntryId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("42".parse::<EntryId>().unwrap(), EntryId::new(42, 0));
        assert!("abc-1".parse::<EntryId>().is_err());
        assert!("".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_next_after_is_strictly_increasing() {
        let last = EntryId::new(500, 4);
        assert_eq!(EntryId::next_after(last, 600), EntryId::new(600, 0));
        assert_eq!(EntryId::next_after(last, 500), EntryId::new(500, 5));
        // clock went backwards
        assert_eq!(EntryId::next_after(last, 10), EntryId::new(500, 5));
    }

    #[test]
    fn test_stream_keys() {
        assert_eq!(stream_key("u1"), "user:u1:wb");
        assert_eq!(dead_letter_key("u1"), "user:u1:wb:dead");
        assert_eq!(user_from_stream("user:u1:wb"), Some("u1"));
        assert_eq!(user_from_stream("user::wb"), None);
        assert_eq!(user_from_stream("other"), None);
    }

    #[test]
    fn test_from_stored_picks_thread() {
        let mut values = Values::new();
        values.insert("thread_id".into(), json!(" t1 "));
        let entry = LogEntry::from_stored(EntryId::new(1, 0), "user:u1:wb", values);
        assert_eq!(entry.user_id, "u1");
        assert_eq!(entry.thread_id.as_deref(), Some("t1"));
    }
}
