//! Normalizer: raw log entry values into a typed `Event`
//!
//! The event kind comes from the first non-empty discriminator among
//! `type`, `kind` and `event_type`. Either a full type (`prod.overrun`) or a
//! bare kind paired with a `source` field (`source=prod, kind=overrun`) is
//! accepted. Required fields are looked up at top level first, then inside a
//! nested `payload` object. Scalars are stringified and trimmed; an empty
//! string counts as missing.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::{Event, EventKind, EventPayload, LogEntry, ProdSignal, Values};

const DISCRIMINATORS: [&str; 3] = ["type", "kind", "event_type"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no event discriminator (type, kind, event_type)")]
    MissingDiscriminator,

    #[error("unsupported event type {0:?}")]
    UnsupportedKind(String),

    #[error("{kind} is missing required field {field:?}")]
    MissingField { kind: String, field: &'static str },

    #[error("payload for {0} does not belong to its branch")]
    BranchMismatch(String),
}

/// Normalizes one entry's values.
pub fn normalize(values: &Values) -> Result<Event, ValidationError> {
    let kind = resolve_kind(values)?;
    let (source, kind_name) = kind.parts();
    let fields = Fields { values };

    let require = |field: &'static str| {
        fields.scalar(field).ok_or_else(|| ValidationError::MissingField {
            kind: kind.key().to_string(),
            field,
        })
    };

    let payload = match kind {
        EventKind::PlanProposed => EventPayload::PlanProposed {
            delta_id: require("delta_id")?,
            summary: require("summary")?,
            impact: require("impact")?,
        },
        EventKind::PlanNewVersion => EventPayload::PlanNewVersion {
            plan_id: require("plan_id")?,
            version: require("version")?,
        },
        EventKind::ProdOverrun | EventKind::ProdUnderrun | EventKind::ProdNudge => {
            EventPayload::Productivity {
                signal: match kind {
                    EventKind::ProdOverrun => ProdSignal::Overrun,
                    EventKind::ProdUnderrun => ProdSignal::Underrun,
                    _ => ProdSignal::Nudge,
                },
                block_id: require("block_id")?,
                activity_label: require("activity_label")?,
            }
        }
        EventKind::EmailReplyNeeded => EventPayload::EmailReplyNeeded {
            message_id: require("message_id")?,
            sender: require("sender")?,
            summary: require("summary")?,
            draft: require("draft")?,
        },
        EventKind::UserAction => EventPayload::UserAction {
            action_id: require("action_id")?,
            choice: require("choice")?,
            thread_id: fields.scalar("thread_id"),
            metadata: fields.metadata(),
        },
    };

    Ok(Event {
        source: source.to_string(),
        kind: kind_name.to_string(),
        payload,
    })
}

/// Normalizes a log entry.
pub fn normalize_entry(entry: &LogEntry) -> Result<Event, ValidationError> {
    normalize(&entry.values)
}

fn resolve_kind(values: &Values) -> Result<EventKind, ValidationError> {
    let raw = DISCRIMINATORS
        .iter()
        .filter_map(|key| values.get(*key).and_then(scalar_string))
        .map(|s| s.to_lowercase())
        .next()
        .ok_or(ValidationError::MissingDiscriminator)?;

    if let Some(kind) = EventKind::from_discriminator(&raw) {
        return Ok(kind);
    }
    let source = values
        .get("source")
        .and_then(scalar_string)
        .map(|s| s.to_lowercase());
    source
        .and_then(|source| EventKind::from_parts(&source, &raw))
        .ok_or(ValidationError::UnsupportedKind(raw))
}

struct Fields<'a> {
    values: &'a Values,
}

impl<'a> Fields<'a> {
    fn nested(&self) -> Option<&'a Map<String, Value>> {
        self.values.get("payload").and_then(Value::as_object)
    }

    fn lookup(&self, field: &str) -> Option<&'a Value> {
        self.values
            .get(field)
            .filter(|v| !v.is_null())
            .or_else(|| self.nested().and_then(|p| p.get(field)))
    }

    fn scalar(&self, field: &str) -> Option<String> {
        // top-level value may be present but blank while the nested one is set
        self.values
            .get(field)
            .and_then(scalar_string)
            .or_else(|| self.nested().and_then(|p| p.get(field)).and_then(scalar_string))
    }

    fn metadata(&self) -> Option<Map<String, Value>> {
        match self.lookup("metadata")? {
            Value::Object(map) => Some(map.clone()),
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Trimmed string form of a scalar, `None` for blank strings and non-scalars.
fn scalar_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(v: Value) -> Values {
        match v {
            Value::Object(map) => map,
            _ => panic!("test values must be an object"),
        }
    }

    #[test]
    fn test_full_type_discriminator() {
        let evt = normalize(&values(json!({
            "type": "prod.overrun",
            "block_id": " b1 ",
            "activity_label": "coding",
        })))
        .unwrap();
        assert_eq!((evt.source.as_str(), evt.kind.as_str()), ("prod", "overrun"));
        assert_eq!(
            evt.payload,
            EventPayload::Productivity {
                signal: ProdSignal::Overrun,
                block_id: "b1".into(),
                activity_label: "coding".into(),
            }
        );
    }

    #[test]
    fn test_source_and_bare_kind_with_nested_payload() {
        let evt = normalize(&values(json!({
            "source": "prod",
            "kind": "overrun",
            "payload": {"block_id": "b1", "activity_label": "coding"},
        })))
        .unwrap();
        assert_eq!(evt.key().to_string(), "prod.overrun");
    }

    #[test]
    fn test_discriminator_priority() {
        // `type` wins over `kind` even when both are present
        let evt = normalize(&values(json!({
            "type": "calendar.plan.new_version",
            "kind": "overrun",
            "plan_id": "p1",
            "version": 3,
        })))
        .unwrap();
        assert_eq!(
            evt.payload,
            EventPayload::PlanNewVersion {
                plan_id: "p1".into(),
                version: "3".into(),
            }
        );

        let evt = normalize(&values(json!({
            "event_type": "EMAIL.REPLY_NEEDED",
            "message_id": "m1",
            "sender": "ann@example.com",
            "summary": "lunch?",
            "draft": "Sure",
        })))
        .unwrap();
        assert_eq!(evt.key().to_string(), "email.reply_needed");
    }

    #[test]
    fn test_missing_discriminator() {
        let err = normalize(&values(json!({"block_id": "b1"}))).unwrap_err();
        assert_eq!(err, ValidationError::MissingDiscriminator);

        let err = normalize(&values(json!({"type": "   "}))).unwrap_err();
        assert_eq!(err, ValidationError::MissingDiscriminator);
    }

    #[test]
    fn test_unsupported_kind() {
        let err = normalize(&values(json!({"type": "weather.rain"}))).unwrap_err();
        assert_eq!(err, ValidationError::UnsupportedKind("weather.rain".into()));
    }

    #[test]
    fn test_blank_required_field_is_missing() {
        let err = normalize(&values(json!({
            "type": "prod.nudge",
            "block_id": "b1",
            "activity_label": "  ",
        })))
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                kind: "prod.nudge".into(),
                field: "activity_label",
            }
        );
    }

    #[test]
    fn test_user_action_metadata_as_string() {
        let evt = normalize(&values(json!({
            "type": "manager.user_action",
            "action_id": "a1",
            "choice": "accept",
            "thread_id": "t1",
            "metadata": "{\"delta_id\": \"d1\"}",
        })))
        .unwrap();
        match evt.payload {
            EventPayload::UserAction {
                thread_id,
                metadata,
                ..
            } => {
                assert_eq!(thread_id.as_deref(), Some("t1"));
                assert_eq!(metadata.unwrap()["delta_id"], json!("d1"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_extra_fields_are_dropped() {
        let evt = normalize(&values(json!({
            "type": "calendar.plan.proposed",
            "delta_id": "d1",
            "summary": "move gym",
            "impact": "low",
            "secret": "x",
        })))
        .unwrap();
        let v = serde_json::to_value(&evt.payload).unwrap();
        assert!(v.get("secret").is_none());
    }
}
