use serde::Serialize;

/// Dispatch key for routing: the `(source, kind)` pair of a normalized event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub source: String,
    pub kind: String,
}

impl EventKey {
    pub fn new(source: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.source, self.kind)
    }
}

/// Every event type the normalizer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PlanProposed,
    PlanNewVersion,
    ProdOverrun,
    ProdUnderrun,
    ProdNudge,
    EmailReplyNeeded,
    UserAction,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::PlanProposed,
        EventKind::PlanNewVersion,
        EventKind::ProdOverrun,
        EventKind::ProdUnderrun,
        EventKind::ProdNudge,
        EventKind::EmailReplyNeeded,
        EventKind::UserAction,
    ];

    /// `(source, kind)` as producers write them.
    pub fn parts(self) -> (&'static str, &'static str) {
        match self {
            EventKind::PlanProposed => ("calendar", "plan.proposed"),
            EventKind::PlanNewVersion => ("calendar", "plan.new_version"),
            EventKind::ProdOverrun => ("prod", "overrun"),
            EventKind::ProdUnderrun => ("prod", "underrun"),
            EventKind::ProdNudge => ("prod", "nudge"),
            EventKind::EmailReplyNeeded => ("email", "reply_needed"),
            EventKind::UserAction => ("manager", "user_action"),
        }
    }

    pub fn key(self) -> EventKey {
        let (source, kind) = self.parts();
        EventKey::new(source, kind)
    }

    /// Fields that must be present (non-empty) for this kind.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            EventKind::PlanProposed => &["delta_id", "summary", "impact"],
            EventKind::PlanNewVersion => &["plan_id", "version"],
            EventKind::ProdOverrun | EventKind::ProdUnderrun | EventKind::ProdNudge => {
                &["block_id", "activity_label"]
            }
            EventKind::EmailReplyNeeded => &["message_id", "sender", "summary", "draft"],
            EventKind::UserAction => &["action_id", "choice"],
        }
    }

    /// Exact lookup of an explicit `(source, kind)` pair.
    pub fn from_parts(source: &str, kind: &str) -> Option<EventKind> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.parts() == (source, kind))
    }

    /// Lookup by the compound discriminator written in `type` ("prod.overrun").
    pub fn from_discriminator(discriminator: &str) -> Option<EventKind> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.key().to_string() == discriminator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProdSignal {
    Overrun,
    Underrun,
    Nudge,
}

/// Typed payload, one variant per event family.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    PlanProposed {
        delta_id: String,
        summary: String,
        impact: String,
    },
    PlanNewVersion {
        plan_id: String,
        version: String,
    },
    Productivity {
        #[serde(skip)]
        signal: ProdSignal,
        block_id: String,
        activity_label: String,
    },
    EmailReplyNeeded {
        message_id: String,
        sender: String,
        summary: String,
        draft: String,
    },
    UserAction {
        action_id: String,
        choice: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    },
}

impl EventPayload {
    /// Payload fields that identify the semantic intent of an effect
    /// triggered by this event. Free text (summaries, drafts) is excluded so
    /// that a re-worded duplicate still maps to the same key.
    pub fn stable_fields(&self) -> Vec<&str> {
        match self {
            EventPayload::PlanProposed { delta_id, .. } => vec![delta_id],
            EventPayload::PlanNewVersion { plan_id, version } => vec![plan_id, version],
            EventPayload::Productivity {
                block_id,
                activity_label,
                ..
            } => vec![block_id, activity_label],
            EventPayload::EmailReplyNeeded { message_id, .. } => vec![message_id],
            EventPayload::UserAction {
                action_id, choice, ..
            } => vec![action_id, choice],
        }
    }
}

/// A normalized, validated event. Derived from a log entry, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub source: String,
    pub kind: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.source.clone(), self.kind.clone())
    }

    /// Human label used in prompts and logs, e.g. the activity of a block.
    pub fn subject(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Productivity { activity_label, .. } => Some(activity_label),
            EventPayload::PlanProposed { summary, .. } => Some(summary),
            EventPayload::EmailReplyNeeded { sender, .. } => Some(sender),
            _ => None,
        }
    }
}
