//! Routing table: `(source, kind)` to processing branch.

use std::collections::HashMap;

use foreman_core::models::{Checkpoint, EntryId, Event, EventKey, EventKind, EventPayload};
use foreman_core::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    Calendar,
    Productivity,
    Email,
    UserAction,
}

impl Branch {
    pub fn as_str(self) -> &'static str {
        match self {
            Branch::Calendar => "calendar",
            Branch::Productivity => "productivity",
            Branch::Email => "email",
            Branch::UserAction => "user_action",
        }
    }

    fn accepts(self, payload: &EventPayload) -> bool {
        matches!(
            (self, payload),
            (Branch::Calendar, EventPayload::PlanProposed { .. })
                | (Branch::Calendar, EventPayload::PlanNewVersion { .. })
                | (Branch::Productivity, EventPayload::Productivity { .. })
                | (Branch::Email, EventPayload::EmailReplyNeeded { .. })
                | (Branch::UserAction, EventPayload::UserAction { .. })
        )
    }
}

/// A routed event plus the branch-specific context it contributes to the
/// checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub branch: Branch,
    pub last_plan_id: Option<String>,
    pub last_plan_version: Option<String>,
}

impl Prepared {
    /// Checkpoint update recording progress up to `entry_id`.
    pub fn checkpoint_update(&self, user_id: &str, thread_id: &str, entry_id: EntryId) -> Checkpoint {
        let mut update = Checkpoint::empty(user_id, thread_id);
        update.last_entry_id = Some(entry_id);
        update.last_plan_id = self.last_plan_id.clone();
        update.last_plan_version = self.last_plan_version.clone();
        update
    }
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<EventKey, Branch>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl RoutingTable {
    /// Every supported event kind mapped to its branch.
    pub fn standard() -> Self {
        let routes = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let branch = match kind {
                    EventKind::PlanProposed | EventKind::PlanNewVersion => Branch::Calendar,
                    EventKind::ProdOverrun | EventKind::ProdUnderrun | EventKind::ProdNudge => {
                        Branch::Productivity
                    }
                    EventKind::EmailReplyNeeded => Branch::Email,
                    EventKind::UserAction => Branch::UserAction,
                };
                (kind.key(), branch)
            })
            .collect();
        Self { routes }
    }

    pub fn branch(&self, key: &EventKey) -> Option<Branch> {
        self.routes.get(key).copied()
    }

    /// Routes `event` and gathers the branch's context.
    pub fn prepare(&self, event: &Event) -> Result<Prepared, ValidationError> {
        let key = event.key();
        let branch = self
            .branch(&key)
            .ok_or_else(|| ValidationError::UnsupportedKind(key.to_string()))?;
        if !branch.accepts(&event.payload) {
            return Err(ValidationError::BranchMismatch(key.to_string()));
        }

        let (last_plan_id, last_plan_version) = match &event.payload {
            EventPayload::PlanProposed { delta_id, .. } => (Some(delta_id.clone()), None),
            EventPayload::PlanNewVersion { plan_id, version } => {
                (Some(plan_id.clone()), Some(version.clone()))
            }
            _ => (None, None),
        };

        Ok(Prepared {
            branch,
            last_plan_id,
            last_plan_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::models::ProdSignal;

    fn event(source: &str, kind: &str, payload: EventPayload) -> Event {
        Event {
            source: source.into(),
            kind: kind.into(),
            payload,
        }
    }

    #[test]
    fn test_every_kind_has_a_branch() {
        let table = RoutingTable::standard();
        for kind in EventKind::ALL {
            assert!(table.branch(&kind.key()).is_some(), "{kind:?} unrouted");
        }
        assert_eq!(table.branch(&EventKey::new("manager", "prompt")), None);
    }

    #[test]
    fn test_calendar_branch_sets_plan_pointers() {
        let table = RoutingTable::standard();
        let prepared = table
            .prepare(&event(
                "calendar",
                "plan.new_version",
                EventPayload::PlanNewVersion {
                    plan_id: "p1".into(),
                    version: "4".into(),
                },
            ))
            .unwrap();
        assert_eq!(prepared.branch, Branch::Calendar);

        let update = prepared.checkpoint_update("u1", "t1", EntryId::new(7, 0));
        assert_eq!(update.last_entry_id, Some(EntryId::new(7, 0)));
        assert_eq!(update.last_plan_id.as_deref(), Some("p1"));
        assert_eq!(update.last_plan_version.as_deref(), Some("4"));

        let proposed = table
            .prepare(&event(
                "calendar",
                "plan.proposed",
                EventPayload::PlanProposed {
                    delta_id: "d9".into(),
                    summary: "s".into(),
                    impact: "i".into(),
                },
            ))
            .unwrap();
        assert_eq!(proposed.last_plan_id.as_deref(), Some("d9"));
        assert_eq!(proposed.last_plan_version, None);
    }

    #[test]
    fn test_payload_must_match_branch() {
        let table = RoutingTable::standard();
        let mismatched = event(
            "prod",
            "overrun",
            EventPayload::EmailReplyNeeded {
                message_id: "m".into(),
                sender: "s".into(),
                summary: "s".into(),
                draft: "d".into(),
            },
        );
        assert!(matches!(
            table.prepare(&mismatched),
            Err(ValidationError::BranchMismatch(_))
        ));

        let unknown = event(
            "weather",
            "rain",
            EventPayload::Productivity {
                signal: ProdSignal::Nudge,
                block_id: "b".into(),
                activity_label: "a".into(),
            },
        );
        assert!(matches!(
            table.prepare(&unknown),
            Err(ValidationError::UnsupportedKind(_))
        ));
    }
}
