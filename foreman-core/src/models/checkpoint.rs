use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::entry::EntryId;

/// Durable per-(user, thread) progress record.
///
/// Scalar fields are `Option` so that a save can express "leave unchanged";
/// stores apply them last-write-wins, except `last_entry_id` which only moves
/// forward. `side_effect_keys` is only ever unioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub user_id: String,
    pub thread_id: String,
    pub last_entry_id: Option<EntryId>,
    pub last_plan_id: Option<String>,
    pub last_plan_version: Option<String>,
    pub pending_prompt_id: Option<String>,
    #[serde(default)]
    pub side_effect_keys: BTreeSet<String>,
}

impl Checkpoint {
    /// Zero-value checkpoint for a thread that has never been saved.
    pub fn empty(user_id: &str, thread_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_entry_id.is_none()
            && self.last_plan_id.is_none()
            && self.last_plan_version.is_none()
            && self.pending_prompt_id.is_none()
            && self.side_effect_keys.is_empty()
    }

    /// Applies `update` with store semantics: scalars that are set win,
    /// `last_entry_id` never regresses, side effect keys are unioned.
    pub fn merge(&mut self, update: &Checkpoint) {
        if let Some(id) = update.last_entry_id {
            if self.last_entry_id.map_or(true, |cur| id > cur) {
                self.last_entry_id = Some(id);
            }
        }
        if update.last_plan_id.is_some() {
            self.last_plan_id = update.last_plan_id.clone();
        }
        if update.last_plan_version.is_some() {
            self.last_plan_version = update.last_plan_version.clone();
        }
        if update.pending_prompt_id.is_some() {
            self.pending_prompt_id = update.pending_prompt_id.clone();
        }
        self.side_effect_keys
            .extend(update.side_effect_keys.iter().cloned());
    }
}
