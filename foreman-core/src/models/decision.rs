use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    AskUser,
    Route,
    Noop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AskUser => "ask_user",
            Action::Route => "route",
            Action::Noop => "noop",
        }
    }
}

/// The policy's answer for one event. Not persisted; its consequence is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Decision {
    pub fn ask_user(prompt: impl Into<String>) -> Self {
        Self {
            action: Action::AskUser,
            prompt: Some(prompt.into()),
            route_to: None,
            reason: None,
        }
    }

    pub fn route(target: impl Into<String>) -> Self {
        Self {
            action: Action::Route,
            prompt: None,
            route_to: Some(target.into()),
            reason: None,
        }
    }

    pub fn noop() -> Self {
        Self {
            action: Action::Noop,
            prompt: None,
            route_to: None,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Trimmed prompt text, if non-empty.
    pub fn prompt_text(&self) -> Option<&str> {
        self.prompt.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }

    /// Trimmed route target, if non-empty.
    pub fn target(&self) -> Option<&str> {
        self.route_to.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}
