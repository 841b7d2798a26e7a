//! Decider: the pluggable policy turning a normalized event into a decision
//!
//! - `RuleDecider`: deterministic built-in rules, one per event kind (default)
//! - `HttpDecider`: chat-completions style JSON API, the decision is read from
//!   the first choice's message content

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::DeciderConfig;
use crate::models::{Decision, Event, EventPayload, ProdSignal};

pub const API_KEY_ENV: &str = "MANAGER_API_KEY";

const DEFAULT_SYSTEM_PROMPT: &str = "You coordinate a user's day. Given one event as JSON, \
answer with a single JSON object {\"action\": \"ask_user\" | \"route\" | \"noop\", \
\"prompt\": string?, \"route_to\": string?, \"reason\": string?}. Use ask_user with a short, \
friendly question when the user must choose; route with route_to set to \"planner\" or \
\"prod_control\" when a subsystem must act; noop otherwise.";

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),

    #[error("Decision asks the user but has no prompt")]
    EmptyPrompt,

    #[error("Decision routes but names no target")]
    MissingTarget,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} decision attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl PolicyError {
    /// Transport failures, rate limits and server errors are worth another try.
    fn is_transient(&self) -> bool {
        match self {
            PolicyError::Http(_) => true,
            PolicyError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Decider trait
// ============================================================================

#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, event: &Event) -> Result<Decision, PolicyError>;

    fn name(&self) -> &str;
}

// ============================================================================
// RuleDecider
// ============================================================================

/// Built-in rules. Proposals and overruns need the user; committed plan
/// versions and accepted actions are routed to the owning subsystem.
#[derive(Debug, Default, Clone)]
pub struct RuleDecider;

const ACCEPT_CHOICES: [&str; 4] = ["accept", "approve", "yes", "confirm"];

#[async_trait]
impl Decider for RuleDecider {
    async fn decide(&self, event: &Event) -> Result<Decision, PolicyError> {
        let decision = match &event.payload {
            EventPayload::Productivity {
                signal,
                activity_label,
                ..
            } => match signal {
                ProdSignal::Overrun => Decision::ask_user(format!(
                    "Your \"{activity_label}\" block is running over. Want to extend it or wrap up?"
                ))
                .with_reason("block overrun"),
                ProdSignal::Underrun => Decision::ask_user(format!(
                    "You finished \"{activity_label}\" early. Pull the next block forward?"
                ))
                .with_reason("block underrun"),
                ProdSignal::Nudge => Decision::noop().with_reason("nudges are informational"),
            },
            EventPayload::PlanProposed {
                summary, impact, ..
            } => Decision::ask_user(format!(
                "New plan proposal: {summary} (impact: {impact}). Apply it?"
            ))
            .with_reason("plan proposal needs approval"),
            EventPayload::PlanNewVersion { .. } => {
                Decision::route("prod_control").with_reason("plan changed, recompute blocks")
            }
            EventPayload::EmailReplyNeeded {
                sender, summary, ..
            } => Decision::ask_user(format!(
                "{sender} is waiting on a reply about \"{summary}\". Send the drafted answer?"
            ))
            .with_reason("reply needed"),
            EventPayload::UserAction { choice, .. } => {
                if ACCEPT_CHOICES.contains(&choice.to_lowercase().as_str()) {
                    Decision::route("planner").with_reason("user accepted")
                } else {
                    Decision::noop().with_reason("user declined")
                }
            }
        };
        Ok(decision)
    }

    fn name(&self) -> &str {
        "rules"
    }
}

// ============================================================================
// HttpDecider
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct HttpDecider {
    client: Client,
    config: DeciderConfig,
    api_key: String,
}

impl HttpDecider {
    /// Uses `api_key`, falling back to `MANAGER_API_KEY`.
    pub fn new(config: DeciderConfig, api_key: Option<String>) -> Result<Self, PolicyError> {
        let api_key = api_key
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or(PolicyError::MissingApiKey)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    async fn decide_once(&self, event_json: &str) -> Result<Decision, PolicyError> {
        let system = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let request = ChatRequest {
            model: &self.config.model,
            temperature: self.config.temperature,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: event_json.to_string(),
                },
            ],
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(code = status.as_u16(), message = %message, "Decision API error");
            return Err(PolicyError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response.json().await?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PolicyError::InvalidDecision("response has no choices".into()))?;

        parse_decision(&content)
    }
}

#[async_trait]
impl Decider for HttpDecider {
    async fn decide(&self, event: &Event) -> Result<Decision, PolicyError> {
        let event_json = serde_json::to_string(event)
            .map_err(|e| PolicyError::InvalidDecision(e.to_string()))?;

        let strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::spawn(
            strategy,
            || self.decide_once(&event_json),
            PolicyError::is_transient,
        )
        .await
        .map_err(|e| {
            if e.is_transient() {
                PolicyError::RetryExhausted {
                    attempts: self.config.max_retries + 1,
                    last: e.to_string(),
                }
            } else {
                e
            }
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Parses a decision from model output, tolerating ```json fences.
pub fn parse_decision(content: &str) -> Result<Decision, PolicyError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    serde_json::from_str(body).map_err(|e| PolicyError::InvalidDecision(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Action;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    fn user_action(choice: &str) -> Event {
        Event {
            source: "manager".into(),
            kind: "user_action".into(),
            payload: EventPayload::UserAction {
                action_id: "a1".into(),
                choice: choice.into(),
                thread_id: None,
                metadata: None,
            },
        }
    }

    fn test_config(url: String) -> DeciderConfig {
        DeciderConfig {
            api_url: url,
            max_retries: 2,
            retry_delay_ms: 10,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[tokio::test]
    async fn test_rules_overrun_prompt_mentions_activity() {
        let decision = RuleDecider.decide(&overrun()).await.unwrap();
        assert_eq!(decision.action, Action::AskUser);
        assert!(decision.prompt_text().unwrap().contains("coding"));
    }

    #[tokio::test]
    async fn test_rules_user_action_routes_only_on_accept() {
        let accepted = RuleDecider.decide(&user_action("Accept")).await.unwrap();
        assert_eq!(accepted.target(), Some("planner"));

        let declined = RuleDecider.decide(&user_action("later")).await.unwrap();
        assert_eq!(declined.action, Action::Noop);
    }

    #[test]
    fn test_parse_decision_strips_fences() {
        let d = parse_decision("```json\n{\"action\": \"route\", \"route_to\": \"planner\"}\n```")
            .unwrap();
        assert_eq!(d, Decision::route("planner"));

        let d = parse_decision(" {\"action\": \"noop\"} ").unwrap();
        assert_eq!(d.action, Action::Noop);

        assert!(matches!(
            parse_decision("extend it?"),
            Err(PolicyError::InvalidDecision(_))
        ));
    }

    #[test]
    fn test_http_decider_requires_key() {
        let cfg = test_config("http://localhost:1".into());
        assert!(matches!(
            HttpDecider::new(cfg, Some("   ".into())),
            Err(PolicyError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_http_decider_parses_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                "```json\n{\"action\": \"ask_user\", \"prompt\": \"Extend coding?\"}\n```",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let decider = HttpDecider::new(
            test_config(format!("{}/v1/chat/completions", server.uri())),
            Some("test-key".into()),
        )
        .unwrap();
        let decision = decider.decide(&overrun()).await.unwrap();
        assert_eq!(decision, Decision::ask_user("Extend coding?"));
    }

    #[tokio::test]
    async fn test_http_decider_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(completion("{\"action\": \"noop\"}")),
            )
            .mount(&server)
            .await;

        let decider = HttpDecider::new(test_config(server.uri()), Some("k".into())).unwrap();
        let decision = decider.decide(&overrun()).await.unwrap();
        assert_eq!(decision.action, Action::Noop);
    }

    #[tokio::test]
    async fn test_http_decider_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let decider = HttpDecider::new(test_config(server.uri()), Some("k".into())).unwrap();
        match decider.decide(&overrun()).await {
            Err(PolicyError::RetryExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_decider_does_not_retry_bad_output() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("no idea")))
            .expect(1)
            .mount(&server)
            .await;

        let decider = HttpDecider::new(test_config(server.uri()), Some("k".into())).unwrap();
        assert!(matches!(
            decider.decide(&overrun()).await,
            Err(PolicyError::InvalidDecision(_))
        ));
    }
}
