//! Route dispatch: delivers `route` decisions to named subsystems over HTTP,
//! outside the shared log.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::models::{EntryId, Event, EventPayload};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Unknown route target {0:?}")]
    UnknownTarget(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Target {target} answered {code}: {message}")]
    Rejected {
        target: String,
        code: u16,
        message: String,
    },
}

/// Body sent to a route target.
#[derive(Debug, Clone, Serialize)]
pub struct RouteRequest<'a> {
    pub user_id: &'a str,
    pub thread_id: &'a str,
    pub source: &'a str,
    pub kind: &'a str,
    pub payload: &'a EventPayload,
    pub idempotency_key: &'a str,
    pub wb_parent_id: EntryId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

impl<'a> RouteRequest<'a> {
    pub fn new(
        user_id: &'a str,
        thread_id: &'a str,
        event: &'a Event,
        idempotency_key: &'a str,
        wb_parent_id: EntryId,
    ) -> Self {
        Self {
            user_id,
            thread_id,
            source: &event.source,
            kind: &event.kind,
            payload: &event.payload,
            idempotency_key,
            wb_parent_id,
            reason: None,
        }
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, target: &str, request: &RouteRequest<'_>) -> Result<(), DispatchError>;
}

pub struct HttpDispatcher {
    client: Client,
    targets: HashMap<String, String>,
}

impl HttpDispatcher {
    pub fn new(config: &DispatchConfig) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            targets: config.targets.clone(),
        })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, target: &str, request: &RouteRequest<'_>) -> Result<(), DispatchError> {
        let url = self
            .targets
            .get(target)
            .ok_or_else(|| DispatchError::UnknownTarget(target.to_string()))?;

        let response = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, request.idempotency_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                target: target.to_string(),
                code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        tracing::debug!(target_name = target, key = request.idempotency_key, "Route dispatched");
        Ok(())
    }
}
