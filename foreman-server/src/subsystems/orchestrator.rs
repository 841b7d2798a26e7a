//! Consumer loops: one group reader per user stream, entries processed
//! strictly in order and acknowledged only after their side effects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use foreman_core::config::{OrchestratorConfig, StartPosition};
use foreman_core::models::{stream_key, Delivery, EntryId};
use foreman_core::{AppendLog, GroupRead, GroupStart, LogError};
use tokio::task::JoinSet;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;

use super::graph::{Graph, Outcome};
use super::status::Status;

const ACK_RETRY_INTERVAL_MS: u64 = 50;

/// Result of one read-and-process round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub delivered: usize,
    pub acked: usize,
    /// Entries left unacknowledged for redelivery. The round stops at the
    /// first one so later entries are never processed ahead of it.
    pub failed: usize,
}

/// Per-loop state kept across polls.
#[derive(Debug)]
pub struct LoopState {
    group_ready: bool,
    first_read: bool,
    transport_backoff: Duration,
    /// Processing attempts of the entry currently being retried. Entries
    /// redelivered behind it are not charged until they are processed.
    attempts: HashMap<EntryId, u64>,
}

impl LoopState {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            group_ready: false,
            first_read: true,
            transport_backoff: Duration::from_millis(config.transport_backoff_initial_ms),
            attempts: HashMap::new(),
        }
    }
}

pub struct Orchestrator {
    graph: Graph,
    log: Arc<dyn AppendLog>,
    config: OrchestratorConfig,
    status: Arc<Status>,
}

impl Orchestrator {
    pub fn new(
        graph: Graph,
        log: Arc<dyn AppendLog>,
        config: OrchestratorConfig,
        status: Arc<Status>,
    ) -> Self {
        Self {
            graph,
            log,
            config,
            status,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Runs one consumer loop per configured user until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            users = self.config.users.len(),
            group = %self.config.group,
            consumer = %self.config.consumer,
            "Orchestrator started"
        );

        let mut loops = JoinSet::new();
        for user in &self.config.users {
            let user = user.trim().to_string();
            if user.is_empty() {
                continue;
            }
            loops.spawn(Arc::clone(&self).run_user(user, cancel.child_token()));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Consumer loop panicked");
            }
        }
        tracing::info!("Orchestrator stopped");
    }

    async fn run_user(self: Arc<Self>, user_id: String, cancel: CancellationToken) {
        let stream = stream_key(&user_id);
        let mut state = LoopState::new(&self.config);
        tracing::info!(user = %user_id, stream = %stream, "Consumer loop started");

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once(&user_id, &mut state) => result,
            };

            let delay = match result {
                Ok(report) => {
                    state.transport_backoff =
                        Duration::from_millis(self.config.transport_backoff_initial_ms);
                    if report.failed > 0 {
                        Some(self.config.retry_backoff())
                    } else {
                        None
                    }
                }
                Err(e) if e.is_missing_group() => {
                    tracing::warn!(user = %user_id, "Consumer group vanished, recreating");
                    state.group_ready = false;
                    None
                }
                Err(e) => {
                    let delay = state.transport_backoff;
                    tracing::warn!(
                        user = %user_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Log transport error"
                    );
                    self.status.record_error(e.to_string());
                    state.transport_backoff = (delay * 2)
                        .min(Duration::from_millis(self.config.transport_backoff_max_ms));
                    Some(delay)
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        tracing::info!(user = %user_id, "Consumer loop stopped");
    }

    /// Reads one batch for `user_id` and processes it in order.
    pub async fn poll_once(
        &self,
        user_id: &str,
        state: &mut LoopState,
    ) -> Result<PollReport, LogError> {
        let stream = stream_key(user_id);
        if !state.group_ready {
            let start = match self.config.start_from {
                StartPosition::Latest => GroupStart::Latest,
                StartPosition::Earliest => GroupStart::Earliest,
            };
            self.log
                .ensure_group(&stream, &self.config.group, start)
                .await?;
            state.group_ready = true;
        }

        // The first read drains this consumer's own pending entries.
        let reclaim_idle = if state.first_read {
            Duration::ZERO
        } else {
            self.config.reclaim_idle()
        };
        let deliveries = self
            .log
            .read_group(&GroupRead {
                stream: stream.clone(),
                group: self.config.group.clone(),
                consumer: self.config.consumer.clone(),
                count: self.config.batch_size.max(1),
                block: self.config.block(),
                reclaim_idle,
            })
            .await?;
        state.first_read = false;

        let mut report = PollReport {
            delivered: deliveries.len(),
            ..Default::default()
        };
        for delivery in &deliveries {
            let entry = &delivery.entry;
            let attempt = {
                let count = state.attempts.entry(entry.id).or_insert(0);
                *count += 1;
                *count
            };
            let outcome = self.graph.process_attempt(delivery, attempt).await;
            self.status.record(
                &entry.user_id,
                entry.thread_id.as_deref(),
                entry.id,
                &outcome,
            );
            tracing::debug!(
                user = %entry.user_id,
                entry = %entry.id,
                outcome = outcome.label(),
                "Entry processed"
            );

            if !outcome.should_ack() {
                // Batches stop here, so this is the only entry mid-retry.
                state.attempts.retain(|id, _| *id == entry.id);
                report.failed += 1;
                break;
            }
            state.attempts.remove(&entry.id);
            if self.ack(&stream, delivery, &outcome).await {
                report.acked += 1;
            }
        }
        Ok(report)
    }

    /// Acks with a few quick retries. A lost ack only means redelivery.
    async fn ack(&self, stream: &str, delivery: &Delivery, outcome: &Outcome) -> bool {
        let ids: &[EntryId] = &[delivery.entry.id];
        let group = self.config.group.as_str();
        let log = &self.log;
        let strategy = FixedInterval::from_millis(ACK_RETRY_INTERVAL_MS)
            .take(self.config.ack_attempts.saturating_sub(1));

        match Retry::spawn(strategy, move || log.ack(stream, group, ids)).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    user = %delivery.entry.user_id,
                    entry = %delivery.entry.id,
                    outcome = outcome.label(),
                    error = %e,
                    "Ack failed, entry will be redelivered"
                );
                self.status.record_error(format!("ack failed: {e}"));
                false
            }
        }
    }
}
