//! Processing graph: one log entry through normalize, checkpoint gate,
//! route, decide, idempotency gate, emit and checkpoint advance.
//!
//! `Graph::process` is the only path that produces side effects, so the
//! idempotency key set is always consulted before emitting or dispatching.
//! The entry-id gate only saves work on entries already advanced past.

use std::sync::Arc;

use foreman_core::checkpoint::{has_side_effect, prompt_key, route_key, should_skip};
use foreman_core::config::OrchestratorConfig;
use foreman_core::models::{Action, Checkpoint, Decision, Delivery, EntryId, Event};
use foreman_core::normalizer::normalize_entry;
use foreman_core::{
    AppendLog, CheckpointStore, Decider, Dispatcher, ForemanError, PolicyError, RouteRequest,
    ValidationError,
};

use super::emitter::{self, Emitter, DEAD_LETTER_TYPE};
use super::routing::RoutingTable;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Written by the orchestrator itself.
    SelfEmitted,
    Invalid(ValidationError),
    NoThread,
    /// At or before the checkpoint's last entry.
    AlreadyProcessed,
    Prompted { prompt_id: EntryId, key: String },
    /// A prompt for this entry was already in the log; only the key was recorded.
    Recovered { prompt_id: EntryId, key: String },
    Routed { target: String, key: String },
    NoAction,
    Duplicate { key: String },
    DeadLettered { dead_letter_id: EntryId, error: String },
    /// Left unacknowledged for redelivery.
    Failed { error: String },
}

impl Outcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Outcome::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::SelfEmitted => "self_emitted",
            Outcome::Invalid(_) => "invalid",
            Outcome::NoThread => "no_thread",
            Outcome::AlreadyProcessed => "already_processed",
            Outcome::Prompted { .. } => "prompted",
            Outcome::Recovered { .. } => "recovered",
            Outcome::Routed { .. } => "routed",
            Outcome::NoAction => "no_action",
            Outcome::Duplicate { .. } => "duplicate",
            Outcome::DeadLettered { .. } => "dead_lettered",
            Outcome::Failed { .. } => "failed",
        }
    }
}

pub struct Graph {
    checkpoints: Arc<dyn CheckpointStore>,
    decider: Arc<dyn Decider>,
    dispatcher: Arc<dyn Dispatcher>,
    routes: RoutingTable,
    emitter: Emitter,
    max_deliveries: u64,
}

impl Graph {
    pub fn new(
        log: Arc<dyn AppendLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        decider: Arc<dyn Decider>,
        dispatcher: Arc<dyn Dispatcher>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            checkpoints,
            decider,
            dispatcher,
            routes: RoutingTable::standard(),
            emitter: Emitter::new(log, config.recovery_scan_limit),
            max_deliveries: config.max_deliveries.max(1),
        }
    }

    /// Processes `delivery`, counting its delivery count as the attempt number.
    pub async fn process(&self, delivery: &Delivery) -> Outcome {
        self.process_attempt(delivery, delivery.delivery_count).await
    }

    /// Processes `delivery` as its `attempt`-th try. The retry budget is spent
    /// by attempts only; the delivery count still drives emit recovery, since
    /// any earlier delivery may have emitted before crashing.
    pub async fn process_attempt(&self, delivery: &Delivery, attempt: u64) -> Outcome {
        let entry = &delivery.entry;
        let user_id = entry.user_id.as_str();

        if emitter::is_prompt(entry) || entry.entry_type() == Some(DEAD_LETTER_TYPE) {
            tracing::debug!(user = user_id, entry = %entry.id, "Skipping self-emitted entry");
            return Outcome::SelfEmitted;
        }

        // normalize
        let event = match normalize_entry(entry) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(user = user_id, entry = %entry.id, error = %e, "Skipping malformed entry");
                return Outcome::Invalid(e);
            }
        };

        let Some(thread_id) = entry.thread_id.as_deref() else {
            tracing::warn!(
                user = user_id,
                entry = %entry.id,
                source = %event.source,
                kind = %event.kind,
                "Skipping entry without thread id"
            );
            return Outcome::NoThread;
        };

        // checkpoint gate
        let checkpoint = match self.checkpoints.get(user_id, thread_id).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                tracing::warn!(user = user_id, thread = thread_id, error = %e, "Checkpoint read failed");
                return Outcome::Failed {
                    error: e.to_string(),
                };
            }
        };
        if should_skip(entry.id, checkpoint.last_entry_id) {
            tracing::debug!(user = user_id, thread = thread_id, entry = %entry.id, "Already processed");
            return Outcome::AlreadyProcessed;
        }

        // route
        let prepared = match self.routes.prepare(&event) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(user = user_id, entry = %entry.id, error = %e, "Unroutable entry");
                return Outcome::Invalid(e);
            }
        };
        let mut update = prepared.checkpoint_update(user_id, thread_id, entry.id);

        // decide
        let decision = match self.decide(&event).await {
            Ok(decision) => decision,
            Err(e) => return self.fail(delivery, attempt, thread_id, &event, e.into()).await,
        };
        tracing::debug!(
            user = user_id,
            thread = thread_id,
            entry = %entry.id,
            branch = prepared.branch.as_str(),
            action = decision.action.as_str(),
            "Decided"
        );

        // idempotency gate + emit
        let outcome = match decision.action {
            Action::Noop => Outcome::NoAction,
            Action::AskUser => {
                let key = prompt_key(&event);
                if has_side_effect(&checkpoint, &key) {
                    tracing::debug!(user = user_id, thread = thread_id, key = %key, "Duplicate prompt suppressed");
                    return self.advance(update, Outcome::Duplicate { key }).await;
                }
                let content = decision.prompt_text().unwrap_or_default();
                match self.prompt(delivery, thread_id, &event, content, &key).await {
                    Ok((prompt_id, recovered)) => {
                        update.side_effect_keys.insert(key.clone());
                        update.pending_prompt_id = Some(prompt_id.to_string());
                        if recovered {
                            Outcome::Recovered { prompt_id, key }
                        } else {
                            Outcome::Prompted { prompt_id, key }
                        }
                    }
                    Err(e) => return self.fail(delivery, attempt, thread_id, &event, e).await,
                }
            }
            Action::Route => {
                let target = decision.target().unwrap_or_default().to_string();
                let key = route_key(&target, &event);
                if has_side_effect(&checkpoint, &key) {
                    tracing::debug!(user = user_id, thread = thread_id, key = %key, "Duplicate dispatch suppressed");
                    return self.advance(update, Outcome::Duplicate { key }).await;
                }
                let mut request = RouteRequest::new(user_id, thread_id, &event, &key, entry.id);
                request.reason = decision.reason.as_deref();
                if let Err(e) = self.dispatcher.dispatch(&target, &request).await {
                    return self.fail(delivery, attempt, thread_id, &event, e.into()).await;
                }
                tracing::info!(user = user_id, thread = thread_id, entry = %entry.id, target = %target, "Dispatched");
                update.side_effect_keys.insert(key.clone());
                Outcome::Routed { target, key }
            }
        };

        // checkpoint advance
        self.advance(update, outcome).await
    }

    /// Calls the decider and rejects decisions that cannot be acted on.
    async fn decide(&self, event: &Event) -> Result<Decision, PolicyError> {
        let decision = self.decider.decide(event).await?;
        match decision.action {
            Action::AskUser if decision.prompt_text().is_none() => Err(PolicyError::EmptyPrompt),
            Action::Route if decision.target().is_none() => Err(PolicyError::MissingTarget),
            _ => Ok(decision),
        }
    }

    /// Emits the prompt, unless a redelivery finds one already in the log.
    async fn prompt(
        &self,
        delivery: &Delivery,
        thread_id: &str,
        event: &Event,
        content: &str,
        key: &str,
    ) -> Result<(EntryId, bool), ForemanError> {
        if delivery.delivery_count > 1 {
            if let Some(existing) = self.emitter.find_prompt(&delivery.entry).await? {
                tracing::info!(
                    user = %delivery.entry.user_id,
                    thread = thread_id,
                    entry = %delivery.entry.id,
                    prompt = %existing,
                    "Recovered prompt from previous delivery"
                );
                return Ok((existing, true));
            }
        }
        let id = self
            .emitter
            .emit_prompt(&delivery.entry, thread_id, event, content, key)
            .await?;
        Ok((id, false))
    }

    async fn advance(&self, update: Checkpoint, outcome: Outcome) -> Outcome {
        match self
            .checkpoints
            .save(&update.user_id, &update.thread_id, &update)
            .await
        {
            Ok(()) => outcome,
            Err(e) => {
                tracing::warn!(
                    user = %update.user_id,
                    thread = %update.thread_id,
                    error = %e,
                    "Checkpoint save failed"
                );
                Outcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Leaves the entry for redelivery until it has been attempted
    /// `max_deliveries` times, then dead-letters it.
    async fn fail(
        &self,
        delivery: &Delivery,
        attempt: u64,
        thread_id: &str,
        event: &Event,
        error: ForemanError,
    ) -> Outcome {
        let entry = &delivery.entry;
        let error = error.to_string();
        if attempt < self.max_deliveries {
            tracing::warn!(
                user = %entry.user_id,
                thread = thread_id,
                entry = %entry.id,
                attempt = attempt,
                error = %error,
                "Entry failed, leaving for redelivery"
            );
            return Outcome::Failed { error };
        }

        let dead_letter_id = match self.emitter.dead_letter(delivery, attempt, event, &error).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(user = %entry.user_id, entry = %entry.id, error = %e, "Dead letter write failed");
                return Outcome::Failed {
                    error: e.to_string(),
                };
            }
        };
        tracing::error!(
            user = %entry.user_id,
            thread = thread_id,
            entry = %entry.id,
            attempts = attempt,
            dead_letter = %dead_letter_id,
            error = %error,
            "Entry dead-lettered"
        );

        let mut progress = Checkpoint::empty(&entry.user_id, thread_id);
        progress.last_entry_id = Some(entry.id);
        self.advance(
            progress,
            Outcome::DeadLettered {
                dead_letter_id,
                error,
            },
        )
        .await
    }
}
