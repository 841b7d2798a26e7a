//! Composition root: builds every backend once and hands out shared handles.

use std::sync::Arc;

use anyhow::Context;
use foreman_core::config::{CheckpointBackendKind, DeciderBackendKind, LogBackendKind};
use foreman_core::{
    AppendLog, CheckpointStore, Decider, Dispatcher, ForemanConfig, HttpDecider, HttpDispatcher,
    MemoryAppendLog, MemoryCheckpointStore, PgCheckpointStore, RedisAppendLog,
    RedisCheckpointStore, RuleDecider,
};
use serde_json::json;

use crate::subsystems::fanout::Fanout;
use crate::subsystems::graph::Graph;
use crate::subsystems::orchestrator::Orchestrator;
use crate::subsystems::status::Status;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ForemanConfig>,
    pub log: Arc<dyn AppendLog>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub decider: Arc<dyn Decider>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub status: Arc<Status>,
    pub fanout: Arc<Fanout>,
}

impl AppState {
    /// Connects the backends named in `config`.
    pub async fn bootstrap(config: ForemanConfig) -> anyhow::Result<Self> {
        let log: Arc<dyn AppendLog> = match config.streams.backend {
            LogBackendKind::Redis => {
                let log = RedisAppendLog::new(&config.streams.redis_url)
                    .context("invalid streams.redis_url")?;
                log.ping()
                    .await
                    .with_context(|| format!("Redis unreachable at {}", config.streams.redis_url))?;
                Arc::new(log)
            }
            LogBackendKind::Memory => Arc::new(MemoryAppendLog::new()),
        };

        let ttl = config.checkpoint.ttl();
        let checkpoints: Arc<dyn CheckpointStore> = match config.checkpoint.backend {
            CheckpointBackendKind::Redis => Arc::new(
                RedisCheckpointStore::new(
                    &config.streams.redis_url,
                    &config.checkpoint.key_prefix,
                    ttl,
                )
                .context("invalid checkpoint Redis URL")?,
            ),
            CheckpointBackendKind::Postgres => {
                let database = config
                    .database
                    .as_ref()
                    .context("checkpoint.backend = \"postgres\" needs a [database] section")?;
                let pool = foreman_core::db::create_pool(database)
                    .await
                    .context("failed to connect to database")?;
                match foreman_core::db::server_version(&pool).await {
                    Ok(version) => tracing::info!(version = %version, "PostgreSQL connected"),
                    Err(e) => tracing::warn!(error = %e, "PostgreSQL version query failed"),
                }
                let store = PgCheckpointStore::new(pool, ttl);
                store.ensure_schema().await?;
                Arc::new(store)
            }
            CheckpointBackendKind::Memory => Arc::new(MemoryCheckpointStore::new(ttl)),
        };

        let decider: Arc<dyn Decider> = match config.decider.backend {
            DeciderBackendKind::Rules => Arc::new(RuleDecider),
            DeciderBackendKind::Http => Arc::new(HttpDecider::new(config.decider.clone(), None)?),
        };
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(HttpDispatcher::new(&config.dispatch)?);

        tracing::info!(
            log = log.name(),
            checkpoints = checkpoints.name(),
            decider = decider.name(),
            "Backends ready"
        );
        Ok(Self::from_parts(config, log, checkpoints, decider, dispatcher))
    }

    pub fn from_parts(
        config: ForemanConfig,
        log: Arc<dyn AppendLog>,
        checkpoints: Arc<dyn CheckpointStore>,
        decider: Arc<dyn Decider>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let fanout = Arc::new(Fanout::new(Arc::clone(&log), config.fanout.clone()));
        Self {
            config: Arc::new(config),
            log,
            checkpoints,
            decider,
            dispatcher,
            status: Arc::new(Status::new()),
            fanout,
        }
    }

    /// Orchestrator wired to this state's backends and status counters.
    pub fn orchestrator(&self) -> Orchestrator {
        let graph = Graph::new(
            Arc::clone(&self.log),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.decider),
            Arc::clone(&self.dispatcher),
            &self.config.orchestrator,
        );
        Orchestrator::new(
            graph,
            Arc::clone(&self.log),
            self.config.orchestrator.clone(),
            Arc::clone(&self.status),
        )
    }

    pub fn health(&self) -> serde_json::Value {
        json!({
            "status": "healthy",
            "log": self.log.name(),
            "checkpoints": self.checkpoints.name(),
            "decider": self.decider.name(),
            "users": self.config.orchestrator.users,
            "orchestrator": self.status.snapshot(),
        })
    }
}
