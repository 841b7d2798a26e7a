use std::collections::HashMap;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ForemanConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
    #[serde(default)]
    pub decider: DeciderConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/foreman.sock".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogBackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamsConfig {
    pub backend: LogBackendKind,
    pub redis_url: String,
    /// Approximate retention per user stream (entries).
    pub max_len: usize,
    pub trim_interval_minutes: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            backend: LogBackendKind::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_len: 10_000,
            trim_interval_minutes: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackendKind {
    Redis,
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackendKind,
    pub key_prefix: String,
    pub ttl_days: u64,
    pub sweep_interval_minutes: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackendKind::Redis,
            key_prefix: "manager:ckpt".to_string(),
            ttl_days: 7,
            sweep_interval_minutes: 60,
        }
    }
}

impl CheckpointConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Only entries appended after the group is created.
    Latest,
    /// Everything still retained in the stream.
    Earliest,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub users: Vec<String>,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block_ms: u64,
    /// Pending entries idle at least this long are reclaimed for redelivery.
    pub reclaim_idle_ms: u64,
    /// Deliveries after which a failing entry is dead-lettered.
    pub max_deliveries: u64,
    pub retry_backoff_ms: u64,
    pub transport_backoff_initial_ms: u64,
    pub transport_backoff_max_ms: u64,
    pub ack_attempts: usize,
    pub recovery_scan_limit: usize,
    pub start_from: StartPosition,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            users: vec!["test-user".to_string()],
            group: "manager".to_string(),
            consumer: "manager-1".to_string(),
            batch_size: 50,
            block_ms: 5_000,
            reclaim_idle_ms: 30_000,
            max_deliveries: 5,
            retry_backoff_ms: 1_000,
            transport_backoff_initial_ms: 350,
            transport_backoff_max_ms: 10_000,
            ack_attempts: 3,
            recovery_scan_limit: 500,
            start_from: StartPosition::Latest,
        }
    }
}

impl OrchestratorConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_idle_ms)
    }

    /// Delay before retrying after a failed entry. Never shorter than the
    /// reclaim idle time, so the failed entry is eligible on the next read.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.max(self.reclaim_idle_ms))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest buffered entry and keep the subscriber.
    DropOldest,
    /// Close the subscription.
    Disconnect,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FanoutConfig {
    /// Per-subscriber buffer, rounded up to a power of two.
    pub buffer_capacity: usize,
    pub overflow: OverflowPolicy,
    pub block_ms: u64,
    pub batch_size: usize,
    pub keepalive_secs: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            overflow: OverflowPolicy::DropOldest,
            block_ms: 5_000,
            batch_size: 50,
            keepalive_secs: 25,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeciderBackendKind {
    Rules,
    Http,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeciderConfig {
    pub backend: DeciderBackendKind,
    pub api_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            backend: DeciderBackendKind::Rules,
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-5-mini".to_string(),
            timeout_secs: 60,
            max_retries: 2,
            retry_delay_ms: 500,
            temperature: 1.0,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    pub targets: HashMap<String, String>,
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let mut targets = HashMap::new();
        targets.insert(
            "planner".to_string(),
            "http://localhost:8080/planner/run".to_string(),
        );
        targets.insert(
            "prod_control".to_string(),
            "http://localhost:8080/prod/control/recompute".to_string(),
        );
        Self {
            targets,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8090,
        }
    }
}

impl ForemanConfig {
    /// Loads `path` (TOML) and layers `FOREMAN__SECTION__KEY` env vars on top.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("FOREMAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        s.try_deserialize()
    }

    /// Config with every backend in memory. Used by tests and `--dev`.
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.streams.backend = LogBackendKind::Memory;
        config.checkpoint.backend = CheckpointBackendKind::Memory;
        config
    }
}
