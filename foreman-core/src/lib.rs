pub mod append_log;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod decider;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod models;
pub mod normalizer;

pub use append_log::{AppendLog, GroupRead, GroupStart, LogError, MemoryAppendLog, RedisAppendLog};
pub use checkpoint::{
    CheckpointError, CheckpointStore, MemoryCheckpointStore, PgCheckpointStore,
    RedisCheckpointStore,
};
pub use config::ForemanConfig;
pub use decider::{Decider, HttpDecider, PolicyError, RuleDecider};
pub use dispatch::{DispatchError, Dispatcher, HttpDispatcher, RouteRequest};
pub use error::ForemanError;
pub use normalizer::{normalize, ValidationError};
