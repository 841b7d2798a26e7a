use thiserror::Error;

use crate::append_log::LogError;
use crate::checkpoint::CheckpointError;
use crate::decider::PolicyError;
use crate::dispatch::DispatchError;
use crate::normalizer::ValidationError;

#[derive(Error, Debug)]
pub enum ForemanError {
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Other error: {0}")]
    Other(String),
}
