//! Retention: periodic stream trimming and checkpoint expiry sweeps.

use std::sync::Arc;

use foreman_core::config::{CheckpointConfig, StreamsConfig};
use foreman_core::models::{dead_letter_key, stream_key};
use foreman_core::{AppendLog, CheckpointError, CheckpointStore};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Trims every user stream and its dead-letter stream to roughly `max_len`
/// entries. Returns the total removed. A failing stream is logged and skipped.
pub async fn trim_users(log: &dyn AppendLog, users: &[String], max_len: usize) -> u64 {
    let mut removed = 0;
    for user in users {
        for stream in [stream_key(user), dead_letter_key(user)] {
            match log.trim(&stream, max_len).await {
                Ok(n) => removed += n,
                Err(e) => tracing::warn!(stream = %stream, error = %e, "Stream trim failed"),
            }
        }
    }
    removed
}

pub async fn sweep(checkpoints: &dyn CheckpointStore) -> Result<u64, CheckpointError> {
    let removed = checkpoints.sweep_expired().await?;
    if removed > 0 {
        tracing::info!(removed = removed, store = checkpoints.name(), "Expired checkpoints swept");
    }
    Ok(removed)
}

/// Called from main.rs; runs until `cancel` fires.
pub async fn run_retention_loop(
    log: Arc<dyn AppendLog>,
    checkpoints: Arc<dyn CheckpointStore>,
    users: Vec<String>,
    streams: StreamsConfig,
    checkpoint: CheckpointConfig,
    cancel: CancellationToken,
) {
    let mut trim_ticker = interval(Duration::from_secs(streams.trim_interval_minutes.max(1) * 60));
    trim_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_ticker =
        interval(Duration::from_secs(checkpoint.sweep_interval_minutes.max(1) * 60));
    sweep_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        trim_interval_min = streams.trim_interval_minutes,
        sweep_interval_min = checkpoint.sweep_interval_minutes,
        max_len = streams.max_len,
        "Retention loop started"
    );

    loop {
        tokio::select! {
            _ = trim_ticker.tick() => {
                let removed = trim_users(log.as_ref(), &users, streams.max_len).await;
                if removed > 0 {
                    tracing::info!(removed = removed, "Streams trimmed");
                }
            }
            _ = sweep_ticker.tick() => {
                if let Err(e) = sweep(checkpoints.as_ref()).await {
                    tracing::warn!(error = %e, "Checkpoint sweep failed");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Retention loop shutting down");
                break;
            }
        }
    }
}
