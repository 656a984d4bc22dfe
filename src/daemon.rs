use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::engine::SyncEngine;

/// Floor below which a requested interval is silently raised, guarding
/// against hammering the server.
const MIN_INTERVAL_SECONDS: u64 = 3;

/// Runs `sync_once` forever at `interval`, logging and continuing past a
/// failed cycle rather than exiting. The engine's own I/O is synchronous, so
/// each cycle runs on a blocking task and the async runtime only owns the
/// sleep/cancellation plumbing.
pub async fn run(cfg: Config, interval: Duration, shutdown: std::sync::Arc<tokio::sync::Notify>) -> Result<()> {
    let interval = interval.max(Duration::from_secs(MIN_INTERVAL_SECONDS));

    crate::logging::init_log_file(&cfg.log_file_path())?;
    crate::logging::info_kv(
        "daemon start",
        &[
            ("root", &cfg.root.display().to_string()),
            ("interval_secs", &interval.as_secs().to_string()),
        ],
    );

    let engine = std::sync::Arc::new(SyncEngine::new(&cfg).context("build sync engine")?);

    loop {
        let cycle_engine = engine.clone();
        let result =
            tokio::task::spawn_blocking(move || cycle_engine.sync_once()).await;

        match result {
            Ok(Ok(())) => crate::logging::info("sync cycle completed"),
            Ok(Err(err)) => crate::logging::error(format!("sync cycle failed: {err:#}")),
            Err(join_err) => crate::logging::error(format!("sync cycle panicked: {join_err}")),
        }

        tokio::select! {
            _ = shutdown.notified() => {
                crate::logging::info("daemon shutting down");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_below_floor_is_raised() {
        let requested = Duration::from_secs(1);
        let clamped = requested.max(Duration::from_secs(MIN_INTERVAL_SECONDS));
        assert_eq!(clamped, Duration::from_secs(MIN_INTERVAL_SECONDS));
    }

    #[test]
    fn interval_above_floor_is_unchanged() {
        let requested = Duration::from_secs(30);
        let clamped = requested.max(Duration::from_secs(MIN_INTERVAL_SECONDS));
        assert_eq!(clamped, Duration::from_secs(30));
    }
}
