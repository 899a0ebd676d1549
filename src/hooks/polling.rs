//! Polling trigger

use super::MIN_POLL_INTERVAL;
use crate::registry::RepoHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Request a sync of every branch of `repo` each `interval`.
///
/// The first poll fires right away when `immediate` is set, otherwise after
/// one interval. Ticks missed while the runtime was busy are not replayed.
/// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
pub fn start_polling(repo: Arc<RepoHandle>, interval: Duration, immediate: bool) -> JoinHandle<()> {
    if interval < MIN_POLL_INTERVAL {
        tracing::warn!(repo = %repo.name(), ?interval, "Polling interval too short, using the minimum");
    }
    let interval = interval.max(MIN_POLL_INTERVAL);

    tracing::info!(
        repo = %repo.name(),
        interval_secs = interval.as_secs_f64(),
        immediate,
        "Polling hook initialized"
    );

    tokio::spawn(async move {
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + interval
        };
        let mut ticker = interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            tracing::debug!(repo = %repo.name(), "Polling for changes");
            repo.dispatch_all("polling");
        }
    })
}
