// Background watchdog
//
// Periodically sweeps runtime state:
// - unregisters local backends whose process has exited, so the next call
//   can lazily relaunch them
// - drops event-hub channels nobody listens to

use std::time::Duration;

use crate::state::AppState;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("watchdog: started (interval={}s)", CHECK_INTERVAL.as_secs());

        loop {
            tokio::time::sleep(CHECK_INTERVAL).await;
            sweep(&state).await;
        }
    })
}

/// One pass. Returns the ids of reaped deployments.
pub async fn sweep(state: &AppState) -> Vec<String> {
    let reaped = state.processes.reap_dead().await;
    for id in &reaped {
        tracing::warn!(deployment_id = %id, "watchdog: reaped exited backend process");
    }

    let pruned = state.events.prune();
    let live = state.processes.live_count().await;

    if reaped.is_empty() {
        tracing::debug!("watchdog: {} live backend(s), {} idle channel(s) pruned", live, pruned);
    } else {
        tracing::warn!(
            "watchdog: reaped={} live={} pruned_channels={}",
            reaped.len(),
            live,
            pruned
        );
    }
    reaped
}
