use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::engine::Engine;

const COMPACTOR_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that periodically releases expired reservation locks.
pub async fn run_reaper(engine: Arc<Engine>) {
    let period = Duration::from_millis(engine.config().reaper_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let now = crate::engine::now_ms();
        let reaped = engine.reap_expired_locks(now).await;
        if reaped > 0 {
            info!(reaped, "released expired locks");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>) {
    let threshold = engine.config().compact_threshold;
    let mut interval = tokio::time::interval(COMPACTOR_INTERVAL);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            tracing::warn!("WAL compaction failed: {e}");
        }
    }
}

/// Spawn the reaper and the compactor for `engine`.
pub fn spawn_maintenance(engine: &Arc<Engine>) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_reaper(engine.clone())),
        tokio::spawn(run_compactor(engine.clone())),
    ]
}
