use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};

/// Background task that rewrites the WAL once enough appends pile up, and
/// drops change-feed channels nobody listens to anymore.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            tracing::warn!("WAL compaction failed: {e}");
        }
        engine.notify.prune();
    }
}

/// Compact when appends since the last compaction reach `threshold`.
/// Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold.max(1) {
        return Ok(false);
    }
    info!("compacting WAL after {appends} appends");
    engine.compact_wal().await?;
    Ok(true)
}
