use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

/// How often each tenant checks whether its WAL is due for compaction.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// How often expired entries are dropped from the token blacklist.
const TOKEN_PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Background task that periodically runs expiry reconciliation.
///
/// Off by default: an external scheduler calling `reconcile_expired` is the
/// primary trigger. Failures are logged and retried on the next tick.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.reconcile_expired().await {
            Ok(report) if report.is_empty() => debug!("sweeper: nothing expired"),
            Ok(_) => {}
            Err(e) => error!("sweeper: reconciliation failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

/// Background task that forgets a tenant's revoked tokens once they expire on their own.
pub async fn run_token_pruner(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(TOKEN_PRUNE_INTERVAL);
    loop {
        interval.tick().await;
        let pruned = engine.prune_revoked_tokens();
        if pruned > 0 {
            debug!("pruned {pruned} expired token revocations");
        }
    }
}
