//! Background session cleanup task.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::SessionStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Spawn a task that periodically evicts expired sessions.
pub fn spawn_cleanup_task(
    session_store: Arc<SessionStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match session_store.evict_expired() {
                Ok(0) => debug!("Session cleanup: nothing expired"),
                Ok(count) => info!(evicted = count, "Session cleanup completed"),
                Err(e) => warn!(error = %e, "Session cleanup failed"),
            }
        }
    })
}
