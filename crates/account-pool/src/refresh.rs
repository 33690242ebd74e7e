//! Periodic background discovery
//!
//! Each pool with `auto_refresh` owns one task that re-runs discovery every
//! `refresh_interval`. The task holds only a weak reference, so it never
//! keeps a dropped pool alive, and it stops as soon as the pool's shutdown
//! token is cancelled.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::metrics;
use crate::pool::{AccountSource, Pool};

/// Spawn the refresh loop for `pool`.
pub(crate) fn spawn_refresh_task<S: AccountSource>(
    pool: Weak<Pool<S>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick is immediate; the pool was just discovered
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(pool) = pool.upgrade() else {
                break;
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refresh_cycle(&pool) => {}
            }
        }
        debug!("refresh task stopped");
    })
}

/// One scheduled refresh. Failures keep the previous accounts.
async fn refresh_cycle<S: AccountSource>(pool: &Pool<S>) {
    match pool.refresh().await {
        Ok(()) | Err(Error::PoolClosed) => {}
        Err(e) => {
            warn!(pool = %pool.name(), error = %e, "background refresh failed, keeping previous accounts");
            metrics::record_refresh_error(pool.name());
        }
    }
}
