//! Aggregate pool counters

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::account::{Account, AccountStatus};

/// Snapshot of a pool's account tally.
///
/// Counts come from the account map. `queued` is the availability queue's
/// length and may lag `available` after a dropped return push; it is
/// reported separately rather than folded into `available`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub queued: usize,
    pub last_refresh: Option<DateTime<Utc>>,

    pub packs_opened: u64,
    pub cards_found: u64,
    pub kept: u64,
    pub avg_duration: Duration,
}

impl PoolStats {
    /// Recompute from scratch. Called after every map mutation.
    pub(crate) fn compute(
        accounts: &HashMap<String, Account>,
        queued: usize,
        last_refresh: Option<DateTime<Utc>>,
    ) -> Self {
        let mut stats = PoolStats {
            total: accounts.len(),
            queued,
            last_refresh,
            ..Default::default()
        };

        let mut total_duration = Duration::ZERO;
        let mut timed: u32 = 0;

        for account in accounts.values() {
            match account.status {
                AccountStatus::Available => stats.available += 1,
                AccountStatus::InUse => stats.in_use += 1,
                AccountStatus::Completed => stats.completed += 1,
                AccountStatus::Failed => stats.failed += 1,
                AccountStatus::Skipped => stats.skipped += 1,
            }
            if let Some(result) = &account.result {
                stats.packs_opened += u64::from(result.packs_opened);
                stats.cards_found += u64::from(result.cards_found);
                stats.kept += u64::from(result.kept);
                if !result.duration.is_zero() {
                    total_duration += result.duration;
                    timed += 1;
                }
            }
        }

        if timed > 0 {
            stats.avg_duration = total_duration / timed;
        }
        stats
    }
}
