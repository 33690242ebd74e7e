//! Pool policy: filtering, ordering, retry and refresh settings

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::account::{Account, RetryPolicy};
use crate::error::{Error, Result};

/// Bound on a waiting `get_next` when `max_wait_secs` is 0.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(300);

/// Order in which available accounts are queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMethod {
    #[default]
    ModifiedAsc,
    ModifiedDesc,
    PacksAsc,
    PacksDesc,
}

impl SortMethod {
    /// Sort accounts in place. Ties (and missing timestamps) fall back to ID
    /// so queue order is deterministic.
    pub fn sort(&self, accounts: &mut [&Account]) {
        accounts.sort_by(|a, b| self.compare(a, b).then_with(|| a.id.cmp(&b.id)));
    }

    fn compare(&self, a: &Account, b: &Account) -> Ordering {
        match self {
            SortMethod::ModifiedAsc => a.last_modified.cmp(&b.last_modified),
            SortMethod::ModifiedDesc => b.last_modified.cmp(&a.last_modified),
            SortMethod::PacksAsc => a.packs.cmp(&b.packs),
            SortMethod::PacksDesc => b.packs.cmp(&a.packs),
        }
    }
}

/// Policy owned by one pool instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_packs: u32,
    #[serde(default)]
    pub max_packs: Option<u32>,
    #[serde(default)]
    pub sort_method: SortMethod,

    #[serde(default = "default_true")]
    pub retry_failed: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub wait_for_accounts: bool,
    /// 0 means `DEFAULT_MAX_WAIT`
    #[serde(default)]
    pub max_wait_secs: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_failures() -> u32 {
    3
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_buffer_size() -> usize {
    100
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_packs: 0,
            max_packs: None,
            sort_method: SortMethod::default(),
            retry_failed: default_true(),
            max_failures: default_max_failures(),
            auto_refresh: false,
            refresh_interval_secs: default_refresh_interval_secs(),
            wait_for_accounts: false,
            max_wait_secs: 0,
            buffer_size: default_buffer_size(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "buffer_size must be greater than 0".into(),
            ));
        }
        if self.retry_failed && self.max_failures == 0 {
            return Err(Error::InvalidConfig(
                "max_failures must be greater than 0 when retry_failed is set".into(),
            ));
        }
        if self.auto_refresh && self.refresh_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "refresh_interval_secs must be greater than 0 when auto_refresh is set".into(),
            ));
        }
        if let Some(max) = self.max_packs
            && max < self.min_packs
        {
            return Err(Error::InvalidConfig(format!(
                "max_packs ({max}) is below min_packs ({})",
                self.min_packs
            )));
        }
        Ok(())
    }

    /// Whether a resource count falls inside the configured bounds.
    pub fn admits(&self, packs: u32) -> bool {
        packs >= self.min_packs && self.max_packs.is_none_or(|max| packs <= max)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        if self.max_wait_secs == 0 {
            DEFAULT_MAX_WAIT
        } else {
            Duration::from_secs(self.max_wait_secs)
        }
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_failed: self.retry_failed,
            max_failures: self.max_failures,
        }
    }
}
