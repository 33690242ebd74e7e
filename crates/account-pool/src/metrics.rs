//! Pool metrics
//!
//! Recorded through the `metrics` facade; the binary decides whether a
//! recorder is installed.
//!
//! - `account_pool_checkouts_total` (counter): label `pool`
//! - `account_pool_outcomes_total` (counter): labels `pool`, `outcome`
//! - `account_pool_refresh_errors_total` (counter): label `pool`
//! - `account_pool_available` (gauge): label `pool`

pub fn record_checkout(pool: &str) {
    ::metrics::counter!("account_pool_checkouts_total", "pool" => pool.to_string()).increment(1);
}

/// `outcome` is one of `completed`, `requeued`, `failed`.
pub fn record_outcome(pool: &str, outcome: &'static str) {
    ::metrics::counter!(
        "account_pool_outcomes_total",
        "pool" => pool.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_refresh_error(pool: &str) {
    ::metrics::counter!("account_pool_refresh_errors_total", "pool" => pool.to_string())
        .increment(1);
}

pub fn set_available(pool: &str, available: usize) {
    ::metrics::gauge!("account_pool_available", "pool" => pool.to_string()).set(available as f64);
}
