//! Allocation engine shared by every discovery strategy
//!
//! `Pool<S>` owns the account map, the availability queue and the refresh
//! task. Strategies only differ in their `AccountSource`: how accounts are
//! discovered and what has to happen before one is handed out.
//!
//! Locking: one `RwLock` guards the map, the queue and the stats snapshot
//! together, so "pop + mark InUse" and "rebuild queue from map" are each a
//! single critical section. Waiting for an account happens outside the lock
//! on a `Notify`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, AccountResult, AccountStatus, Outcome, RetryPolicy};
use crate::config::{PoolConfig, SortMethod};
use crate::error::{Error, Result};
use crate::metrics;
use crate::queue::{AvailabilityQueue, Push};
use crate::refresh::spawn_refresh_task;
use crate::stats::PoolStats;

/// Boxed future used by the object-safe traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where a pool's accounts come from.
///
/// Uses `Pin<Box<dyn Future>>` return types so sources stay dyn-compatible.
pub trait AccountSource: Send + Sync + 'static {
    /// Strategy label for logging ("file", "sql", "unified").
    fn kind(&self) -> &'static str;

    /// Run one discovery pass. Lifecycle fields of the returned accounts are
    /// only used for IDs the pool has not seen before.
    fn discover(&self) -> BoxFuture<'_, Result<Vec<Account>>>;

    /// Hook run after an account is dequeued and before it is returned to
    /// the caller. An error releases the account and fails the checkout.
    fn prepare_checkout<'a>(&'a self, _account: &'a Account) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// The allocation contract, as seen by workers and the pool manager.
pub trait AccountPool: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Check out the next available account for `worker_id`.
    fn get_next<'a>(
        &'a self,
        worker_id: u32,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Account>>;

    fn return_account<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn mark_used<'a>(&'a self, id: &'a str, result: AccountResult) -> BoxFuture<'a, Result<()>>;

    fn mark_failed<'a>(&'a self, id: &'a str, reason: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Snapshot of one account.
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Account>>;

    fn stats(&self) -> BoxFuture<'_, PoolStats>;

    fn refresh(&self) -> BoxFuture<'_, Result<()>>;

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

struct PoolState {
    accounts: HashMap<String, Account>,
    queue: AvailabilityQueue,
    stats: PoolStats,
    last_refresh: Option<DateTime<Utc>>,
}

impl PoolState {
    fn recompute(&mut self) {
        self.stats = PoolStats::compute(&self.accounts, self.queue.len(), self.last_refresh);
    }

    /// Replace the map with a discovery result, keeping lifecycle state for
    /// known IDs and keeping checked-out accounts the source no longer reports.
    fn merge(&mut self, discovered: Vec<Account>) {
        let mut next = HashMap::with_capacity(discovered.len());
        for mut account in discovered {
            if let Some(previous) = self.accounts.get(&account.id) {
                account.adopt_lifecycle(previous);
            }
            next.insert(account.id.clone(), account);
        }
        for (id, account) in self.accounts.drain() {
            if account.status == AccountStatus::InUse && !next.contains_key(&id) {
                next.insert(id, account);
            }
        }
        self.accounts = next;
    }

    /// Push available, not yet queued accounts in sort order until the queue
    /// is full. Returns how many were pushed.
    fn fill_queue(&mut self, sort: SortMethod) -> usize {
        let PoolState {
            accounts, queue, ..
        } = self;
        let mut ready: Vec<&Account> = accounts
            .values()
            .filter(|a| a.is_available() && !queue.contains(&a.id))
            .collect();
        sort.sort(&mut ready);

        let mut pushed = 0;
        for account in ready {
            match queue.try_push(&account.id) {
                Push::Queued => pushed += 1,
                Push::AlreadyQueued => {}
                Push::Full => break,
            }
        }
        pushed
    }

    /// Pop until an account that is still available turns up, and check it out.
    fn take_next(&mut self, sort: SortMethod, worker_id: u32) -> Option<Account> {
        if self.queue.is_empty() && self.accounts.values().any(Account::is_available) {
            let pushed = self.fill_queue(sort);
            debug!(pushed, "availability queue topped up from account map");
        }

        while let Some(id) = self.queue.pop() {
            // Stale entries (checked out via another path, removed by refresh)
            let Some(account) = self.accounts.get_mut(&id) else {
                continue;
            };
            if !account.is_available() {
                continue;
            }
            account.check_out(worker_id, Utc::now());
            let snapshot = account.clone();
            self.recompute();
            return Some(snapshot);
        }

        self.recompute();
        None
    }

    fn no_accounts(&self) -> Error {
        Error::NoAccountsAvailable {
            total: self.stats.total,
            available: self.stats.available,
        }
    }
}

/// A pool of accounts discovered from `S`.
pub struct Pool<S: AccountSource> {
    name: String,
    source: S,
    config: PoolConfig,
    state: RwLock<PoolState>,
    available: Notify,
    refresh_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: AccountSource> Pool<S> {
    /// Validate `config`, run the initial discovery and start the background
    /// refresh task if enabled.
    ///
    /// A failed initial discovery fails construction.
    pub async fn start(name: impl Into<String>, source: S, config: PoolConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let name = name.into();

        let pool = Arc::new(Self {
            state: RwLock::new(PoolState {
                accounts: HashMap::new(),
                queue: AvailabilityQueue::new(config.buffer_size),
                stats: PoolStats::default(),
                last_refresh: None,
            }),
            name,
            source,
            config,
            available: Notify::new(),
            refresh_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        });

        pool.refresh().await?;

        if pool.config.auto_refresh {
            let handle = spawn_refresh_task(
                Arc::downgrade(&pool),
                pool.config.refresh_interval(),
                pool.shutdown.clone(),
            );
            *pool.refresh_task.lock().await = Some(handle);
        }

        let stats = pool.stats().await;
        info!(
            pool = %pool.name,
            kind = pool.source.kind(),
            total = stats.total,
            available = stats.available,
            auto_refresh = pool.config.auto_refresh,
            "pool started"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::PoolClosed)
        } else {
            Ok(())
        }
    }

    /// Check out the next available account.
    ///
    /// With `wait_for_accounts` disabled an empty queue fails immediately.
    /// Otherwise this runs one eager refresh and then waits for a return,
    /// requeue or refresh, bounded by `max_wait`, `cancel` and `close`.
    /// A cancelled call never leaves an account checked out.
    pub async fn get_next(&self, worker_id: u32, cancel: &CancellationToken) -> Result<Account> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let account = match self.try_checkout(worker_id).await? {
            Ok(account) => account,
            Err(exhausted) if !self.config.wait_for_accounts => return Err(exhausted),
            Err(_) => self.wait_for_account(worker_id, cancel).await?,
        };

        if let Err(e) = self.source.prepare_checkout(&account).await {
            warn!(pool = %self.name, account_id = %account.id, error = %e, "checkout preparation failed, releasing account");
            self.release(&account.id).await;
            return Err(e);
        }

        metrics::record_checkout(&self.name);
        debug!(pool = %self.name, account_id = %account.id, worker_id, "account checked out");
        Ok(account)
    }

    /// One locked dequeue attempt. The inner error carries the counts for
    /// `NoAccountsAvailable`.
    async fn try_checkout(&self, worker_id: u32) -> Result<std::result::Result<Account, Error>> {
        let mut state = self.state.write().await;
        self.ensure_open()?;
        let taken = state.take_next(self.config.sort_method, worker_id);
        let available = state.stats.available;
        let outcome = taken.ok_or_else(|| state.no_accounts());
        drop(state);

        metrics::set_available(&self.name, available);
        Ok(outcome)
    }

    async fn wait_for_account(&self, worker_id: u32, cancel: &CancellationToken) -> Result<Account> {
        let deadline = tokio::time::Instant::now() + self.config.max_wait();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.refresh() => match result {
                Ok(()) => {}
                Err(Error::PoolClosed) => return Err(Error::PoolClosed),
                Err(e) => warn!(pool = %self.name, error = %e, "eager refresh before waiting failed"),
            },
        }

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            // Register before checking so a notify between check and wait is not lost.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let exhausted = match self.try_checkout(worker_id).await? {
                Ok(account) => return Ok(account),
                Err(exhausted) => exhausted,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shutdown.cancelled() => return Err(Error::PoolClosed),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(pool = %self.name, worker_id, "gave up waiting for an account");
                    return Err(exhausted);
                }
            }
        }
    }

    /// Release an account without an outcome. Always succeeds for a known ID.
    ///
    /// If the availability queue is full the account is not queued; it stays
    /// available in the map and is picked up by the next refresh or top-up.
    pub async fn return_account(&self, id: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;
        account.release();

        if state.queue.try_push(id) == Push::Full {
            warn!(pool = %self.name, account_id = id, "availability queue full, account waits for next refresh");
        }
        state.recompute();
        let available = state.stats.available;
        drop(state);

        debug!(pool = %self.name, account_id = id, "account returned");
        self.after_change(available);
        Ok(())
    }

    pub async fn mark_used(&self, id: &str, result: AccountResult) -> Result<()> {
        let policy = self.config.retry_policy();
        self.record(id, move |account, now| {
            account.record_result(result, policy, now)
        })
        .await
    }

    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<()> {
        let policy: RetryPolicy = self.config.retry_policy();
        self.record(id, |account, now| account.record_failure(reason, policy, now))
            .await
    }

    async fn record(
        &self,
        id: &str,
        transition: impl FnOnce(&mut Account, DateTime<Utc>) -> Outcome,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;
        if account.status != AccountStatus::InUse {
            return Err(Error::NotCheckedOut {
                id: id.to_string(),
                status: account.status.label(),
            });
        }

        let outcome = transition(account, Utc::now());
        let failures = account.failure_count;
        if outcome == Outcome::Requeued && state.queue.try_push(id) == Push::Full {
            warn!(pool = %self.name, account_id = id, "availability queue full, retry waits for next refresh");
        }
        state.recompute();
        let available = state.stats.available;
        drop(state);

        metrics::record_outcome(&self.name, outcome.label());
        match outcome {
            Outcome::Failed => {
                info!(pool = %self.name, account_id = id, failures, "account failed permanently")
            }
            _ => debug!(pool = %self.name, account_id = id, outcome = outcome.label(), failures, "outcome recorded"),
        }
        self.after_change(available);
        Ok(())
    }

    /// Snapshot of one account. Mutating it does not affect the pool.
    pub async fn get_by_id(&self, id: &str) -> Result<Account> {
        self.ensure_open()?;
        self.state
            .read()
            .await
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))
    }

    /// Current counters. Still readable after `close`.
    pub async fn stats(&self) -> PoolStats {
        self.state.read().await.stats.clone()
    }

    /// Re-run discovery and merge the result.
    ///
    /// On a discovery error the existing map and queue are left untouched.
    pub async fn refresh(&self) -> Result<()> {
        self.ensure_open()?;
        let _serialized = self.refresh_lock.lock().await;

        let discovered = self.source.discover().await?;
        let found = discovered.len();
        let admitted: Vec<Account> = discovered
            .into_iter()
            .filter(|a| self.config.admits(a.packs))
            .collect();
        let filtered = found - admitted.len();

        let mut state = self.state.write().await;
        // Closed while discovery ran
        self.ensure_open()?;
        state.merge(admitted);
        state.queue.clear();
        state.fill_queue(self.config.sort_method);
        state.last_refresh = Some(Utc::now());
        state.recompute();
        let stats = state.stats.clone();
        drop(state);

        info!(
            pool = %self.name,
            found,
            filtered,
            total = stats.total,
            available = stats.available,
            queued = stats.queued,
            "refresh complete"
        );
        self.after_change(stats.available);
        Ok(())
    }

    /// Stop the refresh task and drain the queue. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let handle = self.refresh_task.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            warn!(pool = %self.name, error = %e, "refresh task ended abnormally");
        }

        let mut state = self.state.write().await;
        state.queue.clear();
        state.recompute();
        drop(state);

        self.available.notify_waiters();
        info!(pool = %self.name, "pool closed");
        Ok(())
    }

    /// Put a just-dequeued account back after a failed checkout.
    async fn release(&self, id: &str) {
        let mut state = self.state.write().await;
        let Some(account) = state.accounts.get_mut(id) else {
            return;
        };
        account.release();
        let _ = state.queue.try_push(id);
        state.recompute();
        let available = state.stats.available;
        drop(state);
        self.after_change(available);
    }

    fn after_change(&self, available: usize) {
        metrics::set_available(&self.name, available);
        self.available.notify_waiters();
    }
}

impl<S: AccountSource> Drop for Pool<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<S: AccountSource> AccountPool for Pool<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        self.source.kind()
    }

    fn get_next<'a>(
        &'a self,
        worker_id: u32,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Account>> {
        Box::pin(Pool::get_next(self, worker_id, cancel))
    }

    fn return_account<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(Pool::return_account(self, id))
    }

    fn mark_used<'a>(&'a self, id: &'a str, result: AccountResult) -> BoxFuture<'a, Result<()>> {
        Box::pin(Pool::mark_used(self, id, result))
    }

    fn mark_failed<'a>(&'a self, id: &'a str, reason: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(Pool::mark_failed(self, id, reason))
    }

    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Account>> {
        Box::pin(Pool::get_by_id(self, id))
    }

    fn stats(&self) -> BoxFuture<'_, PoolStats> {
        Box::pin(Pool::stats(self))
    }

    fn refresh(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Pool::refresh(self))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Pool::close(self))
    }
}
