//! Account pool allocation engine
//!
//! Hands out a finite set of accounts to concurrent workers so that no two
//! workers hold the same account at once. Each pool discovers its accounts
//! from a source (directory scan, SQL query, or the unified pipeline), keeps
//! per-account lifecycle state in memory, and re-runs discovery on a timer
//! without disturbing accounts that are checked out.
//!
//! Account lifecycle:
//! 1. Discovery finds the account → `Available`, pushed onto the availability queue
//! 2. `get_next` dequeues it → `InUse`, assigned to the calling worker
//! 3. `return_account` → `Available` again (requeued if the queue has room)
//! 4. `mark_used` with a successful result → `Completed`, never re-offered
//! 5. `mark_used` failure or `mark_failed` → requeued while the retry budget
//!    lasts, terminal `Failed` once it is spent
//! 6. Background refresh merges source changes, keeping lifecycle state

pub mod account;
pub mod config;
pub mod definition;
pub mod error;
pub mod file_pool;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod refresh;
pub mod sql_pool;
pub mod stats;
#[cfg(test)]
mod testing;
pub mod unified_pool;
pub mod validation;

pub use account::{Account, AccountResult, AccountStatus};
pub use config::{PoolConfig, SortMethod};
pub use definition::{FilePoolConfig, PoolDefinition, PoolKind, SqlPoolConfig};
pub use error::{Error, Result};
pub use file_pool::{FileAccountPool, FileSource};
pub use manager::{Backends, PoolManager, TestReport};
pub use pool::{AccountPool, AccountSource, BoxFuture, Pool};
pub use sql_pool::{SqlAccountPool, SqlSource};
pub use stats::PoolStats;
pub use unified_pool::{QuerySource, UnifiedAccountPool, UnifiedPoolDefinition, UnifiedSource};
pub use validation::{validate_query, validate_unified};

pub use tokio_util::sync::CancellationToken;
