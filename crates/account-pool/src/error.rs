//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool closed")]
    PoolClosed,

    /// Nothing could be dequeued. `total` and `available` come from the
    /// account map, so `total == 0` (empty pool) is distinguishable from
    /// accounts that exist but could not be handed out in time.
    #[error("no accounts available (total: {total}, available: {available})")]
    NoAccountsAvailable { total: usize, available: usize },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account {id} is not checked out (status: {status})")]
    NotCheckedOut { id: String, status: &'static str },

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("unsafe query rejected: {0}")]
    UnsafeQuery(String),

    #[error("checkout cancelled")]
    Cancelled,

    #[error("invalid pool config: {0}")]
    InvalidConfig(String),

    #[error("pool definition error: {0}")]
    Definition(String),

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("store error: {0}")]
    Store(#[from] account_store::Error),
}

impl From<common::Error> for Error {
    fn from(e: common::Error) -> Self {
        Error::Definition(e.to_string())
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
