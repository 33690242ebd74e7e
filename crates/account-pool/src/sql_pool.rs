//! Query strategy: one validated SELECT against the account store

use std::sync::Arc;
use std::time::Duration;

use account_store::{AccountStore, DEFAULT_QUERY_TIMEOUT, QueryParam};
use tracing::debug;

use crate::account::Account;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::{AccountSource, BoxFuture, Pool};
use crate::validation::validate_query;

/// Pool over the rows of a fixed query.
pub type SqlAccountPool = Pool<SqlSource>;

impl Pool<SqlSource> {
    pub async fn open(
        name: impl Into<String>,
        store: AccountStore,
        query: impl Into<String>,
        params: Vec<QueryParam>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        let source = SqlSource::new(store, query, params)?;
        Pool::start(name, source, config).await
    }
}

#[derive(Debug, Clone)]
pub struct SqlSource {
    store: AccountStore,
    query: String,
    params: Vec<QueryParam>,
    timeout: Duration,
}

impl SqlSource {
    /// Fails with `UnsafeQuery` before anything is executed.
    pub fn new(
        store: AccountStore,
        query: impl Into<String>,
        params: Vec<QueryParam>,
    ) -> Result<Self> {
        let query = query.into();
        validate_query(&query)?;
        Ok(Self {
            store,
            query,
            params,
            timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    async fn run(&self) -> Result<Vec<Account>> {
        let rows = self
            .store
            .fetch_rows(&self.query, &self.params, self.timeout)
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;

        let returned = rows.len();
        let mut accounts = Vec::with_capacity(returned);
        for row in rows {
            let account = Account::from(row);
            // Rows pointing at files that are gone are not allocatable
            if tokio::fs::try_exists(&account.file_path).await.unwrap_or(false) {
                accounts.push(account);
            }
        }
        debug!(
            returned,
            kept = accounts.len(),
            "account query rows resolved against disk"
        );
        Ok(accounts)
    }
}

impl AccountSource for SqlSource {
    fn kind(&self) -> &'static str {
        "sql"
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(self.run())
    }
}
