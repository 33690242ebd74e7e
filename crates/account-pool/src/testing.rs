//! In-memory account source for engine tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::account::Account;
use crate::error::{Error, Result};
use crate::pool::{AccountSource, BoxFuture};

/// Source whose discovery result the test controls.
#[derive(Clone)]
pub(crate) struct StaticSource {
    accounts: Arc<Mutex<std::result::Result<Vec<Account>, String>>>,
    discoveries: Arc<AtomicUsize>,
}

impl Default for StaticSource {
    fn default() -> Self {
        Self {
            accounts: Arc::new(Mutex::new(Ok(Vec::new()))),
            discoveries: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl StaticSource {
    pub(crate) fn with_ids(ids: &[&str]) -> Self {
        let source = Self {
            accounts: Arc::new(Mutex::new(Ok(Vec::new()))),
            discoveries: Arc::new(AtomicUsize::new(0)),
        };
        source.set_ids(ids);
        source
    }

    pub(crate) fn set_ids(&self, ids: &[&str]) {
        let accounts = ids
            .iter()
            .map(|id| Account::new(*id, format!("/accounts/{id}.xml")))
            .collect();
        *self.accounts.lock().unwrap() = Ok(accounts);
    }

    pub(crate) fn set_accounts(&self, accounts: Vec<Account>) {
        *self.accounts.lock().unwrap() = Ok(accounts);
    }

    pub(crate) fn fail_with(&self, message: &str) {
        *self.accounts.lock().unwrap() = Err(message.to_string());
    }

    pub(crate) fn discoveries(&self) -> usize {
        self.discoveries.load(Ordering::SeqCst)
    }
}

impl AccountSource for StaticSource {
    fn kind(&self) -> &'static str {
        "static"
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            self.discoveries.fetch_add(1, Ordering::SeqCst);
            self.accounts
                .lock()
                .unwrap()
                .clone()
                .map_err(Error::Discovery)
        })
    }
}
