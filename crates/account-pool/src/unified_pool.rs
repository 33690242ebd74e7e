//! Unified strategy: queries, manual includes, watched folders, excludes
//!
//! Every discovery pass runs the same pipeline:
//! 1. run each query in order; a later query's row replaces an earlier one
//! 2. add included IDs that are not present yet, fetched by primary key
//! 3. import data files from watched folders (upsert + copy to storage)
//! 4. drop excluded IDs, unconditionally
//!
//! Accounts point at their file in managed storage. A file that does not
//! exist yet is written from the stored credentials at checkout, so queries
//! should project `device_account` (`SELECT *` does).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use account_store::{
    AccountRow, AccountStore, DEFAULT_QUERY_TIMEOUT, ImportedAccount, ManagedStorage, QueryParam,
    parse_device_file,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::file_pool::packs_from_name;
use crate::pool::{AccountSource, BoxFuture, Pool};
use crate::validation::validate_unified;

/// Pool over the unified pipeline.
pub type UnifiedAccountPool = Pool<UnifiedSource>;

impl Pool<UnifiedSource> {
    pub async fn open(
        name: impl Into<String>,
        store: AccountStore,
        storage: ManagedStorage,
        definition: UnifiedPoolDefinition,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let config = definition.config.clone();
        let source = UnifiedSource::new(store, storage, definition)?;
        for warning in source.warnings() {
            warn!(pool = %name, warning = %warning, "pool definition warning");
        }
        Pool::start(name, source, config).await
    }
}

/// A named query feeding a unified pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySource {
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl QuerySource {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<QueryParam>) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedPoolDefinition {
    #[serde(default)]
    pub queries: Vec<QuerySource>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub watched_paths: Vec<PathBuf>,
    #[serde(default)]
    pub config: PoolConfig,
}

#[derive(Debug, Clone)]
pub struct UnifiedSource {
    store: AccountStore,
    storage: ManagedStorage,
    definition: UnifiedPoolDefinition,
    warnings: Vec<String>,
    timeout: Duration,
}

impl UnifiedSource {
    /// Validates the definition; unsafe queries are rejected here.
    pub fn new(
        store: AccountStore,
        storage: ManagedStorage,
        definition: UnifiedPoolDefinition,
    ) -> Result<Self> {
        let warnings = validate_unified(&definition)?;
        Ok(Self {
            store,
            storage,
            definition,
            warnings,
            timeout: DEFAULT_QUERY_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn definition(&self) -> &UnifiedPoolDefinition {
        &self.definition
    }

    /// Non-fatal findings from validation.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    async fn resolve(&self) -> Result<Vec<Account>> {
        let mut working: HashMap<String, Account> = HashMap::new();

        for query in &self.definition.queries {
            let rows = self
                .store
                .fetch_rows(&query.sql, &query.params, self.timeout)
                .await
                .map_err(|e| Error::Discovery(format!("query {}: {e}", query.name)))?;
            for row in rows {
                let account = self.account_from_row(row, "query", &query.name);
                working.insert(account.id.clone(), account);
            }
        }

        for id in &self.definition.include {
            if working.contains_key(id) {
                continue;
            }
            match self.store.get_by_id(id).await {
                Ok(Some(row)) => {
                    let account = self.account_from_row(row, "source", "include");
                    working.insert(account.id.clone(), account);
                }
                Ok(None) => warn!(account_id = %id, "included account not found in store"),
                Err(e) => return Err(Error::Discovery(format!("include {id}: {e}"))),
            }
        }

        for folder in &self.definition.watched_paths {
            for account in self.import_folder(folder).await {
                working.insert(account.id.clone(), account);
            }
        }

        for id in &self.definition.exclude {
            working.remove(id);
        }

        Ok(working.into_values().collect())
    }

    /// Import every data file directly inside `folder`. Per-file failures are
    /// logged and skipped.
    async fn import_folder(&self, folder: &Path) -> Vec<Account> {
        let mut reader = match tokio::fs::read_dir(folder).await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(folder = %folder.display(), error = %e, "skipping unreadable watched folder");
                return Vec::new();
            }
        };

        let mut files = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    let is_xml = path
                        .extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("xml"));
                    if is_xml {
                        files.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(folder = %folder.display(), error = %e, "watched folder listing interrupted");
                    break;
                }
            }
        }
        files.sort();

        let mut imported = Vec::with_capacity(files.len());
        for path in files {
            match self.import_file(&path, folder).await {
                Ok(account) => imported.push(account),
                Err(e) => warn!(file = %path.display(), error = %e, "skipping data file"),
            }
        }
        if !imported.is_empty() {
            info!(folder = %folder.display(), imported = imported.len(), "imported watched folder");
        }
        imported
    }

    async fn import_file(&self, path: &Path, folder: &Path) -> Result<Account> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| account_store::Error::Io(format!("reading {}: {e}", path.display())))?;
        let credential = parse_device_file(&contents)?;

        let last_modified = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        let packs = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(packs_from_name)
            .unwrap_or(0);

        let stored = self
            .storage
            .import_file(path, &credential.device_account)
            .await?;
        let row = self
            .store
            .upsert(&ImportedAccount {
                credential,
                path: stored.to_string_lossy().into_owned(),
                packs,
                last_modified,
            })
            .await?;
        debug!(file = %path.display(), account_id = %row.id, "data file imported");

        Ok(self.account_from_row(row, "watched", &folder.to_string_lossy()))
    }

    fn account_from_row(&self, row: AccountRow, origin_key: &str, origin: &str) -> Account {
        let storage_path = row
            .device_account
            .as_deref()
            .map(|device_account| self.storage.path_for(device_account));
        let mut account = Account::from(row);
        if let Some(path) = storage_path {
            account.file_path = path;
        }
        account
            .metadata
            .insert(origin_key.to_string(), origin.to_string());
        account
    }

    /// Write the data file from stored credentials if storage lacks it.
    async fn materialize(&self, account: &Account) -> Result<()> {
        let credential = self.store.credentials(&account.id).await?;
        let (path, created) = self.storage.ensure_file(&credential).await?;
        if created {
            info!(account_id = %account.id, path = %path.display(), "materialized data file from stored credentials");
        }
        Ok(())
    }
}

impl AccountSource for UnifiedSource {
    fn kind(&self) -> &'static str {
        "unified"
    }

    fn discover(&self) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(self.resolve())
    }

    fn prepare_checkout<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.materialize(account))
    }
}
