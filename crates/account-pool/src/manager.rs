//! Named pool definitions and their live instances
//!
//! The manager owns two maps: definitions loaded from the definitions
//! directory, and pool instances created lazily from them. Changing or
//! removing a definition closes its cached instance; the next `get_pool`
//! builds a fresh one.
//!
//! Lock order: `instances` may be held while reading `definitions`, never
//! the other way around.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use account_store::{AccountStore, DEFAULT_QUERY_TIMEOUT, ManagedStorage};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::definition::{DEFINITION_EXTENSION, PoolDefinition, PoolKind, definition_path};
use crate::error::{Error, Result};
use crate::file_pool::FileAccountPool;
use crate::pool::AccountPool;
use crate::sql_pool::{SqlAccountPool, SqlSource};
use crate::stats::PoolStats;
use crate::unified_pool::{UnifiedAccountPool, UnifiedSource};

/// Store and storage shared by every SQL and unified pool.
#[derive(Debug, Clone)]
pub struct Backends {
    pub store: AccountStore,
    pub storage: ManagedStorage,
    pub query_timeout: Duration,
}

impl Backends {
    pub fn new(store: AccountStore, storage: ManagedStorage) -> Self {
        Self {
            store,
            storage,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

/// Result of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub stats: PoolStats,
    pub warnings: Vec<String>,
}

pub struct PoolManager {
    definitions_dir: PathBuf,
    backends: Option<Backends>,
    definitions: RwLock<HashMap<String, PoolDefinition>>,
    instances: Mutex<HashMap<String, Arc<dyn AccountPool>>>,
}

impl PoolManager {
    /// Without `backends` only file pools can be instantiated.
    pub fn new(definitions_dir: impl Into<PathBuf>, backends: Option<Backends>) -> Self {
        Self {
            definitions_dir: definitions_dir.into(),
            backends,
            definitions: RwLock::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn definitions_dir(&self) -> &Path {
        &self.definitions_dir
    }

    /// Load every definition file, replacing the current set.
    ///
    /// Unreadable or malformed files are skipped with a warning. Cached
    /// instances whose definition vanished or changed are closed.
    pub async fn discover_pools(&self) -> Result<usize> {
        tokio::fs::create_dir_all(&self.definitions_dir)
            .await
            .map_err(|e| {
                Error::Definition(format!("creating {}: {e}", self.definitions_dir.display()))
            })?;
        let mut reader = tokio::fs::read_dir(&self.definitions_dir)
            .await
            .map_err(|e| {
                Error::Definition(format!("reading {}: {e}", self.definitions_dir.display()))
            })?;

        let mut loaded = HashMap::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| Error::Definition(format!("listing definitions: {e}")))?
        {
            let path = entry.path();
            let is_definition = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == DEFINITION_EXTENSION);
            if !is_definition {
                continue;
            }
            match PoolDefinition::load(&path).await {
                Ok(definition) => {
                    debug!(pool = %definition.name, kind = definition.kind.label(), "loaded pool definition");
                    loaded.insert(definition.name.clone(), definition);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "skipping pool definition"),
            }
        }

        let count = loaded.len();
        let stale: Vec<String> = {
            let mut definitions = self.definitions.write().await;
            let stale = definitions
                .iter()
                .filter(|(name, old)| loaded.get(*name) != Some(*old))
                .map(|(name, _)| name.clone())
                .collect();
            *definitions = loaded;
            stale
        };
        for name in &stale {
            self.invalidate(name).await;
        }

        info!(dir = %self.definitions_dir.display(), pools = count, "pool definitions discovered");
        Ok(count)
    }

    /// Sorted pool names.
    pub async fn list_pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn definition(&self, name: &str) -> Result<PoolDefinition> {
        self.definitions
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))
    }

    /// Get the live instance for `name`, creating it on first use.
    pub async fn get_pool(&self, name: &str) -> Result<Arc<dyn AccountPool>> {
        let mut instances = self.instances.lock().await;
        if let Some(pool) = instances.get(name) {
            return Ok(pool.clone());
        }

        let definition = self.definition(name).await?;
        let pool = self.instantiate(&definition).await?;
        instances.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// Persist a new definition. Returns validation warnings.
    pub async fn create_pool(&self, definition: PoolDefinition) -> Result<Vec<String>> {
        let warnings = definition.validate()?;
        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&definition.name) {
            return Err(Error::Definition(format!(
                "pool {} already exists",
                definition.name
            )));
        }
        definition.save(&self.definitions_dir).await?;
        info!(pool = %definition.name, kind = definition.kind.label(), "pool created");
        definitions.insert(definition.name.clone(), definition);
        Ok(warnings)
    }

    /// Replace the definition stored under `old_name`, possibly renaming it.
    /// Cached instances under both names are closed.
    pub async fn update_pool(
        &self,
        old_name: &str,
        definition: PoolDefinition,
    ) -> Result<Vec<String>> {
        let warnings = definition.validate()?;
        let new_name = definition.name.clone();
        {
            let mut definitions = self.definitions.write().await;
            if !definitions.contains_key(old_name) {
                return Err(Error::PoolNotFound(old_name.to_string()));
            }
            let renamed = new_name != old_name;
            if renamed && definitions.contains_key(&new_name) {
                return Err(Error::Definition(format!("pool {new_name} already exists")));
            }

            definition.save(&self.definitions_dir).await?;
            if renamed {
                remove_definition_file(&self.definitions_dir, old_name).await?;
                definitions.remove(old_name);
                info!(pool = %new_name, previous = old_name, "pool renamed");
            } else {
                info!(pool = %new_name, "pool updated");
            }
            definitions.insert(new_name.clone(), definition);
        }

        self.invalidate(old_name).await;
        if new_name != old_name {
            self.invalidate(&new_name).await;
        }
        Ok(warnings)
    }

    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        {
            let mut definitions = self.definitions.write().await;
            if !definitions.contains_key(name) {
                return Err(Error::PoolNotFound(name.to_string()));
            }
            remove_definition_file(&self.definitions_dir, name).await?;
            definitions.remove(name);
        }
        self.invalidate(name).await;
        info!(pool = name, "pool deleted");
        Ok(())
    }

    /// Build a throwaway instance, read its stats and close it.
    ///
    /// Background refresh is forced off and the instance is never cached,
    /// even when a pool with the same name is live.
    pub async fn test_pool(&self, definition: &PoolDefinition) -> Result<TestReport> {
        let mut definition = definition.clone();
        definition.config_mut().auto_refresh = false;
        let warnings = definition.validate()?;

        let pool = self.instantiate(&definition).await?;
        let stats = pool.stats().await;
        pool.close().await?;

        debug!(pool = %definition.name, total = stats.total, "dry run complete");
        Ok(TestReport { stats, warnings })
    }

    /// Close and forget every cached instance.
    pub async fn close_all(&self) -> Result<()> {
        let drained: Vec<(String, Arc<dyn AccountPool>)> =
            self.instances.lock().await.drain().collect();
        for (name, pool) in drained {
            if let Err(e) = pool.close().await {
                warn!(pool = %name, error = %e, "error closing pool");
            }
        }
        Ok(())
    }

    async fn instantiate(&self, definition: &PoolDefinition) -> Result<Arc<dyn AccountPool>> {
        let name = definition.name.clone();
        let pool: Arc<dyn AccountPool> = match &definition.kind {
            PoolKind::File(file) => {
                FileAccountPool::open(name, file.directory.clone(), file.config.clone()).await?
            }
            PoolKind::Sql(sql) => {
                let backends = self.backends(definition)?;
                let source =
                    SqlSource::new(backends.store.clone(), sql.query.clone(), sql.params.clone())?
                        .with_timeout(backends.query_timeout);
                SqlAccountPool::start(name, source, sql.config.clone()).await?
            }
            PoolKind::Unified(unified) => {
                let backends = self.backends(definition)?;
                let source = UnifiedSource::new(
                    backends.store.clone(),
                    backends.storage.clone(),
                    unified.clone(),
                )?
                .with_timeout(backends.query_timeout);
                for warning in source.warnings() {
                    warn!(pool = %name, warning = %warning, "pool definition warning");
                }
                UnifiedAccountPool::start(name, source, unified.config.clone()).await?
            }
        };
        Ok(pool)
    }

    fn backends(&self, definition: &PoolDefinition) -> Result<&Backends> {
        self.backends.as_ref().ok_or_else(|| {
            Error::Definition(format!(
                "pool {} is a {} pool but no account store is configured",
                definition.name,
                definition.kind.label()
            ))
        })
    }

    async fn invalidate(&self, name: &str) {
        let removed = self.instances.lock().await.remove(name);
        if let Some(pool) = removed {
            if let Err(e) = pool.close().await {
                warn!(pool = name, error = %e, "error closing invalidated pool");
            }
            debug!(pool = name, "cached pool instance invalidated");
        }
    }
}

async fn remove_definition_file(dir: &Path, name: &str) -> Result<()> {
    match tokio::fs::remove_file(definition_path(dir, name)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Definition(format!(
            "removing definition {name}: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::definition::{FilePoolConfig, SqlPoolConfig};
    use crate::unified_pool::UnifiedPoolDefinition;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _dir: tempfile::TempDir,
        definitions: PathBuf,
        accounts: PathBuf,
    }

    impl Fixture {
        async fn new(account_files: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let definitions = dir.path().join("pools");
            let accounts = dir.path().join("accounts");
            tokio::fs::create_dir_all(&accounts).await.unwrap();
            for name in account_files {
                tokio::fs::write(accounts.join(format!("{name}.xml")), b"<map/>")
                    .await
                    .unwrap();
            }
            Self {
                _dir: dir,
                definitions,
                accounts,
            }
        }

        fn manager(&self) -> PoolManager {
            PoolManager::new(&self.definitions, None)
        }

        fn file_pool(&self, name: &str) -> PoolDefinition {
            PoolDefinition::new(
                name,
                PoolKind::File(FilePoolConfig {
                    directory: self.accounts.clone(),
                    config: PoolConfig::default(),
                }),
            )
        }
    }

    #[tokio::test]
    async fn discover_skips_malformed_files() {
        let fx = Fixture::new(&["a"]).await;
        fx.file_pool("good").save(&fx.definitions).await.unwrap();
        tokio::fs::write(fx.definitions.join("broken.toml"), "type = \"file\"\ndirectory = [")
            .await
            .unwrap();
        tokio::fs::write(fx.definitions.join("wrong.toml"), "type = \"telepathy\"")
            .await
            .unwrap();
        tokio::fs::write(fx.definitions.join("readme.md"), "# pools")
            .await
            .unwrap();

        let manager = fx.manager();
        assert_eq!(manager.discover_pools().await.unwrap(), 1);
        assert_eq!(manager.list_pools().await, vec!["good".to_string()]);
    }

    #[tokio::test]
    async fn get_pool_caches_instances() {
        let fx = Fixture::new(&["a", "b"]).await;
        let manager = fx.manager();
        manager.create_pool(fx.file_pool("main")).await.unwrap();

        let first = manager.get_pool("main").await.unwrap();
        first.get_next(1, &CancellationToken::new()).await.unwrap();
        let second = manager.get_pool("main").await.unwrap();
        assert_eq!(second.stats().await.in_use, 1, "same instance expected");
        assert_eq!(second.kind(), "file");

        assert!(matches!(
            manager.get_pool("nope").await,
            Err(Error::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_invalidates_cached_instance() {
        let fx = Fixture::new(&["a"]).await;
        let manager = fx.manager();
        manager.create_pool(fx.file_pool("alpha")).await.unwrap();
        let old = manager.get_pool("alpha").await.unwrap();
        old.get_next(1, &CancellationToken::new()).await.unwrap();

        manager
            .update_pool("alpha", fx.file_pool("beta"))
            .await
            .unwrap();

        assert!(!fx.definitions.join("alpha.toml").exists());
        assert!(fx.definitions.join("beta.toml").exists());
        assert_eq!(manager.list_pools().await, vec!["beta".to_string()]);
        assert!(matches!(
            old.get_next(2, &CancellationToken::new()).await,
            Err(Error::PoolClosed)
        ));
        assert!(matches!(
            manager.get_pool("alpha").await,
            Err(Error::PoolNotFound(_))
        ));

        let renamed = manager.get_pool("beta").await.unwrap();
        assert_eq!(renamed.name(), "beta");
        assert_eq!(renamed.stats().await.in_use, 0, "fresh instance expected");
    }

    #[tokio::test]
    async fn update_in_place_recreates_instance() {
        let fx = Fixture::new(&["a", "b", "c"]).await;
        let manager = fx.manager();
        manager.create_pool(fx.file_pool("main")).await.unwrap();
        assert_eq!(manager.get_pool("main").await.unwrap().stats().await.total, 3);

        let mut narrowed = fx.file_pool("main");
        narrowed.config_mut().max_packs = Some(0);
        narrowed.config_mut().min_packs = 1;
        assert!(manager.update_pool("main", narrowed).await.is_err(), "max < min");

        let mut tighter = fx.file_pool("main");
        tighter.config_mut().buffer_size = 1;
        manager.update_pool("main", tighter).await.unwrap();
        let stats = manager.get_pool("main").await.unwrap().stats().await;
        assert_eq!((stats.total, stats.queued), (3, 1));
    }

    #[tokio::test]
    async fn test_pool_is_never_cached() {
        let fx = Fixture::new(&["a", "b"]).await;
        let manager = fx.manager();
        manager.create_pool(fx.file_pool("live")).await.unwrap();
        let live = manager.get_pool("live").await.unwrap();
        live.get_next(1, &CancellationToken::new()).await.unwrap();

        let mut probe = fx.file_pool("live");
        probe.config_mut().auto_refresh = true;
        let report = manager.test_pool(&probe).await.unwrap();
        assert_eq!(report.stats.total, 2);
        assert_eq!(report.stats.in_use, 0);
        assert!(report.warnings.is_empty());

        let report = manager.test_pool(&fx.file_pool("scratch")).await.unwrap();
        assert_eq!(report.stats.available, 2);
        assert!(matches!(
            manager.get_pool("scratch").await,
            Err(Error::PoolNotFound(_))
        ));

        let again = manager.get_pool("live").await.unwrap();
        assert_eq!(again.stats().await.in_use, 1, "live instance untouched");
    }

    #[tokio::test]
    async fn create_and_delete_rules() {
        let fx = Fixture::new(&["a"]).await;
        let manager = fx.manager();
        manager.create_pool(fx.file_pool("one")).await.unwrap();
        assert!(matches!(
            manager.create_pool(fx.file_pool("one")).await,
            Err(Error::Definition(_))
        ));
        assert!(matches!(
            manager.update_pool("ghost", fx.file_pool("ghost")).await,
            Err(Error::PoolNotFound(_))
        ));

        let pool = manager.get_pool("one").await.unwrap();
        manager.delete_pool("one").await.unwrap();
        assert!(!fx.definitions.join("one.toml").exists());
        assert!(matches!(
            pool.get_next(1, &CancellationToken::new()).await,
            Err(Error::PoolClosed)
        ));
        assert!(matches!(
            manager.delete_pool("one").await,
            Err(Error::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rediscovery_closes_vanished_pools() {
        let fx = Fixture::new(&["a"]).await;
        let manager = fx.manager();
        manager.create_pool(fx.file_pool("temp")).await.unwrap();
        let pool = manager.get_pool("temp").await.unwrap();

        tokio::fs::remove_file(fx.definitions.join("temp.toml"))
            .await
            .unwrap();
        assert_eq!(manager.discover_pools().await.unwrap(), 0);
        assert!(matches!(
            pool.refresh().await,
            Err(Error::PoolClosed)
        ));
    }

    #[tokio::test]
    async fn store_backed_pools_need_backends() {
        let fx = Fixture::new(&[]).await;
        let manager = fx.manager();
        let sql = PoolDefinition::new(
            "rows",
            PoolKind::Sql(SqlPoolConfig {
                query: "SELECT * FROM accounts".into(),
                params: vec![],
                config: PoolConfig::default(),
            }),
        );
        manager.create_pool(sql).await.unwrap();
        assert!(matches!(
            manager.get_pool("rows").await,
            Err(Error::Definition(_))
        ));
    }

    #[tokio::test]
    async fn unified_pool_through_backends() {
        let fx = Fixture::new(&[]).await;
        let store = AccountStore::connect_url("sqlite::memory:").await.unwrap();
        store.ensure_schema().await.unwrap();
        let storage = ManagedStorage::new(fx.accounts.join("storage"));
        let manager = PoolManager::new(&fx.definitions, Some(Backends::new(store, storage)));

        let warnings = manager
            .create_pool(PoolDefinition::new(
                "mixed",
                PoolKind::Unified(UnifiedPoolDefinition {
                    include: vec!["1".into()],
                    exclude: vec!["1".into()],
                    ..Default::default()
                }),
            ))
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);

        let pool = manager.get_pool("mixed").await.unwrap();
        assert_eq!(pool.kind(), "unified");
        manager.close_all().await.unwrap();
        assert!(matches!(pool.refresh().await, Err(Error::PoolClosed)));
    }
}
