//! SQLite-backed account table
//!
//! The table is the system of record for accounts that pools discover by
//! query. Pools only ever read from it through validated SELECT statements;
//! the one write path is the watched-folder import, which upserts by
//! `device_account`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::Secret;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::credential::DeviceCredential;
use crate::error::{Error, Result};
use crate::params::QueryParam;
use crate::row::AccountRow;

/// Bound applied to every discovery query.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_account TEXT NOT NULL UNIQUE,
    device_password TEXT NOT NULL,
    path TEXT NOT NULL DEFAULT '',
    packs INTEGER NOT NULL DEFAULT 0,
    last_modified TEXT,
    status TEXT NOT NULL DEFAULT 'available',
    failures INTEGER NOT NULL DEFAULT 0,
    err TEXT NOT NULL DEFAULT ''
)";

/// A data file parsed from a watched folder, ready to upsert.
#[derive(Debug, Clone)]
pub struct ImportedAccount {
    pub credential: DeviceCredential,
    pub path: String,
    pub packs: u32,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Handle to the backing store. Cheap to clone (shares the connection pool).
#[derive(Debug, Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    /// Open (creating if missing) the SQLite database at `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "connected to account store");
        Ok(Self { pool })
    }

    /// Open a store from a connection URL such as `sqlite::memory:`.
    pub async fn connect_url(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // In-memory databases are per connection; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `accounts` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Run a read-only account query with positional parameters.
    ///
    /// Callers are responsible for validating `sql` first; this method only
    /// bounds the execution time.
    pub async fn fetch_rows(
        &self,
        sql: &str,
        params: &[QueryParam],
        timeout: Duration,
    ) -> Result<Vec<AccountRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = param.bind_to(query);
        }

        let rows = tokio::time::timeout(timeout, query.fetch_all(&self.pool))
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        debug!(rows = rows.len(), "account query returned");
        rows.iter().map(AccountRow::decode).collect()
    }

    /// Fetch one account by primary key.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<AccountRow>> {
        let Ok(key) = id.parse::<i64>() else {
            return Ok(None);
        };
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(AccountRow::decode).transpose()
    }

    /// Insert or update an imported account keyed by `device_account`.
    ///
    /// Runtime columns (`status`, `failures`, `err`) of an existing row are
    /// left alone; only the credential and payload columns are replaced.
    pub async fn upsert(&self, account: &ImportedAccount) -> Result<AccountRow> {
        sqlx::query(
            "INSERT INTO accounts (device_account, device_password, path, packs, last_modified)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(device_account) DO UPDATE SET
                 device_password = excluded.device_password,
                 path = excluded.path,
                 packs = excluded.packs,
                 last_modified = excluded.last_modified",
        )
        .bind(&account.credential.device_account)
        .bind(account.credential.device_password.expose())
        .bind(&account.path)
        .bind(i64::from(account.packs))
        .bind(account.last_modified)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM accounts WHERE device_account = ?")
            .bind(&account.credential.device_account)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "account {} vanished after upsert",
                    account.credential.device_account
                ))
            })?;
        AccountRow::decode(&row)
    }

    /// Stored credentials for an account, by primary key.
    pub async fn credentials(&self, id: &str) -> Result<DeviceCredential> {
        let key = id
            .parse::<i64>()
            .map_err(|_| Error::NotFound(format!("account {id} has no numeric key")))?;
        let row = sqlx::query("SELECT device_account, device_password FROM accounts WHERE id = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("account {id} not in store")))?;

        let device_account: String = row.try_get("device_account")?;
        let device_password: String = row.try_get("device_password")?;
        Ok(DeviceCredential {
            device_account,
            device_password: Secret::new(device_password),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> AccountStore {
        let store = AccountStore::connect_url("sqlite::memory:").await.unwrap();
        store.ensure_schema().await.unwrap();
        store
    }

    fn imported(account: &str, packs: u32) -> ImportedAccount {
        ImportedAccount {
            credential: DeviceCredential {
                device_account: account.into(),
                device_password: Secret::new(format!("pw-{account}")),
            },
            path: format!("/storage/{account}.xml"),
            packs,
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_in_place() {
        let store = test_store().await;

        let first = store.upsert(&imported("acct-a", 3)).await.unwrap();
        assert_eq!(first.device_account.as_deref(), Some("acct-a"));
        assert_eq!(first.packs, 3);
        assert_eq!(first.status, "available");

        let second = store.upsert(&imported("acct-a", 9)).await.unwrap();
        assert_eq!(second.id, first.id, "upsert must keep the primary key");
        assert_eq!(second.packs, 9);
    }

    #[tokio::test]
    async fn upsert_keeps_runtime_columns() {
        let store = test_store().await;
        let row = store.upsert(&imported("acct-a", 1)).await.unwrap();
        sqlx::query("UPDATE accounts SET status = 'completed', failures = 2 WHERE id = ?")
            .bind(row.id.parse::<i64>().unwrap())
            .execute(&store.pool)
            .await
            .unwrap();

        let again = store.upsert(&imported("acct-a", 5)).await.unwrap();
        assert_eq!(again.status, "completed");
        assert_eq!(again.failures, 2);
    }

    #[tokio::test]
    async fn fetch_rows_binds_positional_params() {
        let store = test_store().await;
        store.upsert(&imported("low", 1)).await.unwrap();
        store.upsert(&imported("high", 20)).await.unwrap();

        let rows = store
            .fetch_rows(
                "select id, path, packs, last_modified, status, failures, err from accounts where packs > ?",
                &[QueryParam::Integer(10)],
                DEFAULT_QUERY_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "/storage/high.xml");
        assert_eq!(rows[0].device_account, None, "column not projected");
    }

    #[tokio::test]
    async fn fetch_rows_without_id_is_parse_error() {
        let store = test_store().await;
        store.upsert(&imported("acct", 1)).await.unwrap();

        let err = store
            .fetch_rows("SELECT path FROM accounts", &[], DEFAULT_QUERY_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn fetch_rows_reports_sql_errors() {
        let store = test_store().await;
        let err = store
            .fetch_rows("SELECT * FROM missing_table", &[], DEFAULT_QUERY_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn get_by_id_and_credentials() {
        let store = test_store().await;
        let row = store.upsert(&imported("acct-c", 4)).await.unwrap();

        let fetched = store.get_by_id(&row.id).await.unwrap().unwrap();
        assert_eq!(fetched, row);
        assert!(store.get_by_id("9999").await.unwrap().is_none());
        assert!(store.get_by_id("not-a-key").await.unwrap().is_none());

        let cred = store.credentials(&row.id).await.unwrap();
        assert_eq!(cred.device_account, "acct-c");
        assert_eq!(cred.device_password.expose(), "pw-acct-c");
        assert!(matches!(
            store.credentials("9999").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn connect_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.db");
        let store = AccountStore::connect(&path).await.unwrap();
        store.ensure_schema().await.unwrap();
        assert!(path.exists());
    }
}
