//! Result-row projection shared by every account query
//!
//! Rows are decoded by column name so user queries may project in any order
//! or use `SELECT *`. `id` is the only required column; everything else falls
//! back to a default when the query does not project it.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite};

use crate::error::{Error, Result};

/// One account as seen by the backing store.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub id: String,
    pub device_account: Option<String>,
    pub path: String,
    pub packs: u32,
    pub last_modified: Option<DateTime<Utc>>,
    /// Stored status label (`available`, `completed`, ...)
    pub status: String,
    pub failures: u32,
    pub last_error: String,
}

impl AccountRow {
    /// Decode a row returned by an account query.
    ///
    /// `id` may be an INTEGER primary key or TEXT. A row without an `id`
    /// column is malformed.
    pub fn decode(row: &SqliteRow) -> Result<Self> {
        let id = match row.try_get::<i64, _>("id") {
            Ok(id) => id.to_string(),
            Err(sqlx::Error::ColumnNotFound(_)) => {
                return Err(Error::Parse("result row has no id column".into()));
            }
            Err(_) => row
                .try_get::<String, _>("id")
                .map_err(|e| Error::Parse(format!("column id: {e}")))?,
        };

        let packs = optional::<i64>(row, "packs")?.unwrap_or(0);
        let failures = optional::<i64>(row, "failures")?.unwrap_or(0);

        Ok(Self {
            id,
            device_account: optional::<String>(row, "device_account")?,
            path: optional::<String>(row, "path")?.unwrap_or_default(),
            packs: u32::try_from(packs.max(0)).unwrap_or(u32::MAX),
            last_modified: optional::<DateTime<Utc>>(row, "last_modified")?,
            status: optional::<String>(row, "status")?.unwrap_or_else(|| "available".into()),
            failures: u32::try_from(failures.max(0)).unwrap_or(u32::MAX),
            last_error: optional::<String>(row, "err")?.unwrap_or_default(),
        })
    }
}

/// Read a nullable column that the query may not project at all.
fn optional<'r, T>(row: &'r SqliteRow, column: &str) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    match row.try_get::<Option<T>, _>(column) {
        Ok(value) => Ok(value),
        Err(sqlx::Error::ColumnNotFound(_)) => Ok(None),
        Err(e) => Err(Error::Parse(format!("column {column}: {e}"))),
    }
}
