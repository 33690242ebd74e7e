//! Positional query parameters
//!
//! Parameters come from pool definition files as bare TOML scalars, so the
//! enum is untagged: `params = [10, "active", 0.5, true]`.

use serde::{Deserialize, Serialize};
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;

/// A single positional (`?`) parameter bound into a read-only query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl QueryParam {
    /// Bind this parameter as the next positional argument of `query`.
    pub(crate) fn bind_to<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        match self {
            QueryParam::Bool(v) => query.bind(*v),
            QueryParam::Integer(v) => query.bind(*v),
            QueryParam::Real(v) => query.bind(*v),
            QueryParam::Text(v) => query.bind(v.clone()),
        }
    }
}
