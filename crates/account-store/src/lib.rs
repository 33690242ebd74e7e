//! Backing store for pool accounts
//!
//! Holds everything the pools need from outside their own memory:
//! - `AccountStore`: the SQLite `accounts` table, queried by the SQL and
//!   unified strategies and upserted by watched-folder imports
//! - `AccountRow`: the projection every query result is decoded into
//! - `DeviceCredential`: the device account/password pair and the XML data
//!   file format it is read from and rendered to
//! - `ManagedStorage`: the directory holding each account's authoritative
//!   data file

pub mod credential;
pub mod error;
pub mod params;
pub mod row;
pub mod storage;
pub mod store;

pub use credential::{DeviceCredential, parse_device_file, render_device_file};
pub use error::{Error, Result};
pub use params::QueryParam;
pub use row::AccountRow;
pub use storage::ManagedStorage;
pub use store::{AccountStore, DEFAULT_QUERY_TIMEOUT, ImportedAccount};
