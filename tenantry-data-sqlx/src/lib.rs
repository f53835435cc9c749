//! # tenantry-data-sqlx: SQLite backend for the tenantry data layer
//!
//! This crate implements the backend-neutral traits of [`tenantry-data`] on
//! top of [SQLx](https://github.com/launchbadge/sqlx) and SQLite. Every
//! entity is stored in its own table: bookkeeping fields are columns, the
//! rest of the record is a JSON document queried through `json_extract`.
//!
//! # What's in this crate
//!
//! | Type | Description |
//! |------|-------------|
//! | [`SqlxBackend`] | [`Backend`](tenantry_data::Backend) over a `SqlitePool`, with raw query support |
//! | [`SqliteTransactions`] | Transaction manager beginning native SQLite transactions |
//! | [`Tx`] | Native transaction driver owned by a [`Transaction`](tenantry_data::Transaction) |
//! | [`SqlxErrorExt`] | Extension trait to convert `sqlx::Error` → `DataError` (`.into_data_error()`) |
//! | [`SqlxResult<T>`] | Type alias for `Result<T, DataError>` |
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tenantry_data::{Context, Record, RegistryBuilder};
//! use tenantry_data_sqlx::SqlxBackend;
//!
//! let mut builder = RegistryBuilder::new();
//! tenantry_data_sqlx::register(&mut builder, "customer", &["name"])?;
//! let registry = builder.build();
//!
//! let backend = Arc::new(SqlxBackend::connect("sqlite://app.db", 5).await?);
//! let customers = registry.create("sqlite", "customer", backend, "customers")?;
//! let created = customers.create(&Context::background(), Record::new().with("name", "Ada")).await?;
//! ```
//!
//! # Transactions
//!
//! Operations join the transaction carried by the [`Context`](tenantry_data::Context)
//! when it was started on the same pool, and fail with
//! `DataError::ConnectionMismatch` when it belongs to another connection.
//! Without a transaction each operation runs in its own short one, so a
//! read-modify-write or a count plus page always sees one snapshot.
//!
//! # Error bridging
//!
//! Due to Rust's orphan rules, `From<sqlx::Error> for DataError` can't be
//! implemented here. Use the [`SqlxErrorExt`] trait instead:
//!
//! ```ignore
//! use tenantry_data_sqlx::SqlxErrorExt;
//!
//! sqlx::query("SELECT 1")
//!     .execute(backend.pool())
//!     .await
//!     .map_err(|e| e.into_data_error())?;
//! ```

pub mod backend;
pub mod error;
mod row;
mod sql;
pub mod tx;

pub use backend::{register, SqlxBackend, BACKEND_NAME};
pub use error::{SqlxErrorExt, SqlxResult};
pub use tx::{SqliteTransactions, Tx};

/// Re-exports of the most commonly used types from both `tenantry-data` and this crate.
pub mod prelude {
    pub use crate::{SqliteTransactions, SqlxBackend, SqlxErrorExt};
    pub use tenantry_data::prelude::*;
}
