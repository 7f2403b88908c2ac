//! SQLite backend for odstage.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Raw relations and staged relations
//! live side by side in one database file.

mod encode;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::{RunRecord, SqliteWarehouse};

#[cfg(test)]
mod tests;
