//! Core types for the odstage staging-layer builder.
//!
//! A staging model reads one raw relation extracted from the practice
//! management system, renames and coerces its columns, filters rows by an
//! incremental watermark, appends audit columns, and is checked by a
//! declarative list of data-quality assertions.
//!
//! This crate is free of database dependencies. Storage backends implement
//! [`store::Warehouse`]; the [`pipeline`] module drives any of them.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
#![allow(async_fn_in_trait)]

pub mod assertion;
pub mod coerce;
pub mod error;
pub mod incremental;
pub mod metadata;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod store;
pub mod value;

pub use error::{Error, Result};
