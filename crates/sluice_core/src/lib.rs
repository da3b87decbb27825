//! Core types shared across the Sluice crates.
//!
//! This crate is kept dependency-light because it is used by both the storage
//! layer and the SQL engines: `types` defines column types and rows, `codec`
//! the byte-level key/value encodings, `schema` the catalog metadata, and
//! `error` the user-visible error kinds.

pub mod codec;
pub mod error;
pub mod schema;
pub mod types;

pub use error::{SluiceError, SluiceResult};
pub use types::{ColumnType, Datum, Row, Rows};
