//! Core abstractions shared by discovery and replication.
//!
//! - [`schema`]: table, view and column metadata
//! - [`value`]: SQL values, JSON records and batches
//! - [`traits`]: the [`SourceReader`] seam between the engine and a database

pub mod schema;
pub mod traits;
pub mod value;

pub use schema::{Column, Table, TableRef};
pub use traits::{ChangeOperation, ChangeReadOptions, ChangeRow, ReadOptions, ReadOrder, SourceReader};
pub use value::{compare_json, compare_keys, key_of, Batch, Record, SqlValue};
