//! Core traits for the replication engine.
//!
//! - [`SourceReader`]: discovery, ordered range scans and the change
//!   tracking feed of a source database
//!
//! The replication modes only ever talk to a `dyn SourceReader`, so the
//! engine can be exercised against an in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::error::Result;

use super::schema::{Table, TableRef};
use super::value::{Batch, Record};

/// Row ordering and bounds of a table read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOrder {
    /// Keyset scan ordered by the primary key: `after < key <= upto`.
    /// `after = None` starts at the first row.
    PrimaryKey {
        key_columns: Vec<String>,
        after: Option<Vec<Value>>,
        upto: Vec<Value>,
    },

    /// `column >= from` (every row when `from` is None), ordered by the
    /// column with NULLs first.
    ReplicationKey { column: String, from: Option<Value> },

    /// One pass in whatever order the server returns.
    Unordered,
}

/// Options for reading rows from a table.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Table to read.
    pub table: TableRef,
    /// Columns to read.
    pub columns: Vec<String>,
    /// Column type strings, aligned with `columns`.
    pub col_types: Vec<String>,
    /// Ordering and bounds.
    pub order: ReadOrder,
    /// Number of rows per batch.
    pub batch_size: usize,
}

impl ReadOptions {
    /// Data type of a selected column.
    pub fn type_of(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.col_types.get(idx))
            .map(String::as_str)
    }
}

/// Options for reading the change tracking feed of one table.
#[derive(Debug, Clone)]
pub struct ChangeReadOptions {
    /// Table whose changes are read.
    pub table: TableRef,
    /// Primary key columns.
    pub key_columns: Vec<String>,
    /// Primary key column types, aligned with `key_columns`.
    pub key_types: Vec<String>,
    /// Selected columns.
    pub columns: Vec<String>,
    /// Selected column types, aligned with `columns`.
    pub col_types: Vec<String>,
    /// Exclusive lower bound (the bookmarked version).
    pub since: i64,
    /// Inclusive upper bound (version captured at the start of the pass).
    pub upto: i64,
}

/// Kind of row-level change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    /// Parse `SYS_CHANGE_OPERATION` (`I`, `U`, `D`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "I" => Some(ChangeOperation::Insert),
            "U" => Some(ChangeOperation::Update),
            "D" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

/// One entry of a change tracking feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    /// `SYS_CHANGE_VERSION` of the change.
    pub version: i64,
    /// Operation recorded for the row.
    pub operation: ChangeOperation,
    /// Commit time of the transaction, when the server still knows it.
    pub commit_time: Option<DateTime<Utc>>,
    /// Primary key values, aligned with the requested key columns.
    pub key: Vec<Value>,
    /// Current row image; `None` when the row no longer exists.
    pub data: Option<Record>,
}

/// Read schema, rows and change feeds from a source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Introspect databases, schemas, tables and views.
    async fn discover(&self, filter: &SyncConfig) -> Result<Vec<Table>>;

    /// Largest primary key tuple currently in the table, or `None` when the
    /// table is empty.
    async fn max_key_values(
        &self,
        table: &TableRef,
        key_columns: &[String],
        key_types: &[String],
    ) -> Result<Option<Vec<Value>>>;

    /// Start streaming rows from a table.
    ///
    /// Returns a channel receiver that yields batches of at most
    /// `opts.batch_size` rows. The final batch has `is_last` set.
    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>>;

    /// Whether change tracking is enabled for the table.
    async fn change_tracking_enabled(&self, table: &TableRef) -> Result<bool>;

    /// `CHANGE_TRACKING_CURRENT_VERSION()` of a database; `None` when change
    /// tracking is disabled for that database.
    async fn current_change_version(&self, database: &str) -> Result<Option<i64>>;

    /// Oldest version whose changes are still retained for the table.
    async fn min_valid_change_version(&self, table: &TableRef) -> Result<Option<i64>>;

    /// Changes recorded for the table in `(since, upto]`, ordered by version.
    async fn read_changes(&self, opts: ChangeReadOptions) -> Result<Vec<ChangeRow>>;

    /// Round-trip a trivial query.
    async fn test_connection(&self) -> Result<()>;

    /// Get the database type identifier (e.g., "mssql").
    fn db_type(&self) -> &str;

    /// Close the connection pool.
    async fn close(&self);
}
