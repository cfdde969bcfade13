//! Schema metadata produced by discovery.
//!
//! These types describe what the server exposes, before the operator's
//! stream selection is applied (see [`crate::catalog`]).

use serde::{Deserialize, Serialize};

/// Fully qualified location of a table or view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Database name.
    pub database: String,

    /// Schema name.
    pub schema: String,

    /// Table or view name.
    pub table: String,
}

impl TableRef {
    pub fn new(
        database: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `database.schema.table`, for log lines.
    pub fn full_name(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.table)
    }
}

/// Table or view metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Location of the object.
    pub location: TableRef,

    /// Whether the object is a view.
    pub is_view: bool,

    /// Column definitions in ordinal order.
    pub columns: Vec<Column>,

    /// Primary key column names, in key order.
    pub primary_key: Vec<String>,

    /// Approximate row count (tables only).
    pub row_count: Option<i64>,
}

impl Table {
    /// Get the fully qualified name.
    pub fn full_name(&self) -> String {
        self.location.full_name()
    }

    /// Check if the table has a primary key.
    pub fn has_pk(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Data type (e.g., "int", "varchar", "datetime2").
    pub data_type: String,

    /// Maximum length for string/binary types (-1 for max).
    pub max_length: i32,

    /// Numeric precision.
    pub precision: i32,

    /// Numeric scale.
    pub scale: i32,

    /// Whether the column allows NULL.
    pub is_nullable: bool,

    /// Ordinal position (1-based).
    pub ordinal_pos: i32,
}

impl Column {
    /// Shorthand used by discovery and tests.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            max_length: 0,
            precision: 0,
            scale: 0,
            is_nullable: true,
            ordinal_pos: 0,
        }
    }
}
