//! Database driver implementations.
//!
//! - [`mssql`]: Microsoft SQL Server, the only source this tap reads from
//!
//! Drivers implement [`SourceReader`](crate::core::SourceReader); the
//! replication engine never sees driver types.

pub mod mssql;

pub use mssql::{MssqlDialect, MssqlReader};
