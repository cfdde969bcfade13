//! Microsoft SQL Server driver.
//!
//! - [`MssqlDialect`]: SQL builders for discovery, scans and change tracking
//! - [`MssqlReader`]: [`SourceReader`](crate::core::SourceReader) over a bb8 pool

mod dialect;
mod reader;

pub use dialect::{KeyBound, MssqlDialect, SYSTEM_DATABASES};
pub use reader::{MssqlReader, TiberiusConnectionManager};
