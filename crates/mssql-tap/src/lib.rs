//! # mssql-tap
//!
//! Replication engine that extracts rows from Microsoft SQL Server and
//! emits them as a line-delimited stream of SCHEMA, RECORD,
//! ACTIVATE_VERSION and STATE messages.
//!
//! Each selected stream runs one of three resumable algorithms:
//!
//! - **FULL_TABLE**: keyset snapshot bounded by the key maximum at start
//! - **INCREMENTAL**: rows at or after the bookmarked replication key
//! - **LOG_BASED**: baseline snapshot, then SQL Server change tracking
//!
//! Progress is checkpointed after every batch, so an interrupted run
//! resumes where the sink last acknowledged.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_tap::{Catalog, Config, JsonLinesSink, Orchestrator, RecordEmitter, State};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> mssql_tap::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let catalog = Catalog::load("catalog.json")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let mut emitter = RecordEmitter::new(Box::new(JsonLinesSink::stdout()));
//!     let result = orchestrator
//!         .sync(&catalog, State::default(), &mut emitter, CancellationToken::new())
//!         .await?;
//!     eprintln!("Emitted {} records", result.records_emitted);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod core;
pub mod drivers;
pub mod emit;
pub mod error;
pub mod orchestrator;
pub mod replication;
pub mod state;
pub mod typemap;

// Re-exports for convenient access
pub use catalog::{Catalog, CatalogEntry, ReplicationMethod, Stream};
pub use config::{Config, SourceConfig, SyncConfig};
pub use emit::{JsonLinesSink, MemorySink, Message, MessageSink, RecordEmitter};
pub use error::{Result, TapError};
pub use orchestrator::{Orchestrator, SyncResult};
pub use state::{Bookmark, FileStateStore, NoOpStateStore, State, StateStore};
