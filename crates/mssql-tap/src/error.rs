//! Error types for the replication library.

use thiserror::Error;

/// Main error type for discovery and sync operations.
#[derive(Error, Debug)]
pub enum TapError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catalog document is malformed or references unknown streams.
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Schema introspection failed
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Change tracking is disabled for the table (or for its database).
    #[error("Change Tracking is not enabled for table: {table}")]
    ChangeTrackingNotEnabled { table: String, stream: String },

    /// LOG_BASED requested for a table without a primary key.
    #[error(
        "Change Tracking is not enabled for table: {table} \
         (stream {stream} has no primary key; change tracking requires one)"
    )]
    NoPrimaryKey { table: String, stream: String },

    /// LOG_BASED requested for a view.
    #[error("Change Tracking cannot be enabled on a view: {view} (stream {stream})")]
    ChangeTrackingOnView { view: String, stream: String },

    /// INCREMENTAL requested without a replication key.
    #[error("Stream {0} uses INCREMENTAL replication but has no replication-key")]
    MissingReplicationKey(String),

    /// Persisted state cannot be resumed safely.
    #[error("Invalid state for stream {stream}: {message}")]
    InvalidState { stream: String, message: String },

    /// The change tracking retention window passed the bookmark.
    #[error(
        "Change tracking data for stream {stream} has expired: \
         min valid version {min_valid} is newer than bookmarked version {bookmarked}. \
         Clear the stream's bookmark to take a new snapshot"
    )]
    ChangeTrackingExpired {
        stream: String,
        min_valid: i64,
        bookmarked: i64,
    },

    /// Sync failed for a specific stream
    #[error("Sync failed for stream {stream}: {message}")]
    Stream { stream: String, message: String },

    /// IO error (file operations, sink writes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Sync was cancelled (SIGINT, etc.)
    #[error("Sync cancelled")]
    Cancelled,
}

impl TapError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        TapError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create a Stream error
    pub fn stream(stream: impl Into<String>, message: impl Into<String>) -> Self {
        TapError::Stream {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidState error
    pub fn invalid_state(stream: impl Into<String>, message: impl Into<String>) -> Self {
        TapError::InvalidState {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            TapError::Config(_) | TapError::Catalog(_) | TapError::Yaml(_) => 2,
            TapError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Single-line message suitable for `tap_error_message`.
    pub fn one_line(&self) -> String {
        self.to_string()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for tap operations.
pub type Result<T> = std::result::Result<T, TapError>;
