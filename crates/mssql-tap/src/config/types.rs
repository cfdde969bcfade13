//! Configuration type definitions.

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MSSQL).
    pub source: SourceConfig,

    /// Sync behavior configuration.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Source database (MSSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Initial catalog for the connection (default: "master").
    #[serde(default = "default_master_database")]
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Encrypt connection (default: true).
    #[serde(default = "default_true")]
    pub encrypt: bool,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,

    /// Application name reported to the server.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Maximum pooled connections (default: 4).
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("encrypt", &self.encrypt)
            .field("trust_server_cert", &self.trust_server_cert)
            .field("application_name", &self.application_name)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Sync behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Rows per database round-trip; every batch boundary is a checkpoint.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Databases to discover. Empty means every online user database.
    #[serde(default)]
    pub include_databases: Vec<String>,

    /// Schemas to discover. Empty means every schema.
    #[serde(default)]
    pub include_schemas: Vec<String>,

    /// Keep syncing later streams after one fails (default: true).
    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    /// Emit a STATE message at every checkpoint (default: true).
    #[serde(default = "default_true")]
    pub emit_state_messages: bool,

    /// Name streams `schema-table` instead of `table` (default: false).
    #[serde(default)]
    pub stream_name_includes_schema: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            include_databases: Vec::new(),
            include_schemas: Vec::new(),
            continue_on_error: true,
            emit_state_messages: true,
            stream_name_includes_schema: false,
        }
    }
}

impl SyncConfig {
    /// Whether discovery should include the given database.
    pub fn includes_database(&self, database: &str) -> bool {
        self.include_databases.is_empty()
            || self
                .include_databases
                .iter()
                .any(|d| d.eq_ignore_ascii_case(database))
    }

    /// Whether discovery should include the given schema.
    pub fn includes_schema(&self, schema: &str) -> bool {
        self.include_schemas.is_empty()
            || self
                .include_schemas
                .iter()
                .any(|s| s.eq_ignore_ascii_case(schema))
    }
}

// Default value functions for serde
fn default_mssql_port() -> u16 {
    1433
}

fn default_master_database() -> String {
    "master".to_string()
}

fn default_application_name() -> String {
    "mssql-tap".to_string()
}

fn default_max_connections() -> u32 {
    4
}

fn default_batch_size() -> usize {
    10_000
}

fn default_true() -> bool {
    true
}
