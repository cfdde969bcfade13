//! Configuration validation.

use super::Config;
use crate::error::{Result, TapError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.host.is_empty() {
        return Err(TapError::Config("source.host is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(TapError::Config("source.user is required".into()));
    }
    if config.source.port == 0 {
        return Err(TapError::Config("source.port must be non-zero".into()));
    }
    if config.source.database.is_empty() {
        return Err(TapError::Config("source.database cannot be empty".into()));
    }
    if config.source.max_connections == 0 {
        return Err(TapError::Config(
            "source.max_connections must be at least 1".into(),
        ));
    }

    // Sync validation
    if config.sync.batch_size == 0 {
        return Err(TapError::Config(
            "sync.batch_size must be at least 1".into(),
        ));
    }
    if config
        .sync
        .include_databases
        .iter()
        .chain(config.sync.include_schemas.iter())
        .any(|name| name.trim().is_empty())
    {
        return Err(TapError::Config(
            "sync.include_databases/include_schemas cannot contain empty names".into(),
        ));
    }

    Ok(())
}
