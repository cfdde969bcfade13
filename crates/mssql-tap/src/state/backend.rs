//! State store trait for bookmark persistence.
//!
//! The orchestrator and the replication modes work with
//! `Arc<dyn StateStore>` and never know where the document ends up:
//!
//! - **File**: [`FileStateStore`](super::FileStateStore), atomic JSON writes
//! - **None**: [`NoOpStateStore`](super::NoOpStateStore), STATE messages only

use async_trait::async_trait;

use super::State;
use crate::error::Result;

/// Trait for bookmark persistence backends.
///
/// Every checkpoint overwrites the whole document; there is exactly one
/// writer per run.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last saved state, or `None` when nothing was saved yet.
    async fn load(&self) -> Result<Option<State>>;

    /// Persist the complete state.
    async fn save(&self, state: &State) -> Result<()>;

    /// Get the backend type name for logging/debugging.
    fn backend_type(&self) -> &'static str;
}
