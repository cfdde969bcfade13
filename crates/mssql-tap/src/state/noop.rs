//! No-op state store.
//!
//! Used when the operator only consumes STATE messages from stdout.
//! Syncs complete normally but checkpoints are not written anywhere.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::warn;

use super::backend::StateStore;
use super::State;
use crate::error::Result;

/// State store that doesn't persist state.
///
/// Logs a warning on first save.
pub struct NoOpStateStore {
    warned: AtomicBool,
}

impl NoOpStateStore {
    pub fn new() -> Self {
        Self {
            warned: AtomicBool::new(false),
        }
    }

    fn warn_once(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                "No state output configured: checkpoints are only emitted as STATE messages. \
                 Resume depends on the consumer feeding the last STATE back."
            );
        }
    }
}

impl Default for NoOpStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for NoOpStateStore {
    async fn load(&self) -> Result<Option<State>> {
        Ok(None)
    }

    async fn save(&self, _state: &State) -> Result<()> {
        self.warn_once();
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "noop"
    }
}
