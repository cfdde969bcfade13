//! Per-stream replication state machines.
//!
//! - [`full_table`]: resumable keyset snapshot
//! - [`incremental`]: running maximum of a replication key
//! - [`log_based`]: baseline snapshot, then the change tracking feed
//!
//! The three modes share only [`SyncContext`]: the source, the emitter and
//! the bookmark document with its checkpoint. A checkpoint flushes the
//! sink, persists the state and emits a `STATE` message, in that order, so
//! a persisted cursor never runs ahead of what the sink acknowledged.

pub mod changes;
pub mod full_table;
pub mod incremental;
pub mod log_based;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::catalog::Stream;
use crate::config::SyncConfig;
use crate::core::value::key_of;
use crate::core::{ReadOptions, ReadOrder, SourceReader};
use crate::emit::RecordEmitter;
use crate::error::{Result, TapError};
use crate::state::{State, StateStore};

/// Everything a replication mode needs while it runs.
pub struct SyncContext<'a> {
    pub source: &'a dyn SourceReader,
    pub store: &'a dyn StateStore,
    pub emitter: &'a mut RecordEmitter,
    pub config: &'a SyncConfig,
    pub cancel: &'a CancellationToken,
    /// Working copy of the state.
    pub state: State,
    /// State as of the last successful checkpoint.
    saved: State,
}

impl<'a> SyncContext<'a> {
    pub fn new(
        source: &'a dyn SourceReader,
        store: &'a dyn StateStore,
        emitter: &'a mut RecordEmitter,
        config: &'a SyncConfig,
        cancel: &'a CancellationToken,
        state: State,
    ) -> Self {
        Self {
            source,
            store,
            emitter,
            config,
            cancel,
            saved: state.clone(),
            state,
        }
    }

    /// Flush the sink, persist the state and announce it.
    pub async fn checkpoint(&mut self) -> Result<()> {
        self.emitter.flush()?;
        self.store.save(&self.state).await?;
        if self.config.emit_state_messages {
            self.emitter.state(&self.state)?;
        }
        self.saved = self.state.clone();
        debug!("Checkpoint saved");
        Ok(())
    }

    /// Fail with [`TapError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TapError::Cancelled);
        }
        Ok(())
    }

    /// Discard unsaved changes to one stream's bookmark.
    pub fn rollback_stream(&mut self, stream_id: &str) {
        match self.saved.bookmarks.get(stream_id) {
            Some(bookmark) => {
                self.state
                    .bookmarks
                    .insert(stream_id.to_string(), bookmark.clone());
            }
            None => {
                self.state.bookmarks.remove(stream_id);
            }
        }
    }

    /// Consume the context, returning the working state.
    pub fn into_state(self) -> State {
        self.state
    }
}

/// How a keyset scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every row up to the window end was emitted.
    Complete,
    /// The table was empty when the scan started.
    Empty,
}

/// Run (or resume) a resumable keyset scan over the stream's primary key.
///
/// A fresh scan records the table's current maximum key as the window end
/// and checkpoints before reading. After every batch the last emitted key
/// becomes `last_pk_fetched` and is checkpointed. The cursor fields are
/// removed when the window is exhausted; the caller checkpoints that.
pub async fn keyset_scan(
    ctx: &mut SyncContext<'_>,
    stream: &Stream,
    version: i64,
) -> Result<ScanOutcome> {
    let id = stream.tap_stream_id.as_str();
    let keys = &stream.key_properties;

    let (after, upto) = {
        let bookmark = ctx.state.bookmark_mut(id);
        match bookmark.max_pk_tuple(keys) {
            Some(upto) => {
                debug!("{}: resuming scan after {:?}", id, bookmark.last_pk_fetched);
                (bookmark.last_pk_tuple(keys), upto)
            }
            None => {
                let max = ctx
                    .source
                    .max_key_values(&stream.table, keys, &stream.key_types())
                    .await?;
                let Some(max) = max else {
                    debug!("{}: table is empty", id);
                    return Ok(ScanOutcome::Empty);
                };
                ctx.state.bookmark_mut(id).begin_scan(keys, &max);
                ctx.checkpoint().await?;
                (None, max)
            }
        }
    };

    let mut rx = ctx.source.read_table(ReadOptions {
        table: stream.table.clone(),
        columns: stream.columns.clone(),
        col_types: stream.col_types.clone(),
        order: ReadOrder::PrimaryKey {
            key_columns: keys.clone(),
            after,
            upto,
        },
        batch_size: ctx.config.batch_size,
    });

    let mut finished = false;
    while let Some(batch) = rx.recv().await {
        let batch = batch?;
        let is_last = batch.is_last;

        if let Some(last) = batch.rows.last() {
            let last_key = key_of(last, keys);
            let rows = batch.len();
            for row in batch.rows {
                ctx.emitter.record(stream, row, Some(version))?;
            }
            ctx.state.bookmark_mut(id).set_last_pk(keys, &last_key);
            ctx.checkpoint().await?;
            debug!("{}: emitted {} rows up to {:?}", id, rows, last_key);
            ctx.check_cancelled()?;
        }

        if is_last {
            finished = true;
            break;
        }
    }

    if !finished {
        return Err(TapError::stream(id, "table read ended before its final batch"));
    }

    ctx.state.bookmark_mut(id).clear_scan();
    Ok(ScanOutcome::Complete)
}
