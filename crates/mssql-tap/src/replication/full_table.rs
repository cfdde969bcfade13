//! FULL_TABLE replication.
//!
//! `NOT_STARTED -> SCANNING -> COMPLETE`. A scan keeps its epoch across
//! interruptions; only a brand-new scan gets a new one. The leading
//! activate-version marker is emitted once per stream lifetime, the
//! closing one at the end of every completed scan.

use tracing::{info, warn};

use super::{keyset_scan, ScanOutcome, SyncContext};
use crate::catalog::Stream;
use crate::core::{ReadOptions, ReadOrder};
use crate::error::{Result, TapError};
use crate::state::new_version;

pub async fn sync(ctx: &mut SyncContext<'_>, stream: &Stream) -> Result<()> {
    let id = stream.tap_stream_id.as_str();
    let bookmark = ctx.state.bookmark(id).cloned().unwrap_or_default();

    let resuming = stream.has_pk() && bookmark.scan_in_progress() && bookmark.version.is_some();
    let version = match bookmark.version {
        Some(version) if resuming => {
            info!("{}: resuming FULL_TABLE scan (version {})", id, version);
            version
        }
        previous => {
            let version = new_version(previous);
            info!("{}: starting FULL_TABLE scan (version {})", id, version);
            let bookmark = ctx.state.bookmark_mut(id);
            bookmark.clear_scan();
            bookmark.version = Some(version);
            if previous.is_none() {
                ctx.emitter.activate_version(stream, version)?;
            }
            version
        }
    };

    if stream.has_pk() {
        if keyset_scan(ctx, stream, version).await? == ScanOutcome::Empty {
            info!("{}: table is empty", id);
        }
    } else {
        if !stream.is_view {
            warn!("{}: no primary key, scanning in one uninterruptible pass", id);
        }
        ctx.checkpoint().await?;
        single_pass(ctx, stream, version).await?;
    }

    ctx.emitter.activate_version(stream, version)?;
    ctx.state.bookmark_mut(id).version = Some(version);
    Ok(())
}

/// Stream every row once, in server order. Nothing is checkpointed until
/// the pass ends, so cancellation is not honored mid-pass.
async fn single_pass(ctx: &mut SyncContext<'_>, stream: &Stream, version: i64) -> Result<()> {
    let mut rx = ctx.source.read_table(ReadOptions {
        table: stream.table.clone(),
        columns: stream.columns.clone(),
        col_types: stream.col_types.clone(),
        order: ReadOrder::Unordered,
        batch_size: ctx.config.batch_size,
    });

    while let Some(batch) = rx.recv().await {
        let batch = batch?;
        let is_last = batch.is_last;
        for row in batch.rows {
            ctx.emitter.record(stream, row, Some(version))?;
        }
        if is_last {
            return Ok(());
        }
    }

    Err(TapError::stream(
        &stream.tap_stream_id,
        "table read ended before its final batch",
    ))
}
