//! INCREMENTAL replication.
//!
//! Rows with `replication_key >= bookmark` are read in key order (NULLs
//! first) and the bookmark follows the running maximum of emitted keys.
//! A NULL bookmark value means "start from the beginning".

use std::cmp::Ordering;

use serde_json::Value;
use tracing::{debug, info};

use super::SyncContext;
use crate::catalog::Stream;
use crate::core::value::compare_json;
use crate::core::{ReadOptions, ReadOrder};
use crate::error::{Result, TapError};
use crate::state::new_version;

pub async fn sync(ctx: &mut SyncContext<'_>, stream: &Stream) -> Result<()> {
    let id = stream.tap_stream_id.as_str();
    let key = stream
        .replication_key
        .clone()
        .ok_or_else(|| TapError::MissingReplicationKey(id.to_string()))?;

    let bookmark = ctx.state.bookmark_mut(id);
    let first_sync = bookmark.version.is_none();
    let version = *bookmark.version.get_or_insert_with(|| new_version(None));

    if bookmark.replication_key_name.as_deref() != Some(key.as_str()) {
        if bookmark.replication_key_value.is_some() {
            info!(
                "{}: replication key changed to {}, starting from the beginning",
                id, key
            );
        }
        bookmark.replication_key_value = None;
        bookmark.replication_key_name = Some(key.clone());
    }
    // Cursor fields left behind by a FULL_TABLE run do not apply here
    bookmark.clear_scan();

    let from = bookmark.replication_key_value.clone();
    let start = match &from {
        Some(value) => value.to_string(),
        None => "the beginning".to_string(),
    };
    info!("{}: INCREMENTAL sync on {} from {}", id, key, start);

    if first_sync {
        ctx.emitter.activate_version(stream, version)?;
    }
    ctx.checkpoint().await?;

    let mut rx = ctx.source.read_table(ReadOptions {
        table: stream.table.clone(),
        columns: stream.columns.clone(),
        col_types: stream.col_types.clone(),
        order: ReadOrder::ReplicationKey {
            column: key.clone(),
            from: from.clone(),
        },
        batch_size: ctx.config.batch_size,
    });

    let mut running_max = from;
    let mut finished = false;
    while let Some(batch) = rx.recv().await {
        let batch = batch?;
        let is_last = batch.is_last;
        let rows = batch.len();

        for row in batch.rows {
            if let Some(value) = row.get(&key) {
                running_max = advance(running_max, value);
            }
            ctx.emitter.record(stream, row, Some(version))?;
        }

        if rows > 0 {
            ctx.state.bookmark_mut(id).replication_key_value = running_max.clone();
            ctx.checkpoint().await?;
            debug!("{}: emitted {} rows, bookmark {:?}", id, rows, running_max);
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

    ctx.emitter.activate_version(stream, version)?;
    Ok(())
}

/// Running maximum of replication key values. NULL keys never move it and
/// it never goes backward.
pub fn advance(current: Option<Value>, candidate: &Value) -> Option<Value> {
    if candidate.is_null() {
        return current;
    }
    match current {
        None => Some(candidate.clone()),
        Some(cur) if cur.is_null() => Some(candidate.clone()),
        Some(cur) => match compare_json(candidate, &cur) {
            Some(Ordering::Greater) => Some(candidate.clone()),
            _ => Some(cur),
        },
    }
}
