//! LOG_BASED replication over SQL Server change tracking.
//!
//! Baseline: a FULL_TABLE-style keyset snapshot, with the database's
//! change tracking version captured before the first row is read. Steady
//! state: net changes since `current_log_version`, emitted as upserts or
//! tombstones, after which the bookmark advances to the version captured
//! at the start of the pass.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::changes::collapse;
use super::{keyset_scan, SyncContext};
use crate::catalog::{Stream, SDC_DELETED_AT};
use crate::core::{ChangeOperation, ChangeReadOptions, ChangeRow, Record};
use crate::error::{Result, TapError};
use crate::state::new_version;
use crate::typemap::format_utc;

pub async fn sync(ctx: &mut SyncContext<'_>, stream: &Stream) -> Result<()> {
    preflight(ctx, stream).await?;

    let id = stream.tap_stream_id.as_str();
    let baseline_done = ctx
        .state
        .bookmark(id)
        .map(|b| b.is_initial_full_table_complete())
        .unwrap_or(false);

    let opened = if baseline_done {
        false
    } else {
        baseline(ctx, stream).await?;
        true
    };

    steady_state(ctx, stream, opened).await
}

/// Fail fast on streams change tracking cannot serve.
async fn preflight(ctx: &mut SyncContext<'_>, stream: &Stream) -> Result<()> {
    let table = &stream.table.table;
    let id = &stream.tap_stream_id;

    if stream.is_view {
        return Err(TapError::ChangeTrackingOnView {
            view: table.clone(),
            stream: id.clone(),
        });
    }
    if !stream.has_pk() {
        return Err(TapError::NoPrimaryKey {
            table: table.clone(),
            stream: id.clone(),
        });
    }
    if !ctx.source.change_tracking_enabled(&stream.table).await? {
        return Err(TapError::ChangeTrackingNotEnabled {
            table: table.clone(),
            stream: id.clone(),
        });
    }
    Ok(())
}

fn not_enabled(stream: &Stream) -> TapError {
    TapError::ChangeTrackingNotEnabled {
        table: stream.table.table.clone(),
        stream: stream.tap_stream_id.clone(),
    }
}

/// Initial snapshot. Ends with the marker that closes the snapshot and
/// opens the steady state.
async fn baseline(ctx: &mut SyncContext<'_>, stream: &Stream) -> Result<()> {
    let id = stream.tap_stream_id.as_str();
    let bookmark = ctx.state.bookmark(id).cloned().unwrap_or_default();

    let resuming = bookmark.scan_in_progress()
        && bookmark.version.is_some()
        && bookmark.current_log_version.is_some();

    let version = match bookmark.version {
        Some(version) if resuming => {
            info!("{}: resuming LOG_BASED baseline (version {})", id, version);
            version
        }
        previous => {
            // Captured before any row is read: changes committed while the
            // snapshot runs are replayed by the first steady-state pass.
            let log_version = ctx
                .source
                .current_change_version(&stream.table.database)
                .await?
                .ok_or_else(|| not_enabled(stream))?;
            let version = new_version(previous);
            info!(
                "{}: starting LOG_BASED baseline (version {}, change tracking version {})",
                id, version, log_version
            );

            let bookmark = ctx.state.bookmark_mut(id);
            bookmark.clear_scan();
            bookmark.version = Some(version);
            bookmark.current_log_version = Some(log_version);
            bookmark.initial_full_table_complete = Some(false);
            if previous.is_none() {
                ctx.emitter.activate_version(stream, version)?;
            }
            ctx.checkpoint().await?;
            version
        }
    };

    keyset_scan(ctx, stream, version).await?;

    ctx.state.bookmark_mut(id).initial_full_table_complete = Some(true);
    ctx.emitter.activate_version(stream, version)?;
    ctx.checkpoint().await?;
    info!("{}: baseline complete", id);
    Ok(())
}

/// One pass over the change feed. `opened` is set when the baseline that
/// just finished already emitted the opening marker.
async fn steady_state(ctx: &mut SyncContext<'_>, stream: &Stream, opened: bool) -> Result<()> {
    let id = stream.tap_stream_id.as_str();
    let bookmark = ctx.state.bookmark(id).cloned().unwrap_or_default();

    let Some(since) = bookmark.current_log_version else {
        return Err(TapError::invalid_state(
            id,
            "current_log_version is null but the initial full table sync is complete; \
             refusing to re-snapshot silently",
        ));
    };

    if let Some(min_valid) = ctx.source.min_valid_change_version(&stream.table).await? {
        if min_valid > since {
            return Err(TapError::ChangeTrackingExpired {
                stream: id.to_string(),
                min_valid,
                bookmarked: since,
            });
        }
    }

    let captured = ctx
        .source
        .current_change_version(&stream.table.database)
        .await?
        .ok_or_else(|| not_enabled(stream))?;

    let version = match bookmark.version {
        Some(version) => version,
        None => {
            let version = new_version(None);
            ctx.state.bookmark_mut(id).version = Some(version);
            version
        }
    };

    if !opened {
        ctx.emitter.activate_version(stream, version)?;
    }

    if captured > since {
        let changes = ctx
            .source
            .read_changes(ChangeReadOptions {
                table: stream.table.clone(),
                key_columns: stream.key_properties.clone(),
                key_types: stream.key_types(),
                columns: stream.columns.clone(),
                col_types: stream.col_types.clone(),
                since,
                upto: captured,
            })
            .await?;
        let raw = changes.len();
        let net = collapse(changes);
        info!(
            "{}: {} changes ({} net) between versions {} and {}",
            id,
            raw,
            net.len(),
            since,
            captured
        );

        for change in net {
            let record = to_record(stream, change);
            ctx.emitter.record(stream, record, Some(version))?;
        }
    } else {
        debug!("{}: no new change tracking versions since {}", id, since);
    }

    ctx.state.bookmark_mut(id).current_log_version = Some(since.max(captured));
    ctx.emitter.activate_version(stream, version)?;
    Ok(())
}

/// Upsert image or tombstone for a net change.
pub fn to_record(stream: &Stream, change: ChangeRow) -> Record {
    match (change.operation, change.data) {
        (ChangeOperation::Delete, _) | (_, None) => {
            let mut record: Record = stream
                .key_properties
                .iter()
                .cloned()
                .zip(change.key)
                .collect();
            let deleted_at = change.commit_time.unwrap_or_else(Utc::now);
            record.insert(SDC_DELETED_AT.into(), Value::String(format_utc(&deleted_at)));
            record
        }
        (_, Some(data)) => data,
    }
}
