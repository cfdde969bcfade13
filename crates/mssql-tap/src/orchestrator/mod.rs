//! Sync orchestrator - main workflow coordinator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, ReplicationMethod, Stream};
use crate::config::Config;
use crate::core::SourceReader;
use crate::drivers::MssqlReader;
use crate::emit::RecordEmitter;
use crate::error::{Result, TapError};
use crate::replication::{full_table, incremental, log_based, SyncContext};
use crate::state::{NoOpStateStore, State, StateStore};

/// Sync orchestrator.
pub struct Orchestrator {
    config: Config,
    source: Arc<dyn SourceReader>,
    store: Arc<dyn StateStore>,
}

/// Result of a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: String,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the sync started.
    pub started_at: DateTime<Utc>,

    /// When the sync completed.
    pub completed_at: DateTime<Utc>,

    /// Selected streams.
    pub streams_total: usize,

    /// Streams synced to completion.
    pub streams_succeeded: usize,

    /// Streams that failed.
    pub streams_failed: usize,

    /// RECORD messages emitted.
    pub records_emitted: u64,

    /// Failed stream ids with their error messages.
    pub failed_streams: Vec<(String, String)>,
}

impl Orchestrator {
    /// Connect to the configured server.
    pub async fn new(config: Config) -> Result<Self> {
        let source = MssqlReader::new(config.source.clone()).await?;
        Ok(Self::with_source(config, Arc::new(source)))
    }

    /// Build an orchestrator over an existing source.
    pub fn with_source(config: Config, source: Arc<dyn SourceReader>) -> Self {
        Self {
            config,
            source,
            store: Arc::new(NoOpStateStore::new()),
        }
    }

    /// Set where checkpoints are persisted.
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    /// Round-trip a trivial query.
    pub async fn check(&self) -> Result<()> {
        self.source.test_connection().await?;
        info!("Connection to {} source OK", self.source.db_type());
        Ok(())
    }

    /// Introspect the server and build a catalog.
    pub async fn discover(&self) -> Result<Catalog> {
        let tables = self.source.discover(&self.config.sync).await?;
        let catalog = Catalog::from_tables(&tables, &self.config.sync);
        info!("Catalog contains {} streams", catalog.streams.len());
        Ok(catalog)
    }

    /// Sync every selected stream of `catalog`, one at a time.
    ///
    /// A stream named by `state.currently_syncing` runs first so that an
    /// interrupted scan resumes before anything else. Stream failures do not
    /// stop later streams unless `continue_on_error` is off; the first
    /// failure is returned once every stream had its turn.
    pub async fn sync(
        &self,
        catalog: &Catalog,
        state: State,
        emitter: &mut RecordEmitter,
        cancel: CancellationToken,
    ) -> Result<SyncResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let records_before = emitter.records_emitted();
        let sync_config = &self.config.sync;

        info!(
            "Starting sync run {} (state backend: {})",
            run_id,
            self.store.backend_type()
        );

        let mut failures: Vec<(String, TapError)> = Vec::new();
        let mut streams: Vec<Stream> = Vec::new();
        for entry in catalog.selected() {
            match entry.resolve() {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    error!("{}: {}", entry.tap_stream_id, e);
                    failures.push((entry.tap_stream_id.clone(), e));
                }
            }
        }
        order_streams(&mut streams, state.currently_syncing.as_deref());
        let streams_total = streams.len() + failures.len();
        info!("Syncing {} selected streams", streams_total);

        let store = self.store.as_ref();
        let mut ctx = SyncContext::new(
            self.source.as_ref(),
            store,
            emitter,
            sync_config,
            &cancel,
            state,
        );
        let mut succeeded = 0;

        for stream in &streams {
            if !failures.is_empty() && !sync_config.continue_on_error {
                break;
            }
            ctx.check_cancelled()?;

            let id = stream.tap_stream_id.clone();
            info!("{}: syncing with {}", id, stream.method);
            ctx.state.currently_syncing = Some(id.clone());
            ctx.emitter.schema(stream)?;
            ctx.checkpoint().await?;

            let outcome = match stream.method {
                ReplicationMethod::FullTable => full_table::sync(&mut ctx, stream).await,
                ReplicationMethod::Incremental => incremental::sync(&mut ctx, stream).await,
                ReplicationMethod::LogBased => log_based::sync(&mut ctx, stream).await,
            };

            match outcome {
                Ok(()) => {
                    ctx.state.currently_syncing = None;
                    ctx.checkpoint().await?;
                    succeeded += 1;
                    info!("{}: done", id);
                }
                Err(TapError::Cancelled) => {
                    warn!("{}: cancelled, progress saved at the last checkpoint", id);
                    return Err(TapError::Cancelled);
                }
                Err(e) => {
                    error!("{}: {}", id, e);
                    ctx.rollback_stream(&id);
                    failures.push((id, e));
                }
            }
        }

        let records_emitted = ctx.emitter.records_emitted() - records_before;
        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        let failed_streams: Vec<(String, String)> = failures
            .iter()
            .map(|(id, e)| (id.clone(), e.one_line()))
            .collect();

        let result = SyncResult {
            run_id,
            status: if failures.is_empty() { "completed" } else { "failed" }.to_string(),
            duration_seconds: duration,
            started_at,
            completed_at,
            streams_total,
            streams_succeeded: succeeded,
            streams_failed: failures.len(),
            records_emitted,
            failed_streams,
        };

        info!(
            "Sync {}: {}/{} streams, {} records in {:.1}s",
            result.status,
            result.streams_succeeded,
            result.streams_total,
            result.records_emitted,
            result.duration_seconds
        );

        if let Some((_, e)) = failures.into_iter().next() {
            return Err(e);
        }

        Ok(result)
    }
}

/// Order streams by id, with the interrupted stream (if selected) first.
fn order_streams(streams: &mut [Stream], currently_syncing: Option<&str>) {
    streams.sort_by(|a, b| a.tap_stream_id.cmp(&b.tap_stream_id));
    if let Some(current) = currently_syncing {
        match streams.iter().position(|s| s.tap_stream_id == current) {
            Some(pos) => streams[..=pos].rotate_right(1),
            None => warn!(
                "State names {} as currently syncing but it is not selected",
                current
            ),
        }
    }
}

impl SyncResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
