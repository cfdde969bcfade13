//! Bookmark state for resumable replication.
//!
//! The [`State`] document is read once at the start of a sync and
//! overwritten at every checkpoint. Each stream owns one [`Bookmark`];
//! which fields are present depends on the stream's replication method
//! and on whether a scan is mid-flight.

pub mod backend;
pub mod file;
pub mod noop;

pub use backend::StateStore;
pub use file::FileStateStore;
pub use noop::NoOpStateStore;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Process-wide replication progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Stream in flight; `None` between streams and after a clean run.
    #[serde(default)]
    pub currently_syncing: Option<String>,

    /// Per-stream bookmarks keyed by `tap_stream_id`.
    #[serde(default)]
    pub bookmarks: BTreeMap<String, Bookmark>,
}

/// Per-stream progress marker.
///
/// Read through a plain JSON map so key values keep their exact digits;
/// buffered `flatten` deserialization cannot carry exact numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct Bookmark {
    /// Snapshot epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    /// INCREMENTAL: column the running maximum belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key_name: Option<String>,

    /// INCREMENTAL: running maximum of emitted key values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key_value: Option<Value>,

    /// LOG_BASED: change tracking version the next pass reads from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_log_version: Option<i64>,

    /// LOG_BASED: whether the baseline snapshot has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_full_table_complete: Option<bool>,

    /// Upper bound of an in-flight keyset scan, keyed by column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pk_values: Option<Map<String, Value>>,

    /// Last key acknowledged by the sink during an in-flight scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pk_fetched: Option<Map<String, Value>>,

    /// Keys written by other tools, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl State {
    /// Parse a state document. An empty document is an empty state.
    pub fn from_json(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }

    /// Load state from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Bookmark of a stream, if any.
    pub fn bookmark(&self, stream_id: &str) -> Option<&Bookmark> {
        self.bookmarks.get(stream_id)
    }

    /// Bookmark of a stream, created empty on first access.
    pub fn bookmark_mut(&mut self, stream_id: &str) -> &mut Bookmark {
        self.bookmarks.entry(stream_id.to_string()).or_default()
    }

    /// Forget a stream's INCREMENTAL position so the next sync re-scans it
    /// from the beginning. The snapshot version is kept.
    pub fn reset_replication_key(&mut self, stream_id: &str) {
        if let Some(bookmark) = self.bookmarks.get_mut(stream_id) {
            bookmark.replication_key_value = None;
        }
    }

    /// Drop every bookmark field of a stream.
    pub fn reset_stream(&mut self, stream_id: &str) {
        self.bookmarks.remove(stream_id);
    }
}

impl Bookmark {
    /// Whether a keyset scan was interrupted and can be resumed.
    pub fn scan_in_progress(&self) -> bool {
        self.max_pk_values.is_some()
    }

    /// Upper bound of the in-flight scan, in key column order.
    pub fn max_pk_tuple(&self, keys: &[String]) -> Option<Vec<Value>> {
        self.max_pk_values.as_ref().map(|m| tuple(m, keys))
    }

    /// Last acknowledged key of the in-flight scan, in key column order.
    pub fn last_pk_tuple(&self, keys: &[String]) -> Option<Vec<Value>> {
        self.last_pk_fetched.as_ref().map(|m| tuple(m, keys))
    }

    /// Start a scan window ending at `max`.
    pub fn begin_scan(&mut self, keys: &[String], max: &[Value]) {
        self.max_pk_values = Some(keyed(keys, max));
        self.last_pk_fetched = None;
    }

    /// Record the last key the sink acknowledged.
    pub fn set_last_pk(&mut self, keys: &[String], last: &[Value]) {
        self.last_pk_fetched = Some(keyed(keys, last));
    }

    /// Remove the scan cursor once its phase completes.
    pub fn clear_scan(&mut self) {
        self.max_pk_values = None;
        self.last_pk_fetched = None;
    }

    pub fn is_initial_full_table_complete(&self) -> bool {
        self.initial_full_table_complete.unwrap_or(false)
    }
}

impl TryFrom<Map<String, Value>> for Bookmark {
    type Error = serde_json::Error;

    fn try_from(mut map: Map<String, Value>) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            version: take(&mut map, "version")?,
            replication_key_name: take(&mut map, "replication_key_name")?,
            replication_key_value: take(&mut map, "replication_key_value")?,
            current_log_version: take(&mut map, "current_log_version")?,
            initial_full_table_complete: take(&mut map, "initial_full_table_complete")?,
            max_pk_values: take(&mut map, "max_pk_values")?,
            last_pk_fetched: take(&mut map, "last_pk_fetched")?,
            extra: map,
        })
    }
}

/// Remove a known field; `null` reads as absent.
fn take<T: DeserializeOwned>(
    map: &mut Map<String, Value>,
    key: &str,
) -> std::result::Result<Option<T>, serde_json::Error> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some),
    }
}

/// A fresh snapshot epoch: current time in milliseconds, strictly greater
/// than the previous epoch.
pub fn new_version(previous: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_millis();
    match previous {
        Some(prev) => now.max(prev.saturating_add(1)),
        None => now,
    }
}

fn tuple(map: &Map<String, Value>, keys: &[String]) -> Vec<Value> {
    keys.iter()
        .map(|k| map.get(k).cloned().unwrap_or(Value::Null))
        .collect()
}

fn keyed(keys: &[String], values: &[Value]) -> Map<String, Value> {
    keys.iter().cloned().zip(values.iter().cloned()).collect()
}
