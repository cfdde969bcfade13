//! Shared fixtures: an in-memory source with a change feed, an in-memory
//! state store and catalog helpers.

#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mssql_tap::catalog::Catalog;
use mssql_tap::core::{
    compare_json, compare_keys, key_of, Batch, ChangeOperation, ChangeReadOptions, ChangeRow,
    Column, ReadOptions, ReadOrder, Record, SourceReader, Table, TableRef,
};
use mssql_tap::emit::{MemorySink, Message, MessageSink, RecordEmitter};
use mssql_tap::error::{Result, TapError};
use mssql_tap::state::{State, StateStore};
use mssql_tap::{Config, Orchestrator, SyncResult};
use tokio_util::sync::CancellationToken;

pub const DATABASE: &str = "test_db";

struct MemTable {
    table: Table,
    rows: Vec<Record>,
    change_tracking: bool,
    changes: Vec<ChangeRow>,
}

#[derive(Default)]
struct Inner {
    tables: Vec<MemTable>,
    /// Database change tracking version; `None` while disabled.
    ct_version: Option<i64>,
    min_valid: Option<i64>,
    fail_after_batches: Option<usize>,
    cancel_on_read: Option<CancellationToken>,
}

/// In-memory source. Mutations through [`MemorySource::upsert`] and
/// [`MemorySource::delete`] are recorded in the change feed of tables
/// with change tracking enabled.
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

pub fn row(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn int_table(name: &str, columns: &[&str], primary_key: &[&str]) -> Table {
    Table {
        location: TableRef::new(DATABASE, "dbo", name),
        is_view: false,
        columns: columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut col = Column::new(*c, "int");
                col.is_nullable = !primary_key.contains(c);
                col.ordinal_pos = i as i32 + 1;
                col
            })
            .collect(),
        primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
        row_count: None,
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, table: Table, rows: Vec<Record>, change_tracking: bool) {
        let mut inner = self.inner.lock().unwrap();
        if change_tracking && inner.ct_version.is_none() {
            inner.ct_version = Some(0);
        }
        inner.tables.push(MemTable {
            table,
            rows,
            change_tracking,
            changes: Vec::new(),
        });
    }

    /// Make table reads fail after this many batches were delivered.
    pub fn fail_after_batches(&self, batches: Option<usize>) {
        self.inner.lock().unwrap().fail_after_batches = batches;
    }

    /// Cancel `token` just before the next table read delivers its first
    /// batch. The scan sees the cancellation after that batch.
    pub fn cancel_on_next_read(&self, token: CancellationToken) {
        self.inner.lock().unwrap().cancel_on_read = Some(token);
    }

    pub fn set_change_version(&self, version: Option<i64>) {
        self.inner.lock().unwrap().ct_version = version;
    }

    pub fn set_min_valid_version(&self, version: Option<i64>) {
        self.inner.lock().unwrap().min_valid = version;
    }

    pub fn change_version(&self) -> Option<i64> {
        self.inner.lock().unwrap().ct_version
    }

    pub fn upsert(&self, table: &str, record: Record) {
        let mut inner = self.inner.lock().unwrap();
        let version = next_version(&mut inner);
        let t = find_mut(&mut inner, table);
        let keys = t.table.primary_key.clone();
        let key = key_of(&record, &keys);
        let operation = match t.rows.iter_mut().find(|r| key_of(r, &keys) == key) {
            Some(existing) => {
                *existing = record;
                ChangeOperation::Update
            }
            None => {
                t.rows.push(record);
                ChangeOperation::Insert
            }
        };
        if t.change_tracking {
            t.changes.push(change(version, operation, key));
        }
    }

    pub fn delete(&self, table: &str, key: Vec<Value>) {
        let mut inner = self.inner.lock().unwrap();
        let version = next_version(&mut inner);
        let t = find_mut(&mut inner, table);
        let keys = t.table.primary_key.clone();
        t.rows.retain(|r| key_of(r, &keys) != key);
        if t.change_tracking {
            t.changes.push(change(version, ChangeOperation::Delete, key));
        }
    }

    fn with_table<T>(&self, table: &TableRef, f: impl FnOnce(&MemTable) -> T) -> Option<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .iter()
            .find(|t| t.table.location == *table)
            .map(f)
    }
}

fn next_version(inner: &mut Inner) -> i64 {
    let next = inner.ct_version.unwrap_or(0) + 1;
    if inner.ct_version.is_some() {
        inner.ct_version = Some(next);
    }
    next
}

fn find_mut<'a>(inner: &'a mut Inner, table: &str) -> &'a mut MemTable {
    inner
        .tables
        .iter_mut()
        .find(|t| t.table.location.table == table)
        .unwrap()
}

fn change(version: i64, operation: ChangeOperation, key: Vec<Value>) -> ChangeRow {
    ChangeRow {
        version,
        operation,
        commit_time: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
        key,
        data: None,
    }
}

fn project(row: &Record, columns: &[String]) -> Record {
    columns
        .iter()
        .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
        .collect()
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn discover(&self, _filter: &mssql_tap::SyncConfig) -> Result<Vec<Table>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tables.iter().map(|t| t.table.clone()).collect())
    }

    async fn max_key_values(
        &self,
        table: &TableRef,
        key_columns: &[String],
        _key_types: &[String],
    ) -> Result<Option<Vec<Value>>> {
        let max = self.with_table(table, |t| {
            t.rows
                .iter()
                .map(|r| key_of(r, key_columns))
                .max_by(|a, b| compare_keys(a, b).unwrap_or(Ordering::Equal))
        });
        Ok(max.flatten())
    }

    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(16);
        let (mut rows, fail_after, cancel) = {
            let mut inner = self.inner.lock().unwrap();
            let cancel = inner.cancel_on_read.take();
            let rows = inner
                .tables
                .iter()
                .find(|t| t.table.location == opts.table)
                .map(|t| t.rows.clone())
                .unwrap_or_default();
            (rows, inner.fail_after_batches, cancel)
        };

        match &opts.order {
            ReadOrder::PrimaryKey {
                key_columns,
                after,
                upto,
            } => {
                rows.retain(|r| {
                    let key = key_of(r, key_columns);
                    let above = after.as_ref().map_or(true, |a| {
                        compare_keys(&key, a) == Some(Ordering::Greater)
                    });
                    above && compare_keys(&key, upto) != Some(Ordering::Greater)
                });
                rows.sort_by(|a, b| {
                    compare_keys(&key_of(a, key_columns), &key_of(b, key_columns))
                        .unwrap_or(Ordering::Equal)
                });
            }
            ReadOrder::ReplicationKey { column, from } => {
                if let Some(from) = from {
                    rows.retain(|r| {
                        let value = r.get(column).cloned().unwrap_or(Value::Null);
                        !value.is_null()
                            && compare_json(&value, from) != Some(Ordering::Less)
                    });
                }
                rows.sort_by(|a, b| {
                    let a = a.get(column).cloned().unwrap_or(Value::Null);
                    let b = b.get(column).cloned().unwrap_or(Value::Null);
                    compare_json(&a, &b).unwrap_or(Ordering::Equal)
                });
            }
            ReadOrder::Unordered => {}
        }

        let rows: Vec<Record> = rows.iter().map(|r| project(r, &opts.columns)).collect();
        let batch_size = opts.batch_size.max(1);

        tokio::spawn(async move {
            if let Some(token) = cancel {
                token.cancel();
            }
            let chunks: Vec<Vec<Record>> = rows.chunks(batch_size).map(<[Record]>::to_vec).collect();
            if chunks.is_empty() {
                let _ = tx.send(Ok(Batch::empty_final())).await;
                return;
            }
            let count = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                if fail_after == Some(i) {
                    let _ = tx
                        .send(Err(TapError::stream("memory", "injected read failure")))
                        .await;
                    return;
                }
                let mut batch = Batch::new(chunk);
                if i + 1 == count {
                    batch = batch.mark_final();
                }
                if tx.send(Ok(batch)).await.is_err() {
                    return;
                }
            }
        });

        rx
    }

    async fn change_tracking_enabled(&self, table: &TableRef) -> Result<bool> {
        let database_enabled = self.inner.lock().unwrap().ct_version.is_some();
        let table_enabled = self.with_table(table, |t| t.change_tracking);
        Ok(database_enabled && table_enabled.unwrap_or(false))
    }

    async fn current_change_version(&self, _database: &str) -> Result<Option<i64>> {
        Ok(self.inner.lock().unwrap().ct_version)
    }

    async fn min_valid_change_version(&self, _table: &TableRef) -> Result<Option<i64>> {
        Ok(self.inner.lock().unwrap().min_valid)
    }

    async fn read_changes(&self, opts: ChangeReadOptions) -> Result<Vec<ChangeRow>> {
        let changes = self.with_table(&opts.table, |t| {
            t.changes
                .iter()
                .filter(|c| c.version > opts.since && c.version <= opts.upto)
                .map(|c| {
                    let image = t
                        .rows
                        .iter()
                        .find(|r| key_of(r, &opts.key_columns) == c.key)
                        .map(|r| project(r, &opts.columns));
                    ChangeRow {
                        data: if c.operation == ChangeOperation::Delete {
                            None
                        } else {
                            image
                        },
                        ..c.clone()
                    }
                })
                .collect::<Vec<_>>()
        });
        Ok(changes.unwrap_or_default())
    }

    async fn test_connection(&self) -> Result<()> {
        Ok(())
    }

    fn db_type(&self) -> &str {
        "memory"
    }

    async fn close(&self) {}
}

/// State store keeping the last saved document in memory.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<Option<State>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<State>> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save(&self, state: &State) -> Result<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

pub fn config(batch_size: usize) -> Config {
    let mut config = Config::from_yaml("source:\n  host: localhost\n  user: sa\n").unwrap();
    config.sync.batch_size = batch_size;
    config
}

pub fn stream_id(table: &str) -> String {
    format!("{}-dbo-{}", DATABASE, table)
}

/// Mark a catalog entry selected with the given replication method.
pub fn select(catalog: &mut Catalog, table: &str, method: &str, replication_key: Option<&str>) {
    let id = stream_id(table);
    let entry = catalog
        .streams
        .iter_mut()
        .find(|e| e.tap_stream_id == id)
        .unwrap();
    let meta = &mut entry.metadata[0].metadata;
    meta.insert("selected".into(), json!(true));
    meta.insert("replication-method".into(), json!(method));
    if let Some(key) = replication_key {
        meta.insert("replication-key".into(), json!(key));
    }
}

/// Sink whose flush fails once more than `acknowledged` records were
/// written. Messages are still collected in `inner`.
pub struct FailingSink {
    inner: MemorySink,
    acknowledged: usize,
    records: usize,
}

impl FailingSink {
    pub fn new(inner: MemorySink, acknowledged: usize) -> Self {
        Self {
            inner,
            acknowledged,
            records: 0,
        }
    }
}

impl MessageSink for FailingSink {
    fn write(&mut self, message: &Message) -> Result<()> {
        if matches!(message, Message::Record { .. }) {
            self.records += 1;
        }
        self.inner.write(message)
    }

    fn flush(&mut self) -> Result<()> {
        if self.records > self.acknowledged {
            return Err(TapError::Io(std::io::Error::other("sink rejected flush")));
        }
        self.inner.flush()
    }
}

pub struct Harness {
    pub source: MemorySource,
    pub store: MemoryStateStore,
    pub config: Config,
}

pub struct Run {
    pub result: Result<SyncResult>,
    pub messages: Vec<Message>,
    pub sink: MemorySink,
}

impl Harness {
    pub fn new(source: MemorySource, batch_size: usize) -> Self {
        Self {
            source,
            store: MemoryStateStore::new(),
            config: config(batch_size),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::with_source(self.config.clone(), Arc::new(self.source.clone()))
            .with_state_store(Arc::new(self.store.clone()))
    }

    pub async fn catalog(&self) -> Catalog {
        self.orchestrator().discover().await.unwrap()
    }

    /// Sync starting from whatever the store last saved.
    pub async fn sync(&self, catalog: &Catalog) -> Run {
        self.sync_with(catalog, self.store.state(), CancellationToken::new())
            .await
    }

    pub async fn sync_with(&self, catalog: &Catalog, state: State, cancel: CancellationToken) -> Run {
        let sink = MemorySink::new();
        self.run(catalog, state, cancel, sink.clone(), Box::new(sink))
            .await
    }

    /// Sync from the stored state into a sink that stops acknowledging
    /// after `acknowledged` records.
    pub async fn sync_failing_flush(&self, catalog: &Catalog, acknowledged: usize) -> Run {
        let sink = MemorySink::new();
        let failing = FailingSink::new(sink.clone(), acknowledged);
        self.run(
            catalog,
            self.store.state(),
            CancellationToken::new(),
            sink,
            Box::new(failing),
        )
        .await
    }

    async fn run(
        &self,
        catalog: &Catalog,
        state: State,
        cancel: CancellationToken,
        sink: MemorySink,
        target: Box<dyn MessageSink>,
    ) -> Run {
        let mut emitter = RecordEmitter::new(target);
        let result = self
            .orchestrator()
            .sync(catalog, state, &mut emitter, cancel)
            .await;
        Run {
            result,
            messages: sink.messages(),
            sink,
        }
    }
}

impl Run {
    pub fn records(&self) -> Vec<&Record> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Record { record, .. } => Some(record),
                _ => None,
            })
            .collect()
    }

    pub fn record_versions(&self) -> Vec<Option<i64>> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Record { version, .. } => Some(*version),
                _ => None,
            })
            .collect()
    }

    pub fn column(&self, name: &str) -> Vec<Value> {
        self.records()
            .iter()
            .map(|r| r.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    pub fn activate_versions(&self) -> Vec<i64> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::ActivateVersion { version, .. } => Some(*version),
                _ => None,
            })
            .collect()
    }

    pub fn last_state(&self) -> Option<State> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::State { value } => Some(value.clone()),
            _ => None,
        })
    }

    /// Message kinds in order, e.g. `["SCHEMA", "STATE", "RECORD", ...]`.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.messages
            .iter()
            .map(|m| match m {
                Message::Schema { .. } => "SCHEMA",
                Message::Record { .. } => "RECORD",
                Message::ActivateVersion { .. } => "ACTIVATE_VERSION",
                Message::State { .. } => "STATE",
            })
            .collect()
    }
}

pub fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Value> {
    values.into_iter().map(|v| json!(v)).collect()
}
