//! MSSQL source reader implementation.
//!
//! Implements the `SourceReader` trait over Tiberius with bb8 connection
//! pooling: discovery through three-part INFORMATION_SCHEMA names, keyset
//! pages for primary-key scans, streamed result sets for replication-key
//! scans and the CHANGETABLE feed for change tracking.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bb8::{Pool, PooledConnection};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use serde_json::Value;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dialect::MssqlDialect;
use crate::config::{SourceConfig, SyncConfig};
use crate::core::traits::{
    ChangeOperation, ChangeReadOptions, ChangeRow, ReadOptions, ReadOrder, SourceReader,
};
use crate::core::value::{key_of, Batch, Record, SqlValue};
use crate::core::{Column, Table, TableRef};
use crate::error::{Result, TapError};
use crate::typemap::to_json;

/// Connection acquisition timeout from pool (30 seconds).
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection timeout (5 minutes).
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Maximum connection lifetime (30 minutes).
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// TCP keepalive interval (30 seconds).
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Batches buffered between the reading task and the engine.
const READ_CHANNEL_CAPACITY: usize = 4;

type MssqlClient = Client<Compat<TcpStream>>;

/// Connection manager for bb8 pool with Tiberius.
#[derive(Clone)]
pub struct TiberiusConnectionManager {
    config: SourceConfig,
}

impl TiberiusConnectionManager {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn build_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.database);
        config.application_name(&self.config.application_name);
        config.authentication(AuthMethod::sql_server(
            &self.config.user,
            &self.config.password,
        ));

        // Encryption settings
        if self.config.encrypt {
            if self.config.trust_server_cert {
                config.trust_cert();
            }
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

fn io_error(e: std::io::Error, context: &str) -> tiberius::error::Error {
    tiberius::error::Error::Io {
        kind: e.kind(),
        message: format!("{}: {}", context, e),
    }
}

#[async_trait]
impl bb8::ManageConnection for TiberiusConnectionManager {
    type Connection = MssqlClient;
    type Error = tiberius::error::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| io_error(e, "connecting"))?;
        tcp.set_nodelay(true).ok();

        // Enable TCP keepalives: idle cursors between batches must survive
        // NAT and firewall timeouts.
        let std_tcp = tcp
            .into_std()
            .map_err(|e| io_error(e, "detaching socket"))?;
        let socket = socket2::Socket::from(std_tcp);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE_INTERVAL)
            .with_interval(TCP_KEEPALIVE_INTERVAL);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            warn!("Failed to set TCP keepalive on MSSQL connection: {}", e);
        }

        let std_tcp: std::net::TcpStream = socket.into();
        std_tcp.set_nonblocking(true).ok();
        let tcp = TcpStream::from_std(std_tcp).map_err(|e| io_error(e, "converting socket"))?;

        Client::connect(config, tcp.compat_write()).await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// MSSQL source reader.
pub struct MssqlReader {
    pool: Pool<TiberiusConnectionManager>,
    dialect: MssqlDialect,
}

impl MssqlReader {
    /// Create a reader and verify the connection.
    pub async fn new(config: SourceConfig) -> Result<Self> {
        let max_size = config.max_connections;
        let manager = TiberiusConnectionManager::new(config.clone());
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .idle_timeout(Some(POOL_IDLE_TIMEOUT))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .test_on_check_out(true)
            .build(manager)
            .await
            .map_err(|e| TapError::pool(e, "creating MSSQL connection pool"))?;

        let reader = Self {
            pool,
            dialect: MssqlDialect::new(),
        };
        reader.test_connection().await?;

        info!(
            "Connected to MSSQL: {}:{}/{} (pool_size={})",
            config.host, config.port, config.database, max_size
        );

        Ok(reader)
    }

    /// Get a pooled connection.
    async fn get_client(&self) -> Result<PooledConnection<'_, TiberiusConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| TapError::pool(e, "getting MSSQL connection from pool"))
    }

    async fn query_all(&self, sql: &str) -> Result<Vec<Row>> {
        let mut client = self.get_client().await?;
        debug!("Query: {}", sql);
        let rows = client.simple_query(sql).await?.into_first_result().await?;
        Ok(rows)
    }

    async fn query_scalar_i64(&self, sql: &str) -> Result<Option<i64>> {
        let mut client = self.get_client().await?;
        debug!("Query: {}", sql);
        let row = client.simple_query(sql).await?.into_row().await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>(0)?),
            None => Ok(None),
        }
    }

    async fn list_databases(&self, filter: &SyncConfig) -> Result<Vec<String>> {
        let rows = self.query_all(&self.dialect.build_databases_query()).await?;
        let mut databases = Vec::new();
        for row in rows {
            if let Some(name) = row.try_get::<&str, _>(0)? {
                if filter.includes_database(name) {
                    databases.push(name.to_string());
                }
            }
        }
        Ok(databases)
    }

    /// Discover tables and views of one database.
    async fn discover_database(&self, database: &str, filter: &SyncConfig) -> Result<Vec<Table>> {
        let mut tables: Vec<Table> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();

        for row in self.query_all(&self.dialect.build_objects_query(database)).await? {
            let schema = text(&row, 0)?;
            if !filter.includes_schema(&schema) {
                continue;
            }
            let name = text(&row, 1)?;
            let is_view = text(&row, 2)?.eq_ignore_ascii_case("VIEW");
            index.insert((schema.clone(), name.clone()), tables.len());
            tables.push(Table {
                location: TableRef::new(database, schema, name),
                is_view,
                columns: Vec::new(),
                primary_key: Vec::new(),
                row_count: None,
            });
        }

        for row in self.query_all(&self.dialect.build_columns_query(database)).await? {
            let key = (text(&row, 0)?, text(&row, 1)?);
            let Some(&idx) = index.get(&key) else {
                continue;
            };
            tables[idx].columns.push(Column {
                name: text(&row, 2)?,
                data_type: text(&row, 3)?,
                max_length: row.try_get::<i32, _>(4)?.unwrap_or(0),
                precision: row.try_get::<i32, _>(5)?.unwrap_or(0),
                scale: row.try_get::<i32, _>(6)?.unwrap_or(0),
                is_nullable: row.try_get::<i32, _>(7)?.unwrap_or(1) == 1,
                ordinal_pos: row.try_get::<i32, _>(8)?.unwrap_or(0),
            });
        }

        for row in self
            .query_all(&self.dialect.build_primary_keys_query(database))
            .await?
        {
            let key = (text(&row, 0)?, text(&row, 1)?);
            if let Some(&idx) = index.get(&key) {
                tables[idx].primary_key.push(text(&row, 2)?);
            }
        }

        for row in self
            .query_all(&self.dialect.build_row_counts_query(database))
            .await?
        {
            let key = (text(&row, 0)?, text(&row, 1)?);
            if let Some(&idx) = index.get(&key) {
                tables[idx].row_count = row.try_get::<i64, _>(2)?;
            }
        }

        debug!("Discovered {} objects in {}", tables.len(), database);
        Ok(tables)
    }
}

#[async_trait]
impl SourceReader for MssqlReader {
    async fn discover(&self, filter: &SyncConfig) -> Result<Vec<Table>> {
        let databases = self.list_databases(filter).await?;
        if databases.is_empty() {
            warn!("No online user databases matched the discovery filter");
        }

        let mut tables = Vec::new();
        for database in &databases {
            let found = self
                .discover_database(database, filter)
                .await
                .map_err(|e| TapError::Discovery(format!("{}: {}", database, e)))?;
            tables.extend(found);
        }

        info!(
            "Discovered {} tables and views in {} databases",
            tables.len(),
            databases.len()
        );
        Ok(tables)
    }

    async fn max_key_values(
        &self,
        table: &TableRef,
        key_columns: &[String],
        key_types: &[String],
    ) -> Result<Option<Vec<Value>>> {
        let sql = self
            .dialect
            .build_max_key_query(table, key_columns, key_types);
        let rows = self.query_all(&sql).await?;
        match rows.first() {
            Some(row) => {
                let mut values = Vec::with_capacity(key_types.len());
                for (idx, data_type) in key_types.iter().enumerate() {
                    values.push(to_json(convert_row_value(row, idx, data_type)?));
                }
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
        let pool = self.pool.clone();
        let dialect = self.dialect.clone();

        tokio::spawn(async move {
            if let Err(e) = read_table_internal(pool, dialect, opts, tx.clone()).await {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }

    async fn change_tracking_enabled(&self, table: &TableRef) -> Result<bool> {
        let sql = self.dialect.build_change_tracking_enabled_query(table);
        let mut client = self.get_client().await?;
        let row = client.simple_query(&sql).await?.into_row().await?;
        let count = match row {
            Some(row) => row.try_get::<i32, _>(0)?.unwrap_or(0),
            None => 0,
        };
        Ok(count > 0)
    }

    async fn current_change_version(&self, database: &str) -> Result<Option<i64>> {
        self.query_scalar_i64(&self.dialect.build_current_version_query(database))
            .await
    }

    async fn min_valid_change_version(&self, table: &TableRef) -> Result<Option<i64>> {
        self.query_scalar_i64(&self.dialect.build_min_valid_version_query(table))
            .await
    }

    async fn read_changes(&self, opts: ChangeReadOptions) -> Result<Vec<ChangeRow>> {
        let sql = self.dialect.build_changes_query(
            &opts.table,
            &opts.key_columns,
            &opts.key_types,
            &opts.columns,
            &opts.col_types,
            opts.since,
            opts.upto,
        );
        let rows = self.query_all(&sql).await?;

        let key_offset = 4;
        let data_offset = key_offset + opts.key_columns.len();
        let mut changes = Vec::with_capacity(rows.len());

        for row in rows {
            let version = row.try_get::<i64, _>(0)?.ok_or_else(|| {
                TapError::stream(opts.table.full_name(), "change row without SYS_CHANGE_VERSION")
            })?;
            let code = row.try_get::<&str, _>(1)?.unwrap_or_default();
            let operation = ChangeOperation::from_code(code).ok_or_else(|| {
                TapError::stream(
                    opts.table.full_name(),
                    format!("unknown SYS_CHANGE_OPERATION '{}'", code),
                )
            })?;
            let commit_time = row
                .try_get::<NaiveDateTime, _>(2)?
                .map(|dt| dt.and_utc());
            let exists = row.try_get::<i32, _>(3)?.unwrap_or(0) == 1;

            let mut key = Vec::with_capacity(opts.key_columns.len());
            for (i, data_type) in opts.key_types.iter().enumerate() {
                key.push(to_json(convert_row_value(&row, key_offset + i, data_type)?));
            }

            let data = if exists {
                Some(decode_record(
                    &row,
                    &opts.columns,
                    &opts.col_types,
                    data_offset,
                )?)
            } else {
                None
            };

            changes.push(ChangeRow {
                version,
                operation,
                commit_time,
                key,
                data,
            });
        }

        debug!(
            "Read {} changes for {} in ({}, {}]",
            changes.len(),
            opts.table.full_name(),
            opts.since,
            opts.upto
        );
        Ok(changes)
    }

    async fn test_connection(&self) -> Result<()> {
        let mut client = self.get_client().await?;
        client.simple_query("SELECT 1").await?.into_row().await?;
        Ok(())
    }

    fn db_type(&self) -> &str {
        "mssql"
    }

    async fn close(&self) {
        // bb8 pool handles cleanup automatically
    }
}

/// Read table rows and send batches through the channel.
async fn read_table_internal(
    pool: Pool<TiberiusConnectionManager>,
    dialect: MssqlDialect,
    opts: ReadOptions,
    tx: mpsc::Sender<Result<Batch>>,
) -> Result<()> {
    let mut client = pool
        .get()
        .await
        .map_err(|e| TapError::pool(e, "getting connection for read_table"))?;
    let batch_size = opts.batch_size.max(1);

    match &opts.order {
        ReadOrder::PrimaryKey {
            key_columns,
            after,
            upto,
        } => {
            let key_types: Vec<String> = key_columns
                .iter()
                .map(|k| opts.type_of(k).unwrap_or_default().to_string())
                .collect();
            let mut after = after.clone();

            // Keyset pagination: one round-trip per batch
            loop {
                let sql = dialect.build_keyset_query(
                    &opts.table,
                    &opts.columns,
                    &opts.col_types,
                    key_columns,
                    &key_types,
                    after.as_deref(),
                    upto,
                    batch_size,
                );
                debug!("Keyset page: {}", sql);
                let rows = client.simple_query(&sql).await?.into_first_result().await?;

                if rows.is_empty() {
                    let _ = tx.send(Ok(Batch::empty_final())).await;
                    break;
                }

                let mut records = Vec::with_capacity(rows.len());
                for row in &rows {
                    records.push(decode_record(row, &opts.columns, &opts.col_types, 0)?);
                }
                after = records.last().map(|r| key_of(r, key_columns));

                let is_last = records.len() < batch_size;
                let mut batch = Batch::new(records);
                if is_last {
                    batch = batch.mark_final();
                }
                if tx.send(Ok(batch)).await.is_err() {
                    break; // Channel closed
                }
                if is_last {
                    break;
                }
            }
        }

        order => {
            let sql = match order {
                ReadOrder::ReplicationKey { column, from } => dialect.build_replication_key_query(
                    &opts.table,
                    &opts.columns,
                    &opts.col_types,
                    column,
                    opts.type_of(column).unwrap_or_default(),
                    from.as_ref(),
                ),
                _ => dialect.build_full_scan_query(&opts.table, &opts.columns, &opts.col_types),
            };
            debug!("Streaming query: {}", sql);

            // One ordered result set, chunked into batches as rows arrive
            let mut rows = client.simple_query(&sql).await?.into_row_stream();
            let mut records = Vec::with_capacity(batch_size);
            while let Some(row) = rows.try_next().await? {
                records.push(decode_record(&row, &opts.columns, &opts.col_types, 0)?);
                if records.len() >= batch_size {
                    let full = std::mem::replace(&mut records, Vec::with_capacity(batch_size));
                    if tx.send(Ok(Batch::new(full))).await.is_err() {
                        return Ok(()); // Channel closed
                    }
                }
            }
            let _ = tx.send(Ok(Batch::new(records).mark_final())).await;
        }
    }

    Ok(())
}

fn text(row: &Row, idx: usize) -> Result<String> {
    Ok(row.try_get::<&str, _>(idx)?.unwrap_or_default().to_string())
}

/// Decode `columns` starting at result column `offset` into a record.
fn decode_record(
    row: &Row,
    columns: &[String],
    col_types: &[String],
    offset: usize,
) -> Result<Record> {
    let mut record = Record::new();
    for (i, (name, data_type)) in columns.iter().zip(col_types.iter()).enumerate() {
        let value = convert_row_value(row, offset + i, data_type)?;
        record.insert(name.clone(), to_json(value));
    }
    Ok(record)
}

/// Convert a row value to SqlValue based on the column type.
fn convert_row_value(row: &Row, idx: usize, data_type: &str) -> Result<SqlValue<'static>> {
    let dt = data_type.to_lowercase();

    let value = match dt.as_str() {
        "bit" => row.try_get::<bool, _>(idx)?.map(SqlValue::Bool),
        "tinyint" => row
            .try_get::<u8, _>(idx)?
            .map(|v| SqlValue::I16(v as i16)),
        "smallint" => row.try_get::<i16, _>(idx)?.map(SqlValue::I16),
        "int" => row.try_get::<i32, _>(idx)?.map(SqlValue::I32),
        "bigint" => row.try_get::<i64, _>(idx)?.map(SqlValue::I64),
        "real" => row.try_get::<f32, _>(idx)?.map(SqlValue::F32),
        "float" => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
        "uniqueidentifier" => row.try_get::<Uuid, _>(idx)?.map(SqlValue::Uuid),
        "datetime" | "datetime2" | "smalldatetime" => {
            row.try_get::<NaiveDateTime, _>(idx)?.map(SqlValue::DateTime)
        }
        "datetimeoffset" => row
            .try_get::<DateTime<FixedOffset>, _>(idx)?
            .map(SqlValue::DateTimeOffset),
        "date" => row.try_get::<NaiveDate, _>(idx)?.map(SqlValue::Date),
        "time" => row.try_get::<NaiveTime, _>(idx)?.map(SqlValue::Time),
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => row
            .try_get::<&[u8], _>(idx)?
            .map(|v| SqlValue::Bytes(Cow::Owned(v.to_vec()))),
        "decimal" | "numeric" | "money" | "smallmoney" => {
            // money arrives as a float on the wire
            match row.try_get::<rust_decimal::Decimal, _>(idx) {
                Ok(v) => v.map(SqlValue::Decimal),
                Err(_) => row.try_get::<f64, _>(idx)?.map(SqlValue::F64),
            }
        }
        _ => row
            .try_get::<&str, _>(idx)?
            .map(|s| SqlValue::Text(Cow::Owned(s.to_string()))),
    };

    Ok(value.unwrap_or(SqlValue::Null))
}
