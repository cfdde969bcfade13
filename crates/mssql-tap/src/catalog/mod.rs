//! Catalog document produced by discovery and edited by the operator.
//!
//! The catalog follows the Singer layout: one entry per table or view, a
//! JSON Schema for its columns and a list of breadcrumb metadata entries.
//! [`CatalogEntry::resolve`] turns a selected entry into a [`Stream`], the
//! read-only descriptor the replication modes work from.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::SyncConfig;
use crate::core::{Table, TableRef};
use crate::error::{Result, TapError};
use crate::typemap::{self, Inclusion};

/// Synthetic column carried by LOG_BASED tombstones.
pub const SDC_DELETED_AT: &str = "_sdc_deleted_at";

/// Replication algorithm selected for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMethod {
    FullTable,
    Incremental,
    LogBased,
}

impl ReplicationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMethod::FullTable => "FULL_TABLE",
            ReplicationMethod::Incremental => "INCREMENTAL",
            ReplicationMethod::LogBased => "LOG_BASED",
        }
    }
}

impl std::fmt::Display for ReplicationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

/// One table or view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tap_stream_id: String,
    pub table_name: String,
    pub stream: String,
    pub schema: Value,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

/// Metadata attached to a breadcrumb: `[]` for the stream itself,
/// `["properties", <column>]` for a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// A selected stream, resolved from its catalog entry.
#[derive(Debug, Clone)]
pub struct Stream {
    pub tap_stream_id: String,
    pub stream_name: String,
    pub table: TableRef,
    pub is_view: bool,
    pub key_properties: Vec<String>,
    pub method: ReplicationMethod,
    pub replication_key: Option<String>,
    /// Selected columns, in catalog order.
    pub columns: Vec<String>,
    /// `sql-datatype` of each selected column.
    pub col_types: Vec<String>,
    /// JSON Schema restricted to the selected columns.
    pub schema: Value,
}

impl Stream {
    /// Data type of a selected column.
    pub fn type_of(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.col_types.get(idx))
            .map(String::as_str)
    }

    /// Data types of the key columns.
    pub fn key_types(&self) -> Vec<String> {
        self.key_properties
            .iter()
            .map(|k| self.type_of(k).unwrap_or_default().to_string())
            .collect()
    }

    pub fn has_pk(&self) -> bool {
        !self.key_properties.is_empty()
    }
}

impl Catalog {
    /// Build a catalog from discovered tables.
    ///
    /// Objects whose stream id collides case-insensitively with an earlier
    /// one are skipped.
    pub fn from_tables(tables: &[Table], config: &SyncConfig) -> Self {
        let mut seen = HashSet::new();
        let mut streams = Vec::with_capacity(tables.len());

        for table in tables {
            let entry = CatalogEntry::from_table(table, config);
            if !seen.insert(entry.tap_stream_id.to_lowercase()) {
                warn!(
                    "Skipping {}: stream id {} differs only by case from an earlier object",
                    table.full_name(),
                    entry.tap_stream_id
                );
                continue;
            }
            streams.push(entry);
        }

        streams.sort_by(|a, b| a.tap_stream_id.cmp(&b.tap_stream_id));
        Self { streams }
    }

    /// Load a catalog from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| TapError::Catalog(format!("{}: {}", path.display(), e)))
    }

    /// Entries whose stream-level metadata has `selected: true`.
    pub fn selected(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.streams.iter().filter(|e| e.is_selected())
    }

    pub fn find(&self, tap_stream_id: &str) -> Option<&CatalogEntry> {
        self.streams.iter().find(|e| e.tap_stream_id == tap_stream_id)
    }
}

/// Stream id for a table: `<database>-<schema>-<table>`.
pub fn stream_id(table: &TableRef) -> String {
    format!("{}-{}-{}", table.database, table.schema, table.table)
}

impl CatalogEntry {
    fn from_table(table: &Table, config: &SyncConfig) -> Self {
        let loc = &table.location;
        let mut properties = Map::new();
        let mut metadata = Vec::with_capacity(table.columns.len() + 1);

        let mut stream_meta = Map::new();
        stream_meta.insert("table-key-properties".into(), json!(table.primary_key));
        stream_meta.insert("is-view".into(), json!(table.is_view));
        stream_meta.insert("database-name".into(), json!(loc.database));
        stream_meta.insert("schema-name".into(), json!(loc.schema));
        stream_meta.insert("selected-by-default".into(), json!(false));
        if let Some(count) = table.row_count.filter(|_| !table.is_view) {
            stream_meta.insert("row-count".into(), json!(count));
        }
        metadata.push(MetadataEntry {
            breadcrumb: Vec::new(),
            metadata: stream_meta,
        });

        for column in &table.columns {
            let mapping = typemap::map_column(column);
            let inclusion = if table.primary_key.contains(&column.name)
                && mapping.inclusion != Inclusion::Unsupported
            {
                Inclusion::Automatic
            } else {
                mapping.inclusion
            };

            let mut field_meta = Map::new();
            field_meta.insert("inclusion".into(), json!(inclusion));
            field_meta.insert(
                "selected-by-default".into(),
                json!(inclusion != Inclusion::Unsupported),
            );
            field_meta.insert("sql-datatype".into(), json!(column.data_type));
            metadata.push(MetadataEntry {
                breadcrumb: vec!["properties".into(), column.name.clone()],
                metadata: field_meta,
            });

            properties.insert(column.name.clone(), mapping.schema);
        }

        let stream = if config.stream_name_includes_schema {
            format!("{}-{}", loc.schema, loc.table)
        } else {
            loc.table.clone()
        };

        Self {
            tap_stream_id: stream_id(loc),
            table_name: loc.table.clone(),
            stream,
            schema: json!({"type": "object", "properties": properties}),
            metadata,
        }
    }

    /// Metadata for a breadcrumb, if present.
    pub fn metadata_for(&self, breadcrumb: &[&str]) -> Option<&Map<String, Value>> {
        self.metadata
            .iter()
            .find(|m| m.breadcrumb.iter().map(String::as_str).eq(breadcrumb.iter().copied()))
            .map(|m| &m.metadata)
    }

    /// Stream-level metadata.
    pub fn stream_metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata_for(&[])
    }

    fn stream_meta_value(&self, key: &str) -> Option<&Value> {
        self.stream_metadata().and_then(|m| m.get(key))
    }

    pub fn is_selected(&self) -> bool {
        self.stream_meta_value("selected")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Resolve a selected entry into a sync-ready [`Stream`].
    pub fn resolve(&self) -> Result<Stream> {
        let id = &self.tap_stream_id;
        let meta = self
            .stream_metadata()
            .ok_or_else(|| TapError::Catalog(format!("stream {} has no stream metadata", id)))?;

        let method = match meta.get("replication-method") {
            Some(v) => serde_json::from_value::<ReplicationMethod>(v.clone()).map_err(|_| {
                TapError::Catalog(format!("stream {} has unknown replication-method {}", id, v))
            })?,
            None => {
                return Err(TapError::Catalog(format!(
                    "stream {} has no replication-method",
                    id
                )))
            }
        };

        let replication_key = meta
            .get("replication-key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        if method == ReplicationMethod::Incremental && replication_key.is_none() {
            return Err(TapError::MissingReplicationKey(id.clone()));
        }

        let is_view = meta.get("is-view").and_then(Value::as_bool).unwrap_or(false);
        let key_field = if is_view {
            "view-key-properties"
        } else {
            "table-key-properties"
        };
        let key_properties: Vec<String> = meta
            .get(key_field)
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let database = meta
            .get("database-name")
            .and_then(Value::as_str)
            .ok_or_else(|| TapError::Catalog(format!("stream {} has no database-name", id)))?;
        let schema_name = meta
            .get("schema-name")
            .and_then(Value::as_str)
            .ok_or_else(|| TapError::Catalog(format!("stream {} has no schema-name", id)))?;

        let all_properties = self
            .schema
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let mut columns = Vec::new();
        let mut col_types = Vec::new();
        let mut properties = Map::new();

        for entry in &self.metadata {
            let [kind, column] = entry.breadcrumb.as_slice() else {
                continue;
            };
            if kind != "properties" {
                continue;
            }

            let field = &entry.metadata;
            let inclusion = field
                .get("inclusion")
                .and_then(|v| serde_json::from_value::<Inclusion>(v.clone()).ok())
                .unwrap_or(Inclusion::Available);
            let forced = key_properties.contains(column)
                || replication_key.as_deref() == Some(column.as_str());

            let wanted = match inclusion {
                Inclusion::Unsupported => false,
                Inclusion::Automatic => true,
                Inclusion::Available => {
                    forced
                        || field
                            .get("selected")
                            .or_else(|| field.get("selected-by-default"))
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                }
            };

            if !wanted {
                if forced {
                    return Err(TapError::Catalog(format!(
                        "stream {}: key column {} has an unsupported type",
                        id, column
                    )));
                }
                continue;
            }

            let sql_type = field
                .get("sql-datatype")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            properties.insert(
                column.clone(),
                all_properties.get(column).cloned().unwrap_or_else(|| json!({})),
            );
            columns.push(column.clone());
            col_types.push(sql_type);
        }

        for key in key_properties.iter().chain(replication_key.iter()) {
            if !columns.contains(key) {
                return Err(TapError::Catalog(format!(
                    "stream {}: key column {} is not a known field",
                    id, key
                )));
            }
        }

        if method == ReplicationMethod::LogBased {
            properties.insert(
                SDC_DELETED_AT.into(),
                json!({"type": ["null", "string"], "format": "date-time"}),
            );
        }

        Ok(Stream {
            tap_stream_id: id.clone(),
            stream_name: self.stream.clone(),
            table: TableRef::new(database, schema_name, self.table_name.clone()),
            is_view,
            key_properties,
            method,
            replication_key,
            columns,
            col_types,
            schema: json!({"type": "object", "properties": properties}),
        })
    }
}
