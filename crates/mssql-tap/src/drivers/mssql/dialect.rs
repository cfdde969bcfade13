//! MSSQL SQL builders.
//!
//! Provides identifier quoting, typed literals rebuilt from bookmark JSON,
//! keyset predicates and the discovery and change tracking queries.
//! Values that reach SQL text always go through [`MssqlDialect::literal`].

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;

use crate::core::TableRef;

/// Databases never offered by discovery.
pub const SYSTEM_DATABASES: &[&str] = &["master", "tempdb", "model", "msdb", "rdsadmin"];

/// Direction of a keyset bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBound {
    /// `key > value` (resume point, exclusive).
    After,
    /// `key <= value` (snapshot window end, inclusive).
    UpTo,
}

/// Microsoft SQL Server dialect.
#[derive(Debug, Clone, Default)]
pub struct MssqlDialect;

impl MssqlDialect {
    pub fn new() -> Self {
        Self
    }

    pub fn quote_ident(&self, name: &str) -> String {
        // Square brackets; a closing bracket inside the name is doubled
        format!("[{}]", name.replace(']', "]]"))
    }

    /// `[schema].[table]`
    pub fn two_part_name(&self, table: &TableRef) -> String {
        format!(
            "{}.{}",
            self.quote_ident(&table.schema),
            self.quote_ident(&table.table)
        )
    }

    /// `[database].[schema].[table]`
    pub fn three_part_name(&self, table: &TableRef) -> String {
        format!(
            "{}.{}.{}",
            self.quote_ident(&table.database),
            self.quote_ident(&table.schema),
            self.quote_ident(&table.table)
        )
    }

    /// Quote a string as an N'' literal.
    pub fn nstring(&self, s: &str) -> String {
        format!("N'{}'", s.replace('\'', "''"))
    }

    /// Run `sql` inside `database` so that change tracking functions and
    /// object ids resolve against it.
    pub fn in_database(&self, database: &str, sql: &str) -> String {
        format!(
            "EXEC {}.sys.sp_executesql {}",
            self.quote_ident(database),
            self.nstring(sql)
        )
    }

    /// Select-list expression for a column. Types the driver cannot decode
    /// directly are cast to text.
    pub fn select_expr(&self, prefix: Option<&str>, column: &str, data_type: &str) -> String {
        let quoted = match prefix {
            Some(p) => format!("{}.{}", p, self.quote_ident(column)),
            None => self.quote_ident(column),
        };
        match data_type.to_lowercase().as_str() {
            "xml" => format!("CAST({} AS NVARCHAR(MAX)) AS {}", quoted, self.quote_ident(column)),
            _ => quoted,
        }
    }

    fn select_list(&self, columns: &[String], col_types: &[String]) -> String {
        columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                self.select_expr(None, c, col_types.get(i).map(String::as_str).unwrap_or(""))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Typed SQL literal for a JSON value produced by the type mapper.
    pub fn literal(&self, value: &Value, data_type: &str) -> String {
        let s = match value {
            Value::Null => return "NULL".to_string(),
            Value::Bool(b) => return if *b { "1" } else { "0" }.to_string(),
            Value::Number(n) => return n.to_string(),
            Value::String(s) => s,
            other => return self.nstring(&other.to_string()),
        };

        match data_type.to_lowercase().as_str() {
            "datetime" => self.timestamp_literal(s, 3, "DATETIME"),
            "datetime2" => self.timestamp_literal(s, 7, "DATETIME2"),
            "smalldatetime" => self.timestamp_literal(s, 0, "SMALLDATETIME"),
            "date" => match parse_timestamp(s) {
                Some(dt) => format!("CAST('{}' AS DATE)", dt.format("%Y-%m-%d")),
                None => self.nstring(s),
            },
            "datetimeoffset" => match parse_timestamp(s) {
                Some(dt) => {
                    let text = dt.format("%Y-%m-%dT%H:%M:%S%.9f").to_string();
                    format!("CAST('{}+00:00' AS DATETIMEOFFSET)", fraction(&text, 7))
                }
                None => self.nstring(s),
            },
            "time" => match NaiveTime::parse_from_str(s, "%H:%M:%S%.f") {
                Ok(t) => {
                    let text = t.format("%H:%M:%S%.9f").to_string();
                    format!("CAST('{}' AS TIME)", fraction(&text, 7))
                }
                Err(_) => self.nstring(s),
            },
            "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => {
                let digits = s.strip_prefix("0x").unwrap_or(s);
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()) {
                    format!("0x{}", digits)
                } else {
                    "0x".to_string()
                }
            }
            "uniqueidentifier" => format!("CAST({} AS UNIQUEIDENTIFIER)", self.nstring(s)),
            "char" | "varchar" | "text" => format!("'{}'", s.replace('\'', "''")),
            _ => self.nstring(s),
        }
    }

    fn timestamp_literal(&self, s: &str, digits: usize, sql_type: &str) -> String {
        match parse_timestamp(s) {
            Some(dt) => {
                let text = dt.format("%Y-%m-%dT%H:%M:%S%.9f").to_string();
                format!("CAST('{}' AS {})", fraction(&text, digits), sql_type)
            }
            None => self.nstring(s),
        }
    }

    /// Predicate comparing a composite key to a tuple of values.
    ///
    /// `(a, b) > (1, 2)` expands to `a > 1 OR (a = 1 AND b > 2)`; the
    /// inclusive upper bound uses `<=` on the last column.
    pub fn key_predicate(
        &self,
        key_columns: &[String],
        key_types: &[String],
        values: &[Value],
        bound: KeyBound,
    ) -> String {
        let cols: Vec<String> = key_columns.iter().map(|c| self.quote_ident(c)).collect();
        let lits: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, v)| self.literal(v, key_types.get(i).map(String::as_str).unwrap_or("")))
            .collect();
        let n = cols.len().min(lits.len());

        let mut disjuncts = Vec::with_capacity(n);
        for i in 0..n {
            let op = match bound {
                KeyBound::After => ">",
                KeyBound::UpTo if i + 1 == n => "<=",
                KeyBound::UpTo => "<",
            };
            let mut terms: Vec<String> = (0..i)
                .map(|j| format!("{} = {}", cols[j], lits[j]))
                .collect();
            terms.push(format!("{} {} {}", cols[i], op, lits[i]));
            disjuncts.push(terms.join(" AND "));
        }

        if disjuncts.len() == 1 {
            disjuncts.remove(0)
        } else {
            disjuncts
                .iter()
                .map(|d| format!("({})", d))
                .collect::<Vec<_>>()
                .join(" OR ")
        }
    }

    /// One keyset page: `after < key <= upto`, ordered by key.
    #[allow(clippy::too_many_arguments)]
    pub fn build_keyset_query(
        &self,
        table: &TableRef,
        columns: &[String],
        col_types: &[String],
        key_columns: &[String],
        key_types: &[String],
        after: Option<&[Value]>,
        upto: &[Value],
        limit: usize,
    ) -> String {
        let mut conditions = Vec::with_capacity(2);
        if let Some(after) = after {
            conditions.push(self.key_predicate(key_columns, key_types, after, KeyBound::After));
        }
        conditions.push(self.key_predicate(key_columns, key_types, upto, KeyBound::UpTo));

        format!(
            "SELECT TOP {} {} FROM {} WHERE {} ORDER BY {}",
            limit,
            self.select_list(columns, col_types),
            self.three_part_name(table),
            conditions
                .iter()
                .map(|c| format!("({})", c))
                .collect::<Vec<_>>()
                .join(" AND "),
            self.order_by(key_columns, "ASC")
        )
    }

    /// Rows at or after a replication key value, NULL keys first.
    pub fn build_replication_key_query(
        &self,
        table: &TableRef,
        columns: &[String],
        col_types: &[String],
        key: &str,
        key_type: &str,
        from: Option<&Value>,
    ) -> String {
        let quoted = self.quote_ident(key);
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.select_list(columns, col_types),
            self.three_part_name(table)
        );
        if let Some(from) = from.filter(|v| !v.is_null()) {
            sql.push_str(&format!(" WHERE {} >= {}", quoted, self.literal(from, key_type)));
        }
        sql.push_str(&format!(
            " ORDER BY CASE WHEN {q} IS NULL THEN 0 ELSE 1 END, {q} ASC",
            q = quoted
        ));
        sql
    }

    /// Every row, in server order.
    pub fn build_full_scan_query(
        &self,
        table: &TableRef,
        columns: &[String],
        col_types: &[String],
    ) -> String {
        format!(
            "SELECT {} FROM {}",
            self.select_list(columns, col_types),
            self.three_part_name(table)
        )
    }

    /// Largest key tuple in the table.
    pub fn build_max_key_query(
        &self,
        table: &TableRef,
        key_columns: &[String],
        key_types: &[String],
    ) -> String {
        format!(
            "SELECT TOP 1 {} FROM {} ORDER BY {}",
            self.select_list(key_columns, key_types),
            self.three_part_name(table),
            self.order_by(key_columns, "DESC")
        )
    }

    fn order_by(&self, columns: &[String], direction: &str) -> String {
        columns
            .iter()
            .map(|c| format!("{} {}", self.quote_ident(c), direction))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Online user databases.
    pub fn build_databases_query(&self) -> String {
        let excluded = SYSTEM_DATABASES
            .iter()
            .map(|d| format!("'{}'", d))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT name FROM sys.databases WHERE state_desc = 'ONLINE' \
             AND name NOT IN ({}) ORDER BY name",
            excluded
        )
    }

    /// Tables and views of a database.
    pub fn build_objects_query(&self, database: &str) -> String {
        format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME, TABLE_TYPE \
             FROM {}.INFORMATION_SCHEMA.TABLES \
             ORDER BY TABLE_SCHEMA, TABLE_NAME",
            self.quote_ident(database)
        )
    }

    /// Columns of every table and view in a database.
    pub fn build_columns_query(&self, database: &str) -> String {
        format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, DATA_TYPE, \
             CAST(ISNULL(CHARACTER_MAXIMUM_LENGTH, 0) AS INT), \
             CAST(ISNULL(NUMERIC_PRECISION, 0) AS INT), \
             CAST(ISNULL(NUMERIC_SCALE, 0) AS INT), \
             CASE WHEN IS_NULLABLE = 'YES' THEN 1 ELSE 0 END, \
             CAST(ORDINAL_POSITION AS INT) \
             FROM {}.INFORMATION_SCHEMA.COLUMNS \
             ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION",
            self.quote_ident(database)
        )
    }

    /// Primary key columns of every table in a database, in key order.
    pub fn build_primary_keys_query(&self, database: &str) -> String {
        let db = self.quote_ident(database);
        format!(
            "SELECT kcu.TABLE_SCHEMA, kcu.TABLE_NAME, kcu.COLUMN_NAME \
             FROM {db}.INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
             JOIN {db}.INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
               ON kcu.CONSTRAINT_NAME = tc.CONSTRAINT_NAME \
              AND kcu.TABLE_SCHEMA = tc.TABLE_SCHEMA \
              AND kcu.TABLE_NAME = tc.TABLE_NAME \
             WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' \
             ORDER BY kcu.TABLE_SCHEMA, kcu.TABLE_NAME, kcu.ORDINAL_POSITION",
            db = db
        )
    }

    /// Approximate row counts from sys.partitions.
    pub fn build_row_counts_query(&self, database: &str) -> String {
        let db = self.quote_ident(database);
        format!(
            "SELECT s.name, t.name, CAST(SUM(p.rows) AS BIGINT) \
             FROM {db}.sys.partitions p \
             JOIN {db}.sys.tables t ON p.object_id = t.object_id \
             JOIN {db}.sys.schemas s ON t.schema_id = s.schema_id \
             WHERE p.index_id IN (0, 1) \
             GROUP BY s.name, t.name",
            db = db
        )
    }

    /// Number of change-tracked tables matching the object (0 or 1).
    pub fn build_change_tracking_enabled_query(&self, table: &TableRef) -> String {
        format!(
            "SELECT COUNT(*) FROM {}.sys.change_tracking_tables \
             WHERE object_id = OBJECT_ID({})",
            self.quote_ident(&table.database),
            self.nstring(&self.three_part_name(table))
        )
    }

    pub fn build_current_version_query(&self, database: &str) -> String {
        self.in_database(database, "SELECT CHANGE_TRACKING_CURRENT_VERSION()")
    }

    pub fn build_min_valid_version_query(&self, table: &TableRef) -> String {
        let inner = format!(
            "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID({}))",
            self.nstring(&self.two_part_name(table))
        );
        self.in_database(&table.database, &inner)
    }

    /// Changes in `(since, upto]` joined to the current row image.
    ///
    /// Result columns: version, operation, commit time, row-exists flag,
    /// the key columns from the change table, then the selected columns.
    #[allow(clippy::too_many_arguments)]
    pub fn build_changes_query(
        &self,
        table: &TableRef,
        key_columns: &[String],
        key_types: &[String],
        columns: &[String],
        col_types: &[String],
        since: i64,
        upto: i64,
    ) -> String {
        let join = key_columns
            .iter()
            .map(|k| format!("c.{q} = t.{q}", q = self.quote_ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let exists_probe = key_columns
            .first()
            .map(|k| format!("t.{}", self.quote_ident(k)))
            .unwrap_or_else(|| "NULL".to_string());

        let mut select = vec![
            "c.SYS_CHANGE_VERSION".to_string(),
            "c.SYS_CHANGE_OPERATION".to_string(),
            "tc.commit_time".to_string(),
            format!("CASE WHEN {} IS NULL THEN 0 ELSE 1 END", exists_probe),
        ];
        for (i, k) in key_columns.iter().enumerate() {
            select.push(self.select_expr(
                Some("c"),
                k,
                key_types.get(i).map(String::as_str).unwrap_or(""),
            ));
        }
        for (i, col) in columns.iter().enumerate() {
            select.push(self.select_expr(
                Some("t"),
                col,
                col_types.get(i).map(String::as_str).unwrap_or(""),
            ));
        }

        let inner = format!(
            "SELECT {} FROM CHANGETABLE(CHANGES {}, {}) AS c \
             LEFT JOIN {} AS t ON {} \
             LEFT JOIN sys.dm_tran_commit_table tc ON c.SYS_CHANGE_VERSION = tc.commit_ts \
             WHERE c.SYS_CHANGE_VERSION <= {} \
             ORDER BY c.SYS_CHANGE_VERSION ASC",
            select.join(", "),
            self.two_part_name(table),
            since,
            self.two_part_name(table),
            join,
            upto
        );
        self.in_database(&table.database, &inner)
    }
}

/// Parse a timestamp emitted by the type mapper (RFC 3339, UTC) or a bare
/// `YYYY-MM-DDTHH:MM:SS[.f]` written by hand into a state file.
fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc).naive_utc())
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok())
        .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
}

/// Trim a 9-digit fractional second to `digits` digits (dropping the dot
/// when `digits` is 0).
fn fraction(text: &str, digits: usize) -> String {
    match text.rfind('.') {
        Some(dot) if digits == 0 => text[..dot].to_string(),
        Some(dot) => {
            let end = (dot + 1 + digits).min(text.len());
            text[..end].to_string()
        }
        None => text.to_string(),
    }
}
