//! Type mapping from MSSQL columns to JSON Schema and JSON values.

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

use crate::core::{Column, SqlValue};

/// Timestamp layout shared by every temporal value we emit.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";

/// Time-of-day layout.
const TIME_FORMAT: &str = "%H:%M:%S%.9f";

/// GUID pattern advertised in the schema of uniqueidentifier columns.
const GUID_PATTERN: &str =
    "^[0-9A-F]{8}-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{4}-[0-9A-F]{12}$";

/// Whether a column is replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Inclusion {
    /// Always replicated (primary keys, replication keys).
    Automatic,
    /// Replicated when selected.
    Available,
    /// Never replicated.
    #[serde(alias = "unavailable")]
    Unsupported,
}

/// JSON Schema fragment and inclusion for one column.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMapping {
    pub schema: Value,
    pub inclusion: Inclusion,
}

/// Map a column definition to its JSON Schema fragment.
///
/// Primary-key promotion to [`Inclusion::Automatic`] happens in the catalog;
/// this only distinguishes supported from unsupported types.
pub fn map_column(column: &Column) -> TypeMapping {
    map_type(
        &column.data_type,
        column.max_length,
        column.precision,
        column.scale,
        column.is_nullable,
    )
}

/// Map an MSSQL data type to a JSON Schema fragment.
pub fn map_type(
    data_type: &str,
    max_length: i32,
    precision: i32,
    scale: i32,
    is_nullable: bool,
) -> TypeMapping {
    let mut schema = Map::new();

    let json_type = match data_type.to_lowercase().as_str() {
        // Integer types
        "tinyint" => integer(&mut schema, 0, 255),
        "smallint" => integer(&mut schema, i16::MIN as i64, i16::MAX as i64),
        "int" => integer(&mut schema, i32::MIN as i64, i32::MAX as i64),
        "bigint" => integer(&mut schema, i64::MIN, i64::MAX),

        // Boolean
        "bit" => "boolean",

        // Exact numerics
        "decimal" | "numeric" => decimal(&mut schema, precision, scale),
        "money" => decimal(&mut schema, 19, 4),
        "smallmoney" => decimal(&mut schema, 10, 4),

        // Approximate numerics
        "float" | "real" => "number",

        // Character types
        "char" | "nchar" | "varchar" | "nvarchar" => {
            if max_length > 0 {
                schema.insert("maxLength".into(), json!(max_length));
            }
            "string"
        }
        "text" | "ntext" | "xml" => "string",

        // Binary types, emitted as hex
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => {
            schema.insert("format".into(), json!("binary"));
            "string"
        }

        // GUID
        "uniqueidentifier" => {
            schema.insert("pattern".into(), json!(GUID_PATTERN));
            "string"
        }

        // Date/time types
        "date" | "datetime" | "datetime2" | "smalldatetime" | "datetimeoffset" => {
            schema.insert("format".into(), json!("date-time"));
            "string"
        }
        "time" => {
            schema.insert("format".into(), json!("time"));
            "string"
        }

        // sql_variant, spatial, hierarchyid, CLR types
        _ => {
            return TypeMapping {
                schema: json!({}),
                inclusion: Inclusion::Unsupported,
            };
        }
    };

    let type_value = if is_nullable {
        json!(["null", json_type])
    } else {
        json!([json_type])
    };
    schema.insert("type".into(), type_value);

    TypeMapping {
        schema: Value::Object(schema),
        inclusion: Inclusion::Available,
    }
}

fn integer(schema: &mut Map<String, Value>, min: i64, max: i64) -> &'static str {
    schema.insert("minimum".into(), json!(min));
    schema.insert("maximum".into(), json!(max));
    "integer"
}

fn decimal(schema: &mut Map<String, Value>, precision: i32, scale: i32) -> &'static str {
    if precision > 0 {
        let scale = scale.clamp(0, precision);
        let bound = 10f64.powi(precision - scale);
        schema.insert("multipleOf".into(), json!(10f64.powi(-scale)));
        schema.insert("exclusiveMinimum".into(), json!(-bound));
        schema.insert("exclusiveMaximum".into(), json!(bound));
    }
    "number"
}

/// Convert a decoded driver value to its JSON representation.
pub fn to_json(value: SqlValue<'_>) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Bool(b),
        SqlValue::I16(i) => json!(i),
        SqlValue::I32(i) => json!(i),
        SqlValue::I64(i) => json!(i),
        SqlValue::F32(f) => float(f as f64),
        SqlValue::F64(f) => float(f),
        SqlValue::Text(s) => Value::String(s.into_owned()),
        SqlValue::Bytes(b) => Value::String(format!("0x{}", hex::encode_upper(b.as_ref()))),
        SqlValue::Uuid(u) => Value::String(u.hyphenated().to_string().to_uppercase()),
        SqlValue::Decimal(d) => decimal_number(d),
        SqlValue::DateTime(dt) => Value::String(format_naive(&dt)),
        SqlValue::DateTimeOffset(dt) => Value::String(format_utc(&dt.with_timezone(&Utc))),
        SqlValue::Date(d) => Value::String(format_naive(&d.and_time(NaiveTime::MIN))),
        SqlValue::Time(t) => Value::String(t.format(TIME_FORMAT).to_string()),
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Decimals keep every digit: the number carries the decimal's own text.
fn decimal_number(d: Decimal) -> Value {
    let text = d.normalize().to_string();
    match text.parse::<Number>() {
        Ok(n) => Value::Number(n),
        Err(_) => Value::String(text),
    }
}

/// Render a naive timestamp as UTC.
pub fn format_naive(dt: &NaiveDateTime) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

/// Render a UTC timestamp the same way row values are rendered.
pub fn format_utc(dt: &DateTime<Utc>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}
