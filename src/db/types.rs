//! Row bridge: sqlx rows to flat JSON maps keyed by column name.
//!
//! The declared column type picks a [`TypeCategory`]; each database then decodes
//! that category with the Rust types its sqlx driver accepts. Values that cannot be
//! decoded come back as `null` rather than failing the whole call.

use crate::models::{DatabaseType, Row as JsonRow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo, ValueRef};

/// Logical category of a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Timestamp,
    Date,
    Time,
    /// No declared type (SQLite expression columns) or one we do not know
    Unknown,
}

/// Classify a declared column type.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    match lower.as_str() {
        // SQLite's NUMERIC affinity stores floats
        "numeric" if db == DatabaseType::SQLite => TypeCategory::Float,
        "bool" | "boolean" => TypeCategory::Boolean,
        "real" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "bytea" => TypeCategory::Binary,
        "datetime" => TypeCategory::Timestamp,
        "date" => TypeCategory::Date,
        "time" | "timetz" => TypeCategory::Time,
        "name" => TypeCategory::Text,
        _ if has("decimal") || has("numeric") => TypeCategory::Decimal,
        _ if has("int") || has("serial") => TypeCategory::Integer,
        _ if has("float") || has("double") => TypeCategory::Float,
        _ if has("blob") || has("binary") => TypeCategory::Binary,
        _ if lower.starts_with("timestamp") => TypeCategory::Timestamp,
        _ if has("char") || has("text") => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

/// DECIMAL/NUMERIC kept as the server's text, so no precision is lost.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        categorize_type(ty.name(), DatabaseType::MySQL) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::MySql>>::decode(value).map(|s| RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        categorize_type(ty.name(), DatabaseType::PostgreSQL) == TypeCategory::Decimal
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::Postgres>>::decode(value).map(|s| RawDecimal(s.to_string()))
    }
}

/// Binary columns travel as base64 text.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn shown<T: ToString>(v: T) -> JsonValue {
    JsonValue::String(v.to_string())
}

/// Nullable typed read; decode failures count as missing.
fn get<R, T>(row: &R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: for<'r> Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

/// Convert a driver row to a JSON map.
pub(crate) trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

/// Per-database column decoding behind [`RowToJson`].
pub(crate) trait DecodeColumn: Row {
    const DB_TYPE: DatabaseType;

    fn decode_column(&self, idx: usize, type_name: &str, category: TypeCategory) -> JsonValue;
}

impl<R: DecodeColumn> RowToJson for R {
    fn to_json_map(&self) -> JsonRow {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, R::DB_TYPE);
                let value = self.decode_column(idx, type_name, category);
                (col.name().to_string(), value)
            })
            .collect()
    }
}

impl DecodeColumn for MySqlRow {
    const DB_TYPE: DatabaseType = DatabaseType::MySQL;

    fn decode_column(&self, idx: usize, type_name: &str, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Decimal => get::<_, RawDecimal>(self, idx).map(|d| JsonValue::String(d.0)),
            TypeCategory::Integer => get::<_, i64>(self, idx)
                .map(JsonValue::from)
                .or_else(|| get::<_, u64>(self, idx).map(JsonValue::from))
                .or_else(|| get::<_, i32>(self, idx).map(JsonValue::from))
                .or_else(|| get::<_, i8>(self, idx).map(JsonValue::from)),
            // BOOLEAN is TINYINT(1) on the wire
            TypeCategory::Boolean => get::<_, bool>(self, idx)
                .map(JsonValue::Bool)
                .or_else(|| get::<_, i8>(self, idx).map(JsonValue::from)),
            TypeCategory::Float => get::<_, f64>(self, idx)
                .or_else(|| get::<_, f32>(self, idx).map(f64::from))
                .map(float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(self, idx).map(|v| encode_binary_value(&v)),
            TypeCategory::Json => get::<_, JsonValue>(self, idx),
            TypeCategory::Timestamp | TypeCategory::Date | TypeCategory::Time => {
                // TIMESTAMP is stored in UTC, DATETIME has no zone
                let utc = type_name
                    .eq_ignore_ascii_case("timestamp")
                    .then(|| get::<_, DateTime<Utc>>(self, idx).map(|v| shown(v.to_rfc3339())))
                    .flatten();
                utc.or_else(|| get::<_, NaiveDateTime>(self, idx).map(shown))
                    .or_else(|| get::<_, NaiveDate>(self, idx).map(shown))
                    .or_else(|| get::<_, NaiveTime>(self, idx).map(shown))
            }
            _ => None,
        };
        value
            .or_else(|| get::<_, String>(self, idx).map(JsonValue::String))
            .unwrap_or(JsonValue::Null)
    }
}

impl DecodeColumn for PgRow {
    const DB_TYPE: DatabaseType = DatabaseType::PostgreSQL;

    fn decode_column(&self, idx: usize, _type_name: &str, category: TypeCategory) -> JsonValue {
        let value = match category {
            TypeCategory::Decimal => {
                let decimal = get::<_, RawDecimal>(self, idx);
                if decimal.is_none() && !self.try_get_raw(idx).is_ok_and(|raw| raw.is_null()) {
                    tracing::warn!(column = idx, "Failed to decode NUMERIC value");
                }
                decimal.map(|d| JsonValue::String(d.0))
            }
            // Postgres integer types only decode into their exact width
            TypeCategory::Integer => get::<_, i64>(self, idx)
                .map(JsonValue::from)
                .or_else(|| get::<_, i32>(self, idx).map(JsonValue::from))
                .or_else(|| get::<_, i16>(self, idx).map(JsonValue::from)),
            TypeCategory::Boolean => get::<_, bool>(self, idx).map(JsonValue::Bool),
            TypeCategory::Float => get::<_, f64>(self, idx)
                .or_else(|| get::<_, f32>(self, idx).map(f64::from))
                .map(float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(self, idx).map(|v| encode_binary_value(&v)),
            TypeCategory::Json => get::<_, JsonValue>(self, idx),
            TypeCategory::Timestamp => get::<_, DateTime<Utc>>(self, idx)
                .map(|v| shown(v.to_rfc3339()))
                .or_else(|| get::<_, NaiveDateTime>(self, idx).map(shown)),
            TypeCategory::Date => get::<_, NaiveDate>(self, idx).map(shown),
            TypeCategory::Time => get::<_, NaiveTime>(self, idx).map(shown),
            _ => None,
        };
        value
            .or_else(|| get::<_, String>(self, idx).map(JsonValue::String))
            .unwrap_or(JsonValue::Null)
    }
}

impl DecodeColumn for SqliteRow {
    const DB_TYPE: DatabaseType = DatabaseType::SQLite;

    fn decode_column(&self, idx: usize, type_name: &str, category: TypeCategory) -> JsonValue {
        let category = match category {
            TypeCategory::Unknown => stored_category(self, idx),
            other => other,
        };
        let value = match category {
            TypeCategory::Integer => get::<_, i64>(self, idx).map(JsonValue::from),
            TypeCategory::Boolean => get::<_, bool>(self, idx).map(JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => get::<_, f64>(self, idx).map(float_value),
            TypeCategory::Binary => get::<_, Vec<u8>>(self, idx).map(|v| encode_binary_value(&v)),
            _ => get::<_, String>(self, idx).map(|text| {
                // JSON is stored as TEXT; hand it back parsed when it parses
                let json = type_name
                    .to_ascii_lowercase()
                    .contains("json")
                    .then(|| serde_json::from_str(&text).ok())
                    .flatten();
                json.unwrap_or(JsonValue::String(text))
            }),
        };
        value.unwrap_or(JsonValue::Null)
    }
}

/// Expression columns carry no declared type; use the stored value's type.
fn stored_category(row: &SqliteRow, idx: usize) -> TypeCategory {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => categorize_type(raw.type_info().name(), DatabaseType::SQLite),
        _ => TypeCategory::Unknown,
    }
}
