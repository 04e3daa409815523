//! Row decoding into JSON maps.
//!
//! Column types are first classified into a [`TypeCategory`] from their
//! database type name; each backend then tries the Rust types that category
//! may decode to, in order, and keeps the first that succeeds.

use crate::models::DatabaseType;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Temporal,
    Text,
}

pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_ascii_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite NUMERIC affinity stores integers or reals
        return if db == DatabaseType::SQLite {
            TypeCategory::Float
        } else {
            TypeCategory::Decimal
        };
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if lower.contains("timestamp")
        || lower.contains("datetime")
        || lower == "date"
        || lower.starts_with("time")
    {
        return TypeCategory::Temporal;
    }
    TypeCategory::Text
}

/// DECIMAL / NUMERIC kept as its exact textual representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

fn is_decimal_type(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("decimal") || name.contains("numeric")
}

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        is_decimal_type(ty.name())
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        Ok(RawDecimal(<&str as Decode<sqlx::MySql>>::decode(value)?.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        is_decimal_type(ty.name())
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        Ok(RawDecimal(<&str as Decode<sqlx::Postgres>>::decode(value)?.to_string()))
    }
}

fn binary_value(bytes: Vec<u8>) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn display_value<T: ToString>(value: T) -> JsonValue {
    JsonValue::String(value.to_string())
}

/// Try each type in turn on column `$idx`; the first non-null decode wins.
macro_rules! decode_first {
    ($row:expr, $idx:expr, [$($ty:ty),+ $(,)?]) => {
        decode_first!($row, $idx, [$($ty),+] => JsonValue::from)
    };
    ($row:expr, $idx:expr, [$($ty:ty),+ $(,)?] => $map:expr) => {{
        let mut decoded: Option<JsonValue> = None;
        $(
            if decoded.is_none() {
                if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                    decoded = Some(($map)(v));
                }
            }
        )+
        decoded
    }};
}

pub trait RowToJson {
    fn column_names(&self) -> Vec<String>;
    fn to_json_map(&self) -> Map<String, JsonValue>;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decode:path) => {
        impl RowToJson for $row {
            fn column_names(&self) -> Vec<String> {
                self.columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect()
            }

            fn to_json_map(&self) -> Map<String, JsonValue> {
                self.columns()
                    .iter()
                    .map(|col| {
                        let category = categorize_type(col.type_info().name(), $db);
                        let value = $decode(self, col.ordinal(), category);
                        (col.name().to_string(), value)
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySQL, decode_mysql);
impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, decode_postgres);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, decode_sqlite);

fn decode_mysql(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
    let value = match category {
        TypeCategory::Decimal => decode_first!(row, idx, [RawDecimal] => |v: RawDecimal| JsonValue::String(v.0)),
        TypeCategory::Integer => decode_first!(row, idx, [i64, u64, i32, u32, i16, u16, i8, u8]),
        TypeCategory::Boolean => decode_first!(row, idx, [bool, i8]),
        TypeCategory::Float => decode_first!(row, idx, [f64, f32]),
        TypeCategory::Binary => decode_first!(row, idx, [Vec<u8>] => binary_value),
        TypeCategory::Json => decode_first!(row, idx, [JsonValue]),
        TypeCategory::Temporal => decode_first!(row, idx, [DateTime<Utc>, NaiveDateTime, NaiveDate, NaiveTime] => display_value),
        TypeCategory::Text => decode_first!(row, idx, [String]),
    };
    value.unwrap_or(JsonValue::Null)
}

fn decode_postgres(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
    let value = match category {
        TypeCategory::Decimal => decode_first!(row, idx, [RawDecimal] => |v: RawDecimal| JsonValue::String(v.0)),
        TypeCategory::Integer => decode_first!(row, idx, [i64, i32, i16]),
        TypeCategory::Boolean => decode_first!(row, idx, [bool]),
        TypeCategory::Float => decode_first!(row, idx, [f64, f32]),
        TypeCategory::Binary => decode_first!(row, idx, [Vec<u8>] => binary_value),
        TypeCategory::Json => decode_first!(row, idx, [JsonValue]),
        TypeCategory::Temporal => decode_first!(row, idx, [DateTime<Utc>, NaiveDateTime, NaiveDate, NaiveTime] => display_value),
        TypeCategory::Text => decode_first!(row, idx, [String]),
    };
    value.unwrap_or(JsonValue::Null)
}

fn decode_sqlite(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
    // SQLite values carry their own storage class, so fall back across classes.
    let value = match category {
        TypeCategory::Integer => decode_first!(row, idx, [i64, f64]),
        TypeCategory::Float | TypeCategory::Decimal => decode_first!(row, idx, [f64, i64, String]),
        TypeCategory::Boolean => decode_first!(row, idx, [bool, i64]),
        TypeCategory::Binary => decode_first!(row, idx, [Vec<u8>] => binary_value),
        TypeCategory::Json => decode_first!(row, idx, [String] => |s: String| {
            serde_json::from_str(&s).unwrap_or(JsonValue::String(s))
        }),
        TypeCategory::Temporal | TypeCategory::Text => None,
    };
    value
        .or_else(|| decode_first!(row, idx, [String, i64, f64]))
        .or_else(|| decode_first!(row, idx, [Vec<u8>] => binary_value))
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        let mysql = DatabaseType::MySQL;
        assert_eq!(categorize_type("BIGINT UNSIGNED", mysql), TypeCategory::Integer);
        assert_eq!(categorize_type("DECIMAL", mysql), TypeCategory::Decimal);
        assert_eq!(categorize_type("DATETIME", mysql), TypeCategory::Temporal);
        assert_eq!(categorize_type("VARCHAR", mysql), TypeCategory::Text);
        assert_eq!(categorize_type("BOOLEAN", mysql), TypeCategory::Boolean);

        let pg = DatabaseType::PostgreSQL;
        assert_eq!(categorize_type("TIMESTAMPTZ", pg), TypeCategory::Temporal);
        assert_eq!(categorize_type("JSONB", pg), TypeCategory::Json);
        assert_eq!(categorize_type("BYTEA", pg), TypeCategory::Binary);
        assert_eq!(categorize_type("FLOAT8", pg), TypeCategory::Float);

        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[tokio::test]
    async fn test_sqlite_row_to_json() {
        use sqlx::Connection;

        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();
        let row: SqliteRow = sqlx::query(
            "SELECT 42 AS answer, 1.5 AS ratio, 'ada' AS name, NULL AS missing, X'0102' AS raw",
        )
        .fetch_one(&mut conn)
        .await
        .unwrap();

        assert_eq!(
            row.column_names(),
            vec!["answer", "ratio", "name", "missing", "raw"]
        );
        let map = row.to_json_map();
        assert_eq!(map["answer"], serde_json::json!(42));
        assert_eq!(map["ratio"], serde_json::json!(1.5));
        assert_eq!(map["name"], serde_json::json!("ada"));
        assert_eq!(map["missing"], JsonValue::Null);
        assert_eq!(map["raw"], serde_json::json!("AQI="));
    }
}
