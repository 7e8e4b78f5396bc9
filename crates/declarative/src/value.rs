//! Column values and their conversion to and from SQL parameters and rows.

use std::fmt;

use serde_json::Value as JsonValue;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::{Any, Column as _, Row};

use crate::error::{ModelError, ModelResult};
use crate::schema::ColumnType;

pub(crate) type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

/// Database value enumeration for type-safe value handling
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(uuid::Uuid),
    DateTime(chrono::DateTime<chrono::Utc>),
    Json(JsonValue),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int64(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatabaseValue::Float64(f) => Some(*f),
            DatabaseValue::Int64(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON value
    pub fn to_json(&self) -> JsonValue {
        match self {
            DatabaseValue::Null => JsonValue::Null,
            DatabaseValue::Bool(b) => JsonValue::Bool(*b),
            DatabaseValue::Int64(i) => JsonValue::Number(serde_json::Number::from(*i)),
            DatabaseValue::Float64(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DatabaseValue::String(s) => JsonValue::String(s.clone()),
            DatabaseValue::Bytes(b) => JsonValue::Array(
                b.iter()
                    .map(|&x| JsonValue::Number(serde_json::Number::from(x)))
                    .collect(),
            ),
            DatabaseValue::Uuid(u) => JsonValue::String(u.to_string()),
            DatabaseValue::DateTime(dt) => JsonValue::String(dt.to_rfc3339()),
            DatabaseValue::Json(j) => j.clone(),
        }
    }

    /// Create a value from JSON without a target column type.
    ///
    /// Strings stay strings; arrays and objects become `Json`.
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => DatabaseValue::Null,
            JsonValue::Bool(b) => DatabaseValue::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DatabaseValue::Int64(i)
                } else if let Some(f) = n.as_f64() {
                    DatabaseValue::Float64(f)
                } else {
                    DatabaseValue::Null
                }
            }
            JsonValue::String(s) => DatabaseValue::String(s),
            other => DatabaseValue::Json(other),
        }
    }

    /// Coerce a JSON value into the representation used by a column type.
    pub fn coerce_json(json: &JsonValue, ty: &ColumnType) -> ModelResult<Self> {
        if json.is_null() {
            return Ok(DatabaseValue::Null);
        }
        let mismatch = || {
            ModelError::Validation(format!("cannot store {} in a {} column", json, ty))
        };

        let value = match ty {
            ColumnType::Integer | ColumnType::BigInteger => match json {
                JsonValue::Number(n) => match n.as_i64() {
                    Some(i) => DatabaseValue::Int64(i),
                    None => match n.as_f64() {
                        Some(f) if f.fract() == 0.0 => DatabaseValue::Int64(f as i64),
                        _ => return Err(mismatch()),
                    },
                },
                JsonValue::String(s) => {
                    DatabaseValue::Int64(s.trim().parse().map_err(|_| mismatch())?)
                }
                _ => return Err(mismatch()),
            },
            ColumnType::Float => match json {
                JsonValue::Number(n) => DatabaseValue::Float64(n.as_f64().ok_or_else(mismatch)?),
                JsonValue::String(s) => {
                    DatabaseValue::Float64(s.trim().parse().map_err(|_| mismatch())?)
                }
                _ => return Err(mismatch()),
            },
            ColumnType::Boolean => match json {
                JsonValue::Bool(b) => DatabaseValue::Bool(*b),
                JsonValue::Number(n) => DatabaseValue::Bool(n.as_i64().ok_or_else(mismatch)? != 0),
                JsonValue::String(s) => match s.as_str() {
                    "true" | "1" => DatabaseValue::Bool(true),
                    "false" | "0" => DatabaseValue::Bool(false),
                    _ => return Err(mismatch()),
                },
                _ => return Err(mismatch()),
            },
            ColumnType::String(_) | ColumnType::Text => match json {
                JsonValue::String(s) => DatabaseValue::String(s.clone()),
                JsonValue::Number(n) => DatabaseValue::String(n.to_string()),
                JsonValue::Bool(b) => DatabaseValue::String(b.to_string()),
                _ => return Err(mismatch()),
            },
            ColumnType::Enum(enum_type) => match json {
                JsonValue::String(s) => {
                    let value = s.trim();
                    if !enum_type.values.iter().any(|v| v == value) {
                        return Err(ModelError::InvalidEnumValue {
                            enum_name: enum_type.name.clone(),
                            value: value.to_string(),
                        });
                    }
                    DatabaseValue::String(value.to_string())
                }
                _ => return Err(mismatch()),
            },
            ColumnType::Json => DatabaseValue::Json(json.clone()),
            ColumnType::Binary => match json {
                JsonValue::String(s) => DatabaseValue::Bytes(s.as_bytes().to_vec()),
                JsonValue::Array(items) => DatabaseValue::Bytes(
                    items
                        .iter()
                        .map(|item| {
                            item.as_u64()
                                .and_then(|b| u8::try_from(b).ok())
                                .ok_or_else(mismatch)
                        })
                        .collect::<ModelResult<Vec<u8>>>()?,
                ),
                _ => return Err(mismatch()),
            },
            ColumnType::DateTime => match json {
                JsonValue::String(s) => DatabaseValue::DateTime(
                    chrono::DateTime::parse_from_rfc3339(s)
                        .map_err(|_| mismatch())?
                        .with_timezone(&chrono::Utc),
                ),
                _ => return Err(mismatch()),
            },
            ColumnType::Uuid => match json {
                JsonValue::String(s) => {
                    DatabaseValue::Uuid(uuid::Uuid::parse_str(s).map_err(|_| mismatch())?)
                }
                _ => return Err(mismatch()),
            },
        };
        Ok(value)
    }

    /// Coerce an already-built value into a column type.
    pub fn coerce(self, ty: &ColumnType) -> ModelResult<Self> {
        let matches = matches!(
            (&self, ty),
            (DatabaseValue::Null, _)
                | (DatabaseValue::Int64(_), ColumnType::Integer | ColumnType::BigInteger)
                | (DatabaseValue::Float64(_), ColumnType::Float)
                | (DatabaseValue::Bool(_), ColumnType::Boolean)
                | (DatabaseValue::String(_), ColumnType::String(_) | ColumnType::Text)
                | (DatabaseValue::Bytes(_), ColumnType::Binary)
                | (DatabaseValue::DateTime(_), ColumnType::DateTime)
                | (DatabaseValue::Uuid(_), ColumnType::Uuid)
                | (DatabaseValue::Json(_), ColumnType::Json)
        );
        if matches {
            Ok(self)
        } else {
            Self::coerce_json(&self.to_json(), ty)
        }
    }

    /// Literal rendering used by DDL defaults.
    pub(crate) fn to_sql_literal(&self) -> String {
        match self {
            DatabaseValue::Null => "NULL".to_string(),
            DatabaseValue::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            DatabaseValue::Int64(i) => i.to_string(),
            DatabaseValue::Float64(f) => f.to_string(),
            other => {
                let text = match other {
                    DatabaseValue::String(s) => s.clone(),
                    _ => other.to_json().to_string(),
                };
                format!("'{}'", text.replace('\'', "''"))
            }
        }
    }
}

impl fmt::Display for DatabaseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseValue::Null => write!(f, "None"),
            DatabaseValue::String(s) => write!(f, "'{}'", s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int64(value as i64)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(value: Vec<u8>) -> Self {
        DatabaseValue::Bytes(value)
    }
}

impl From<uuid::Uuid> for DatabaseValue {
    fn from(value: uuid::Uuid) -> Self {
        DatabaseValue::Uuid(value)
    }
}

impl From<chrono::DateTime<chrono::Utc>> for DatabaseValue {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl From<JsonValue> for DatabaseValue {
    fn from(value: JsonValue) -> Self {
        DatabaseValue::Json(value)
    }
}

impl<T> From<Option<T>> for DatabaseValue
where
    T: Into<DatabaseValue>,
{
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// Bind a value as the next positional parameter.
pub(crate) fn bind_value<'q>(query: AnyQuery<'q>, value: &DatabaseValue) -> AnyQuery<'q> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::Bytes(b) => query.bind(b.clone()),
        DatabaseValue::Uuid(u) => query.bind(u.to_string()),
        DatabaseValue::DateTime(dt) => query.bind(dt.to_rfc3339()),
        DatabaseValue::Json(j) => query.bind(j.to_string()),
    }
}

pub(crate) fn bind_all<'q>(mut query: AnyQuery<'q>, values: &[DatabaseValue]) -> AnyQuery<'q> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

fn decode_failure(name: &str, ty: &ColumnType) -> ModelError {
    ModelError::Serialization(format!("column '{}' could not be decoded as {}", name, ty))
}

/// Decode a named column from a row according to its declared type.
///
/// Drivers report storage classes differently, so each type falls back to
/// the nearest representation before giving up. Every read goes through
/// `Option<T>` so a NULL decodes as `DatabaseValue::Null` whatever the
/// column's declared type.
pub(crate) fn decode_column(row: &AnyRow, name: &str, ty: &ColumnType) -> ModelResult<DatabaseValue> {
    let failure = || decode_failure(name, ty);
    let text = || row.try_get::<Option<String>, _>(name).map_err(|_| failure());

    let value = match ty {
        ColumnType::Integer | ColumnType::BigInteger => {
            if let Ok(i) = row.try_get::<Option<i64>, _>(name) {
                i.map(DatabaseValue::Int64)
            } else if let Ok(f) = row.try_get::<Option<f64>, _>(name) {
                f.map(|f| DatabaseValue::Int64(f as i64))
            } else {
                text()?
                    .map(|s| s.trim().parse::<i64>().map_err(|_| failure()))
                    .transpose()?
                    .map(DatabaseValue::Int64)
            }
        }
        ColumnType::Float => {
            if let Ok(f) = row.try_get::<Option<f64>, _>(name) {
                f.map(DatabaseValue::Float64)
            } else if let Ok(i) = row.try_get::<Option<i64>, _>(name) {
                i.map(|i| DatabaseValue::Float64(i as f64))
            } else {
                return Err(failure());
            }
        }
        ColumnType::Boolean => {
            if let Ok(b) = row.try_get::<Option<bool>, _>(name) {
                b.map(DatabaseValue::Bool)
            } else if let Ok(i) = row.try_get::<Option<i64>, _>(name) {
                i.map(|i| DatabaseValue::Bool(i != 0))
            } else {
                return Err(failure());
            }
        }
        ColumnType::String(_) | ColumnType::Text => text()?.map(DatabaseValue::String),
        ColumnType::Enum(_) => text()?.map(|raw| DatabaseValue::String(raw.trim().to_string())),
        ColumnType::Json => match text()? {
            Some(raw) => Some(DatabaseValue::Json(serde_json::from_str(&raw)?)),
            None => None,
        },
        ColumnType::Binary => row
            .try_get::<Option<Vec<u8>>, _>(name)
            .map_err(|_| failure())?
            .map(DatabaseValue::Bytes),
        ColumnType::DateTime => text()?
            .map(|raw| {
                chrono::DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| DatabaseValue::DateTime(dt.with_timezone(&chrono::Utc)))
                    .map_err(|_| failure())
            })
            .transpose()?,
        ColumnType::Uuid => text()?
            .map(|raw| {
                uuid::Uuid::parse_str(&raw)
                    .map(DatabaseValue::Uuid)
                    .map_err(|_| failure())
            })
            .transpose()?,
    };
    Ok(value.unwrap_or(DatabaseValue::Null))
}

/// Decode an untyped row (raw statements) into a JSON object.
pub(crate) fn decode_untyped_row(row: &AnyRow) -> ModelResult<serde_json::Map<String, JsonValue>> {
    let mut out = serde_json::Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = if let Ok(i) = row.try_get::<Option<i64>, _>(index) {
            i.map(JsonValue::from)
        } else if let Ok(f) = row.try_get::<Option<f64>, _>(index) {
            f.map(JsonValue::from)
        } else if let Ok(b) = row.try_get::<Option<bool>, _>(index) {
            b.map(JsonValue::from)
        } else if let Ok(s) = row.try_get::<Option<String>, _>(index) {
            s.map(JsonValue::from)
        } else if let Ok(bytes) = row.try_get::<Option<Vec<u8>>, _>(index) {
            bytes.map(|b| DatabaseValue::Bytes(b).to_json())
        } else {
            return Err(ModelError::Serialization(format!(
                "column '{}' has an unsupported type",
                name
            )));
        };
        out.insert(name, value.unwrap_or(JsonValue::Null));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EnumColumnType;
    use serde_json::json;

    #[test]
    fn test_coerce_integer_from_json() {
        let ty = ColumnType::Integer;
        assert_eq!(DatabaseValue::coerce_json(&json!(5), &ty).unwrap(), DatabaseValue::Int64(5));
        assert_eq!(DatabaseValue::coerce_json(&json!("12"), &ty).unwrap(), DatabaseValue::Int64(12));
        assert_eq!(DatabaseValue::coerce_json(&json!(null), &ty).unwrap(), DatabaseValue::Null);
        assert!(DatabaseValue::coerce_json(&json!("abc"), &ty).is_err());
    }

    #[test]
    fn test_coerce_enum_rejects_unknown_symbol() {
        let ty = ColumnType::Enum(EnumColumnType {
            name: "OrderStatus".to_string(),
            values: vec!["p".to_string(), "s".to_string()],
        });

        assert_eq!(
            DatabaseValue::coerce_json(&json!(" p "), &ty).unwrap(),
            DatabaseValue::String("p".to_string())
        );
        let err = DatabaseValue::coerce_json(&json!("x"), &ty).unwrap_err();
        assert!(matches!(err, ModelError::InvalidEnumValue { ref value, .. } if value == "x"));
    }

    #[test]
    fn test_coerce_existing_value() {
        let value = DatabaseValue::from(3).coerce(&ColumnType::Float).unwrap();
        assert_eq!(value, DatabaseValue::Float64(3.0));

        let value = DatabaseValue::from("hello").coerce(&ColumnType::Text).unwrap();
        assert_eq!(value, DatabaseValue::String("hello".to_string()));
    }

    #[test]
    fn test_to_json_and_display() {
        assert_eq!(DatabaseValue::Int64(4).to_json(), json!(4));
        assert_eq!(DatabaseValue::Null.to_string(), "None");
        assert_eq!(DatabaseValue::from("a").to_string(), "'a'");
        assert_eq!(DatabaseValue::from(Some(2)), DatabaseValue::Int64(2));
        assert_eq!(DatabaseValue::from(None::<i64>), DatabaseValue::Null);
    }

    #[test]
    fn test_sql_literal_escapes_quotes() {
        assert_eq!(DatabaseValue::from("it's").to_sql_literal(), "'it''s'");
        assert_eq!(DatabaseValue::Bool(true).to_sql_literal(), "TRUE");
    }
}
