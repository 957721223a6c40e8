//! Row values and their coercion to wire types.
//!
//! Every value passes through [`Value::coerce`] before it reaches a
//! [`RowSink`](crate::writer::RowSink), so a sink only ever sees values
//! whose variant matches the column's [`WireType`].

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use postgres::Row;
use postgres::types::ToSql;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BulkError;
use crate::field::{Field, WireType};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    /// An enumerated value, written as its ordinal or its name depending
    /// on the destination wire type.
    Enum { name: String, ordinal: i64 },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int16(_) => "int2",
            Value::Int32(_) => "int4",
            Value::Int64(_) => "int8",
            Value::Float32(_) => "float4",
            Value::Float64(_) => "float8",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytea",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
            Value::Date(_) => "date",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Enum { .. } => "enum",
        }
    }

    /// Integer view of the value, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(v) => Some(i64::from(*v)),
            Value::Int32(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Convert the value to the representation required by `wire`.
    ///
    /// `column` is only used for error messages.
    pub fn coerce(self, wire: WireType, column: &str) -> Result<Value, BulkError> {
        let mismatch = |v: &Value| BulkError::Coercion {
            column: column.to_string(),
            from: v.type_name().to_string(),
            to: wire.to_string(),
        };

        let coerced = match (self, wire) {
            (Value::Null, _) => Value::Null,

            (Value::Enum { ordinal, .. }, w) if w.is_integer() => {
                return Value::Int64(ordinal).coerce(wire, column);
            }
            (Value::Enum { name, .. }, w) if w.is_textual() => Value::Text(name),

            (Value::Bool(v), WireType::Bool) => Value::Bool(v),

            (v @ (Value::Int16(_) | Value::Int32(_) | Value::Int64(_)), w) if w.is_integer() => {
                let n = v.as_i64().ok_or_else(|| mismatch(&v))?;
                match w {
                    WireType::Int2 => Value::Int16(i16::try_from(n).map_err(|_| mismatch(&v))?),
                    WireType::Int4 => Value::Int32(i32::try_from(n).map_err(|_| mismatch(&v))?),
                    _ => Value::Int64(n),
                }
            }
            (v @ (Value::Int16(_) | Value::Int32(_)), WireType::Float4) => {
                Value::Float32(v.as_i64().unwrap_or_default() as f32)
            }
            (v @ (Value::Int16(_) | Value::Int32(_) | Value::Int64(_)), WireType::Float8) => {
                Value::Float64(v.as_i64().unwrap_or_default() as f64)
            }
            (Value::Float32(v), WireType::Float4) => Value::Float32(v),
            (Value::Float32(v), WireType::Float8) => Value::Float64(f64::from(v)),
            (Value::Float64(v), WireType::Float8) => Value::Float64(v),

            (Value::Text(s), w) if w.is_textual() => Value::Text(s),
            (v @ (Value::Bool(_)
            | Value::Int16(_)
            | Value::Int32(_)
            | Value::Int64(_)
            | Value::Float32(_)
            | Value::Float64(_)
            | Value::Uuid(_)
            | Value::Date(_)
            | Value::Timestamp(_)
            | Value::TimestampTz(_)), w)
                if w.is_textual() =>
            {
                Value::Text(v.to_string())
            }
            (Value::Json(j), w) if w.is_textual() => Value::Text(j.to_string()),

            (Value::Bytes(b), WireType::Bytea) => Value::Bytes(b),

            (Value::Uuid(u), WireType::Uuid) => Value::Uuid(u),
            (Value::Text(s), WireType::Uuid) => {
                Value::Uuid(Uuid::parse_str(&s).map_err(|_| mismatch(&Value::Text(s.clone())))?)
            }

            (Value::Json(j), WireType::Json | WireType::Jsonb) => Value::Json(j),
            (Value::Text(s), WireType::Json | WireType::Jsonb) => {
                let parsed = serde_json::from_str(&s).map_err(|_| mismatch(&Value::Text(s.clone())))?;
                Value::Json(parsed)
            }

            (Value::Date(d), WireType::Date) => Value::Date(d),
            (Value::Timestamp(t), WireType::Timestamp) => Value::Timestamp(t),
            (Value::Timestamp(t), WireType::TimestampTz) => Value::TimestampTz(t.and_utc()),
            (Value::TimestampTz(t), WireType::TimestampTz) => Value::TimestampTz(t),
            (Value::TimestampTz(t), WireType::Timestamp) => Value::Timestamp(t.naive_utc()),

            (v, _) => return Err(mismatch(&v)),
        };
        Ok(coerced)
    }

    /// Box the value as a `postgres` parameter of type `wire`.
    ///
    /// The value must already be coerced; NULLs are typed after the column
    /// so the binary encoder accepts them.
    pub(crate) fn to_param(&self, wire: WireType) -> Result<Box<dyn ToSql + Sync>, BulkError> {
        let param: Box<dyn ToSql + Sync> = match (self, wire) {
            (Value::Null, w) => null_param(w),
            (Value::Bool(v), WireType::Bool) => Box::new(*v),
            (Value::Int16(v), WireType::Int2) => Box::new(*v),
            (Value::Int32(v), WireType::Int4) => Box::new(*v),
            (Value::Int64(v), WireType::Int8) => Box::new(*v),
            (Value::Float32(v), WireType::Float4) => Box::new(*v),
            (Value::Float64(v), WireType::Float8) => Box::new(*v),
            (Value::Text(v), w) if w.is_textual() => Box::new(v.clone()),
            (Value::Bytes(v), WireType::Bytea) => Box::new(v.clone()),
            (Value::Uuid(v), WireType::Uuid) => Box::new(*v),
            (Value::Json(v), WireType::Json | WireType::Jsonb) => Box::new(v.clone()),
            (Value::Date(v), WireType::Date) => Box::new(*v),
            (Value::Timestamp(v), WireType::Timestamp) => Box::new(*v),
            (Value::TimestampTz(v), WireType::TimestampTz) => Box::new(*v),
            (v, w) => {
                return Err(BulkError::Internal(format!(
                    "uncoerced {} value reached the {w} encoder",
                    v.type_name()
                )));
            }
        };
        Ok(param)
    }

    /// Read column `idx` of a result row.
    pub fn from_row(row: &Row, idx: usize) -> Result<Value, BulkError> {
        let ty = row
            .columns()
            .get(idx)
            .map(|c| c.type_().clone())
            .ok_or_else(|| BulkError::Internal(format!("result column {idx} out of range")))?;
        let read_err = |e: postgres::Error| BulkError::Connection(e.to_string());

        macro_rules! read {
            ($t:ty, $variant:expr) => {
                row.try_get::<_, Option<$t>>(idx)
                    .map_err(read_err)?
                    .map($variant)
                    .unwrap_or(Value::Null)
            };
        }

        let wire = WireType::from_type_name(ty.name()).ok_or_else(|| {
            BulkError::Internal(format!("unsupported result column type {ty}"))
        })?;
        let value = match wire {
            WireType::Bool => read!(bool, Value::Bool),
            WireType::Int2 => read!(i16, Value::Int16),
            WireType::Int4 => read!(i32, Value::Int32),
            WireType::Int8 => read!(i64, Value::Int64),
            WireType::Float4 => read!(f32, Value::Float32),
            WireType::Float8 => read!(f64, Value::Float64),
            WireType::Text | WireType::Varchar | WireType::Bpchar => read!(String, Value::Text),
            WireType::Bytea => read!(Vec<u8>, Value::Bytes),
            WireType::Uuid => read!(Uuid, Value::Uuid),
            WireType::Json | WireType::Jsonb => read!(serde_json::Value, Value::Json),
            WireType::Date => read!(NaiveDate, Value::Date),
            WireType::Timestamp => read!(NaiveDateTime, Value::Timestamp),
            WireType::TimestampTz => read!(DateTime<Utc>, Value::TimestampTz),
        };
        Ok(value)
    }
}

fn null_param(wire: WireType) -> Box<dyn ToSql + Sync> {
    match wire {
        WireType::Bool => Box::new(None::<bool>),
        WireType::Int2 => Box::new(None::<i16>),
        WireType::Int4 => Box::new(None::<i32>),
        WireType::Int8 => Box::new(None::<i64>),
        WireType::Float4 => Box::new(None::<f32>),
        WireType::Float8 => Box::new(None::<f64>),
        WireType::Text | WireType::Varchar | WireType::Bpchar => Box::new(None::<String>),
        WireType::Bytea => Box::new(None::<Vec<u8>>),
        WireType::Uuid => Box::new(None::<Uuid>),
        WireType::Json | WireType::Jsonb => Box::new(None::<serde_json::Value>),
        WireType::Date => Box::new(None::<NaiveDate>),
        WireType::Timestamp => Box::new(None::<NaiveDateTime>),
        WireType::TimestampTz => Box::new(None::<DateTime<Utc>>),
    }
}

/// Read every column of a `postgres` row, for cursor-backed sources.
pub fn row_values(row: &Row) -> Result<Vec<Value>, BulkError> {
    (0..row.len()).map(|idx| Value::from_row(row, idx)).collect()
}

/// Describe the columns of a `postgres` row as fields.
pub fn row_fields(row: &Row) -> Vec<Field> {
    row.columns()
        .iter()
        .map(|c| match WireType::from_type_name(c.type_().name()) {
            Some(wire) => Field::typed(c.name(), wire),
            None => Field::new(c.name()),
        })
        .collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float32(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Bytes(v) => {
                write!(f, "\\x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            Value::Uuid(v) => write!(f, "{v}"),
            Value::Json(v) => write!(f, "{v}"),
            Value::Date(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
            Value::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Enum { name, .. } => write!(f, "{name}"),
        }
    }
}

macro_rules! impl_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_from!(bool, Bool);
impl_from!(i16, Int16);
impl_from!(i32, Int32);
impl_from!(i64, Int64);
impl_from!(f32, Float32);
impl_from!(f64, Float64);
impl_from!(String, Text);
impl_from!(Vec<u8>, Bytes);
impl_from!(Uuid, Uuid);
impl_from!(serde_json::Value, Json);
impl_from!(NaiveDate, Date);
impl_from!(NaiveDateTime, Timestamp);
impl_from!(DateTime<Utc>, TimestampTz);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
