use std::{
    error::Error,
    fmt::Display,
    hash::{Hash, Hasher},
    num::{ParseFloatError, ParseIntError, TryFromIntError},
    str::{from_utf8, FromStr, Utf8Error},
};

use bytes::BytesMut;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use mysql_async::Value as MysqlValue;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::Serialize;
use thiserror::Error;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

use crate::table::ColumnType;

pub type JsonValue = serde_json::Value;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum CellConversionError {
    #[error("value {value} cannot be read as {column_type:?}")]
    Incompatible {
        column_type: ColumnType,
        value: String,
    },

    #[error("invalid string value")]
    InvalidStr(#[from] Utf8Error),

    #[error("invalid int value")]
    InvalidInt(#[from] ParseIntError),

    #[error("int value out of range")]
    IntOutOfRange(#[from] TryFromIntError),

    #[error("invalid float value")]
    InvalidFloat(#[from] ParseFloatError),

    #[error("invalid decimal value")]
    InvalidDecimal(#[from] rust_decimal::Error),

    #[error("invalid date or timestamp value")]
    InvalidTimestamp(#[from] chrono::ParseError),
}

/// A single typed column value of a captured row.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    I64(i64),
    Decimal(Decimal),
    F64(f64),
    String(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    fn incompatible(column_type: ColumnType, value: impl std::fmt::Debug) -> CellConversionError {
        CellConversionError::Incompatible {
            column_type,
            value: format!("{value:?}"),
        }
    }

    /// Reads a value returned by the MySQL text or binary protocol.
    pub fn from_mysql(value: MysqlValue, typ: ColumnType) -> Result<Cell, CellConversionError> {
        let bytes = match value {
            MysqlValue::NULL => return Ok(Cell::Null),
            MysqlValue::Bytes(bytes) => bytes,
            MysqlValue::Int(v) => return Self::from_i64(v, typ),
            MysqlValue::UInt(v) => return Self::from_i64(i64::try_from(v)?, typ),
            MysqlValue::Float(v) => return Self::from_f64(v as f64, typ),
            MysqlValue::Double(v) => return Self::from_f64(v, typ),
            MysqlValue::Date(year, month, day, hour, minute, second, micros) => {
                let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or_else(|| Self::incompatible(typ, (year, month, day)))?;
                return match typ {
                    ColumnType::Date => Ok(Cell::Date(date)),
                    ColumnType::DateTime => date
                        .and_hms_micro_opt(hour as u32, minute as u32, second as u32, micros)
                        .map(Cell::DateTime)
                        .ok_or_else(|| Self::incompatible(typ, (hour, minute, second, micros))),
                    _ => Err(Self::incompatible(typ, date)),
                };
            }
            time @ MysqlValue::Time(..) => return Err(Self::incompatible(typ, time)),
        };
        Self::parse_text(from_utf8(&bytes)?, typ)
    }

    /// Reads a value out of the JSON row image written by the audit trigger.
    pub fn from_json(value: JsonValue, typ: ColumnType) -> Result<Cell, CellConversionError> {
        match value {
            JsonValue::Null => Ok(Cell::Null),
            JsonValue::Bool(v) if typ == ColumnType::Bool => Ok(Cell::Bool(v)),
            JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(v), _) => Self::from_i64(v, typ),
                (None, _) if typ == ColumnType::Decimal => {
                    Ok(Cell::Decimal(Decimal::from_str(&n.to_string())?))
                }
                (None, Some(v)) => Self::from_f64(v, typ),
                (None, None) => Err(Self::incompatible(typ, n)),
            },
            JsonValue::String(s) => Self::parse_text(&s, typ),
            other => Err(Self::incompatible(typ, other)),
        }
    }

    /// Parses a value from its textual form according to the declared type.
    pub fn parse_text(s: &str, typ: ColumnType) -> Result<Cell, CellConversionError> {
        Ok(match typ {
            ColumnType::Bool => match s {
                "1" | "t" | "true" => Cell::Bool(true),
                "0" | "f" | "false" => Cell::Bool(false),
                other => return Err(Self::incompatible(typ, other)),
            },
            ColumnType::Int | ColumnType::BigInt => Cell::I64(s.parse()?),
            ColumnType::Decimal => Cell::Decimal(Decimal::from_str(s)?),
            ColumnType::Double => Cell::F64(s.parse()?),
            ColumnType::Text => Cell::String(s.to_string()),
            ColumnType::Date => Cell::Date(NaiveDate::parse_from_str(s, DATE_FORMAT)?),
            ColumnType::DateTime => {
                Cell::DateTime(NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)?)
            }
        })
    }

    /// The value as a MySQL query parameter.
    pub fn to_mysql(&self) -> MysqlValue {
        match self {
            Cell::Null => MysqlValue::NULL,
            Cell::Bool(v) => MysqlValue::Int(i64::from(*v)),
            Cell::I64(v) => MysqlValue::Int(*v),
            Cell::Decimal(v) => MysqlValue::Bytes(v.to_string().into_bytes()),
            Cell::F64(v) => MysqlValue::Double(*v),
            Cell::String(v) => MysqlValue::Bytes(v.clone().into_bytes()),
            Cell::Date(v) => {
                MysqlValue::Date(v.year() as u16, v.month() as u8, v.day() as u8, 0, 0, 0, 0)
            }
            Cell::DateTime(v) => MysqlValue::Date(
                v.year() as u16,
                v.month() as u8,
                v.day() as u8,
                v.hour() as u8,
                v.minute() as u8,
                v.second() as u8,
                v.nanosecond() / 1_000,
            ),
        }
    }

    fn from_i64(v: i64, typ: ColumnType) -> Result<Cell, CellConversionError> {
        match typ {
            ColumnType::Bool => Ok(Cell::Bool(v != 0)),
            ColumnType::Int | ColumnType::BigInt => Ok(Cell::I64(v)),
            ColumnType::Decimal => Ok(Cell::Decimal(Decimal::from(v))),
            ColumnType::Double => Ok(Cell::F64(v as f64)),
            ColumnType::Text => Ok(Cell::String(v.to_string())),
            _ => Err(Self::incompatible(typ, v)),
        }
    }

    fn from_f64(v: f64, typ: ColumnType) -> Result<Cell, CellConversionError> {
        match typ {
            ColumnType::Double => Ok(Cell::F64(v)),
            ColumnType::Decimal => Decimal::from_f64_retain(v)
                .map(Cell::Decimal)
                .ok_or_else(|| Self::incompatible(typ, v)),
            _ => Err(Self::incompatible(typ, v)),
        }
    }

    /// Interprets an untyped configuration literal: `null`, booleans, integers,
    /// decimals, and anything else as text.
    pub fn parse_literal(s: &str) -> Cell {
        if s.eq_ignore_ascii_case("null") {
            return Cell::Null;
        }
        if let Ok(v) = s.parse::<bool>() {
            return Cell::Bool(v);
        }
        if let Ok(v) = s.parse::<i64>() {
            return Cell::I64(v);
        }
        if let Ok(v) = Decimal::from_str(s) {
            return Cell::Decimal(v);
        }
        Cell::String(s.to_string())
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Bool(a), Cell::Bool(b)) => a == b,
            (Cell::I64(a), Cell::I64(b)) => a == b,
            (Cell::Decimal(a), Cell::Decimal(b)) => a == b,
            (Cell::F64(a), Cell::F64(b)) => a.to_bits() == b.to_bits(),
            (Cell::String(a), Cell::String(b)) => a == b,
            (Cell::Date(a), Cell::Date(b)) => a == b,
            (Cell::DateTime(a), Cell::DateTime(b)) => a == b,
            _ => false,
        }
    }
}

// Floats compare by bit pattern above, which keeps Eq reflexive.
impl Eq for Cell {}

impl Hash for Cell {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Cell::Null => {}
            Cell::Bool(v) => v.hash(state),
            Cell::I64(v) => v.hash(state),
            Cell::Decimal(v) => v.hash(state),
            Cell::F64(v) => v.to_bits().hash(state),
            Cell::String(v) => v.hash(state),
            Cell::Date(v) => v.hash(state),
            Cell::DateTime(v) => v.hash(state),
        }
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Null => write!(f, "NULL"),
            Cell::Bool(v) => write!(f, "{v}"),
            Cell::I64(v) => write!(f, "{v}"),
            Cell::Decimal(v) => write!(f, "{v}"),
            Cell::F64(v) => write!(f, "{v}"),
            Cell::String(v) => write!(f, "{v:?}"),
            Cell::Date(v) => write!(f, "{v}"),
            Cell::DateTime(v) => write!(f, "{v}"),
        }
    }
}

impl ToSql for Cell {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Cell::Null => Ok(IsNull::Yes),
            Cell::Bool(v) => v.to_sql_checked(ty, out),
            Cell::I64(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql_checked(ty, out),
                Type::NUMERIC => Decimal::from(*v).to_sql_checked(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Cell::Decimal(v) => match *ty {
                Type::FLOAT8 => v
                    .to_f64()
                    .ok_or_else(|| format!("decimal {v} does not fit a double"))?
                    .to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Cell::F64(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql_checked(ty, out),
                _ => v.to_sql_checked(ty, out),
            },
            Cell::String(v) => v.to_sql_checked(ty, out),
            Cell::Date(v) => v.to_sql_checked(ty, out),
            Cell::DateTime(v) => v.to_sql_checked(ty, out),
        }
    }

    // The concrete check happens per variant in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;

    #[test]
    fn decimal_keeps_exact_text() {
        let cell = Cell::from_json(json!("15.00"), ColumnType::Decimal).unwrap();
        assert_eq!(cell, Cell::Decimal(Decimal::new(1500, 2)));
        assert_eq!(cell.to_string(), "15.00");
    }

    #[test]
    fn null_amount_is_not_zero() {
        let cell = Cell::from_json(JsonValue::Null, ColumnType::Decimal).unwrap();
        assert!(cell.is_null());
        let cell = Cell::from_mysql(MysqlValue::NULL, ColumnType::Decimal).unwrap();
        assert!(cell.is_null());
    }

    #[test]
    fn key_cells_become_mysql_parameters() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 5, 250)
            .unwrap();
        for cell in [
            Cell::I64(7),
            Cell::String("A-1".to_string()),
            Cell::Decimal(Decimal::new(1050, 2)),
            Cell::DateTime(at),
        ] {
            let typ = match cell {
                Cell::I64(_) => ColumnType::BigInt,
                Cell::String(_) => ColumnType::Text,
                Cell::Decimal(_) => ColumnType::Decimal,
                _ => ColumnType::DateTime,
            };
            assert_eq!(Cell::from_mysql(cell.to_mysql(), typ).unwrap(), cell);
        }
        assert_eq!(Cell::Null.to_mysql(), MysqlValue::NULL);
    }

    #[test]
    fn reads_mysql_protocol_values() {
        assert_eq!(
            Cell::from_mysql(MysqlValue::Bytes(b"42".to_vec()), ColumnType::Int).unwrap(),
            Cell::I64(42)
        );
        assert_eq!(
            Cell::from_mysql(MysqlValue::Int(1), ColumnType::Bool).unwrap(),
            Cell::Bool(true)
        );
        assert_eq!(
            Cell::from_mysql(MysqlValue::Bytes(b"10.50".to_vec()), ColumnType::Decimal)
                .unwrap(),
            Cell::Decimal(Decimal::new(1050, 2))
        );
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();
        assert_eq!(
            Cell::from_mysql(
                MysqlValue::Date(2024, 3, 1, 12, 30, 5, 0),
                ColumnType::DateTime
            )
            .unwrap(),
            Cell::DateTime(expected)
        );
        assert_eq!(
            Cell::from_mysql(
                MysqlValue::Bytes(b"2024-03-01 12:30:05".to_vec()),
                ColumnType::DateTime
            )
            .unwrap(),
            Cell::DateTime(expected)
        );
    }

    #[test]
    fn rejects_incompatible_values() {
        assert!(Cell::from_json(json!("abc"), ColumnType::Int).is_err());
        assert!(Cell::from_json(json!([1, 2]), ColumnType::Text).is_err());
        assert!(Cell::from_mysql(MysqlValue::Double(1.5), ColumnType::Date).is_err());
    }

    #[test]
    fn literals() {
        assert_eq!(Cell::parse_literal("3"), Cell::I64(3));
        assert_eq!(Cell::parse_literal("true"), Cell::Bool(true));
        assert_eq!(Cell::parse_literal("1.25"), Cell::Decimal(Decimal::new(125, 2)));
        assert_eq!(Cell::parse_literal("NULL"), Cell::Null);
        assert_eq!(
            Cell::parse_literal("eu-west"),
            Cell::String("eu-west".to_string())
        );
    }

    #[test]
    fn cells_hash_as_keys() {
        let mut set = HashSet::new();
        set.insert(Cell::I64(1));
        set.insert(Cell::I64(1));
        set.insert(Cell::F64(f64::NAN));
        set.insert(Cell::F64(f64::NAN));
        set.insert(Cell::String("1".to_string()));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn narrows_integers_for_target_type() {
        let mut out = BytesMut::new();
        Cell::I64(7).to_sql_checked(&Type::INT4, &mut out).unwrap();
        assert_eq!(&out[..], &7i32.to_be_bytes());

        let mut out = BytesMut::new();
        assert!(Cell::I64(i64::MAX)
            .to_sql_checked(&Type::INT4, &mut out)
            .is_err());
    }

    #[test]
    fn wrong_target_type_is_an_error() {
        let mut out = BytesMut::new();
        assert!(Cell::String("x".to_string())
            .to_sql_checked(&Type::INT4, &mut out)
            .is_err());
        let mut out = BytesMut::new();
        assert!(matches!(
            Cell::Null.to_sql_checked(&Type::NUMERIC, &mut out),
            Ok(IsNull::Yes)
        ));
    }
}
