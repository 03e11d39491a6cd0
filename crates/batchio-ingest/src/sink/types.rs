//! Column types and typed values

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use std::str::FromStr;

use super::SinkError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// SQL column type, identified by its JDBC type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum SqlType {
    Varchar,
    Char,
    Numeric,
    Decimal,
    Integer,
    SmallInt,
    BigInt,
    Real,
    Float,
    Double,
    Date,
    Time,
    Timestamp,
    /// A code with no conversion; writes to such a column fail
    Other(i32),
}

impl SqlType {
    pub fn code(self) -> i32 {
        match self {
            SqlType::Varchar => 12,
            SqlType::Char => 1,
            SqlType::Numeric => 2,
            SqlType::Decimal => 3,
            SqlType::Integer => 4,
            SqlType::SmallInt => 5,
            SqlType::BigInt => -5,
            SqlType::Real => 7,
            SqlType::Float => 6,
            SqlType::Double => 8,
            SqlType::Date => 91,
            SqlType::Time => 92,
            SqlType::Timestamp => 93,
            SqlType::Other(code) => code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            12 => SqlType::Varchar,
            1 => SqlType::Char,
            2 => SqlType::Numeric,
            3 => SqlType::Decimal,
            4 => SqlType::Integer,
            5 => SqlType::SmallInt,
            -5 => SqlType::BigInt,
            7 => SqlType::Real,
            6 => SqlType::Float,
            8 => SqlType::Double,
            91 => SqlType::Date,
            92 => SqlType::Time,
            93 => SqlType::Timestamp,
            other => SqlType::Other(other),
        }
    }

    /// Parse a comma-joined list of codes or names. Blank input is an empty list.
    pub fn parse_list(raw: &str) -> Result<Vec<SqlType>, SinkError> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        raw.split(',').map(str::parse).collect()
    }

    pub fn join_codes(types: &[SqlType]) -> String {
        types
            .iter()
            .map(|t| t.code().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Convert one token to a bindable value for a column of this type
    pub fn parse_value(self, token: &str, column: usize) -> Result<SqlValue, SinkError> {
        let invalid = |reason: String| SinkError::InvalidValue {
            column,
            sql_type: self,
            value: token.to_string(),
            reason,
        };

        let value = match self {
            SqlType::Varchar | SqlType::Char => SqlValue::Text(token.to_string()),
            SqlType::Numeric | SqlType::Decimal => {
                SqlValue::Decimal(BigDecimal::from_str(token).map_err(|e| invalid(e.to_string()))?)
            },
            SqlType::SmallInt => SqlValue::SmallInt(token.parse().map_err(|e| invalid(format!("{}", e)))?),
            SqlType::Integer => SqlValue::Integer(token.parse().map_err(|e| invalid(format!("{}", e)))?),
            SqlType::BigInt => SqlValue::BigInt(token.parse().map_err(|e| invalid(format!("{}", e)))?),
            SqlType::Real | SqlType::Float => {
                SqlValue::Real(token.parse().map_err(|e| invalid(format!("{}", e)))?)
            },
            SqlType::Double => SqlValue::Double(token.parse().map_err(|e| invalid(format!("{}", e)))?),
            SqlType::Date => SqlValue::Date(
                NaiveDate::parse_from_str(token, DATE_FORMAT).map_err(|e| invalid(e.to_string()))?,
            ),
            SqlType::Time => SqlValue::Time(
                NaiveTime::parse_from_str(token, TIME_FORMAT).map_err(|e| invalid(e.to_string()))?,
            ),
            SqlType::Timestamp => SqlValue::Timestamp(
                NaiveDateTime::parse_from_str(token, TIMESTAMP_FORMAT)
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            SqlType::Other(_) => {
                return Err(SinkError::TypeNotImplemented {
                    column,
                    sql_type: self,
                })
            },
        };
        Ok(value)
    }

    pub fn is_supported(self) -> bool {
        !matches!(self, SqlType::Other(_))
    }

    /// Map an `information_schema.columns.data_type` value
    pub fn from_pg_data_type(data_type: &str) -> Self {
        match data_type.to_lowercase().as_str() {
            "character varying" | "varchar" | "text" => SqlType::Varchar,
            "character" | "char" | "bpchar" => SqlType::Char,
            "numeric" | "decimal" => SqlType::Numeric,
            "integer" | "int" | "int4" => SqlType::Integer,
            "smallint" | "int2" => SqlType::SmallInt,
            "bigint" | "int8" => SqlType::BigInt,
            "real" | "float4" => SqlType::Real,
            "double precision" | "float8" => SqlType::Double,
            "date" => SqlType::Date,
            "time without time zone" | "time" => SqlType::Time,
            "timestamp without time zone" | "timestamp" => SqlType::Timestamp,
            "timestamp with time zone" | "timestamptz" => SqlType::Timestamp,
            "boolean" | "bool" => SqlType::Other(16),
            "bytea" => SqlType::Other(-2),
            _ => SqlType::Other(1111),
        }
    }
}

impl From<i32> for SqlType {
    fn from(code: i32) -> Self {
        SqlType::from_code(code)
    }
}

impl From<SqlType> for i32 {
    fn from(sql_type: SqlType) -> Self {
        sql_type.code()
    }
}

impl FromStr for SqlType {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<i32>() {
            return Ok(SqlType::from_code(code));
        }
        match s.to_uppercase().as_str() {
            "VARCHAR" => Ok(SqlType::Varchar),
            "CHAR" => Ok(SqlType::Char),
            "NUMERIC" => Ok(SqlType::Numeric),
            "DECIMAL" => Ok(SqlType::Decimal),
            "INTEGER" | "INT" => Ok(SqlType::Integer),
            "SMALLINT" => Ok(SqlType::SmallInt),
            "BIGINT" => Ok(SqlType::BigInt),
            "REAL" => Ok(SqlType::Real),
            "FLOAT" => Ok(SqlType::Float),
            "DOUBLE" => Ok(SqlType::Double),
            "DATE" => Ok(SqlType::Date),
            "TIME" => Ok(SqlType::Time),
            "TIMESTAMP" => Ok(SqlType::Timestamp),
            other => Err(SinkError::Config(format!("Unknown SQL type: '{}'", other))),
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SqlType::Varchar => "VARCHAR",
            SqlType::Char => "CHAR",
            SqlType::Numeric => "NUMERIC",
            SqlType::Decimal => "DECIMAL",
            SqlType::Integer => "INTEGER",
            SqlType::SmallInt => "SMALLINT",
            SqlType::BigInt => "BIGINT",
            SqlType::Real => "REAL",
            SqlType::Float => "FLOAT",
            SqlType::Double => "DOUBLE",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Other(code) => return write!(f, "{}", code),
        };
        f.write_str(name)
    }
}

/// A typed parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Decimal(BigDecimal),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for code in [12, 1, 2, 3, 4, 5, -5, 7, 6, 8, 91, 92, 93, 2004] {
            assert_eq!(SqlType::from_code(code).code(), code);
        }
        assert_eq!(SqlType::from_code(2004), SqlType::Other(2004));
    }

    #[test]
    fn test_parse_list_accepts_codes_and_names() {
        let types = SqlType::parse_list("4, varchar,93,-5").unwrap();
        assert_eq!(
            types,
            vec![SqlType::Integer, SqlType::Varchar, SqlType::Timestamp, SqlType::BigInt]
        );
        assert_eq!(SqlType::join_codes(&types), "4,12,93,-5");
        assert!(SqlType::parse_list("").unwrap().is_empty());
        assert!(SqlType::parse_list("4,blob").is_err());
    }

    #[test]
    fn test_dispatch_table() {
        let cases = [
            (SqlType::Varchar, "hello", SqlValue::Text("hello".into())),
            (SqlType::Char, " x ", SqlValue::Text(" x ".into())),
            (SqlType::Numeric, "12.50", SqlValue::Decimal(BigDecimal::from_str("12.50").unwrap())),
            (SqlType::SmallInt, "-7", SqlValue::SmallInt(-7)),
            (SqlType::Integer, "42", SqlValue::Integer(42)),
            (SqlType::BigInt, "9000000000", SqlValue::BigInt(9_000_000_000)),
            (SqlType::Real, "1.5", SqlValue::Real(1.5)),
            (SqlType::Float, "2.25", SqlValue::Real(2.25)),
            (SqlType::Double, "0.125", SqlValue::Double(0.125)),
            (
                SqlType::Date,
                "2024-02-29",
                SqlValue::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
            ),
            (
                SqlType::Time,
                "23:59:01",
                SqlValue::Time(NaiveTime::from_hms_opt(23, 59, 1).unwrap()),
            ),
        ];

        for (sql_type, token, expected) in cases {
            assert_eq!(sql_type.parse_value(token, 0).unwrap(), expected, "{}", sql_type);
        }
    }

    #[test]
    fn test_timestamps_with_and_without_fraction() {
        let whole = SqlType::Timestamp.parse_value("2024-01-02 03:04:05", 0).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(whole, SqlValue::Timestamp(expected));

        let fraction = SqlType::Timestamp.parse_value("2024-01-02 03:04:05.250", 0).unwrap();
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_milli_opt(3, 4, 5, 250)
            .unwrap();
        assert_eq!(fraction, SqlValue::Timestamp(expected));
    }

    #[test]
    fn test_bad_tokens_are_invalid_values() {
        let err = SqlType::Integer.parse_value(" 42", 3).unwrap_err();
        assert!(matches!(err, SinkError::InvalidValue { column: 3, .. }));

        assert!(SqlType::SmallInt.parse_value("70000", 0).is_err());
        assert!(SqlType::Date.parse_value("02/29/2024", 0).is_err());
    }

    #[test]
    fn test_unsupported_type() {
        let err = SqlType::Other(2004).parse_value("x", 1).unwrap_err();
        assert!(matches!(
            err,
            SinkError::TypeNotImplemented {
                column: 1,
                sql_type: SqlType::Other(2004)
            }
        ));
        assert!(!SqlType::Other(16).is_supported());
    }

    #[test]
    fn test_postgres_type_names() {
        assert_eq!(SqlType::from_pg_data_type("character varying"), SqlType::Varchar);
        assert_eq!(SqlType::from_pg_data_type("integer"), SqlType::Integer);
        assert_eq!(SqlType::from_pg_data_type("timestamp without time zone"), SqlType::Timestamp);
        assert_eq!(SqlType::from_pg_data_type("double precision"), SqlType::Double);
        assert_eq!(SqlType::from_pg_data_type("jsonb"), SqlType::Other(1111));
    }
}
