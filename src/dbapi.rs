//! DB-API flavored module surface.
//!
//! The constants, singleton type objects and value constructors that
//! database API compatibility layers expect to find next to `connect()`.

use chrono::{NaiveDate, NaiveTime};
use postgres_types::{Oid, Type};

use super::{errors::Error, types::Value};

pub const APILEVEL: &str = "2.0";
/// threads may share the module and connections, not cursors.
pub const THREADSAFETY: u8 = 2;
pub const PARAMSTYLE: &str = "pyformat";

/// a singleton describing a family of column types, comparable against the
/// `type_code` of a result column.
#[derive(Debug, Clone, Copy)]
pub struct TypeObject {
    name: &'static str,
    oids: &'static [Oid],
}

impl TypeObject {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, oid: Oid) -> bool {
        self.oids.contains(&oid)
    }
}

impl PartialEq<Oid> for TypeObject {
    fn eq(&self, other: &Oid) -> bool {
        self.matches(*other)
    }
}

macro_rules! oids {
    ($($ty:ident),* $(,)?) => {
        &[$(Type::$ty.oid()),*]
    };
}

pub fn string_type() -> TypeObject {
    TypeObject {
        name: "STRING",
        oids: oids_string(),
    }
}

pub fn binary_type() -> TypeObject {
    TypeObject {
        name: "BINARY",
        oids: oids_binary(),
    }
}

pub fn number_type() -> TypeObject {
    TypeObject {
        name: "NUMBER",
        oids: oids_number(),
    }
}

pub fn datetime_type() -> TypeObject {
    TypeObject {
        name: "DATETIME",
        oids: oids_datetime(),
    }
}

pub fn rowid_type() -> TypeObject {
    TypeObject {
        name: "ROWID",
        oids: oids_rowid(),
    }
}

fn oids_string() -> &'static [Oid] {
    static CELL: std::sync::OnceLock<Vec<Oid>> = std::sync::OnceLock::new();
    CELL.get_or_init(|| oids![TEXT, VARCHAR, BPCHAR, NAME, CHAR].to_vec())
}

fn oids_binary() -> &'static [Oid] {
    static CELL: std::sync::OnceLock<Vec<Oid>> = std::sync::OnceLock::new();
    CELL.get_or_init(|| oids![BYTEA].to_vec())
}

fn oids_number() -> &'static [Oid] {
    static CELL: std::sync::OnceLock<Vec<Oid>> = std::sync::OnceLock::new();
    CELL.get_or_init(|| oids![INT2, INT4, INT8, FLOAT4, FLOAT8, NUMERIC, OID].to_vec())
}

fn oids_datetime() -> &'static [Oid] {
    static CELL: std::sync::OnceLock<Vec<Oid>> = std::sync::OnceLock::new();
    CELL.get_or_init(|| oids![DATE, TIME, TIMETZ, TIMESTAMP, TIMESTAMPTZ, INTERVAL].to_vec())
}

fn oids_rowid() -> &'static [Oid] {
    static CELL: std::sync::OnceLock<Vec<Oid>> = std::sync::OnceLock::new();
    CELL.get_or_init(|| oids![OID].to_vec())
}

pub fn date(year: i32, month: u32, day: u32) -> Result<Value, Error> {
    NaiveDate::from_ymd_opt(year, month, day)
        .map(Value::Date)
        .ok_or_else(|| Error::data(format!("invalid date {year}-{month}-{day}")))
}

pub fn time(hour: u32, minute: u32, second: u32) -> Result<Value, Error> {
    NaiveTime::from_hms_opt(hour, minute, second)
        .map(Value::Time)
        .ok_or_else(|| Error::data(format!("invalid time {hour}:{minute}:{second}")))
}

pub fn timestamp(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Result<Value, Error> {
    let Value::Date(date) = date(year, month, day)? else { unreachable!() };
    date.and_hms_opt(hour, minute, second)
        .map(Value::Timestamp)
        .ok_or_else(|| Error::data(format!("invalid time {hour}:{minute}:{second}")))
}

pub fn date_from_ticks(ticks: i64) -> Result<Value, Error> {
    match timestamp_from_ticks(ticks)? {
        Value::Timestamp(ts) => Ok(Value::Date(ts.date())),
        _ => unreachable!(),
    }
}

pub fn time_from_ticks(ticks: i64) -> Result<Value, Error> {
    match timestamp_from_ticks(ticks)? {
        Value::Timestamp(ts) => Ok(Value::Time(ts.time())),
        _ => unreachable!(),
    }
}

pub fn timestamp_from_ticks(ticks: i64) -> Result<Value, Error> {
    chrono::DateTime::from_timestamp(ticks, 0)
        .map(|dt| Value::Timestamp(dt.naive_utc()))
        .ok_or_else(|| Error::data(format!("timestamp out of range: {ticks}")))
}

pub fn binary(data: impl Into<Vec<u8>>) -> Value {
    Value::Bytea(data.into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn type_objects_match_their_oids() {
        assert!(string_type() == Type::VARCHAR.oid());
        assert!(number_type() == Type::NUMERIC.oid());
        assert!(!number_type().matches(Type::TEXT.oid()));
        assert!(datetime_type() == Type::TIMESTAMPTZ.oid());
        assert!(rowid_type() == Type::OID.oid());
    }

    #[test]
    fn constructors_validate() {
        assert!(date(2024, 2, 30).is_err());
        assert!(time(25, 0, 0).is_err());
        assert!(matches!(date(2024, 2, 29), Ok(Value::Date(_))));
        assert!(matches!(
            timestamp_from_ticks(0),
            Ok(Value::Timestamp(ts)) if ts.date() == NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
        ));
        assert_eq!(binary(vec![1, 2]), Value::Bytea(vec![1, 2]));
    }
}
