//! dynamic value model and the builtin codecs.
//!
//! Application data crosses the driver boundary as [`Value`], a tagged union
//! wide enough for every type the builtin adapters understand. Each codec
//! module registers its dumpers and loaders into the default adapters map
//! built by [`default_adapters`].

pub mod registry;

mod array;
mod boolean;
mod datetime;
mod enums;
mod hstore;
mod json;
mod net;
mod numeric;
mod range;
mod record;
mod string;
mod uuid;

use std::net::IpAddr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;

use super::adapt::AdaptersMap;

pub use self::hstore::register_hstore;
pub use self::{
    enums::register_enum,
    range::register_range,
    record::register_composite,
};

/// a PostgreSQL interval, kept in the three fields the backend itself uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// a network address with an optional netmask, for `inet` and `cidr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inet {
    pub addr: IpAddr,
    pub prefix: Option<u8>,
}

/// a value of a user defined enum type, identified by the type name the
/// matching [`registry::TypeInfo`] was registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub type_name: String,
    pub label: String,
}

/// one range of any subtype. `empty` ranges carry no bounds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RangeValue {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
    pub lower_inc: bool,
    pub upper_inc: bool,
    pub empty: bool,
}

impl RangeValue {
    pub fn empty() -> Self {
        Self {
            empty: true,
            ..Self::default()
        }
    }

    /// the usual `[lower, upper)` range.
    pub fn new(lower: Option<Value>, upper: Option<Value>) -> Self {
        Self {
            lower,
            upper,
            lower_inc: true,
            upper_inc: false,
            empty: false,
        }
    }
}

/// dynamic application value, the unit of the adaptation registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(::uuid::Uuid),
    Json(JsonValue),
    Jsonb(JsonValue),
    Date(NaiveDate),
    Time(NaiveTime),
    TimeTz(NaiveTime, FixedOffset),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Interval(Interval),
    Inet(Inet),
    Cidr(Inet),
    Enum(EnumValue),
    Array(Vec<Value>),
    Range(Box<RangeValue>),
    Multirange(Vec<RangeValue>),
    Composite(Vec<Value>),
    Hstore(Vec<(String, Option<String>)>),
}

/// discriminant of [`Value`], the dispatch key of the dumper registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Json,
    Jsonb,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Interval,
    Inet,
    Cidr,
    Enum,
    Array,
    Range,
    Multirange,
    Composite,
    Hstore,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::SmallInt(_) => ValueKind::SmallInt,
            Value::Int(_) => ValueKind::Int,
            Value::BigInt(_) => ValueKind::BigInt,
            Value::Float4(_) => ValueKind::Float4,
            Value::Float8(_) => ValueKind::Float8,
            Value::Numeric(_) => ValueKind::Numeric,
            Value::Text(_) => ValueKind::Text,
            Value::Bytea(_) => ValueKind::Bytea,
            Value::Uuid(_) => ValueKind::Uuid,
            Value::Json(_) => ValueKind::Json,
            Value::Jsonb(_) => ValueKind::Jsonb,
            Value::Date(_) => ValueKind::Date,
            Value::Time(_) => ValueKind::Time,
            Value::TimeTz(..) => ValueKind::TimeTz,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::TimestampTz(_) => ValueKind::TimestampTz,
            Value::Interval(_) => ValueKind::Interval,
            Value::Inet(_) => ValueKind::Inet,
            Value::Cidr(_) => ValueKind::Cidr,
            Value::Enum(_) => ValueKind::Enum,
            Value::Array(_) => ValueKind::Array,
            Value::Range(_) => ValueKind::Range,
            Value::Multirange(_) => ValueKind::Multirange,
            Value::Composite(_) => ValueKind::Composite,
            Value::Hstore(_) => ValueKind::Hstore,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// magnitude of an integral value, when it is one.
    pub(crate) fn as_int(&self) -> Option<i64> {
        match *self {
            Value::SmallInt(v) => Some(v as i64),
            Value::Int(v) => Some(v as i64),
            Value::BigInt(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f32 => Float4,
    f64 => Float8,
    Decimal => Numeric,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    ::uuid::Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    Interval => Interval,
    Inet => Inet,
}

impl From<JsonValue> for Value {
    fn from(v: JsonValue) -> Self {
        Value::Jsonb(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// build an array value from anything convertible element wise.
pub fn array<I, V>(values: I) -> Value
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Value::Array(values.into_iter().map(Into::into).collect())
}

/// build the adapters map every connection starts from.
pub(crate) fn default_adapters() -> AdaptersMap {
    let mut map = AdaptersMap::new();
    registry::seed_builtin_types(map.types_mut());
    boolean::register_default(&mut map);
    numeric::register_default(&mut map);
    string::register_default(&mut map);
    json::register_default(&mut map);
    datetime::register_default(&mut map);
    net::register_default(&mut map);
    uuid::register_default(&mut map);
    array::register_default(&mut map);
    range::register_default(&mut map);
    record::register_default(&mut map);
    enums::register_default(&mut map);
    map
}
