//! adapters for the numeric types.
//!
//! Integers go through a dispatching dumper that picks the narrowest wire
//! type able to hold the value, so the server sees `int2`, `int4`, `int8`
//! or `numeric` depending on magnitude rather than on the Rust width the
//! caller happened to use.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use postgres_types::{Oid, Type};
use rust_decimal::Decimal;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, DumperKey, IntWidth, LoadContext, Loader, PyFormat},
    errors::Error,
    pq::Format,
    types::{Value, ValueKind},
};

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;

fn int_of(value: &Value) -> Result<i64, Error> {
    value
        .as_int()
        .ok_or_else(|| Error::programming(format!("integer dumper got a {:?} value", value.kind())))
}

fn width_of(n: i64) -> IntWidth {
    if (-(1 << 15)..1 << 15).contains(&n) {
        IntWidth::Int2
    } else if (-(1i64 << 31)..1i64 << 31).contains(&n) {
        IntWidth::Int4
    } else {
        IntWidth::Int8
    }
}

/// dispatcher registered for every integer kind; never dumps itself.
struct IntDumper;

impl Dumper for IntDumper {
    fn dump(&self, _value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        Err(Error::internal(
            "IntDumper is a dispatcher to other dumpers: dump is not supposed to be called",
        ))
    }

    fn key(&self, value: &Value, _format: PyFormat, _cx: &DumpContext<'_>) -> DumperKey {
        match value.as_int() {
            Some(n) => DumperKey::Width(width_of(n)),
            None => DumperKey::Plain(value.kind()),
        }
    }

    fn upgrade(
        &self,
        value: &Value,
        format: PyFormat,
        _cx: &DumpContext<'_>,
    ) -> Option<Arc<dyn Dumper>> {
        let n = value.as_int()?;
        let binary = format == PyFormat::Binary;
        Some(match (width_of(n), binary) {
            (IntWidth::Int2, false) => Arc::new(TextIntDumper(Type::INT2.oid())),
            (IntWidth::Int4, false) => Arc::new(TextIntDumper(Type::INT4.oid())),
            (IntWidth::Int8, false) | (IntWidth::Numeric, false) => {
                Arc::new(TextIntDumper(Type::INT8.oid()))
            }
            (IntWidth::Int2, true) => Arc::new(Int2BinaryDumper),
            (IntWidth::Int4, true) => Arc::new(Int4BinaryDumper),
            (IntWidth::Int8, true) | (IntWidth::Numeric, true) => Arc::new(Int8BinaryDumper),
        })
    }
}

struct TextIntDumper(Oid);

impl Dumper for TextIntDumper {
    fn oid(&self) -> Oid {
        self.0
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(int_of(value)?.to_string().into_bytes()))
    }

    fn quote(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Vec<u8>, Error> {
        quote_number(self.dump(value, cx)?)
    }
}

struct Int2BinaryDumper;

impl Dumper for Int2BinaryDumper {
    fn oid(&self) -> Oid {
        Type::INT2.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        let mut buf = [0; 2];
        BigEndian::write_i16(&mut buf, int_of(value)? as i16);
        Ok(Some(buf.to_vec()))
    }
}

struct Int4BinaryDumper;

impl Dumper for Int4BinaryDumper {
    fn oid(&self) -> Oid {
        Type::INT4.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        let mut buf = [0; 4];
        BigEndian::write_i32(&mut buf, int_of(value)? as i32);
        Ok(Some(buf.to_vec()))
    }
}

struct Int8BinaryDumper;

impl Dumper for Int8BinaryDumper {
    fn oid(&self) -> Oid {
        Type::INT8.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        let mut buf = [0; 8];
        BigEndian::write_i64(&mut buf, int_of(value)?);
        Ok(Some(buf.to_vec()))
    }
}

struct Float8Dumper;

impl Dumper for Float8Dumper {
    fn oid(&self) -> Oid {
        Type::FLOAT8.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        let v = match *value {
            Value::Null => return Ok(None),
            Value::Float4(v) => v as f64,
            Value::Float8(v) => v,
            ref other => {
                return Err(Error::programming(format!(
                    "float dumper got a {:?} value",
                    other.kind()
                )))
            }
        };
        Ok(Some(format_float(v).into_bytes()))
    }

    fn quote(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Vec<u8>, Error> {
        match self.dump(value, cx)? {
            None => Ok(b"NULL".to_vec()),
            Some(v) => match v.as_slice() {
                b"inf" => Ok(b"'Infinity'::float8".to_vec()),
                b"-inf" => Ok(b"'-Infinity'::float8".to_vec()),
                b"NaN" => Ok(b"'NaN'::float8".to_vec()),
                _ => quote_number(Some(v)),
            },
        }
    }
}

struct Float8BinaryDumper;

impl Dumper for Float8BinaryDumper {
    fn oid(&self) -> Oid {
        Type::FLOAT8.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        let v = match *value {
            Value::Null => return Ok(None),
            Value::Float4(v) => v as f64,
            Value::Float8(v) => v,
            ref other => {
                return Err(Error::programming(format!(
                    "float dumper got a {:?} value",
                    other.kind()
                )))
            }
        };
        let mut buf = [0; 8];
        BigEndian::write_f64(&mut buf, v);
        Ok(Some(buf.to_vec()))
    }
}

struct DecimalDumper;

impl Dumper for DecimalDumper {
    fn oid(&self) -> Oid {
        Type::NUMERIC.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Numeric(d) => Ok(Some(d.to_string().into_bytes())),
            other => Err(Error::programming(format!(
                "numeric dumper got a {:?} value",
                other.kind()
            ))),
        }
    }

    fn quote(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Vec<u8>, Error> {
        quote_number(self.dump(value, cx)?)
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        // enough digits to round trip exactly
        format!("{v:?}")
    }
}

fn quote_number(dumped: Option<Vec<u8>>) -> Result<Vec<u8>, Error> {
    Ok(match dumped {
        None => b"NULL".to_vec(),
        // a leading space avoids gluing the minus sign to a preceding
        // operator, turning e.g. `--1` into a comment opener.
        Some(v) if v.starts_with(b"-") => {
            let mut out = Vec::with_capacity(v.len() + 1);
            out.push(b' ');
            out.extend_from_slice(&v);
            out
        }
        Some(v) => v,
    })
}

struct Int2Loader;

impl Loader for Int2Loader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse_text::<i16>(data, "int2").map(Value::SmallInt)
    }
}

struct Int4Loader;

impl Loader for Int4Loader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse_text::<i32>(data, "int4").map(Value::Int)
    }
}

struct Int8Loader;

impl Loader for Int8Loader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse_text::<i64>(data, "int8").map(Value::BigInt)
    }
}

struct OidLoader;

impl Loader for OidLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse_text::<u32>(data, "oid").map(|v| Value::BigInt(v as i64))
    }
}

struct Int2BinaryLoader;

impl Loader for Int2BinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        expect_len(data, 2, "int2")?;
        Ok(Value::SmallInt(BigEndian::read_i16(data)))
    }
}

struct Int4BinaryLoader;

impl Loader for Int4BinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        expect_len(data, 4, "int4")?;
        Ok(Value::Int(BigEndian::read_i32(data)))
    }
}

struct Int8BinaryLoader;

impl Loader for Int8BinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        expect_len(data, 8, "int8")?;
        Ok(Value::BigInt(BigEndian::read_i64(data)))
    }
}

struct Float4Loader;

impl Loader for Float4Loader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse_float(data).map(|v| Value::Float4(v as f32))
    }
}

struct Float8Loader;

impl Loader for Float8Loader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        parse_float(data).map(Value::Float8)
    }
}

struct Float4BinaryLoader;

impl Loader for Float4BinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        expect_len(data, 4, "float4")?;
        Ok(Value::Float4(BigEndian::read_f32(data)))
    }
}

struct Float8BinaryLoader;

impl Loader for Float8BinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        expect_len(data, 8, "float8")?;
        Ok(Value::Float8(BigEndian::read_f64(data)))
    }
}

struct NumericLoader;

impl Loader for NumericLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::data("numeric value is not valid text"))?;
        match text {
            // the wrapper decimal type has no representation for these;
            // surface them as floats so the information is not lost.
            "NaN" => Ok(Value::Float8(f64::NAN)),
            "Infinity" => Ok(Value::Float8(f64::INFINITY)),
            "-Infinity" => Ok(Value::Float8(f64::NEG_INFINITY)),
            _ => text
                .parse::<Decimal>()
                .map(Value::Numeric)
                .map_err(|e| Error::data(format!("bad numeric representation {text:?}: {e}"))),
        }
    }
}

/// binary `numeric`: base 10000 digits with a decimal point weight.
struct NumericBinaryLoader;

impl Loader for NumericBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        if data.len() < 8 {
            return Err(Error::data("binary numeric too short"));
        }
        let ndigits = BigEndian::read_u16(&data[0..2]) as usize;
        let weight = BigEndian::read_i16(&data[2..4]) as i32;
        let sign = BigEndian::read_u16(&data[4..6]);
        let dscale = BigEndian::read_u16(&data[6..8]) as usize;
        if sign == NUMERIC_NAN {
            return Ok(Value::Float8(f64::NAN));
        }
        if data.len() < 8 + ndigits * 2 {
            return Err(Error::data("binary numeric digit buffer truncated"));
        }

        let mut text = String::new();
        if sign == NUMERIC_NEG {
            text.push('-');
        } else if sign != NUMERIC_POS {
            return Err(Error::data("bad binary numeric sign"));
        }

        let digit = |i: usize| BigEndian::read_u16(&data[8 + i * 2..10 + i * 2]);

        // render the base 10000 digits around the decimal point, then let
        // the decimal parser normalize the scale. d[i] sits at position
        // weight - i; positions below zero are fractional.
        if weight >= 0 {
            for pos in (0..=weight).rev() {
                let i = (weight - pos) as usize;
                let d = if i < ndigits { digit(i) } else { 0 };
                if pos == weight {
                    text.push_str(&d.to_string());
                } else {
                    text.push_str(&format!("{d:04}"));
                }
            }
        } else {
            text.push('0');
        }

        if dscale > 0 {
            let mut frac = String::new();
            if weight < -1 {
                for _ in 0..(-1 - weight) {
                    frac.push_str("0000");
                }
            }
            let first_frac = (weight + 1).max(0) as usize;
            for i in first_frac..ndigits {
                frac.push_str(&format!("{:04}", digit(i)));
            }
            while frac.len() < dscale {
                frac.push('0');
            }
            frac.truncate(dscale);
            text.push('.');
            text.push_str(&frac);
        }

        text.parse::<Decimal>()
            .map(Value::Numeric)
            .map_err(|e| Error::data(format!("bad binary numeric {text:?}: {e}")))
    }
}

fn parse_text<T: std::str::FromStr>(data: &[u8], what: &str) -> Result<T, Error> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            Error::data(format!(
                "bad {what} representation: {}",
                String::from_utf8_lossy(data)
            ))
        })
}

fn parse_float(data: &[u8]) -> Result<f64, Error> {
    let text = std::str::from_utf8(data).map_err(|_| Error::data("float value is not valid text"))?;
    match text {
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => text
            .parse()
            .map_err(|e| Error::data(format!("bad float representation {text:?}: {e}"))),
    }
}

fn expect_len(data: &[u8], len: usize, what: &str) -> Result<(), Error> {
    if data.len() == len {
        Ok(())
    } else {
        Err(Error::data(format!(
            "binary {what} must be {len} bytes, got {}",
            data.len()
        )))
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    let int_dumper: Arc<dyn Dumper> = Arc::new(IntDumper);
    for kind in [ValueKind::SmallInt, ValueKind::Int, ValueKind::BigInt] {
        map.register_dumper(kind, Arc::clone(&int_dumper), true);
        // the dispatcher serves binary requests too, through its upgrade
        map.register_dumper_as(kind, PyFormat::Binary, Arc::clone(&int_dumper));
    }
    map.register_dumper_by_oid(Type::INT2.oid(), Arc::new(Int2BinaryDumper));
    map.register_dumper_by_oid(Type::INT4.oid(), Arc::new(Int4BinaryDumper));
    map.register_dumper_by_oid(Type::INT8.oid(), Arc::new(Int8BinaryDumper));
    map.register_dumper_by_oid(Type::FLOAT8.oid(), Arc::new(Float8BinaryDumper));
    map.register_dumper(ValueKind::Float4, Arc::new(Float8Dumper), true);
    map.register_dumper(ValueKind::Float8, Arc::new(Float8Dumper), true);
    map.register_dumper(ValueKind::Float4, Arc::new(Float8BinaryDumper), false);
    map.register_dumper(ValueKind::Float8, Arc::new(Float8BinaryDumper), false);
    map.register_dumper(ValueKind::Numeric, Arc::new(DecimalDumper), true);

    map.register_loader(Type::INT2.oid(), Arc::new(Int2Loader));
    map.register_loader(Type::INT4.oid(), Arc::new(Int4Loader));
    map.register_loader(Type::INT8.oid(), Arc::new(Int8Loader));
    map.register_loader(Type::OID.oid(), Arc::new(OidLoader));
    map.register_loader(Type::INT2.oid(), Arc::new(Int2BinaryLoader));
    map.register_loader(Type::INT4.oid(), Arc::new(Int4BinaryLoader));
    map.register_loader(Type::INT8.oid(), Arc::new(Int8BinaryLoader));
    map.register_loader(Type::FLOAT4.oid(), Arc::new(Float4Loader));
    map.register_loader(Type::FLOAT8.oid(), Arc::new(Float8Loader));
    map.register_loader(Type::FLOAT4.oid(), Arc::new(Float4BinaryLoader));
    map.register_loader(Type::FLOAT8.oid(), Arc::new(Float8BinaryLoader));
    map.register_loader(Type::NUMERIC.oid(), Arc::new(NumericLoader));
    map.register_loader(Type::NUMERIC.oid(), Arc::new(NumericBinaryLoader));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;

    fn upgraded(value: &Value) -> Arc<dyn Dumper> {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        IntDumper.upgrade(value, PyFormat::Auto, &cx).unwrap()
    }

    #[test]
    fn int_size_promotion() {
        assert_eq!(upgraded(&Value::BigInt(1)).oid(), Type::INT2.oid());
        assert_eq!(upgraded(&Value::BigInt(40_000)).oid(), Type::INT4.oid());
        assert_eq!(upgraded(&Value::BigInt(3_000_000_000)).oid(), Type::INT8.oid());
        assert_eq!(upgraded(&Value::BigInt(-32_768)).oid(), Type::INT2.oid());
        assert_eq!(upgraded(&Value::BigInt(-32_769)).oid(), Type::INT4.oid());
        assert_eq!(upgraded(&Value::BigInt(i64::MAX)).oid(), Type::INT8.oid());
    }

    #[test]
    fn decimal_round_trips_exactly() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        for text in ["0", "-1.5", "123456789.000000001", "0.00000000000001"] {
            let value = Value::Numeric(text.parse().unwrap());
            let dumped = DecimalDumper.dump(&value, &cx).unwrap().unwrap();
            let loaded = NumericLoader.load(&dumped, &lx).unwrap();
            assert_eq!(loaded, value, "round trip of {text}");
        }
    }

    #[test]
    fn binary_numeric_loads() {
        let lx_map = default_adapters();
        let session = SessionInfo::default();
        let lx = LoadContext { session: &session, adapters: &lx_map };

        // 1234.5678 = digits [1234, 5678], weight 0, dscale 4
        let mut data = Vec::new();
        for v in [2u16, 0, 0, 4, 1234, 5678] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        let loaded = NumericBinaryLoader.load(&data, &lx).unwrap();
        assert_eq!(loaded, Value::Numeric("1234.5678".parse().unwrap()));
    }

    #[test]
    fn float_specials() {
        let session = SessionInfo::default();
        let map = default_adapters();
        let lx = LoadContext { session: &session, adapters: &map };
        assert!(matches!(
            Float8Loader.load(b"NaN", &lx).unwrap(),
            Value::Float8(v) if v.is_nan()
        ));
        assert_eq!(Float8Loader.load(b"Infinity", &lx).unwrap(), Value::Float8(f64::INFINITY));
    }

    #[test]
    fn negative_numbers_quote_with_space() {
        let session = SessionInfo::default();
        let map = default_adapters();
        let cx = DumpContext { session: &session, adapters: &map };
        let quoted = TextIntDumper(Type::INT4.oid())
            .quote(&Value::Int(-42), &cx)
            .unwrap();
        assert_eq!(quoted, b" -42".to_vec());
    }
}
