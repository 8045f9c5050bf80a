//! adapters for the character and bytea types.

use std::sync::Arc;

use postgres_types::{Oid, Type};

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    pq::Format,
    types::{Value, ValueKind},
};

/// dumps strings with the unknown oid so the server infers the column type.
struct StrDumper;

impl Dumper for StrDumper {
    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Text(s) => {
                if s.contains('\0') {
                    return Err(Error::data("PostgreSQL text fields cannot contain NUL (0x00) bytes"));
                }
                Ok(Some(s.clone().into_bytes()))
            }
            other => Err(Error::programming(format!(
                "string dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

/// same bytes, but announced as `text`: binary parameters cannot use the
/// unknown oid.
struct StrBinaryDumper;

impl Dumper for StrBinaryDumper {
    fn oid(&self) -> Oid {
        Type::TEXT.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        StrDumper.dump(value, cx)
    }
}

struct TextLoader;

impl Loader for TextLoader {
    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
        load_text(data, cx)
    }
}

struct TextBinaryLoader;

impl Loader for TextBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
        load_text(data, cx)
    }
}

pub(super) fn load_text(data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
    if cx.session.is_sql_ascii() {
        // no client decoding is possible: hand the raw bytes back.
        return Ok(Value::Bytea(data.to_vec()));
    }
    match std::str::from_utf8(data) {
        Ok(s) => Ok(Value::Text(s.to_string())),
        Err(e) => Err(Error::data(format!("text value is not valid utf-8: {e}"))),
    }
}

struct ByteaDumper;

impl Dumper for ByteaDumper {
    fn oid(&self) -> Oid {
        Type::BYTEA.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Bytea(data) => {
                let mut out = Vec::with_capacity(2 + data.len() * 2);
                out.extend_from_slice(b"\\x");
                for b in data {
                    out.extend_from_slice(format!("{b:02x}").as_bytes());
                }
                Ok(Some(out))
            }
            other => Err(Error::programming(format!(
                "bytea dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

/// the preferred bytea dumper: raw bytes, no escaping, half the size.
struct ByteaBinaryDumper;

impl Dumper for ByteaBinaryDumper {
    fn oid(&self) -> Oid {
        Type::BYTEA.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Bytea(data) => Ok(Some(data.clone())),
            other => Err(Error::programming(format!(
                "bytea dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

struct ByteaLoader;

impl Loader for ByteaLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let Some(hex) = data.strip_prefix(b"\\x") else {
            return Err(Error::data("bytea value is not in hex format"));
        };
        if hex.len() % 2 != 0 {
            return Err(Error::data("odd number of hex digits in bytea value"));
        }
        let mut out = Vec::with_capacity(hex.len() / 2);
        for pair in hex.chunks_exact(2) {
            let s = std::str::from_utf8(pair).map_err(|_| bad_hex())?;
            out.push(u8::from_str_radix(s, 16).map_err(|_| bad_hex())?);
        }
        Ok(Value::Bytea(out))
    }
}

struct ByteaBinaryLoader;

impl Loader for ByteaBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        Ok(Value::Bytea(data.to_vec()))
    }
}

#[cold]
fn bad_hex() -> Error {
    Error::data("bad hex digit in bytea value")
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Text, Arc::new(StrDumper), true);
    map.register_dumper(ValueKind::Text, Arc::new(StrBinaryDumper), false);
    map.register_dumper(ValueKind::Bytea, Arc::new(ByteaDumper), false);
    map.register_dumper(ValueKind::Bytea, Arc::new(ByteaBinaryDumper), true);

    for ty in [&Type::TEXT, &Type::VARCHAR, &Type::BPCHAR, &Type::NAME, &Type::CHAR] {
        map.register_loader(ty.oid(), Arc::new(TextLoader));
        map.register_loader(ty.oid(), Arc::new(TextBinaryLoader));
    }
    map.register_loader(Type::BYTEA.oid(), Arc::new(ByteaLoader));
    map.register_loader(Type::BYTEA.oid(), Arc::new(ByteaBinaryLoader));

    // fallback slot for unknown oids
    map.register_loader(0, Arc::new(TextLoader));
    map.register_loader(0, Arc::new(ByteaBinaryLoader));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;

    #[test]
    fn bytea_hex_round_trip() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let value = Value::Bytea(vec![0, 1, 0xab, 0xff]);
        let dumped = ByteaDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(dumped, b"\\x0001abff".to_vec());
        assert_eq!(ByteaLoader.load(&dumped, &lx).unwrap(), value);
    }

    #[test]
    fn sql_ascii_returns_raw_bytes() {
        let map = default_adapters();
        let session = SessionInfo {
            encoding: "SQL_ASCII".to_string(),
            ..SessionInfo::default()
        };
        let lx = LoadContext { session: &session, adapters: &map };
        assert_eq!(
            TextLoader.load(b"caff\xe8", &lx).unwrap(),
            Value::Bytea(b"caff\xe8".to_vec())
        );
    }

    #[test]
    fn nul_byte_is_rejected() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        assert!(StrDumper.dump(&Value::Text("a\0b".into()), &cx).is_err());
    }
}
