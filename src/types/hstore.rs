//! adapters for the `hstore` extension type.
//!
//! the extension lives in a schema with a database assigned oid, so the
//! codec is only wired up once the application registers the oid it found.

use std::sync::Arc;

use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    types::{Value, ValueKind},
};

/// register the hstore codec for the oid of the installed extension type.
pub fn register_hstore(map: &mut AdaptersMap, oid: Oid) {
    map.register_dumper(ValueKind::Hstore, Arc::new(HstoreDumper { oid }), true);
    map.register_loader(oid, Arc::new(HstoreLoader));
}

struct HstoreDumper {
    oid: Oid,
}

impl Dumper for HstoreDumper {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Hstore(pairs) => {
                let mut out = Vec::new();
                for (i, (key, val)) in pairs.iter().enumerate() {
                    if i > 0 {
                        out.extend_from_slice(b",");
                    }
                    write_quoted(key.as_bytes(), &mut out);
                    out.extend_from_slice(b"=>");
                    match val {
                        Some(v) => write_quoted(v.as_bytes(), &mut out),
                        None => out.extend_from_slice(b"NULL"),
                    }
                }
                Ok(Some(out))
            }
            other => Err(Error::programming(format!(
                "hstore dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

fn write_quoted(data: &[u8], out: &mut Vec<u8>) {
    out.push(b'"');
    for &b in data {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}

struct HstoreLoader;

impl Loader for HstoreLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let mut pairs = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            while data.get(pos).is_some_and(|b| *b == b',' || b.is_ascii_whitespace()) {
                pos += 1;
            }
            if pos >= data.len() {
                break;
            }
            let (key, used) = read_token(&data[pos..])?;
            let key = key.ok_or_else(|| Error::data("hstore key cannot be NULL"))?;
            pos += used;
            while data.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
                pos += 1;
            }
            if data.get(pos..pos + 2) != Some(b"=>") {
                return Err(Error::data("malformed hstore literal: missing =>"));
            }
            pos += 2;
            while data.get(pos).is_some_and(|b| b.is_ascii_whitespace()) {
                pos += 1;
            }
            let (val, used) = read_token(&data[pos..])?;
            pos += used;
            pairs.push((key, val));
        }
        Ok(Value::Hstore(pairs))
    }
}

/// one key or value; `None` for an unquoted NULL.
fn read_token(data: &[u8]) -> Result<(Option<String>, usize), Error> {
    if data.first() == Some(&b'"') {
        let mut out = Vec::new();
        let mut pos = 1;
        loop {
            match data.get(pos) {
                Some(b'"') => {
                    pos += 1;
                    break;
                }
                Some(b'\\') => {
                    let b = data
                        .get(pos + 1)
                        .ok_or_else(|| Error::data("unterminated hstore token"))?;
                    out.push(*b);
                    pos += 2;
                }
                Some(b) => {
                    out.push(*b);
                    pos += 1;
                }
                None => return Err(Error::data("unterminated hstore token")),
            }
        }
        let s = String::from_utf8(out).map_err(|_| Error::data("hstore is not valid utf-8"))?;
        Ok((Some(s), pos))
    } else {
        let mut pos = 0;
        while let Some(&b) = data.get(pos) {
            if b == b',' || b == b'=' || b.is_ascii_whitespace() {
                break;
            }
            pos += 1;
        }
        let raw = &data[..pos];
        if raw.eq_ignore_ascii_case(b"NULL") {
            Ok((None, pos))
        } else {
            let s = std::str::from_utf8(raw)
                .map_err(|_| Error::data("hstore is not valid utf-8"))?;
            Ok((Some(s.to_string()), pos))
        }
    }
}
