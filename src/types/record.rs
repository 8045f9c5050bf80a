//! adapters for composite (row) types, text format.

use std::sync::Arc;

use postgres_types::{Oid, Type};

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader, PyFormat},
    errors::Error,
    types::{
        registry::{TypeInfo, TypeStructure},
        Value, ValueKind,
    },
};

/// register a composite type fetched from the catalog. its text form loads
/// into a [`Value::Composite`] with each field decoded by its own loader.
pub fn register_composite(map: &mut AdaptersMap, info: TypeInfo) -> Result<(), Error> {
    let TypeStructure::Composite { ref fields } = info.structure else {
        return Err(Error::programming(format!(
            "{} is not a composite type",
            info.name
        )));
    };
    let field_oids: Vec<Oid> = fields.iter().map(|(_, oid)| *oid).collect();
    map.register_loader(
        info.oid,
        Arc::new(RecordLoader {
            field_oids: Some(field_oids),
        }),
    );
    map.types_mut().add(info);
    Ok(())
}

/// dumps any [`Value::Composite`] as an anonymous `record`.
struct TupleDumper;

impl Dumper for TupleDumper {
    fn oid(&self) -> Oid {
        Type::RECORD.oid()
    }

    fn dump(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Composite(fields) => {
                let mut out = vec![b'('];
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    write_field(field, cx, &mut out)?;
                }
                out.push(b')');
                Ok(Some(out))
            }
            other => Err(Error::programming(format!(
                "record dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

fn write_field(value: &Value, cx: &DumpContext<'_>, out: &mut Vec<u8>) -> Result<(), Error> {
    if value.is_null() {
        // a record null is simply an empty field
        return Ok(());
    }
    let dumper = cx
        .adapters
        .get_dumper(value.kind(), PyFormat::Text)
        .or_else(|_| cx.adapters.get_dumper(value.kind(), PyFormat::Auto))?;
    let dumper = dumper.upgrade(value, PyFormat::Text, cx).unwrap_or(dumper);
    let data = dumper.dump(value, cx)?.unwrap_or_default();

    let needs_quote = data.is_empty()
        || data.iter().any(|&b| {
            matches!(b, b'(' | b')' | b',' | b'"' | b'\\') || b.is_ascii_whitespace()
        });
    if !needs_quote {
        out.extend_from_slice(&data);
        return Ok(());
    }
    out.push(b'"');
    for &b in &data {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
    Ok(())
}

/// loader for record text. with field oids each field gets its own loader,
/// otherwise everything is handed back as text.
struct RecordLoader {
    field_oids: Option<Vec<Oid>>,
}

impl Loader for RecordLoader {
    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
        let inner = data
            .strip_prefix(b"(")
            .and_then(|d| d.strip_suffix(b")"))
            .ok_or_else(|| Error::data("malformed record literal"))?;

        let mut fields = Vec::new();
        let mut pos = 0;
        let mut index = 0;
        loop {
            let (raw, used, quoted) = next_field(&inner[pos..])?;
            let value = match raw {
                None if !quoted => Value::Null,
                None => load_field(b"", self.field_oid(index), cx)?,
                Some(raw) => load_field(&raw, self.field_oid(index), cx)?,
            };
            fields.push(value);
            index += 1;
            pos += used;
            match inner.get(pos) {
                Some(b',') => pos += 1,
                None => break,
                _ => return Err(Error::data("malformed record literal")),
            }
        }
        Ok(Value::Composite(fields))
    }
}

impl RecordLoader {
    fn field_oid(&self, index: usize) -> Oid {
        self.field_oids
            .as_ref()
            .and_then(|oids| oids.get(index).copied())
            .unwrap_or(0)
    }
}

/// one record field: `(bytes, consumed, was_quoted)`; `None` bytes mark an
/// empty (null) unquoted field.
#[allow(clippy::type_complexity)]
fn next_field(data: &[u8]) -> Result<(Option<Vec<u8>>, usize, bool), Error> {
    match data.first() {
        None | Some(b',') => Ok((None, 0, false)),
        Some(b'"') => {
            let mut out = Vec::new();
            let mut pos = 1;
            loop {
                match data.get(pos) {
                    Some(b'"') if data.get(pos + 1) == Some(&b'"') => {
                        out.push(b'"');
                        pos += 2;
                    }
                    Some(b'"') => {
                        pos += 1;
                        break;
                    }
                    Some(b'\\') => {
                        let b = data
                            .get(pos + 1)
                            .ok_or_else(|| Error::data("unterminated record field"))?;
                        out.push(*b);
                        pos += 2;
                    }
                    Some(b) => {
                        out.push(*b);
                        pos += 1;
                    }
                    None => return Err(Error::data("unterminated record field")),
                }
            }
            Ok((Some(out), pos, true))
        }
        Some(_) => {
            let mut pos = 0;
            while let Some(&b) = data.get(pos) {
                if b == b',' {
                    break;
                }
                pos += 1;
            }
            Ok((Some(data[..pos].to_vec()), pos, false))
        }
    }
}

fn load_field(raw: &[u8], oid: Oid, cx: &LoadContext<'_>) -> Result<Value, Error> {
    match cx.adapters.get_loader(oid, crate::pq::Format::Text) {
        Some(loader) => loader.load(raw, cx),
        None => super::string::load_text(raw, cx),
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Composite, Arc::new(TupleDumper), true);
    map.register_loader(Type::RECORD.oid(), Arc::new(RecordLoader { field_oids: None }));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;

    #[test]
    fn record_dump_quotes_what_needs_it() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let value = Value::Composite(vec![
            Value::Int(42),
            Value::Text("hello world".into()),
            Value::Null,
        ]);
        let dumped = TupleDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(dumped, b"(42,\"hello world\",)".to_vec());
    }

    #[test]
    fn typed_composite_loads_fields() {
        let mut map = default_adapters();
        let info = TypeInfo::new("point2", 50000, 50001).with_structure(TypeStructure::Composite {
            fields: vec![
                ("x".to_string(), postgres_types::Type::INT4.oid()),
                ("y".to_string(), postgres_types::Type::TEXT.oid()),
            ],
        });
        register_composite(&mut map, info).unwrap();

        let session = SessionInfo::default();
        let lx = LoadContext { session: &session, adapters: &map };
        let loader = map.get_loader(50000, crate::pq::Format::Text).unwrap();
        let loaded = loader.load(b"(7,\"a,b\")", &lx).unwrap();
        assert_eq!(
            loaded,
            Value::Composite(vec![Value::Int(7), Value::Text("a,b".into())])
        );
    }

    #[test]
    fn empty_fields_are_null() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let lx = LoadContext { session: &session, adapters: &map };
        let loader = RecordLoader { field_oids: None };
        let loaded = loader.load(b"(,x,)", &lx).unwrap();
        assert_eq!(
            loaded,
            Value::Composite(vec![Value::Null, Value::Text("x".into()), Value::Null])
        );
    }
}
