//! adapters for arrays of any registered subtype, text format.

use std::sync::Arc;

use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, DumperKey, LoadContext, Loader, PyFormat},
    errors::Error,
    types::{Value, ValueKind},
};

/// dispatcher registered for [`ValueKind::Array`]; binds itself to the
/// element type of the value it is asked to dump.
struct ListDumper;

impl ListDumper {
    /// the first non null scalar, walking into nested dimensions.
    fn first_element(values: &[Value]) -> Option<&Value> {
        for v in values {
            match v {
                Value::Null => continue,
                Value::Array(inner) => {
                    if let Some(found) = Self::first_element(inner) {
                        return Some(found);
                    }
                }
                other => return Some(other),
            }
        }
        None
    }

    fn element_dumper(
        elem: &Value,
        cx: &DumpContext<'_>,
    ) -> Result<Arc<dyn Dumper>, Error> {
        let dumper = cx
            .adapters
            .get_dumper(elem.kind(), PyFormat::Text)
            .or_else(|_| cx.adapters.get_dumper(elem.kind(), PyFormat::Auto))?;
        Ok(match dumper.upgrade(elem, PyFormat::Text, cx) {
            Some(upgraded) => upgraded,
            None => dumper,
        })
    }
}

impl Dumper for ListDumper {
    fn dump(&self, _value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        Err(Error::internal(
            "ListDumper is a dispatcher to other dumpers: dump is not supposed to be called",
        ))
    }

    fn key(&self, value: &Value, _format: PyFormat, _cx: &DumpContext<'_>) -> DumperKey {
        let elem_key = match value {
            Value::Array(values) => {
                Self::first_element(values).map(|elem| DumperKey::Plain(elem.kind()))
            }
            _ => None,
        };
        match elem_key {
            Some(key) => DumperKey::Nested(ValueKind::Array, Box::new(key)),
            None => DumperKey::Plain(ValueKind::Array),
        }
    }

    fn upgrade(
        &self,
        value: &Value,
        _format: PyFormat,
        cx: &DumpContext<'_>,
    ) -> Option<Arc<dyn Dumper>> {
        let Value::Array(values) = value else { return None };
        let elem = Self::first_element(values)?;
        let elem_dumper = Self::element_dumper(elem, cx).ok()?;
        let array_oid = cx
            .adapters
            .find_type_by_oid(elem_dumper.oid())
            .map(|info| info.array_oid)
            .unwrap_or(0);
        Some(Arc::new(ArrayDumper { oid: array_oid }))
    }
}

struct ArrayDumper {
    oid: Oid,
}

impl Dumper for ArrayDumper {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn dump(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Array(values) => {
                let mut out = Vec::new();
                write_array(values, cx, &mut out)?;
                Ok(Some(out))
            }
            other => Err(Error::programming(format!(
                "array dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

fn write_array(values: &[Value], cx: &DumpContext<'_>, out: &mut Vec<u8>) -> Result<(), Error> {
    out.push(b'{');
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(b',');
        }
        match value {
            Value::Null => out.extend_from_slice(b"NULL"),
            Value::Array(inner) => write_array(inner, cx, out)?,
            elem => {
                let dumper = ListDumper::element_dumper(elem, cx)?;
                let data = dumper.dump(elem, cx)?.unwrap_or_default();
                write_element(&data, out);
            }
        }
    }
    out.push(b'}');
    Ok(())
}

fn write_element(data: &[u8], out: &mut Vec<u8>) {
    let needs_quote = data.is_empty()
        || data.eq_ignore_ascii_case(b"NULL")
        || data.iter().any(|&b| {
            matches!(b, b'{' | b'}' | b',' | b'"' | b'\\') || b.is_ascii_whitespace()
        });
    if !needs_quote {
        out.extend_from_slice(data);
        return;
    }
    out.push(b'"');
    for &b in data {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}

/// loader for any array type, generic over the element oid.
pub(crate) struct ArrayLoader {
    pub(crate) elem_oid: Oid,
}

impl Loader for ArrayLoader {
    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
        let mut parser = ArrayParser { data, pos: 0 };
        // dimension specifications like `[0:1]={...}` are not produced for
        // the formats the driver emits; skip them when the server sends one.
        if parser.peek() == Some(b'[') {
            while let Some(b) = parser.next() {
                if b == b'=' {
                    break;
                }
            }
        }
        let value = parser.parse_array(self.elem_oid, cx)?;
        if parser.pos != parser.data.len() {
            return Err(Error::data("trailing data after array"));
        }
        Ok(value)
    }
}

struct ArrayParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ArrayParser<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    #[allow(clippy::should_implement_trait)]
    fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, b: u8) -> Result<(), Error> {
        if self.next() == Some(b) {
            Ok(())
        } else {
            Err(Error::data(format!(
                "malformed array literal: expected {:?} at offset {}",
                b as char,
                self.pos
            )))
        }
    }

    fn parse_array(&mut self, elem_oid: Oid, cx: &LoadContext<'_>) -> Result<Value, Error> {
        self.expect(b'{')?;
        let mut values = Vec::new();
        if self.peek() == Some(b'}') {
            self.next();
            return Ok(Value::Array(values));
        }
        loop {
            values.push(self.parse_element(elem_oid, cx)?);
            match self.next() {
                Some(b',') => continue,
                Some(b'}') => return Ok(Value::Array(values)),
                _ => return Err(Error::data("malformed array literal")),
            }
        }
    }

    fn parse_element(&mut self, elem_oid: Oid, cx: &LoadContext<'_>) -> Result<Value, Error> {
        match self.peek() {
            Some(b'{') => self.parse_array(elem_oid, cx),
            Some(b'"') => {
                let raw = self.parse_quoted()?;
                load_element(&raw, elem_oid, cx)
            }
            _ => {
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b',' || b == b'}' {
                        break;
                    }
                    self.pos += 1;
                }
                let raw = &self.data[start..self.pos];
                if raw.eq_ignore_ascii_case(b"NULL") {
                    Ok(Value::Null)
                } else {
                    load_element(raw, elem_oid, cx)
                }
            }
        }
    }

    fn parse_quoted(&mut self) -> Result<Vec<u8>, Error> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.next() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.next() {
                    Some(b) => out.push(b),
                    None => return Err(Error::data("unterminated array element")),
                },
                Some(b) => out.push(b),
                None => return Err(Error::data("unterminated array element")),
            }
        }
    }
}

fn load_element(raw: &[u8], elem_oid: Oid, cx: &LoadContext<'_>) -> Result<Value, Error> {
    match cx.adapters.get_loader(elem_oid, crate::pq::Format::Text) {
        Some(loader) => loader.load(raw, cx),
        None => super::string::load_text(raw, cx),
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Array, Arc::new(ListDumper), true);

    let element_oids: Vec<(Oid, Oid)> = map
        .types()
        .iter()
        .filter(|info| info.array_oid != 0)
        .map(|info| (info.array_oid, info.oid))
        .collect();
    for (array_oid, elem_oid) in element_oids {
        map.register_loader(array_oid, Arc::new(ArrayLoader { elem_oid }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;
    use postgres_types::Type;

    fn dump(value: &Value) -> (Oid, Vec<u8>) {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let dumper = ListDumper.upgrade(value, PyFormat::Auto, &cx).unwrap();
        (dumper.oid(), dumper.dump(value, &cx).unwrap().unwrap())
    }

    fn load(elem: &Type, data: &[u8]) -> Value {
        let map = default_adapters();
        let session = SessionInfo::default();
        let lx = LoadContext { session: &session, adapters: &map };
        ArrayLoader { elem_oid: elem.oid() }.load(data, &lx).unwrap()
    }

    #[test]
    fn int_array_dumps_with_array_oid() {
        let value = Value::Array(vec![Value::Int(1), Value::Null, Value::Int(3)]);
        let (oid, data) = dump(&value);
        assert_eq!(oid, Type::INT2_ARRAY.oid(), "small values promote to int2");
        assert_eq!(data, b"{1,NULL,3}".to_vec());
    }

    #[test]
    fn string_elements_are_quoted() {
        let value = Value::Array(vec![
            Value::Text("plain".into()),
            Value::Text("with space".into()),
            Value::Text("qu\"ote".into()),
            Value::Text(String::new()),
        ]);
        let (_, data) = dump(&value);
        assert_eq!(data, b"{plain,\"with space\",\"qu\\\"ote\",\"\"}".to_vec());
    }

    #[test]
    fn multidimensional_round_trip() {
        let value = Value::Array(vec![
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
            Value::Array(vec![Value::Int(3), Value::Null]),
        ]);
        let (_, data) = dump(&value);
        assert_eq!(data, b"{{1,2},{3,NULL}}".to_vec());

        let loaded = load(&Type::INT4, &data);
        let expected = Value::Array(vec![
            Value::Array(vec![Value::Int(1), Value::Int(2)]),
            Value::Array(vec![Value::Int(3), Value::Null]),
        ]);
        assert_eq!(loaded, expected);
    }

    #[test]
    fn quoted_elements_load() {
        let loaded = load(&Type::TEXT, br#"{"a\"b",NULL,"NULL",plain}"#);
        assert_eq!(
            loaded,
            Value::Array(vec![
                Value::Text("a\"b".into()),
                Value::Null,
                Value::Text("NULL".into()),
                Value::Text("plain".into()),
            ])
        );
    }
}
