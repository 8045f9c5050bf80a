//! adapters for range and multirange types, text format.

use std::sync::Arc;

use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, DumperKey, LoadContext, Loader, PyFormat},
    errors::Error,
    types::{
        registry::{TypeInfo, TypeStructure},
        RangeValue, Value, ValueKind,
    },
};

/// register a range type fetched from the catalog, making its text form
/// loadable and its values dumpable with the right oid.
pub fn register_range(map: &mut AdaptersMap, info: TypeInfo) -> Result<(), Error> {
    let TypeStructure::Range { subtype } = info.structure else {
        return Err(Error::programming(format!(
            "{} is not a range type",
            info.name
        )));
    };
    map.register_loader(info.oid, Arc::new(RangeLoader { subtype }));
    map.types_mut().add(info);
    Ok(())
}

/// dispatcher registered for [`ValueKind::Range`]; binds the range type
/// oid from the subtype of the value being dumped.
struct RangeDumperDispatch;

fn range_subtype_elem(range: &RangeValue) -> Option<&Value> {
    range.lower.as_ref().or(range.upper.as_ref())
}

fn resolve_range_oid(range: &RangeValue, cx: &DumpContext<'_>) -> Oid {
    let Some(elem) = range_subtype_elem(range) else { return 0 };
    let Ok(dumper) = cx
        .adapters
        .get_dumper(elem.kind(), PyFormat::Text)
        .or_else(|_| cx.adapters.get_dumper(elem.kind(), PyFormat::Auto))
    else {
        return 0;
    };
    let dumper = dumper.upgrade(elem, PyFormat::Text, cx).unwrap_or(dumper);
    // ranges over a promoted subtype still use the wider builtin range:
    // there is no int2range, so anything integral maps through int4/int8.
    let elem_oid = match dumper.oid() {
        oid if oid == postgres_types::Type::INT2.oid() => postgres_types::Type::INT4.oid(),
        oid => oid,
    };
    cx.adapters
        .find_range_by_subtype(elem_oid)
        .map(|info| info.oid)
        .unwrap_or(0)
}

impl Dumper for RangeDumperDispatch {
    fn dump(&self, _value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        Err(Error::internal(
            "RangeDumperDispatch is a dispatcher to other dumpers: dump is not supposed to be called",
        ))
    }

    fn key(&self, value: &Value, _format: PyFormat, cx: &DumpContext<'_>) -> DumperKey {
        match value {
            Value::Range(range) => DumperKey::Oid(resolve_range_oid(range, cx)),
            _ => DumperKey::Plain(ValueKind::Range),
        }
    }

    fn upgrade(
        &self,
        value: &Value,
        _format: PyFormat,
        cx: &DumpContext<'_>,
    ) -> Option<Arc<dyn Dumper>> {
        let Value::Range(range) = value else { return None };
        Some(Arc::new(RangeDumper {
            oid: resolve_range_oid(range, cx),
        }))
    }
}

struct RangeDumper {
    oid: Oid,
}

impl Dumper for RangeDumper {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn dump(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Range(range) => {
                let mut out = Vec::new();
                write_range(range, cx, &mut out)?;
                Ok(Some(out))
            }
            other => Err(Error::programming(format!(
                "range dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

fn write_range(range: &RangeValue, cx: &DumpContext<'_>, out: &mut Vec<u8>) -> Result<(), Error> {
    if range.empty {
        out.extend_from_slice(b"empty");
        return Ok(());
    }
    out.push(if range.lower_inc { b'[' } else { b'(' });
    write_bound(range.lower.as_ref(), cx, out)?;
    out.push(b',');
    write_bound(range.upper.as_ref(), cx, out)?;
    out.push(if range.upper_inc { b']' } else { b')' });
    Ok(())
}

fn write_bound(
    bound: Option<&Value>,
    cx: &DumpContext<'_>,
    out: &mut Vec<u8>,
) -> Result<(), Error> {
    let Some(value) = bound else { return Ok(()) };
    if value.is_null() {
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
            matches!(b, b'(' | b')' | b'[' | b']' | b',' | b'"' | b'\\') || b.is_ascii_whitespace()
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

pub(crate) struct RangeLoader {
    pub(crate) subtype: Oid,
}

impl Loader for RangeLoader {
    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
        let (range, used) = parse_range(data, self.subtype, cx)?;
        if used != data.len() {
            return Err(Error::data("trailing data after range"));
        }
        Ok(Value::Range(Box::new(range)))
    }
}

/// loader for a multirange, delegating each member to the range parser.
pub(crate) struct MultirangeLoader {
    pub(crate) subtype: Oid,
}

impl Loader for MultirangeLoader {
    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error> {
        let inner = data
            .strip_prefix(b"{")
            .and_then(|d| d.strip_suffix(b"}"))
            .ok_or_else(|| Error::data("malformed multirange literal"))?;
        let mut ranges = Vec::new();
        let mut pos = 0;
        while pos < inner.len() {
            if inner[pos] == b',' {
                pos += 1;
                continue;
            }
            let (range, used) = parse_range(&inner[pos..], self.subtype, cx)?;
            ranges.push(range);
            pos += used;
        }
        Ok(Value::Multirange(ranges))
    }
}

/// multirange dumper: members rendered by the plain range writer.
struct MultirangeDumper;

impl Dumper for MultirangeDumper {
    fn dump(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Multirange(ranges) => {
                let mut out = vec![b'{'];
                for (i, range) in ranges.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    write_range(range, cx, &mut out)?;
                }
                out.push(b'}');
                Ok(Some(out))
            }
            other => Err(Error::programming(format!(
                "multirange dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

fn parse_range(
    data: &[u8],
    subtype: Oid,
    cx: &LoadContext<'_>,
) -> Result<(RangeValue, usize), Error> {
    if data.starts_with(b"empty") {
        return Ok((RangeValue::empty(), 5));
    }

    let mut pos = 0;
    let lower_inc = match data.first() {
        Some(b'[') => true,
        Some(b'(') => false,
        _ => return Err(Error::data("malformed range literal")),
    };
    pos += 1;

    let (lower, used) = parse_bound(&data[pos..], subtype, cx)?;
    pos += used;
    if data.get(pos) != Some(&b',') {
        return Err(Error::data("malformed range literal: missing comma"));
    }
    pos += 1;
    let (upper, used) = parse_bound(&data[pos..], subtype, cx)?;
    pos += used;

    let upper_inc = match data.get(pos) {
        Some(b']') => true,
        Some(b')') => false,
        _ => return Err(Error::data("malformed range literal: missing bound")),
    };
    pos += 1;

    Ok((
        RangeValue {
            lower,
            upper,
            lower_inc,
            upper_inc,
            empty: false,
        },
        pos,
    ))
}

fn parse_bound(
    data: &[u8],
    subtype: Oid,
    cx: &LoadContext<'_>,
) -> Result<(Option<Value>, usize), Error> {
    match data.first() {
        Some(b',') | Some(b']') | Some(b')') => Ok((None, 0)),
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
                            .ok_or_else(|| Error::data("unterminated range bound"))?;
                        out.push(*b);
                        pos += 2;
                    }
                    Some(b) => {
                        out.push(*b);
                        pos += 1;
                    }
                    None => return Err(Error::data("unterminated range bound")),
                }
            }
            Ok((Some(load_bound(&out, subtype, cx)?), pos))
        }
        Some(_) => {
            let mut pos = 0;
            while let Some(&b) = data.get(pos) {
                if matches!(b, b',' | b']' | b')') {
                    break;
                }
                pos += 1;
            }
            Ok((Some(load_bound(&data[..pos], subtype, cx)?), pos))
        }
        None => Err(Error::data("unterminated range literal")),
    }
}

fn load_bound(raw: &[u8], subtype: Oid, cx: &LoadContext<'_>) -> Result<Value, Error> {
    match cx.adapters.get_loader(subtype, crate::pq::Format::Text) {
        Some(loader) => loader.load(raw, cx),
        None => super::string::load_text(raw, cx),
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Range, Arc::new(RangeDumperDispatch), true);
    map.register_dumper(ValueKind::Multirange, Arc::new(MultirangeDumper), true);

    let mut range_loaders: Vec<(Oid, Oid)> = Vec::new();
    let mut multirange_loaders: Vec<(Oid, Oid)> = Vec::new();
    for info in map.types().iter() {
        match info.structure {
            TypeStructure::Range { subtype } => range_loaders.push((info.oid, subtype)),
            TypeStructure::Multirange { range_oid } => {
                multirange_loaders.push((info.oid, range_oid))
            }
            _ => {}
        }
    }
    for (oid, subtype) in range_loaders {
        map.register_loader(oid, Arc::new(RangeLoader { subtype }));
    }
    for (oid, range_oid) in multirange_loaders {
        let subtype = match map.types().by_oid(range_oid).map(|i| i.structure.clone()) {
            Some(TypeStructure::Range { subtype }) => subtype,
            _ => 0,
        };
        map.register_loader(oid, Arc::new(MultirangeLoader { subtype }));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;
    use postgres_types::Type;

    fn contexts() -> (AdaptersMap, SessionInfo) {
        (default_adapters(), SessionInfo::default())
    }

    #[test]
    fn int_range_dumps_as_int4range() {
        let (map, session) = contexts();
        let cx = DumpContext { session: &session, adapters: &map };
        let value = Value::Range(Box::new(RangeValue::new(
            Some(Value::Int(1)),
            Some(Value::Int(10)),
        )));
        let dumper = RangeDumperDispatch.upgrade(&value, PyFormat::Auto, &cx).unwrap();
        assert_eq!(dumper.oid(), Type::INT4_RANGE.oid());
        assert_eq!(dumper.dump(&value, &cx).unwrap().unwrap(), b"[1,10)".to_vec());
    }

    #[test]
    fn empty_and_unbounded_ranges() {
        let (map, session) = contexts();
        let session = session;
        let lx = LoadContext { session: &session, adapters: &map };
        let loader = RangeLoader { subtype: Type::INT4.oid() };

        let Value::Range(r) = loader.load(b"empty", &lx).unwrap() else { panic!() };
        assert!(r.empty);

        let Value::Range(r) = loader.load(b"[5,)", &lx).unwrap() else { panic!() };
        assert_eq!(r.lower, Some(Value::Int(5)));
        assert_eq!(r.upper, None);
        assert!(r.lower_inc);
        assert!(!r.upper_inc);
    }

    #[test]
    fn multirange_loads() {
        let (map, session) = contexts();
        let lx = LoadContext { session: &session, adapters: &map };
        let loader = MultirangeLoader { subtype: Type::INT4.oid() };
        let Value::Multirange(ranges) = loader.load(b"{[1,3),[5,7)}", &lx).unwrap() else {
            panic!()
        };
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].lower, Some(Value::Int(5)));
    }
}
