//! adapters for the `bool` type.

use std::sync::Arc;

use postgres_types::{Oid, Type};

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    pq::Format,
    types::{Value, ValueKind},
};

struct BoolDumper;

impl Dumper for BoolDumper {
    fn oid(&self) -> Oid {
        Type::BOOL.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(true) => Ok(Some(b"t".to_vec())),
            Value::Bool(false) => Ok(Some(b"f".to_vec())),
            other => Err(type_mismatch(other)),
        }
    }

    fn quote(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Vec<u8>, Error> {
        match value {
            Value::Null => Ok(b"NULL".to_vec()),
            Value::Bool(true) => Ok(b"true".to_vec()),
            Value::Bool(false) => Ok(b"false".to_vec()),
            other => Err(type_mismatch(other)),
        }
    }
}

struct BoolBinaryDumper;

impl Dumper for BoolBinaryDumper {
    fn oid(&self) -> Oid {
        Type::BOOL.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(v) => Ok(Some(vec![*v as u8])),
            other => Err(type_mismatch(other)),
        }
    }
}

struct BoolLoader;

impl Loader for BoolLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        match data {
            b"t" => Ok(Value::Bool(true)),
            b"f" => Ok(Value::Bool(false)),
            _ => Err(Error::data(format!(
                "bad boolean representation: {}",
                String::from_utf8_lossy(data)
            ))),
        }
    }
}

struct BoolBinaryLoader;

impl Loader for BoolBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        match data {
            [0] => Ok(Value::Bool(false)),
            [1] => Ok(Value::Bool(true)),
            _ => Err(Error::data("bad binary boolean representation")),
        }
    }
}

fn type_mismatch(value: &Value) -> Error {
    Error::programming(format!("bool dumper got a {:?} value", value.kind()))
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Bool, Arc::new(BoolDumper), true);
    map.register_dumper(ValueKind::Bool, Arc::new(BoolBinaryDumper), false);
    map.register_loader(Type::BOOL.oid(), Arc::new(BoolLoader));
    map.register_loader(Type::BOOL.oid(), Arc::new(BoolBinaryLoader));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;

    #[test]
    fn text_round_trip() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let dumper = map.get_dumper(ValueKind::Bool, crate::PyFormat::Auto).unwrap();
        let dumped = dumper.dump(&Value::Bool(true), &cx).unwrap().unwrap();
        let loader = map.get_loader(Type::BOOL.oid(), Format::Text).unwrap();
        assert_eq!(loader.load(&dumped, &lx).unwrap(), Value::Bool(true));
    }
}
