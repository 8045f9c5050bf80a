//! adapters for the `uuid` type.

use std::sync::Arc;

use postgres_types::{Oid, Type};
use uuid::Uuid;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    pq::Format,
    types::{Value, ValueKind},
};

fn uuid_of(value: &Value) -> Result<Option<Uuid>, Error> {
    match value {
        Value::Null => Ok(None),
        Value::Uuid(u) => Ok(Some(*u)),
        other => Err(Error::programming(format!(
            "uuid dumper got a {:?} value",
            other.kind()
        ))),
    }
}

struct UuidDumper;

impl Dumper for UuidDumper {
    fn oid(&self) -> Oid {
        Type::UUID.oid()
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        Ok(uuid_of(value)?.map(|u| u.hyphenated().to_string().into_bytes()))
    }
}

struct UuidBinaryDumper;

impl Dumper for UuidBinaryDumper {
    fn oid(&self) -> Oid {
        Type::UUID.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        Ok(uuid_of(value)?.map(|u| u.as_bytes().to_vec()))
    }
}

struct UuidLoader;

impl Loader for UuidLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let text = std::str::from_utf8(data).map_err(|_| Error::data("uuid is not valid text"))?;
        text.parse::<Uuid>()
            .map(Value::Uuid)
            .map_err(|e| Error::data(format!("bad uuid representation {text:?}: {e}")))
    }
}

struct UuidBinaryLoader;

impl Loader for UuidBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        Uuid::from_slice(data)
            .map(Value::Uuid)
            .map_err(|_| Error::data("binary uuid must be 16 bytes"))
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Uuid, Arc::new(UuidDumper), true);
    map.register_dumper(ValueKind::Uuid, Arc::new(UuidBinaryDumper), false);
    map.register_loader(Type::UUID.oid(), Arc::new(UuidLoader));
    map.register_loader(Type::UUID.oid(), Arc::new(UuidBinaryLoader));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;

    #[test]
    fn text_and_binary_round_trip() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let value = Value::Uuid("6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse().unwrap());
        let text = UuidDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(UuidLoader.load(&text, &lx).unwrap(), value);

        let bin = UuidBinaryDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(bin.len(), 16);
        assert_eq!(UuidBinaryLoader.load(&bin, &lx).unwrap(), value);
    }
}
