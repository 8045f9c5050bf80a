//! adapters for `json` and `jsonb`.

use std::sync::Arc;

use postgres_types::{Oid, Type};
use serde_json::Value as JsonValue;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, LoadContext, Loader},
    errors::Error,
    pq::Format,
    types::{Value, ValueKind},
};

const JSONB_VERSION: u8 = 1;

fn json_of(value: &Value) -> Result<Option<&JsonValue>, Error> {
    match value {
        Value::Null => Ok(None),
        Value::Json(v) | Value::Jsonb(v) => Ok(Some(v)),
        other => Err(Error::programming(format!(
            "json dumper got a {:?} value",
            other.kind()
        ))),
    }
}

struct JsonDumper(Oid);

impl Dumper for JsonDumper {
    fn oid(&self) -> Oid {
        self.0
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match json_of(value)? {
            None => Ok(None),
            Some(v) => serde_json::to_vec(v)
                .map(Some)
                .map_err(|e| Error::data(format!("cannot serialize json: {e}"))),
        }
    }
}

/// `jsonb` binary transfer: a version byte followed by the json text.
struct JsonbBinaryDumper;

impl Dumper for JsonbBinaryDumper {
    fn oid(&self) -> Oid {
        Type::JSONB.oid()
    }

    fn format(&self) -> Format {
        Format::Binary
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match json_of(value)? {
            None => Ok(None),
            Some(v) => {
                let mut out = vec![JSONB_VERSION];
                serde_json::to_writer(&mut out, v)
                    .map_err(|e| Error::data(format!("cannot serialize json: {e}")))?;
                Ok(Some(out))
            }
        }
    }
}

struct JsonLoader {
    jsonb: bool,
}

impl JsonLoader {
    fn parse(&self, data: &[u8]) -> Result<Value, Error> {
        let parsed: JsonValue = serde_json::from_slice(data)
            .map_err(|e| Error::data(format!("cannot parse json: {e}")))?;
        Ok(if self.jsonb {
            Value::Jsonb(parsed)
        } else {
            Value::Json(parsed)
        })
    }
}

impl Loader for JsonLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        self.parse(data)
    }
}

struct JsonbBinaryLoader;

impl Loader for JsonbBinaryLoader {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        match data.split_first() {
            Some((&JSONB_VERSION, rest)) => JsonLoader { jsonb: true }.parse(rest),
            _ => Err(Error::data("bad jsonb binary version")),
        }
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Json, Arc::new(JsonDumper(Type::JSON.oid())), true);
    map.register_dumper(ValueKind::Jsonb, Arc::new(JsonDumper(Type::JSONB.oid())), true);
    map.register_dumper(ValueKind::Jsonb, Arc::new(JsonbBinaryDumper), false);

    map.register_loader(Type::JSON.oid(), Arc::new(JsonLoader { jsonb: false }));
    map.register_loader(Type::JSONB.oid(), Arc::new(JsonLoader { jsonb: true }));
    map.register_loader(Type::JSONB.oid(), Arc::new(JsonbBinaryLoader));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;
    use serde_json::json;

    #[test]
    fn jsonb_binary_round_trip() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let value = Value::Jsonb(json!({"a": [1, 2, {"b": null}]}));
        let dumped = JsonbBinaryDumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(dumped[0], JSONB_VERSION);
        assert_eq!(JsonbBinaryLoader.load(&dumped, &lx).unwrap(), value);
    }

    #[test]
    fn bad_version_is_rejected() {
        let map = default_adapters();
        let session = SessionInfo::default();
        let lx = LoadContext { session: &session, adapters: &map };
        assert!(JsonbBinaryLoader.load(b"\x02{}", &lx).is_err());
    }
}
