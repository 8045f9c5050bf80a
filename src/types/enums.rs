//! adapters for user defined enum types.
//!
//! enum values travel as their label text. The driver learns the labels and
//! the oid of an enum by fetching its [`TypeInfo`] from the catalog and
//! registering it with [`register_enum`].

use std::sync::Arc;

use postgres_types::Oid;

use crate::{
    adapt::{AdaptersMap, DumpContext, Dumper, DumperKey, LoadContext, Loader, PyFormat},
    errors::Error,
    types::{
        registry::{TypeInfo, TypeStructure},
        EnumValue, Value, ValueKind,
    },
};

/// register an enum type fetched from the catalog.
pub fn register_enum(map: &mut AdaptersMap, info: TypeInfo) -> Result<(), Error> {
    let TypeStructure::Enum { .. } = info.structure else {
        return Err(Error::programming(format!("{} is not an enum type", info.name)));
    };
    map.register_loader(
        info.oid,
        Arc::new(EnumLoader {
            type_name: info.name.clone(),
        }),
    );
    map.types_mut().add(info);
    Ok(())
}

/// dispatcher registered for [`ValueKind::Enum`]; binds the concrete type
/// by the name carried in the value.
struct EnumDumperDispatch;

impl Dumper for EnumDumperDispatch {
    fn dump(&self, _value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        Err(Error::internal(
            "EnumDumperDispatch is a dispatcher to other dumpers: dump is not supposed to be called",
        ))
    }

    fn key(&self, value: &Value, _format: PyFormat, cx: &DumpContext<'_>) -> DumperKey {
        match value {
            Value::Enum(v) => DumperKey::Oid(
                cx.adapters
                    .find_type_by_name(&v.type_name)
                    .map(|info| info.oid)
                    .unwrap_or(0),
            ),
            _ => DumperKey::Plain(ValueKind::Enum),
        }
    }

    fn upgrade(
        &self,
        value: &Value,
        _format: PyFormat,
        cx: &DumpContext<'_>,
    ) -> Option<Arc<dyn Dumper>> {
        let Value::Enum(v) = value else { return None };
        let info = cx.adapters.find_type_by_name(&v.type_name);
        Some(Arc::new(EnumDumper { info }))
    }
}

struct EnumDumper {
    info: Option<TypeInfo>,
}

impl Dumper for EnumDumper {
    fn oid(&self) -> Oid {
        self.info.as_ref().map(|i| i.oid).unwrap_or(0)
    }

    fn dump(&self, value: &Value, _cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
        match value {
            Value::Null => Ok(None),
            Value::Enum(v) => {
                if let Some(TypeInfo {
                    structure: TypeStructure::Enum { labels },
                    name,
                    ..
                }) = &self.info
                {
                    if !labels.is_empty() && !labels.iter().any(|l| l == &v.label) {
                        return Err(Error::data(format!(
                            "{:?} is not a label of enum {name}",
                            v.label
                        )));
                    }
                }
                Ok(Some(v.label.clone().into_bytes()))
            }
            other => Err(Error::programming(format!(
                "enum dumper got a {:?} value",
                other.kind()
            ))),
        }
    }
}

struct EnumLoader {
    type_name: String,
}

impl Loader for EnumLoader {
    fn load(&self, data: &[u8], _cx: &LoadContext<'_>) -> Result<Value, Error> {
        let label = std::str::from_utf8(data)
            .map_err(|_| Error::data("enum label is not valid text"))?;
        Ok(Value::Enum(EnumValue {
            type_name: self.type_name.clone(),
            label: label.to_string(),
        }))
    }
}

pub(super) fn register_default(map: &mut AdaptersMap) {
    map.register_dumper(ValueKind::Enum, Arc::new(EnumDumperDispatch), true);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::adapt::SessionInfo;
    use crate::types::default_adapters;

    fn mood() -> TypeInfo {
        TypeInfo::new("mood", 60000, 60001).with_structure(TypeStructure::Enum {
            labels: vec!["sad".into(), "ok".into(), "happy".into()],
        })
    }

    #[test]
    fn labels_round_trip_with_registered_oid() {
        let mut map = default_adapters();
        register_enum(&mut map, mood()).unwrap();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };
        let lx = LoadContext { session: &session, adapters: &map };

        let value = Value::Enum(EnumValue {
            type_name: "mood".into(),
            label: "happy".into(),
        });
        let dumper = EnumDumperDispatch.upgrade(&value, PyFormat::Auto, &cx).unwrap();
        assert_eq!(dumper.oid(), 60000);
        let dumped = dumper.dump(&value, &cx).unwrap().unwrap();
        assert_eq!(dumped, b"happy".to_vec());

        let loader = map.get_loader(60000, crate::pq::Format::Text).unwrap();
        assert_eq!(loader.load(&dumped, &lx).unwrap(), value);
    }

    #[test]
    fn unknown_label_is_rejected() {
        let mut map = default_adapters();
        register_enum(&mut map, mood()).unwrap();
        let session = SessionInfo::default();
        let cx = DumpContext { session: &session, adapters: &map };

        let value = Value::Enum(EnumValue {
            type_name: "mood".into(),
            label: "angry".into(),
        });
        let dumper = EnumDumperDispatch.upgrade(&value, PyFormat::Auto, &cx).unwrap();
        assert!(dumper.dump(&value, &cx).is_err());
    }
}
