//! entry points of the adaptation system.
//!
//! Dumpers turn [`Value`]s into wire bytes, loaders turn wire bytes back
//! into values. Both are looked up through a per connection [`AdaptersMap`]
//! which shadows a shared parent map, so registering an adapter on one
//! connection never affects another.

use std::{collections::HashMap, sync::Arc};

use postgres_types::Oid;

use super::{
    errors::Error,
    pq::Format,
    types::{registry::TypesRegistry, Value, ValueKind},
};

/// dump format requested at the application boundary.
///
/// distinct from the wire format: `Auto` lets each type pick the
/// representation it prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PyFormat {
    #[default]
    Auto,
    Text,
    Binary,
}

/// session facts codecs may depend on. captured once per query.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub encoding: String,
    pub timezone: chrono_tz::Tz,
    pub std_strings: bool,
    pub server_version: u32,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            encoding: "UTF8".to_string(),
            timezone: chrono_tz::UTC,
            std_strings: true,
            server_version: 0,
        }
    }
}

impl SessionInfo {
    /// whether text values must be returned undecoded.
    pub(crate) fn is_sql_ascii(&self) -> bool {
        self.encoding.eq_ignore_ascii_case("sql_ascii")
    }

    /// resolve the session `TimeZone` parameter. unknown zones fall back
    /// to UTC with a warning, matching what the backend itself would allow.
    pub(crate) fn resolve_timezone(name: &str) -> chrono_tz::Tz {
        match name.parse() {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(timezone = name, "unknown TimeZone parameter, assuming UTC");
                chrono_tz::UTC
            }
        }
    }
}

/// context handed to dumpers.
pub struct DumpContext<'a> {
    pub session: &'a SessionInfo,
    pub adapters: &'a AdaptersMap,
}

/// context handed to loaders.
pub struct LoadContext<'a> {
    pub session: &'a SessionInfo,
    pub adapters: &'a AdaptersMap,
}

/// key a resolved dumper is cached under. most dumpers key on the value
/// kind alone; value dependent dumpers refine the key so each refinement
/// gets its own cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DumperKey {
    Plain(ValueKind),
    Width(IntWidth),
    Nested(ValueKind, Box<DumperKey>),
    /// a concrete catalog type, e.g. one value of a user defined enum.
    Oid(Oid),
}

/// wire integer width classes picked by value magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    Int2,
    Int4,
    Int8,
    Numeric,
}

/// convert one kind of [`Value`] to its PostgreSQL representation.
pub trait Dumper: Send + Sync {
    /// oid to announce for the parameter; 0 lets the server infer.
    fn oid(&self) -> Oid {
        0
    }

    fn format(&self) -> Format {
        Format::Text
    }

    /// wire bytes for *value*; `None` encodes SQL NULL.
    fn dump(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error>;

    /// quoted form for client side literal composition.
    fn quote(&self, value: &Value, cx: &DumpContext<'_>) -> Result<Vec<u8>, Error> {
        match self.dump(value, cx)? {
            None => Ok(b"NULL".to_vec()),
            Some(data) => Ok(quote_bytes(&data)),
        }
    }

    /// cache key for *value*; refine it for value dependent dispatch.
    fn key(&self, value: &Value, _format: PyFormat, _cx: &DumpContext<'_>) -> DumperKey {
        DumperKey::Plain(value.kind())
    }

    /// value dependent replacement dumper, when [`Dumper::key`] refined.
    fn upgrade(
        &self,
        _value: &Value,
        _format: PyFormat,
        _cx: &DumpContext<'_>,
    ) -> Option<Arc<dyn Dumper>> {
        None
    }
}

/// convert PostgreSQL wire bytes with a known oid back to a [`Value`].
pub trait Loader: Send + Sync {
    fn format(&self) -> Format {
        Format::Text
    }

    fn load(&self, data: &[u8], cx: &LoadContext<'_>) -> Result<Value, Error>;
}

/// escape *data* as a string literal, the connection-less way.
///
/// values containing backslashes use the `E''` form, which reads the same
/// under either setting of `standard_conforming_strings`.
pub(crate) fn quote_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    if data.contains(&b'\\') {
        out.extend_from_slice(b" E");
    }
    out.push(b'\'');
    for &b in data {
        match b {
            b'\'' => out.extend_from_slice(b"''"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
    out.push(b'\'');
    out
}

/// registry of adapters, optionally shadowing a parent map.
#[derive(Clone, Default)]
pub struct AdaptersMap {
    parent: Option<Arc<AdaptersMap>>,
    dumpers: HashMap<(ValueKind, PyFormat), Arc<dyn Dumper>>,
    dumpers_by_oid: HashMap<(Oid, Format), Arc<dyn Dumper>>,
    loaders: HashMap<(Oid, Format), Arc<dyn Loader>>,
    types: TypesRegistry,
}

impl AdaptersMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// a child map inheriting everything from *parent* until shadowed.
    pub fn inheriting(parent: Arc<AdaptersMap>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// register *dumper* for values of *kind*, under its own format and,
    /// when *auto* is set, as the automatic choice for the kind.
    pub fn register_dumper(&mut self, kind: ValueKind, dumper: Arc<dyn Dumper>, auto: bool) {
        let fmt = match dumper.format() {
            Format::Text => PyFormat::Text,
            Format::Binary => PyFormat::Binary,
        };
        if auto {
            self.dumpers.insert((kind, PyFormat::Auto), Arc::clone(&dumper));
        }
        self.dumpers.insert((kind, fmt), dumper);
    }

    /// register *dumper* under an explicit format slot, regardless of its
    /// own wire format. used by dispatching dumpers that cover both.
    pub fn register_dumper_as(&mut self, kind: ValueKind, format: PyFormat, dumper: Arc<dyn Dumper>) {
        self.dumpers.insert((kind, format), dumper);
    }

    pub fn register_dumper_by_oid(&mut self, oid: Oid, dumper: Arc<dyn Dumper>) {
        self.dumpers_by_oid.insert((oid, dumper.format()), dumper);
    }

    pub fn register_loader(&mut self, oid: Oid, loader: Arc<dyn Loader>) {
        self.loaders.insert((oid, loader.format()), loader);
    }

    pub fn types(&self) -> &TypesRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypesRegistry {
        &mut self.types
    }

    /// look up the type registry through the inheritance chain.
    pub fn find_type_by_name(&self, name: &str) -> Option<crate::types::registry::TypeInfo> {
        match self.types.by_name(name) {
            Some(info) => Some(info.clone()),
            None => self.parent.as_ref()?.find_type_by_name(name),
        }
    }

    pub fn find_type_by_oid(&self, oid: Oid) -> Option<crate::types::registry::TypeInfo> {
        match self.types.by_oid(oid) {
            Some(info) => Some(info.clone()),
            None => self.parent.as_ref()?.find_type_by_oid(oid),
        }
    }

    pub fn find_range_by_subtype(&self, oid: Oid) -> Option<crate::types::registry::TypeInfo> {
        match self.types.range_by_subtype(oid) {
            Some(info) => Some(info.clone()),
            None => self.parent.as_ref()?.find_range_by_subtype(oid),
        }
    }

    pub fn get_dumper(&self, kind: ValueKind, format: PyFormat) -> Result<Arc<dyn Dumper>, Error> {
        if let Some(d) = self.dumpers.get(&(kind, format)) {
            return Ok(Arc::clone(d));
        }
        if let Some(parent) = &self.parent {
            return parent.get_dumper(kind, format);
        }
        Err(Error::programming(format!(
            "cannot adapt value of kind {kind:?} in {format:?} format"
        )))
    }

    pub fn get_dumper_by_oid(&self, oid: Oid, format: Format) -> Result<Arc<dyn Dumper>, Error> {
        if let Some(d) = self.dumpers_by_oid.get(&(oid, format)) {
            return Ok(Arc::clone(d));
        }
        if let Some(parent) = &self.parent {
            return parent.get_dumper_by_oid(oid, format);
        }
        Err(Error::programming(format!(
            "no dumper registered for oid {oid} in {format:?} format"
        )))
    }

    pub fn get_loader(&self, oid: Oid, format: Format) -> Option<Arc<dyn Loader>> {
        if let Some(l) = self.loaders.get(&(oid, format)) {
            return Some(Arc::clone(l));
        }
        self.parent.as_ref()?.get_loader(oid, format)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn child_map_shadows_parent() {
        struct Dummy(Oid);
        impl Dumper for Dummy {
            fn oid(&self) -> Oid {
                self.0
            }
            fn dump(&self, _: &Value, _: &DumpContext<'_>) -> Result<Option<Vec<u8>>, Error> {
                Ok(Some(b"x".to_vec()))
            }
        }

        let mut parent = AdaptersMap::new();
        parent.register_dumper(ValueKind::Bool, Arc::new(Dummy(1)), true);
        let parent = Arc::new(parent);

        let mut child = AdaptersMap::inheriting(Arc::clone(&parent));
        assert_eq!(child.get_dumper(ValueKind::Bool, PyFormat::Auto).unwrap().oid(), 1);

        child.register_dumper(ValueKind::Bool, Arc::new(Dummy(2)), true);
        assert_eq!(child.get_dumper(ValueKind::Bool, PyFormat::Auto).unwrap().oid(), 2);
        // parent unchanged
        assert_eq!(parent.get_dumper(ValueKind::Bool, PyFormat::Auto).unwrap().oid(), 1);
    }

    #[test]
    fn quoting_escapes_quotes_and_backslashes() {
        assert_eq!(quote_bytes(b"plain"), b"'plain'".to_vec());
        assert_eq!(quote_bytes(b"o'clock"), b"'o''clock'".to_vec());
        assert_eq!(quote_bytes(b"a\\b"), b" E'a\\\\b'".to_vec());
    }
}
