//! catalog of PostgreSQL types known to a connection.
//!
//! Seeded with the builtin types and extended at runtime with the enums,
//! composites and ranges fetched from `pg_catalog` through
//! [`Connection::fetch_type_info`].
//!
//! [`Connection::fetch_type_info`]: crate::connection::Connection::fetch_type_info

use std::collections::HashMap;

use postgres_types::{Oid, Type};

/// structure of a non scalar type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TypeStructure {
    #[default]
    Base,
    Enum {
        labels: Vec<String>,
    },
    Composite {
        fields: Vec<(String, Oid)>,
    },
    Range {
        subtype: Oid,
    },
    Multirange {
        range_oid: Oid,
    },
    Domain {
        base: Oid,
    },
}

/// facts about one type, as fetched from the catalog or seeded builtin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub name: String,
    pub oid: Oid,
    pub array_oid: Oid,
    pub structure: TypeStructure,
}

impl TypeInfo {
    pub fn new(name: impl Into<String>, oid: Oid, array_oid: Oid) -> Self {
        Self {
            name: name.into(),
            oid,
            array_oid,
            structure: TypeStructure::Base,
        }
    }

    pub fn with_structure(mut self, structure: TypeStructure) -> Self {
        self.structure = structure;
        self
    }
}

/// index of [`TypeInfo`] by the lookups the adapters need.
#[derive(Debug, Clone, Default)]
pub struct TypesRegistry {
    infos: Vec<TypeInfo>,
    by_name: HashMap<String, usize>,
    by_oid: HashMap<Oid, usize>,
    by_array_oid: HashMap<Oid, usize>,
    by_range_subtype: HashMap<Oid, usize>,
}

impl TypesRegistry {
    pub fn add(&mut self, info: TypeInfo) {
        let idx = self.infos.len();
        self.by_name.insert(info.name.clone(), idx);
        self.by_oid.insert(info.oid, idx);
        if info.array_oid != 0 {
            self.by_array_oid.insert(info.array_oid, idx);
        }
        if let TypeStructure::Range { subtype } = info.structure {
            self.by_range_subtype.insert(subtype, idx);
        }
        self.infos.push(info);
    }

    pub fn by_name(&self, name: &str) -> Option<&TypeInfo> {
        self.by_name.get(name).map(|&i| &self.infos[i])
    }

    pub fn by_oid(&self, oid: Oid) -> Option<&TypeInfo> {
        self.by_oid.get(&oid).map(|&i| &self.infos[i])
    }

    /// the element type whose array type has *oid*.
    pub fn by_array_oid(&self, oid: Oid) -> Option<&TypeInfo> {
        self.by_array_oid.get(&oid).map(|&i| &self.infos[i])
    }

    /// the range type built over the subtype with *oid*.
    pub fn range_by_subtype(&self, oid: Oid) -> Option<&TypeInfo> {
        self.by_range_subtype.get(&oid).map(|&i| &self.infos[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeInfo> {
        self.infos.iter()
    }
}

fn builtin(ty: &Type, array: &Type) -> TypeInfo {
    TypeInfo::new(ty.name(), ty.oid(), array.oid())
}

/// seed *registry* with the builtin types the default codecs cover.
pub(crate) fn seed_builtin_types(registry: &mut TypesRegistry) {
    registry.add(builtin(&Type::BOOL, &Type::BOOL_ARRAY));
    registry.add(builtin(&Type::INT2, &Type::INT2_ARRAY));
    registry.add(builtin(&Type::INT4, &Type::INT4_ARRAY));
    registry.add(builtin(&Type::INT8, &Type::INT8_ARRAY));
    registry.add(builtin(&Type::OID, &Type::OID_ARRAY));
    registry.add(builtin(&Type::FLOAT4, &Type::FLOAT4_ARRAY));
    registry.add(builtin(&Type::FLOAT8, &Type::FLOAT8_ARRAY));
    registry.add(builtin(&Type::NUMERIC, &Type::NUMERIC_ARRAY));
    registry.add(builtin(&Type::TEXT, &Type::TEXT_ARRAY));
    registry.add(builtin(&Type::VARCHAR, &Type::VARCHAR_ARRAY));
    registry.add(builtin(&Type::BPCHAR, &Type::BPCHAR_ARRAY));
    registry.add(builtin(&Type::NAME, &Type::NAME_ARRAY));
    registry.add(builtin(&Type::CHAR, &Type::CHAR_ARRAY));
    registry.add(builtin(&Type::BYTEA, &Type::BYTEA_ARRAY));
    registry.add(builtin(&Type::UUID, &Type::UUID_ARRAY));
    registry.add(builtin(&Type::JSON, &Type::JSON_ARRAY));
    registry.add(builtin(&Type::JSONB, &Type::JSONB_ARRAY));
    registry.add(builtin(&Type::DATE, &Type::DATE_ARRAY));
    registry.add(builtin(&Type::TIME, &Type::TIME_ARRAY));
    registry.add(builtin(&Type::TIMETZ, &Type::TIMETZ_ARRAY));
    registry.add(builtin(&Type::TIMESTAMP, &Type::TIMESTAMP_ARRAY));
    registry.add(builtin(&Type::TIMESTAMPTZ, &Type::TIMESTAMPTZ_ARRAY));
    registry.add(builtin(&Type::INTERVAL, &Type::INTERVAL_ARRAY));
    registry.add(builtin(&Type::INET, &Type::INET_ARRAY));
    registry.add(builtin(&Type::CIDR, &Type::CIDR_ARRAY));
    registry.add(builtin(&Type::RECORD, &Type::RECORD_ARRAY));

    let ranges = [
        (&Type::INT4_RANGE, &Type::INT4_RANGE_ARRAY, Type::INT4.oid()),
        (&Type::INT8_RANGE, &Type::INT8_RANGE_ARRAY, Type::INT8.oid()),
        (&Type::NUM_RANGE, &Type::NUM_RANGE_ARRAY, Type::NUMERIC.oid()),
        (&Type::DATE_RANGE, &Type::DATE_RANGE_ARRAY, Type::DATE.oid()),
        (&Type::TS_RANGE, &Type::TS_RANGE_ARRAY, Type::TIMESTAMP.oid()),
        (&Type::TSTZ_RANGE, &Type::TSTZ_RANGE_ARRAY, Type::TIMESTAMPTZ.oid()),
    ];
    for (ty, array, subtype) in ranges {
        registry.add(
            builtin(ty, array).with_structure(TypeStructure::Range { subtype }),
        );
    }

    let multiranges = [
        (&Type::INT4MULTI_RANGE, Type::INT4_RANGE.oid()),
        (&Type::INT8MULTI_RANGE, Type::INT8_RANGE.oid()),
        (&Type::NUMMULTI_RANGE, Type::NUM_RANGE.oid()),
        (&Type::DATEMULTI_RANGE, Type::DATE_RANGE.oid()),
        (&Type::TSMULTI_RANGE, Type::TS_RANGE.oid()),
        (&Type::TSTZMULTI_RANGE, Type::TSTZ_RANGE.oid()),
    ];
    for (ty, range_oid) in multiranges {
        registry.add(
            TypeInfo::new(ty.name(), ty.oid(), 0)
                .with_structure(TypeStructure::Multirange { range_oid }),
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builtin_lookups() {
        let mut reg = TypesRegistry::default();
        seed_builtin_types(&mut reg);

        assert_eq!(reg.by_name("int4").unwrap().oid, Type::INT4.oid());
        assert_eq!(reg.by_oid(Type::TEXT.oid()).unwrap().name, "text");
        assert_eq!(
            reg.by_array_oid(Type::INT8_ARRAY.oid()).unwrap().name,
            "int8"
        );
        assert_eq!(
            reg.range_by_subtype(Type::INT4.oid()).unwrap().name,
            "int4range"
        );
    }
}
