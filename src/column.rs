//! description of one column of a result set.

use postgres_types::Oid;

use super::pq::{Format, PqResult};

/// numeric typmods pack precision and scale on top of a 4 byte header.
const VARHDRSZ: i32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    type_code: Oid,
    fmod: i32,
    fsize: i32,
    format: Format,
}

impl Column {
    pub(crate) fn from_result<R: PqResult>(result: &R, index: usize) -> Self {
        Self {
            name: result.fname(index).unwrap_or_default().to_string(),
            type_code: result.ftype(index),
            fmod: result.fmod(index),
            fsize: result.fsize(index),
            format: result.fformat(index),
        }
    }

    /// the name of the column.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// the oid of the column type.
    pub fn type_code(&self) -> Oid {
        self.type_code
    }

    /// the size in bytes of the column type, `None` for variable size.
    pub fn internal_size(&self) -> Option<i32> {
        (self.fsize > 0).then_some(self.fsize)
    }

    /// the number of significant digits, for numeric columns.
    pub fn precision(&self) -> Option<i32> {
        if self.type_code != postgres_types::Type::NUMERIC.oid() || self.fmod < VARHDRSZ {
            return None;
        }
        Some(((self.fmod - VARHDRSZ) >> 16) & 0xFFFF)
    }

    /// the number of digits after the decimal point, for numeric columns.
    pub fn scale(&self) -> Option<i32> {
        if self.type_code != postgres_types::Type::NUMERIC.oid() || self.fmod < VARHDRSZ {
            return None;
        }
        Some((self.fmod - VARHDRSZ) & 0xFFFF)
    }

    /// maximum length for varchar style columns.
    pub fn display_size(&self) -> Option<i32> {
        let varlen = self.type_code == postgres_types::Type::VARCHAR.oid()
            || self.type_code == postgres_types::Type::BPCHAR.oid();
        (varlen && self.fmod >= VARHDRSZ).then_some(self.fmod - VARHDRSZ)
    }

    /// wire format the column was transferred in.
    pub fn format(&self) -> Format {
        self.format
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockColumn, MockResult};
    use postgres_types::Type;

    #[test]
    fn numeric_typmod_decodes_precision_and_scale() {
        let mut col = MockColumn::new("amount", &Type::NUMERIC);
        // numeric(10, 2)
        col.fmod = ((10 << 16) | 2) + VARHDRSZ;
        let result = MockResult::tuples(vec![col], Vec::new());

        let column = Column::from_result(&result, 0);
        assert_eq!(column.name(), "amount");
        assert_eq!(column.precision(), Some(10));
        assert_eq!(column.scale(), Some(2));
        assert_eq!(column.internal_size(), None);
    }

    #[test]
    fn varchar_display_size() {
        let mut col = MockColumn::new("title", &Type::VARCHAR);
        col.fmod = 32 + VARHDRSZ;
        let result = MockResult::tuples(vec![col], Vec::new());
        assert_eq!(Column::from_result(&result, 0).display_size(), Some(32));
    }
}
