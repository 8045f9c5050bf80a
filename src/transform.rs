//! per query scratchpad adapting values in both directions.
//!
//! A [`Transformer`] lives for the duration of one query: it resolves and
//! caches the dumpers for the parameters and the loaders for the columns of
//! the current result, so adapting many values of the same type costs one
//! lookup.

use std::{collections::HashMap, sync::Arc};

use postgres_types::Oid;

use super::{
    adapt::{AdaptersMap, DumpContext, Dumper, DumperKey, LoadContext, Loader, PyFormat, SessionInfo},
    errors::Error,
    pq::{Format, PqResult},
    types::Value,
};

/// parameters of one query, adapted and ready for the wire handle.
#[derive(Debug, Default)]
pub(crate) struct DumpedParams {
    pub params: Vec<Option<Vec<u8>>>,
    pub types: Vec<Oid>,
    pub formats: Vec<Format>,
}

pub(crate) struct Transformer {
    adapters: Arc<AdaptersMap>,
    session: SessionInfo,
    dumpers: HashMap<(DumperKey, PyFormat), Arc<dyn Dumper>>,
    loader_cache: HashMap<(Oid, Format), Arc<dyn Loader>>,
    row_loaders: Vec<Arc<dyn Loader>>,
    nfields: usize,
    ntuples: usize,
}

impl Transformer {
    pub(crate) fn new(adapters: Arc<AdaptersMap>, session: SessionInfo) -> Self {
        Self {
            adapters,
            session,
            dumpers: HashMap::new(),
            loader_cache: HashMap::new(),
            row_loaders: Vec::new(),
            nfields: 0,
            ntuples: 0,
        }
    }

    pub(crate) fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub(crate) fn adapters(&self) -> &Arc<AdaptersMap> {
        &self.adapters
    }

    /// bind the transformer to a result, resolving one loader per column.
    ///
    /// *format* overrides the per column wire format; used for described
    /// portals, whose describe result always reports text.
    pub(crate) fn set_result<R: PqResult>(
        &mut self,
        result: Option<&R>,
        set_loaders: bool,
        format: Option<Format>,
    ) -> Result<(), Error> {
        let Some(result) = result else {
            self.nfields = 0;
            self.ntuples = 0;
            if set_loaders {
                self.row_loaders.clear();
            }
            return Ok(());
        };

        self.nfields = result.nfields();
        self.ntuples = result.ntuples();
        if set_loaders {
            let mut loaders = Vec::with_capacity(self.nfields);
            for col in 0..self.nfields {
                let fmt = format.unwrap_or_else(|| result.fformat(col));
                loaders.push(self.get_loader(result.ftype(col), fmt)?);
            }
            self.row_loaders = loaders;
        }
        Ok(())
    }

    pub(crate) fn ntuples(&self) -> usize {
        self.ntuples
    }

    /// adapt one parameter list. resolution results are cached, so calling
    /// this once per row of an `executemany` batch stays cheap.
    pub(crate) fn dump_sequence(
        &mut self,
        params: &[Value],
        formats: &[PyFormat],
    ) -> Result<DumpedParams, Error> {
        let mut out = DumpedParams {
            params: Vec::with_capacity(params.len()),
            types: Vec::with_capacity(params.len()),
            formats: Vec::with_capacity(params.len()),
        };
        for (i, value) in params.iter().enumerate() {
            let format = formats.get(i).copied().unwrap_or(PyFormat::Auto);
            if value.is_null() {
                out.params.push(None);
                out.types.push(0);
                out.formats.push(Format::Text);
                continue;
            }
            let dumper = self.get_dumper(value, format)?;
            let cx = DumpContext {
                session: &self.session,
                adapters: &self.adapters,
            };
            out.params.push(dumper.dump(value, &cx)?);
            out.types.push(dumper.oid());
            out.formats.push(dumper.format());
        }
        Ok(out)
    }

    /// resolve the dumper for *value*, walking the upgrade chain.
    pub(crate) fn get_dumper(
        &mut self,
        value: &Value,
        format: PyFormat,
    ) -> Result<Arc<dyn Dumper>, Error> {
        let cx = DumpContext {
            session: &self.session,
            adapters: &self.adapters,
        };
        let base_key = DumperKey::Plain(value.kind());
        let dumper = match self.dumpers.get(&(base_key.clone(), format)) {
            Some(d) => Arc::clone(d),
            None => {
                let d = self.adapters.get_dumper(value.kind(), format)?;
                self.dumpers.insert((base_key.clone(), format), Arc::clone(&d));
                d
            }
        };

        let key = dumper.key(value, format, &cx);
        if key == base_key {
            return Ok(dumper);
        }
        if let Some(d) = self.dumpers.get(&(key.clone(), format)) {
            return Ok(Arc::clone(d));
        }
        let upgraded = dumper.upgrade(value, format, &cx).unwrap_or(dumper);
        self.dumpers.insert((key, format), Arc::clone(&upgraded));
        Ok(upgraded)
    }

    pub(crate) fn get_loader(&mut self, oid: Oid, format: Format) -> Result<Arc<dyn Loader>, Error> {
        if let Some(l) = self.loader_cache.get(&(oid, format)) {
            return Ok(Arc::clone(l));
        }
        let loader = self
            .adapters
            .get_loader(oid, format)
            .or_else(|| self.adapters.get_loader(0, format))
            .ok_or_else(|| Error::interface("unknown oid loader not found"))?;
        self.loader_cache.insert((oid, format), Arc::clone(&loader));
        Ok(loader)
    }

    /// load row *row* of the bound result, or `None` when out of range.
    pub(crate) fn load_row<R: PqResult>(
        &self,
        result: &R,
        row: usize,
    ) -> Result<Option<Vec<Value>>, Error> {
        if row >= self.ntuples {
            return Ok(None);
        }
        let mut record = Vec::with_capacity(self.nfields);
        let cx = LoadContext {
            session: &self.session,
            adapters: &self.adapters,
        };
        for col in 0..self.nfields {
            let value = match result.get_value(row, col) {
                None => Value::Null,
                Some(data) => self.row_loaders[col].load(data, &cx)?,
            };
            record.push(value);
        }
        Ok(Some(record))
    }

    /// load rows `row0..row1` of the bound result.
    pub(crate) fn load_rows<R: PqResult>(
        &self,
        result: &R,
        row0: usize,
        row1: usize,
    ) -> Result<Vec<Vec<Value>>, Error> {
        if row0 > row1 || row1 > self.ntuples {
            return Err(Error::interface(format!(
                "rows must be included between 0 and {}",
                self.ntuples
            )));
        }
        let mut records = Vec::with_capacity(row1 - row0);
        for row in row0..row1 {
            match self.load_row(result, row)? {
                Some(record) => records.push(record),
                None => break,
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockColumn, MockResult};
    use crate::types::default_adapters;
    use postgres_types::Type;

    fn transformer() -> Transformer {
        Transformer::new(Arc::new(default_adapters()), SessionInfo::default())
    }

    #[test]
    fn dump_sequence_promotes_ints() {
        let mut tx = transformer();
        let out = tx
            .dump_sequence(
                &[
                    Value::BigInt(1),
                    Value::BigInt(40_000),
                    Value::BigInt(3_000_000_000),
                    Value::Null,
                ],
                &[PyFormat::Auto; 4],
            )
            .unwrap();
        assert_eq!(
            out.types,
            vec![Type::INT2.oid(), Type::INT4.oid(), Type::INT8.oid(), 0]
        );
        assert_eq!(out.params[0], Some(b"1".to_vec()));
        assert_eq!(out.params[3], None);
    }

    #[test]
    fn load_rows_applies_column_loaders() {
        let mut tx = transformer();
        let result = MockResult::tuples(
            vec![
                MockColumn::new("id", &Type::INT4),
                MockColumn::new("name", &Type::TEXT),
            ],
            vec![
                vec![Some(b"1".to_vec()), Some(b"ada".to_vec())],
                vec![Some(b"2".to_vec()), None],
            ],
        );
        tx.set_result(Some(&result), true, None).unwrap();

        let rows = tx.load_rows(&result, 0, 2).unwrap();
        assert_eq!(rows[0], vec![Value::Int(1), Value::Text("ada".into())]);
        assert_eq!(rows[1], vec![Value::Int(2), Value::Null]);
        assert!(tx.load_row(&result, 2).unwrap().is_none());
    }

    #[test]
    fn unknown_oid_falls_back_to_text() {
        let mut tx = transformer();
        let loader = tx.get_loader(999_999, Format::Text).unwrap();
        let map = default_adapters();
        let session = SessionInfo::default();
        let cx = LoadContext { session: &session, adapters: &map };
        assert_eq!(loader.load(b"x", &cx).unwrap(), Value::Text("x".into()));
    }
}
