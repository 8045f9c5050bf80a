//! client side cursors.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    column::Column,
    connection::{Connection, Inner},
    errors::Error,
    generators::{Execute, Fetch, PipelineCommand, Send as SendMachine},
    pipeline::PendingResult,
    pq::{ExecStatus, Format, Pq, PqResult},
    preparing::{Prepare, PrepareManager},
    queries::{Params, PostgresQuery, Query},
    rows::Row,
    transform::Transformer,
    waiting,
};

/// scroll addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    Relative,
    Absolute,
}

/// per execution options of [`Cursor::execute_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// force preparing on or off, overriding the threshold policy.
    pub prepare: Option<bool>,
    /// request binary results regardless of the cursor default.
    pub binary: Option<bool>,
}

pub(crate) struct CursorState<P: Pq> {
    pub(crate) results: Vec<P::Result>,
    pub(crate) ires: usize,
    pub(crate) pos: usize,
    pub(crate) rowcount: i64,
    pub(crate) transformer: Option<Transformer>,
    pub(crate) columns: Arc<[Column]>,
    pub(crate) closed: bool,
}

impl<P: Pq> CursorState<P> {
    fn new() -> Self {
        Self {
            results: Vec::new(),
            ires: 0,
            pos: 0,
            rowcount: -1,
            transformer: None,
            columns: Arc::new([]),
            closed: false,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.results.clear();
        self.ires = 0;
        self.pos = 0;
        self.rowcount = -1;
        self.columns = Arc::new([]);
    }

    pub(crate) fn current_result(&self) -> Option<&P::Result> {
        self.results.get(self.ires)
    }

    fn check_result(&self) -> Result<(), Error> {
        match self.current_result() {
            None => Err(Error::programming("no result available")),
            Some(res)
                if res.status() != ExecStatus::TuplesOk
                    && res.status() != ExecStatus::SingleTuple =>
            {
                Err(Error::programming("the last operation didn't produce a result"))
            }
            Some(_) => Ok(()),
        }
    }

    /// install freshly fetched results, validating their statuses.
    pub(crate) fn set_results(
        &mut self,
        results: Vec<P::Result>,
        format: Option<Format>,
    ) -> Result<(), Error> {
        if results.is_empty() {
            return Err(Error::internal("got no result from the query"));
        }
        for res in &results {
            if !status_ok(res.status()) {
                return raise_from_results(&results);
            }
        }

        self.results = results;
        self.ires = 0;
        self.pos = 0;
        self.bind_current(format)?;
        let nrows = self.results[0].command_tuples();
        if let Some(nrows) = nrows {
            if self.rowcount < 0 {
                self.rowcount = nrows as i64;
            } else {
                self.rowcount += nrows as i64;
            }
        }
        Ok(())
    }

    fn bind_current(&mut self, format: Option<Format>) -> Result<(), Error> {
        let result = &self.results[self.ires];
        let tx = self
            .transformer
            .as_mut()
            .ok_or_else(|| Error::internal("cursor has no transformer"))?;
        tx.set_result(Some(result), true, format)?;
        self.columns = (0..result.nfields())
            .map(|i| Column::from_result(result, i))
            .collect::<Vec<_>>()
            .into();
        Ok(())
    }

    fn load_row_at(&self, pos: usize) -> Result<Option<Row>, Error> {
        let result = self
            .current_result()
            .ok_or_else(|| Error::programming("no result available"))?;
        let tx = self
            .transformer
            .as_ref()
            .ok_or_else(|| Error::internal("cursor has no transformer"))?;
        Ok(tx
            .load_row(result, pos)?
            .map(|values| Row::new(values, Arc::clone(&self.columns))))
    }
}

fn status_ok(status: ExecStatus) -> bool {
    matches!(
        status,
        ExecStatus::TuplesOk | ExecStatus::CommandOk | ExecStatus::EmptyQuery
    )
}

pub(crate) fn raise_from_results<R: PqResult>(results: &[R]) -> Result<(), Error> {
    if let Some(last) = results.last() {
        if last.status() == ExecStatus::FatalError {
            return Err(Error::from_result(last));
        }
    }
    if results
        .iter()
        .any(|r| r.status() == ExecStatus::PipelineAborted)
    {
        return Err(Error::pipeline_aborted());
    }
    if results.iter().any(|r| r.status().is_copy()) {
        return Err(Error::programming(
            "COPY cannot be used with this method; use copy() instead",
        ));
    }
    let mut names: Vec<&str> = results
        .iter()
        .map(|r| r.status().name())
        .filter(|s| !status_ok_name(s))
        .collect();
    names.sort_unstable();
    names.dedup();
    Err(Error::internal(format!(
        "got unexpected status from query: {}",
        names.join(", ")
    )))
}

fn status_ok_name(name: &str) -> bool {
    matches!(name, "TUPLES_OK" | "COMMAND_OK" | "EMPTY_QUERY")
}

/// a cursor bound to a [`Connection`], holding the current result set.
pub struct Cursor<'c, P: Pq> {
    conn: &'c Connection<P>,
    pub(crate) state: Arc<Mutex<CursorState<P>>>,
    format: Format,
    pub arraysize: usize,
}

impl<'c, P: Pq> std::fmt::Debug for Cursor<'c, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}

impl<'c, P: Pq> Cursor<'c, P> {
    pub(crate) fn new(conn: &'c Connection<P>) -> Self {
        Self {
            conn,
            state: Arc::new(Mutex::new(CursorState::new())),
            format: Format::Text,
            arraysize: 1,
        }
    }

    /// request binary results by default.
    pub fn binary(mut self) -> Self {
        self.format = Format::Binary;
        self
    }

    pub fn connection(&self) -> &'c Connection<P> {
        self.conn
    }

    pub fn closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }

    /// number of records produced or affected by the last operation.
    pub fn rowcount(&self) -> i64 {
        self.state.lock().unwrap().rowcount
    }

    /// index of the next row to fetch, if a result is available.
    pub fn rownumber(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state.current_result().map(|_| state.pos)
    }

    /// description of the current result columns, if it returned tuples.
    pub fn description(&self) -> Option<Vec<Column>> {
        let state = self.state.lock().unwrap();
        let result = state.current_result()?;
        let tuples = matches!(
            result.status(),
            ExecStatus::TuplesOk | ExecStatus::SingleTuple
        );
        (result.nfields() > 0 || tuples).then(|| state.columns.to_vec())
    }

    /// the command tag of the last executed statement.
    pub fn statusmessage(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .current_result()
            .and_then(|r| r.command_status().map(str::to_string))
    }

    /// execute a query, binding *params* if given.
    pub fn execute(
        &mut self,
        query: impl Into<Query>,
        params: Option<Params>,
    ) -> Result<&mut Self, Error> {
        self.execute_with(query, params, ExecuteOptions::default())
    }

    /// execute with explicit prepare / binary options.
    pub fn execute_with(
        &mut self,
        query: impl Into<Query>,
        params: Option<Params>,
        options: ExecuteOptions,
    ) -> Result<&mut Self, Error> {
        let query = query.into();
        let mut inner = self.conn.lock();
        self.start_query(&mut inner)?;

        let mut state = self.state.lock().unwrap();
        let mut transformer = state.transformer.take().unwrap();
        let pgq = PostgresQuery::convert(&query, params.as_ref(), &mut transformer);
        state.transformer = Some(transformer);
        drop(state);

        self.run_query(&mut inner, &pgq?, options)?;
        Ok(self)
    }

    /// execute the same command over a sequence of parameter sets.
    ///
    /// when *returning* is set each execution keeps its own result set,
    /// navigable with [`Cursor::nextset`], and `rowcount` reflects the
    /// current batch; otherwise row counts are summed.
    pub fn executemany<I>(
        &mut self,
        query: impl Into<Query>,
        params_seq: I,
        returning: bool,
    ) -> Result<(), Error>
    where
        I: IntoIterator<Item = Params>,
    {
        let query = query.into();
        let mut inner = self.conn.lock();
        self.start_query(&mut inner)?;

        let mut pgq: Option<PostgresQuery> = None;
        let mut accumulated: Vec<P::Result> = Vec::new();
        let mut total_rowcount: i64 = -1;

        for params in params_seq {
            let mut state = self.state.lock().unwrap();
            let mut transformer = state.transformer.take().unwrap();
            let converted = match pgq.as_mut() {
                None => {
                    let q = PostgresQuery::convert(&query, Some(&params), &mut transformer);
                    match q {
                        Ok(q) => {
                            pgq = Some(q);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                Some(q) => q.dump(&params, &mut transformer),
            };
            state.transformer = Some(transformer);
            drop(state);
            converted?;

            // reuse is expected, always worth preparing
            let opts = ExecuteOptions {
                prepare: Some(true),
                binary: None,
            };
            self.run_query(&mut inner, pgq.as_ref().unwrap(), opts)?;

            let mut state = self.state.lock().unwrap();
            if returning {
                accumulated.append(&mut state.results);
            } else if state.rowcount >= 0 {
                total_rowcount = total_rowcount.max(0) + state.rowcount;
            }
        }

        let mut state = self.state.lock().unwrap();
        if returning {
            state.results = accumulated;
            state.ires = 0;
            state.pos = 0;
            if !state.results.is_empty() {
                state.bind_current(None)?;
                state.rowcount = state.results[0]
                    .command_tuples()
                    .map(|n| n as i64)
                    .unwrap_or(-1);
            }
        } else {
            state.rowcount = total_rowcount;
        }
        Ok(())
    }

    pub(crate) fn start_query(&self, inner: &mut Inner<P>) -> Result<(), Error> {
        if self.state.lock().unwrap().closed {
            return Err(Error::interface("the cursor is closed"));
        }
        inner.check_connection_ok()?;
        inner.start_query()?;

        let mut state = self.state.lock().unwrap();
        state.reset();
        state.transformer = Some(transformer_placeholder(inner));
        Ok(())
    }

    /// decide on preparing, send the query and collect its results.
    fn run_query(
        &self,
        inner: &mut Inner<P>,
        pgq: &PostgresQuery,
        options: ExecuteOptions,
    ) -> Result<(), Error> {
        let format = match options.binary {
            Some(true) => Format::Binary,
            Some(false) => Format::Text,
            None => self.format,
        };
        let (prep, name) = inner.prepared.get(pgq, options.prepare);
        let key = PrepareManager::key(pgq);

        if inner.pipeline.is_some() {
            return self.queue_in_pipeline(inner, pgq, format, prep, name, key);
        }

        if prep == Prepare::Should {
            inner
                .pq
                .send_prepare(&name, &pgq.query, &pgq.types())?;
            let results = self.conn.run(inner, &mut Execute::new())?;
            if let Some(res) = results.first() {
                if res.status() == ExecStatus::FatalError {
                    return Err(Error::from_result(res));
                }
            }
        }

        match prep {
            Prepare::Yes | Prepare::Should => {
                let empty = crate::transform::DumpedParams::default();
                let params = pgq.params.as_ref().unwrap_or(&empty);
                inner
                    .pq
                    .send_query_prepared(&name, &params.params, &params.formats, format)?;
            }
            Prepare::No => match &pgq.params {
                Some(params) => {
                    inner.pq.send_query_params(
                        &pgq.query,
                        &params.params,
                        &params.types,
                        &params.formats,
                        format,
                    )?;
                }
                None if format == Format::Binary => {
                    inner.pq.send_query_params(&pgq.query, &[], &[], &[], format)?;
                }
                None => {
                    // plain text without parameters: this path can run more
                    // than one statement in one go
                    inner.pq.send_query(&pgq.query)?;
                }
            },
        }

        let results = self.conn.run(inner, &mut Execute::new())?;
        self.state.lock().unwrap().set_results(results, None)?;

        let state = self.state.lock().unwrap();
        let cmd = inner
            .prepared
            .maintain(key, &state.results, prep, &name);
        drop(state);
        if let Some(cmd) = cmd {
            inner.exec_command(cmd)?;
        }
        Ok(())
    }

    fn queue_in_pipeline(
        &self,
        inner: &mut Inner<P>,
        pgq: &PostgresQuery,
        format: Format,
        prep: Prepare,
        name: Vec<u8>,
        key: (Vec<u8>, Vec<postgres_types::Oid>),
    ) -> Result<(), Error> {
        let pipeline = inner.pipeline.as_mut().unwrap();

        if prep == Prepare::Should {
            let prep_name = name.clone();
            let prep_query = pgq.query.clone();
            let prep_types = pgq.types();
            let cmd: PipelineCommand<P> =
                Box::new(move |pq| pq.send_prepare(&prep_name, &prep_query, &prep_types));
            pipeline.command_queue.push_back(cmd);
            pipeline.result_queue.push_back(PendingResult::Marker);
        }

        let exec_name = name.clone();
        let query = pgq.query.clone();
        let params = pgq
            .params
            .as_ref()
            .map(|p| (p.params.clone(), p.types.clone(), p.formats.clone()))
            .unwrap_or_default();
        let use_prepared = prep != Prepare::No;
        let cmd: PipelineCommand<P> = Box::new(move |pq| {
            if use_prepared {
                pq.send_query_prepared(&exec_name, &params.0, &params.2, format)
            } else {
                pq.send_query_params(&query, &params.0, &params.1, &params.2, format)
            }
        });
        pipeline.command_queue.push_back(cmd);
        pipeline.result_queue.push_back(PendingResult::Cursor {
            state: Arc::clone(&self.state),
            prep: Some((key, prep, name)),
            single_row: false,
        });
        Ok(())
    }

    /// move to the next result set of a multi statement execution.
    pub fn nextset(&mut self) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        if state.ires + 1 >= state.results.len() {
            return Ok(false);
        }
        state.ires += 1;
        state.pos = 0;
        state.bind_current(None)?;
        state.rowcount = state.results[state.ires]
            .command_tuples()
            .map(|n| n as i64)
            .unwrap_or(-1);
        Ok(true)
    }

    /// the next record of the current result, if any is left.
    pub fn fetchone(&mut self) -> Result<Option<Row>, Error> {
        let mut state = self.state.lock().unwrap();
        state.check_result()?;
        let row = state.load_row_at(state.pos)?;
        if row.is_some() {
            state.pos += 1;
        }
        Ok(row)
    }

    /// the next *size* records, or `arraysize` of them by default.
    pub fn fetchmany(&mut self, size: usize) -> Result<Vec<Row>, Error> {
        let mut state = self.state.lock().unwrap();
        state.check_result()?;
        let size = if size == 0 { self.arraysize } else { size };

        let result = state.current_result().unwrap();
        let tx = state.transformer.as_ref().unwrap();
        let upto = (state.pos + size).min(tx.ntuples());
        let rows = tx
            .load_rows(result, state.pos, upto)?
            .into_iter()
            .map(|values| Row::new(values, Arc::clone(&state.columns)))
            .collect::<Vec<_>>();
        state.pos += rows.len();
        Ok(rows)
    }

    /// all the remaining records of the current result.
    pub fn fetchall(&mut self) -> Result<Vec<Row>, Error> {
        let mut state = self.state.lock().unwrap();
        state.check_result()?;

        let result = state.current_result().unwrap();
        let tx = state.transformer.as_ref().unwrap();
        let rows = tx
            .load_rows(result, state.pos, tx.ntuples())?
            .into_iter()
            .map(|values| Row::new(values, Arc::clone(&state.columns)))
            .collect::<Vec<_>>();
        state.pos += rows.len();
        Ok(rows)
    }

    /// iterate the remaining records; equivalent to repeated `fetchone`.
    pub fn iter_rows(&mut self) -> RowIter<'_, 'c, P> {
        RowIter { cursor: self }
    }

    /// move the read position in the current result.
    pub fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.check_result()?;
        let ntuples = state.current_result().unwrap().ntuples() as i64;
        let newpos = match mode {
            ScrollMode::Relative => state.pos as i64 + value,
            ScrollMode::Absolute => value,
        };
        if !(0..ntuples).contains(&newpos) {
            return Err(Error::interface("position out of bound"));
        }
        state.pos = newpos as usize;
        Ok(())
    }

    /// start a COPY operation and hand its handle to *f*.
    pub fn copy<F, T>(&mut self, statement: impl Into<Query>, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut crate::copy::Copy<'_, P>) -> Result<T, Error>,
    {
        crate::copy::run_copy(self, statement.into(), f)
    }

    /// execute in single row mode and iterate rows as the server sends them.
    ///
    /// the connection lock is held for the whole iteration: abandoning the
    /// stream drains the remaining results on drop.
    pub fn stream<'s>(
        &'s mut self,
        query: impl Into<Query>,
        params: Option<Params>,
        options: ExecuteOptions,
    ) -> Result<RowStream<'s, 'c, P>, Error> {
        let query = query.into();
        let mut inner = self.conn.lock();
        self.start_query(&mut inner)?;

        let mut state = self.state.lock().unwrap();
        let mut transformer = state.transformer.take().unwrap();
        let pgq = PostgresQuery::convert(&query, params.as_ref(), &mut transformer)?;
        state.transformer = Some(transformer);
        drop(state);

        let format = match options.binary {
            Some(true) => Format::Binary,
            Some(false) => Format::Text,
            None => self.format,
        };
        let empty = Default::default();
        let params_out = pgq.params.as_ref().unwrap_or(&empty);
        inner.pq.send_query_params(
            &pgq.query,
            &params_out.params,
            &params_out.types,
            &params_out.formats,
            format,
        )?;
        inner.pq.set_single_row_mode()?;

        Ok(RowStream {
            cursor: self,
            inner,
            first: true,
            done: false,
        })
    }

    pub(crate) fn state_handle(&self) -> Arc<Mutex<CursorState<P>>> {
        Arc::clone(&self.state)
    }
}

fn transformer_placeholder<P: Pq>(inner: &Inner<P>) -> Transformer {
    Transformer::new(Arc::clone(&inner.adapters), inner.session_info())
}

/// iterator over the rows of the current result.
pub struct RowIter<'s, 'c, P: Pq> {
    cursor: &'s mut Cursor<'c, P>,
}

impl<P: Pq> Iterator for RowIter<'_, '_, P> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.fetchone().transpose()
    }
}

/// streaming iterator over a single row mode execution.
pub struct RowStream<'s, 'c, P: Pq> {
    cursor: &'s mut Cursor<'c, P>,
    inner: MutexGuard<'c, Inner<P>>,
    first: bool,
    done: bool,
}

impl<P: Pq> RowStream<'_, '_, P> {
    fn fetch_next(&mut self) -> Result<Option<Row>, Error> {
        if self.done {
            return Ok(None);
        }

        waiting::wait(&mut self.inner.pq, &mut SendMachine, None)?;
        let res = waiting::wait(&mut self.inner.pq, &mut Fetch, None)?;
        let Some(res) = res else {
            self.done = true;
            return Ok(None);
        };

        match res.status() {
            ExecStatus::SingleTuple => {
                let mut state = self.cursor.state.lock().unwrap();
                let set_loaders = self.first;
                let tx = state.transformer.as_mut().unwrap();
                tx.set_result(Some(&res), set_loaders, None)?;
                if self.first {
                    state.columns = (0..res.nfields())
                        .map(|i| Column::from_result(&res, i))
                        .collect::<Vec<_>>()
                        .into();
                }
                self.first = false;
                let tx = state.transformer.as_ref().unwrap();
                let values = tx
                    .load_row(&res, 0)?
                    .ok_or_else(|| Error::internal("single row result without a row"))?;
                let row = Row::new(values, Arc::clone(&state.columns));
                Ok(Some(row))
            }
            ExecStatus::TuplesOk | ExecStatus::CommandOk => {
                // end of the stream: drain the final results
                let status = res.status();
                self.drain();
                self.done = true;
                if status != ExecStatus::TuplesOk {
                    return Err(Error::programming(
                        "the operation in stream() didn't produce a result",
                    ));
                }
                Ok(None)
            }
            _ => {
                self.done = true;
                let err = Error::from_result(&res);
                self.drain();
                Err(err)
            }
        }
    }

    fn drain(&mut self) {
        loop {
            match waiting::wait(&mut self.inner.pq, &mut Fetch, None) {
                Ok(None) | Err(_) => break,
                Ok(Some(_)) => continue,
            }
        }
    }
}

impl<P: Pq> Iterator for RowStream<'_, '_, P> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_next().transpose()
    }
}

impl<P: Pq> Drop for RowStream<'_, '_, P> {
    fn drop(&mut self) {
        if !self.done {
            self.drain();
        }
    }
}

impl<P: Pq> Drop for Cursor<'_, P> {
    fn drop(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockColumn, MockPq, MockResult, Sent};
    use crate::types::Value;
    use postgres_types::Type;

    fn connect() -> Connection<MockPq> {
        Connection::<MockPq>::connect("dbname=test").unwrap()
    }

    fn connect_autocommit() -> Connection<MockPq> {
        let conn = connect();
        conn.set_autocommit(true).unwrap();
        conn
    }

    fn one_col_rows(rows: &[i32]) -> MockResult {
        MockResult::tuples(
            vec![MockColumn::new("n", &Type::INT4)],
            rows.iter()
                .map(|n| vec![Some(n.to_string().into_bytes())])
                .collect(),
        )
    }

    #[test]
    fn execute_and_fetch_typed_rows() {
        let conn = connect();
        conn.lock().pq.expect(vec![one_col_rows(&[1, 2, 3])]);

        let mut cursor = conn.cursor();
        cursor.execute("select n from t", None).unwrap();
        assert_eq!(cursor.rowcount(), 3);
        assert_eq!(cursor.rownumber(), Some(0));

        let row = cursor.fetchone().unwrap().unwrap();
        assert_eq!(row.get(0).unwrap(), &Value::Int(1));
        let rest = cursor.fetchall().unwrap();
        assert_eq!(rest.len(), 2);
        assert!(cursor.fetchone().unwrap().is_none());
    }

    #[test]
    fn iteration_is_equivalent_to_fetchone() {
        let conn = connect();
        conn.lock().pq.expect(vec![one_col_rows(&[1, 2])]);
        let mut cursor = conn.cursor();
        cursor.execute("select n from t", None).unwrap();
        let values: Vec<Row> = cursor.iter_rows().map(|r| r.unwrap()).collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn fetch_without_result_errors() {
        let conn = connect();
        let mut cursor = conn.cursor();
        assert!(cursor.fetchone().is_err());

        conn.lock().pq.expect(vec![MockResult::command_ok("INSERT 0 1")]);
        cursor.execute("insert into t values (1)", None).unwrap();
        assert_eq!(cursor.rowcount(), 1);
        let err = cursor.fetchone().unwrap_err();
        assert!(err.to_string().contains("didn't produce a result"));
    }

    #[test]
    fn parameters_go_through_extended_protocol() {
        let conn = connect_autocommit();
        conn.lock().pq.expect(vec![one_col_rows(&[1])]);
        let mut cursor = conn.cursor();
        cursor
            .execute("select %s", Some(Params::positional([1i64])))
            .unwrap();

        let sent = conn.lock().pq.take_sent();
        match &sent[..] {
            [Sent::QueryParams { query, params, types, .. }] => {
                assert_eq!(query, "select $1");
                assert_eq!(params[0], Some(b"1".to_vec()));
                assert_eq!(types[0], Type::INT2.oid(), "1 promotes to int2");
            }
            other => panic!("unexpected traffic: {other:?}"),
        }
    }

    #[test]
    fn no_params_text_goes_through_simple_protocol() {
        let conn = connect_autocommit();
        let mut cursor = conn.cursor();
        cursor.execute("select 1; select 2", None).unwrap();
        let sent = conn.lock().pq.take_sent();
        assert!(matches!(&sent[..], [Sent::Query(q)] if q == "select 1; select 2"));
    }

    #[test]
    fn multi_statement_results_navigate_with_nextset() {
        let conn = connect();
        conn.lock()
            .pq
            .expect(vec![one_col_rows(&[1]), one_col_rows(&[2, 3])]);
        let mut cursor = conn.cursor();
        cursor.execute("select 1; select 2", None).unwrap();

        assert_eq!(cursor.fetchall().unwrap().len(), 1);
        assert!(cursor.nextset().unwrap());
        assert_eq!(cursor.rowcount(), 2);
        assert_eq!(cursor.fetchall().unwrap().len(), 2);
        assert!(!cursor.nextset().unwrap());
    }

    #[test]
    fn fatal_error_result_becomes_typed_error() {
        let conn = connect();
        conn.lock()
            .pq
            .expect(vec![MockResult::error("42P01", "relation \"nope\" does not exist")]);
        let mut cursor = conn.cursor();
        let err = cursor.execute("select * from nope", None).unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Programming);
        assert_eq!(err.sqlstate(), Some("42P01"));
    }

    #[test]
    fn copy_status_requires_copy_method() {
        let conn = connect();
        conn.lock()
            .pq
            .expect(vec![MockResult::with_status(ExecStatus::CopyIn)]);
        let mut cursor = conn.cursor();
        let err = cursor.execute("copy t from stdin", None).unwrap_err();
        assert!(err.to_string().contains("use copy() instead"));
    }

    #[test]
    fn scroll_moves_and_validates() {
        let conn = connect();
        conn.lock().pq.expect(vec![one_col_rows(&[0, 1, 2, 3, 4])]);
        let mut cursor = conn.cursor();
        cursor.execute("select n", None).unwrap();

        cursor.scroll(3, ScrollMode::Absolute).unwrap();
        let row = cursor.fetchone().unwrap().unwrap();
        assert_eq!(row.get(0).unwrap(), &Value::Int(3));

        cursor.scroll(-2, ScrollMode::Relative).unwrap();
        let row = cursor.fetchone().unwrap().unwrap();
        assert_eq!(row.get(0).unwrap(), &Value::Int(2));

        let err = cursor.scroll(100, ScrollMode::Relative).unwrap_err();
        assert!(err.to_string().contains("position out of bound"));
        // position unchanged after the failed scroll
        let row = cursor.fetchone().unwrap().unwrap();
        assert_eq!(row.get(0).unwrap(), &Value::Int(3));
    }

    #[test]
    fn closed_cursor_refuses_execution() {
        let conn = connect();
        let mut cursor = conn.cursor();
        cursor.close();
        let err = cursor.execute("select 1", None).unwrap_err();
        assert!(err.to_string().contains("cursor is closed"));
    }

    #[test]
    fn executemany_sums_rowcounts() {
        let conn = connect();
        {
            let mut inner = conn.lock();
            inner.prepared.prepare_threshold = Some(5);
            for _ in 0..2 {
                inner.pq.expect(vec![MockResult::command_ok("INSERT 0 1")]);
            }
        }
        let mut cursor = conn.cursor();
        cursor
            .executemany(
                "insert into t values (%s)",
                vec![Params::positional([1i32]), Params::positional([2i32])],
                false,
            )
            .unwrap();
        assert_eq!(cursor.rowcount(), 2);

        // executemany forces preparing: the first traffic is a Prepare
        let sent = conn.lock().pq.take_sent();
        assert!(
            matches!(&sent[1], Sent::Prepare { .. }),
            "expected prepare after BEGIN, got {sent:?}"
        );
    }

    #[test]
    fn stream_yields_rows_one_by_one() {
        let conn = connect();
        conn.lock().pq.expect(vec![one_col_rows(&[7, 8])]);
        let mut cursor = conn.cursor();
        let rows: Vec<Row> = cursor
            .stream("select n", None, ExecuteOptions::default())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(0).unwrap(), &Value::Int(8));
    }
}
