//! named server side cursors, navigated with `FETCH` and `MOVE`.

use std::sync::Arc;

use super::{
    column::Column,
    connection::{Connection, Inner},
    cursor::{Cursor, ScrollMode},
    errors::Error,
    generators::Execute,
    pq::{ExecStatus, Pq, PqResult, TransactionStatus},
    queries::{Params, PostgresQuery, Query},
    rows::Row,
    sql::{identifier, literal, sql, Composable},
};

const DEFAULT_ITERSIZE: usize = 100;

/// a cursor holding its result set on the backend.
///
/// `execute` declares the cursor; rows are then pulled over in batches.
pub struct ServerCursor<'c, P: Pq> {
    cursor: Cursor<'c, P>,
    name: String,
    described: bool,
    /// rows fetched per round trip when iterating.
    pub itersize: usize,
}

impl<'c, P: Pq> ServerCursor<'c, P> {
    pub(crate) fn new(conn: &'c Connection<P>, name: &str) -> Self {
        Self {
            cursor: Cursor::new(conn),
            name: name.to_string(),
            described: false,
            itersize: DEFAULT_ITERSIZE,
        }
    }

    /// the name of the cursor.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rowcount(&self) -> i64 {
        self.cursor.rowcount()
    }

    pub fn rownumber(&self) -> Option<usize> {
        self.cursor.rownumber()
    }

    pub fn description(&self) -> Option<Vec<Column>> {
        self.cursor.description()
    }

    pub fn closed(&self) -> bool {
        self.cursor.closed()
    }

    /// declare the cursor over *query*.
    pub fn execute(
        &mut self,
        query: impl Into<Query>,
        params: Option<Params>,
        scrollable: Option<bool>,
        withhold: bool,
    ) -> Result<(), Error> {
        let declare = self.make_declare_statement(query.into(), scrollable, withhold);

        let conn = self.cursor.connection();
        // a reused cursor must close its previous incarnation first
        if self.described {
            self.close()?;
            let mut state = self.cursor.state.lock().unwrap();
            state.closed = false;
            self.described = false;
        }

        let mut inner = conn.lock();
        self.start(&mut inner)?;

        let state_handle = self.cursor.state_handle();
        let mut state = state_handle.lock().unwrap();
        let mut transformer = state.transformer.take().unwrap();
        let pgq = PostgresQuery::convert(&Query::Sql(declare), params.as_ref(), &mut transformer);
        state.transformer = Some(transformer);
        drop(state);
        let pgq = pgq?;

        // always the extended protocol: DECLARE must stay a single statement
        let empty = crate::transform::DumpedParams::default();
        let dumped = pgq.params.as_ref().unwrap_or(&empty);
        inner.pq.send_query_params(
            &pgq.query,
            &dumped.params,
            &dumped.types,
            &dumped.formats,
            crate::pq::Format::Text,
        )?;
        let results = conn.run(&mut inner, &mut Execute::new())?;
        match results.last().map(|r| r.status()) {
            Some(ExecStatus::CommandOk) => {}
            _ => {
                crate::cursor::raise_from_results(&results)?;
                return Err(Error::internal("DECLARE produced no result"));
            }
        }

        self.describe(&mut inner)?;
        Ok(())
    }

    fn start(&self, inner: &mut Inner<P>) -> Result<(), Error> {
        if self.cursor.closed() {
            return Err(Error::interface("the cursor is closed"));
        }
        inner.check_connection_ok()?;
        inner.start_query()?;

        let state_handle = self.cursor.state_handle();
        let mut state = state_handle.lock().unwrap();
        state.reset();
        state.transformer = Some(crate::transform::Transformer::new(
            Arc::clone(&inner.adapters),
            inner.session_info(),
        ));
        Ok(())
    }

    /// learn the shape of the cursor from a portal description.
    fn describe(&mut self, inner: &mut Inner<P>) -> Result<(), Error> {
        inner.pq.send_describe_portal(self.name.as_bytes())?;
        let results = self.cursor.connection().run(inner, &mut Execute::new())?;
        let state_handle = self.cursor.state_handle();
        let mut state = state_handle.lock().unwrap();
        // the describe result always reports text columns: force the format
        // the cursor will actually fetch in
        state.set_results(results, Some(crate::pq::Format::Text))?;
        state.rowcount = -1;
        self.described = true;
        Ok(())
    }

    fn make_declare_statement(
        &self,
        query: Query,
        scrollable: Option<bool>,
        withhold: bool,
    ) -> Composable {
        let inner_query = match query {
            Query::Text(text) => sql(text),
            Query::Sql(composed) => composed,
        };
        let mut parts = vec![sql("DECLARE"), identifier([self.name.as_str()])];
        if let Some(scrollable) = scrollable {
            parts.push(sql(if scrollable { "SCROLL" } else { "NO SCROLL" }));
        }
        parts.push(sql("CURSOR"));
        if withhold {
            parts.push(sql("WITH HOLD"));
        }
        parts.push(sql("FOR"));
        parts.push(inner_query);
        sql(" ").join(parts)
    }

    /// fetch at most *count* rows from the backend portal, all with `None`.
    fn fetch_from_server(&mut self, count: Option<usize>) -> Result<Vec<Row>, Error> {
        let conn = self.cursor.connection();
        let mut inner = conn.lock();
        if !self.described {
            // stealing an existing cursor: learn its shape first
            self.start(&mut inner)?;
            self.describe(&mut inner)?;
        }

        let howmuch = match count {
            Some(count) => literal(count as i64),
            None => sql("ALL"),
        };
        let session = inner.session_info();
        let command = sql("FETCH FORWARD {} FROM {}")
            .format(vec![howmuch, identifier([self.name.as_str()])], &[])?
            .as_bytes(&inner.adapters, &session)?;
        let result = inner
            .exec_command(command)?
            .ok_or_else(|| Error::programming("server cursors cannot be used in pipeline mode"))?;

        let state_handle = self.cursor.state_handle();
        let mut state = state_handle.lock().unwrap();
        let ntuples = result.ntuples();
        let tx = state
            .transformer
            .as_mut()
            .ok_or_else(|| Error::internal("cursor has no transformer"))?;
        // loaders were resolved by the describe round; only rebind counts
        tx.set_result(Some(&result), false, None)?;
        let rows = tx
            .load_rows(&result, 0, ntuples)?
            .into_iter()
            .map(|values| Row::new(values, Arc::clone(&state.columns)))
            .collect::<Vec<_>>();
        state.pos += rows.len();
        Ok(rows)
    }

    pub fn fetchone(&mut self) -> Result<Option<Row>, Error> {
        Ok(self.fetch_from_server(Some(1))?.into_iter().next())
    }

    pub fn fetchmany(&mut self, size: usize) -> Result<Vec<Row>, Error> {
        let size = if size == 0 { self.cursor.arraysize } else { size };
        self.fetch_from_server(Some(size))
    }

    pub fn fetchall(&mut self) -> Result<Vec<Row>, Error> {
        self.fetch_from_server(None)
    }

    /// iterate the whole cursor in `itersize` batches.
    pub fn iter_rows(&mut self) -> ServerRowIter<'_, 'c, P> {
        ServerRowIter {
            cursor: self,
            batch: Vec::new(),
            finished: false,
        }
    }

    /// reposition the backend portal.
    pub fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<(), Error> {
        let conn = self.cursor.connection();
        let mut inner = conn.lock();
        let session = inner.session_info();
        let absolute = match mode {
            ScrollMode::Relative => sql(""),
            ScrollMode::Absolute => sql(" ABSOLUTE"),
        };
        let command = sql("MOVE{} {} FROM {}")
            .format(
                vec![absolute, literal(value), identifier([self.name.as_str()])],
                &[],
            )?
            .as_bytes(&inner.adapters, &session)?;
        inner.exec_command(command)?;
        drop(inner);

        let state_handle = self.cursor.state_handle();
        let mut state = state_handle.lock().unwrap();
        // the backend has no reliable out of bound report for MOVE
        match mode {
            ScrollMode::Relative => {
                state.pos = (state.pos as i64 + value).max(0) as usize;
            }
            ScrollMode::Absolute => state.pos = value.max(0) as usize,
        }
        Ok(())
    }

    /// close the backend portal and this cursor.
    pub fn close(&mut self) -> Result<(), Error> {
        let conn = self.cursor.connection();
        {
            let mut inner = conn.lock();
            let status = inner.pq.transaction_status();
            // in a failed or unknown session state closing would only pile
            // another error on top: skip the command
            if matches!(status, TransactionStatus::Idle | TransactionStatus::Intrans) {
                let mut known = self.described;
                if !known {
                    let session = inner.session_info();
                    let probe = sql("SELECT 1 FROM pg_catalog.pg_cursors WHERE name = {}")
                        .format(vec![literal(self.name.as_str())], &[])?
                        .as_bytes(&inner.adapters, &session)?;
                    known = inner
                        .exec_command(probe)?
                        .map(|res| res.ntuples() > 0)
                        .unwrap_or(false);
                }
                if known {
                    let session = inner.session_info();
                    let command = sql("CLOSE {}")
                        .format(vec![identifier([self.name.as_str()])], &[])?
                        .as_bytes(&inner.adapters, &session)?;
                    inner.exec_command(command)?;
                }
            }
        }
        self.cursor.close();
        Ok(())
    }
}

/// batching iterator over a server side cursor.
pub struct ServerRowIter<'s, 'c, P: Pq> {
    cursor: &'s mut ServerCursor<'c, P>,
    batch: Vec<Row>,
    finished: bool,
}

impl<P: Pq> Iterator for ServerRowIter<'_, '_, P> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.batch.pop() {
            return Some(Ok(row));
        }
        if self.finished {
            return None;
        }
        let itersize = self.cursor.itersize;
        match self.cursor.fetchmany(itersize) {
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
            Ok(mut rows) => {
                if rows.len() < itersize {
                    self.finished = true;
                }
                rows.reverse();
                self.batch = rows;
                self.batch.pop().map(Ok)
            }
        }
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

    fn describe_result() -> MockResult {
        MockResult::tuples(vec![MockColumn::new("n", &Type::INT4)], Vec::new())
    }

    fn fetch_result(values: &[i32]) -> MockResult {
        let rows = values
            .iter()
            .map(|n| vec![Some(n.to_string().into_bytes())])
            .collect();
        let mut r = MockResult::tuples(vec![MockColumn::new("n", &Type::INT4)], rows);
        r = r.tag(&format!("FETCH {}", values.len()));
        r
    }

    #[test]
    fn declare_describe_fetch() {
        let conn = connect();
        conn.lock().pq.expect(vec![describe_result()]);

        let mut cursor = conn.server_cursor("curs");
        cursor
            .execute("select generate_series(0, 9)", None, None, false)
            .unwrap();

        let sent = conn.lock().pq.take_sent();
        let declare = sent
            .iter()
            .find_map(|s| match s {
                Sent::QueryParams { query, .. } => Some(query.clone()),
                _ => None,
            })
            .expect("DECLARE must go through the extended protocol");
        assert_eq!(
            declare,
            "DECLARE \"curs\" CURSOR FOR select generate_series(0, 9)"
        );
        assert!(sent.contains(&Sent::DescribePortal("curs".to_string())));

        conn.lock().pq.expect(vec![fetch_result(&[0, 1, 2])]);
        let rows = cursor.fetchmany(3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].get(0).unwrap(), &Value::Int(2));
        assert_eq!(cursor.rownumber(), Some(3));

        let sent = conn.lock().pq.take_sent();
        assert!(
            matches!(&sent[..], [Sent::Query(q)] if q == "FETCH FORWARD 3 FROM \"curs\""),
            "{sent:?}"
        );
    }

    #[test]
    fn scroll_issues_move() {
        let conn = connect();
        conn.lock().pq.expect(vec![describe_result()]);
        let mut cursor = conn.server_cursor("curs");
        cursor.execute("select 1", None, Some(true), false).unwrap();
        conn.lock().pq.take_sent();

        cursor.scroll(5, ScrollMode::Absolute).unwrap();
        let sent = conn.lock().pq.take_sent();
        assert!(
            matches!(&sent[..], [Sent::Query(q)] if q == "MOVE ABSOLUTE 5 FROM \"curs\""),
            "{sent:?}"
        );
        assert_eq!(cursor.rownumber(), Some(5));
    }

    #[test]
    fn scrollable_and_withhold_render_in_declare() {
        let conn = connect();
        conn.lock().pq.expect(vec![describe_result()]);
        let mut cursor = conn.server_cursor("curs");
        cursor.execute("select 1", None, Some(false), true).unwrap();
        let sent = conn.lock().pq.take_sent();
        let declare = sent
            .iter()
            .find_map(|s| match s {
                Sent::QueryParams { query, .. } => Some(query.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            declare,
            "DECLARE \"curs\" NO SCROLL CURSOR WITH HOLD FOR select 1"
        );
    }

    #[test]
    fn close_skips_when_transaction_failed() {
        let conn = connect();
        conn.lock().pq.expect(vec![describe_result()]);
        let mut cursor = conn.server_cursor("curs");
        cursor.execute("select 1", None, None, false).unwrap();
        conn.lock().pq.take_sent();

        // break the transaction: close must not pile an error on top
        {
            let mut inner = conn.lock();
            inner.pq.expect(vec![MockResult::error("42601", "boom")]);
            let mut c = Cursor::new(&conn);
            drop(inner);
            let _ = c.execute("selec oops", None);
        }
        assert_eq!(
            conn.lock().pq.transaction_status_now(),
            TransactionStatus::Inerror
        );
        conn.lock().pq.take_sent();
        cursor.close().unwrap();
        assert!(conn.lock().pq.take_sent().is_empty());
        assert!(cursor.closed());
    }
}

