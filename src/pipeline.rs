//! pipeline mode: many commands in flight under one round trip.

use std::{
    collections::VecDeque,
    mem,
    sync::{Arc, Mutex},
};

use super::{
    connection::{Connection, Inner},
    cursor::CursorState,
    errors::Error,
    generators::{FetchMany, PipelineCommand, PipelineCommunicate, Send as SendMachine},
    pq::{ConnStatus, ExecStatus, Pq, PqResult, TransactionStatus},
    preparing::Prepare,
    waiting,
};

type PrepareInfo = ((Vec<u8>, Vec<postgres_types::Oid>), Prepare, Vec<u8>);

/// what an enqueued command will produce.
pub(crate) enum PendingResult<P: Pq> {
    /// a sync point or an internal command: results are checked, not kept.
    Marker,
    /// results belong to a cursor, with optional prepare bookkeeping.
    Cursor {
        state: Arc<Mutex<CursorState<P>>>,
        prep: Option<PrepareInfo>,
        single_row: bool,
    },
}

pub(crate) struct PipelineState<P: Pq> {
    pub(crate) level: u32,
    pub(crate) command_queue: VecDeque<PipelineCommand<P>>,
    pub(crate) result_queue: VecDeque<PendingResult<P>>,
}

impl<P: Pq> PipelineState<P> {
    fn new() -> Self {
        Self {
            level: 1,
            command_queue: VecDeque::new(),
            result_queue: VecDeque::new(),
        }
    }
}

/// guard over one level of pipeline mode.
///
/// commands executed while the guard lives are only sent when [`sync`] runs
/// or the guard closes; results reach their cursors at the same moment.
///
/// [`sync`]: Pipeline::sync
pub struct Pipeline<'c, P: Pq> {
    conn: &'c Connection<P>,
    done: bool,
}

impl<'c, P: Pq> Pipeline<'c, P> {
    pub(crate) fn enter(conn: &'c Connection<P>) -> Result<Self, Error> {
        if P::library_version() < 14_00_00 {
            return Err(Error::not_supported(format!(
                "pipeline mode not supported: libpq too old {}; v14 or greater required",
                P::library_version()
            )));
        }
        if P::build_version() < 14_00_00 {
            return Err(Error::not_supported(format!(
                "pipeline mode not supported: module built for {}; v14 or greater required",
                P::build_version()
            )));
        }

        let mut inner = conn.lock();
        let mut needs_sync = false;
        let txn_active = inner.pq.transaction_status() == TransactionStatus::Active;
        match &mut inner.pipeline {
            None => {
                inner.pq.enter_pipeline_mode()?;
                inner.pipeline = Some(PipelineState::new());
            }
            Some(state) => {
                needs_sync = !state.command_queue.is_empty() || txn_active;
                state.level += 1;
            }
        }
        if needs_sync {
            // entering a nested pipeline with work in flight: sync to bring
            // the transaction back to idle first
            sync_pipeline(&mut inner)?;
        }
        Ok(Self { conn, done: false })
    }

    /// send the pending commands, then receive and process every available
    /// result.
    pub fn sync(&self) -> Result<(), Error> {
        let mut inner = self.conn.lock();
        sync_pipeline(&mut inner)
    }

    /// leave this pipeline level, draining outstanding work. errors are
    /// reported instead of logged, unlike dropping the guard.
    pub fn finish(mut self) -> Result<(), Error> {
        self.done = true;
        self.exit()
    }

    fn exit(&mut self) -> Result<(), Error> {
        let mut inner = self.conn.lock();
        let Some(state) = &mut inner.pipeline else {
            return Err(Error::internal("pipeline guard without pipeline state"));
        };
        state.level -= 1;
        if state.level > 0 {
            return Ok(());
        }

        let drained = sync_pipeline(&mut inner);
        if inner.pq.status() != ConnStatus::Bad {
            // this can be genuinely irrecoverable, e.g. after a COPY the
            // backend refuses to exit with uncollected results
            let exited = inner.pq.exit_pipeline_mode();
            inner.pipeline = None;
            drained.and(exited)
        } else {
            inner.pipeline = None;
            drained
        }
    }
}

impl<P: Pq> Drop for Pipeline<'_, P> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.exit() {
            tracing::warn!(error = %e, "error ignored terminating pipeline");
        }
    }
}

/// enqueue a sync point, send everything and process the results.
pub(crate) fn sync_pipeline<P: Pq>(inner: &mut Inner<P>) -> Result<(), Error> {
    enqueue_sync(inner)?;
    communicate(inner)?;
    fetch_pending(inner, false)
}

fn enqueue_sync<P: Pq>(inner: &mut Inner<P>) -> Result<(), Error> {
    let Some(pipeline) = &mut inner.pipeline else {
        return Err(Error::internal("connection is not in pipeline mode"));
    };
    let cmd: PipelineCommand<P> = Box::new(|pq| pq.pipeline_sync());
    pipeline.command_queue.push_back(cmd);
    pipeline.result_queue.push_back(PendingResult::Marker);
    Ok(())
}

fn communicate<P: Pq>(inner: &mut Inner<P>) -> Result<(), Error> {
    let commands = match &mut inner.pipeline {
        Some(pipeline) => mem::take(&mut pipeline.command_queue),
        None => return Err(Error::internal("connection is not in pipeline mode")),
    };
    let mut machine = PipelineCommunicate::new(commands);
    let fetched = waiting::wait(&mut inner.pq, &mut machine, None)?;
    process_fetched(inner, fetched)
}

/// fetch the results still owed to the queue.
///
/// with *flush* set a flush request is sent first, to make sure results can
/// arrive without a sync point.
fn fetch_pending<P: Pq>(inner: &mut Inner<P>, flush: bool) -> Result<(), Error> {
    let pending = match &inner.pipeline {
        Some(pipeline) => !pipeline.result_queue.is_empty(),
        None => false,
    };
    if !pending {
        return Ok(());
    }

    if flush {
        inner.pq.send_flush_request()?;
        waiting::wait(&mut inner.pq, &mut SendMachine, None)?;
    }

    let mut fetched = Vec::new();
    loop {
        let owed = inner
            .pipeline
            .as_ref()
            .map(|p| !p.result_queue.is_empty())
            .unwrap_or(false);
        if !owed {
            break;
        }
        let results = waiting::wait(&mut inner.pq, &mut FetchMany::new(), None)?;
        if results.is_empty() {
            // no more results to fetch, but there may still be commands
            // pending for a later sync
            break;
        }
        let is_sync = results.len() == 1 && results[0].status() == ExecStatus::PipelineSync;
        fetched.push(if is_sync { None } else { Some(results) });
    }
    process_fetched(inner, fetched)
}

/// pair fetched result sets with the queued expectations, in queue order.
fn process_fetched<P: Pq>(
    inner: &mut Inner<P>,
    fetched: Vec<Option<Vec<P::Result>>>,
) -> Result<(), Error> {
    let mut pairs = Vec::with_capacity(fetched.len());
    {
        let Some(pipeline) = &mut inner.pipeline else {
            return Err(Error::internal("connection is not in pipeline mode"));
        };
        for results in fetched {
            let Some(pending) = pipeline.result_queue.pop_front() else {
                return Err(Error::internal("pipeline results not found in queue"));
            };
            pairs.push((pending, results));
        }
    }

    // keep distributing results after a failure: later cursors must learn
    // their fate (usually an aborted pipeline) too
    let mut first_error = None;
    for (pending, results) in pairs {
        if let Err(e) = process_one(inner, pending, results) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn process_one<P: Pq>(
    inner: &mut Inner<P>,
    pending: PendingResult<P>,
    results: Option<Vec<P::Result>>,
) -> Result<(), Error> {
    match pending {
        PendingResult::Marker => {
            let Some(results) = results else { return Ok(()) };
            for result in &results {
                match result.status() {
                    ExecStatus::FatalError => return Err(Error::from_result(result)),
                    ExecStatus::PipelineAborted => return Err(Error::pipeline_aborted()),
                    _ => {}
                }
            }
            Ok(())
        }
        PendingResult::Cursor { state, prep, single_row } => {
            debug_assert!(!single_row, "single row cursors drain their own results");
            let Some(results) = results else {
                return Err(Error::internal("cursor paired with a sync acknowledgement"));
            };
            let mut state = state.lock().unwrap();
            let outcome = state.set_results(results, None);
            if let Some((key, prep, name)) = prep {
                let cmd = inner.prepared.validate(key, prep, &name, &state.results);
                drop(state);
                if let Some(cmd) = cmd {
                    inner.exec_command(cmd)?;
                }
            }
            outcome
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockColumn, MockPq, MockResult, Sent};
    use crate::queries::Params;
    use crate::types::Value;
    use postgres_types::Type;

    fn connect() -> Connection<MockPq> {
        let conn = Connection::<MockPq>::connect("dbname=test").unwrap();
        conn.set_autocommit(true).unwrap();
        conn
    }

    fn select_result(n: i32) -> MockResult {
        MockResult::tuples(
            vec![MockColumn::new("n", &Type::INT4)],
            vec![vec![Some(n.to_string().into_bytes())]],
        )
    }

    #[test]
    fn queued_commands_resolve_on_sync() {
        let conn = connect();
        {
            let mut inner = conn.lock();
            for n in [1, 2, 3] {
                inner.pq.expect(vec![select_result(n)]);
            }
        }

        let pipeline = conn.pipeline().unwrap();
        let mut c1 = conn.cursor();
        let mut c2 = conn.cursor();
        let mut c3 = conn.cursor();
        c1.execute("select %s", Some(Params::positional([1i32]))).unwrap();
        c2.execute("select %s", Some(Params::positional([2i32]))).unwrap();
        c3.execute("select %s", Some(Params::positional([3i32]))).unwrap();

        // nothing fetched yet
        assert!(c1.fetchone().is_err());

        pipeline.sync().unwrap();

        for (cursor, expected) in [(&mut c1, 1), (&mut c2, 2), (&mut c3, 3)] {
            let row = cursor.fetchone().unwrap().unwrap();
            assert_eq!(row.get(0).unwrap(), &Value::Int(expected));
        }
        pipeline.finish().unwrap();
        assert!(conn.lock().pipeline.is_none());
    }

    #[test]
    fn fatal_result_surfaces_and_abort_reaches_later_cursors() {
        let conn = connect();
        {
            let mut inner = conn.lock();
            inner.pq.expect(vec![select_result(1)]);
            inner.pq.expect(vec![MockResult::error("42601", "syntax error")]);
            inner
                .pq
                .expect(vec![MockResult::with_status(ExecStatus::PipelineAborted)]);
        }

        let pipeline = conn.pipeline().unwrap();
        let mut c1 = conn.cursor();
        let mut c2 = conn.cursor();
        let mut c3 = conn.cursor();
        c1.execute("select 1", None).unwrap();
        c2.execute("selec oops", None).unwrap();
        c3.execute("select 3", None).unwrap();

        let err = pipeline.sync().unwrap_err();
        assert_eq!(err.sqlstate(), Some("42601"), "first failure wins: {err}");

        // the first command went through, the third was aborted
        assert!(c1.fetchone().unwrap().is_some());
        let err = c3.fetchone().unwrap_err();
        assert!(err.to_string().contains("no result available"));
        drop(pipeline);
    }

    #[test]
    fn nested_pipeline_issues_a_sync() {
        let conn = connect();
        let outer = conn.pipeline().unwrap();
        {
            let mut inner = conn.lock();
            inner.pq.expect(vec![select_result(1)]);
        }
        let mut cursor = conn.cursor();
        cursor.execute("select 1", None).unwrap();

        let nested = conn.pipeline().unwrap();
        let sent = conn.lock().pq.take_sent();
        assert!(
            sent.contains(&Sent::PipelineSync),
            "nested entry must sync pending work: {sent:?}"
        );
        // the command queued before nesting was resolved by that sync
        assert!(cursor.fetchone().unwrap().is_some());

        nested.finish().unwrap();
        assert!(conn.lock().pipeline.is_some(), "outer level still active");
        outer.finish().unwrap();
        assert!(conn.lock().pipeline.is_none());
    }

    #[test]
    fn pipeline_requires_recent_libpq() {
        // the mock reports libpq 16: entering works
        let conn = connect();
        conn.pipeline().unwrap().finish().unwrap();
    }

    #[test]
    fn implicit_begin_is_synced_through_the_pipeline() {
        let conn = connect();
        conn.set_autocommit(false).unwrap();
        let pipeline = conn.pipeline().unwrap();
        {
            let mut inner = conn.lock();
            inner.pq.expect(vec![select_result(1)]);
        }
        let mut cursor = conn.cursor();
        cursor.execute("select 1", None).unwrap();

        // opening the transaction was flushed right away, query enqueued
        let sent = conn.lock().pq.take_sent();
        assert!(matches!(&sent[0], Sent::Query(q) if q == "BEGIN"), "{sent:?}");
        assert!(sent.contains(&Sent::PipelineSync), "{sent:?}");
        assert!(
            !sent.iter().any(|s| matches!(s, Sent::QueryParams { .. })),
            "query must still be queued: {sent:?}"
        );

        pipeline.sync().unwrap();
        assert!(cursor.fetchone().unwrap().is_some());
        pipeline.finish().unwrap();
    }
}
