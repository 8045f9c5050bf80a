//! connection objects: session lifecycle and transaction orchestration.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use super::{
    adapt::{quote_bytes, AdaptersMap, SessionInfo},
    conninfo::{conninfo_to_dict, make_conninfo, ConnDict},
    cursor::Cursor,
    errors::{Diagnostic, Error},
    generators::{Connect, Execute, Machine, Notifies, PipelineCommand},
    pipeline::{Pipeline, PipelineState},
    pq::{ConnStatus, ExecStatus, Notify, Pq, PqCancel, PqResult, TransactionStatus},
    preparing::PrepareManager,
    queries::{Params, Query},
    server_cursor::ServerCursor,
    tpc::Xid,
    transaction::Transaction,
    types::registry::{TypeInfo, TypeStructure},
    waiting,
};

/// isolation level for new transactions on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

pub type NoticeHandler = Box<dyn Fn(&Diagnostic) + Send + Sync>;
pub type NotifyHandler = Box<dyn Fn(&Notify) + Send + Sync>;

/// options of [`Connection::connect_with`].
#[derive(Default)]
pub struct ConnectOptions {
    /// parameters merged over the connection string; `None` values drop the
    /// key entirely.
    pub overrides: Vec<(String, Option<String>)>,
    pub autocommit: bool,
    /// adapters to inherit instead of the process wide defaults.
    pub context: Option<Arc<AdaptersMap>>,
}

pub(crate) struct Inner<P: Pq> {
    pub(crate) pq: P,
    pub(crate) adapters: Arc<AdaptersMap>,
    pub(crate) prepared: PrepareManager,
    pub(crate) savepoints: Vec<String>,
    pub(crate) tpc: Option<(Xid, bool)>,
    pub(crate) autocommit: bool,
    pub(crate) isolation_level: Option<IsolationLevel>,
    pub(crate) read_only: Option<bool>,
    pub(crate) deferrable: Option<bool>,
    pub(crate) begin_statement: Vec<u8>,
    pub(crate) pipeline: Option<PipelineState<P>>,
    params: ConnDict,
}

impl<P: Pq> Inner<P> {
    /// session facts for a new transformer.
    pub(crate) fn session_info(&self) -> SessionInfo {
        let encoding = self
            .pq
            .parameter_status("client_encoding")
            .unwrap_or_else(|| "UTF8".to_string());
        let timezone = self
            .pq
            .parameter_status("TimeZone")
            .map(|tz| SessionInfo::resolve_timezone(&tz))
            .unwrap_or(chrono_tz::UTC);
        let std_strings = self
            .pq
            .parameter_status("standard_conforming_strings")
            .map_or(true, |v| v == "on");
        SessionInfo {
            encoding,
            timezone,
            std_strings,
            server_version: self.pq.server_version(),
        }
    }

    pub(crate) fn check_connection_ok(&self) -> Result<(), Error> {
        match self.pq.status() {
            ConnStatus::Ok => Ok(()),
            ConnStatus::Bad => Err(Error::operational("the connection is closed")),
            status => Err(Error::interface(format!(
                "cannot execute operations: the connection is in status {status:?}"
            ))),
        }
    }

    /// the `BEGIN` to open the next transaction with, built once and cached
    /// until a session property invalidates it.
    pub(crate) fn tx_start_command(&mut self) -> Vec<u8> {
        if !self.begin_statement.is_empty() {
            return self.begin_statement.clone();
        }
        let mut parts = vec!["BEGIN".to_string()];
        if let Some(level) = self.isolation_level {
            parts.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if let Some(read_only) = self.read_only {
            parts.push(if read_only { "READ ONLY" } else { "READ WRITE" }.to_string());
        }
        if let Some(deferrable) = self.deferrable {
            parts.push(if deferrable { "DEFERRABLE" } else { "NOT DEFERRABLE" }.to_string());
        }
        self.begin_statement = parts.join(" ").into_bytes();
        self.begin_statement.clone()
    }

    /// send an internal command and return its result, or `None` when it
    /// was queued behind an active pipeline.
    pub(crate) fn exec_command(&mut self, command: Vec<u8>) -> Result<Option<P::Result>, Error> {
        self.check_connection_ok()?;

        if let Some(pipeline) = &mut self.pipeline {
            let cmd: PipelineCommand<P> = Box::new(move |pq| pq.send_query(&command));
            pipeline.command_queue.push_back(cmd);
            pipeline.result_queue.push_back(crate::pipeline::PendingResult::Marker);
            return Ok(None);
        }

        self.pq.send_query(&command)?;
        let results = waiting::wait(&mut self.pq, &mut Execute::new(), None)?;
        let result = results
            .into_iter()
            .last()
            .ok_or_else(|| Error::internal("got no result from the command"))?;
        match result.status() {
            ExecStatus::CommandOk | ExecStatus::TuplesOk => Ok(Some(result)),
            ExecStatus::FatalError => Err(Error::from_result(&result)),
            status => Err(Error::interface(format!(
                "unexpected result {} from command",
                status.name()
            ))),
        }
    }

    /// open a transaction implicitly if the session needs one.
    pub(crate) fn start_query(&mut self) -> Result<(), Error> {
        if self.autocommit || self.pq.transaction_status() != TransactionStatus::Idle {
            return Ok(());
        }
        let begin = self.tx_start_command();
        self.exec_command(begin)?;
        if self.pipeline.is_some() {
            crate::pipeline::sync_pipeline(self)?;
        }
        Ok(())
    }

    fn check_intrans(&mut self, attribute: &str) -> Result<(), Error> {
        let mut status = self.pq.transaction_status();
        if status == TransactionStatus::Idle && self.pipeline.is_some() {
            crate::pipeline::sync_pipeline(self)?;
            status = self.pq.transaction_status();
        }
        if status != TransactionStatus::Idle {
            if !self.savepoints.is_empty() {
                return Err(Error::programming(format!(
                    "can't change {attribute:?} now: connection.transaction() context in progress"
                )));
            }
            return Err(Error::programming(format!(
                "can't change {attribute:?} now: connection in transaction status {}",
                status.name()
            )));
        }
        Ok(())
    }
}

/// a single session with the backend.
///
/// the connection owns the wire handle behind a mutex: every operation
/// takes the lock for its whole duration, so one connection is never driven
/// concurrently. Distinct connections are fully independent.
pub struct Connection<P: Pq> {
    inner: Mutex<Inner<P>>,
    cancel: P::Cancel,
    explicitly_closed: AtomicBool,
    tpc_prepared: AtomicBool,
    notice_handlers: Mutex<Vec<NoticeHandler>>,
    notify_handlers: Mutex<Vec<NotifyHandler>>,
}

impl<P: Pq> std::fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl<P: Pq> Connection<P> {
    /// connect to the database described by *conninfo*.
    pub fn connect(conninfo: &str) -> Result<Self, Error> {
        Self::connect_with(conninfo, ConnectOptions::default())
    }

    /// connect with explicit options merged over the connection string.
    pub fn connect_with(conninfo: &str, options: ConnectOptions) -> Result<Self, Error> {
        let dict = conninfo_to_dict(conninfo, to_override_refs(&options.overrides))?;
        let timeout = connect_timeout(&dict)?;
        let conninfo = make_conninfo(&dict);

        let mut machine = Connect::<P>::start(&conninfo)?;
        let pq = waiting::wait_conn(&mut machine, timeout)?;
        Self::from_parts(pq, dict, options)
    }

    pub(crate) fn from_parts(
        pq: P,
        params: ConnDict,
        options: ConnectOptions,
    ) -> Result<Self, Error> {
        let (inner, cancel) = build_inner(pq, params, options)?;
        Ok(Self {
            inner: Mutex::new(inner),
            cancel,
            explicitly_closed: AtomicBool::new(false),
            tpc_prepared: AtomicBool::new(false),
            notice_handlers: Mutex::new(Vec::new()),
            notify_handlers: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner<P>> {
        self.inner.lock().unwrap()
    }

    /// direct access to the wire handle, under the connection lock.
    ///
    /// the escape hatch for functionality the driver does not wrap; with
    /// the scripted test handle it is how expectations are loaded.
    pub fn with_handle<T>(&self, f: impl FnOnce(&mut P) -> T) -> T {
        f(&mut self.lock().pq)
    }

    /// run a machine on the locked handle, then deliver the notices and
    /// notifications that piled up while it ran.
    pub(crate) fn run<M: Machine<P>>(
        &self,
        inner: &mut Inner<P>,
        machine: &mut M,
    ) -> Result<M::Output, Error> {
        let result = waiting::wait(&mut inner.pq, machine, None);
        self.dispatch_async_messages(inner);
        result
    }

    pub(crate) fn dispatch_async_messages(&self, inner: &mut Inner<P>) {
        loop {
            let Some(notice) = inner.pq.next_notice() else { break };
            let handlers = self.notice_handlers.lock().unwrap();
            for handler in handlers.iter() {
                let call = std::panic::AssertUnwindSafe(|| handler(&notice));
                if std::panic::catch_unwind(call).is_err() {
                    tracing::error!("error processing notice callback");
                }
            }
        }
        loop {
            let Some(notify) = inner.pq.notifies() else { break };
            let handlers = self.notify_handlers.lock().unwrap();
            for handler in handlers.iter() {
                let call = std::panic::AssertUnwindSafe(|| handler(&notify));
                if std::panic::catch_unwind(call).is_err() {
                    tracing::error!("error processing notify callback");
                }
            }
        }
    }

    /// `true` after an explicit [`Connection::close`] or a fatal failure.
    pub fn closed(&self) -> bool {
        self.lock().pq.status() == ConnStatus::Bad
    }

    /// `true` when the connection was interrupted rather than closed.
    pub fn broken(&self) -> bool {
        self.closed() && !self.explicitly_closed.load(Ordering::SeqCst)
    }

    /// close the connection now. idempotent.
    pub fn close(&self) {
        self.explicitly_closed.store(true, Ordering::SeqCst);
        self.lock().pq.finish();
    }

    /// request cancellation of the command currently running on the session.
    ///
    /// uses the out of band cancel token, so it is safe to call from another
    /// thread without waiting for the connection lock.
    pub fn cancel(&self) -> Result<(), Error> {
        if self.explicitly_closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.tpc_prepared.load(Ordering::SeqCst) {
            return Err(Error::programming(
                "cancel() cannot be used with a prepared two-phase transaction",
            ));
        }
        self.cancel.cancel()
    }

    /// a cursor to execute queries with.
    pub fn cursor(&self) -> Cursor<'_, P> {
        Cursor::new(self)
    }

    /// a named server side cursor.
    pub fn server_cursor(&self, name: &str) -> ServerCursor<'_, P> {
        ServerCursor::new(self, name)
    }

    /// execute a query on a fresh cursor and return the cursor.
    pub fn execute(
        &self,
        query: impl Into<Query>,
        params: Option<Params>,
    ) -> Result<Cursor<'_, P>, Error> {
        let mut cursor = self.cursor();
        cursor.execute(query, params)?;
        Ok(cursor)
    }

    /// commit any pending work on the session.
    pub fn commit(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        self.commit_locked(&mut inner)
    }

    pub(crate) fn commit_locked(&self, inner: &mut Inner<P>) -> Result<(), Error> {
        if !inner.savepoints.is_empty() {
            return Err(Error::programming(
                "Explicit commit() forbidden within a Transaction context. \
                 (Transaction will be automatically committed on successful exit from context.)",
            ));
        }
        if inner.tpc.is_some() {
            return Err(Error::programming(
                "commit() cannot be used during a two-phase transaction",
            ));
        }
        if inner.pq.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        inner.exec_command(b"COMMIT".to_vec())?;
        if inner.pipeline.is_some() {
            crate::pipeline::sync_pipeline(inner)?;
        }
        Ok(())
    }

    /// roll back any pending work on the session.
    pub fn rollback(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        self.rollback_locked(&mut inner)
    }

    pub(crate) fn rollback_locked(&self, inner: &mut Inner<P>) -> Result<(), Error> {
        if !inner.savepoints.is_empty() {
            return Err(Error::programming(
                "Explicit rollback() forbidden within a Transaction context. \
                 (Either raise Rollback() or allow an exception to propagate out of the context.)",
            ));
        }
        if inner.tpc.is_some() {
            return Err(Error::programming(
                "rollback() cannot be used during a two-phase transaction",
            ));
        }

        // get out of a "pipeline aborted" state beforehand
        if inner.pipeline.is_some() {
            crate::pipeline::sync_pipeline(inner)?;
        }
        if inner.pq.transaction_status() == TransactionStatus::Idle {
            return Ok(());
        }
        inner.exec_command(b"ROLLBACK".to_vec())?;
        if let Some(cmd) = inner.prepared.clear() {
            inner.exec_command(cmd)?;
        }
        if inner.pipeline.is_some() {
            crate::pipeline::sync_pipeline(inner)?;
        }
        Ok(())
    }

    /// open a transaction block, or a savepoint when one is already open.
    pub fn transaction(&self) -> Result<Transaction<'_, P>, Error> {
        Transaction::begin(self, None, false)
    }

    /// like [`Connection::transaction`] with an explicit savepoint name and
    /// the option of rolling back on exit even without an error.
    pub fn transaction_with(
        &self,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<Transaction<'_, P>, Error> {
        Transaction::begin(self, savepoint_name, force_rollback)
    }

    /// enter pipeline mode, or a nested level of it.
    pub fn pipeline(&self) -> Result<Pipeline<'_, P>, Error> {
        Pipeline::enter(self)
    }

    /// wait for, then return the asynchronous notifications received.
    pub fn notifies(&self) -> Result<Vec<Notify>, Error> {
        let mut inner = self.lock();
        let ns = waiting::wait(&mut inner.pq, &mut Notifies::new(), None)?;
        let handlers = self.notify_handlers.lock().unwrap();
        for n in &ns {
            for handler in handlers.iter() {
                handler(n);
            }
        }
        Ok(ns)
    }

    pub fn add_notice_handler(&self, handler: NoticeHandler) {
        self.notice_handlers.lock().unwrap().push(handler);
    }

    pub fn add_notify_handler(&self, handler: NotifyHandler) {
        self.notify_handlers.lock().unwrap().push(handler);
    }

    pub fn autocommit(&self) -> bool {
        self.lock().autocommit
    }

    pub fn set_autocommit(&self, value: bool) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.check_intrans("autocommit")?;
        inner.autocommit = value;
        Ok(())
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.lock().isolation_level
    }

    pub fn set_isolation_level(&self, value: Option<IsolationLevel>) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.check_intrans("isolation_level")?;
        inner.isolation_level = value;
        inner.begin_statement.clear();
        Ok(())
    }

    pub fn read_only(&self) -> Option<bool> {
        self.lock().read_only
    }

    pub fn set_read_only(&self, value: Option<bool>) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.check_intrans("read_only")?;
        inner.read_only = value;
        inner.begin_statement.clear();
        Ok(())
    }

    pub fn deferrable(&self) -> Option<bool> {
        self.lock().deferrable
    }

    pub fn set_deferrable(&self, value: Option<bool>) -> Result<(), Error> {
        let mut inner = self.lock();
        inner.check_intrans("deferrable")?;
        inner.deferrable = value;
        inner.begin_statement.clear();
        Ok(())
    }

    /// number of executions before a statement is prepared server side.
    pub fn prepare_threshold(&self) -> Option<u32> {
        self.lock().prepared.prepare_threshold
    }

    pub fn set_prepare_threshold(&self, value: Option<u32>) {
        self.lock().prepared.prepare_threshold = value;
    }

    /// bound on the prepared statement cache.
    pub fn prepared_max(&self) -> usize {
        self.lock().prepared.prepared_max
    }

    pub fn set_prepared_max(&self, value: usize) {
        self.lock().prepared.prepared_max = value;
    }

    /// mutate the connection's adapters map, shadowing the shared defaults.
    pub fn with_adapters<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut AdaptersMap) -> T,
    {
        let mut inner = self.lock();
        f(Arc::make_mut(&mut inner.adapters))
    }

    /// facts about the session.
    pub fn info(&self) -> ConnectionInfo<'_, P> {
        ConnectionInfo { conn: self }
    }

    //
    // two phase commit
    //

    /// a validated xid for the `tpc_*` methods.
    pub fn xid(&self, format_id: i32, gtrid: &str, bqual: &str) -> Result<Xid, Error> {
        Xid::from_parts(format_id, gtrid, bqual)
    }

    /// begin a two phase transaction with the given xid.
    pub fn tpc_begin(&self, xid: Xid) -> Result<(), Error> {
        let mut inner = self.lock();
        let status = inner.pq.transaction_status();
        if status != TransactionStatus::Idle {
            return Err(Error::programming(format!(
                "can't start two-phase transaction: connection in status {}",
                status.name()
            )));
        }
        if inner.autocommit {
            return Err(Error::programming(
                "can't use two-phase transactions in autocommit mode",
            ));
        }
        inner.tpc = Some((xid, false));
        let begin = inner.tx_start_command();
        inner.exec_command(begin)?;
        Ok(())
    }

    /// issue `PREPARE TRANSACTION` for the active two phase transaction.
    pub fn tpc_prepare(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let Some((xid, prepared)) = inner.tpc.take() else {
            return Err(Error::programming(
                "'tpc_prepare()' must be called inside a two-phase transaction",
            ));
        };
        if prepared {
            inner.tpc = Some((xid, true));
            return Err(Error::programming(
                "'tpc_prepare()' cannot be used during a prepared two-phase transaction",
            ));
        }
        let command = tpc_command("PREPARE TRANSACTION", &xid);
        inner.tpc = Some((xid, true));
        inner.exec_command(command)?;
        self.tpc_prepared.store(true, Ordering::SeqCst);
        if inner.pipeline.is_some() {
            crate::pipeline::sync_pipeline(&mut inner)?;
        }
        Ok(())
    }

    /// commit the active two phase transaction, or a recovered *xid*.
    pub fn tpc_commit(&self, xid: Option<Xid>) -> Result<(), Error> {
        self.tpc_finish("COMMIT", xid)
    }

    /// roll back the active two phase transaction, or a recovered *xid*.
    pub fn tpc_rollback(&self, xid: Option<Xid>) -> Result<(), Error> {
        self.tpc_finish("ROLLBACK", xid)
    }

    fn tpc_finish(&self, action: &str, xid: Option<Xid>) -> Result<(), Error> {
        let mut inner = self.lock();
        let fname = format!("tpc_{}()", action.to_lowercase());
        let (xid, prepared) = match xid {
            None => match inner.tpc.take() {
                Some(state) => state,
                None => {
                    return Err(Error::programming(format!(
                        "{fname} without xid must be called inside a two-phase transaction"
                    )))
                }
            },
            Some(xid) => {
                if inner.tpc.is_some() {
                    return Err(Error::programming(format!(
                        "{fname} with xid must be called outside a two-phase transaction"
                    )));
                }
                (xid, true)
            }
        };
        self.tpc_prepared.store(false, Ordering::SeqCst);

        if prepared {
            let command = tpc_command(&format!("{action} PREPARED"), &xid);
            inner.exec_command(command)?;
        } else if action == "COMMIT" {
            self.commit_locked(&mut inner)?;
        } else {
            self.rollback_locked(&mut inner)?;
        }
        Ok(())
    }

    /// xids of transactions prepared on the database and pending recovery.
    pub fn tpc_recover(&self) -> Result<Vec<Xid>, Error> {
        let mut inner = self.lock();
        let result = inner
            .exec_command(b"SELECT gid FROM pg_catalog.pg_prepared_xacts".to_vec())?
            .ok_or_else(|| Error::programming("tpc_recover() cannot run inside a pipeline"))?;
        let mut xids = Vec::new();
        for row in 0..result.ntuples() {
            if let Some(gid) = result.get_value(row, 0) {
                xids.push(Xid::from_string(&String::from_utf8_lossy(gid)));
            }
        }
        Ok(xids)
    }

    /// fetch the description of a non builtin type from the catalog.
    pub fn fetch_type_info(&self, name: &str) -> Result<TypeInfo, Error> {
        let mut cursor = self.cursor();
        cursor.execute(
            TYPEINFO_QUERY,
            Some(Params::positional([name])),
        )?;
        let Some(row) = cursor.fetchone()? else {
            return Err(Error::programming(format!("type {name:?} not found")));
        };

        let type_name = text_field(&row, 0)?;
        let oid = int_field(&row, 1)? as u32;
        let array_oid = int_field(&row, 2)? as u32;
        let typtype = text_field(&row, 3)?;
        let rngsubtype = row.get(4).ok().and_then(|v| v.as_int()).unwrap_or(0) as u32;
        let relid = int_field(&row, 5)? as u32;
        drop(cursor);

        let structure = match typtype.as_str() {
            "e" => {
                let mut cursor = self.cursor();
                cursor.execute(TYPEINFO_ENUM_QUERY, Some(Params::positional([oid as i64])))?;
                let labels = cursor
                    .fetchall()?
                    .into_iter()
                    .map(|row| text_field(&row, 0))
                    .collect::<Result<Vec<_>, _>>()?;
                TypeStructure::Enum { labels }
            }
            "c" => {
                let mut cursor = self.cursor();
                cursor.execute(
                    TYPEINFO_COMPOSITE_QUERY,
                    Some(Params::positional([relid as i64])),
                )?;
                let fields = cursor
                    .fetchall()?
                    .into_iter()
                    .map(|row| {
                        Ok((text_field(&row, 0)?, int_field(&row, 1)? as u32))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                TypeStructure::Composite { fields }
            }
            "r" => TypeStructure::Range { subtype: rngsubtype },
            _ => TypeStructure::Base,
        };

        Ok(TypeInfo::new(type_name, oid, array_oid).with_structure(structure))
    }
}

impl<P: Pq> Drop for Connection<P> {
    fn drop(&mut self) {
        if !self.closed() {
            self.close();
        }
    }
}

/// build the shared per connection state; used by both universes.
pub(crate) fn build_inner<P: Pq>(
    pq: P,
    params: ConnDict,
    options: ConnectOptions,
) -> Result<(Inner<P>, P::Cancel), Error> {
    let cancel = pq.get_cancel()?;
    let parent = options
        .context
        .unwrap_or_else(|| Arc::clone(crate::global_adapters()));
    let inner = Inner {
        pq,
        adapters: Arc::new(AdaptersMap::inheriting(parent)),
        prepared: PrepareManager::new(),
        savepoints: Vec::new(),
        tpc: None,
        autocommit: options.autocommit,
        isolation_level: None,
        read_only: None,
        deferrable: None,
        begin_statement: Vec::new(),
        pipeline: None,
        params,
    };
    Ok((inner, cancel))
}

const TYPEINFO_QUERY: &str = "\
SELECT t.typname, t.oid, t.typarray, t.typtype, r.rngsubtype, t.typrelid \
FROM pg_catalog.pg_type t \
LEFT OUTER JOIN pg_catalog.pg_range r ON r.rngtypid = t.oid \
INNER JOIN pg_catalog.pg_namespace n ON t.typnamespace = n.oid \
WHERE t.typname = %s";

const TYPEINFO_ENUM_QUERY: &str = "\
SELECT enumlabel FROM pg_catalog.pg_enum \
WHERE enumtypid = %s ORDER BY enumsortorder";

const TYPEINFO_COMPOSITE_QUERY: &str = "\
SELECT attname, atttypid FROM pg_catalog.pg_attribute \
WHERE attrelid = %s AND NOT attisdropped AND attnum > 0 \
ORDER BY attnum";

fn tpc_command(action: &str, xid: &Xid) -> Vec<u8> {
    let mut command = action.as_bytes().to_vec();
    command.push(b' ');
    command.extend_from_slice(&quote_bytes(xid.to_string().as_bytes()));
    command
}

fn text_field(row: &crate::rows::Row, index: usize) -> Result<String, Error> {
    match row.get(index)? {
        crate::types::Value::Text(s) => Ok(s.clone()),
        other => Err(Error::data(format!(
            "expected a text column, got {:?}",
            other.kind()
        ))),
    }
}

fn int_field(row: &crate::rows::Row, index: usize) -> Result<i64, Error> {
    row.get(index)?
        .as_int()
        .ok_or_else(|| Error::data("expected an integer column"))
}

fn to_override_refs(
    overrides: &[(String, Option<String>)],
) -> impl Iterator<Item = (&str, Option<String>)> {
    overrides.iter().map(|(k, v)| (k.as_str(), v.clone()))
}

fn connect_timeout(dict: &ConnDict) -> Result<Option<Duration>, Error> {
    let Some(raw) = dict.get("connect_timeout") else {
        return Ok(None);
    };
    let seconds: i64 = raw
        .parse::<f64>()
        .map(|v| v as i64)
        .map_err(|_| Error::programming(format!("bad value for connect_timeout: {raw:?}")))?;
    Ok((seconds > 0).then(|| Duration::from_secs(seconds as u64)))
}

/// inspection of connection properties.
pub struct ConnectionInfo<'a, P: Pq> {
    conn: &'a Connection<P>,
}

impl<P: Pq> ConnectionInfo<'_, P> {
    fn param(&self, name: &str) -> String {
        self.conn.lock().params.get(name).cloned().unwrap_or_default()
    }

    pub fn host(&self) -> String {
        self.param("host")
    }

    pub fn port(&self) -> Option<u16> {
        self.conn
            .lock()
            .params
            .get("port")
            .and_then(|p| p.parse().ok())
    }

    pub fn dbname(&self) -> String {
        self.param("dbname")
    }

    pub fn user(&self) -> String {
        self.param("user")
    }

    pub fn options(&self) -> String {
        self.param("options")
    }

    /// the connection parameters. the password is never included.
    pub fn get_parameters(&self) -> ConnDict {
        let mut params = self.conn.lock().params.clone();
        params.remove("password");
        params
    }

    /// the connection string, reconstructed. the password is never included.
    pub fn dsn(&self) -> String {
        make_conninfo(&self.get_parameters())
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.conn.lock().pq.transaction_status()
    }

    pub fn parameter_status(&self, name: &str) -> Option<String> {
        self.conn.lock().pq.parameter_status(name)
    }

    pub fn server_version(&self) -> u32 {
        self.conn.lock().pq.server_version()
    }

    pub fn backend_pid(&self) -> i32 {
        self.conn.lock().pq.backend_pid()
    }

    pub fn encoding(&self) -> String {
        self.conn.lock().session_info().encoding
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.conn.lock().session_info().timezone
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pq::mock::{MockPq, Sent};

    fn connect() -> Connection<MockPq> {
        Connection::<MockPq>::connect("dbname=test user=me").unwrap()
    }

    #[test]
    fn connect_and_close_round_trip() {
        let conn = connect();
        assert!(!conn.closed());
        conn.close();
        assert!(conn.closed());
        assert!(!conn.broken());
        // close is idempotent, cancel after close is a no-op
        conn.close();
        conn.cancel().unwrap();
    }

    #[test]
    fn broken_connection_is_not_cleanly_closed() {
        let conn = connect();
        conn.lock().pq.kill();
        assert!(conn.closed());
        assert!(conn.broken());
    }

    #[test]
    fn commit_and_rollback_on_idle_are_no_ops() {
        let conn = connect();
        conn.commit().unwrap();
        conn.rollback().unwrap();
        assert!(conn.lock().pq.take_sent().is_empty());
    }

    #[test]
    fn first_query_in_a_transaction_sends_begin() {
        let conn = connect();
        let mut inner = conn.lock();
        inner.start_query().unwrap();
        let sent = inner.pq.take_sent();
        assert_eq!(sent, vec![Sent::Query("BEGIN".to_string())]);
        assert_eq!(
            inner.pq.transaction_status_now(),
            TransactionStatus::Intrans
        );
        // in a transaction now: no second BEGIN
        inner.start_query().unwrap();
        assert!(inner.pq.take_sent().is_empty());
    }

    #[test]
    fn begin_statement_reflects_session_properties() {
        let conn = connect();
        conn.set_isolation_level(Some(IsolationLevel::Serializable)).unwrap();
        conn.set_read_only(Some(true)).unwrap();
        conn.set_deferrable(Some(true)).unwrap();
        let begin = conn.lock().tx_start_command();
        assert_eq!(
            String::from_utf8(begin).unwrap(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE"
        );

        conn.set_read_only(None).unwrap();
        let begin = conn.lock().tx_start_command();
        assert_eq!(
            String::from_utf8(begin).unwrap(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE DEFERRABLE"
        );
    }

    #[test]
    fn session_properties_cannot_change_in_transaction() {
        let conn = connect();
        conn.lock().start_query().unwrap();
        let err = conn.set_autocommit(true).unwrap_err();
        assert!(err.to_string().contains("can't change"));
    }

    #[test]
    fn autocommit_skips_begin() {
        let conn = Connection::<MockPq>::connect_with(
            "dbname=test",
            ConnectOptions {
                autocommit: true,
                ..Default::default()
            },
        )
        .unwrap();
        let mut inner = conn.lock();
        inner.start_query().unwrap();
        assert!(inner.pq.take_sent().is_empty());
    }

    #[test]
    fn tpc_begin_prepare_commit() {
        let conn = connect();
        let xid = conn.xid(1, "gtrid", "bqual").unwrap();
        conn.tpc_begin(xid.clone()).unwrap();
        conn.tpc_prepare().unwrap();

        let err = conn.cancel().unwrap_err();
        assert!(err.to_string().contains("two-phase"));

        conn.tpc_commit(None).unwrap();
        let sent = conn.lock().pq.take_sent();
        let all = format!("{sent:?}");
        assert!(all.contains("PREPARE TRANSACTION"), "{all}");
        assert!(all.contains("COMMIT PREPARED"), "{all}");
    }

    #[test]
    fn tpc_commit_without_transaction_is_rejected() {
        let conn = connect();
        assert!(conn.tpc_commit(None).is_err());
        // with an explicit xid it is a recovery commit and works
        let xid = conn.xid(1, "a", "b").unwrap();
        conn.tpc_commit(Some(xid)).unwrap();
    }

    #[test]
    fn commit_forbidden_during_tpc() {
        let conn = connect();
        let xid = conn.xid(1, "gtrid", "bqual").unwrap();
        conn.tpc_begin(xid).unwrap();
        assert!(conn.commit().is_err());
        assert!(conn.rollback().is_err());
    }

    #[test]
    fn tpc_begin_requires_no_autocommit() {
        let conn = connect();
        conn.set_autocommit(true).unwrap();
        let xid = conn.xid(1, "g", "b").unwrap();
        assert!(conn.tpc_begin(xid).is_err());
    }

    #[test]
    fn notice_handlers_receive_diagnostics() {
        let conn = connect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        conn.add_notice_handler(Box::new(move |diag| {
            seen2.lock().unwrap().push(diag.message_primary.clone());
        }));

        let mut inner = conn.lock();
        inner.pq.queue_notice("WARNING", "be careful");
        inner.pq.send_query(b"select 1").unwrap();
        conn.run(&mut inner, &mut Execute::new()).unwrap();
        drop(inner);

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [Some("be careful".to_string())]
        );
    }

    #[test]
    fn info_never_exposes_password() {
        let conn = Connection::<MockPq>::connect("dbname=test password=secret").unwrap();
        assert!(!conn.info().get_parameters().contains_key("password"));
        assert!(!conn.info().dsn().contains("secret"));
        assert_eq!(conn.info().dbname(), "test");
    }

    #[test]
    fn connect_timeout_must_be_numeric() {
        let err =
            Connection::<MockPq>::connect("dbname=test connect_timeout=abc").unwrap_err();
        assert!(err.to_string().contains("connect_timeout"));
        Connection::<MockPq>::connect("dbname=test connect_timeout=2").unwrap();
    }
}
