//! scripted in-memory wire handle.
//!
//! every `send_*` call is recorded and answered from a script of canned
//! results, falling back to a result derived from the statement text. The
//! handle is never busy and never reports back-pressure, so machines settle
//! in a bounded number of polls. Transaction status is tracked from the
//! statements that flow through, which is enough for the connection state
//! logic to behave like it would against a real backend.

use std::{
    collections::{HashMap, VecDeque},
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use postgres_types::{Oid, Type};

use crate::errors::Error;

use super::{
    ConnStatus, CopyData, DiagnosticField, ExecStatus, FlushStatus, Format, Notify,
    PipelineStatus, PollingStatus, Pq, PqCancel, PqResult, PutStatus, TransactionStatus,
};

/// a recorded frontend operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Query(String),
    QueryParams {
        query: String,
        params: Vec<Option<Vec<u8>>>,
        types: Vec<Oid>,
        formats: Vec<Format>,
        result_format: Format,
    },
    Prepare {
        name: String,
        query: String,
        types: Vec<Oid>,
    },
    QueryPrepared {
        name: String,
        params: Vec<Option<Vec<u8>>>,
        formats: Vec<Format>,
        result_format: Format,
    },
    DescribePortal(String),
    FlushRequest,
    PipelineSync,
    CopyData(Vec<u8>),
    CopyEnd(Option<String>),
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub oid: Oid,
    pub format: Format,
    pub fmod: i32,
    pub fsize: i32,
}

impl MockColumn {
    pub fn new(name: &str, ty: &Type) -> Self {
        Self {
            name: name.to_string(),
            oid: ty.oid(),
            format: Format::Text,
            fmod: -1,
            fsize: -1,
        }
    }

    pub fn binary(mut self) -> Self {
        self.format = Format::Binary;
        self
    }
}

/// one canned backend result.
#[derive(Debug, Clone)]
pub struct MockResult {
    status: ExecStatus,
    tag: Option<String>,
    columns: Vec<MockColumn>,
    rows: Vec<Vec<Option<Vec<u8>>>>,
    diag: HashMap<DiagnosticField, String>,
}

impl MockResult {
    pub fn with_status(status: ExecStatus) -> Self {
        Self {
            status,
            tag: None,
            columns: Vec::new(),
            rows: Vec::new(),
            diag: HashMap::new(),
        }
    }

    pub fn command_ok(tag: &str) -> Self {
        let mut r = Self::with_status(ExecStatus::CommandOk);
        r.tag = Some(tag.to_string());
        r
    }

    pub fn tuples(columns: Vec<MockColumn>, rows: Vec<Vec<Option<Vec<u8>>>>) -> Self {
        let mut r = Self::with_status(ExecStatus::TuplesOk);
        r.tag = Some(format!("SELECT {}", rows.len()));
        r.columns = columns;
        r.rows = rows;
        r
    }

    pub fn error(sqlstate: &str, message: &str) -> Self {
        let mut r = Self::with_status(ExecStatus::FatalError);
        r.diag.insert(DiagnosticField::Severity, "ERROR".to_string());
        r.diag.insert(DiagnosticField::Sqlstate, sqlstate.to_string());
        r.diag
            .insert(DiagnosticField::MessagePrimary, message.to_string());
        r
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    fn pipeline_sync() -> Self {
        Self::with_status(ExecStatus::PipelineSync)
    }
}

impl PqResult for MockResult {
    fn status(&self) -> ExecStatus {
        self.status
    }

    fn ntuples(&self) -> usize {
        self.rows.len()
    }

    fn nfields(&self) -> usize {
        self.columns.len()
    }

    fn fname(&self, col: usize) -> Option<&str> {
        self.columns.get(col).map(|c| c.name.as_str())
    }

    fn ftype(&self, col: usize) -> Oid {
        self.columns.get(col).map(|c| c.oid).unwrap_or(0)
    }

    fn fmod(&self, col: usize) -> i32 {
        self.columns.get(col).map(|c| c.fmod).unwrap_or(-1)
    }

    fn fsize(&self, col: usize) -> i32 {
        self.columns.get(col).map(|c| c.fsize).unwrap_or(-1)
    }

    fn fformat(&self, col: usize) -> Format {
        self.columns.get(col).map(|c| c.format).unwrap_or(Format::Text)
    }

    fn get_value(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    fn command_status(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn command_tuples(&self) -> Option<u64> {
        let tag = self.tag.as_deref()?;
        let mut words = tag.split_ascii_whitespace();
        match words.next()? {
            "INSERT" => words.nth(1)?.parse().ok(),
            "SELECT" | "UPDATE" | "DELETE" | "MERGE" | "MOVE" | "FETCH" | "COPY" => {
                words.next()?.parse().ok()
            }
            _ => None,
        }
    }

    fn error_field(&self, field: DiagnosticField) -> Option<&str> {
        self.diag.get(&field).map(String::as_str)
    }
}

pub struct MockCancel {
    fired: Arc<AtomicBool>,
}

impl PqCancel for MockCancel {
    fn cancel(&self) -> Result<(), Error> {
        self.fired.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockPq {
    status: ConnStatus,
    tx_status: TransactionStatus,
    pipeline: PipelineStatus,
    parameters: HashMap<String, String>,
    sent: Vec<Sent>,
    scripted: VecDeque<Vec<MockResult>>,
    pending: VecDeque<Option<MockResult>>,
    notify_queue: VecDeque<Notify>,
    notice_queue: VecDeque<crate::errors::Diagnostic>,
    copy_out: VecDeque<Bytes>,
    copy_out_finished: bool,
    copy_in: Vec<u8>,
    cancel_fired: Arc<AtomicBool>,
    poll_rounds: u8,
}

impl MockPq {
    /// a handle with an already established session.
    pub fn connected() -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("client_encoding".to_string(), "UTF8".to_string());
        parameters.insert("standard_conforming_strings".to_string(), "on".to_string());
        parameters.insert("TimeZone".to_string(), "UTC".to_string());
        Self {
            status: ConnStatus::Ok,
            tx_status: TransactionStatus::Idle,
            pipeline: PipelineStatus::Off,
            parameters,
            sent: Vec::new(),
            scripted: VecDeque::new(),
            pending: VecDeque::new(),
            notify_queue: VecDeque::new(),
            notice_queue: VecDeque::new(),
            copy_out: VecDeque::new(),
            copy_out_finished: false,
            copy_in: Vec::new(),
            cancel_fired: Arc::new(AtomicBool::new(false)),
            poll_rounds: 0,
        }
    }

    /// script the results of the next command sent to the handle.
    pub fn expect(&mut self, results: Vec<MockResult>) {
        self.scripted.push_back(results);
    }

    pub fn queue_notify(&mut self, channel: &str, payload: &str, backend_pid: i32) {
        self.notify_queue.push_back(Notify {
            channel: channel.to_string(),
            payload: payload.to_string(),
            backend_pid,
        });
    }

    pub fn queue_notice(&mut self, severity: &str, message: &str) {
        self.notice_queue.push_back(crate::errors::Diagnostic {
            severity: Some(severity.to_string()),
            message_primary: Some(message.to_string()),
            ..Default::default()
        });
    }

    pub fn queue_copy_out(&mut self, chunk: &[u8]) {
        self.copy_out.push_back(Bytes::copy_from_slice(chunk));
    }

    pub fn sent(&self) -> &[Sent] {
        &self.sent
    }

    pub fn take_sent(&mut self) -> Vec<Sent> {
        std::mem::take(&mut self.sent)
    }

    pub fn copied_in(&self) -> &[u8] {
        &self.copy_in
    }

    pub fn cancel_fired(&self) -> bool {
        self.cancel_fired.load(Ordering::SeqCst)
    }

    pub fn transaction_status_now(&self) -> TransactionStatus {
        self.tx_status
    }

    /// simulate the backend dropping the session.
    pub fn kill(&mut self) {
        self.status = ConnStatus::Bad;
    }

    fn track_transaction(&mut self, statement: &str) {
        let upper = statement.trim().to_ascii_uppercase();
        let first = upper.split_ascii_whitespace().next().unwrap_or("");
        match first {
            "BEGIN" | "START" => self.tx_status = TransactionStatus::Intrans,
            "COMMIT" | "END" => self.tx_status = TransactionStatus::Idle,
            "PREPARE" if upper.starts_with("PREPARE TRANSACTION") => {
                self.tx_status = TransactionStatus::Idle
            }
            "ROLLBACK" => {
                if !upper.starts_with("ROLLBACK TO") {
                    self.tx_status = TransactionStatus::Idle;
                }
            }
            _ => {}
        }
    }

    fn default_result(&self, statement: &str) -> MockResult {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            return MockResult::with_status(ExecStatus::EmptyQuery);
        }
        let first = trimmed
            .split_ascii_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match first.as_str() {
            "SELECT" | "FETCH" | "SHOW" | "VALUES" => MockResult::tuples(Vec::new(), Vec::new()),
            _ => MockResult::command_ok(&first),
        }
    }

    /// whether a statement is driver bookkeeping rather than user data.
    /// internal commands never consume scripted results, so tests only
    /// script what their own statements will return.
    fn is_internal(statement: &str) -> bool {
        let first = statement
            .trim()
            .split_ascii_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        matches!(
            first.as_str(),
            "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "SAVEPOINT" | "RELEASE"
                | "DEALLOCATE" | "PREPARE" | "DECLARE" | "CLOSE" | "MOVE" | "SET" | "RESET"
        )
    }

    fn queue_command(&mut self, statements: &[&str]) {
        let internal = statements.iter().all(|s| Self::is_internal(s));
        let results = if internal {
            statements.iter().map(|s| self.default_result(s)).collect()
        } else {
            match self.scripted.pop_front() {
                Some(results) => results,
                None => statements.iter().map(|s| self.default_result(s)).collect(),
            }
        };
        for statement in statements {
            self.track_transaction(statement);
        }
        let mut copy = false;
        for result in results {
            if result.status == ExecStatus::FatalError
                && matches!(
                    self.tx_status,
                    TransactionStatus::Intrans | TransactionStatus::Active
                )
            {
                self.tx_status = TransactionStatus::Inerror;
            }
            copy = copy || result.status.is_copy();
            self.pending.push_back(Some(result));
        }
        // a copy result suspends the protocol: its terminating results and
        // separator only arrive once the copy finishes
        if !copy {
            self.pending.push_back(None);
        }
    }

    fn explode_single_row(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for entry in pending {
            match entry {
                Some(res)
                    if res.status == ExecStatus::TuplesOk && !res.rows.is_empty() =>
                {
                    for row in &res.rows {
                        let mut single = MockResult::with_status(ExecStatus::SingleTuple);
                        single.columns = res.columns.clone();
                        single.rows = vec![row.clone()];
                        self.pending.push_back(Some(single));
                    }
                    let mut terminal = MockResult::tuples(res.columns.clone(), Vec::new());
                    terminal.tag = res.tag.clone();
                    self.pending.push_back(Some(terminal));
                }
                other => self.pending.push_back(other),
            }
        }
    }
}

impl Pq for MockPq {
    type Result = MockResult;
    type Cancel = MockCancel;

    fn connect_start(conninfo: &str) -> Result<Self, Error> {
        let mut pq = Self::connected();
        pq.status = ConnStatus::Started;
        if conninfo.contains("mock_fail") {
            pq.poll_rounds = u8::MAX;
        }
        Ok(pq)
    }

    fn connect_poll(&mut self) -> PollingStatus {
        if self.poll_rounds == u8::MAX {
            self.status = ConnStatus::Bad;
            return PollingStatus::Failed;
        }
        // walk through a writing and a reading round before settling, the
        // way a real handshake would.
        self.poll_rounds += 1;
        match self.poll_rounds {
            1 => PollingStatus::Writing,
            2 => PollingStatus::Reading,
            _ => {
                self.status = ConnStatus::Ok;
                PollingStatus::Ok
            }
        }
    }

    fn library_version() -> u32 {
        160004
    }

    fn status(&self) -> ConnStatus {
        self.status
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    fn pipeline_status(&self) -> PipelineStatus {
        self.pipeline
    }

    fn socket(&self) -> RawFd {
        // nothing ever blocks on the mock; the waiting drivers treat the
        // invalid descriptor as instantly ready.
        -1
    }

    fn set_nonblocking(&mut self, _enabled: bool) -> Result<(), Error> {
        Ok(())
    }

    fn error_message(&self) -> String {
        "mock connection failure".to_string()
    }

    fn parameter_status(&self, name: &str) -> Option<String> {
        self.parameters.get(name).cloned()
    }

    fn server_version(&self) -> u32 {
        160004
    }

    fn backend_pid(&self) -> i32 {
        42
    }

    fn send_query(&mut self, query: &[u8]) -> Result<(), Error> {
        let text = String::from_utf8_lossy(query).to_string();
        let statements: Vec<&str> = text.split(';').filter(|s| !s.trim().is_empty()).collect();
        if statements.is_empty() {
            self.queue_command(&[""]);
        } else {
            self.queue_command(&statements);
        }
        self.sent.push(Sent::Query(text));
        Ok(())
    }

    fn send_query_params(
        &mut self,
        query: &[u8],
        params: &[Option<Vec<u8>>],
        types: &[Oid],
        formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error> {
        let text = String::from_utf8_lossy(query).to_string();
        self.queue_command(&[text.as_str()]);
        self.sent.push(Sent::QueryParams {
            query: text,
            params: params.to_vec(),
            types: types.to_vec(),
            formats: formats.to_vec(),
            result_format,
        });
        Ok(())
    }

    fn send_prepare(&mut self, name: &[u8], query: &[u8], types: &[Oid]) -> Result<(), Error> {
        self.queue_command(&["PREPARE"]);
        self.sent.push(Sent::Prepare {
            name: String::from_utf8_lossy(name).to_string(),
            query: String::from_utf8_lossy(query).to_string(),
            types: types.to_vec(),
        });
        Ok(())
    }

    fn send_query_prepared(
        &mut self,
        name: &[u8],
        params: &[Option<Vec<u8>>],
        formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error> {
        self.queue_command(&["EXECUTE"]);
        self.sent.push(Sent::QueryPrepared {
            name: String::from_utf8_lossy(name).to_string(),
            params: params.to_vec(),
            formats: formats.to_vec(),
            result_format,
        });
        Ok(())
    }

    fn send_describe_portal(&mut self, name: &[u8]) -> Result<(), Error> {
        self.queue_command(&["DESCRIBE"]);
        self.sent
            .push(Sent::DescribePortal(String::from_utf8_lossy(name).to_string()));
        Ok(())
    }

    fn send_flush_request(&mut self) -> Result<(), Error> {
        self.sent.push(Sent::FlushRequest);
        Ok(())
    }

    fn flush(&mut self) -> Result<FlushStatus, Error> {
        Ok(FlushStatus::Done)
    }

    fn consume_input(&mut self) -> Result<(), Error> {
        if self.status == ConnStatus::Bad {
            return Err(Error::operational("server closed the connection unexpectedly"));
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn get_result(&mut self) -> Option<MockResult> {
        self.pending.pop_front().flatten()
    }

    fn notifies(&mut self) -> Option<Notify> {
        self.notify_queue.pop_front()
    }

    fn next_notice(&mut self) -> Option<crate::errors::Diagnostic> {
        self.notice_queue.pop_front()
    }

    fn finish(&mut self) {
        self.status = ConnStatus::Bad;
        self.pending.clear();
    }

    fn set_single_row_mode(&mut self) -> Result<(), Error> {
        self.explode_single_row();
        Ok(())
    }

    fn enter_pipeline_mode(&mut self) -> Result<(), Error> {
        self.pipeline = PipelineStatus::On;
        Ok(())
    }

    fn exit_pipeline_mode(&mut self) -> Result<(), Error> {
        if self.pending.iter().any(Option::is_some) {
            return Err(Error::operational(
                "cannot exit pipeline mode with uncollected results",
            ));
        }
        self.pipeline = PipelineStatus::Off;
        Ok(())
    }

    fn pipeline_sync(&mut self) -> Result<(), Error> {
        self.sent.push(Sent::PipelineSync);
        self.pending.push_back(Some(MockResult::pipeline_sync()));
        if self.pipeline == PipelineStatus::Aborted {
            self.pipeline = PipelineStatus::On;
        }
        Ok(())
    }

    fn get_copy_data(&mut self, _nonblocking: bool) -> Result<CopyData, Error> {
        match self.copy_out.pop_front() {
            Some(chunk) => Ok(CopyData::Chunk(chunk)),
            None => {
                if !self.copy_out_finished {
                    self.copy_out_finished = true;
                    let results = self
                        .scripted
                        .pop_front()
                        .unwrap_or_else(|| vec![MockResult::command_ok("COPY 0")]);
                    for result in results {
                        self.pending.push_back(Some(result));
                    }
                    self.pending.push_back(None);
                }
                Ok(CopyData::Done)
            }
        }
    }

    fn put_copy_data(&mut self, data: &[u8]) -> Result<PutStatus, Error> {
        self.copy_in.extend_from_slice(data);
        self.sent.push(Sent::CopyData(data.to_vec()));
        Ok(PutStatus::Queued)
    }

    fn put_copy_end(&mut self, error: Option<&str>) -> Result<PutStatus, Error> {
        self.sent.push(Sent::CopyEnd(error.map(str::to_string)));
        let results = self
            .scripted
            .pop_front()
            .unwrap_or_else(|| vec![MockResult::command_ok("COPY 0")]);
        for result in results {
            self.pending.push_back(Some(result));
        }
        self.pending.push_back(None);
        Ok(PutStatus::Queued)
    }

    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        let inner = self.escape_string(value)?;
        let mut out = Vec::with_capacity(inner.len() + 2);
        out.push(b'\'');
        out.extend_from_slice(&inner);
        out.push(b'\'');
        Ok(out)
    }

    fn escape_identifier(&self, value: &str) -> Result<Vec<u8>, Error> {
        let mut out = vec![b'"'];
        for b in value.bytes() {
            if b == b'"' {
                out.push(b'"');
            }
            out.push(b);
        }
        out.push(b'"');
        Ok(out)
    }

    fn escape_string(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(value.len());
        for &b in value {
            if b == b'\'' {
                out.push(b'\'');
            }
            out.push(b);
        }
        Ok(out)
    }

    fn get_cancel(&self) -> Result<MockCancel, Error> {
        Ok(MockCancel {
            fired: Arc::clone(&self.cancel_fired),
        })
    }
}
