//! abstraction over a libpq style wire handle.
//!
//! the driver core never touches a socket itself: every byte on the wire is
//! moved by an external handle implementing [`Pq`]. The traits in this module
//! mirror the non blocking subset of the libpq API one to one, so a thin FFI
//! binding satisfies them directly. A scripted in-memory implementation lives
//! in [`mock`] for tests.

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::os::fd::RawFd;

use postgres_types::Oid;

use super::errors::Error;

/// status of the connection attempt or established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnStatus {
    Ok,
    Bad,
    Started,
    Made,
    AwaitingResponse,
    AuthOk,
    SslStartup,
    CheckWritable,
    Consume,
    CheckStandby,
}

/// outcome of a single `connect_poll` round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    Ok,
    Reading,
    Writing,
    Failed,
}

/// status carried by a result handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    CopyOut,
    CopyIn,
    CopyBoth,
    SingleTuple,
    NonfatalError,
    FatalError,
    PipelineSync,
    PipelineAborted,
}

impl ExecStatus {
    pub(crate) fn is_copy(self) -> bool {
        matches!(self, Self::CopyIn | Self::CopyOut | Self::CopyBoth)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::EmptyQuery => "EMPTY_QUERY",
            Self::CommandOk => "COMMAND_OK",
            Self::TuplesOk => "TUPLES_OK",
            Self::CopyOut => "COPY_OUT",
            Self::CopyIn => "COPY_IN",
            Self::CopyBoth => "COPY_BOTH",
            Self::SingleTuple => "SINGLE_TUPLE",
            Self::NonfatalError => "NONFATAL_ERROR",
            Self::FatalError => "FATAL_ERROR",
            Self::PipelineSync => "PIPELINE_SYNC",
            Self::PipelineAborted => "PIPELINE_ABORTED",
        }
    }
}

/// backend transaction status as reported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    Active,
    Intrans,
    Inerror,
    Unknown,
}

impl TransactionStatus {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Active => "ACTIVE",
            Self::Intrans => "INTRANS",
            Self::Inerror => "INERROR",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStatus {
    Off,
    On,
    Aborted,
}

/// wire representation of a single column or parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

/// outcome of flushing the outbound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    Done,
    WouldBlock,
}

/// outcome of a non blocking `get_copy_data` call.
#[derive(Debug)]
pub enum CopyData {
    /// one chunk of COPY OUT payload.
    Chunk(bytes::Bytes),
    WouldBlock,
    /// the server finished the COPY; fetch the terminating result next.
    Done,
}

/// outcome of the non blocking copy write calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Queued,
    WouldBlock,
}

/// error and notice report fields, keyed like the protocol single byte codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticField {
    Severity,
    SeverityNonlocalized,
    Sqlstate,
    MessagePrimary,
    MessageDetail,
    MessageHint,
    StatementPosition,
    InternalPosition,
    InternalQuery,
    Context,
    SchemaName,
    TableName,
    ColumnName,
    DataTypeName,
    ConstraintName,
    SourceFile,
    SourceLine,
    SourceFunction,
}

/// An asynchronous notification received from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// name of the channel the notification was received on.
    pub channel: String,
    /// message attached to the notification.
    pub payload: String,
    /// PID of the backend process that sent the notification.
    pub backend_pid: i32,
}

/// connection scoped operations of the wire handle.
///
/// all `send_*` calls only queue bytes in the handle's outbound buffer;
/// [`Pq::flush`] pushes them to the socket and reports back-pressure instead
/// of blocking. Reads follow the same discipline through `consume_input` /
/// `is_busy` / `get_result`.
pub trait Pq: Send + Sized + 'static {
    type Result: PqResult;
    type Cancel: PqCancel;

    /// begin a connection attempt. the returned handle must be polled with
    /// [`Pq::connect_poll`] until it reports [`PollingStatus::Ok`].
    fn connect_start(conninfo: &str) -> Result<Self, Error>;

    fn connect_poll(&mut self) -> PollingStatus;

    /// version of the wire library the handle is running on, in the
    /// `major * 10000 + minor` encoding used by the backend.
    fn library_version() -> u32;

    /// version of the wire library this handle layer was compiled against.
    fn build_version() -> u32 {
        Self::library_version()
    }

    fn status(&self) -> ConnStatus;
    fn transaction_status(&self) -> TransactionStatus;
    fn pipeline_status(&self) -> PipelineStatus;

    /// file descriptor currently backing the session. may change while a
    /// connection attempt is in progress.
    fn socket(&self) -> RawFd;

    fn set_nonblocking(&mut self, enabled: bool) -> Result<(), Error>;

    /// last error reported by the handle, already decoded.
    fn error_message(&self) -> String;

    fn parameter_status(&self, name: &str) -> Option<String>;
    fn server_version(&self) -> u32;
    fn backend_pid(&self) -> i32;

    fn send_query(&mut self, query: &[u8]) -> Result<(), Error>;

    #[allow(clippy::too_many_arguments)]
    fn send_query_params(
        &mut self,
        query: &[u8],
        params: &[Option<Vec<u8>>],
        types: &[Oid],
        formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error>;

    fn send_prepare(&mut self, name: &[u8], query: &[u8], types: &[Oid]) -> Result<(), Error>;

    fn send_query_prepared(
        &mut self,
        name: &[u8],
        params: &[Option<Vec<u8>>],
        formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error>;

    fn send_describe_portal(&mut self, name: &[u8]) -> Result<(), Error>;
    fn send_flush_request(&mut self) -> Result<(), Error>;

    fn flush(&mut self) -> Result<FlushStatus, Error>;
    fn consume_input(&mut self) -> Result<(), Error>;
    fn is_busy(&self) -> bool;

    /// next pending result, or `None` when the current command is exhausted.
    fn get_result(&mut self) -> Option<Self::Result>;

    /// pop one pending notification, if any.
    fn notifies(&mut self) -> Option<Notify>;

    /// pop one pending notice report, if any.
    fn next_notice(&mut self) -> Option<crate::errors::Diagnostic> {
        None
    }

    /// close the session and release its resources. further calls must
    /// report [`ConnStatus::Bad`].
    fn finish(&mut self);

    fn set_single_row_mode(&mut self) -> Result<(), Error>;

    fn enter_pipeline_mode(&mut self) -> Result<(), Error>;
    fn exit_pipeline_mode(&mut self) -> Result<(), Error>;
    fn pipeline_sync(&mut self) -> Result<(), Error>;

    fn get_copy_data(&mut self, nonblocking: bool) -> Result<CopyData, Error>;
    fn put_copy_data(&mut self, data: &[u8]) -> Result<PutStatus, Error>;
    fn put_copy_end(&mut self, error: Option<&str>) -> Result<PutStatus, Error>;

    /// escape a value as a SQL literal, quotes included, honouring the
    /// session `standard_conforming_strings` setting.
    fn escape_literal(&self, value: &[u8]) -> Result<Vec<u8>, Error>;
    fn escape_identifier(&self, value: &str) -> Result<Vec<u8>, Error>;
    /// escape the content of a string literal, quotes excluded.
    fn escape_string(&self, value: &[u8]) -> Result<Vec<u8>, Error>;

    /// obtain an out of band cancellation token for the session.
    fn get_cancel(&self) -> Result<Self::Cancel, Error>;
}

/// read access to one backend result.
pub trait PqResult: Send + 'static {
    fn status(&self) -> ExecStatus;
    fn ntuples(&self) -> usize;
    fn nfields(&self) -> usize;
    fn fname(&self, col: usize) -> Option<&str>;
    fn ftype(&self, col: usize) -> Oid;
    fn fmod(&self, col: usize) -> i32;
    fn fsize(&self, col: usize) -> i32;
    fn fformat(&self, col: usize) -> Format;
    /// value of one cell; `None` encodes SQL NULL.
    fn get_value(&self, row: usize, col: usize) -> Option<&[u8]>;
    /// command tag, e.g. `INSERT 0 3` or `ROLLBACK`.
    fn command_status(&self) -> Option<&str>;
    /// rows affected, parsed out of the command tag.
    fn command_tuples(&self) -> Option<u64>;
    fn error_field(&self, field: DiagnosticField) -> Option<&str>;
}

/// out of band cancellation token. safe to fire from another thread while
/// the owning session is in use.
pub trait PqCancel: Send + Sync + 'static {
    fn cancel(&self) -> Result<(), Error>;
}
