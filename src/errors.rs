//! driver error taxonomy.
//!
//! Errors are layered the way DB-API drivers report them: driver misuse
//! surfaces as [`ErrorClass::Interface`], everything reported by the backend
//! is a database error refined into one of the `Data` / `Operational` /
//! `Integrity` / `Internal` / `Programming` / `NotSupported` classes by its
//! SQLSTATE. Backend errors carry a full [`Diagnostic`].

mod sqlstate;

use core::fmt;

use std::{error, io};

use super::pq::{DiagnosticField, PqResult};

pub use sqlstate::state;

/// classification of an [`Error`].
///
/// `Warning` exists for completeness of the taxonomy and is never attached
/// to a raised error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Warning,
    /// misuse of the driver itself, e.g. operating on a closed connection.
    Interface,
    /// backend reported error with no more specific classification.
    Database,
    Data,
    Operational,
    Integrity,
    Internal,
    Programming,
    NotSupported,
}

impl ErrorClass {
    pub fn name(self) -> &'static str {
        match self {
            Self::Warning => "Warning",
            Self::Interface => "InterfaceError",
            Self::Database => "DatabaseError",
            Self::Data => "DataError",
            Self::Operational => "OperationalError",
            Self::Integrity => "IntegrityError",
            Self::Internal => "InternalError",
            Self::Programming => "ProgrammingError",
            Self::NotSupported => "NotSupportedError",
        }
    }

    /// whether the class describes a backend reported failure.
    pub fn is_database(self) -> bool {
        !matches!(self, Self::Warning | Self::Interface)
    }
}

/// error and notice report decoded from the wire handle's diagnostic fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Option<String>,
    pub severity_nonlocalized: Option<String>,
    pub sqlstate: Option<String>,
    pub message_primary: Option<String>,
    pub message_detail: Option<String>,
    pub message_hint: Option<String>,
    pub statement_position: Option<String>,
    pub internal_position: Option<String>,
    pub internal_query: Option<String>,
    pub context: Option<String>,
    pub schema_name: Option<String>,
    pub table_name: Option<String>,
    pub column_name: Option<String>,
    pub datatype_name: Option<String>,
    pub constraint_name: Option<String>,
    pub source_file: Option<String>,
    pub source_line: Option<String>,
    pub source_function: Option<String>,
}

impl Diagnostic {
    #[cold]
    pub(crate) fn from_result<R: PqResult>(res: &R) -> Self {
        let f = |field| res.error_field(field).map(str::to_owned);
        Diagnostic {
            severity: f(DiagnosticField::Severity),
            severity_nonlocalized: f(DiagnosticField::SeverityNonlocalized),
            sqlstate: f(DiagnosticField::Sqlstate),
            message_primary: f(DiagnosticField::MessagePrimary),
            message_detail: f(DiagnosticField::MessageDetail),
            message_hint: f(DiagnosticField::MessageHint),
            statement_position: f(DiagnosticField::StatementPosition),
            internal_position: f(DiagnosticField::InternalPosition),
            internal_query: f(DiagnosticField::InternalQuery),
            context: f(DiagnosticField::Context),
            schema_name: f(DiagnosticField::SchemaName),
            table_name: f(DiagnosticField::TableName),
            column_name: f(DiagnosticField::ColumnName),
            datatype_name: f(DiagnosticField::DataTypeName),
            constraint_name: f(DiagnosticField::ConstraintName),
            source_file: f(DiagnosticField::SourceFile),
            source_line: f(DiagnosticField::SourceLine),
            source_function: f(DiagnosticField::SourceFunction),
        }
    }
}

/// any error raised by the driver.
pub struct Error {
    class: ErrorClass,
    message: String,
    diag: Option<Box<Diagnostic>>,
    pipeline_aborted: bool,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    pub(crate) fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            diag: None,
            pipeline_aborted: false,
            source: None,
        }
    }

    #[cold]
    pub(crate) fn interface(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Interface, message)
    }

    #[cold]
    pub(crate) fn operational(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Operational, message)
    }

    #[cold]
    pub(crate) fn programming(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Programming, message)
    }

    #[cold]
    pub(crate) fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Data, message)
    }

    #[cold]
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, message)
    }

    #[cold]
    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotSupported, message)
    }

    /// a query was suppressed because an earlier command aborted the pipeline.
    #[cold]
    pub(crate) fn pipeline_aborted() -> Self {
        let mut e = Self::new(ErrorClass::Operational, "pipeline aborted");
        e.pipeline_aborted = true;
        e
    }

    /// build a typed error from a failed backend result.
    #[cold]
    pub(crate) fn from_result<R: PqResult>(res: &R) -> Self {
        let diag = Diagnostic::from_result(res);
        let class = match diag.sqlstate.as_deref() {
            Some(code) => sqlstate::class_of(code),
            None => ErrorClass::Database,
        };
        let message = diag
            .message_primary
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        Self {
            class,
            message,
            diag: Some(Box::new(diag)),
            pipeline_aborted: false,
            source: None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// SQLSTATE reported by the backend, if this is a backend error.
    pub fn sqlstate(&self) -> Option<&str> {
        self.diag.as_ref()?.sqlstate.as_deref()
    }

    /// details of a backend reported error.
    pub fn diag(&self) -> Option<&Diagnostic> {
        self.diag.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_pipeline_aborted(&self) -> bool {
        self.pipeline_aborted
    }

    pub fn is_query_canceled(&self) -> bool {
        self.sqlstate() == Some(state::QUERY_CANCELED)
    }

    pub(crate) fn with_source(mut self, source: impl error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Error");
        d.field("class", &self.class.name()).field("message", &self.message);
        if let Some(state) = self.sqlstate() {
            d.field("sqlstate", &state);
        }
        d.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(diag) = &self.diag {
            if let Some(detail) = &diag.message_detail {
                write!(f, "\nDETAIL: {detail}")?;
            }
            if let Some(hint) = &diag.message_hint {
                write!(f, "\nHINT: {hint}")?;
            }
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::operational(e.to_string()).with_source(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn class_from_known_state() {
        assert_eq!(sqlstate::class_of("23505"), ErrorClass::Integrity);
        assert_eq!(sqlstate::class_of("57014"), ErrorClass::Operational);
        assert_eq!(sqlstate::class_of("42P01"), ErrorClass::Programming);
        assert_eq!(sqlstate::class_of("0A000"), ErrorClass::NotSupported);
        assert_eq!(sqlstate::class_of("22012"), ErrorClass::Data);
        assert_eq!(sqlstate::class_of("XX001"), ErrorClass::Internal);
    }

    #[test]
    fn class_from_unknown_state_falls_back_to_prefix() {
        assert_eq!(sqlstate::class_of("08999"), ErrorClass::Operational);
        assert_eq!(sqlstate::class_of("23999"), ErrorClass::Integrity);
        assert_eq!(sqlstate::class_of("42ZZZ"), ErrorClass::Programming);
        assert_eq!(sqlstate::class_of("XXZZZ"), ErrorClass::Internal);
        assert_eq!(sqlstate::class_of("99999"), ErrorClass::Database);
    }

    #[test]
    fn pipeline_aborted_is_operational() {
        let e = Error::pipeline_aborted();
        assert_eq!(e.class(), ErrorClass::Operational);
        assert!(e.is_pipeline_aborted());
    }
}
