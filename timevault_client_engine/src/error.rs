// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::{borrow::Cow, fmt::Display};

use crate::query::value::DataType;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Identifies the pipeline phase in which a timeout was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Timed out while one or more recovery streams were still live.
    Streaming,

    /// Timed out while draining the response buffer into the correlator.
    Transfer,

    /// The per-request deadline elapsed outside of a specific phase.
    Overall,
}

impl Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TimeoutPhase::Streaming => write!(f, "streaming"),
            TimeoutPhase::Transfer => write!(f, "transfer"),
            TimeoutPhase::Overall => write!(f, "overall"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ErrorKind {
    /// The request failed validation before any work was performed: empty
    /// source list, duplicate source names, or a zero-length time range.
    InvalidRequest,

    /// The server rejected the request on the first response of a stream,
    /// before producing any data. The reason is the server-provided code.
    RequestRejected { reason: String },

    /// A transport error or server-reported status error occurred after the
    /// stream had started producing data.
    ///
    /// This is deliberately distinct from [`ErrorKind::RequestRejected`]:
    /// a rejection is a request-level verdict, a stream failure is a
    /// mid-flight breakdown.
    StreamFailure,

    /// The configured per-request deadline elapsed.
    Timeout { phase: TimeoutPhase },

    /// The caller asked the pipeline to stop.
    Cancelled,

    /// A record could not be enqueued because the response buffer was full
    /// and backpressure is disabled.
    BufferExhausted,

    /// The response buffer was used outside of its `Active` state.
    BufferShutdown,

    /// The same source contributed more than one record to a single
    /// correlated group.
    DuplicateSource { source: String },

    /// A value sequence's length does not match its sampling clock's
    /// declared sample count.
    BadSampleCount {
        source: String,
        expected: usize,
        got: usize,
    },

    /// A source declared conflicting element types across blocks.
    TypeConflict {
        source: String,
        left: DataType,
        right: DataType,
    },

    /// Correlated groups were mis-ordered or overlapped in time when the
    /// sampling process was assembled.
    BadBlockRange,

    /// The measured result size exceeds the configured static-table limit
    /// and the caller explicitly asked for a static table.
    TableTooLarge { size: u64, limit: u64 },

    /// No table variant is permitted by the configured policy for this
    /// result.
    NoViableTable,

    /// A table read used a row or column index outside the table's shape.
    IndexOutOfBounds,

    /// A table read named a column the table does not have.
    NoSuchColumn { name: String },

    /// A typed table read requested a type the column's declared element
    /// type is not assignable to.
    TypeMismatch {
        declared: DataType,
        requested: DataType,
    },

    /// The configuration document could not be deserialized.
    InvalidConfig,

    /// An internal invariant was violated. This indicates a bug in the
    /// client engine; we surface it only so the host can log and report it.
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::InvalidRequest => write!(f, "invalid request"),
            ErrorKind::RequestRejected { reason } => {
                write!(f, "request rejected by server: {reason}")
            }
            ErrorKind::StreamFailure => write!(f, "stream failure"),
            ErrorKind::Timeout { phase } => write!(f, "timed out during {phase}"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::BufferExhausted => write!(f, "response buffer exhausted"),
            ErrorKind::BufferShutdown => write!(f, "response buffer is shut down"),
            ErrorKind::DuplicateSource { source } => {
                write!(f, "source {source:?} contributed twice to one group")
            }
            ErrorKind::BadSampleCount {
                source,
                expected,
                got,
            } => write!(
                f,
                "source {source:?} carries {got} values where the clock declares {expected}"
            ),
            ErrorKind::TypeConflict {
                source,
                left,
                right,
            } => write!(
                f,
                "source {source:?} declares conflicting element types {left} and {right}"
            ),
            ErrorKind::BadBlockRange => write!(f, "sampling blocks overlap or are mis-ordered"),
            ErrorKind::TableTooLarge { size, limit } => {
                write!(f, "result of {size} bytes exceeds static table limit {limit}")
            }
            ErrorKind::NoViableTable => write!(f, "no table variant permitted by configuration"),
            ErrorKind::IndexOutOfBounds => write!(f, "table index out of bounds"),
            ErrorKind::NoSuchColumn { name } => write!(f, "no column named {name:?}"),
            ErrorKind::TypeMismatch {
                declared,
                requested,
            } => write!(
                f,
                "column type {declared} is not assignable to requested type {requested}"
            ),
            ErrorKind::InvalidConfig => write!(f, "invalid configuration document"),
            ErrorKind::InternalError => write!(f, "internal client engine error"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
        }
    }
}

impl Error {
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}
