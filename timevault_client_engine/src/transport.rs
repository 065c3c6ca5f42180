// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

//! What the RPC layer must expose to the query pipeline.
//!
//! The engine consumes streams of [`StreamEvent`]s; it does not define the
//! wire format, open sockets, or manage TLS. A transport implementation
//! translates its protocol's responses into these events and honors the
//! [`CancelToken`] it is handed when a stream is opened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::query::value::DataType;
use crate::query::{Nanos, QueryRequest, RawRecord, StreamKind};

/// A cloneable cancellation flag shared between the engine and a live
/// stream. The engine sets it; the transport polls it (or wires it into its
/// own cancellation mechanism) and terminates the stream promptly.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One response off a recovery stream, already translated out of the wire
/// format.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// A request-level verdict. Only valid as the first response of a
    /// stream; the engine treats a later rejection as a stream failure.
    Rejection { reason: String, message: String },

    /// A server-reported error in place of data on any subsequent response.
    StatusError { status: i32, message: String },

    /// One per-source sample column.
    Record(RawRecord),

    /// The server's end-of-stream notification.
    End,
}

/// A live recovery stream.
///
/// `next_event` blocks until the server produces the next response and is
/// expected to return promptly (with an error) once the stream's
/// [`CancelToken`] fires.
pub trait RecordStream: Send {
    fn next_event(&mut self) -> crate::Result<StreamEvent>;

    /// Acknowledges the most recent data response. Only meaningful for
    /// [`StreamKind::Bidi`] streams; the default is a no-op.
    fn ack(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// A non-time-series lookup: which sources does the archive know about?
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataRequest {
    All,
    Exact(Vec<String>),
    Prefix(String),
}

impl MetadataRequest {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            MetadataRequest::All => true,
            MetadataRequest::Exact(names) => names.iter().any(|n| n == name),
            MetadataRequest::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

/// Per-source descriptor returned by a metadata query.
#[derive(Clone, Debug, PartialEq)]
pub struct MetadataRecord {
    pub name: String,
    pub data_type: Option<DataType>,
    pub first_archived: Option<Nanos>,
    pub last_archived: Option<Nanos>,
}

/// The archive service as seen by the pipeline.
pub trait ArchiveTransport: Send + Sync {
    /// Opens one streaming call of the given kind for one sub-request.
    fn open_stream(
        &self,
        request: &QueryRequest,
        kind: StreamKind,
        cancel: CancelToken,
    ) -> crate::Result<Box<dyn RecordStream>>;

    /// One-shot request whose entire result arrives in a single response.
    fn query_unary(&self, request: &QueryRequest) -> crate::Result<Vec<RawRecord>>;

    /// Unary metadata pass-through.
    fn query_metadata(&self, request: &MetadataRequest) -> crate::Result<Vec<MetadataRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn metadata_patterns_match_as_documented() {
        assert!(MetadataRequest::All.matches("anything"));
        let exact = MetadataRequest::Exact(vec!["A".into(), "B".into()]);
        assert!(exact.matches("A"));
        assert!(!exact.matches("C"));
        let prefix = MetadataRequest::Prefix("ring1:".into());
        assert!(prefix.matches("ring1:bpm07"));
        assert!(!prefix.matches("ring2:bpm07"));
    }
}
