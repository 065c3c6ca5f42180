// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use threadpool::ThreadPool;

use crate::error::TimeoutPhase;
use crate::query::{QueryRequest, RecordBuffer, StreamKind};
use crate::transport::{ArchiveTransport, CancelToken, StreamEvent};
use crate::ErrorKind;

#[derive(Clone, Copy, Debug)]
pub struct RecoveryOptions {
    /// The multi-stream cap `S`; the worker pool never exceeds it.
    pub max_streams: usize,

    /// Stream kind for sub-requests that do not specify one.
    pub default_kind: StreamKind,

    /// Deadline for the whole recovery, across all streams.
    pub timeout: Option<Duration>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            max_streams: 4,
            default_kind: StreamKind::ServerStream,
            timeout: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records pushed into the response buffer.
    pub records: u64,

    /// Approximate payload bytes pushed.
    pub bytes: u64,
}

/// Per-stream lifecycle, traced at each transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamPhase {
    Idle,
    Opened,
    Running,
    Draining,
    Done,
    Failed,
}

fn transition(phase: &mut StreamPhase, to: StreamPhase) {
    tracing::trace!(from = ?*phase, to = ?to, "stream phase transition");
    *phase = to;
}

/// Drives one streaming RPC per sub-request and deposits the resulting
/// records into the shared response buffer.
///
/// Up to `max_streams` streams run in parallel on a fixed worker pool;
/// overflow sub-requests queue and run as workers free. `recover` blocks
/// until every stream reaches a terminal state, the deadline elapses, or
/// the cancel token fires.
pub struct RecoveryEngine {
    transport: Arc<dyn ArchiveTransport>,
    buffer: Arc<RecordBuffer>,
    options: RecoveryOptions,
    cancel: CancelToken,
}

impl RecoveryEngine {
    pub fn new(
        transport: Arc<dyn ArchiveTransport>,
        buffer: Arc<RecordBuffer>,
        options: RecoveryOptions,
    ) -> Self {
        Self {
            transport,
            buffer,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// The token that cancels every live stream of this engine.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Recovers all sub-requests, returning the aggregate record and byte
    /// counts on success.
    ///
    /// On any failure (rejection, stream failure, timeout, cancellation)
    /// the engine cancels the remaining streams, shuts the buffer down
    /// immediately so the transfer task observes termination, and returns
    /// the first-observed error. On success the buffer is sealed so the
    /// consumer drains to completion.
    #[tracing::instrument(level = "debug", skip_all, err, fields(streams = subs.len()))]
    pub fn recover(&self, subs: &[QueryRequest]) -> crate::Result<RecoveryStats> {
        if subs.is_empty() {
            return Err(ErrorKind::InvalidRequest.with_message("no sub-requests to recover"));
        }
        if !self.buffer.activate() {
            return Err(ErrorKind::BufferShutdown
                .with_message("response buffer is past its active lifecycle"));
        }

        let deadline = self.options.timeout.map(|timeout| Instant::now() + timeout);
        let workers = self.options.max_streams.max(1).min(subs.len());
        let pool = ThreadPool::with_name("stream".to_string(), workers);
        let (tx, rx) = mpsc::channel();
        for (index, sub) in subs.iter().cloned().enumerate() {
            let tx = tx.clone();
            let transport = Arc::clone(&self.transport);
            let buffer = Arc::clone(&self.buffer);
            let cancel = self.cancel.clone();
            let kind = sub.stream_kind.unwrap_or(self.options.default_kind);
            pool.execute(move || {
                let result = run_stream(index, transport.as_ref(), &sub, kind, &buffer, &cancel);
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut stats = RecoveryStats::default();
        for _ in 0..subs.len() {
            let outcome = match deadline {
                None => rx.recv().map_err(|_| {
                    ErrorKind::InternalError.with_message("stream worker disappeared")
                })?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match rx.recv_timeout(remaining) {
                        Ok(outcome) => outcome,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            self.abort();
                            return Err(ErrorKind::Timeout {
                                phase: TimeoutPhase::Streaming,
                            }
                            .into());
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            self.abort();
                            return Err(ErrorKind::InternalError
                                .with_message("stream worker disappeared"));
                        }
                    }
                }
            };
            match outcome {
                Ok(stream_stats) => {
                    stats.records += stream_stats.records;
                    stats.bytes += stream_stats.bytes;
                }
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }

        self.buffer.seal();
        tracing::debug!(
            records = stats.records,
            bytes = stats.bytes,
            "all streams terminated normally"
        );
        Ok(stats)
    }

    /// Cancels every live stream and releases the buffer so downstream
    /// consumers are not left waiting.
    fn abort(&self) {
        self.cancel.cancel();
        self.buffer.shutdown_now();
    }
}

/// One stream worker: `Idle -> Opened -> Running -> Draining -> Done`,
/// with `Failed` reachable from anywhere.
fn run_stream(
    index: usize,
    transport: &dyn ArchiveTransport,
    sub: &QueryRequest,
    kind: StreamKind,
    buffer: &RecordBuffer,
    cancel: &CancelToken,
) -> crate::Result<RecoveryStats> {
    let span = tracing::debug_span!("stream", index, ?kind);
    let _enter = span.enter();

    let mut phase = StreamPhase::Idle;
    let mut stream = match transport.open_stream(sub, kind, cancel.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            transition(&mut phase, StreamPhase::Failed);
            return Err(wrap_transport(e));
        }
    };
    transition(&mut phase, StreamPhase::Opened);

    let mut stats = RecoveryStats::default();
    let mut first = true;
    loop {
        if cancel.is_cancelled() {
            transition(&mut phase, StreamPhase::Failed);
            return Err(ErrorKind::Cancelled.into());
        }
        let event = match stream.next_event() {
            Ok(event) => event,
            Err(e) => {
                transition(&mut phase, StreamPhase::Failed);
                return Err(wrap_transport(e));
            }
        };
        match event {
            StreamEvent::Rejection { reason, message } => {
                transition(&mut phase, StreamPhase::Failed);
                return Err(if first {
                    ErrorKind::RequestRejected { reason }.with_message(message)
                } else {
                    // A rejection is only a request-level verdict on the
                    // first response; anywhere else it is a broken stream.
                    ErrorKind::StreamFailure
                        .with_message(format!("rejection {reason:?} after first response"))
                });
            }
            StreamEvent::StatusError { status, message } => {
                transition(&mut phase, StreamPhase::Failed);
                return Err(ErrorKind::StreamFailure
                    .with_message(format!("server status {status}: {message}")));
            }
            StreamEvent::Record(record) => {
                if phase != StreamPhase::Running {
                    transition(&mut phase, StreamPhase::Running);
                }
                stats.records += 1;
                stats.bytes += record.byte_size();
                // May block on backpressure; fails once the buffer is shut
                // down because another stream already failed.
                if let Err(e) = buffer.push(record) {
                    transition(&mut phase, StreamPhase::Failed);
                    return Err(e);
                }
                if kind == StreamKind::Bidi {
                    if let Err(e) = stream.ack() {
                        transition(&mut phase, StreamPhase::Failed);
                        return Err(wrap_transport(e));
                    }
                }
            }
            StreamEvent::End => {
                transition(&mut phase, StreamPhase::Draining);
                // Pull model: every received record is already enqueued by
                // the time the end notification is observed.
                transition(&mut phase, StreamPhase::Done);
                tracing::debug!(records = stats.records, "stream completed");
                return Ok(stats);
            }
        }
        first = false;
    }
}

/// Transport-surfaced errors become stream failures; cancellation keeps
/// its identity so the façade can report the right cause.
fn wrap_transport(e: crate::Error) -> crate::Error {
    match e.kind() {
        ErrorKind::Cancelled | ErrorKind::Timeout { .. } => e,
        ErrorKind::StreamFailure => e,
        _ => ErrorKind::StreamFailure.with_source(e),
    }
}
