// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::TimeoutPhase;
use crate::query::{Correlator, RecordBuffer};
use crate::ErrorKind;

/// How long the worker waits on an empty buffer before re-checking its
/// terminate flag.
const POP_POLL: Duration = Duration::from_millis(50);

/// Most records handed to the correlator per batch. Batching is what lets
/// the correlator's parallel path amortize its fan-out.
const BATCH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failure(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferReport {
    /// Records handed to the correlator.
    pub records: u64,
    pub status: TransferStatus,
}

struct Shared {
    report: Mutex<Option<TransferReport>>,
    done: Condvar,
    terminate: AtomicBool,
}

/// The single worker that drains the response buffer and feeds the
/// correlator. It exits when the buffer reports drained-and-shuttable, or
/// when terminated early.
pub struct TransferTask;

impl TransferTask {
    pub fn spawn(
        buffer: Arc<RecordBuffer>,
        correlator: Arc<Correlator>,
    ) -> crate::Result<TransferHandle> {
        let shared = Arc::new(Shared {
            report: Mutex::new(None),
            done: Condvar::new(),
            terminate: AtomicBool::new(false),
        });
        let worker_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("transfer".to_string())
            .spawn(move || Self::run(buffer, correlator, worker_shared))
            .map_err(|e| ErrorKind::InternalError.with_source(e))?;
        Ok(TransferHandle { shared })
    }

    fn run(buffer: Arc<RecordBuffer>, correlator: Arc<Correlator>, shared: Arc<Shared>) {
        let mut records = 0u64;
        let status = loop {
            if shared.terminate.load(Ordering::SeqCst) {
                break TransferStatus::Failure("terminated".to_string());
            }
            match buffer.pop(POP_POLL) {
                Ok(Some(first)) => {
                    let mut batch = vec![first];
                    while batch.len() < BATCH {
                        match buffer.pop(Duration::ZERO) {
                            Ok(Some(record)) => batch.push(record),
                            _ => break,
                        }
                    }
                    records += batch.len() as u64;
                    if let Err(e) = correlator.ingest_many(batch) {
                        break TransferStatus::Failure(e.to_string());
                    }
                }
                Ok(None) => break TransferStatus::Success,
                Err(e) if matches!(e.kind(), ErrorKind::Timeout { .. }) => continue,
                Err(e) => break TransferStatus::Failure(e.to_string()),
            }
        };

        tracing::debug!(records, ?status, "transfer task finished");
        *shared.report.lock().unwrap() = Some(TransferReport { records, status });
        shared.done.notify_all();
    }
}

/// Handle to a running (or finished) transfer task.
pub struct TransferHandle {
    shared: Arc<Shared>,
}

impl TransferHandle {
    /// Blocks until the worker reports a terminal status, up to `timeout`.
    pub fn join(&self, timeout: Duration) -> crate::Result<TransferReport> {
        let deadline = Instant::now() + timeout;
        let mut report = self.shared.report.lock().unwrap();
        loop {
            if let Some(report) = report.as_ref() {
                return Ok(report.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::Timeout {
                    phase: TimeoutPhase::Transfer,
                }
                .into());
            }
            let (guard, _) = self
                .shared
                .done
                .wait_timeout(report, deadline - now)
                .unwrap();
            report = guard;
        }
    }

    /// Asks the worker to stop at its next poll. Idempotent; a worker that
    /// has already finished keeps its original status.
    pub fn terminate(&self) {
        self.shared.terminate.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.shared.report.lock().unwrap().is_some()
    }
}
