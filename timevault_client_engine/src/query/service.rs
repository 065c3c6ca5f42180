// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::{EngineConfig, TableMode, TableSection};
use crate::error::TimeoutPhase;
use crate::query::decompose::{decompose, DecomposeLimits};
use crate::query::{
    CorrelateOptions, Correlator, DataTable, DynamicDataTable, QueryRequest, RawRecord,
    RecordBuffer, RecoveryEngine, RecoveryOptions, RecoveryStats, SamplingProcess,
    StaticDataTable, TransferHandle, TransferStatus, TransferTask,
};
use crate::transport::{ArchiveTransport, MetadataRecord, MetadataRequest};
use crate::ErrorKind;

/// Fallback drain deadline when per-request timeouts are disabled: the
/// transfer task is guaranteed to finish once the buffer is sealed, so
/// this only bounds how long a pathological drain can hold the façade.
const DRAIN_FALLBACK: Duration = Duration::from_secs(3600);

/// A recovered table plus the result-size bookkeeping for it.
#[derive(Debug)]
pub struct QueryOutcome {
    pub table: DataTable,

    /// Approximate payload bytes received across all streams.
    pub bytes_processed: u64,

    /// Records received across all streams.
    pub records_received: u64,

    /// The composite request list actually recovered, for introspection.
    pub sub_requests: Vec<QueryRequest>,
}

struct ServiceState {
    shut_down: bool,
    in_flight: usize,
    active_cancel: Option<crate::transport::CancelToken>,
}

/// The single client-facing entry point.
///
/// Owns the transport connection and runs the request-to-table pipeline:
/// decomposition, multi-stream recovery, correlation, assembly, and table
/// construction. At most one `query_data*` call is in flight per service;
/// concurrent callers block on the internal serialization mutex.
pub struct QueryService {
    transport: Arc<dyn ArchiveTransport>,
    config: EngineConfig,
    request_lock: Mutex<()>,
    state: Mutex<ServiceState>,
    idle: Condvar,
}

impl QueryService {
    pub fn new(transport: Arc<dyn ArchiveTransport>, config: EngineConfig) -> Self {
        if config.logging.enabled {
            tracing::debug!(?config, "query service created");
        }
        Self {
            transport,
            config,
            request_lock: Mutex::new(()),
            state: Mutex::new(ServiceState {
                shut_down: false,
                in_flight: 0,
                active_cancel: None,
            }),
            idle: Condvar::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Unary metadata pass-through. Not serialized against data requests.
    pub fn query_metadata(
        &self,
        request: &MetadataRequest,
    ) -> crate::Result<Vec<MetadataRecord>> {
        self.check_open()?;
        self.transport.query_metadata(request)
    }

    /// One-shot request whose entire result must fit in a single response.
    /// No decomposition, no multi-stream recovery.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn query_data_unary(&self, request: QueryRequest) -> crate::Result<QueryOutcome> {
        request.validate()?;
        let _guard = self.begin_request()?;
        self.unary_outcome(request)
    }

    /// The full pipeline: decomposes the request (configuration
    /// permitting), recovers all sub-requests concurrently, correlates,
    /// and returns the assembled table.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn query_data(&self, request: QueryRequest) -> crate::Result<QueryOutcome> {
        request.validate()?;
        let guard = self.begin_request()?;
        if !self.config.stream.active {
            tracing::debug!("streaming disabled, degrading to unary recovery");
            return self.unary_outcome(request);
        }
        let subs = self.decompose_for_recovery(&request);
        self.run_pipeline(&guard, subs)
    }

    /// The full pipeline over a caller-supplied sub-request list. The
    /// decomposer is skipped; the caller owns the domain partitioning.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn query_data_all(&self, requests: Vec<QueryRequest>) -> crate::Result<QueryOutcome> {
        if requests.is_empty() {
            return Err(ErrorKind::InvalidRequest.with_message("empty request list"));
        }
        for request in &requests {
            request.validate()?;
        }
        let guard = self.begin_request()?;
        self.run_pipeline(&guard, requests)
    }

    /// Raw streaming for advanced callers doing their own assembly.
    ///
    /// The returned handle is not serialized against `query_data*` calls
    /// beyond the setup-time shutdown check; the caller owns its
    /// lifecycle.
    pub fn query_data_stream(&self, request: QueryRequest) -> crate::Result<StreamBuffer> {
        request.validate()?;
        self.check_open()?;
        if !self.config.stream.active {
            return Err(
                ErrorKind::InvalidRequest.with_message("streaming is disabled by configuration")
            );
        }
        let subs = self.decompose_for_recovery(&request);
        let buffer = Arc::new(self.build_buffer());
        let engine = RecoveryEngine::new(
            Arc::clone(&self.transport),
            Arc::clone(&buffer),
            self.recovery_options(),
        );
        Ok(StreamBuffer::new(buffer, engine, subs))
    }

    /// Stops accepting new requests; in-flight work completes normally.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shut_down = true;
        self.idle.notify_all();
        tracing::debug!("query service shut down");
    }

    /// Stops accepting new requests and cancels the in-flight request.
    pub fn shutdown_now(&self) {
        let mut state = self.state.lock().unwrap();
        state.shut_down = true;
        if let Some(cancel) = state.active_cancel.take() {
            cancel.cancel();
        }
        self.idle.notify_all();
        tracing::debug!("query service shut down immediately");
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    /// Shut down with no request in flight.
    pub fn is_terminated(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.shut_down && state.in_flight == 0
    }

    /// Blocks until the service is terminated, up to `timeout`. Returns
    /// whether termination was observed.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shut_down && state.in_flight == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.idle.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }

    fn check_open(&self) -> crate::Result<()> {
        if self.state.lock().unwrap().shut_down {
            Err(ErrorKind::Cancelled.with_message("service is shut down"))
        } else {
            Ok(())
        }
    }

    fn begin_request(&self) -> crate::Result<RequestGuard<'_>> {
        let serial = self.request_lock.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        if state.shut_down {
            return Err(ErrorKind::Cancelled.with_message("service is shut down"));
        }
        state.in_flight += 1;
        drop(state);
        Ok(RequestGuard {
            service: self,
            _serial: serial,
        })
    }

    fn decompose_for_recovery(&self, request: &QueryRequest) -> Vec<QueryRequest> {
        if self.config.stream.concurrency.active {
            decompose(request, &DecomposeLimits::from_config(&self.config))
        } else {
            vec![request.clone()]
        }
    }

    fn build_buffer(&self) -> RecordBuffer {
        let section = &self.config.stream.buffer;
        let capacity = (section.size > 0).then_some(section.size);
        RecordBuffer::new(capacity, section.backpressure)
    }

    fn recovery_options(&self) -> RecoveryOptions {
        RecoveryOptions {
            max_streams: self.config.stream.concurrency.max_streams.max(1),
            default_kind: self.config.stream.kind,
            timeout: self.config.timeout.duration(),
        }
    }

    fn correlate_options(&self) -> CorrelateOptions {
        CorrelateOptions {
            concurrent: self.config.correlate.concurrent,
            ..CorrelateOptions::default()
        }
    }

    fn unary_outcome(&self, request: QueryRequest) -> crate::Result<QueryOutcome> {
        let records = self.transport.query_unary(&request)?;
        let correlator = Correlator::new(CorrelateOptions::default());
        let mut stats = RecoveryStats::default();
        for record in records {
            stats.records += 1;
            stats.bytes += record.byte_size();
            correlator.ingest(record)?;
        }
        let process = SamplingProcess::assemble(correlator.finalize()?)?;
        let table = select_table(process, stats.bytes, &self.config.table)?;
        Ok(QueryOutcome {
            table,
            bytes_processed: stats.bytes,
            records_received: stats.records,
            sub_requests: vec![request],
        })
    }

    fn run_pipeline(
        &self,
        _guard: &RequestGuard<'_>,
        subs: Vec<QueryRequest>,
    ) -> crate::Result<QueryOutcome> {
        let deadline = self.config.timeout.duration().map(|t| Instant::now() + t);
        let buffer = Arc::new(self.build_buffer());
        let correlator = Arc::new(Correlator::new(self.correlate_options()));
        let engine = RecoveryEngine::new(
            Arc::clone(&self.transport),
            Arc::clone(&buffer),
            self.recovery_options(),
        );
        self.state.lock().unwrap().active_cancel = Some(engine.cancel_token());

        // Mid-stream correlation starts the consumer before the first
        // stream opens; post-stream correlation drains after recovery.
        let mut transfer: Option<TransferHandle> = None;
        if self.config.correlate.mid_stream {
            transfer = Some(TransferTask::spawn(
                Arc::clone(&buffer),
                Arc::clone(&correlator),
            )?);
        }

        let stats = match engine.recover(&subs) {
            Ok(stats) => stats,
            Err(e) => {
                // The engine has already cancelled its streams and shut
                // the buffer down; make sure the consumer is not left
                // running before surfacing the first-observed error.
                if let Some(transfer) = &transfer {
                    transfer.terminate();
                    let _ = transfer.join(Duration::from_secs(5));
                }
                return Err(e);
            }
        };

        let transfer = match transfer {
            Some(handle) => handle,
            None => TransferTask::spawn(Arc::clone(&buffer), Arc::clone(&correlator))?,
        };
        let drain_timeout = deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
            .unwrap_or(DRAIN_FALLBACK);
        let report = match transfer.join(drain_timeout) {
            Ok(report) => report,
            Err(e) => {
                transfer.terminate();
                buffer.shutdown_now();
                return Err(e);
            }
        };
        if let TransferStatus::Failure(reason) = report.status {
            return Err(
                ErrorKind::InternalError.with_message(format!("transfer failed: {reason}"))
            );
        }

        let process = SamplingProcess::assemble(correlator.finalize()?)?;
        let table = select_table(process, stats.bytes, &self.config.table)?;
        Ok(QueryOutcome {
            table,
            bytes_processed: stats.bytes,
            records_received: stats.records,
            sub_requests: subs,
        })
    }
}

struct RequestGuard<'a> {
    service: &'a QueryService,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.service.state.lock().unwrap();
        state.in_flight -= 1;
        state.active_cancel = None;
        self.service.idle.notify_all();
    }
}

/// Applies the table-variant policy to a finished sampling process.
fn select_table(
    process: SamplingProcess,
    measured_bytes: u64,
    section: &TableSection,
) -> crate::Result<DataTable> {
    let fits = !section.static_table.max_size_enabled
        || measured_bytes <= section.static_table.max_size_bytes;
    match section.mode {
        TableMode::Static => {
            if !fits {
                return Err(ErrorKind::TableTooLarge {
                    size: measured_bytes,
                    limit: section.static_table.max_size_bytes,
                }
                .into());
            }
            tracing::debug!(measured_bytes, "materializing static table");
            Ok(DataTable::Static(StaticDataTable::from_process(&process)))
        }
        TableMode::Dynamic => {
            tracing::debug!(measured_bytes, "serving dynamic table");
            Ok(DataTable::Dynamic(DynamicDataTable::new(Arc::new(process))))
        }
        TableMode::Auto => {
            if section.static_table.is_default && fits {
                tracing::debug!(measured_bytes, "auto policy chose static table");
                Ok(DataTable::Static(StaticDataTable::from_process(&process)))
            } else if section.dynamic.enabled {
                tracing::debug!(measured_bytes, "auto policy chose dynamic table");
                Ok(DataTable::Dynamic(DynamicDataTable::new(Arc::new(process))))
            } else {
                Err(ErrorKind::NoViableTable.into())
            }
        }
    }
}

/// A started-or-not handle over raw record recovery, for callers doing
/// their own assembly.
pub struct StreamBuffer {
    buffer: Arc<RecordBuffer>,
    engine: Arc<RecoveryEngine>,
    subs: Vec<QueryRequest>,
    started: AtomicBool,
    result: Arc<StreamResult>,
}

struct StreamResult {
    slot: Mutex<Option<crate::Result<RecoveryStats>>>,
    done: Condvar,
}

impl StreamBuffer {
    fn new(buffer: Arc<RecordBuffer>, engine: RecoveryEngine, subs: Vec<QueryRequest>) -> Self {
        Self {
            buffer,
            engine: Arc::new(engine),
            subs,
            started: AtomicBool::new(false),
            result: Arc::new(StreamResult {
                slot: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// The composite request list this buffer will recover.
    pub fn sub_requests(&self) -> &[QueryRequest] {
        &self.subs
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Kicks off recovery on a background thread. Idempotent; only the
    /// first call starts anything.
    pub fn start(&self) -> crate::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let engine = Arc::clone(&self.engine);
        let subs = self.subs.clone();
        let result = Arc::clone(&self.result);
        std::thread::Builder::new()
            .name("stream-recovery".to_string())
            .spawn(move || {
                let outcome = engine.recover(&subs);
                *result.slot.lock().unwrap() = Some(outcome);
                result.done.notify_all();
            })
            .map_err(|e| ErrorKind::InternalError.with_source(e))?;
        Ok(())
    }

    /// Starts recovery (if not already started) and blocks until every
    /// stream has terminated. The terminal result can be consumed once.
    pub fn start_and_await(&self, timeout: Duration) -> crate::Result<RecoveryStats> {
        self.start()?;
        self.await_completion(timeout)
    }

    /// Blocks until recovery reports its terminal result, up to `timeout`.
    /// The result is handed over exactly once.
    pub fn await_completion(&self, timeout: Duration) -> crate::Result<RecoveryStats> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.result.slot.lock().unwrap();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::Timeout {
                    phase: TimeoutPhase::Streaming,
                }
                .into());
            }
            let (guard, _) = self.result.done.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
        }
    }

    /// Pops the next raw record, blocking up to `timeout`. `Ok(None)`
    /// means the stream set has terminated and the buffer is drained.
    pub fn next_record(&self, timeout: Duration) -> crate::Result<Option<RawRecord>> {
        self.buffer.pop(timeout)
    }

    /// A blocking iterator over the recovered records. Ends when the
    /// buffer drains after stream termination, or on any buffer error.
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter { stream: self }
    }

    /// Cancels recovery and discards anything not yet consumed.
    pub fn close(&self) {
        self.engine.cancel_token().cancel();
        self.buffer.shutdown_now();
    }
}

pub struct RecordIter<'a> {
    stream: &'a StreamBuffer,
}

impl Iterator for RecordIter<'_> {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        loop {
            match self.stream.next_record(Duration::from_millis(50)) {
                Ok(next) => return next,
                Err(e) if matches!(e.kind(), ErrorKind::Timeout { .. }) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::value::ColumnValues;
    use crate::query::{
        CorrelateOptions, RecordTiming, SamplingClock, TableKind,
    };
    use crate::query::RawRecord;

    fn process_of(records: Vec<RawRecord>) -> SamplingProcess {
        let correlator = Correlator::new(CorrelateOptions::default());
        for record in records {
            correlator.ingest(record).unwrap();
        }
        SamplingProcess::assemble(correlator.finalize().unwrap()).unwrap()
    }

    fn small_process() -> SamplingProcess {
        process_of(vec![RawRecord::new(
            "A",
            RecordTiming::Clock(SamplingClock::new(0, 50, 2)),
            ColumnValues::Int32(vec![1, 2]),
        )])
    }

    fn section(mode: TableMode) -> TableSection {
        TableSection {
            mode,
            ..TableSection::default()
        }
    }

    #[test]
    fn auto_policy_prefers_static_within_the_limit() {
        let table = select_table(small_process(), 100, &section(TableMode::Auto)).unwrap();
        assert_eq!(table.kind(), TableKind::Static);
    }

    #[test]
    fn auto_policy_falls_back_to_dynamic_past_the_limit() {
        let mut section = section(TableMode::Auto);
        section.static_table.max_size_bytes = 10;
        let table = select_table(small_process(), 100, &section).unwrap();
        assert_eq!(table.kind(), TableKind::Dynamic);
    }

    #[test]
    fn auto_policy_fails_when_no_variant_is_allowed() {
        let mut section = section(TableMode::Auto);
        section.static_table.max_size_bytes = 10;
        section.dynamic.enabled = false;
        let err = select_table(small_process(), 100, &section).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::NoViableTable);
    }

    #[test]
    fn explicit_static_fails_past_the_limit() {
        let mut section = section(TableMode::Static);
        section.static_table.max_size_bytes = 10;
        let err = select_table(small_process(), 100, &section).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::TableTooLarge {
                size: 100,
                limit: 10
            }
        );
    }

    #[test]
    fn explicit_static_ignores_a_disabled_limit() {
        let mut section = section(TableMode::Static);
        section.static_table.max_size_bytes = 10;
        section.static_table.max_size_enabled = false;
        let table = select_table(small_process(), 100, &section).unwrap();
        assert_eq!(table.kind(), TableKind::Static);
    }

    #[test]
    fn explicit_dynamic_always_serves() {
        let mut section = section(TableMode::Dynamic);
        section.static_table.max_size_bytes = 10;
        let table = select_table(small_process(), 100, &section).unwrap();
        assert_eq!(table.kind(), TableKind::Dynamic);
    }
}
