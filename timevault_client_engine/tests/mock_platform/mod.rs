// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

//! A simulated TimeVault archive service for exercising the query
//! pipeline end-to-end.
//!
//! The mock is deliberately simple and leans on a few assumptions:
//! * The archive holds per-source chunks (one wire record each); a stream
//!   for a sub-request carries every chunk whose source is named by the
//!   sub-request and whose clock starts inside the sub-request's range.
//! * Faults are scripted per archive, not per stream: the first stream to
//!   hit the faulting condition reports it.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use timevault_client_engine::config::EngineConfig;
use timevault_client_engine::query::value::ColumnValues;
use timevault_client_engine::query::{
    Nanos, QueryRequest, QueryService, RawRecord, RecordTiming, SamplingClock, StreamKind,
};
use timevault_client_engine::transport::{
    ArchiveTransport, CancelToken, MetadataRecord, MetadataRequest, RecordStream, StreamEvent,
};
use timevault_client_engine::{Error, ErrorKind};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Scripted misbehavior for failure-path tests.
#[derive(Clone, Debug)]
pub enum Fault {
    /// The first response of every stream is a rejection.
    RejectFirst { reason: String, message: String },

    /// Streams report a status error after delivering `after` records.
    StatusAfter {
        after: usize,
        status: i32,
        message: String,
    },

    /// Streams deliver their records and then never terminate; only
    /// cancellation gets out.
    StallAtEnd,
}

pub struct MockArchive {
    chunks: Vec<RawRecord>,
    metadata: Vec<MetadataRecord>,
    fault: Option<Fault>,
    opened: Mutex<Vec<QueryRequest>>,
    pub acks: Arc<AtomicUsize>,
}

impl MockArchive {
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            metadata: Vec::new(),
            fault: None,
            opened: Mutex::new(Vec::new()),
            acks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item = RawRecord>) -> Self {
        self.chunks.extend(records);
        self
    }

    pub fn with_metadata(mut self, records: impl IntoIterator<Item = MetadataRecord>) -> Self {
        self.metadata.extend(records);
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = Some(fault);
        self
    }

    /// The sub-requests the pipeline actually opened streams for.
    pub fn opened_requests(&self) -> Vec<QueryRequest> {
        self.opened.lock().unwrap().clone()
    }

    fn matching_chunks(&self, request: &QueryRequest) -> Vec<RawRecord> {
        self.chunks
            .iter()
            .filter(|chunk| {
                let start = match &chunk.timing {
                    RecordTiming::Clock(clock) => clock.start,
                    RecordTiming::Timestamps(timestamps) => {
                        timestamps.first().copied().unwrap_or(Nanos::MIN)
                    }
                };
                request.sources.contains(&chunk.source)
                    && start >= request.range.begin
                    && start < request.range.end
            })
            .cloned()
            .collect()
    }
}

impl ArchiveTransport for MockArchive {
    fn open_stream(
        &self,
        request: &QueryRequest,
        _kind: StreamKind,
        cancel: CancelToken,
    ) -> Result<Box<dyn RecordStream>, Error> {
        self.opened.lock().unwrap().push(request.clone());

        let chunks = self.matching_chunks(request);
        let mut events: VecDeque<StreamEvent> = VecDeque::new();
        let mut stall_at_end = false;
        match &self.fault {
            Some(Fault::RejectFirst { reason, message }) => {
                events.push_back(StreamEvent::Rejection {
                    reason: reason.clone(),
                    message: message.clone(),
                });
            }
            Some(Fault::StatusAfter {
                after,
                status,
                message,
            }) => {
                for chunk in chunks.into_iter().take(*after) {
                    events.push_back(StreamEvent::Record(chunk));
                }
                events.push_back(StreamEvent::StatusError {
                    status: *status,
                    message: message.clone(),
                });
            }
            Some(Fault::StallAtEnd) => {
                for chunk in chunks {
                    events.push_back(StreamEvent::Record(chunk));
                }
                stall_at_end = true;
            }
            None => {
                for chunk in chunks {
                    events.push_back(StreamEvent::Record(chunk));
                }
                events.push_back(StreamEvent::End);
            }
        }

        Ok(Box::new(MockStream {
            events,
            stall_at_end,
            cancel,
            acks: Arc::clone(&self.acks),
        }))
    }

    fn query_unary(&self, request: &QueryRequest) -> Result<Vec<RawRecord>, Error> {
        if let Some(Fault::RejectFirst { reason, message }) = &self.fault {
            return Err(ErrorKind::RequestRejected {
                reason: reason.clone(),
            }
            .with_message(message.clone()));
        }
        Ok(self.matching_chunks(request))
    }

    fn query_metadata(&self, request: &MetadataRequest) -> Result<Vec<MetadataRecord>, Error> {
        Ok(self
            .metadata
            .iter()
            .filter(|record| request.matches(&record.name))
            .cloned()
            .collect())
    }
}

struct MockStream {
    events: VecDeque<StreamEvent>,
    stall_at_end: bool,
    cancel: CancelToken,
    acks: Arc<AtomicUsize>,
}

impl RecordStream for MockStream {
    fn next_event(&mut self) -> Result<StreamEvent, Error> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        if self.stall_at_end {
            while !self.cancel.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            return Err(ErrorKind::Cancelled.into());
        }
        Ok(StreamEvent::End)
    }

    fn ack(&mut self) -> Result<(), Error> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn clocked_i32(source: &str, start: Nanos, period: Nanos, values: Vec<i32>) -> RawRecord {
    let clock = SamplingClock::new(start, period, values.len());
    RawRecord::new(
        source,
        RecordTiming::Clock(clock),
        ColumnValues::Int32(values),
    )
}

pub fn clocked_f64(source: &str, start: Nanos, period: Nanos, values: Vec<f64>) -> RawRecord {
    let clock = SamplingClock::new(start, period, values.len());
    RawRecord::new(
        source,
        RecordTiming::Clock(clock),
        ColumnValues::Float64(values),
    )
}

pub fn listed_i32(source: &str, timestamps: &[Nanos], values: Vec<i32>) -> RawRecord {
    RawRecord::new(
        source,
        RecordTiming::Timestamps(Arc::from(timestamps)),
        ColumnValues::Int32(values),
    )
}

/// Builds a service over the given archive with a JSON configuration
/// overlay (empty string for pure defaults).
pub fn service_over(archive: Arc<MockArchive>, config_json: &str) -> QueryService {
    init_tracing();
    let config = if config_json.is_empty() {
        EngineConfig::default()
    } else {
        EngineConfig::from_json_slice(config_json.as_bytes()).unwrap()
    };
    QueryService::new(archive, config)
}
