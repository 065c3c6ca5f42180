// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::cmp::Ordering;
use std::sync::Arc;

mod buffer;
mod correlate;
pub mod decompose;
mod process;
mod request;
mod service;
mod stream;
mod table;
mod transfer;
pub mod value;

pub use buffer::{BufferState, RecordBuffer};
pub use correlate::{CorrelateOptions, CorrelatedGroup, Correlator};
pub use process::{SamplingBlock, SamplingProcess};
pub use request::{DecomposeHint, QueryRequest, TimeRange};
pub use service::{QueryOutcome, QueryService, RecordIter, StreamBuffer};
pub use stream::{RecoveryEngine, RecoveryOptions, RecoveryStats};
pub use table::{DataTable, DynamicDataTable, StaticDataTable, TableKind};
pub use transfer::{TransferHandle, TransferReport, TransferStatus, TransferTask};

use value::ColumnValues;

/// Nanoseconds since the platform epoch.
pub type Nanos = i64;

/// The RPC shape used to recover a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    /// One request, one response; the whole result must fit in it.
    Unary,
    /// One request, a server-side stream of responses.
    ServerStream,
    /// Bidirectional: every data response is acknowledged by the client.
    Bidi,
}

/// A uniform sample sequence described as `(start, period, count)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplingClock {
    pub start: Nanos,
    pub period: Nanos,
    pub count: usize,
}

impl SamplingClock {
    pub fn new(start: Nanos, period: Nanos, count: usize) -> Self {
        Self {
            start,
            period,
            count,
        }
    }

    /// Closed upper bound: the instant of the final sample.
    pub fn end(&self) -> Nanos {
        if self.count == 0 {
            self.start
        } else {
            self.start + self.period * (self.count as Nanos - 1)
        }
    }

    pub fn timestamps(&self) -> Vec<Nanos> {
        (0..self.count as Nanos)
            .map(|i| self.start + i * self.period)
            .collect()
    }
}

/// The sampling-clock identity used to correlate raw records.
///
/// Two records correlate iff their `ClockId`s are equal. A clock-defined
/// record and an explicit-timestamp-list record never correlate, even when
/// they denote the same instants; two explicit lists correlate iff their
/// sequences are identical element-for-element (allocation does not
/// matter). Ordering is by start instant first, so a `BTreeMap` keyed on
/// `ClockId` iterates groups in finalization order.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClockId {
    Clocked {
        start: Nanos,
        period: Nanos,
        count: usize,
    },
    Explicit {
        timestamps: Arc<[Nanos]>,
    },
}

impl ClockId {
    pub fn start(&self) -> Nanos {
        match self {
            ClockId::Clocked { start, .. } => *start,
            ClockId::Explicit { timestamps } => timestamps.first().copied().unwrap_or(Nanos::MIN),
        }
    }

    /// Closed upper bound of the identity's time domain.
    pub fn end(&self) -> Nanos {
        match self {
            ClockId::Clocked {
                start,
                period,
                count,
            } => SamplingClock::new(*start, *period, *count).end(),
            ClockId::Explicit { timestamps } => {
                timestamps.last().copied().unwrap_or(Nanos::MIN)
            }
        }
    }

    /// Number of samples the identity declares.
    pub fn sample_count(&self) -> usize {
        match self {
            ClockId::Clocked { count, .. } => *count,
            ClockId::Explicit { timestamps } => timestamps.len(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            ClockId::Clocked { .. } => 0,
            ClockId::Explicit { .. } => 1,
        }
    }
}

impl Ord for ClockId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start()
            .cmp(&other.start())
            .then_with(|| self.rank().cmp(&other.rank()))
            .then_with(|| match (self, other) {
                (
                    ClockId::Clocked {
                        period: lp,
                        count: lc,
                        ..
                    },
                    ClockId::Clocked {
                        period: rp,
                        count: rc,
                        ..
                    },
                ) => lp.cmp(rp).then(lc.cmp(rc)),
                (
                    ClockId::Explicit { timestamps: lt },
                    ClockId::Explicit { timestamps: rt },
                ) => lt.cmp(rt),
                // Ranks differ, so the previous comparison already decided.
                _ => Ordering::Equal,
            })
    }
}

impl PartialOrd for ClockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// How a raw record locates its samples in time.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordTiming {
    Clock(SamplingClock),
    Timestamps(Arc<[Nanos]>),
}

impl RecordTiming {
    pub fn clock_id(&self) -> ClockId {
        match self {
            RecordTiming::Clock(clock) => ClockId::Clocked {
                start: clock.start,
                period: clock.period,
                count: clock.count,
            },
            RecordTiming::Timestamps(timestamps) => ClockId::Explicit {
                timestamps: Arc::clone(timestamps),
            },
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            RecordTiming::Clock(clock) => clock.count,
            RecordTiming::Timestamps(timestamps) => timestamps.len(),
        }
    }
}

/// One per-source sample column as it arrived off the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub source: String,
    pub timing: RecordTiming,
    pub values: ColumnValues,
}

impl RawRecord {
    pub fn new(source: impl Into<String>, timing: RecordTiming, values: ColumnValues) -> Self {
        Self {
            source: source.into(),
            timing,
            values,
        }
    }

    /// Approximate wire bytes, accumulated for result-size accounting.
    pub fn byte_size(&self) -> u64 {
        let timing = match &self.timing {
            RecordTiming::Clock(_) => 24,
            RecordTiming::Timestamps(timestamps) => timestamps.len() as u64 * 8,
        };
        self.source.len() as u64 + timing + self.values.byte_size()
    }
}
