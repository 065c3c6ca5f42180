// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::collections::HashSet;

use crate::query::{Nanos, StreamKind};
use crate::ErrorKind;

/// A half-open time interval `[begin, end)` in platform nanoseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub begin: Nanos,
    pub end: Nanos,
}

impl TimeRange {
    pub fn new(begin: Nanos, end: Nanos) -> Self {
        Self { begin, end }
    }

    pub fn duration(&self) -> Nanos {
        self.end.saturating_sub(self.begin)
    }

    /// Duration in whole seconds, rounding fractional seconds up. Used for
    /// domain-size estimation, where a sub-second range still counts as one.
    pub fn seconds_ceil(&self) -> u64 {
        let nanos = self.duration().max(0) as u64;
        nanos.div_ceil(1_000_000_000)
    }

    /// Splits the range into `pieces` near-equal sub-ranges, earlier first.
    ///
    /// The union is exactly `self` and the pieces are pairwise disjoint;
    /// lengths differ by at most one nanosecond. Fewer pieces come back
    /// when the range is too narrow to give every piece at least one
    /// nanosecond.
    pub fn split_even(&self, pieces: usize) -> Vec<TimeRange> {
        let duration = self.duration();
        let pieces = (pieces.max(1) as Nanos).min(duration.max(1));
        let base = duration / pieces;
        let remainder = duration % pieces;
        let mut begin = self.begin;
        (0..pieces)
            .map(|i| {
                let length = base + Nanos::from(i < remainder);
                let piece = TimeRange::new(begin, begin + length);
                begin += length;
                piece
            })
            .collect()
    }
}

/// Caller-supplied decomposition preferences, overriding the configured
/// per-axis caps for one request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecomposeHint {
    pub max_sources: Option<usize>,
    pub max_duration_nanos: Option<Nanos>,
}

/// A validated description of one logical query: which sources, over which
/// time range, recovered over which stream shape.
///
/// Sub-requests produced by the decomposer are the same type; each is a
/// disjoint sub-rectangle of its parent's `(sources x time)` domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    pub range: TimeRange,
    pub sources: Vec<String>,
    pub stream_kind: Option<StreamKind>,
    pub hint: Option<DecomposeHint>,
}

impl QueryRequest {
    pub fn new(range: TimeRange, sources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            range,
            sources: sources.into_iter().map(Into::into).collect(),
            stream_kind: None,
            hint: None,
        }
    }

    pub fn with_stream_kind(mut self, kind: StreamKind) -> Self {
        self.stream_kind = Some(kind);
        self
    }

    pub fn with_hint(mut self, hint: DecomposeHint) -> Self {
        self.hint = Some(hint);
        self
    }

    /// Estimated `(sources x seconds)` domain size, the unit the
    /// decomposition pivot is expressed in.
    pub fn domain_size(&self) -> u64 {
        self.sources.len() as u64 * self.range.seconds_ceil().max(1)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.sources.is_empty() {
            return Err(ErrorKind::InvalidRequest.with_message("request names no sources"));
        }
        if self.range.end <= self.range.begin {
            return Err(ErrorKind::InvalidRequest.with_message(format!(
                "time range [{}, {}) is empty",
                self.range.begin, self.range.end
            )));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.is_empty() {
                return Err(ErrorKind::InvalidRequest.with_message("empty source name"));
            }
            if !seen.insert(source.as_str()) {
                return Err(ErrorKind::InvalidRequest
                    .with_message(format!("source {source:?} listed more than once")));
            }
        }
        Ok(())
    }
}
