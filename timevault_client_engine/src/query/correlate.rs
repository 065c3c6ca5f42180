// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use threadpool::ThreadPool;

use crate::query::value::ColumnValues;
use crate::query::{ClockId, Nanos, RawRecord};
use crate::ErrorKind;

/// Group-count threshold past which [`Correlator::ingest_many`] dispatches
/// to the worker pool. Below it the map is small enough that lookup/insert
/// does not dominate and fan-out overhead would only slow things down.
const PARALLEL_GROUP_PIVOT: usize = 32;

#[derive(Clone, Copy, Debug)]
pub struct CorrelateOptions {
    /// Enables the short-lived parallel ingest workers.
    pub concurrent: bool,

    /// Worker-pool width when `concurrent` is set.
    pub workers: usize,
}

impl Default for CorrelateOptions {
    fn default() -> Self {
        Self {
            concurrent: false,
            workers: 4,
        }
    }
}

/// All per-source columns sharing exactly one sampling-clock identity
/// within one result set. Frozen once the correlator is finalized.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatedGroup {
    clock: ClockId,
    columns: BTreeMap<String, ColumnValues>,
}

impl CorrelatedGroup {
    pub fn clock(&self) -> &ClockId {
        &self.clock
    }

    /// First sample instant.
    pub fn start(&self) -> Nanos {
        self.clock.start()
    }

    /// Final sample instant (closed interval).
    pub fn end(&self) -> Nanos {
        self.clock.end()
    }

    pub fn sample_count(&self) -> usize {
        self.clock.sample_count()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn column(&self, source: &str) -> Option<&ColumnValues> {
        self.columns.get(source)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &ColumnValues)> {
        self.columns.iter().map(|(name, values)| (name.as_str(), values))
    }

    pub fn byte_size(&self) -> u64 {
        self.columns.values().map(ColumnValues::byte_size).sum()
    }

    pub(crate) fn into_parts(self) -> (ClockId, BTreeMap<String, ColumnValues>) {
        (self.clock, self.columns)
    }
}

#[derive(Default)]
struct GroupBuilder {
    columns: BTreeMap<String, ColumnValues>,
    /// First source observed contributing twice; checked at finalize.
    duplicate: Option<String>,
}

struct CorrelatorInner {
    groups: BTreeMap<ClockId, GroupBuilder>,
    finalized: bool,
}

/// The group map and counters, behind the single mutex that is the
/// synchronization authority for parallel ingest workers.
struct Shared {
    inner: Mutex<CorrelatorInner>,
    bytes: AtomicU64,
}

impl Shared {
    /// Appends to an existing group, or hands the record back when no
    /// group matches its clock identity.
    fn try_append_existing(&self, record: RawRecord) -> crate::Result<Option<RawRecord>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            return Err(ErrorKind::InternalError.with_message("ingest after finalize"));
        }
        let id = record.timing.clock_id();
        match inner.groups.get_mut(&id) {
            None => Ok(Some(record)),
            Some(builder) => {
                self.bytes.fetch_add(record.byte_size(), Ordering::SeqCst);
                append(builder, record);
                Ok(None)
            }
        }
    }
}

fn append(builder: &mut GroupBuilder, record: RawRecord) {
    let RawRecord { source, values, .. } = record;
    if builder.columns.contains_key(&source) {
        tracing::warn!(%source, "duplicate contribution to one correlated group");
        builder.duplicate.get_or_insert(source);
    } else {
        builder.columns.insert(source, values);
    }
}

/// Groups raw records by sampling-clock identity.
///
/// Records arrive in arbitrary order across streams; correlation is
/// order-independent.
pub struct Correlator {
    shared: Arc<Shared>,
    pool: Option<ThreadPool>,
}

impl Correlator {
    pub fn new(options: CorrelateOptions) -> Self {
        let pool = (options.concurrent && options.workers > 1)
            .then(|| ThreadPool::with_name("correlate".to_string(), options.workers));
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(CorrelatorInner {
                    groups: BTreeMap::new(),
                    finalized: false,
                }),
                bytes: AtomicU64::new(0),
            }),
            pool,
        }
    }

    /// Total payload bytes ingested, for result-size accounting.
    pub fn bytes_processed(&self) -> u64 {
        self.shared.bytes.load(Ordering::SeqCst)
    }

    pub fn group_count(&self) -> usize {
        self.shared.inner.lock().unwrap().groups.len()
    }

    /// Files one record under its clock identity, creating the group on
    /// first sight.
    pub fn ingest(&self, record: RawRecord) -> crate::Result<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.finalized {
            return Err(ErrorKind::InternalError.with_message("ingest after finalize"));
        }
        self.shared
            .bytes
            .fetch_add(record.byte_size(), Ordering::SeqCst);
        let builder = inner.groups.entry(record.timing.clock_id()).or_default();
        append(builder, record);
        Ok(())
    }

    /// Files a batch, fanning out to the worker pool when the group map is
    /// large enough for lookup/insert to dominate. Workers only append to
    /// existing groups; records keyed by an unseen clock come back as
    /// misses and are inserted serially, so group creation stays ordered
    /// under the single map mutex.
    pub fn ingest_many(&self, records: Vec<RawRecord>) -> crate::Result<()> {
        let fan_out = self.pool.is_some()
            && records.len() > 1
            && self.group_count() >= PARALLEL_GROUP_PIVOT;
        if !fan_out {
            for record in records {
                self.ingest(record)?;
            }
            return Ok(());
        }

        let (tx, rx) = mpsc::channel();
        if let Some(pool) = &self.pool {
            for record in records {
                let tx = tx.clone();
                let shared = Arc::clone(&self.shared);
                pool.execute(move || {
                    let _ = tx.send(shared.try_append_existing(record));
                });
            }
        }
        drop(tx);

        let mut misses = Vec::new();
        for outcome in rx {
            if let Some(miss) = outcome? {
                misses.push(miss);
            }
        }
        for record in misses {
            self.ingest(record)?;
        }
        Ok(())
    }

    /// Freezes the group map into an ordered sequence of groups,
    /// validating uniqueness and size consistency. Fails fast on the first
    /// violation. A second call without [`Correlator::reset`] is an error.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn finalize(&self) -> crate::Result<Vec<CorrelatedGroup>> {
        let mut inner = self.shared.inner.lock().unwrap();
        if inner.finalized {
            return Err(ErrorKind::InternalError.with_message("correlator already finalized"));
        }
        inner.finalized = true;
        let groups = std::mem::take(&mut inner.groups);
        drop(inner);

        let mut out = Vec::with_capacity(groups.len());
        for (clock, builder) in groups {
            if let Some(source) = builder.duplicate {
                return Err(ErrorKind::DuplicateSource { source }.into());
            }
            let expected = clock.sample_count();
            for (source, values) in &builder.columns {
                if expected == 0 || values.len() != expected {
                    return Err(ErrorKind::BadSampleCount {
                        source: source.clone(),
                        expected,
                        got: values.len(),
                    }
                    .into());
                }
            }
            out.push(CorrelatedGroup {
                clock,
                columns: builder.columns,
            });
        }
        tracing::debug!(groups = out.len(), "correlation finalized");
        Ok(out)
    }

    /// Returns the correlator to its initial state so a fresh ingest can
    /// begin.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.groups.clear();
        inner.finalized = false;
        self.shared.bytes.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{RecordTiming, SamplingClock};

    fn clocked(source: &str, start: Nanos, period: Nanos, values: Vec<i32>) -> RawRecord {
        let clock = SamplingClock::new(start, period, values.len());
        RawRecord::new(
            source,
            RecordTiming::Clock(clock),
            ColumnValues::Int32(values),
        )
    }

    fn listed(source: &str, timestamps: &[Nanos], values: Vec<i32>) -> RawRecord {
        RawRecord::new(
            source,
            RecordTiming::Timestamps(Arc::from(timestamps)),
            ColumnValues::Int32(values),
        )
    }

    #[test]
    fn records_group_by_clock_identity_in_start_order() {
        let correlator = Correlator::new(CorrelateOptions::default());
        // Deliberately out of time order.
        correlator.ingest(clocked("B", 200, 50, vec![7, 8])).unwrap();
        correlator.ingest(clocked("A", 0, 50, vec![1, 2])).unwrap();
        correlator.ingest(clocked("B", 0, 50, vec![5, 6])).unwrap();
        correlator.ingest(clocked("A", 200, 50, vec![3, 4])).unwrap();

        let groups = correlator.finalize().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].start(), 0);
        assert_eq!(groups[1].start(), 200);
        assert_eq!(groups[0].sources().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(
            groups[0].column("B"),
            Some(&ColumnValues::Int32(vec![5, 6]))
        );
        assert_eq!(groups[1].end(), 250);
    }

    #[test]
    fn identical_timestamp_lists_correlate_distinct_lists_do_not() {
        let correlator = Correlator::new(CorrelateOptions::default());
        correlator.ingest(listed("A", &[0, 10, 25], vec![1, 2, 3])).unwrap();
        correlator.ingest(listed("B", &[0, 10, 25], vec![4, 5, 6])).unwrap();
        correlator.ingest(listed("C", &[0, 10, 26], vec![7, 8, 9])).unwrap();

        let groups = correlator.finalize().unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].sources().collect::<Vec<_>>(), vec!["A", "B"]);
        assert_eq!(groups[1].sources().collect::<Vec<_>>(), vec!["C"]);
    }

    #[test]
    fn clock_and_list_representations_never_correlate() {
        let correlator = Correlator::new(CorrelateOptions::default());
        correlator.ingest(clocked("A", 0, 10, vec![1, 2, 3])).unwrap();
        correlator.ingest(listed("B", &[0, 10, 20], vec![4, 5, 6])).unwrap();

        let groups = correlator.finalize().unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn duplicate_source_in_one_group_fails_finalize() {
        let correlator = Correlator::new(CorrelateOptions::default());
        correlator.ingest(clocked("A", 0, 50, vec![1, 2])).unwrap();
        correlator.ingest(clocked("A", 0, 50, vec![3, 4])).unwrap();

        let err = correlator.finalize().unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::DuplicateSource {
                source: "A".to_string()
            }
        );
    }

    #[test]
    fn sample_count_mismatch_fails_finalize() {
        let correlator = Correlator::new(CorrelateOptions::default());
        let clock = SamplingClock::new(0, 50, 4);
        correlator
            .ingest(RawRecord::new(
                "A",
                RecordTiming::Clock(clock),
                ColumnValues::Int32(vec![1, 2]),
            ))
            .unwrap();

        let err = correlator.finalize().unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::BadSampleCount {
                source: "A".to_string(),
                expected: 4,
                got: 2
            }
        );
    }

    #[test]
    fn zero_count_clock_fails_finalize() {
        let correlator = Correlator::new(CorrelateOptions::default());
        correlator
            .ingest(RawRecord::new(
                "A",
                RecordTiming::Clock(SamplingClock::new(0, 50, 0)),
                ColumnValues::Int32(vec![]),
            ))
            .unwrap();

        let err = correlator.finalize().unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::BadSampleCount { expected: 0, .. }
        ));
    }

    #[test]
    fn finalize_twice_requires_reset() {
        let correlator = Correlator::new(CorrelateOptions::default());
        correlator.ingest(clocked("A", 0, 50, vec![1, 2])).unwrap();
        let first = correlator.finalize().unwrap();
        assert_eq!(first.len(), 1);

        assert!(correlator.finalize().is_err());

        correlator.reset();
        assert_eq!(correlator.bytes_processed(), 0);
        correlator.ingest(clocked("A", 0, 50, vec![1, 2])).unwrap();
        let again = correlator.finalize().unwrap();
        assert_eq!(again, first);
    }

    #[test]
    fn parallel_ingest_matches_serial_result() {
        let serial = Correlator::new(CorrelateOptions::default());
        let parallel = Correlator::new(CorrelateOptions {
            concurrent: true,
            workers: 4,
        });

        // Seed enough groups to cross the fan-out pivot, then batch in a
        // second column for every group.
        let mut seed = Vec::new();
        let mut batch = Vec::new();
        for i in 0..(PARALLEL_GROUP_PIVOT as Nanos + 8) {
            seed.push(clocked("A", i * 1_000, 10, vec![i as i32, 0]));
            batch.push(clocked("B", i * 1_000, 10, vec![0, i as i32]));
        }
        // One record with a brand-new clock exercises the miss path.
        batch.push(clocked("C", 900_000, 10, vec![1, 2]));

        for correlator in [&serial, &parallel] {
            correlator.ingest_many(seed.clone()).unwrap();
            correlator.ingest_many(batch.clone()).unwrap();
        }

        let serial_groups = serial.finalize().unwrap();
        let parallel_groups = parallel.finalize().unwrap();
        assert_eq!(serial_groups, parallel_groups);
        assert_eq!(serial.bytes_processed(), parallel.bytes_processed());
    }
}
