// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::query::value::{ColumnValues, DataType};
use crate::query::{ClockId, CorrelatedGroup, Nanos, SamplingClock};
use crate::ErrorKind;

/// A correlated group promoted to an addressable table page.
///
/// Closed sum over the two ways a page can locate its samples in time:
/// a sampling clock (timestamps are computed on demand) or an explicit
/// timestamp list (shared with the records that carried it).
#[derive(Clone, Debug)]
pub enum SamplingBlock {
    Clocked {
        clock: SamplingClock,
        columns: BTreeMap<String, ColumnValues>,
    },
    Explicit {
        timestamps: Arc<[Nanos]>,
        columns: BTreeMap<String, ColumnValues>,
    },
}

impl SamplingBlock {
    fn from_group(group: CorrelatedGroup) -> Self {
        let (clock, columns) = group.into_parts();
        match clock {
            ClockId::Clocked {
                start,
                period,
                count,
            } => SamplingBlock::Clocked {
                clock: SamplingClock::new(start, period, count),
                columns,
            },
            ClockId::Explicit { timestamps } => SamplingBlock::Explicit {
                timestamps,
                columns,
            },
        }
    }

    pub fn start(&self) -> Nanos {
        match self {
            SamplingBlock::Clocked { clock, .. } => clock.start,
            SamplingBlock::Explicit { timestamps, .. } => {
                timestamps.first().copied().unwrap_or(Nanos::MIN)
            }
        }
    }

    /// Final sample instant (closed interval).
    pub fn end(&self) -> Nanos {
        match self {
            SamplingBlock::Clocked { clock, .. } => clock.end(),
            SamplingBlock::Explicit { timestamps, .. } => {
                timestamps.last().copied().unwrap_or(Nanos::MIN)
            }
        }
    }

    pub fn sample_count(&self) -> usize {
        match self {
            SamplingBlock::Clocked { clock, .. } => clock.count,
            SamplingBlock::Explicit { timestamps, .. } => timestamps.len(),
        }
    }

    /// The instant of one row within this block.
    pub fn timestamp(&self, index: usize) -> Option<Nanos> {
        if index >= self.sample_count() {
            return None;
        }
        Some(match self {
            SamplingBlock::Clocked { clock, .. } => clock.start + clock.period * index as Nanos,
            SamplingBlock::Explicit { timestamps, .. } => timestamps[index],
        })
    }

    pub fn timestamps(&self) -> Vec<Nanos> {
        match self {
            SamplingBlock::Clocked { clock, .. } => clock.timestamps(),
            SamplingBlock::Explicit { timestamps, .. } => timestamps.to_vec(),
        }
    }

    fn columns_map(&self) -> &BTreeMap<String, ColumnValues> {
        match self {
            SamplingBlock::Clocked { columns, .. } => columns,
            SamplingBlock::Explicit { columns, .. } => columns,
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.columns_map().keys().map(String::as_str)
    }

    pub fn column(&self, source: &str) -> Option<&ColumnValues> {
        self.columns_map().get(source)
    }

    pub fn byte_size(&self) -> u64 {
        let timing = match self {
            SamplingBlock::Clocked { .. } => 24,
            SamplingBlock::Explicit { timestamps, .. } => timestamps.len() as u64 * 8,
        };
        timing
            + self
                .columns_map()
                .values()
                .map(ColumnValues::byte_size)
                .sum::<u64>()
    }
}

/// An ordered, time-disjoint sequence of sampling blocks covering one
/// request's time domain.
#[derive(Clone, Debug)]
pub struct SamplingProcess {
    blocks: Vec<SamplingBlock>,
    /// Sorted union of the block source names.
    source_names: Vec<String>,
    /// Element types aligned with `source_names`.
    source_types: Vec<DataType>,
    /// Starting table row of each block.
    row_offsets: Vec<usize>,
    row_count: usize,
}

impl SamplingProcess {
    /// Builds a process from finalized correlated groups, checking start
    /// ordering, closed-interval disjointness, and per-source element-type
    /// uniformity, in that order, failing fast.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub fn assemble(groups: Vec<CorrelatedGroup>) -> crate::Result<Self> {
        for pair in groups.windows(2) {
            if pair[1].start() <= pair[0].start() {
                return Err(ErrorKind::BadBlockRange.with_message(format!(
                    "group starting at {} does not follow group starting at {}",
                    pair[1].start(),
                    pair[0].start()
                )));
            }
            if pair[0].end() >= pair[1].start() {
                return Err(ErrorKind::BadBlockRange.with_message(format!(
                    "group [{}, {}] overlaps group starting at {}",
                    pair[0].start(),
                    pair[0].end(),
                    pair[1].start()
                )));
            }
        }

        let mut types: BTreeMap<&str, DataType> = BTreeMap::new();
        for group in &groups {
            for (source, values) in group.columns() {
                let data_type = values.data_type();
                match types.get(source) {
                    Some(seen) if *seen != data_type => {
                        return Err(ErrorKind::TypeConflict {
                            source: source.to_string(),
                            left: *seen,
                            right: data_type,
                        }
                        .into());
                    }
                    Some(_) => {}
                    None => {
                        types.insert(source, data_type);
                    }
                }
            }
        }
        let (source_names, source_types): (Vec<String>, Vec<DataType>) = types
            .into_iter()
            .map(|(name, data_type)| (name.to_string(), data_type))
            .unzip();

        let mut row_offsets = Vec::with_capacity(groups.len());
        let mut row_count = 0;
        let blocks: Vec<SamplingBlock> = groups
            .into_iter()
            .map(|group| {
                let block = SamplingBlock::from_group(group);
                row_offsets.push(row_count);
                row_count += block.sample_count();
                block
            })
            .collect();

        tracing::debug!(
            blocks = blocks.len(),
            rows = row_count,
            sources = source_names.len(),
            "sampling process assembled"
        );
        Ok(Self {
            blocks,
            source_names,
            source_types,
            row_offsets,
            row_count,
        })
    }

    pub fn blocks(&self) -> &[SamplingBlock] {
        &self.blocks
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn source_names(&self) -> &[String] {
        &self.source_names
    }

    pub fn source_types(&self) -> &[DataType] {
        &self.source_types
    }

    pub fn data_type_of(&self, source: &str) -> Option<DataType> {
        self.source_names
            .iter()
            .position(|name| name == source)
            .map(|i| self.source_types[i])
    }

    /// Starting table row of each block, for row -> page translation.
    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    /// `[start, end]` envelope over all blocks; `None` when empty.
    pub fn range(&self) -> Option<(Nanos, Nanos)> {
        let first = self.blocks.first()?;
        let last = self.blocks.last()?;
        Some((first.start(), last.end()))
    }

    /// Translates a table row into `(block index, row within block)`.
    pub fn locate_row(&self, row: usize) -> Option<(usize, usize)> {
        if row >= self.row_count {
            return None;
        }
        let block = self.row_offsets.partition_point(|&offset| offset <= row) - 1;
        Some((block, row - self.row_offsets[block]))
    }

    pub fn timestamp(&self, row: usize) -> Option<Nanos> {
        let (block, offset) = self.locate_row(row)?;
        self.blocks[block].timestamp(offset)
    }

    pub fn timestamps(&self) -> Vec<Nanos> {
        let mut out = Vec::with_capacity(self.row_count);
        for block in &self.blocks {
            out.extend(block.timestamps());
        }
        out
    }

    pub fn byte_size(&self) -> u64 {
        self.blocks.iter().map(SamplingBlock::byte_size).sum()
    }
}
