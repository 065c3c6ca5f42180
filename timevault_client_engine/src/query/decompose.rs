// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

//! Request decomposition across the `(sources x time)` domain.
//!
//! One logical request becomes a list of sub-requests whose rectangles
//! union to exactly the original domain, so that the recovery engine can
//! open one stream per piece. The strategies are tried in a fixed order
//! and the first that produces an acceptable piece count wins; the final
//! fallback always succeeds, so the result is never empty.

use crate::config::EngineConfig;
use crate::query::{Nanos, QueryRequest};

/// The knobs the decomposer works under, extracted from configuration.
/// Request-level [`DecomposeHint`](crate::query::DecomposeHint)s override
/// the two per-axis caps.
#[derive(Clone, Copy, Debug)]
pub struct DecomposeLimits {
    /// Most sources one sub-request may carry (horizontal-axis cap).
    pub max_sources: usize,

    /// Longest span one sub-request may cover (vertical-axis cap).
    pub max_duration_nanos: Nanos,

    /// The multi-stream cap `S`: never more pieces than this.
    pub max_streams: usize,

    /// Domain size below which decomposition is suppressed entirely.
    pub pivot_size: u64,
}

impl DecomposeLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_sources: config.decompose.max_sources.max(1),
            max_duration_nanos: config.decompose.max_duration_nanos.max(1),
            max_streams: config.stream.concurrency.max_streams.max(1),
            pivot_size: config.stream.concurrency.pivot_size,
        }
    }
}

/// Splits one logical request into an ordered list of sub-requests.
///
/// The list is never empty: when no strategy applies, the original request
/// comes back as the sole element. Earlier time ranges come first, and
/// within one time slice the lexicographically earlier source group comes
/// first, so the output is stable across runs.
pub fn decompose(request: &QueryRequest, limits: &DecomposeLimits) -> Vec<QueryRequest> {
    let streams = limits.max_streams;
    if streams <= 1 || request.domain_size() < limits.pivot_size {
        tracing::debug!(
            domain_size = request.domain_size(),
            pivot_size = limits.pivot_size,
            "domain below pivot, no decomposition"
        );
        return vec![request.clone()];
    }

    let mut sources = request.sources.clone();
    sources.sort_unstable();

    // Preferred: the configured (or hinted) per-axis caps.
    let source_cap = request
        .hint
        .and_then(|h| h.max_sources)
        .unwrap_or(limits.max_sources)
        .max(1);
    let duration_cap = request
        .hint
        .and_then(|h| h.max_duration_nanos)
        .unwrap_or(limits.max_duration_nanos)
        .max(1);
    let source_groups = sources.len().div_ceil(source_cap);
    let time_slices = (request.range.duration().max(1) as u64).div_ceil(duration_cap as u64) as usize;
    let total = source_groups * time_slices;
    if (2..=streams).contains(&total) {
        tracing::debug!(source_groups, time_slices, "using preferred decomposition");
        return build_grid(request, &sources, source_groups, time_slices);
    }

    // Horizontal: one source group per stream over the full range.
    if sources.len() >= streams {
        tracing::debug!(groups = streams, "using horizontal decomposition");
        return build_grid(request, &sources, streams, 1);
    }

    // Grid: an approximately square partition of S tiles. The natural tile
    // count can round up past S; that case falls through to vertical.
    if sources.len() > streams / 2 {
        let side = (streams as f64).sqrt().round() as usize;
        let source_groups = side.clamp(1, sources.len());
        let time_slices = streams.div_ceil(source_groups);
        if source_groups * time_slices <= streams {
            tracing::debug!(source_groups, time_slices, "using grid decomposition");
            return build_grid(request, &sources, source_groups, time_slices);
        }
    }

    // Vertical fallback: S time slices over the full source set.
    tracing::debug!(slices = streams, "using vertical decomposition");
    build_grid(request, &sources, 1, streams)
}

/// Materializes a `source_groups x time_slices` grid of sub-requests,
/// time-major, each inheriting the parent's stream kind.
fn build_grid(
    request: &QueryRequest,
    sorted_sources: &[String],
    source_groups: usize,
    time_slices: usize,
) -> Vec<QueryRequest> {
    let groups = chunk_even(sorted_sources, source_groups);
    let slices = request.range.split_even(time_slices);
    let mut pieces = Vec::with_capacity(groups.len() * slices.len());
    for slice in &slices {
        for group in &groups {
            pieces.push(QueryRequest {
                range: *slice,
                sources: group.clone(),
                stream_kind: request.stream_kind,
                hint: None,
            });
        }
    }
    pieces
}

/// Splits `items` into `groups` near-equal runs, earlier items first.
fn chunk_even(items: &[String], groups: usize) -> Vec<Vec<String>> {
    let groups = groups.clamp(1, items.len().max(1));
    let base = items.len() / groups;
    let remainder = items.len() % groups;
    let mut chunks = Vec::with_capacity(groups);
    let mut offset = 0;
    for i in 0..groups {
        let len = base + usize::from(i < remainder);
        chunks.push(items[offset..offset + len].to_vec());
        offset += len;
    }
    chunks
}
