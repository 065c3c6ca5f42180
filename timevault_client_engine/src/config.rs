// Copyright (c) the TimeVault project authors.
// Licensed under the MIT License.

//! Recognized configuration keys and their effects.
//!
//! Every key has a default, so an empty document (or no document at all) is
//! a valid configuration. The loaded value is passed explicitly into
//! [`QueryService::new`](crate::query::QueryService::new) and never mutated
//! afterwards.

use serde::Deserialize;
use std::time::Duration;

use crate::query::{Nanos, StreamKind};
use crate::ErrorKind;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub stream: StreamSection,
    pub decompose: DecomposeSection,
    pub correlate: CorrelateSection,
    pub timeout: TimeoutSection,
    pub table: TableSection,
    pub logging: LoggingSection,
    pub connection: ConnectionConfig,
}

impl EngineConfig {
    /// Deserializes a configuration document from JSON. Missing keys take
    /// their defaults; unrecognized keys are ignored.
    pub fn from_json_slice(bytes: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| ErrorKind::InvalidConfig.with_source(e))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// Gates all streaming paths. When off, `query_data` degrades to the
    /// unary round-trip.
    pub active: bool,

    /// Default stream kind for requests that do not specify one.
    #[serde(rename = "type")]
    pub kind: StreamKind,

    pub buffer: BufferSection,
    pub binning: BinningSection,
    pub concurrency: ConcurrencySection,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            active: true,
            kind: StreamKind::ServerStream,
            buffer: BufferSection::default(),
            binning: BinningSection::default(),
            concurrency: ConcurrencySection::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    /// Bounded buffer capacity in records. `0` means unbounded.
    pub size: usize,

    /// Whether `push` blocks when the buffer is full. With backpressure off
    /// a full bounded buffer fails the push instead.
    pub backpressure: bool,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            size: 4096,
            backpressure: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BinningSection {
    /// Maximum wire bytes per record. Informational; forwarded to the
    /// server so it can size its record bins.
    pub max_size: u64,
}

impl Default for BinningSection {
    fn default() -> Self {
        Self {
            max_size: 4_000_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConcurrencySection {
    /// Enables multi-stream recovery.
    pub active: bool,

    /// Domain size (`sources x seconds`) below which multi-streaming is
    /// suppressed and the request is recovered over a single stream.
    pub pivot_size: u64,

    /// The multi-stream cap `S`.
    pub max_streams: usize,
}

impl Default for ConcurrencySection {
    fn default() -> Self {
        Self {
            active: true,
            pivot_size: 10_000,
            max_streams: 4,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DecomposeSection {
    /// Horizontal-axis cap: most sources one sub-request may carry.
    pub max_sources: usize,

    /// Vertical-axis cap: longest time span one sub-request may cover.
    pub max_duration_nanos: Nanos,
}

impl Default for DecomposeSection {
    fn default() -> Self {
        Self {
            max_sources: 8,
            max_duration_nanos: 60_000_000_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CorrelateSection {
    /// Enables the parallel correlator workers.
    pub concurrent: bool,

    /// Runs the correlator concurrently with streaming instead of after the
    /// recovery engine returns.
    pub mid_stream: bool,
}

impl Default for CorrelateSection {
    fn default() -> Self {
        Self {
            concurrent: true,
            mid_stream: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Millis,
    Seconds,
    Minutes,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub active: bool,
    pub limit: u64,
    pub unit: TimeUnit,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            active: true,
            limit: 60,
            unit: TimeUnit::Seconds,
        }
    }
}

impl TimeoutSection {
    /// The per-request deadline, or `None` when timeouts are disabled.
    pub fn duration(&self) -> Option<Duration> {
        if !self.active {
            return None;
        }
        Some(match self.unit {
            TimeUnit::Millis => Duration::from_millis(self.limit),
            TimeUnit::Seconds => Duration::from_secs(self.limit),
            TimeUnit::Minutes => Duration::from_secs(self.limit * 60),
        })
    }
}

/// Which table variant `query_data*` should produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableMode {
    /// Static when the result fits the configured limit, dynamic otherwise.
    #[default]
    Auto,
    /// Always static; oversized results fail with `TableTooLarge`.
    Static,
    /// Always dynamic.
    Dynamic,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TableSection {
    pub mode: TableMode,

    #[serde(rename = "static")]
    pub static_table: StaticTableSection,

    pub dynamic: DynamicTableSection,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StaticTableSection {
    /// In `auto` mode, prefer the static variant when the result fits.
    pub is_default: bool,

    /// Whether the size limit applies at all.
    pub max_size_enabled: bool,

    /// Largest measured result, in bytes, a static table may materialize.
    pub max_size_bytes: u64,
}

impl Default for StaticTableSection {
    fn default() -> Self {
        Self {
            is_default: true,
            max_size_enabled: true,
            max_size_bytes: 1 << 30,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DynamicTableSection {
    /// Allows the dynamic fallback in `auto` mode.
    pub enabled: bool,
}

impl Default for DynamicTableSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub enabled: bool,
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
        }
    }
}

/// Connection parameters handed to whatever builds the transport. The
/// engine itself never opens sockets.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive_secs: u64,
    pub max_message_bytes: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 50051,
            tls: false,
            keep_alive_secs: 30,
            max_message_bytes: 16_777_216,
        }
    }
}
