//! UDP Timestamp Probe Library
//!
//! Provides the shared engine for the `timestamp-client` and
//! `timestamp-server` binaries: cycle-accurate timing, socket
//! timestamping, lock-free correlation/statistics/logging buffers,
//! and the post-run delta analysis.

pub mod analysis;
pub mod client;
pub mod config;
pub mod constants;
pub mod correlation;
pub mod csvlog;
pub mod net;
pub mod rate;
pub mod reply;
pub mod runtime;
pub mod server;
pub mod stats;
pub mod tsc;
pub mod txstamp;

pub use analysis::{AnalysisConfig, RunMode};
pub use config::{CsvOptions, StatsSpec};
pub use stats::{RunContext, StatsCollector, StatsEntry};
