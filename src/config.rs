//! CLI argument parsing helpers shared by the two binaries

use crate::analysis::AnalysisConfig;
use crate::constants::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use crate::csvlog;
use anyhow::{bail, Result};
use log::LevelFilter;
use std::path::{Path, PathBuf};

/// Statistics collection parameters as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSpec {
    pub buffer_size: usize,
    pub bin_width_us: u32,
    pub max_bins: u32,
}

impl Default for StatsSpec {
    fn default() -> Self {
        let defaults = AnalysisConfig::default();
        Self {
            buffer_size: defaults.buffer_size,
            bin_width_us: defaults.bin_width_us,
            max_bins: defaults.max_bins,
        }
    }
}

impl From<StatsSpec> for AnalysisConfig {
    fn from(spec: StatsSpec) -> Self {
        Self {
            buffer_size: spec.buffer_size,
            bin_width_us: spec.bin_width_us,
            max_bins: spec.max_bins,
        }
    }
}

/// Parse the `--stats` sub-format: `[count][K|M][,bw=<us>][,bn=<bins>]`.
///
/// The leading count takes an optional K or M suffix; `bw=` sets the
/// histogram bin width in microseconds and `bn=` the bin count. Any
/// part may be omitted, so `500K`, `bw=10` and `2M,bw=5,bn=200` are
/// all valid.
pub fn parse_stats_spec(input: &str) -> Result<StatsSpec> {
    let mut spec = StatsSpec::default();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(value) = part.strip_prefix("bw=") {
            spec.bin_width_us = value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid bin width '{value}'"))?;
            if !(1..=1000).contains(&spec.bin_width_us) {
                bail!("Bin width must be 1..=1000 microseconds, got {}", spec.bin_width_us);
            }
        } else if let Some(value) = part.strip_prefix("bn=") {
            spec.max_bins = value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid bin count '{value}'"))?;
            if !(10..=10_000).contains(&spec.max_bins) {
                bail!("Bin count must be 10..=10000, got {}", spec.max_bins);
            }
        } else {
            let (digits, multiplier) = match part.as_bytes().last() {
                Some(b'K') | Some(b'k') => (&part[..part.len() - 1], 1_000usize),
                Some(b'M') | Some(b'm') => (&part[..part.len() - 1], 1_000_000usize),
                _ => (part, 1),
            };
            let count: usize = digits
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid statistics buffer size '{part}'"))?;
            spec.buffer_size = count * multiplier;
            if !(10_000..=10_000_000).contains(&spec.buffer_size) {
                bail!(
                    "Statistics buffer size must be 10K..=10M entries, got {}",
                    spec.buffer_size
                );
            }
        }
    }
    Ok(spec)
}

/// Resolve a log level name; `env_logger` handles the rest.
pub fn parse_log_level(input: &str) -> Result<LevelFilter> {
    match input.to_ascii_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warn" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        other => bail!("Unknown log level '{other}'"),
    }
}

/// Validate a comma-separated per-component log filter in the
/// `env_logger` directive syntax (`target[=level],..`). Levels are
/// checked eagerly so a typo fails at startup instead of being
/// silently ignored by the logger.
pub fn parse_log_filter(input: &str) -> Result<String> {
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("Empty component in log filter '{input}'");
        }
        if let Some((target, level)) = part.split_once('=') {
            if target.is_empty() {
                bail!("Empty target in log filter component '{part}'");
            }
            parse_log_level(level)?;
        }
    }
    Ok(input.to_string())
}

/// Validated packet size for the client transmit path.
pub fn validate_packet_size(size: usize) -> Result<usize> {
    if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        bail!(
            "Packet size must be {}..={} bytes, got {size}",
            MIN_PACKET_SIZE,
            MAX_PACKET_SIZE
        );
    }
    Ok(size)
}

/// CSV output paths: the main per-packet log plus the derived kernel
/// TX timestamp log next to it.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    pub main: PathBuf,
    pub tx: PathBuf,
}

impl CsvOptions {
    pub fn new<P: AsRef<Path>>(main: P) -> Self {
        let main = main.as_ref().to_path_buf();
        let tx = csvlog::tx_log_path(&main);
        Self { main, tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_spec_defaults() {
        let spec = parse_stats_spec("").unwrap();
        assert_eq!(spec, StatsSpec::default());
        assert_eq!(spec.buffer_size, 1_000_000);
        assert_eq!(spec.bin_width_us, 1);
        assert_eq!(spec.max_bins, 1000);
    }

    #[test]
    fn stats_spec_count_suffixes() {
        assert_eq!(parse_stats_spec("500K").unwrap().buffer_size, 500_000);
        assert_eq!(parse_stats_spec("2M").unwrap().buffer_size, 2_000_000);
        assert_eq!(parse_stats_spec("50000").unwrap().buffer_size, 50_000);
    }

    #[test]
    fn stats_spec_full_form() {
        let spec = parse_stats_spec("2M,bw=5,bn=200").unwrap();
        assert_eq!(spec.buffer_size, 2_000_000);
        assert_eq!(spec.bin_width_us, 5);
        assert_eq!(spec.max_bins, 200);
    }

    #[test]
    fn stats_spec_partial_forms() {
        let spec = parse_stats_spec("bw=10").unwrap();
        assert_eq!(spec.buffer_size, 1_000_000);
        assert_eq!(spec.bin_width_us, 10);
        let spec = parse_stats_spec("bn=50").unwrap();
        assert_eq!(spec.max_bins, 50);
    }

    #[test]
    fn stats_spec_rejects_out_of_range() {
        assert!(parse_stats_spec("5K").is_err());
        assert!(parse_stats_spec("11M").is_err());
        assert!(parse_stats_spec("bw=0").is_err());
        assert!(parse_stats_spec("bw=2000").is_err());
        assert!(parse_stats_spec("bn=5").is_err());
        assert!(parse_stats_spec("bn=20000").is_err());
        assert!(parse_stats_spec("abc").is_err());
    }

    #[test]
    fn packet_size_bounds() {
        assert!(validate_packet_size(11).is_err());
        assert_eq!(validate_packet_size(12).unwrap(), 12);
        assert_eq!(validate_packet_size(1500).unwrap(), 1500);
        assert!(validate_packet_size(1501).is_err());
    }

    #[test]
    fn tx_path_sits_next_to_main() {
        let opts = CsvOptions::new("/tmp/run/client.csv");
        assert_eq!(opts.tx, PathBuf::from("/tmp/run/client_tx.csv"));
    }

    #[test]
    fn log_levels_parse() {
        assert_eq!(parse_log_level("info").unwrap(), LevelFilter::Info);
        assert_eq!(parse_log_level("DEBUG").unwrap(), LevelFilter::Debug);
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn log_filter_components() {
        let filter = "udp_timestamp_probe::csvlog=debug,udp_timestamp_probe::net=warn";
        assert_eq!(parse_log_filter(filter).unwrap(), filter);
        assert_eq!(parse_log_filter("csvlog").unwrap(), "csvlog");
        assert!(parse_log_filter("csvlog=loud").is_err());
        assert!(parse_log_filter("=debug").is_err());
        assert!(parse_log_filter("csvlog=debug,,net=warn").is_err());
    }
}
