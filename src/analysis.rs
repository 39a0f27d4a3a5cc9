//! Post-run delta analysis
//!
//! Defines the catalog of named latency deltas, walks the statistics
//! window once after the run, and computes exact percentiles and a
//! fixed-width histogram per active delta. Results are printed and
//! optionally exported as a JSON summary.

use crate::constants::{DELTA_MIN_US, DELTA_OUTLIER_CEILING_US};
use crate::stats::StatsCollector;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Role/mode combination driving delta selection and slot masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    ClientOneWay,
    ClientRoundTrip,
    ServerOneWay,
    ServerRoundTrip,
}

impl RunMode {
    fn mode_bit(self) -> u8 {
        match self {
            RunMode::ClientOneWay => 0x01,
            RunMode::ClientRoundTrip => 0x02,
            RunMode::ServerOneWay => 0x04,
            RunMode::ServerRoundTrip => 0x08,
        }
    }

    /// Bitmask of timestamp slots expected for entries of this mode.
    pub fn timestamp_mask(self) -> u16 {
        match self {
            RunMode::ClientOneWay => 0x007,
            RunMode::ClientRoundTrip => 0x07F,
            RunMode::ServerOneWay => 0x380,
            RunMode::ServerRoundTrip => 0xF80,
        }
    }

    /// Catalog indices of the deltas this mode evaluates, in display
    /// order.
    pub fn active_deltas(self) -> &'static [usize] {
        match self {
            RunMode::ClientOneWay => &[0],
            RunMode::ClientRoundTrip => &[0, 1, 2, 5, 3, 4],
            RunMode::ServerOneWay => &[6, 7, 11],
            RunMode::ServerRoundTrip => &[6, 7, 8, 9, 11, 10],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RunMode::ClientOneWay => "client one-way",
            RunMode::ClientRoundTrip => "client round-trip",
            RunMode::ServerOneWay => "server one-way",
            RunMode::ServerRoundTrip => "server round-trip",
        }
    }
}

/// One named latency segment between two timestamp slots.
pub struct DeltaDef {
    pub label: &'static str,
    pub description: &'static str,
    pub src: usize,
    pub dst: usize,
    pub modes: u8,
}

/// Full delta catalog. Each mode activates an ordered subset.
pub const ALL_DELTAS: [DeltaDef; 12] = [
    DeltaDef {
        label: "D1: CAT (T1) -> CKT (T2)",
        description: "Client Application TX (T1) -> Client Kernel TX (T2)",
        src: 1,
        dst: 2,
        modes: 0x03,
    },
    DeltaDef {
        label: "D6: CHR (T8) -> CKR (T9)",
        description: "Client Hardware RX (T8) -> Client Kernel RX (T9)",
        src: 3,
        dst: 4,
        modes: 0x02,
    },
    DeltaDef {
        label: "D7: CKR (T9) -> CAR (T10)",
        description: "Client Kernel RX (T9) -> Client Application RX (T10)",
        src: 4,
        dst: 6,
        modes: 0x02,
    },
    DeltaDef {
        label: "RTT D2: CAT (T1) -> CAR (T10)",
        description: "Client Application TX (T1) -> Client Application RX (T10)",
        src: 1,
        dst: 6,
        modes: 0x02,
    },
    DeltaDef {
        label: "RTT D3: CATT (T1) -> CART (T10)",
        description: "Client Application TX TSC (T1) -> Client Application RX TSC (T10)",
        src: 0,
        dst: 5,
        modes: 0x02,
    },
    DeltaDef {
        label: "RTT D1: CAT (T1) -> CHR (T8)",
        description: "Client Application TX (T1) -> Client Hardware RX (T8)",
        src: 1,
        dst: 3,
        modes: 0x02,
    },
    DeltaDef {
        label: "D2: SHR (T3) -> SKR (T4)",
        description: "Server Hardware RX (T3) -> Server Kernel RX (T4)",
        src: 7,
        dst: 8,
        modes: 0x0C,
    },
    DeltaDef {
        label: "D3: SKR (T4) -> SAR (T5)",
        description: "Server Kernel RX (T4) -> Server Application RX (T5)",
        src: 8,
        dst: 9,
        modes: 0x0C,
    },
    DeltaDef {
        label: "D4: SAR (T5) -> SAT (T6)",
        description: "Server Application RX (T5) -> Server Application TX (T6)",
        src: 9,
        dst: 10,
        modes: 0x08,
    },
    DeltaDef {
        label: "D5: SAT (T6) -> SKT (T7)",
        description: "Server Application TX (T6) -> Server Kernel TX (T7)",
        src: 10,
        dst: 11,
        modes: 0x08,
    },
    DeltaDef {
        label: "TT D2: SHR (T3) -> SKT (T7)",
        description: "Server Hardware RX (T3) -> Server Kernel TX (T7)",
        src: 7,
        dst: 11,
        modes: 0x08,
    },
    DeltaDef {
        label: "TT D1: SHR (T3) -> SAR (T5)",
        description: "Server Hardware RX (T3) -> Server Application RX (T5)",
        src: 7,
        dst: 9,
        modes: 0x0C,
    },
];

/// Histogram/percentile sizing for the analysis pass.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisConfig {
    /// Statistics window capacity (entries).
    pub buffer_size: usize,
    /// Histogram bin width in microseconds.
    pub bin_width_us: u32,
    /// Histogram bin count; values past the last bin are outliers.
    pub max_bins: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1_000_000,
            bin_width_us: 1,
            max_bins: 1000,
        }
    }
}

/// Exact percentiles over one delta's samples.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Percentiles {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

/// Accumulated analysis for one delta.
pub struct DeltaReport {
    /// Index into [`ALL_DELTAS`].
    pub index: usize,
    /// Percentile samples; excludes values past the sanity ceiling.
    pub samples: Vec<f64>,
    pub histogram: Vec<u32>,
    pub outliers: u64,
    evaluated: u64,
}

impl DeltaReport {
    /// Evaluated sample count (histogram bins plus outliers).
    pub fn count(&self) -> u64 {
        self.evaluated
    }
}

/// Result of the post-run pass.
pub struct AnalysisResult {
    pub mode: RunMode,
    pub config: AnalysisConfig,
    pub deltas: Vec<DeltaReport>,
}

/// Compute exact percentiles by sorting and linearly interpolating
/// between order statistics.
pub fn exact_percentiles(samples: &mut [f64]) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let interpolate = |p: f64| -> f64 {
        let pos = p / 100.0 * (samples.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        if lo == hi {
            samples[lo]
        } else {
            samples[lo] + (samples[hi] - samples[lo]) * (pos - lo as f64)
        }
    };
    Percentiles {
        p25: interpolate(25.0),
        p50: interpolate(50.0),
        p75: interpolate(75.0),
        p90: interpolate(90.0),
        p95: interpolate(95.0),
    }
}

/// Walk the statistics window once and accumulate every delta active
/// for `mode`. A delta is evaluated only when both slots are
/// populated and the destination is strictly after the source;
/// magnitudes beyond the sanity ceiling or the histogram range count
/// as outliers.
pub fn analyze(stats: &StatsCollector, mode: RunMode, config: &AnalysisConfig) -> AnalysisResult {
    let mode_bit = mode.mode_bit();
    let mut deltas: Vec<DeltaReport> = mode
        .active_deltas()
        .iter()
        .map(|&index| DeltaReport {
            index,
            samples: Vec::new(),
            histogram: vec![0; config.max_bins as usize],
            outliers: 0,
            evaluated: 0,
        })
        .collect();

    stats.for_each(|entry| {
        for report in deltas.iter_mut() {
            let def = &ALL_DELTAS[report.index];
            if def.modes & mode_bit == 0 {
                continue;
            }
            let src = entry.ts[def.src];
            let dst = entry.ts[def.dst];
            if src == 0 || dst == 0 || dst <= src {
                continue;
            }
            let delta_us = (dst - src) as f64 / 1000.0;
            if delta_us < DELTA_MIN_US {
                continue;
            }
            report.evaluated += 1;
            // Past the sanity ceiling: counted as an outlier but kept
            // out of the percentile samples, which it would swamp.
            if delta_us > DELTA_OUTLIER_CEILING_US {
                report.outliers += 1;
                continue;
            }
            report.samples.push(delta_us);
            let bin = (delta_us / config.bin_width_us as f64) as usize;
            if bin >= report.histogram.len() {
                report.outliers += 1;
            } else {
                report.histogram[bin] += 1;
            }
        }
    });

    AnalysisResult {
        mode,
        config: *config,
        deltas,
    }
}

fn sample_stats(samples: &[f64]) -> (f64, f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    (min, mean, max)
}

/// Print the per-delta analysis followed by a key describing each
/// delta's endpoints.
pub fn display(result: &mut AnalysisResult) {
    info!("");
    info!("============================================");
    info!("        Latency Delta Analysis ({})", result.mode.label());
    info!("============================================");
    for report in result.deltas.iter_mut() {
        let def = &ALL_DELTAS[report.index];
        info!("");
        info!("  {}", def.label);
        if report.count() == 0 {
            info!("    no samples");
            continue;
        }
        let (min, mean, max) = sample_stats(&report.samples);
        let pct = exact_percentiles(&mut report.samples);
        info!(
            "    packets: {}   outliers: {}",
            report.count(),
            report.outliers
        );
        info!("    min/mean/max (us): {min:.3}/{mean:.3}/{max:.3}");
        info!(
            "    P25={:.3},P50={:.3},P75={:.3},P90={:.3},P95={:.3}",
            pct.p25, pct.p50, pct.p75, pct.p90, pct.p95
        );
        let mut bins = String::new();
        for (i, &count) in report.histogram.iter().enumerate() {
            if count > 0 {
                bins.push_str(&format!("{}:{} ", i + 1, count));
            }
        }
        if !bins.is_empty() {
            info!(
                "    histogram ({}us bins): {}",
                result.config.bin_width_us,
                bins.trim_end()
            );
        }
        if report.outliers > 0 {
            info!("    outliers:{}", report.outliers);
        }
    }
    info!("");
    info!("  Key:");
    for report in result.deltas.iter() {
        let def = &ALL_DELTAS[report.index];
        info!("    {} = {}", def.label, def.description);
    }
    info!("============================================");
}

/// Per-delta figures for the JSON summary.
#[derive(Serialize)]
pub struct DeltaSummary {
    pub label: String,
    pub description: String,
    pub packets: u64,
    pub outliers: u64,
    pub min_us: f64,
    pub mean_us: f64,
    pub max_us: f64,
    pub percentiles: Percentiles,
}

/// End-of-run summary for JSON export.
#[derive(Serialize)]
pub struct RunSummary {
    pub timestamp: String,
    pub mode: String,
    pub duration_seconds: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub deltas: Vec<DeltaSummary>,
}

impl RunSummary {
    pub fn build(
        result: &mut AnalysisResult,
        duration_seconds: u64,
        packets_sent: u64,
        packets_received: u64,
    ) -> Self {
        let deltas = result
            .deltas
            .iter_mut()
            .map(|report| {
                let def = &ALL_DELTAS[report.index];
                let (min, mean, max) = sample_stats(&report.samples);
                DeltaSummary {
                    label: def.label.to_string(),
                    description: def.description.to_string(),
                    packets: report.count(),
                    outliers: report.outliers,
                    min_us: min,
                    mean_us: mean,
                    max_us: max,
                    percentiles: exact_percentiles(&mut report.samples),
                }
            })
            .collect();
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            mode: result.mode.label().to_string(),
            duration_seconds,
            packets_sent,
            packets_received,
            deltas,
        }
    }
}

/// Write the run summary as pretty-printed JSON.
pub fn export_json(path: &Path, summary: &RunSummary) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    let mut file =
        File::create(path).with_context(|| format!("Failed to create output file: {path:?}"))?;
    file.write_all(json.as_bytes())
        .with_context(|| format!("Failed to write to output file: {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{StatsCollector, StatsEntry};
    use std::net::Ipv4Addr;

    fn push_entry(stats: &StatsCollector, seq: u32, slots: &[(usize, u64)]) {
        let mut entry = StatsEntry::minimal(seq, Ipv4Addr::LOCALHOST, 4791, 0x07F);
        for &(i, v) in slots {
            entry.ts[i] = v;
        }
        stats.push(&entry);
    }

    fn report_for<'a>(result: &'a mut AnalysisResult, index: usize) -> &'a mut DeltaReport {
        result
            .deltas
            .iter_mut()
            .find(|r| r.index == index)
            .expect("delta not active")
    }

    #[test]
    fn negative_deltas_are_excluded() {
        let stats = StatsCollector::new(16).unwrap();
        // Destination before source: must not be sampled.
        push_entry(&stats, 1, &[(1, 2_000_000), (6, 1_000_000)]);
        // Equal timestamps: also excluded.
        push_entry(&stats, 2, &[(1, 1_000_000), (6, 1_000_000)]);
        let mut result = analyze(&stats, RunMode::ClientRoundTrip, &AnalysisConfig::default());
        let report = report_for(&mut result, 3);
        assert_eq!(report.count(), 0);
        assert!(report.histogram.iter().all(|&c| c == 0));
    }

    #[test]
    fn bins_plus_outliers_equal_count() {
        let stats = StatsCollector::new(32).unwrap();
        let base = 100_000_000_000u64;
        // 3 in range, 1 past the histogram, 1 past the sanity ceiling.
        let offsets_ns = [1_500, 2_500, 3_500, 5_000_000, 2_000_000_000_000];
        for (i, &off) in offsets_ns.iter().enumerate() {
            push_entry(&stats, i as u32, &[(1, base), (6, base + off)]);
        }
        let config = AnalysisConfig {
            buffer_size: 32,
            bin_width_us: 1,
            max_bins: 100,
        };
        let mut result = analyze(&stats, RunMode::ClientRoundTrip, &config);
        let report = report_for(&mut result, 3);
        let binned: u64 = report.histogram.iter().map(|&c| u64::from(c)).sum();
        assert_eq!(binned + report.outliers, report.count());
        assert_eq!(report.count(), 5);
        assert_eq!(report.outliers, 2);
    }

    #[test]
    fn ceiling_outliers_stay_out_of_percentiles() {
        let stats = StatsCollector::new(16).unwrap();
        let base = 100_000_000_000u64;
        // Four 50 us round trips and one absurd reading past the
        // sanity ceiling.
        for i in 0u64..4 {
            push_entry(&stats, i as u32, &[(1, base + i), (6, base + i + 50_000)]);
        }
        push_entry(&stats, 4, &[(1, base), (6, base + 2_000_000_000_000)]);
        let mut result = analyze(&stats, RunMode::ClientRoundTrip, &AnalysisConfig::default());
        let report = report_for(&mut result, 3);
        assert_eq!(report.count(), 5);
        assert_eq!(report.outliers, 1);
        assert_eq!(report.samples.len(), 4);
        let pct = exact_percentiles(&mut report.samples);
        assert!((pct.p95 - 50.0).abs() < 1e-6, "p95 was {}", pct.p95);
    }

    #[test]
    fn percentiles_are_monotone() {
        let mut samples: Vec<f64> = (1..=97).map(|i| (i * 7 % 53) as f64).collect();
        let pct = exact_percentiles(&mut samples);
        assert!(pct.p25 <= pct.p50);
        assert!(pct.p50 <= pct.p75);
        assert!(pct.p75 <= pct.p90);
        assert!(pct.p90 <= pct.p95);
    }

    #[test]
    fn percentile_interpolation() {
        let mut samples = vec![1.0, 2.0, 3.0, 4.0];
        let pct = exact_percentiles(&mut samples);
        assert!((pct.p50 - 2.5).abs() < 1e-9);
    }

    #[test]
    fn fifty_microsecond_round_trip() {
        let stats = StatsCollector::new(16).unwrap();
        // Five packets sent at 100.000000000..100.000000004 seconds,
        // each received exactly 50 microseconds later.
        for i in 0u64..5 {
            let tx = 100_000_000_000 + i;
            let rx = tx + 50_000;
            push_entry(&stats, i as u32, &[(1, tx), (6, rx)]);
        }
        let mut result = analyze(&stats, RunMode::ClientRoundTrip, &AnalysisConfig::default());
        let report = report_for(&mut result, 3);
        assert_eq!(report.count(), 5);
        for &s in &report.samples {
            assert!((s - 50.0).abs() < 1e-9);
        }
        let pct = exact_percentiles(&mut report.samples);
        assert!((pct.p50 - 50.0).abs() < 1e-9);
    }

    #[test]
    fn active_delta_sets_match_modes() {
        for mode in [
            RunMode::ClientOneWay,
            RunMode::ClientRoundTrip,
            RunMode::ServerOneWay,
            RunMode::ServerRoundTrip,
        ] {
            for &index in mode.active_deltas() {
                assert!(ALL_DELTAS[index].modes & mode.mode_bit() != 0);
            }
        }
    }
}
