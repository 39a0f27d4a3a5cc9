//! Cycle-counter timing primitives
//!
//! Reads the CPU timestamp counter, calibrates its frequency against
//! the wall clock, converts captured cycle counts to wall-clock
//! nanoseconds, and busy-waits with cycle accuracy. Cycle-based
//! timestamps are only used when the platform reports an invariant
//! counter; otherwise they stay zero and downstream consumers treat
//! them as absent.

use crate::constants::MAX_ITERATION_CHECK_INTERVAL;
use std::time::{Duration, Instant};

/// Read the timestamp counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Read the timestamp counter with serialization (RDTSCP), so the
/// reading is not reordered before preceding instructions.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtscp() -> u64 {
    let mut aux: u32 = 0;
    unsafe { core::arch::x86_64::__rdtscp(&mut aux) }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    0
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtscp() -> u64 {
    0
}

/// Whether the CPU advertises an invariant (constant-rate, monotonic)
/// timestamp counter via CPUID leaf 0x8000_0007.
#[cfg(target_arch = "x86_64")]
pub fn has_invariant_tsc() -> bool {
    let max_ext = unsafe { core::arch::x86_64::__cpuid(0x8000_0000) }.eax;
    if max_ext < 0x8000_0007 {
        return false;
    }
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x8000_0007) };
    leaf.edx & (1 << 8) != 0
}

#[cfg(not(target_arch = "x86_64"))]
pub fn has_invariant_tsc() -> bool {
    false
}

/// Serialized counter read, gated on counter trustworthiness: returns
/// 0 (absent) when the platform lacks an invariant counter, so the
/// reading never enters a timestamp slot.
#[inline(always)]
pub fn capture_cycles(reliable: bool) -> u64 {
    if reliable {
        rdtscp()
    } else {
        0
    }
}

/// Current wall-clock time as nanoseconds since the Unix epoch.
#[inline]
pub fn wall_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Measure the cycle-counter frequency in GHz by counting cycles
/// across a known wall-clock sleep.
pub fn calibrate_cpu_freq() -> f64 {
    let start_cycles = rdtscp();
    let start = Instant::now();

    std::thread::sleep(Duration::from_millis(100));

    let end_cycles = rdtscp();
    let elapsed_ns = start.elapsed().as_nanos() as f64;

    (end_cycles.wrapping_sub(start_cycles)) as f64 / elapsed_ns
}

/// Converts captured cycle counts to wall-clock nanoseconds by
/// offsetting from a reference (wall clock, cycle count) pair sampled
/// at construction.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    freq_ghz: f64,
    ref_wall_ns: u64,
    ref_tsc: u64,
}

impl TscClock {
    /// Sample a reference pair for the given calibrated frequency.
    pub fn new(freq_ghz: f64) -> Self {
        let ref_tsc = rdtscp();
        let ref_wall_ns = wall_clock_ns();
        Self {
            freq_ghz,
            ref_wall_ns,
            ref_tsc,
        }
    }

    /// Calibrated frequency in GHz.
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    /// Convert a captured cycle count to wall-clock nanoseconds.
    /// Returns 0 for a zero (absent) cycle count.
    pub fn to_wall_ns(&self, tsc: u64) -> u64 {
        if tsc == 0 || self.freq_ghz <= 0.0 {
            return 0;
        }
        if tsc >= self.ref_tsc {
            let delta_ns = (tsc - self.ref_tsc) as f64 / self.freq_ghz;
            self.ref_wall_ns + delta_ns as u64
        } else {
            let delta_ns = (self.ref_tsc - tsc) as f64 / self.freq_ghz;
            self.ref_wall_ns.saturating_sub(delta_ns as u64)
        }
    }

    /// Cycles corresponding to the given nanosecond interval.
    pub fn cycles_for_ns(&self, ns: f64) -> u64 {
        (ns * self.freq_ghz) as u64
    }
}

/// Spin until the counter reaches `target_tsc`, yielding a CPU hint
/// per iteration to keep the pipeline cool.
#[inline]
pub fn wait_until_cycle(target_tsc: u64) {
    while rdtsc() < target_tsc {
        std::hint::spin_loop();
    }
}

/// Bounded check cadence for hot loops: a control check is due after a
/// fixed iteration count or after `check_cycles` elapsed cycles,
/// whichever comes first. A zero threshold (no calibrated counter)
/// makes every iteration due.
pub struct CheckPacer {
    check_cycles: u64,
    iterations: u32,
    last_check: u64,
}

impl CheckPacer {
    pub fn new(check_cycles: u64, now_tsc: u64) -> Self {
        Self {
            check_cycles,
            iterations: 0,
            last_check: now_tsc,
        }
    }

    /// Account one iteration; true when the loop should run its
    /// shutdown/duration/rate checks.
    #[inline]
    pub fn due(&mut self, now_tsc: u64) -> bool {
        self.iterations += 1;
        if self.iterations >= MAX_ITERATION_CHECK_INTERVAL
            || now_tsc.wrapping_sub(self.last_check) >= self.check_cycles
        {
            self.iterations = 0;
            self.last_check = now_tsc;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_advances() {
        if !has_invariant_tsc() {
            return;
        }
        let t1 = rdtscp();
        std::thread::sleep(Duration::from_micros(100));
        let t2 = rdtscp();
        assert!(t2 > t1);
    }

    #[test]
    fn calibration_is_plausible() {
        if !has_invariant_tsc() {
            return;
        }
        let ghz = calibrate_cpu_freq();
        // Any machine this runs on sits well inside 0.5..8 GHz.
        assert!(ghz > 0.5 && ghz < 8.0, "calibrated {ghz} GHz");
    }

    #[test]
    fn conversion_tracks_wall_clock() {
        if !has_invariant_tsc() {
            return;
        }
        let clock = TscClock::new(calibrate_cpu_freq());
        let tsc = rdtscp();
        let wall = wall_clock_ns();
        let converted = clock.to_wall_ns(tsc);
        let diff = converted.abs_diff(wall);
        // Within a millisecond of the direct reading.
        assert!(diff < 1_000_000, "conversion off by {diff} ns");
    }

    #[test]
    fn zero_cycles_are_absent() {
        let clock = TscClock::new(1.0);
        assert_eq!(clock.to_wall_ns(0), 0);
    }

    #[test]
    fn unreliable_counter_reads_as_absent() {
        assert_eq!(capture_cycles(false), 0);
        let clock = TscClock::new(1.0);
        assert_eq!(clock.to_wall_ns(capture_cycles(false)), 0);
        if has_invariant_tsc() {
            assert!(capture_cycles(true) > 0);
        }
    }

    #[test]
    fn pacer_fires_on_iteration_budget() {
        let mut pacer = CheckPacer::new(u64::MAX, 0);
        for _ in 0..MAX_ITERATION_CHECK_INTERVAL - 1 {
            assert!(!pacer.due(0));
        }
        assert!(pacer.due(0));
        // Counter resets after firing.
        assert!(!pacer.due(0));
    }

    #[test]
    fn pacer_fires_on_elapsed_cycles() {
        let mut pacer = CheckPacer::new(100, 0);
        assert!(!pacer.due(50));
        assert!(pacer.due(150));
        assert!(!pacer.due(200));
        assert!(pacer.due(300));
    }

    #[test]
    fn uncalibrated_pacer_fires_every_iteration() {
        let mut pacer = CheckPacer::new(0, 0);
        assert!(pacer.due(0));
        assert!(pacer.due(0));
    }
}
