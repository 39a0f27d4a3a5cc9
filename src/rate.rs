//! Once-per-second send/receive rate reporting
//!
//! A background timer thread samples a packet counter once per second
//! and publishes the per-second rate through an atomic flag that the
//! hot loop picks up at its next bounded check, so the hot loop never
//! formats or prints anything off-cadence.

use anyhow::{Context, Result};
use log::warn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Latest rate sample, published by the timer thread and consumed by
/// the hot loop.
#[derive(Default)]
pub struct RateState {
    ready: AtomicBool,
    pps: AtomicU64,
}

impl RateState {
    /// Take the pending rate sample, if one has been published since
    /// the last call.
    pub fn take_ready(&self) -> Option<u64> {
        if self.ready.swap(false, Ordering::Acquire) {
            Some(self.pps.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    fn publish(&self, pps: u64) {
        self.pps.store(pps, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
    }
}

/// Handle for the rate timer thread.
pub struct RateReporter {
    state: Arc<RateState>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RateReporter {
    /// Spawn the timer thread. `counter` reads the cumulative packet
    /// count; the thread publishes the difference between successive
    /// one-second samples.
    pub fn start(counter: Box<dyn Fn() -> u64 + Send>) -> Result<Self> {
        let state = Arc::new(RateState::default());
        let running = Arc::new(AtomicBool::new(true));
        let thread_state = Arc::clone(&state);
        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("rate-timer".into())
            .spawn(move || {
                let mut last_count = counter();
                let mut last_sample = Instant::now();
                while thread_running.load(Ordering::Acquire) {
                    // Sleep in short increments so shutdown is prompt.
                    thread::sleep(Duration::from_millis(100));
                    if last_sample.elapsed() < Duration::from_secs(1) {
                        continue;
                    }
                    let now = Instant::now();
                    let count = counter();
                    let elapsed = now.duration_since(last_sample).as_secs_f64();
                    if elapsed > 0.0 {
                        let pps = ((count - last_count) as f64 / elapsed).round() as u64;
                        thread_state.publish(pps);
                    }
                    last_count = count;
                    last_sample = now;
                }
            })
            .context("Failed to spawn rate timer thread")?;
        Ok(Self {
            state,
            running,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> Arc<RateState> {
        Arc::clone(&self.state)
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Rate timer thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_consumed_once() {
        let state = RateState::default();
        assert_eq!(state.take_ready(), None);
        state.publish(123_456);
        assert_eq!(state.take_ready(), Some(123_456));
        assert_eq!(state.take_ready(), None);
    }

    #[test]
    fn reporter_publishes_a_rate() {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let reporter = RateReporter::start(Box::new(move || counter.load(Ordering::Relaxed)))
            .expect("spawn reporter");
        let state = reporter.state();
        count.store(50_000, Ordering::Relaxed);
        let mut sample = None;
        for _ in 0..30 {
            thread::sleep(Duration::from_millis(100));
            if let Some(pps) = state.take_ready() {
                sample = Some(pps);
                break;
            }
        }
        reporter.stop();
        let pps = sample.expect("a rate sample within three seconds");
        assert!(pps > 0 && pps <= 50_000);
    }
}
