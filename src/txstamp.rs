//! Asynchronous kernel TX timestamp collection
//!
//! Kernel transmit timestamps arrive on the socket error queue some
//! time after the send call returns. A dedicated collector thread
//! polls the queue, matches each timestamp back to its packet by the
//! echoed sequence number, and fills the corresponding stats slot and
//! TX CSV row. The thread performs a final drain on shutdown so
//! late-arriving timestamps for already-sent packets are not lost.

use crate::constants::{TX_HEALTH_CHECK_INTERVAL, TX_POLL_INTERVAL_US, TX_TIMESTAMP_BATCH_SIZE};
use crate::correlation::RxCorrelation;
use crate::csvlog::{CsvEntry, CsvSink};
use crate::net::{self, TxRecord};
use crate::runtime;
use crate::stats::StatsCollector;
use anyhow::{Context, Result};
use log::warn;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Handle for the TX timestamp collector thread.
pub struct TxCollector {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

/// What the collector writes per timestamp.
struct CollectorSinks {
    stats: Option<Arc<StatsCollector>>,
    tx_csv: Option<CsvSink>,
    /// Server side: recover the original sender's identity for the
    /// CSV row. Client side leaves this unset and logs its own
    /// local address.
    rx_corr: Option<Arc<RxCorrelation>>,
    local: SocketAddrV4,
    ker_slot: usize,
}

impl TxCollector {
    /// Spawn the collector on `cpu`, draining `fd`'s error queue.
    /// `ker_slot` is the stats slot the kernel TX timestamp lands in.
    pub fn start(
        fd: RawFd,
        stats: Option<Arc<StatsCollector>>,
        tx_csv: Option<CsvSink>,
        rx_corr: Option<Arc<RxCorrelation>>,
        local: SocketAddrV4,
        ker_slot: usize,
        cpu: Option<usize>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let sinks = CollectorSinks {
            stats,
            tx_csv,
            rx_corr,
            local,
            ker_slot,
        };
        let handle = thread::Builder::new()
            .name("tx-collector".into())
            .spawn(move || collector_loop(fd, sinks, cpu, thread_running))
            .context("Failed to spawn TX timestamp collector thread")?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop after a final drain of the error queue. Returns the number
    /// of kernel TX timestamps collected.
    pub fn stop(mut self) -> u64 {
        self.running.store(false, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("TX timestamp collector thread panicked");
                0
            }),
            None => 0,
        }
    }
}

fn collector_loop(
    fd: RawFd,
    sinks: CollectorSinks,
    cpu: Option<usize>,
    running: Arc<AtomicBool>,
) -> u64 {
    runtime::enter_hot_thread(cpu);
    let mut records: Vec<TxRecord> = Vec::with_capacity(TX_TIMESTAMP_BATCH_SIZE);
    let mut collected = 0u64;
    let mut polls = 0u64;

    while running.load(Ordering::Acquire) {
        records.clear();
        let drained = net::drain_errqueue(fd, &mut records, TX_TIMESTAMP_BATCH_SIZE);
        collected += record_batch(&records, &sinks);
        polls += 1;
        if polls % TX_HEALTH_CHECK_INTERVAL == 0 && net::errqueue_overflowed(fd) {
            warn!("Socket error queue overflowed; some kernel TX timestamps were lost");
        }
        if drained == 0 {
            thread::sleep(Duration::from_micros(TX_POLL_INTERVAL_US));
        }
    }

    // Final drain: timestamps for the last sends are still in flight
    // when shutdown is requested.
    loop {
        records.clear();
        if net::drain_errqueue(fd, &mut records, TX_TIMESTAMP_BATCH_SIZE) == 0 {
            break;
        }
        collected += record_batch(&records, &sinks);
    }
    collected
}

fn record_batch(records: &[TxRecord], sinks: &CollectorSinks) -> u64 {
    let mut recorded = 0u64;
    for record in records {
        if record.ker_tx_ns == 0 {
            continue;
        }
        let seq = record.payload_seq.unwrap_or(record.kernel_seq);
        if let Some(stats) = sinks.stats.as_deref() {
            stats.update_slot(seq, sinks.ker_slot, record.ker_tx_ns);
        }
        if let Some(csv) = sinks.tx_csv.as_ref() {
            let mut entry = CsvEntry::default();
            entry.seq = seq;
            entry.ts[sinks.ker_slot] = record.ker_tx_ns;
            match sinks.rx_corr.as_deref().and_then(|c| c.load(seq)) {
                Some(rx) => {
                    entry.src_ip = rx.peer_ip;
                    entry.src_port = rx.peer_port;
                }
                None => {
                    entry.src_ip = *sinks.local.ip();
                    entry.src_port = sinks.local.port();
                }
            }
            csv.push(&entry);
        }
        recorded += 1;
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{StatsEntry, TS_CLT_KER_TX};
    use std::net::Ipv4Addr;

    fn sinks(stats: Arc<StatsCollector>) -> CollectorSinks {
        CollectorSinks {
            stats: Some(stats),
            tx_csv: None,
            rx_corr: None,
            local: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4791),
            ker_slot: TS_CLT_KER_TX,
        }
    }

    #[test]
    fn payload_sequence_wins_over_kernel_counter() {
        let stats = Arc::new(StatsCollector::new(8).unwrap());
        stats.push(&StatsEntry::minimal(7, Ipv4Addr::LOCALHOST, 4791, 0x7F));
        let records = [TxRecord {
            payload_seq: Some(7),
            kernel_seq: 3,
            ker_tx_ns: 1_000_000_123,
        }];
        assert_eq!(record_batch(&records, &sinks(Arc::clone(&stats))), 1);
        stats.for_each(|e| assert_eq!(e.ts[TS_CLT_KER_TX], 1_000_000_123));
    }

    #[test]
    fn kernel_counter_is_the_fallback() {
        let stats = Arc::new(StatsCollector::new(8).unwrap());
        stats.push(&StatsEntry::minimal(3, Ipv4Addr::LOCALHOST, 4791, 0x7F));
        let records = [TxRecord {
            payload_seq: None,
            kernel_seq: 3,
            ker_tx_ns: 555,
        }];
        assert_eq!(record_batch(&records, &sinks(Arc::clone(&stats))), 1);
        stats.for_each(|e| assert_eq!(e.ts[TS_CLT_KER_TX], 555));
    }

    #[test]
    fn zero_timestamps_are_skipped() {
        let stats = Arc::new(StatsCollector::new(8).unwrap());
        stats.push(&StatsEntry::minimal(1, Ipv4Addr::LOCALHOST, 4791, 0x7F));
        let records = [TxRecord {
            payload_seq: Some(1),
            kernel_seq: 0,
            ker_tx_ns: 0,
        }];
        assert_eq!(record_batch(&records, &sinks(stats)), 0);
    }
}
