//! Per-packet statistics collection
//!
//! A lock-free ring buffer of per-packet timestamp records. The hot
//! loop appends entries as packets are sent or received; the receive
//! path and the kernel-timestamp collector then fill in timestamp
//! slots as their sources deliver, locating entries by a backward
//! scan from the newest record. The buffer is a rolling window: when
//! full, the oldest entry is evicted and counted, never blocking a
//! producer.

use anyhow::Context;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Timestamp slot indices within a record.
pub const TS_CLT_APP_TX_TSC: usize = 0;
pub const TS_CLT_APP_TX: usize = 1;
pub const TS_CLT_KER_TX: usize = 2;
pub const TS_CLT_HW_RX: usize = 3;
pub const TS_CLT_KER_RX: usize = 4;
pub const TS_CLT_APP_RX_TSC: usize = 5;
pub const TS_CLT_APP_RX: usize = 6;
pub const TS_SVR_HW_RX: usize = 7;
pub const TS_SVR_KER_RX: usize = 8;
pub const TS_SVR_APP_RX: usize = 9;
pub const TS_SVR_APP_TX: usize = 10;
pub const TS_SVR_KER_TX: usize = 11;

/// Number of timestamp slots per record.
pub const TS_SLOTS: usize = 12;

/// Allocate a zero-initialized slot array, reporting allocation
/// failure as an error instead of aborting. Slot types carry their
/// own cache-line alignment.
pub(crate) fn alloc_slots<T: Default>(len: usize) -> anyhow::Result<Box<[T]>> {
    let mut v: Vec<T> = Vec::new();
    v.try_reserve_exact(len)
        .with_context(|| format!("Failed to allocate {len} buffer slots"))?;
    v.extend((0..len).map(|_| T::default()));
    Ok(v.into_boxed_slice())
}

/// One per-packet record as seen by the analysis pass.
#[derive(Debug, Clone, Copy)]
pub struct StatsEntry {
    pub seq: u32,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    /// Bitmask of timestamp slots expected for this entry's mode.
    pub mask: u16,
    /// Nanosecond timestamps; 0 means absent.
    pub ts: [u64; TS_SLOTS],
}

impl StatsEntry {
    /// A record known only by its identity, timestamps to follow.
    pub fn minimal(seq: u32, src_ip: Ipv4Addr, src_port: u16, mask: u16) -> Self {
        Self {
            seq,
            src_ip,
            src_port,
            mask,
            ts: [0; TS_SLOTS],
        }
    }
}

#[repr(align(64))]
#[derive(Default)]
struct StatsSlot {
    seq: AtomicU64,
    src_ip: AtomicU64,
    src_port: AtomicU64,
    mask: AtomicU64,
    ts: [AtomicU64; TS_SLOTS],
}

/// Lock-free rolling window of statistics entries.
pub struct StatsCollector {
    slots: Box<[StatsSlot]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
    dropped: AtomicU64,
}

impl StatsCollector {
    /// Create a collector; `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> anyhow::Result<Self> {
        let capacity = capacity.max(2).next_power_of_two();
        Ok(Self {
            slots: alloc_slots(capacity)?,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries evicted because the window was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append a record. Single producer; evicts the oldest entry when
    /// the window is full.
    pub fn push(&self, entry: &StatsEntry) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if head - tail > self.mask {
            self.tail.store(tail + 1, Ordering::Release);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let slot = &self.slots[(head & self.mask) as usize];
        slot.seq.store(u64::from(entry.seq), Ordering::Relaxed);
        slot.src_ip
            .store(u64::from(u32::from(entry.src_ip)), Ordering::Relaxed);
        slot.src_port.store(u64::from(entry.src_port), Ordering::Relaxed);
        slot.mask.store(u64::from(entry.mask), Ordering::Relaxed);
        for (i, &value) in entry.ts.iter().enumerate() {
            slot.ts[i].store(value, Ordering::Relaxed);
        }
        self.head.store(head + 1, Ordering::Release);
    }

    /// Set one timestamp slot on the most recent entry for `seq`,
    /// scanning backward from the newest record. Returns false when
    /// the entry has already been evicted.
    pub fn update_slot(&self, seq: u32, ts_index: usize, value: u64) -> bool {
        if value == 0 {
            return false;
        }
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let seq = u64::from(seq);
        for pos in (tail..head).rev() {
            let slot = &self.slots[(pos & self.mask) as usize];
            if slot.seq.load(Ordering::Relaxed) == seq {
                slot.ts[ts_index].store(value, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Set several timestamp slots on the most recent entry for `seq`
    /// in one scan. Zero values are left untouched.
    pub fn update_slots(&self, seq: u32, updates: &[(usize, u64)]) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        let seq = u64::from(seq);
        for pos in (tail..head).rev() {
            let slot = &self.slots[(pos & self.mask) as usize];
            if slot.seq.load(Ordering::Relaxed) == seq {
                for &(ts_index, value) in updates {
                    if value != 0 {
                        slot.ts[ts_index].store(value, Ordering::Relaxed);
                    }
                }
                return true;
            }
        }
        false
    }

    /// Walk all live entries oldest-first. Intended for the
    /// single-threaded post-run analysis pass.
    pub fn for_each<F: FnMut(StatsEntry)>(&self, mut f: F) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        for pos in tail..head {
            let slot = &self.slots[(pos & self.mask) as usize];
            let mut ts = [0u64; TS_SLOTS];
            for (i, cell) in slot.ts.iter().enumerate() {
                ts[i] = cell.load(Ordering::Relaxed);
            }
            f(StatsEntry {
                seq: slot.seq.load(Ordering::Relaxed) as u32,
                src_ip: Ipv4Addr::from(slot.src_ip.load(Ordering::Relaxed) as u32),
                src_port: slot.src_port.load(Ordering::Relaxed) as u16,
                mask: slot.mask.load(Ordering::Relaxed) as u16,
                ts,
            });
        }
    }
}

/// Cross-thread run state handed to every worker at spawn time:
/// the shutdown flag and the live packet counters.
#[derive(Default)]
pub struct RunContext {
    shutdown: AtomicBool,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub replies_dropped: AtomicU64,
}

impl RunContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u32) -> StatsEntry {
        StatsEntry::minimal(seq, Ipv4Addr::LOCALHOST, 4791, 0x007)
    }

    #[test]
    fn push_and_walk() {
        let stats = StatsCollector::new(8).unwrap();
        for seq in 0..5 {
            stats.push(&entry(seq));
        }
        assert_eq!(stats.len(), 5);
        let mut seen = Vec::new();
        stats.for_each(|e| seen.push(e.seq));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn full_window_evicts_oldest() {
        let stats = StatsCollector::new(4).unwrap();
        for seq in 0..6 {
            stats.push(&entry(seq));
        }
        assert_eq!(stats.len(), 4);
        assert_eq!(stats.dropped(), 2);
        let mut seen = Vec::new();
        stats.for_each(|e| seen.push(e.seq));
        assert_eq!(seen, vec![2, 3, 4, 5]);
    }

    #[test]
    fn backward_scan_updates_newest_match() {
        let stats = StatsCollector::new(8).unwrap();
        for seq in 0..4 {
            stats.push(&entry(seq));
        }
        assert!(stats.update_slot(2, TS_CLT_KER_TX, 999));
        assert!(!stats.update_slot(42, TS_CLT_KER_TX, 999));
        let mut found = 0;
        stats.for_each(|e| {
            if e.seq == 2 {
                assert_eq!(e.ts[TS_CLT_KER_TX], 999);
                found += 1;
            }
        });
        assert_eq!(found, 1);
    }

    #[test]
    fn zero_values_never_recorded() {
        let stats = StatsCollector::new(8).unwrap();
        stats.push(&entry(1));
        assert!(!stats.update_slot(1, TS_CLT_KER_TX, 0));
        assert!(stats.update_slots(1, &[(TS_CLT_HW_RX, 0), (TS_CLT_KER_RX, 7)]));
        stats.for_each(|e| {
            assert_eq!(e.ts[TS_CLT_HW_RX], 0);
            assert_eq!(e.ts[TS_CLT_KER_RX], 7);
        });
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let stats = StatsCollector::new(1000).unwrap();
        assert_eq!(stats.capacity(), 1024);
    }
}
