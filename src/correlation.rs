//! Correlation stores
//!
//! Fixed-capacity circular arrays keyed by `seq % capacity`, matching
//! asynchronously-delivered timestamps back to in-flight packets.
//! Each slot carries a generation tag (the full sequence number plus
//! one, zero meaning vacant) that is published last and re-checked
//! after reading, so an entry evicted by a later packet is reported
//! as a miss instead of being silently returned. Each side has a
//! single writer; readers may run on other threads.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

#[inline]
fn tag_for(seq: u32) -> u64 {
    u64::from(seq) + 1
}

#[derive(Default)]
struct TxSlot {
    tag: AtomicU64,
    app_tx_ns: AtomicU64,
    app_tx_tsc: AtomicU64,
}

/// Transmit-side sample recovered from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSample {
    pub app_tx_ns: u64,
    /// Cycle-counter companion of the send timestamp, 0 when the
    /// platform has no invariant counter.
    pub app_tx_tsc: u64,
}

/// Transmit-side correlation: application send timestamps recorded by
/// the hot loop, read by the receive path and the kernel-timestamp
/// collector.
pub struct TxCorrelation {
    slots: Box<[TxSlot]>,
}

impl TxCorrelation {
    pub fn new(capacity: u32) -> anyhow::Result<Self> {
        Ok(Self {
            slots: crate::stats::alloc_slots(capacity as usize)?,
        })
    }

    #[inline]
    fn slot(&self, seq: u32) -> &TxSlot {
        &self.slots[(seq as usize) % self.slots.len()]
    }

    /// Record the send timestamps for `seq`, evicting whatever held
    /// the slot before.
    pub fn store(&self, seq: u32, app_tx_ns: u64, app_tx_tsc: u64) {
        let slot = self.slot(seq);
        slot.tag.store(0, Ordering::Release);
        slot.app_tx_ns.store(app_tx_ns, Ordering::Relaxed);
        slot.app_tx_tsc.store(app_tx_tsc, Ordering::Relaxed);
        slot.tag.store(tag_for(seq), Ordering::Release);
    }

    /// Look up the sample for `seq`. Returns `None` when the slot is
    /// vacant, holds a different sequence number, or was overwritten
    /// mid-read.
    pub fn load(&self, seq: u32) -> Option<TxSample> {
        let slot = self.slot(seq);
        if slot.tag.load(Ordering::Acquire) != tag_for(seq) {
            return None;
        }
        let sample = TxSample {
            app_tx_ns: slot.app_tx_ns.load(Ordering::Relaxed),
            app_tx_tsc: slot.app_tx_tsc.load(Ordering::Relaxed),
        };
        if slot.tag.load(Ordering::Acquire) != tag_for(seq) {
            return None;
        }
        Some(sample)
    }
}

#[derive(Default)]
struct RxSlot {
    tag: AtomicU64,
    hw_rx_ns: AtomicU64,
    ker_rx_ns: AtomicU64,
    app_rx_ns: AtomicU64,
    peer: AtomicU64,
}

/// Receive-side sample recovered from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSample {
    pub hw_rx_ns: u64,
    pub ker_rx_ns: u64,
    pub app_rx_ns: u64,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
}

/// Receive-side correlation: per-packet receive timestamps plus the
/// peer identity needed to route a reply or label output records.
pub struct RxCorrelation {
    slots: Box<[RxSlot]>,
}

impl RxCorrelation {
    pub fn new(capacity: u32) -> anyhow::Result<Self> {
        Ok(Self {
            slots: crate::stats::alloc_slots(capacity as usize)?,
        })
    }

    #[inline]
    fn slot(&self, seq: u32) -> &RxSlot {
        &self.slots[(seq as usize) % self.slots.len()]
    }

    pub fn store(
        &self,
        seq: u32,
        hw_rx_ns: u64,
        ker_rx_ns: u64,
        app_rx_ns: u64,
        peer_ip: Ipv4Addr,
        peer_port: u16,
    ) {
        let slot = self.slot(seq);
        slot.tag.store(0, Ordering::Release);
        slot.hw_rx_ns.store(hw_rx_ns, Ordering::Relaxed);
        slot.ker_rx_ns.store(ker_rx_ns, Ordering::Relaxed);
        slot.app_rx_ns.store(app_rx_ns, Ordering::Relaxed);
        let packed = (u64::from(u32::from(peer_ip)) << 16) | u64::from(peer_port);
        slot.peer.store(packed, Ordering::Relaxed);
        slot.tag.store(tag_for(seq), Ordering::Release);
    }

    pub fn load(&self, seq: u32) -> Option<RxSample> {
        let slot = self.slot(seq);
        if slot.tag.load(Ordering::Acquire) != tag_for(seq) {
            return None;
        }
        let packed = slot.peer.load(Ordering::Relaxed);
        let sample = RxSample {
            hw_rx_ns: slot.hw_rx_ns.load(Ordering::Relaxed),
            ker_rx_ns: slot.ker_rx_ns.load(Ordering::Relaxed),
            app_rx_ns: slot.app_rx_ns.load(Ordering::Relaxed),
            peer_ip: Ipv4Addr::from((packed >> 16) as u32),
            peer_port: (packed & 0xFFFF) as u16,
        };
        if slot.tag.load(Ordering::Acquire) != tag_for(seq) {
            return None;
        }
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load() {
        let corr = TxCorrelation::new(16).unwrap();
        corr.store(5, 1_000, 2_000);
        assert_eq!(
            corr.load(5),
            Some(TxSample {
                app_tx_ns: 1_000,
                app_tx_tsc: 2_000
            })
        );
        assert_eq!(corr.load(6), None);
    }

    #[test]
    fn wraparound_evicts_and_is_detected() {
        let corr = TxCorrelation::new(4).unwrap();
        corr.store(1, 100, 0);
        // Sequence 5 maps to the same slot as 1.
        corr.store(5, 500, 0);
        assert_eq!(corr.load(1), None);
        assert_eq!(
            corr.load(5),
            Some(TxSample {
                app_tx_ns: 500,
                app_tx_tsc: 0
            })
        );
    }

    #[test]
    fn vacant_slot_does_not_match_seq_zero() {
        let corr = TxCorrelation::new(8).unwrap();
        assert_eq!(corr.load(0), None);
        corr.store(0, 42, 0);
        assert_eq!(
            corr.load(0),
            Some(TxSample {
                app_tx_ns: 42,
                app_tx_tsc: 0
            })
        );
    }

    #[test]
    fn rx_store_keeps_peer_identity() {
        let corr = RxCorrelation::new(8).unwrap();
        let ip = Ipv4Addr::new(192, 168, 1, 10);
        corr.store(9, 111, 222, 333, ip, 4791);
        let sample = corr.load(9).unwrap();
        assert_eq!(sample.hw_rx_ns, 111);
        assert_eq!(sample.ker_rx_ns, 222);
        assert_eq!(sample.app_rx_ns, 333);
        assert_eq!(sample.peer_ip, ip);
        assert_eq!(sample.peer_port, 4791);
    }
}
