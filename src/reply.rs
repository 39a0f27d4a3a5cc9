//! Return-packet dispatch (server round-trip)
//!
//! The receive loop enqueues a minimal reply request per packet; a
//! dedicated transmit thread drains the queue in depth-adaptive
//! batches and sends 4-byte echo replies. Enqueue on a full queue
//! drops the reply and counts it; the receive loop never blocks.

use crate::constants::{BATCH_SIZE, RETURN_PACKET_SIZE};
use crate::correlation::RxCorrelation;
use crate::csvlog::{CsvEntry, CsvSink};
use crate::net::{self, BatchSender};
use crate::runtime;
use crate::stats::{RunContext, StatsCollector, TS_SVR_APP_TX};
use crate::tsc;
use anyhow::{Context, Result};
use log::warn;
use std::cell::UnsafeCell;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One pending reply: the echoed sequence number and where to send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyRequest {
    pub seq: u32,
    pub dest: SocketAddrV4,
}

impl Default for ReplyRequest {
    fn default() -> Self {
        Self {
            seq: 0,
            dest: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }
}

#[repr(align(64))]
#[derive(Default)]
struct ReplySlot(UnsafeCell<ReplyRequest>);

/// Single-producer/single-consumer ring of reply requests.
pub struct ReplyQueue {
    slots: Box<[ReplySlot]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
    dropped: AtomicU64,
}

// SPSC discipline: the receive loop is the only producer, the sender
// thread the only consumer.
unsafe impl Sync for ReplyQueue {}
unsafe impl Send for ReplyQueue {}

impl ReplyQueue {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(2).next_power_of_two();
        Ok(Self {
            slots: crate::stats::alloc_slots(capacity)?,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue a reply request; returns false (and counts the drop)
    /// when the queue is full.
    pub fn push(&self, request: ReplyRequest) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail > self.mask {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &self.slots[(head & self.mask) as usize];
        unsafe {
            *slot.0.get() = request;
        }
        self.head.store(head + 1, Ordering::Release);
        true
    }

    /// Dequeue up to `max` requests into `out`.
    pub fn pop_batch(&self, out: &mut Vec<ReplyRequest>, max: usize) {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        let take = ((head - tail) as usize).min(max);
        for pos in tail..tail + take as u64 {
            let slot = &self.slots[(pos & self.mask) as usize];
            out.push(unsafe { *slot.0.get() });
        }
        if take > 0 {
            self.tail.store(tail + take as u64, Ordering::Release);
        }
    }
}

/// Handle for the reply transmit thread.
pub struct ReplySender {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl ReplySender {
    /// Spawn the sender thread on `cpu`. It batches by current queue
    /// depth (capped at the hot-path batch size), sends via sendmmsg,
    /// and falls back to per-packet sends when the batch call covers
    /// only part of the batch.
    pub fn start(
        fd: RawFd,
        queue: Arc<ReplyQueue>,
        rx_corr: Arc<RxCorrelation>,
        stats: Option<Arc<StatsCollector>>,
        main_csv: Option<CsvSink>,
        ctx: Arc<RunContext>,
        cpu: Option<usize>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name("reply-tx".into())
            .spawn(move || {
                sender_loop(fd, queue, rx_corr, stats, main_csv, ctx, cpu, thread_running)
            })
            .context("Failed to spawn reply transmit thread")?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Stop after the queue has been drained. Returns replies sent.
    pub fn stop(mut self) -> u64 {
        self.running.store(false, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                warn!("Reply transmit thread panicked");
                0
            }),
            None => 0,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sender_loop(
    fd: RawFd,
    queue: Arc<ReplyQueue>,
    rx_corr: Arc<RxCorrelation>,
    stats: Option<Arc<StatsCollector>>,
    main_csv: Option<CsvSink>,
    ctx: Arc<RunContext>,
    cpu: Option<usize>,
    running: Arc<AtomicBool>,
) -> u64 {
    runtime::enter_hot_thread(cpu);
    let mut sender = BatchSender::new(BATCH_SIZE);
    let mut requests: Vec<ReplyRequest> = Vec::with_capacity(BATCH_SIZE);
    let mut packets: Vec<([u8; RETURN_PACKET_SIZE], SocketAddrV4)> = Vec::with_capacity(BATCH_SIZE);
    let mut replies_sent = 0u64;

    loop {
        let depth = queue.len();
        if depth == 0 {
            if !running.load(Ordering::Acquire) {
                break;
            }
            std::hint::spin_loop();
            continue;
        }

        requests.clear();
        queue.pop_batch(&mut requests, depth.min(BATCH_SIZE));

        packets.clear();
        for request in &requests {
            packets.push((request.seq.to_be_bytes(), request.dest));
        }

        let app_tx_ns = tsc::wall_clock_ns();
        let mut sent = match sender.send_addressed(fd, &packets) {
            Ok(n) => n,
            Err(e) => {
                warn!("Reply batch send failed: {e}");
                0
            }
        };
        // Per-packet fallback for whatever the batch call left behind.
        for (payload, dest) in packets[sent..].iter() {
            match net::send_one(fd, payload, *dest) {
                Ok(true) => sent += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!("Reply send failed: {e}");
                    break;
                }
            }
        }

        for request in requests[..sent].iter() {
            if let Some(stats) = stats.as_deref() {
                stats.update_slot(request.seq, TS_SVR_APP_TX, app_tx_ns);
            }
            if let Some(csv) = main_csv.as_ref() {
                if let Some(rx) = rx_corr.load(request.seq) {
                    let mut entry = CsvEntry {
                        seq: request.seq,
                        src_ip: rx.peer_ip,
                        src_port: rx.peer_port,
                        ..CsvEntry::default()
                    };
                    entry.ts[crate::stats::TS_SVR_HW_RX] = rx.hw_rx_ns;
                    entry.ts[crate::stats::TS_SVR_KER_RX] = rx.ker_rx_ns;
                    entry.ts[crate::stats::TS_SVR_APP_RX] = rx.app_rx_ns;
                    entry.ts[TS_SVR_APP_TX] = app_tx_ns;
                    csv.push(&entry);
                }
            }
        }
        replies_sent += sent as u64;
        ctx.packets_sent.fetch_add(sent as u64, Ordering::Relaxed);
    }
    replies_sent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(seq: u32) -> ReplyRequest {
        ReplyRequest {
            seq,
            dest: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, seq as u8), 4791),
        }
    }

    #[test]
    fn fifth_enqueue_is_rejected_without_corruption() {
        let queue = ReplyQueue::new(4).unwrap();
        for seq in 0..4 {
            assert!(queue.push(request(seq)));
        }
        assert!(!queue.push(request(99)));
        assert_eq!(queue.dropped(), 1);

        let mut out = Vec::new();
        queue.pop_batch(&mut out, 8);
        assert_eq!(out, vec![request(0), request(1), request(2), request(3)]);
    }

    #[test]
    fn pop_respects_batch_limit() {
        let queue = ReplyQueue::new(8).unwrap();
        for seq in 0..6 {
            queue.push(request(seq));
        }
        let mut out = Vec::new();
        queue.pop_batch(&mut out, 4);
        assert_eq!(out.len(), 4);
        assert_eq!(queue.len(), 2);
        out.clear();
        queue.pop_batch(&mut out, 4);
        assert_eq!(out.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_round_trips_after_wrap() {
        let queue = ReplyQueue::new(4).unwrap();
        let mut out = Vec::new();
        for round in 0..10u32 {
            assert!(queue.push(request(round)));
            queue.pop_batch(&mut out, 1);
        }
        assert_eq!(out.len(), 10);
        assert_eq!(out[9], request(9));
    }
}
