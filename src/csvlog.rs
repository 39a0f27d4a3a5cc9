//! CSV logging engine
//!
//! One single-producer/single-consumer ring buffer per output file,
//! each drained by a dedicated writer thread that formats entries in
//! batches and issues one write plus one flush per batch. Producers
//! never block: a full ring drops the entry and counts it. On close
//! the ring is drained completely before the file is synced.

use crate::constants::{CSV_BATCH_SIZE, CSV_IDLE_SLEEP_US, CSV_RING_SIZE};
use crate::runtime;
use crate::stats::TS_SLOTS;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::cell::UnsafeCell;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Output schema selector; one per (role, mode, file) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsvKind {
    ClientMainOneWay,
    ClientMainRoundTrip,
    ClientTx,
    ServerMainOneWay,
    ServerMainRoundTrip,
    ServerTx,
}

impl CsvKind {
    pub fn header(self) -> &'static str {
        match self {
            CsvKind::ClientMainOneWay => "clt_src_ip,clt_src_port,seq_num,clt_app_tx_ts\n",
            CsvKind::ClientMainRoundTrip => {
                "clt_src_ip,clt_src_port,seq_num,clt_app_tx_tsc_ts,clt_app_tx_ts,clt_hw_rx_ts,clt_ker_rx_ts,clt_app_rx_tsc_ts,clt_app_rx_ts\n"
            }
            CsvKind::ClientTx => "clt_src_ip,clt_src_port,seq_num,clt_ker_tx_ts\n",
            CsvKind::ServerMainOneWay => {
                "clt_src_ip,clt_src_port,seq_num,svr_hw_rx_ts,svr_ker_rx_ts,svr_app_rx_ts\n"
            }
            CsvKind::ServerMainRoundTrip => {
                "clt_src_ip,clt_src_port,seq_num,svr_hw_rx_ts,svr_ker_rx_ts,svr_app_rx_ts,svr_app_tx_ts\n"
            }
            CsvKind::ServerTx => "clt_src_ip,clt_src_port,seq_num,svr_ker_tx_ts\n",
        }
    }

    /// Timestamp slots emitted after the identity columns, in order.
    fn columns(self) -> &'static [usize] {
        match self {
            CsvKind::ClientMainOneWay => &[1],
            CsvKind::ClientMainRoundTrip => &[0, 1, 3, 4, 5, 6],
            CsvKind::ClientTx => &[2],
            CsvKind::ServerMainOneWay => &[7, 8, 9],
            CsvKind::ServerMainRoundTrip => &[7, 8, 9, 10],
            CsvKind::ServerTx => &[11],
        }
    }

    /// Append one data row for `entry`.
    pub fn format_row(self, entry: &CsvEntry, out: &mut String) {
        let _ = write!(out, "{},{},{}", entry.src_ip, entry.src_port, entry.seq);
        for &slot in self.columns() {
            out.push(',');
            push_ts(out, entry.ts[slot]);
        }
        out.push('\n');
    }
}

fn push_ts(out: &mut String, ns: u64) {
    if ns == 0 {
        out.push_str("NULL");
    } else {
        let _ = write!(out, "{}.{:09}", ns / 1_000_000_000, ns % 1_000_000_000);
    }
}

/// Derive the kernel-TX-timestamp log name from the main log name.
pub fn tx_log_path(main: &Path) -> PathBuf {
    let stem = main
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "timestamps".to_string());
    main.with_file_name(format!("{stem}_tx.csv"))
}

/// One packet event, laid out for batch formatting. Written once,
/// never mutated after enqueue.
#[derive(Debug, Clone, Copy)]
pub struct CsvEntry {
    pub seq: u32,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub ts: [u64; TS_SLOTS],
}

impl Default for CsvEntry {
    fn default() -> Self {
        Self {
            seq: 0,
            src_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            ts: [0; TS_SLOTS],
        }
    }
}

#[repr(align(64))]
struct CsvSlot(UnsafeCell<CsvEntry>);

impl Default for CsvSlot {
    fn default() -> Self {
        Self(UnsafeCell::new(CsvEntry::default()))
    }
}

/// SPSC ring: exactly one producer thread and the writer thread.
struct CsvRing {
    slots: Box<[CsvSlot]>,
    mask: u64,
    head: AtomicU64,
    tail: AtomicU64,
    dropped: AtomicU64,
    running: AtomicBool,
}

// SPSC discipline: the slot at head is written only by the single
// producer before the head release-store, and read only by the single
// consumer after observing it.
unsafe impl Sync for CsvRing {}
unsafe impl Send for CsvRing {}

impl CsvRing {
    fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(2).next_power_of_two();
        Ok(Self {
            slots: crate::stats::alloc_slots(capacity)?,
            mask: capacity as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            running: AtomicBool::new(true),
        })
    }

    fn push(&self, entry: &CsvEntry) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail > self.mask {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let slot = &self.slots[(head & self.mask) as usize];
        unsafe {
            *slot.0.get() = *entry;
        }
        self.head.store(head + 1, Ordering::Release);
        true
    }

    fn pop_batch(&self, out: &mut Vec<CsvEntry>, max: usize) {
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

/// Clonable producer handle for one CSV ring.
#[derive(Clone)]
pub struct CsvSink {
    ring: Arc<CsvRing>,
}

impl CsvSink {
    /// Enqueue without blocking. Returns false (and counts the drop)
    /// when the ring is full.
    pub fn push(&self, entry: &CsvEntry) -> bool {
        self.ring.push(entry)
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped.load(Ordering::Relaxed)
    }
}

/// A CSV output file with its ring and writer thread.
pub struct CsvWriter {
    ring: Arc<CsvRing>,
    handle: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl CsvWriter {
    /// Open `path`, write the schema header, and start the writer
    /// thread (pinned to `log_cpu` when given).
    pub fn create(path: &Path, kind: CsvKind, log_cpu: Option<usize>) -> Result<Self> {
        let ring = Arc::new(CsvRing::new(CSV_RING_SIZE)?);
        let mut file =
            File::create(path).with_context(|| format!("Failed to create CSV file: {path:?}"))?;
        file.write_all(kind.header().as_bytes())
            .with_context(|| format!("Failed to write CSV header: {path:?}"))?;

        let thread_ring = Arc::clone(&ring);
        let handle = thread::Builder::new()
            .name("csv-writer".into())
            .spawn(move || writer_loop(thread_ring, file, kind, log_cpu))
            .context("Failed to spawn CSV writer thread")?;

        debug!("CSV log started: {path:?}");
        Ok(Self {
            ring,
            handle: Some(handle),
            path: path.to_path_buf(),
        })
    }

    pub fn sink(&self) -> CsvSink {
        CsvSink {
            ring: Arc::clone(&self.ring),
        }
    }

    /// Stop the writer after it drains every remaining entry.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.ring.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("CSV writer thread for {:?} panicked", self.path);
            }
        }
        let dropped = self.ring.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!("CSV log {:?} dropped {} entries (ring full)", self.path, dropped);
        }
    }
}

impl Drop for CsvWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.shutdown();
        }
    }
}

fn writer_loop(ring: Arc<CsvRing>, mut file: File, kind: CsvKind, log_cpu: Option<usize>) {
    if let Some(cpu) = log_cpu {
        runtime::pin_current_thread(cpu);
    }
    let mut batch: Vec<CsvEntry> = Vec::with_capacity(CSV_BATCH_SIZE);
    let mut block = String::with_capacity(CSV_BATCH_SIZE * 64);
    loop {
        batch.clear();
        ring.pop_batch(&mut batch, CSV_BATCH_SIZE);
        if batch.is_empty() {
            if !ring.running.load(Ordering::Acquire) {
                break;
            }
            thread::sleep(Duration::from_micros(CSV_IDLE_SLEEP_US));
            continue;
        }
        block.clear();
        for entry in &batch {
            kind.format_row(entry, &mut block);
        }
        if let Err(e) = file.write_all(block.as_bytes()) {
            warn!("CSV write failed: {e}");
        }
        if let Err(e) = file.sync_data() {
            warn!("CSV sync failed: {e}");
        }
    }
    let _ = file.sync_data();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u32, slots: &[(usize, u64)]) -> CsvEntry {
        let mut e = CsvEntry {
            seq,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            src_port: 4791,
            ..CsvEntry::default()
        };
        for &(i, v) in slots {
            e.ts[i] = v;
        }
        e
    }

    #[test]
    fn timestamp_formatting() {
        let mut s = String::new();
        push_ts(&mut s, 100_000_000_005);
        assert_eq!(s, "100.000000005");
        s.clear();
        push_ts(&mut s, 0);
        assert_eq!(s, "NULL");
    }

    #[test]
    fn software_only_rows_write_null_hardware_columns() {
        let e = entry(7, &[(8, 1_000_000_123), (9, 1_000_000_456)]);
        let mut row = String::new();
        CsvKind::ServerMainOneWay.format_row(&e, &mut row);
        assert_eq!(row, "10.0.0.1,4791,7,NULL,1.000000123,1.000000456\n");
    }

    #[test]
    fn round_trip_row_columns() {
        let e = entry(3, &[(0, 1), (1, 2), (3, 3), (4, 4), (5, 5), (6, 6)]);
        let mut row = String::new();
        CsvKind::ClientMainRoundTrip.format_row(&e, &mut row);
        let fields: Vec<&str> = row.trim_end().split(',').collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[2], "3");
        assert_eq!(fields[3], "0.000000001");
        assert_eq!(fields[8], "0.000000006");
    }

    #[test]
    fn tx_path_derivation() {
        assert_eq!(
            tx_log_path(Path::new("/tmp/run1.csv")),
            PathBuf::from("/tmp/run1_tx.csv")
        );
    }

    #[test]
    fn ring_rejects_when_full() {
        let ring = CsvRing::new(4).unwrap();
        for seq in 0..4 {
            assert!(ring.push(&entry(seq, &[])));
        }
        assert!(!ring.push(&entry(99, &[])));
        assert_eq!(ring.dropped.load(Ordering::Relaxed), 1);
        let mut out = Vec::new();
        ring.pop_batch(&mut out, 10);
        let seqs: Vec<u32> = out.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn writer_drains_everything_on_close() {
        let path = std::env::temp_dir().join(format!("csvlog_test_{}.csv", std::process::id()));
        let writer = CsvWriter::create(&path, CsvKind::ClientMainOneWay, None).unwrap();
        let sink = writer.sink();
        for seq in 0..500u32 {
            assert!(sink.push(&entry(seq, &[(1, 1_000_000_000 + u64::from(seq))])));
        }
        writer.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], CsvKind::ClientMainOneWay.header().trim_end());
        assert_eq!(lines.len(), 501);
        assert_eq!(lines[1], "10.0.0.1,4791,0,1.000000000");
        assert_eq!(lines[500], "10.0.0.1,4791,499,1.000000499");
        let _ = std::fs::remove_file(&path);
    }
}
