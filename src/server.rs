//! Server roles: timestamped receive loop and round-trip echo path
//!
//! The receive loop runs on the calling thread and busy-polls the
//! listening socket. One-way mode only records; round-trip mode also
//! stores each packet in the receive correlation array and hands a
//! reply request to the dispatch queue, whose sender thread echoes the
//! sequence number back to the port named in the payload.

use crate::analysis::{self, RunMode, RunSummary};
use crate::config::{CsvOptions, StatsSpec};
use crate::constants::{
    CHECK_INTERVAL_SECONDS, MAX_PACKET_SIZE, MAX_SEQUENCE_NUMBERS, ORIGINAL_PACKET_SIZE,
    REPLY_QUEUE_SIZE,
};
use crate::correlation::RxCorrelation;
use crate::csvlog::{CsvEntry, CsvKind, CsvWriter};
use crate::net::{self, SocketTuning};
use crate::rate::RateReporter;
use crate::reply::{ReplyQueue, ReplyRequest, ReplySender};
use crate::runtime;
use crate::stats::{
    RunContext, StatsCollector, StatsEntry, TS_SVR_APP_RX, TS_SVR_HW_RX, TS_SVR_KER_RX,
    TS_SVR_KER_TX,
};
use crate::tsc::{self, TscClock};
use crate::txstamp::TxCollector;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

/// Server run parameters, validated by the CLI layer.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: Ipv4Addr,
    pub port: u16,
    pub round_trip: bool,
    pub interface: Option<String>,
    /// Run length in seconds; 0 runs until interrupted.
    pub duration_seconds: u64,
    pub csv: Option<CsvOptions>,
    pub stats: Option<StatsSpec>,
    pub json_summary: Option<PathBuf>,
    pub rx_cpu: Option<usize>,
    pub tx_cpu: Option<usize>,
    pub timestamp_cpu: Option<usize>,
    pub log_cpu: Option<usize>,
}

impl ServerConfig {
    fn mode(&self) -> RunMode {
        if self.round_trip {
            RunMode::ServerRoundTrip
        } else {
            RunMode::ServerOneWay
        }
    }
}

/// Run the server until the duration elapses or shutdown is requested.
pub fn run(cfg: ServerConfig, ctx: Arc<RunContext>) -> Result<()> {
    let mode = cfg.mode();
    runtime::lock_memory();

    let listen = SocketAddrV4::new(cfg.listen, cfg.port);
    let rx_socket = net::bound_udp_socket(listen)?;
    net::tune_socket(
        rx_socket.as_raw_fd(),
        &SocketTuning {
            incoming_cpu: cfg.rx_cpu,
            zero_copy: false,
        },
    );
    if cfg.interface.is_none() {
        warn!("No interface given; hardware receive timestamps unavailable");
    }
    let hardware = net::enable_rx_timestamping(rx_socket.as_raw_fd(), cfg.interface.as_deref())?;
    if !hardware {
        warn!("Recording software receive timestamps only");
    }
    info!("Listening on {listen} ({})", mode.label());

    let stats = match cfg.stats {
        Some(spec) => Some(Arc::new(StatsCollector::new(spec.buffer_size)?)),
        None => None,
    };

    let (main_writer, tx_writer) = match cfg.csv.as_ref() {
        Some(paths) => {
            let main_kind = if cfg.round_trip {
                CsvKind::ServerMainRoundTrip
            } else {
                CsvKind::ServerMainOneWay
            };
            let main = CsvWriter::create(&paths.main, main_kind, cfg.log_cpu)?;
            let tx = if cfg.round_trip {
                let writer = CsvWriter::create(&paths.tx, CsvKind::ServerTx, cfg.log_cpu)?;
                info!("Logging packets to {:?} and {:?}", paths.main, paths.tx);
                Some(writer)
            } else {
                info!("Logging packets to {:?}", paths.main);
                None
            };
            (Some(main), tx)
        }
        None => (None, None),
    };

    // Round-trip plumbing: echo socket, correlation array, dispatch
    // queue, reply sender, kernel TX timestamp collector.
    let round_trip = if cfg.round_trip {
        let tx_socket = net::bound_udp_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        net::tune_socket(
            tx_socket.as_raw_fd(),
            &SocketTuning {
                incoming_cpu: None,
                zero_copy: true,
            },
        );
        net::enable_tx_timestamping(tx_socket.as_raw_fd())?;
        let tx_local = match tx_socket
            .local_addr()
            .context("Failed to query echo socket address")?
        {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => bail!("Expected an IPv4 socket, got {addr}"),
        };

        let rx_corr = Arc::new(RxCorrelation::new(MAX_SEQUENCE_NUMBERS)?);
        let queue = Arc::new(ReplyQueue::new(REPLY_QUEUE_SIZE)?);
        let sender = ReplySender::start(
            tx_socket.as_raw_fd(),
            Arc::clone(&queue),
            Arc::clone(&rx_corr),
            stats.clone(),
            main_writer.as_ref().map(|w| w.sink()),
            Arc::clone(&ctx),
            cfg.tx_cpu,
        )?;
        let collector = TxCollector::start(
            tx_socket.as_raw_fd(),
            stats.clone(),
            tx_writer.as_ref().map(|w| w.sink()),
            Some(Arc::clone(&rx_corr)),
            tx_local,
            TS_SVR_KER_TX,
            cfg.timestamp_cpu,
        )?;
        Some((tx_socket, rx_corr, queue, sender, collector))
    } else {
        None
    };

    let rate_ctx = Arc::clone(&ctx);
    let reporter = RateReporter::start(Box::new(move || {
        rate_ctx.packets_received.load(Ordering::Relaxed)
    }))?;
    let rate_state = reporter.state();

    let main_sink = if cfg.round_trip {
        // Round-trip main rows are written by the reply sender, after
        // the application send timestamp is known.
        None
    } else {
        main_writer.as_ref().map(|w| w.sink())
    };

    runtime::enter_hot_thread(cfg.rx_cpu);
    let clock = TscClock::new(tsc::calibrate_cpu_freq());
    let check_cycles = clock.cycles_for_ns(CHECK_INTERVAL_SECONDS * 1_000_000_000.0);
    let start = Instant::now();
    let fd = rx_socket.as_raw_fd();
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut pacer = tsc::CheckPacer::new(check_cycles, tsc::rdtsc());
    let mask = mode.timestamp_mask();
    let rt = round_trip
        .as_ref()
        .map(|(_, rx_corr, queue, _, _)| (rx_corr.as_ref(), queue.as_ref()));

    loop {
        if pacer.due(tsc::rdtsc()) {
            if ctx.is_shutdown() {
                break;
            }
            if cfg.duration_seconds > 0 && start.elapsed().as_secs() >= cfg.duration_seconds {
                break;
            }
            if let Some(pps) = rate_state.take_ready() {
                info!("RX rate: {pps} pps");
            }
        }

        let packet = match net::recv_with_timestamps(fd, &mut buf) {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                std::hint::spin_loop();
                continue;
            }
            Err(e) => {
                warn!("Receive failed: {e}");
                continue;
            }
        };
        let app_rx_ns = tsc::wall_clock_ns();
        if packet.len < 4 {
            continue;
        }
        let seq = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        ctx.packets_received.fetch_add(1, Ordering::Relaxed);

        if let Some(stats) = stats.as_deref() {
            let mut entry =
                StatsEntry::minimal(seq, *packet.peer.ip(), packet.peer.port(), mask);
            entry.ts[TS_SVR_HW_RX] = packet.hw_rx_ns;
            entry.ts[TS_SVR_KER_RX] = packet.ker_rx_ns;
            entry.ts[TS_SVR_APP_RX] = app_rx_ns;
            stats.push(&entry);
        }
        if let Some(csv) = main_sink.as_ref() {
            let mut entry = CsvEntry {
                seq,
                src_ip: *packet.peer.ip(),
                src_port: packet.peer.port(),
                ..CsvEntry::default()
            };
            entry.ts[TS_SVR_HW_RX] = packet.hw_rx_ns;
            entry.ts[TS_SVR_KER_RX] = packet.ker_rx_ns;
            entry.ts[TS_SVR_APP_RX] = app_rx_ns;
            csv.push(&entry);
        }

        if let Some((rx_corr, queue)) = rt {
            if packet.len < ORIGINAL_PACKET_SIZE {
                continue;
            }
            rx_corr.store(
                seq,
                packet.hw_rx_ns,
                packet.ker_rx_ns,
                app_rx_ns,
                *packet.peer.ip(),
                packet.peer.port(),
            );
            let reply_port = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as u16;
            let request = ReplyRequest {
                seq,
                dest: SocketAddrV4::new(*packet.peer.ip(), reply_port),
            };
            if !queue.push(request) {
                ctx.replies_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    let elapsed = start.elapsed();
    ctx.request_shutdown();
    reporter.stop();

    let mut replies_sent = 0u64;
    let mut kernel_ts = 0u64;
    if let Some((_tx_socket, _rx_corr, queue, sender, collector)) = round_trip {
        // The sender drains the queue before the collector's final
        // errqueue drain picks up the last kernel timestamps.
        replies_sent = sender.stop();
        kernel_ts = collector.stop();
        let queue_drops = queue.dropped();
        if queue_drops > 0 {
            warn!("{queue_drops} replies dropped on a full dispatch queue");
        }
    }
    if let Some(writer) = main_writer {
        writer.close();
    }
    if let Some(writer) = tx_writer {
        writer.close();
    }

    let received = ctx.packets_received.load(Ordering::Relaxed);
    if let Some(stats) = stats.as_deref() {
        let spec = cfg.stats.unwrap_or_default();
        let mut result = analysis::analyze(stats, mode, &spec.into());
        analysis::display(&mut result);
        if let Some(path) = cfg.json_summary.as_deref() {
            let summary = RunSummary::build(&mut result, elapsed.as_secs(), replies_sent, received);
            analysis::export_json(path, &summary)?;
            info!("Summary written to {path:?}");
        }
    }

    info!("");
    info!("Run complete after {:.1}s", elapsed.as_secs_f64());
    info!("  packets received:     {received}");
    if cfg.round_trip {
        info!("  replies sent:         {replies_sent}");
        info!("  kernel TX timestamps: {kernel_ts}");
    }
    Ok(())
}
