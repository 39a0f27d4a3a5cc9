//! Client roles: paced transmit loop plus the round-trip receive path
//!
//! The transmit loop runs on the calling thread, paced by the cycle
//! counter. Kernel TX timestamps arrive through the collector thread;
//! in round-trip mode a dedicated receive thread busy-polls the reply
//! socket and correlates replies back to their send timestamps.

use crate::analysis::{self, RunMode, RunSummary};
use crate::config::{CsvOptions, StatsSpec};
use crate::constants::{
    BATCH_SIZE, CHECK_INTERVAL_SECONDS, MAX_SEQUENCE_NUMBERS, ORIGINAL_PACKET_SIZE,
};
use crate::correlation::TxCorrelation;
use crate::csvlog::{CsvEntry, CsvKind, CsvSink, CsvWriter};
use crate::net::{self, BatchSender, SocketTuning};
use crate::rate::RateReporter;
use crate::runtime;
use crate::stats::{
    RunContext, StatsCollector, StatsEntry, TS_CLT_APP_RX, TS_CLT_APP_RX_TSC, TS_CLT_APP_TX,
    TS_CLT_APP_TX_TSC, TS_CLT_HW_RX, TS_CLT_KER_RX, TS_CLT_KER_TX,
};
use crate::tsc::{self, TscClock};
use crate::txstamp::TxCollector;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Client run parameters, validated by the CLI layer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: Ipv4Addr,
    pub port: u16,
    pub round_trip: bool,
    /// Target send rate in packets per second.
    pub pps: u64,
    pub packet_size: usize,
    pub interface: Option<String>,
    /// Run length in seconds; 0 runs until interrupted.
    pub duration_seconds: u64,
    pub csv: Option<CsvOptions>,
    pub stats: Option<StatsSpec>,
    pub json_summary: Option<PathBuf>,
    pub tx_cpu: Option<usize>,
    pub rx_cpu: Option<usize>,
    pub timestamp_cpu: Option<usize>,
    pub log_cpu: Option<usize>,
}

impl ClientConfig {
    fn mode(&self) -> RunMode {
        if self.round_trip {
            RunMode::ClientRoundTrip
        } else {
            RunMode::ClientOneWay
        }
    }
}

fn local_v4(socket: &UdpSocket) -> Result<SocketAddrV4> {
    match socket.local_addr().context("Failed to query local socket address")? {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(addr) => bail!("Expected an IPv4 socket, got {addr}"),
    }
}

/// Run the client until the duration elapses or shutdown is requested.
pub fn run(cfg: ClientConfig, ctx: Arc<RunContext>) -> Result<()> {
    let mode = cfg.mode();
    if cfg.pps == 0 {
        bail!("Send rate must be at least 1 packet per second");
    }
    if cfg.packet_size < ORIGINAL_PACKET_SIZE {
        bail!(
            "Packet size must be at least {} bytes to carry the payload",
            ORIGINAL_PACKET_SIZE
        );
    }

    runtime::lock_memory();
    let tsc_reliable = tsc::has_invariant_tsc();
    if !tsc_reliable {
        warn!("CPU does not advertise an invariant cycle counter; cycle timestamps disabled");
    }
    let freq_ghz = tsc::calibrate_cpu_freq();
    let clock = TscClock::new(freq_ghz);
    info!("Calibrated cycle counter: {:.3} GHz", freq_ghz);

    let dest = SocketAddrV4::new(cfg.server, cfg.port);
    let tx_socket = net::bound_udp_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    net::tune_socket(
        tx_socket.as_raw_fd(),
        &SocketTuning {
            incoming_cpu: None,
            zero_copy: true,
        },
    );
    if let Some(iface) = cfg.interface.as_deref() {
        net::bind_to_device(tx_socket.as_raw_fd(), iface)?;
    }
    tx_socket
        .connect(dest)
        .with_context(|| format!("Failed to connect to {dest}"))?;
    net::enable_tx_timestamping(tx_socket.as_raw_fd())?;
    let tx_local = local_v4(&tx_socket)?;
    info!("Sending to {dest} from {tx_local} ({})", mode.label());

    // Reply socket first: its port goes into every outbound payload.
    let rx_socket = if cfg.round_trip {
        let socket = net::bound_udp_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        net::tune_socket(
            socket.as_raw_fd(),
            &SocketTuning {
                incoming_cpu: cfg.rx_cpu,
                zero_copy: false,
            },
        );
        let hardware = net::enable_rx_timestamping(socket.as_raw_fd(), cfg.interface.as_deref())?;
        if !hardware {
            warn!("Replies will carry software receive timestamps only");
        }
        Some(socket)
    } else {
        None
    };
    let rx_port = match rx_socket.as_ref() {
        Some(socket) => local_v4(socket)?.port(),
        None => 0,
    };

    let stats = match cfg.stats {
        Some(spec) => Some(Arc::new(StatsCollector::new(spec.buffer_size)?)),
        None => None,
    };

    let (main_writer, tx_writer) = match cfg.csv.as_ref() {
        Some(paths) => {
            let main_kind = if cfg.round_trip {
                CsvKind::ClientMainRoundTrip
            } else {
                CsvKind::ClientMainOneWay
            };
            let main = CsvWriter::create(&paths.main, main_kind, cfg.log_cpu)?;
            let tx = CsvWriter::create(&paths.tx, CsvKind::ClientTx, cfg.log_cpu)?;
            info!("Logging packets to {:?} and {:?}", paths.main, paths.tx);
            (Some(main), Some(tx))
        }
        None => (None, None),
    };

    let tx_corr = Arc::new(TxCorrelation::new(MAX_SEQUENCE_NUMBERS)?);
    let collector = TxCollector::start(
        tx_socket.as_raw_fd(),
        stats.clone(),
        tx_writer.as_ref().map(|w| w.sink()),
        None,
        tx_local,
        TS_CLT_KER_TX,
        cfg.timestamp_cpu,
    )?;

    let rate_ctx = Arc::clone(&ctx);
    let reporter =
        RateReporter::start(Box::new(move || rate_ctx.packets_sent.load(Ordering::Relaxed)))?;
    let rate_state = reporter.state();

    let rx_thread = match rx_socket {
        Some(socket) => {
            let thread_ctx = Arc::clone(&ctx);
            let thread_stats = stats.clone();
            let thread_corr = Arc::clone(&tx_corr);
            let thread_sink = main_writer.as_ref().map(|w| w.sink());
            let rx_cpu = cfg.rx_cpu;
            Some(
                thread::Builder::new()
                    .name("client-rx".into())
                    .spawn(move || {
                        receive_loop(
                            socket, tx_local, clock, tsc_reliable, thread_ctx, thread_stats,
                            thread_corr, thread_sink, rx_cpu,
                        )
                    })
                    .context("Failed to spawn receive thread")?,
            )
        }
        None => None,
    };

    let start = Instant::now();
    transmit_loop(
        &cfg,
        mode,
        &tx_socket,
        tx_local,
        rx_port,
        &clock,
        tsc_reliable,
        &ctx,
        stats.as_deref(),
        &tx_corr,
        main_writer.as_ref().map(|w| w.sink()),
        &rate_state,
    )?;
    let elapsed = start.elapsed();

    // Drain order: stop producers, then the collector's final drain,
    // then the CSV writers.
    ctx.request_shutdown();
    reporter.stop();
    let kernel_ts = collector.stop();
    if let Some(handle) = rx_thread {
        if handle.join().is_err() {
            warn!("Receive thread panicked");
        }
    }
    if let Some(writer) = main_writer {
        writer.close();
    }
    if let Some(writer) = tx_writer {
        writer.close();
    }

    let sent = ctx.packets_sent.load(Ordering::Relaxed);
    let received = ctx.packets_received.load(Ordering::Relaxed);
    if let Some(stats) = stats.as_deref() {
        let spec = cfg.stats.unwrap_or_default();
        let mut result = analysis::analyze(stats, mode, &spec.into());
        analysis::display(&mut result);
        if let Some(path) = cfg.json_summary.as_deref() {
            let summary = RunSummary::build(&mut result, elapsed.as_secs(), sent, received);
            analysis::export_json(path, &summary)?;
            info!("Summary written to {path:?}");
        }
    }

    info!("");
    info!("Run complete after {:.1}s", elapsed.as_secs_f64());
    info!("  packets sent:         {sent}");
    if cfg.round_trip {
        info!("  replies received:     {received}");
    }
    info!("  kernel TX timestamps: {kernel_ts}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn transmit_loop(
    cfg: &ClientConfig,
    mode: RunMode,
    socket: &UdpSocket,
    local: SocketAddrV4,
    rx_port: u16,
    clock: &TscClock,
    tsc_reliable: bool,
    ctx: &RunContext,
    stats: Option<&StatsCollector>,
    tx_corr: &TxCorrelation,
    main_csv: Option<CsvSink>,
    rate_state: &crate::rate::RateState,
) -> Result<()> {
    runtime::enter_hot_thread(cfg.tx_cpu);
    let fd = socket.as_raw_fd();

    let batch = if cfg.pps >= BATCH_SIZE as u64 { BATCH_SIZE } else { 1 };
    let interval_ns = batch as f64 * 1_000_000_000.0 / cfg.pps as f64;
    let interval_cycles = clock.cycles_for_ns(interval_ns);
    let check_cycles = clock.cycles_for_ns(CHECK_INTERVAL_SECONDS * 1_000_000_000.0);
    let cycle_paced = interval_cycles > 0;

    let mut packets: Vec<Vec<u8>> = (0..batch).map(|_| vec![0u8; cfg.packet_size]).collect();
    let mut sender = BatchSender::new(batch);
    let mask = mode.timestamp_mask();

    let start = Instant::now();
    let mut seq: u32 = 0;
    let mut next_send = tsc::rdtsc().wrapping_add(interval_cycles);
    let mut pacer = tsc::CheckPacer::new(check_cycles, tsc::rdtsc());

    loop {
        for (i, packet) in packets.iter_mut().enumerate() {
            let pkt_seq = seq.wrapping_add(i as u32);
            packet[0..4].copy_from_slice(&pkt_seq.to_be_bytes());
            if cfg.round_trip {
                packet[4..8].copy_from_slice(&u32::from(rx_port).to_be_bytes());
            }
        }

        // Application timestamps captured as close to the send call
        // as possible; the whole batch shares them. Cycle counts stay
        // absent on machines without an invariant counter.
        let app_tx_tsc = tsc::capture_cycles(tsc_reliable);
        let app_tx_ns = tsc::wall_clock_ns();
        let sent = match sender.send(fd, &packets) {
            Ok(n) => n,
            Err(e) => {
                warn!("Batch send failed: {e}");
                0
            }
        };

        let tsc_ns = clock.to_wall_ns(app_tx_tsc);
        for i in 0..sent {
            let pkt_seq = seq.wrapping_add(i as u32);
            tx_corr.store(pkt_seq, app_tx_ns, tsc_ns);
            if let Some(stats) = stats {
                let mut entry = StatsEntry::minimal(pkt_seq, *local.ip(), local.port(), mask);
                entry.ts[TS_CLT_APP_TX_TSC] = tsc_ns;
                entry.ts[TS_CLT_APP_TX] = app_tx_ns;
                stats.push(&entry);
            }
            if !cfg.round_trip {
                if let Some(csv) = main_csv.as_ref() {
                    let mut entry = CsvEntry {
                        seq: pkt_seq,
                        src_ip: *local.ip(),
                        src_port: local.port(),
                        ..CsvEntry::default()
                    };
                    entry.ts[TS_CLT_APP_TX] = app_tx_ns;
                    csv.push(&entry);
                }
            }
        }
        seq = seq.wrapping_add(sent as u32);
        ctx.packets_sent.fetch_add(sent as u64, Ordering::Relaxed);

        if pacer.due(tsc::rdtsc()) {
            if ctx.is_shutdown() {
                break;
            }
            if cfg.duration_seconds > 0 && start.elapsed().as_secs() >= cfg.duration_seconds {
                break;
            }
            if let Some(pps) = rate_state.take_ready() {
                info!("TX rate: {pps} pps");
            }
        }

        if cycle_paced {
            tsc::wait_until_cycle(next_send);
            next_send = next_send.wrapping_add(interval_cycles);
        } else {
            thread::sleep(Duration::from_nanos(interval_ns as u64));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    socket: UdpSocket,
    local: SocketAddrV4,
    clock: TscClock,
    tsc_reliable: bool,
    ctx: Arc<RunContext>,
    stats: Option<Arc<StatsCollector>>,
    tx_corr: Arc<TxCorrelation>,
    main_csv: Option<CsvSink>,
    cpu: Option<usize>,
) {
    runtime::enter_hot_thread(cpu);
    let fd = socket.as_raw_fd();
    let mut buf = [0u8; crate::constants::MAX_PACKET_SIZE];

    while !ctx.is_shutdown() {
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
        let app_rx_tsc = tsc::capture_cycles(tsc_reliable);
        let app_rx_ns = tsc::wall_clock_ns();
        if packet.len < 4 {
            continue;
        }
        let seq = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        ctx.packets_received.fetch_add(1, Ordering::Relaxed);

        let rx_tsc_ns = clock.to_wall_ns(app_rx_tsc);
        if let Some(stats) = stats.as_deref() {
            stats.update_slots(
                seq,
                &[
                    (TS_CLT_HW_RX, packet.hw_rx_ns),
                    (TS_CLT_KER_RX, packet.ker_rx_ns),
                    (TS_CLT_APP_RX_TSC, rx_tsc_ns),
                    (TS_CLT_APP_RX, app_rx_ns),
                ],
            );
        }
        if let Some(csv) = main_csv.as_ref() {
            let mut entry = CsvEntry {
                seq,
                src_ip: *local.ip(),
                src_port: local.port(),
                ..CsvEntry::default()
            };
            if let Some(tx) = tx_corr.load(seq) {
                entry.ts[TS_CLT_APP_TX_TSC] = tx.app_tx_tsc;
                entry.ts[TS_CLT_APP_TX] = tx.app_tx_ns;
            }
            entry.ts[TS_CLT_HW_RX] = packet.hw_rx_ns;
            entry.ts[TS_CLT_KER_RX] = packet.ker_rx_ns;
            entry.ts[TS_CLT_APP_RX_TSC] = rx_tsc_ns;
            entry.ts[TS_CLT_APP_RX] = app_rx_ns;
            csv.push(&entry);
        }
    }
}
