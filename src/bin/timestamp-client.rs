use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use udp_timestamp_probe::client::{self, ClientConfig};
use udp_timestamp_probe::config::{self, CsvOptions, StatsSpec};
use udp_timestamp_probe::stats::RunContext;

/// UDP latency probe client with hardware/kernel/application
/// timestamp capture.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Server IPv4 address to send to
    #[clap(short, long)]
    server: Ipv4Addr,

    /// Server UDP port
    #[clap(short, long, default_value_t = 4791)]
    port: u16,

    /// Send only; measure the transmit-side path
    #[clap(long)]
    one_way: bool,

    /// Send and receive echoed replies; measure the full round trip
    #[clap(long)]
    round_trip: bool,

    /// Target send rate in packets per second
    #[clap(long, default_value_t = 1000)]
    pps: u64,

    /// UDP payload size in bytes (12-1500)
    #[clap(long, default_value_t = 64)]
    packet_size: usize,

    /// Network interface for hardware timestamping (required for
    /// round-trip mode)
    #[clap(short, long)]
    interface: Option<String>,

    /// Run length in seconds; 0 runs until Ctrl-C
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Log per-packet timestamps to CSV (kernel TX timestamps go to a
    /// companion _tx.csv file)
    #[clap(long, num_args = 0..=1, default_missing_value = "timestamps.csv")]
    csv: Option<PathBuf>,

    /// Collect statistics: [count][K|M][,bw=<us>][,bn=<bins>]
    #[clap(long, num_args = 0..=1, default_missing_value = "")]
    stats: Option<String>,

    /// Write an end-of-run JSON summary to this file
    #[clap(long)]
    json_summary: Option<PathBuf>,

    /// Pin the transmit loop to this CPU
    #[clap(long)]
    tx_cpu: Option<usize>,

    /// Pin the reply receive thread to this CPU (round-trip only)
    #[clap(long)]
    rx_cpu: Option<usize>,

    /// Pin the kernel TX timestamp collector to this CPU
    #[clap(long)]
    timestamp_cpu: Option<usize>,

    /// Pin the CSV writer threads to this CPU
    #[clap(long)]
    log_cpu: Option<usize>,

    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long, default_value = "info")]
    log_level: String,

    /// Comma-separated per-component log filter, e.g.
    /// udp_timestamp_probe::csvlog=debug,udp_timestamp_probe::net=warn
    #[clap(long)]
    log_filter: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut logger = env_logger::Builder::from_default_env();
    logger.filter_level(config::parse_log_level(&args.log_level)?);
    if let Some(filter) = args.log_filter.as_deref() {
        logger.parse_filters(&config::parse_log_filter(filter)?);
    }
    logger.init();

    if args.one_way == args.round_trip {
        bail!("Specify exactly one of --one-way or --round-trip");
    }
    if args.port == 0 {
        bail!("Port 0 is not a valid destination");
    }
    if args.round_trip && args.interface.is_none() {
        bail!("Round-trip mode needs --interface for receive timestamping");
    }
    if args.one_way && args.rx_cpu.is_some() {
        bail!("--rx-cpu only applies to round-trip mode");
    }
    config::validate_packet_size(args.packet_size)?;

    let mut stats = match args.stats.as_deref() {
        Some(spec) => Some(config::parse_stats_spec(spec)?),
        None => None,
    };
    if args.json_summary.is_some() && stats.is_none() {
        stats = Some(StatsSpec::default());
    }

    let cfg = ClientConfig {
        server: args.server,
        port: args.port,
        round_trip: args.round_trip,
        pps: args.pps,
        packet_size: args.packet_size,
        interface: args.interface,
        duration_seconds: args.duration,
        csv: args.csv.map(CsvOptions::new),
        stats,
        json_summary: args.json_summary,
        tx_cpu: args.tx_cpu,
        rx_cpu: args.rx_cpu,
        timestamp_cpu: args.timestamp_cpu,
        log_cpu: args.log_cpu,
    };

    let ctx = RunContext::new();
    let handler_ctx = ctx.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        handler_ctx.request_shutdown();
    })
    .context("Failed to install Ctrl-C handler")?;

    client::run(cfg, ctx)
}
