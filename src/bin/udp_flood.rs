//! UDP flood tool: benchmark the transmit syscall strategies against
//! one destination under identical traffic.

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use clap::Parser;

use udp_syscall_bench::{
    run_send, BenchSocket, Config, RunReport, SendStrategy, DEFAULT_BATCH, DEFAULT_COUNT,
    DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Benchmark UDP transmit syscalls (send/sendto/sendmsg/sendmmsg)", long_about = None)]
struct Args {
    /// Destination IP address (IPv4 or IPv6)
    addr: IpAddr,

    /// Destination UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Packets to send per timed run
    #[arg(short, long, default_value_t = DEFAULT_COUNT)]
    count: u64,

    /// Payload size in bytes (32 + 8 UDP + 20 IP + 4 CRC = 64B frames)
    #[arg(short = 'm', long, default_value_t = 32)]
    payload: usize,

    /// Messages per sendmmsg call
    #[arg(short, long, default_value_t = DEFAULT_BATCH)]
    batch: usize,

    /// Timed repetitions per strategy
    #[arg(short, long, default_value_t = 1)]
    repeat: usize,

    /// Scatter-gather segments per message (sendmsg/sendmmsg)
    #[arg(long, default_value_t = 1)]
    segments: usize,

    /// Stamp payloads with sequence headers for sink-side verification
    #[arg(long)]
    seq: bool,

    /// Per-packet TTL carried as a control message (sendmsg/sendmmsg)
    #[arg(long)]
    ttl: Option<u32>,

    /// Use a non-blocking socket; would-block attempts count as retries
    #[arg(long)]
    nonblock: bool,

    /// Run a single strategy instead of all of them
    #[arg(long)]
    only: Option<SendStrategy>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let dest = SocketAddr::new(args.addr, args.port);
    let sock = BenchSocket::connected(dest)
        .with_context(|| format!("cannot set up a socket towards {dest}"))?;

    let cfg = Config {
        count: args.count,
        batch: args.batch,
        payload_sz: args.payload,
        segments: args.segments,
        repeat: args.repeat,
        nonblocking: args.nonblock,
        embed_seq: args.seq,
        ttl: args.ttl,
        dest: Some(dest),
        ..Config::default()
    };

    let strategies: Vec<SendStrategy> = match args.only {
        Some(strategy) => vec![strategy],
        // A multi-segment payload or a TTL override narrows the field to
        // the strategies that can express them.
        None => SendStrategy::ALL
            .into_iter()
            .filter(|s| s.supports_sg() || (cfg.segments == 1 && cfg.ttl.is_none()))
            .collect(),
    };

    for strategy in strategies {
        println!("\nPerformance of: {}()", strategy.name());
        let reports = run_send(&sock, &cfg, strategy)
            .with_context(|| format!("{}() run failed", strategy.name()))?;
        for report in &reports {
            print_report(report);
        }
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        " - Per packet: {} cycles {:.2} ns, {:.2} pps (time:{:.2} sec)",
        report.stats.cycles_per_pkt, report.stats.ns_per_pkt, report.stats.pps,
        report.stats.elapsed_secs
    );
    println!(
        "   (packet count:{} bytes:{} retries:{} cycle_interval:{})",
        report.record.packets, report.record.bytes, report.record.retries, report.stats.cycles
    );
}
