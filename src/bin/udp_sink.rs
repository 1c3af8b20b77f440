//! UDP sink tool: benchmark the receive syscall strategies under a
//! flood, verifying sequence ordering, payload integrity, ancillary
//! metadata and sender identity as configured.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use udp_syscall_bench::{
    run_recv, BenchSocket, Config, RecvStrategy, RunReport, VerifyLevel, DEFAULT_BATCH,
    DEFAULT_COUNT, DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Benchmark UDP receive syscalls (read/recv/recvfrom/recvmsg/recvmmsg)", long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    listen_port: u16,

    /// Listen on IPv6 instead of IPv4
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Packets to receive per timed run
    #[arg(short, long, default_value_t = DEFAULT_COUNT)]
    count: u64,

    /// Timed repetitions per strategy
    #[arg(short, long, default_value_t = 2)]
    repeat: usize,

    /// Receive buffer size per message
    #[arg(short = 'm', long, default_value_t = 4096)]
    payload: usize,

    /// Messages per recvmmsg call
    #[arg(short, long, default_value_t = DEFAULT_BATCH)]
    batch: usize,

    /// Scatter-gather segments per message (recvmsg/recvmmsg)
    #[arg(long, default_value_t = 1)]
    segments: usize,

    /// Sequence verification level: off, order, exact or fatal
    #[arg(long, default_value = "off")]
    verify: VerifyLevel,

    /// Request and verify TTL metadata (recvmsg/recvmmsg)
    #[arg(long)]
    ttl: bool,

    /// Request and verify destination-address metadata (recvmsg/recvmmsg)
    #[arg(long)]
    pktinfo: bool,

    /// Validate every packet's sender against the first observed one
    #[arg(long)]
    validate_sender: bool,

    /// Connect to the first observed sender for the rest of the run
    #[arg(long)]
    connect: bool,

    /// Use a non-blocking socket; would-block attempts count as retries
    #[arg(long)]
    nonblock: bool,

    /// recvmmsg: return once at least one message is ready
    #[arg(long)]
    wait_for_one: bool,

    /// recvmmsg per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run a single strategy instead of all of them
    #[arg(long)]
    only: Option<RecvStrategy>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let listen: SocketAddr = if args.ipv6 {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), args.listen_port)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.listen_port)
    };
    let sock = BenchSocket::bind(listen).with_context(|| format!("cannot bind {listen}"))?;
    sock.enable_recv_meta(args.ttl, args.pktinfo)
        .context("cannot enable receive metadata options")?;

    let cfg = Config {
        count: args.count,
        batch: args.batch,
        payload_sz: args.payload,
        segments: args.segments,
        repeat: args.repeat,
        nonblocking: args.nonblock,
        timeout: args.timeout_ms.map(Duration::from_millis),
        wait_for_one: args.wait_for_one,
        want_ttl: args.ttl,
        want_pktinfo: args.pktinfo,
        verify: args.verify,
        validate_sender: args.validate_sender,
        connect_to_sender: args.connect,
        ..Config::default()
    };

    let strategies: Vec<RecvStrategy> = match args.only {
        Some(strategy) => vec![strategy],
        // Metadata, sender validation or multi-segment buffers rule out
        // the variants that cannot express them.
        None => RecvStrategy::ALL
            .into_iter()
            .filter(|s| {
                (!cfg.want_ttl && !cfg.want_pktinfo || s.supports_ancillary())
                    && (!cfg.validate_sender || s.supports_sender())
                    && (cfg.segments == 1 || s.supports_sg())
            })
            .collect(),
    };

    for strategy in strategies {
        println!("\nPerformance of: {}()", strategy.name());
        let (sender, reports) = run_recv(&sock, &cfg, strategy)
            .with_context(|| format!("{}() run failed", strategy.name()))?;
        println!(" - First sender: {sender}");
        for report in &reports {
            print_report(report, cfg.verify);
        }
    }
    Ok(())
}

fn print_report(report: &RunReport, verify: VerifyLevel) {
    println!(
        " - Per packet: {} cycles {:.2} ns, {:.2} pps (time:{:.2} sec)",
        report.stats.cycles_per_pkt, report.stats.ns_per_pkt, report.stats.pps,
        report.stats.elapsed_secs
    );
    println!(
        "   (packet count:{} bytes:{} retries:{} cycle_interval:{})",
        report.record.packets, report.record.bytes, report.record.retries, report.stats.cycles
    );
    if verify != VerifyLevel::Off {
        println!(
            "   (violations: out_of_order:{} bad_magic:{} inconsistent:{})",
            report.violations.out_of_order, report.violations.bad_magic,
            report.violations.inconsistent
        );
    }
}
