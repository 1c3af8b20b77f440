//! UDP pacer tool: clock out packet batches at a fixed interval and
//! report the wake-up jitter of the pacing thread.

use std::net::{IpAddr, SocketAddr};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use udp_syscall_bench::{
    pacer::{Pacer, PacerConfig},
    BenchSocket, DEFAULT_BATCH, DEFAULT_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Pace UDP packet batches out at a fixed interval", long_about = None)]
struct Args {
    /// Destination IP address (IPv4 or IPv6)
    addr: IpAddr,

    /// Destination UDP port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interval between batch starts, in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    /// Number of intervals to run
    #[arg(short, long, default_value_t = 30)]
    count: u64,

    /// Packets sent back-to-back per interval
    #[arg(short, long, default_value_t = DEFAULT_BATCH)]
    batch: usize,

    /// Payload size in bytes (18 + 14 eth + 8 UDP + 20 IP + 4 CRC = 64B)
    #[arg(short = 'm', long, default_value_t = 18)]
    payload: usize,

    /// Stamp payloads with sequence headers
    #[arg(long)]
    seq: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let dest = SocketAddr::new(args.addr, args.port);
    let sock = BenchSocket::connected(dest)
        .with_context(|| format!("cannot set up a socket towards {dest}"))?;

    // SIGINT/SIGTERM stop the pacer at the next interval boundary.
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("cannot register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("cannot register SIGTERM handler")?;

    println!(
        "Pacing {} batches of {} x {}B towards {dest}, one per {}ms",
        args.count, args.batch, args.payload, args.interval_ms
    );

    let pacer = Pacer::spawn(
        sock,
        PacerConfig {
            interval: Duration::from_millis(args.interval_ms),
            batches: args.count,
            batch: args.batch,
            payload_sz: args.payload,
            embed_seq: args.seq,
        },
        shutdown,
    )
    .context("cannot start pacer thread")?;

    let jitter = pacer.join().context("pacer run failed")?;
    println!(
        "Wake-up jitter over {} intervals: min:{} ns avg:{} ns max:{} ns",
        jitter.intervals,
        jitter.min_ns,
        jitter.avg_ns(),
        jitter.max_ns
    );
    Ok(())
}
