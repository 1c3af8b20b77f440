//! Orchestration of timed benchmark runs.
//!
//! The driver owns everything outside the tight syscall loops: strategy
//! validation against the configuration, the untimed warm-up receive,
//! repeat handling, and assembling per-repeat reports.

use std::{io, net::SocketAddr};

use tracing::{error, info};

use crate::sock::BenchSocket;
use crate::stats::{Stats, Timer, TimingRecord};
use crate::strategy::{RecvStrategy, SendStrategy};
use crate::verify::VerifyState;
use crate::Config;

/// Scratch space for the warm-up receive; large enough for any payload
/// the peer benchmark sends by default.
const WARMUP_BUF_SZ: usize = 4096;

/// Correctness counters accumulated over one timed repeat.
#[derive(Debug, Default, Clone, Copy)]
pub struct Violations {
    pub out_of_order: u64,
    pub bad_magic: u64,
    pub inconsistent: u64,
}

impl Violations {
    fn snapshot(state: &VerifyState) -> Self {
        Self {
            out_of_order: state.out_of_order,
            bad_magic: state.bad_magic,
            inconsistent: state.inconsistent,
        }
    }

    pub fn total(&self) -> u64 {
        self.out_of_order + self.bad_magic + self.inconsistent
    }
}

/// Everything one timed repeat produced.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub strategy: &'static str,
    pub repeat: usize,
    pub record: TimingRecord,
    pub stats: Stats,
    pub violations: Violations,
}

/// Runs a send strategy for each configured repeat and reports the
/// derived statistics.
pub fn run_send(
    sock: &BenchSocket,
    cfg: &Config,
    strategy: SendStrategy,
) -> io::Result<Vec<RunReport>> {
    validate_send(cfg, strategy)?;
    if cfg.nonblocking {
        sock.set_nonblocking(true)?;
    }

    let mut reports = Vec::with_capacity(cfg.repeat);
    for repeat in 0..cfg.repeat {
        info!(
            strategy = strategy.name(),
            repeat,
            count = cfg.count,
            "transmit run"
        );
        let mut rec = TimingRecord::default();
        let mut timer = Timer::new();
        timer.start();
        let res = strategy.run(sock, cfg, &mut rec);
        timer.stop();
        if let Err(err) = res {
            error!(
                strategy = strategy.name(),
                transferred = rec.packets,
                "send failed: {err}"
            );
            return Err(err);
        }
        reports.push(RunReport {
            strategy: strategy.name(),
            repeat,
            record: rec,
            stats: timer.calculate(&rec),
            violations: Violations::default(),
        });
    }
    Ok(reports)
}

/// Runs a receive strategy for each configured repeat.
///
/// One blocking receive happens before any timing to learn the first
/// sender's address; it is excluded from every measurement. The address
/// feeds the connect-to-sender policy and, when no explicit expected
/// sender is configured, sender validation. Returns the first sender
/// alongside the reports.
pub fn run_recv(
    sock: &BenchSocket,
    cfg: &Config,
    strategy: RecvStrategy,
) -> io::Result<(SocketAddr, Vec<RunReport>)> {
    validate_recv(cfg, strategy)?;

    let first = wait_first_packet(sock)?;
    let mut cfg = cfg.clone();
    if cfg.connect_to_sender {
        sock.connect(first)?;
    }
    if cfg.validate_sender && cfg.expect_sender.is_none() {
        cfg.expect_sender = Some(first);
    }
    if cfg.nonblocking {
        sock.set_nonblocking(true)?;
    }

    let mut state = VerifyState::new();
    let mut reports = Vec::with_capacity(cfg.repeat);
    for repeat in 0..cfg.repeat {
        info!(
            strategy = strategy.name(),
            repeat,
            count = cfg.count,
            "receive run"
        );
        state.reset();
        let mut rec = TimingRecord::default();
        let mut timer = Timer::new();
        timer.start();
        let res = strategy.run(sock, &cfg, &mut rec, &mut state);
        timer.stop();
        if let Err(err) = res {
            error!(
                strategy = strategy.name(),
                transferred = rec.packets,
                "receive failed: {err}"
            );
            return Err(err);
        }
        reports.push(RunReport {
            strategy: strategy.name(),
            repeat,
            record: rec,
            stats: timer.calculate(&rec),
            violations: Violations::snapshot(&state),
        });
    }
    Ok((first, reports))
}

/// Blocks until the first packet of the expected flood arrives.
fn wait_first_packet(sock: &BenchSocket) -> io::Result<SocketAddr> {
    let mut buf = [0u8; WARMUP_BUF_SZ];
    info!("waiting for first packet of the expected flood");
    loop {
        match sock.recv_from(&mut buf) {
            Ok((_, addr)) => {
                info!(sender = %addr, "got first packet, timing starts");
                return Ok(addr);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

fn validate_send(cfg: &Config, strategy: SendStrategy) -> io::Result<()> {
    if cfg.segments > 1 && !strategy.supports_sg() {
        return Err(invalid(format!(
            "{} cannot send a {}-segment payload; use sendmsg or sendmmsg",
            strategy.name(),
            cfg.segments
        )));
    }
    if cfg.ttl.is_some() && !strategy.supports_sg() {
        return Err(invalid(format!(
            "{} cannot carry a TTL control message; use sendmsg or sendmmsg",
            strategy.name()
        )));
    }
    Ok(())
}

fn validate_recv(cfg: &Config, strategy: RecvStrategy) -> io::Result<()> {
    if cfg.segments > 1 && !strategy.supports_sg() {
        return Err(invalid(format!(
            "{} cannot receive into {} segments; use recvmsg or recvmmsg",
            strategy.name(),
            cfg.segments
        )));
    }
    if (cfg.want_ttl || cfg.want_pktinfo) && !strategy.supports_ancillary() {
        return Err(invalid(format!(
            "{} does not deliver ancillary data; use recvmsg or recvmmsg",
            strategy.name()
        )));
    }
    if cfg.validate_sender && !strategy.supports_sender() {
        return Err(invalid(format!(
            "{} does not report the sender address; use recvfrom, recvmsg or recvmmsg",
            strategy.name()
        )));
    }
    Ok(())
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_impossible_combinations() {
        let cfg = Config {
            segments: 4,
            ..Config::default()
        };
        assert!(validate_send(&cfg, SendStrategy::SendTo).is_err());
        assert!(validate_send(&cfg, SendStrategy::SendMsg).is_ok());
        assert!(validate_recv(&cfg, RecvStrategy::Read).is_err());

        let cfg = Config {
            want_ttl: true,
            ..Config::default()
        };
        assert!(validate_recv(&cfg, RecvStrategy::RecvFrom).is_err());
        assert!(validate_recv(&cfg, RecvStrategy::RecvMsg).is_ok());

        let cfg = Config {
            validate_sender: true,
            ..Config::default()
        };
        assert!(validate_recv(&cfg, RecvStrategy::Recv).is_err());
        assert!(validate_recv(&cfg, RecvStrategy::RecvFrom).is_ok());
    }
}
