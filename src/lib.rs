//! Measure UDP packet I/O syscall strategies against each other.
//!
//! One strategy exists per syscall under test (`send`/`sendto`/
//! `sendmsg`/`sendmmsg` on transmit, `read`/`recv`/`recvfrom`/`recvmsg`/
//! `recvmmsg` on receive), all sharing one contract so the driver can
//! swap them freely under identical traffic. Payloads carry a tiled
//! 16-byte sequence header so the high-throughput batched paths can be
//! checked for silent reordering, corruption and drops while they are
//! being timed with the cycle counter and the monotonic clock.
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

pub mod buffers;
mod cmsg;
pub mod driver;
pub mod pacer;
mod recv;
pub mod seqhdr;
mod send;
pub mod sock;
pub mod stats;
pub mod strategy;
pub mod verify;

pub use driver::{run_recv, run_send, RunReport, Violations};
pub use seqhdr::{SeqEncoder, SeqHeader, SEQ_HDR_LEN, SEQ_MAGIC};
pub use sock::BenchSocket;
pub use stats::{Stats, Timer, TimingRecord};
pub use strategy::{RecvStrategy, SendStrategy};
pub use verify::{VerifyLevel, VerifyState};

/// Destination port the tools agree on by default.
pub const DEFAULT_PORT: u16 = 6666;
/// Packets per timed run by default.
pub const DEFAULT_COUNT: u64 = 1_000_000;
/// Messages per multi-message syscall by default.
pub const DEFAULT_BATCH: usize = 32;

/// Immutable per-run benchmark parameters, built once from the CLI (or
/// a test) and read-only afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Packets to transfer per timed run.
    pub count: u64,
    /// Messages per syscall for the multi-message variants.
    pub batch: usize,
    /// Payload bytes per message; doubles as the receive buffer size.
    pub payload_sz: usize,
    /// Scatter-gather segments the payload is split into (msg variants).
    pub segments: usize,
    /// Timed repetitions of the selected strategy.
    pub repeat: usize,
    /// Run the socket non-blocking; would-block results count as retries.
    pub nonblocking: bool,
    /// Per-call timeout for `recvmmsg`.
    pub timeout: Option<Duration>,
    /// MSG_WAITFORONE: block for the first message, then take what is
    /// ready instead of filling the whole batch.
    pub wait_for_one: bool,
    /// Request and verify TTL/hop-limit metadata on received messages.
    pub want_ttl: bool,
    /// Request and verify destination-address metadata on received
    /// messages.
    pub want_pktinfo: bool,
    /// Stamp outgoing payloads with sequence headers.
    pub embed_seq: bool,
    /// How strictly received sequence headers are checked.
    pub verify: VerifyLevel,
    /// Compare every reported peer against the expected sender.
    pub validate_sender: bool,
    /// Expected sender; defaults to the warm-up packet's source.
    pub expect_sender: Option<SocketAddr>,
    /// Connect the socket to the first observed sender for the rest of
    /// the run.
    pub connect_to_sender: bool,
    /// Per-packet TTL override carried as a control message (msg send
    /// variants).
    pub ttl: Option<u32>,
    /// Explicit destination for the addressed send variants; `None`
    /// means the socket is already connected.
    pub dest: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            batch: DEFAULT_BATCH,
            payload_sz: 32,
            segments: 1,
            repeat: 1,
            nonblocking: false,
            timeout: None,
            wait_for_one: false,
            want_ttl: false,
            want_pktinfo: false,
            embed_seq: false,
            verify: VerifyLevel::Off,
            validate_sender: false,
            expect_sender: None,
            connect_to_sender: false,
            ttl: None,
            dest: None,
        }
    }
}

/// Metadata about one received message: how much arrived, who sent it,
/// and whatever ancillary records the kernel attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvMeta {
    /// Bytes stored into the payload buffers.
    pub len: usize,
    /// Peer address, for the variants that report one.
    pub addr: Option<SocketAddr>,
    /// TTL (v4) or hop limit (v6) of the arriving packet.
    pub ttl: Option<u32>,
    /// Destination IP the packet was addressed to.
    pub dst_ip: Option<IpAddr>,
    /// Interface index the packet arrived on.
    pub ifindex: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{check_res, Progress};
    use std::os::unix::io::AsRawFd;

    fn pair() -> (BenchSocket, BenchSocket, SocketAddr) {
        let sink = BenchSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = sink.local_addr().unwrap();
        let sender = BenchSocket::connected(dest).unwrap();
        (sink, sender, dest)
    }

    #[test]
    fn batched_transfer_accounts_whole_and_remainder_batches() {
        let (sink, sender, dest) = pair();

        let send_cfg = Config {
            count: 100,
            batch: 32,
            payload_sz: 32,
            embed_seq: true,
            dest: Some(dest),
            ..Config::default()
        };
        let mut rec = TimingRecord::default();
        let sent = SendStrategy::SendMmsg
            .run(&sender, &send_cfg, &mut rec)
            .unwrap();
        assert_eq!(sent, 100);
        assert_eq!(rec.bytes, 100 * 32);

        let recv_cfg = Config {
            count: 100,
            batch: 32,
            payload_sz: 32,
            verify: VerifyLevel::Order,
            ..Config::default()
        };
        let mut rec = TimingRecord::default();
        let mut state = VerifyState::new();
        let got = RecvStrategy::RecvMmsg
            .run(&sink, &recv_cfg, &mut rec, &mut state)
            .unwrap();
        assert_eq!(got, 100);
        assert_eq!(rec.packets, 100);
        assert_eq!(rec.retries, 0);
        assert_eq!(state.total_violations(), 0);
        // All 100 headers decoded; the last one seen is the last sent.
        assert_eq!(state.last.unwrap().seq, 99);
    }

    #[test]
    fn would_block_attempts_count_as_retries_not_transfers() {
        let (sink, sender, _) = pair();
        sink.set_nonblocking(true).unwrap();

        let mut rec = TimingRecord::default();
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            // SAFETY: buf is a live out-buffer for the call.
            let res = unsafe {
                libc::recv(
                    sink.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            match check_res(res as isize, &mut rec).unwrap() {
                Progress::Retry => {}
                Progress::Done(_) => panic!("empty socket must report would-block"),
            }
        }
        assert_eq!(rec.retries, 3);

        let send_cfg = Config {
            count: 2,
            payload_sz: 32,
            ..Config::default()
        };
        let mut send_rec = TimingRecord::default();
        SendStrategy::Send
            .run(&sender, &send_cfg, &mut send_rec)
            .unwrap();

        let recv_cfg = Config {
            count: 2,
            payload_sz: 32,
            nonblocking: true,
            ..Config::default()
        };
        let mut state = VerifyState::new();
        let got = RecvStrategy::Recv
            .run(&sink, &recv_cfg, &mut rec, &mut state)
            .unwrap();
        assert_eq!(got, 2);
        assert_eq!(rec.packets, 2);
        assert_eq!(rec.retries, 3);
    }

    #[test]
    fn recvmsg_run_validates_meta_and_sender() {
        let (sink, sender, dest) = pair();
        sink.enable_recv_meta(true, true).unwrap();

        // Warm-up packet plus five measured ones.
        let send_cfg = Config {
            count: 6,
            payload_sz: 64,
            embed_seq: true,
            dest: Some(dest),
            ..Config::default()
        };
        let mut rec = TimingRecord::default();
        SendStrategy::SendMsg
            .run(&sender, &send_cfg, &mut rec)
            .unwrap();

        let recv_cfg = Config {
            count: 5,
            repeat: 1,
            payload_sz: 64,
            segments: 3,
            verify: VerifyLevel::Exact,
            want_ttl: true,
            want_pktinfo: true,
            validate_sender: true,
            connect_to_sender: true,
            ..Config::default()
        };
        let (first, reports) = run_recv(&sink, &recv_cfg, RecvStrategy::RecvMsg).unwrap();
        assert_eq!(first, sender.local_addr().unwrap());
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.record.packets, 5);
        assert_eq!(report.violations.total(), 0);
        assert!(report.stats.pps > 0.0);
    }

    #[test]
    fn send_reports_cover_each_repeat() {
        let (sink, sender, _) = pair();
        let cfg = Config {
            count: 50,
            payload_sz: 32,
            repeat: 2,
            ..Config::default()
        };
        let reports = run_send(&sender, &cfg, SendStrategy::Send).unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert_eq!(report.record.packets, 50);
            assert_eq!(report.record.bytes, 50 * 32);
        }
        drop(sink);
    }
}
