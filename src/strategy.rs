//! The closed set of send/receive syscall strategies under benchmark.
//!
//! Every strategy shares one contract: transfer `cfg.count` messages,
//! maintain the caller's [`TimingRecord`] as it goes, and return the
//! number of messages actually transferred. Transient would-block
//! results are counted as retries and never as transfers; any other
//! syscall failure ends the run with the record still reporting how far
//! it got.

use std::{io, str::FromStr};

use crate::sock::BenchSocket;
use crate::stats::TimingRecord;
use crate::verify::VerifyState;
use crate::{recv, send, Config};

/// Transmit-side syscall variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStrategy {
    /// `send` on a connected socket; no addressing, no scatter-gather.
    Send,
    /// `sendto` with an explicit destination per call.
    SendTo,
    /// `sendmsg`: scatter-gather segments and optional control messages.
    SendMsg,
    /// `sendmmsg`: up to `batch` messages per syscall.
    SendMmsg,
}

impl SendStrategy {
    pub const ALL: [Self; 4] = [Self::Send, Self::SendTo, Self::SendMsg, Self::SendMmsg];

    pub fn name(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::SendTo => "sendto",
            Self::SendMsg => "sendmsg",
            Self::SendMmsg => "sendmmsg",
        }
    }

    /// Whether the variant can express a multi-segment payload.
    pub fn supports_sg(self) -> bool {
        matches!(self, Self::SendMsg | Self::SendMmsg)
    }

    pub fn run(
        self,
        sock: &BenchSocket,
        cfg: &Config,
        rec: &mut TimingRecord,
    ) -> io::Result<u64> {
        match self {
            Self::Send => send::flood_send(sock, cfg, rec),
            Self::SendTo => send::flood_sendto(sock, cfg, rec),
            Self::SendMsg => send::flood_sendmsg(sock, cfg, rec),
            Self::SendMmsg => send::flood_sendmmsg(sock, cfg, rec),
        }
    }
}

impl FromStr for SendStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send" => Ok(Self::Send),
            "sendto" => Ok(Self::SendTo),
            "sendmsg" => Ok(Self::SendMsg),
            "sendmmsg" => Ok(Self::SendMmsg),
            other => Err(format!("unknown send strategy {other:?}")),
        }
    }
}

/// Receive-side syscall variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStrategy {
    /// Plain `read` on the socket descriptor.
    Read,
    /// `recv`; like `read` with socket flags available.
    Recv,
    /// `recvfrom`, capturing the peer address.
    RecvFrom,
    /// `recvmsg`: scatter-gather, peer address, control messages.
    RecvMsg,
    /// `recvmmsg`: up to `batch` messages per syscall, optional
    /// wait-for-one mode and per-call timeout.
    RecvMmsg,
}

impl RecvStrategy {
    pub const ALL: [Self; 5] = [
        Self::Read,
        Self::Recv,
        Self::RecvFrom,
        Self::RecvMsg,
        Self::RecvMmsg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Recv => "recv",
            Self::RecvFrom => "recvfrom",
            Self::RecvMsg => "recvmsg",
            Self::RecvMmsg => "recvmmsg",
        }
    }

    /// Whether the variant delivers ancillary data (and so can satisfy a
    /// TTL/pktinfo verification request).
    pub fn supports_ancillary(self) -> bool {
        matches!(self, Self::RecvMsg | Self::RecvMmsg)
    }

    /// Whether the variant reports the sender's address.
    pub fn supports_sender(self) -> bool {
        matches!(self, Self::RecvFrom | Self::RecvMsg | Self::RecvMmsg)
    }

    /// Whether the variant can express a multi-segment payload.
    pub fn supports_sg(self) -> bool {
        matches!(self, Self::RecvMsg | Self::RecvMmsg)
    }

    pub fn run(
        self,
        sock: &BenchSocket,
        cfg: &Config,
        rec: &mut TimingRecord,
        verify: &mut VerifyState,
    ) -> io::Result<u64> {
        match self {
            Self::Read => recv::sink_read(sock, cfg, rec, verify),
            Self::Recv => recv::sink_recv(sock, cfg, rec, verify),
            Self::RecvFrom => recv::sink_recvfrom(sock, cfg, rec, verify),
            Self::RecvMsg => recv::sink_recvmsg(sock, cfg, rec, verify),
            Self::RecvMmsg => recv::sink_recvmmsg(sock, cfg, rec, verify),
        }
    }
}

impl FromStr for RecvStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "recv" => Ok(Self::Recv),
            "recvfrom" => Ok(Self::RecvFrom),
            "recvmsg" => Ok(Self::RecvMsg),
            "recvmmsg" => Ok(Self::RecvMmsg),
            other => Err(format!("unknown recv strategy {other:?}")),
        }
    }
}

/// Outcome of one syscall attempt inside a strategy loop.
pub(crate) enum Progress {
    /// Syscall transferred something; value is its non-negative return.
    Done(usize),
    /// Transient condition; retry without consuming a packet slot.
    Retry,
}

/// Maps a raw syscall return to [`Progress`], counting would-block
/// retries in the record. EINTR retries are not counted; they are not a
/// "no data ready" signal. Any other failure propagates.
pub(crate) fn check_res(res: isize, rec: &mut TimingRecord) -> io::Result<Progress> {
    if res >= 0 {
        return Ok(Progress::Done(res as usize));
    }
    let err = io::Error::last_os_error();
    match err.kind() {
        io::ErrorKind::Interrupted => Ok(Progress::Retry),
        io::ErrorKind::WouldBlock => {
            rec.retries += 1;
            Ok(Progress::Retry)
        }
        _ => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_parse_back() {
        for s in SendStrategy::ALL {
            assert_eq!(s.name().parse::<SendStrategy>().unwrap(), s);
        }
        for s in RecvStrategy::ALL {
            assert_eq!(s.name().parse::<RecvStrategy>().unwrap(), s);
        }
    }

    #[test]
    fn capability_matrix() {
        assert!(!RecvStrategy::Read.supports_sender());
        assert!(RecvStrategy::RecvFrom.supports_sender());
        assert!(!RecvStrategy::RecvFrom.supports_ancillary());
        assert!(RecvStrategy::RecvMmsg.supports_ancillary());
        assert!(!SendStrategy::SendTo.supports_sg());
        assert!(SendStrategy::SendMsg.supports_sg());
    }
}
