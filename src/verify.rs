//! Validation of received datagrams: sequence ordering, payload
//! integrity, ancillary metadata, and sender identity.
//!
//! The checker keeps no hidden globals. One [`VerifyState`] value is
//! threaded through a whole timed repeat (the "last header seen" must
//! survive across messages) and reset explicitly between repeats.

use std::{io, net::SocketAddr, str::FromStr};

use tracing::trace;

use crate::seqhdr::{self, SeqHeader, SEQ_MAGIC};
use crate::RecvMeta;

/// Sequence numbers above this are treated as "about to wrap": a small
/// sequence following one above the guard is a 32-bit wraparound, not a
/// reordering. Heuristic, not a protocol invariant.
pub const SEQ_WRAP_GUARD: u32 = 3_000_000_000;

/// How strictly received sequence headers are validated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerifyLevel {
    /// Headers are not inspected.
    #[default]
    Off,
    /// Count ordering violations, bad magic, inconsistent repeats.
    Order,
    /// Additionally require each sequence number to be exactly one
    /// greater than the previous message's.
    Exact,
    /// Any anomaly aborts the run instead of being counted.
    Fatal,
}

impl VerifyLevel {
    fn exact(self) -> bool {
        self >= VerifyLevel::Exact
    }
}

impl FromStr for VerifyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" | "0" => Ok(Self::Off),
            "order" | "1" => Ok(Self::Order),
            "exact" | "2" => Ok(Self::Exact),
            "fatal" | "3" => Ok(Self::Fatal),
            other => Err(format!(
                "unknown verify level {other:?} (off, order, exact, fatal)"
            )),
        }
    }
}

/// Running correctness state for one timed repeat.
#[derive(Debug, Default)]
pub struct VerifyState {
    /// Most recent valid first-header, carried across messages.
    pub last: Option<SeqHeader>,
    pub out_of_order: u64,
    pub bad_magic: u64,
    pub inconsistent: u64,
}

impl VerifyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears counters and the carried header; called between repeats.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total_violations(&self) -> u64 {
        self.out_of_order + self.bad_magic + self.inconsistent
    }

    /// Validates one received datagram given its scatter-gather segments
    /// and received length. The first decoded header carries the
    /// message's logical sequence number; every further instance must be
    /// byte-identical to the first.
    ///
    /// Messages shorter than one header are not an anomaly; there is
    /// nothing to check.
    pub fn observe(&mut self, segs: &[&[u8]], len: usize, level: VerifyLevel) -> io::Result<()> {
        if level == VerifyLevel::Off {
            return Ok(());
        }
        let mut iter = seqhdr::headers(segs, len);
        let Some(first) = iter.next() else {
            return Ok(());
        };

        let mut anomalies = 0u64;
        if first.magic != SEQ_MAGIC {
            self.bad_magic += 1;
            anomalies += 1;
            trace!(magic = first.magic, "bad sequence magic");
        } else {
            if let Some(last) = self.last {
                if out_of_order(&last, &first, level.exact()) {
                    self.out_of_order += 1;
                    anomalies += 1;
                    trace!(
                        last_seq = last.seq,
                        seq = first.seq,
                        "out-of-order sequence header"
                    );
                }
            }
            self.last = Some(first);
        }

        for repeat in iter {
            if repeat != first {
                self.inconsistent += 1;
                anomalies += 1;
            }
        }

        if anomalies > 0 && level == VerifyLevel::Fatal {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "sequence verification failed (seq {}, out_of_order {}, bad_magic {}, inconsistent {})",
                    first.seq, self.out_of_order, self.bad_magic, self.inconsistent
                ),
            ));
        }
        Ok(())
    }
}

/// Ordering semantics: earlier capture timestamp, or an earlier sequence
/// number at an equal timestamp, is out of order. A sequence that drops
/// from above [`SEQ_WRAP_GUARD`] to a small value is a counter wrap and
/// stays in order.
fn out_of_order(last: &SeqHeader, hdr: &SeqHeader, exact: bool) -> bool {
    if hdr.timestamp() < last.timestamp() {
        return true;
    }
    if exact && hdr.seq != last.seq.wrapping_add(1) {
        return true;
    }
    if hdr.timestamp() == last.timestamp() && hdr.seq < last.seq {
        return last.seq < SEQ_WRAP_GUARD;
    }
    false
}

/// Requested ancillary records must be present, unrequested ones absent;
/// either mismatch means the test setup (or the kernel path under test)
/// is broken and the run stops.
pub fn check_ancillary(meta: &RecvMeta, want_ttl: bool, want_pktinfo: bool) -> io::Result<()> {
    if want_ttl != meta.ttl.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            if want_ttl {
                "requested TTL metadata missing from received message"
            } else {
                "unrequested TTL metadata present on received message"
            },
        ));
    }
    if want_pktinfo != meta.dst_ip.is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            if want_pktinfo {
                "requested pktinfo metadata missing from received message"
            } else {
                "unrequested pktinfo metadata present on received message"
            },
        ));
    }
    Ok(())
}

/// Family-aware comparison of the observed peer against the expected
/// sender. A missing or different address is fatal.
pub fn check_sender(observed: Option<SocketAddr>, expected: SocketAddr) -> io::Result<()> {
    match observed {
        Some(addr) if addr == expected => Ok(()),
        Some(addr) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("sender mismatch: got {addr}, expected {expected}"),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("sender address missing, expected {expected}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(seq: u32, ts_sec: u32, ts_nsec: u32) -> SeqHeader {
        SeqHeader {
            magic: SEQ_MAGIC,
            seq,
            ts_sec,
            ts_nsec,
        }
    }

    fn observe_one(state: &mut VerifyState, h: SeqHeader, level: VerifyLevel) -> io::Result<()> {
        let raw = h.to_bytes();
        let segs = [&raw[..]];
        state.observe(&segs, raw.len(), level)
    }

    #[test]
    fn increasing_pairs_stay_in_order() {
        let mut state = VerifyState::new();
        for i in 0..100 {
            observe_one(&mut state, hdr(i, 10 + i / 10, i % 10), VerifyLevel::Order).unwrap();
        }
        assert_eq!(state.out_of_order, 0);
        assert_eq!(state.total_violations(), 0);
    }

    #[test]
    fn earlier_timestamp_counts_once_per_violation() {
        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(1, 100, 0), VerifyLevel::Order).unwrap();
        observe_one(&mut state, hdr(2, 99, 0), VerifyLevel::Order).unwrap();
        assert_eq!(state.out_of_order, 1);
        observe_one(&mut state, hdr(3, 100, 0), VerifyLevel::Order).unwrap();
        assert_eq!(state.out_of_order, 1);
    }

    #[test]
    fn equal_timestamp_earlier_seq_is_out_of_order() {
        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(10, 100, 5), VerifyLevel::Order).unwrap();
        observe_one(&mut state, hdr(9, 100, 5), VerifyLevel::Order).unwrap();
        assert_eq!(state.out_of_order, 1);
    }

    #[test]
    fn wraparound_above_guard_stays_in_order() {
        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(3_050_000_000, 100, 0), VerifyLevel::Order).unwrap();
        observe_one(&mut state, hdr(3, 100, 0), VerifyLevel::Order).unwrap();
        assert_eq!(state.out_of_order, 0);
    }

    #[test]
    fn exact_level_requires_increment_by_one() {
        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(1, 100, 0), VerifyLevel::Exact).unwrap();
        observe_one(&mut state, hdr(3, 100, 1), VerifyLevel::Exact).unwrap();
        assert_eq!(state.out_of_order, 1);

        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(1, 100, 0), VerifyLevel::Exact).unwrap();
        observe_one(&mut state, hdr(2, 100, 1), VerifyLevel::Exact).unwrap();
        assert_eq!(state.out_of_order, 0);
    }

    #[test]
    fn bad_magic_counted() {
        let mut state = VerifyState::new();
        let mut h = hdr(1, 100, 0);
        h.magic = 0xdead_beef;
        observe_one(&mut state, h, VerifyLevel::Order).unwrap();
        assert_eq!(state.bad_magic, 1);
        assert!(state.last.is_none());
    }

    #[test]
    fn inconsistent_repeats_counted() {
        let mut state = VerifyState::new();
        let first = hdr(7, 100, 0);
        let mut raw = Vec::new();
        raw.extend_from_slice(&first.to_bytes());
        raw.extend_from_slice(&hdr(8, 100, 0).to_bytes()); // differs from first
        raw.extend_from_slice(&first.to_bytes());
        let segs = [&raw[..]];
        state.observe(&segs, raw.len(), VerifyLevel::Order).unwrap();
        assert_eq!(state.inconsistent, 1);
    }

    #[test]
    fn fatal_level_errors_on_anomaly() {
        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(5, 100, 0), VerifyLevel::Fatal).unwrap();
        let err = observe_one(&mut state, hdr(6, 99, 0), VerifyLevel::Fatal).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn reset_clears_carried_state() {
        let mut state = VerifyState::new();
        observe_one(&mut state, hdr(1, 100, 0), VerifyLevel::Order).unwrap();
        observe_one(&mut state, hdr(2, 99, 0), VerifyLevel::Order).unwrap();
        state.reset();
        assert!(state.last.is_none());
        assert_eq!(state.total_violations(), 0);
    }

    #[test]
    fn sender_mismatch_detected() {
        let expected: SocketAddr = "10.0.0.1:6666".parse().unwrap();
        let other: SocketAddr = "10.0.0.2:6666".parse().unwrap();
        assert!(check_sender(Some(expected), expected).is_ok());
        assert!(check_sender(Some(other), expected).is_err());
        assert!(check_sender(None, expected).is_err());
    }

    #[test]
    fn ancillary_presence_must_match_request() {
        let mut meta = RecvMeta {
            ttl: Some(64),
            ..RecvMeta::default()
        };
        assert!(check_ancillary(&meta, true, false).is_ok());
        assert!(check_ancillary(&meta, false, false).is_err());
        meta.ttl = None;
        assert!(check_ancillary(&meta, true, false).is_err());
        assert!(check_ancillary(&meta, false, false).is_ok());
    }
}
