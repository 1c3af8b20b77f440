//! Timing bracket and derived per-packet statistics.
//!
//! A strategy invocation is bracketed by one [`Timer::start`] /
//! [`Timer::stop`] pair sampling both the free-running cycle counter and
//! the monotonic wall clock. The timer never loops or retries; deriving
//! packets/sec, ns/packet and cycles/packet happens afterwards from the
//! caller's [`TimingRecord`].

use std::mem;
use std::time::Instant;

pub const NANOSEC_PER_SEC: u64 = 1_000_000_000;

/// Free-running cycle counter sample (TSC).
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn cycles() -> u64 {
    // SAFETY: RDTSC is unprivileged and has no memory operands.
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Free-running cycle counter sample (virtual counter).
#[cfg(target_arch = "aarch64")]
#[inline]
pub fn cycles() -> u64 {
    let cnt: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0.
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) cnt, options(nomem, nostack));
    }
    cnt
}

/// No cheap cycle counter on this target; the wall-clock figures remain
/// valid, cycle figures read as zero.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
pub fn cycles() -> u64 {
    0
}

/// Monotonic clock in nanoseconds, for callers that need an absolute
/// timespec base (the paced sender's absolute-time sleeps).
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: ts is a valid timespec out-pointer.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * NANOSEC_PER_SEC + ts.tv_nsec as u64
}

/// Transfer counters filled in by a strategy while it runs.
///
/// `retries` counts transient would-block attempts; they are excluded
/// from `packets`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimingRecord {
    pub packets: u64,
    pub bytes: u64,
    pub retries: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Idle,
    Measuring,
}

/// Two-state timing bracket around one strategy invocation.
#[derive(Debug)]
pub struct Timer {
    state: State,
    cycles_start: u64,
    cycles_delta: u64,
    wall_start: Option<Instant>,
    wall_delta_ns: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            cycles_start: 0,
            cycles_delta: 0,
            wall_start: None,
            wall_delta_ns: 0,
        }
    }

    /// Idle → measuring. Samples the wall clock first and the cycle
    /// counter last so the cycle window excludes the clock read.
    pub fn start(&mut self) {
        assert_eq!(self.state, State::Idle, "timer already measuring");
        self.state = State::Measuring;
        self.wall_start = Some(Instant::now());
        self.cycles_start = cycles();
    }

    /// Measuring → idle, sampling in the reverse order of `start`.
    pub fn stop(&mut self) {
        let cycles_end = cycles();
        assert_eq!(self.state, State::Measuring, "timer not started");
        self.cycles_delta = cycles_end.wrapping_sub(self.cycles_start);
        self.wall_delta_ns = self
            .wall_start
            .take()
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        self.state = State::Idle;
    }

    /// Derives per-packet statistics from the last bracket. Only valid
    /// when idle. A record with zero packets yields all-zero stats
    /// rather than a division trap.
    pub fn calculate(&self, rec: &TimingRecord) -> Stats {
        assert_eq!(self.state, State::Idle, "calculate while measuring");
        let elapsed_secs = self.wall_delta_ns as f64 / NANOSEC_PER_SEC as f64;
        if rec.packets == 0 {
            return Stats {
                elapsed_secs,
                cycles: self.cycles_delta,
                ..Stats::default()
            };
        }
        Stats {
            pps: rec.packets as f64 / elapsed_secs.max(f64::MIN_POSITIVE),
            ns_per_pkt: self.wall_delta_ns as f64 / rec.packets as f64,
            cycles_per_pkt: self.cycles_delta / rec.packets,
            cycles: self.cycles_delta,
            elapsed_secs,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived figures for one timed strategy invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub pps: f64,
    pub ns_per_pkt: f64,
    pub cycles_per_pkt: u64,
    pub cycles: u64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_packets_is_defined() {
        let mut timer = Timer::new();
        timer.start();
        timer.stop();
        let stats = timer.calculate(&TimingRecord::default());
        assert_eq!(stats.pps, 0.0);
        assert_eq!(stats.ns_per_pkt, 0.0);
        assert_eq!(stats.cycles_per_pkt, 0);
    }

    #[test]
    fn derives_per_packet_figures() {
        let mut timer = Timer::new();
        timer.start();
        std::thread::sleep(std::time::Duration::from_millis(10));
        timer.stop();
        let rec = TimingRecord {
            packets: 1000,
            bytes: 32_000,
            retries: 0,
        };
        let stats = timer.calculate(&rec);
        assert!(stats.pps > 0.0);
        assert!(stats.ns_per_pkt >= 10_000_000.0 / 1000.0);
        assert!(stats.elapsed_secs >= 0.01);
    }

    #[test]
    #[should_panic(expected = "timer already measuring")]
    fn double_start_asserts() {
        let mut timer = Timer::new();
        timer.start();
        timer.start();
    }

    #[test]
    fn monotonic_ns_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
