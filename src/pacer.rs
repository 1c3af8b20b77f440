//! Paced transmit: clock out one batch of packets per fixed interval.
//!
//! A single auxiliary thread sleeps to absolute deadlines on the
//! monotonic clock and sends a batch at each wake-up. It shares nothing
//! with the spawning thread except a shutdown flag checked at interval
//! boundaries; the wake-up jitter accumulator is owned by the thread
//! and handed back on join.

use std::{
    io,
    os::unix::io::AsRawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::debug;

use crate::buffers::BatchBuffers;
use crate::seqhdr::SeqEncoder;
use crate::sock::BenchSocket;
use crate::stats::{monotonic_ns, NANOSEC_PER_SEC};

/// Wake-up jitter over a pacing run: how far past each absolute
/// deadline the thread actually woke.
#[derive(Debug, Default, Clone, Copy)]
pub struct JitterStats {
    pub intervals: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    sum_ns: u64,
}

impl JitterStats {
    fn record(&mut self, ns: u64) {
        if self.intervals == 0 {
            self.min_ns = ns;
            self.max_ns = ns;
        } else {
            self.min_ns = self.min_ns.min(ns);
            self.max_ns = self.max_ns.max(ns);
        }
        self.sum_ns += ns;
        self.intervals += 1;
    }

    pub fn avg_ns(&self) -> u64 {
        if self.intervals == 0 {
            0
        } else {
            self.sum_ns / self.intervals
        }
    }
}

/// Parameters of one pacing run.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Gap between batch starts.
    pub interval: Duration,
    /// Number of intervals to run before stopping on its own.
    pub batches: u64,
    /// Packets sent back-to-back at each wake-up.
    pub batch: usize,
    pub payload_sz: usize,
    pub embed_seq: bool,
}

/// Handle to a running pacer thread.
pub struct Pacer {
    handle: JoinHandle<io::Result<JitterStats>>,
    shutdown: Arc<AtomicBool>,
}

impl Pacer {
    /// Starts the pacing thread on a connected socket. The `shutdown`
    /// flag is typically registered with a signal handler; it is
    /// observed once per interval, never mid-batch.
    pub fn spawn(
        sock: BenchSocket,
        cfg: PacerConfig,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("pacer".into())
            .spawn(move || pace_loop(&sock, &cfg, &flag))?;
        Ok(Self { handle, shutdown })
    }

    /// Requests shutdown at the next interval boundary.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for the thread and returns its jitter accumulator.
    pub fn join(self) -> io::Result<JitterStats> {
        self.handle
            .join()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pacer thread panicked"))?
    }
}

fn pace_loop(
    sock: &BenchSocket,
    cfg: &PacerConfig,
    shutdown: &AtomicBool,
) -> io::Result<JitterStats> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, 1, 1, false);
    let mut enc = cfg.embed_seq.then(SeqEncoder::new);
    let fd = sock.as_raw_fd();
    let interval_ns = cfg.interval.as_nanos() as u64;
    let mut jitter = JitterStats::default();

    let mut next_wake = monotonic_ns() + interval_ns;
    for _ in 0..cfg.batches {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        sleep_until(next_wake);
        let woke = monotonic_ns();
        jitter.record(woke.saturating_sub(next_wake));
        next_wake += interval_ns;

        let slot = &mut bufs.slots[0];
        for _ in 0..cfg.batch {
            if let Some(enc) = enc.as_mut() {
                enc.fill(slot.payload_mut());
            }
            loop {
                // SAFETY: pointer/length pair is the live payload slot.
                let res = unsafe {
                    libc::send(
                        fd,
                        slot.payload().as_ptr() as *const libc::c_void,
                        slot.payload().len(),
                        0,
                    )
                };
                if res >= 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    // Queue full at this pace; the packet is lost, the
                    // schedule is not.
                    io::ErrorKind::WouldBlock => break,
                    _ => return Err(err),
                }
            }
        }
    }
    debug!(
        intervals = jitter.intervals,
        max_ns = jitter.max_ns,
        "pacer finished"
    );
    Ok(jitter)
}

/// Absolute-deadline sleep on the monotonic clock; EINTR wake-ups go
/// straight back to sleep against the same deadline.
fn sleep_until(deadline_ns: u64) {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / NANOSEC_PER_SEC) as libc::time_t,
        tv_nsec: (deadline_ns % NANOSEC_PER_SEC) as libc::c_long,
    };
    loop {
        // SAFETY: ts is a valid timespec; remainder pointer unused with
        // TIMER_ABSTIME.
        let rc = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if rc == 0 {
            break;
        }
        if rc == libc::EINTR {
            continue;
        }
        debug_assert_eq!(rc, 0, "clock_nanosleep failed");
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_accumulator_tracks_min_max_avg() {
        let mut j = JitterStats::default();
        j.record(10);
        j.record(30);
        j.record(20);
        assert_eq!(j.min_ns, 10);
        assert_eq!(j.max_ns, 30);
        assert_eq!(j.avg_ns(), 20);
        assert_eq!(j.intervals, 3);
    }

    #[test]
    fn pacer_sends_batches_and_joins() {
        let sink = BenchSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = sink.local_addr().unwrap();
        let sender = BenchSocket::connected(dest).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let pacer = Pacer::spawn(
            sender,
            PacerConfig {
                interval: Duration::from_millis(2),
                batches: 5,
                batch: 4,
                payload_sz: 18,
                embed_seq: false,
            },
            Arc::clone(&shutdown),
        )
        .unwrap();
        let jitter = pacer.join().unwrap();
        assert_eq!(jitter.intervals, 5);

        // 5 batches of 4 packets are now queued on the sink.
        sink.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 64];
        let mut got = 0;
        while sink.recv_from(&mut buf).is_ok() {
            got += 1;
        }
        assert_eq!(got, 20);
    }
}
