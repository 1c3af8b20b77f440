//! Sequence headers embedded in benchmark payloads.
//!
//! Every transmitted datagram carries a 16-byte header tiled across the
//! whole payload: magic, sequence number, and the capture timestamp,
//! each big-endian on the wire. The receive side rebuilds the headers
//! from the scatter-gather segments of a datagram, including instances
//! that straddle a segment boundary.

use std::mem;

/// Wire magic, same value the kernel pktgen header carries, so a pktgen
/// flood can be pointed at the sink as well.
pub const SEQ_MAGIC: u32 = 0xbe9b_e955;

/// On-wire size of one [`SeqHeader`].
pub const SEQ_HDR_LEN: usize = 16;

/// The embedded per-datagram record: magic, monotonically increasing
/// sequence number, and the coarse real-time capture timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqHeader {
    pub magic: u32,
    pub seq: u32,
    pub ts_sec: u32,
    pub ts_nsec: u32,
}

impl SeqHeader {
    pub fn to_bytes(self) -> [u8; SEQ_HDR_LEN] {
        let mut out = [0u8; SEQ_HDR_LEN];
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ts_sec.to_be_bytes());
        out[12..16].copy_from_slice(&self.ts_nsec.to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; SEQ_HDR_LEN]) -> Self {
        let word = |i: usize| u32::from_be_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            magic: word(0),
            seq: word(4),
            ts_sec: word(8),
            ts_nsec: word(12),
        }
    }

    /// Timestamp as a (seconds, sub-seconds) pair for ordering.
    pub fn timestamp(&self) -> (u32, u32) {
        (self.ts_sec, self.ts_nsec)
    }
}

/// Samples the coarse real-time clock; coarse because the header stamp
/// sits inside the timed transmit loop and must stay cheap.
fn capture_time() -> (u32, u32) {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    #[cfg(target_os = "linux")]
    let clock = libc::CLOCK_REALTIME_COARSE;
    #[cfg(not(target_os = "linux"))]
    let clock = libc::CLOCK_REALTIME;
    // SAFETY: ts is a valid timespec out-pointer for the requested clock.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc == -1 {
        // clock_gettime on a supported clock id does not fail in practice
        return (0, 0);
    }
    (ts.tv_sec as u32, ts.tv_nsec as u32)
}

/// Stamps outgoing payloads with sequence headers.
///
/// The sequence counter lives here and increments once per filled
/// payload, so one encoder must be used for the whole run of a send
/// strategy.
#[derive(Debug, Default)]
pub struct SeqEncoder {
    next_seq: u32,
}

impl SeqEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the next header and tiles it across `buf` until the buffer
    /// is exhausted; the final copy is truncated when `buf.len()` is not
    /// a multiple of the header size. Returns the header written.
    pub fn fill(&mut self, buf: &mut [u8]) -> SeqHeader {
        let (ts_sec, ts_nsec) = capture_time();
        let hdr = SeqHeader {
            magic: SEQ_MAGIC,
            seq: self.next_seq,
            ts_sec,
            ts_nsec,
        };
        self.next_seq = self.next_seq.wrapping_add(1);

        let raw = hdr.to_bytes();
        for chunk in buf.chunks_mut(SEQ_HDR_LEN) {
            chunk.copy_from_slice(&raw[..chunk.len()]);
        }
        hdr
    }
}

/// Cursor over the scatter-gather segments of one received datagram,
/// exposing "read the next K bytes, possibly spanning segments" as a
/// single operation.
///
/// Segment boundaries are not aligned to header boundaries in general;
/// a read may take its first bytes from segment *i* and the remainder
/// from segment *i+1* (or further).
pub struct SegCursor<'a> {
    segs: &'a [&'a [u8]],
    seg: usize,
    off: usize,
    remaining: usize,
}

impl<'a> SegCursor<'a> {
    /// `len` bounds the logical stream: only the first `len` bytes of the
    /// concatenated segments are readable (a datagram rarely fills the
    /// whole buffer set).
    pub fn new(segs: &'a [&'a [u8]], len: usize) -> Self {
        let capacity: usize = segs.iter().map(|s| s.len()).sum();
        Self {
            segs,
            seg: 0,
            off: 0,
            remaining: len.min(capacity),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Copies exactly `out.len()` bytes from the stream, walking segment
    /// boundaries as needed. Returns `false` (consuming nothing further)
    /// when fewer bytes remain than requested.
    pub fn read(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.remaining {
            return false;
        }
        let mut filled = 0;
        while filled < out.len() {
            let seg = self.segs[self.seg];
            let avail = seg.len() - self.off;
            if avail == 0 {
                self.seg += 1;
                self.off = 0;
                continue;
            }
            let take = avail.min(out.len() - filled);
            out[filled..filled + take].copy_from_slice(&seg[self.off..self.off + take]);
            self.off += take;
            filled += take;
        }
        self.remaining -= out.len();
        true
    }
}

/// Iterator over every complete header instance in a received datagram.
///
/// Scanning stops when fewer bytes remain in the logical stream than one
/// header's size.
pub struct Headers<'a> {
    cursor: SegCursor<'a>,
}

/// Walks `len` received bytes spread over `segs` and yields each
/// complete [`SeqHeader`] instance in order.
pub fn headers<'a>(segs: &'a [&'a [u8]], len: usize) -> Headers<'a> {
    Headers {
        cursor: SegCursor::new(segs, len),
    }
}

impl Iterator for Headers<'_> {
    type Item = SeqHeader;

    fn next(&mut self) -> Option<SeqHeader> {
        let mut raw = [0u8; SEQ_HDR_LEN];
        if !self.cursor.read(&mut raw) {
            return None;
        }
        Some(SeqHeader::from_bytes(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(len: usize) -> (SeqHeader, Vec<u8>) {
        let mut enc = SeqEncoder::new();
        let mut buf = vec![0u8; len];
        let hdr = enc.fill(&mut buf);
        (hdr, buf)
    }

    #[test]
    fn roundtrip_single_segment() {
        let (hdr, buf) = filled(64);
        let segs = [&buf[..]];
        let first = headers(&segs, buf.len()).next().unwrap();
        assert_eq!(first, hdr);
        assert_eq!(first.magic, SEQ_MAGIC);
    }

    #[test]
    fn roundtrip_any_partition() {
        // Split points deliberately misaligned with the 16-byte header.
        let (hdr, buf) = filled(100);
        for split in 1..buf.len() {
            let segs = [&buf[..split], &buf[split..]];
            let first = headers(&segs, buf.len()).next().unwrap();
            assert_eq!(first, hdr, "split at {split}");
        }
    }

    #[test]
    fn roundtrip_many_tiny_segments() {
        let (hdr, buf) = filled(96);
        let segs: Vec<&[u8]> = buf.chunks(3).collect();
        let decoded: Vec<_> = headers(&segs, buf.len()).collect();
        assert_eq!(decoded.len(), 96 / SEQ_HDR_LEN);
        assert!(decoded.iter().all(|h| *h == hdr));
    }

    #[test]
    fn tiling_is_identical_when_divisible() {
        let (hdr, buf) = filled(160);
        let segs = [&buf[..]];
        let all: Vec<_> = headers(&segs, buf.len()).collect();
        assert_eq!(all.len(), 10);
        assert!(all.iter().all(|h| *h == hdr));
    }

    #[test]
    fn trailing_partial_header_not_yielded() {
        let (_, buf) = filled(40); // 2 full headers + 8 byte tail
        let segs = [&buf[..]];
        assert_eq!(headers(&segs, buf.len()).count(), 2);
    }

    #[test]
    fn payload_shorter_than_header_yields_nothing() {
        let (_, buf) = filled(10);
        let segs = [&buf[..]];
        assert_eq!(headers(&segs, buf.len()).count(), 0);
    }

    #[test]
    fn sequence_increments_per_fill() {
        let mut enc = SeqEncoder::new();
        let mut buf = [0u8; 16];
        let a = enc.fill(&mut buf);
        let b = enc.fill(&mut buf);
        assert_eq!(b.seq, a.seq + 1);
    }

    #[test]
    fn len_bounds_the_scan() {
        // Buffer holds 4 headers but only 2 were received.
        let (_, buf) = filled(64);
        let segs = [&buf[..]];
        assert_eq!(headers(&segs, 32).count(), 2);
    }
}
