//! Payload and descriptor memory for one strategy invocation.
//!
//! Everything a batch of messages needs is allocated up front, zeroed,
//! and owned here: one contiguous payload region per batch slot,
//! partitioned into the requested scatter-gather segments, plus the
//! optional control-message buffer and a peer-address slot. The raw
//! `msghdr`/`mmsghdr` views are built by the strategies per call; this
//! module only owns the memory they point into.

use std::mem;

use bytes::BytesMut;
use tracing::debug;

use crate::cmsg::{space_for_recv, Aligned, CTRL_LEN};

/// One logical message: payload, its segment partition, and the
/// per-message kernel-facing slots.
pub struct MsgBuf {
    payload: BytesMut,
    seg_lens: Vec<usize>,
    pub(crate) ctrl: Option<Box<Aligned<[u8; CTRL_LEN]>>>,
    pub(crate) name: libc::sockaddr_storage,
    /// Bytes the kernel reported for the last receive into this slot.
    pub recv_len: usize,
}

impl MsgBuf {
    fn alloc(payload_sz: usize, segments: usize, want_ctrl: bool) -> Self {
        let payload = BytesMut::zeroed(payload_sz);
        let per = payload_sz / segments;
        let mut seg_lens = vec![per; segments];
        // Equal partition; the tail segment absorbs the remainder.
        seg_lens[segments - 1] += payload_sz % segments;

        let ctrl = want_ctrl.then(|| Box::new(Aligned([0u8; CTRL_LEN])));
        Self {
            payload,
            seg_lens,
            ctrl,
            // SAFETY: all-zeroes is a valid sockaddr_storage (AF_UNSPEC).
            name: unsafe { mem::zeroed() },
            recv_len: 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Borrowed view of the segment partition, for scanning a received
    /// datagram as one logical byte stream.
    pub fn segments(&self) -> Vec<&[u8]> {
        let mut out = Vec::with_capacity(self.seg_lens.len());
        let mut off = 0;
        for &len in &self.seg_lens {
            out.push(&self.payload[off..off + len]);
            off += len;
        }
        out
    }

    /// io-vector over the segment partition. The pointers alias
    /// `self.payload`; the vector must not outlive `self` or overlap a
    /// reallocation of the payload.
    pub(crate) fn iovecs(&mut self) -> Vec<libc::iovec> {
        let base = self.payload.as_mut_ptr();
        let mut out = Vec::with_capacity(self.seg_lens.len());
        let mut off = 0;
        for &len in &self.seg_lens {
            out.push(libc::iovec {
                // SAFETY: off + len stays within the payload allocation.
                iov_base: unsafe { base.add(off) } as *mut libc::c_void,
                iov_len: len,
            });
            off += len;
        }
        out
    }
}

/// All message buffers for one strategy invocation: `batch` slots for
/// the multi-message variants, a single slot for the rest.
pub struct BatchBuffers {
    pub slots: Vec<MsgBuf>,
}

impl BatchBuffers {
    /// Allocates and zeroes `batch` message slots.
    ///
    /// # Panics
    /// On zero `batch`/`segments`, or a payload too small to partition.
    /// Allocation failure aborts the process; this is a measurement tool
    /// and out-of-memory is not a recoverable condition for it.
    pub fn alloc(payload_sz: usize, segments: usize, batch: usize, want_ctrl: bool) -> Self {
        assert!(batch >= 1, "batch must be at least 1");
        assert!(segments >= 1, "segment count must be at least 1");
        assert!(
            payload_sz >= segments,
            "payload of {payload_sz} bytes cannot be split into {segments} segments"
        );
        if want_ctrl {
            assert!(
                space_for_recv() <= CTRL_LEN,
                "control message buffer too small for requested records"
            );
        }

        let slots = (0..batch)
            .map(|_| MsgBuf::alloc(payload_sz, segments, want_ctrl))
            .collect();
        debug!(
            payload_sz,
            segments, batch, want_ctrl, "allocated batch buffers"
        );
        Self { slots }
    }

    pub fn batch(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_payload() {
        let bufs = BatchBuffers::alloc(100, 3, 2, false);
        let slot = &bufs.slots[0];
        let segs = slot.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs.iter().map(|s| s.len()).sum::<usize>(), 100);
        // 100 / 3 = 33, remainder to the tail
        assert_eq!(segs[0].len(), 33);
        assert_eq!(segs[2].len(), 34);
    }

    #[test]
    fn payload_zero_initialized() {
        let bufs = BatchBuffers::alloc(64, 1, 1, false);
        assert!(bufs.slots[0].payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn iovecs_match_partition() {
        let mut bufs = BatchBuffers::alloc(64, 4, 1, false);
        let iovs = bufs.slots[0].iovecs();
        assert_eq!(iovs.len(), 4);
        assert!(iovs.iter().all(|io| io.iov_len == 16));
    }

    #[test]
    #[should_panic(expected = "cannot be split")]
    fn rejects_oversplit_payload() {
        BatchBuffers::alloc(2, 3, 1, false);
    }
}
