//! Transmit-side strategy loops.
//!
//! Each loop allocates its buffers up front, prepares the kernel-facing
//! descriptors once, and then issues the syscall under test as tightly
//! as possible. Sequence stamping happens inside the loop when enabled;
//! that cost is part of what the tool measures.

use std::{io, mem, os::unix::io::AsRawFd};

use socket2::SockAddr;

use crate::buffers::{BatchBuffers, MsgBuf};
use crate::cmsg::{self, Encoder, CTRL_LEN};
use crate::seqhdr::SeqEncoder;
use crate::sock::BenchSocket;
use crate::stats::TimingRecord;
use crate::strategy::{check_res, Progress};
use crate::Config;

/// `send` on a connected socket.
pub(crate) fn flood_send(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
) -> io::Result<u64> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, 1, 1, false);
    let slot = &mut bufs.slots[0];
    let mut enc = cfg.embed_seq.then(SeqEncoder::new);
    let fd = sock.as_raw_fd();

    while rec.packets < cfg.count {
        if let Some(enc) = enc.as_mut() {
            enc.fill(slot.payload_mut());
        }
        // SAFETY: pointer/length pair is the live payload slot.
        let res = unsafe {
            libc::send(
                fd,
                slot.payload().as_ptr() as *const libc::c_void,
                slot.payload().len(),
                0,
            )
        };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// `sendto` with an explicit destination per call.
pub(crate) fn flood_sendto(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
) -> io::Result<u64> {
    let dest = cfg.dest.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "sendto needs a destination address",
        )
    })?;
    let addr = SockAddr::from(dest);
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, 1, 1, false);
    let slot = &mut bufs.slots[0];
    let mut enc = cfg.embed_seq.then(SeqEncoder::new);
    let fd = sock.as_raw_fd();

    while rec.packets < cfg.count {
        if let Some(enc) = enc.as_mut() {
            enc.fill(slot.payload_mut());
        }
        // SAFETY: payload and sockaddr stay live across the call.
        let res = unsafe {
            libc::sendto(
                fd,
                slot.payload().as_ptr() as *const libc::c_void,
                slot.payload().len(),
                0,
                addr.as_ptr() as *const libc::sockaddr,
                addr.len(),
            )
        };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// Points `hdr` at one message's destination, segment io-vector, and
/// (when a TTL override is configured) control buffer. The descriptors
/// are built once; only payload contents change between calls.
fn prepare_send_hdr(
    slot: &mut MsgBuf,
    dst: Option<&SockAddr>,
    iovs: &mut Vec<libc::iovec>,
    hdr: &mut libc::msghdr,
    ttl: Option<u32>,
    v6: bool,
) {
    *iovs = slot.iovecs();
    if let Some(dst) = dst {
        // SAFETY: sendmsg never writes through msg_name; the cast to a
        // mutable pointer only satisfies the shared struct definition.
        hdr.msg_name = dst.as_ptr() as *mut libc::c_void;
        hdr.msg_namelen = dst.len();
    }
    hdr.msg_iov = iovs.as_mut_ptr();
    hdr.msg_iovlen = iovs.len() as _;

    if let Some(ttl) = ttl {
        if let Some(ctrl) = slot.ctrl.as_mut() {
            hdr.msg_control = ctrl.0.as_mut_ptr() as _;
            hdr.msg_controllen = CTRL_LEN as _;
            // SAFETY: msg_control points at CTRL_LEN aligned writable bytes.
            let mut encoder = unsafe { Encoder::new(hdr) };
            cmsg::push_ttl(&mut encoder, v6, ttl);
            encoder.finish();
        }
    }
}

/// `sendmsg`: scatter-gather payload and optional TTL control message.
pub(crate) fn flood_sendmsg(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
) -> io::Result<u64> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, cfg.segments, 1, cfg.ttl.is_some());
    let dest = cfg.dest.map(SockAddr::from);
    let v6 = ipv6_path(sock, cfg)?;
    let mut enc = cfg.embed_seq.then(SeqEncoder::new);
    let fd = sock.as_raw_fd();

    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    let mut iovs = Vec::new();
    prepare_send_hdr(&mut bufs.slots[0], dest.as_ref(), &mut iovs, &mut hdr, cfg.ttl, v6);

    while rec.packets < cfg.count {
        if let Some(enc) = enc.as_mut() {
            enc.fill(bufs.slots[0].payload_mut());
        }
        // SAFETY: hdr points into buffers that outlive the loop.
        let res = unsafe { libc::sendmsg(fd, &hdr, 0) };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// `sendmmsg`: whole batches plus one remainder batch.
#[cfg(target_os = "linux")]
pub(crate) fn flood_sendmmsg(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
) -> io::Result<u64> {
    let batch = cfg.batch;
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, cfg.segments, batch, cfg.ttl.is_some());
    let dest = cfg.dest.map(SockAddr::from);
    let v6 = ipv6_path(sock, cfg)?;
    let mut enc = cfg.embed_seq.then(SeqEncoder::new);
    let fd = sock.as_raw_fd();

    let mut hdrs: Vec<libc::mmsghdr> = vec![unsafe { mem::zeroed() }; batch];
    let mut iov_store: Vec<Vec<libc::iovec>> = Vec::with_capacity(batch);
    for (slot, mmsg) in bufs.slots.iter_mut().zip(hdrs.iter_mut()) {
        let mut iovs = Vec::new();
        prepare_send_hdr(slot, dest.as_ref(), &mut iovs, &mut mmsg.msg_hdr, cfg.ttl, v6);
        // Moving the Vec into the store moves only its handle; the heap
        // block msg_iov points at stays put.
        iov_store.push(iovs);
    }

    let mut remaining = cfg.count;
    while remaining > 0 {
        let want = remaining.min(batch as u64) as usize;
        if let Some(enc) = enc.as_mut() {
            for slot in &mut bufs.slots[..want] {
                enc.fill(slot.payload_mut());
            }
        }
        // SAFETY: hdrs and everything they point at outlive the call.
        let res = unsafe { libc::sendmmsg(fd, hdrs.as_mut_ptr(), want as libc::c_uint, 0) };
        match check_res(res as isize, rec)? {
            Progress::Done(sent) => {
                for mmsg in &hdrs[..sent] {
                    rec.bytes += mmsg.msg_len as u64;
                }
                rec.packets += sent as u64;
                remaining -= sent as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn flood_sendmmsg(
    _sock: &BenchSocket,
    _cfg: &Config,
    _rec: &mut TimingRecord,
) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "sendmmsg is not available on this platform",
    ))
}

/// The address family the packets will travel as, for control-message
/// level selection.
fn ipv6_path(sock: &BenchSocket, cfg: &Config) -> io::Result<bool> {
    match cfg.dest {
        Some(dest) => Ok(dest.is_ipv6()),
        None => Ok(sock.local_addr()?.is_ipv6()),
    }
}
