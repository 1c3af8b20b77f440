//! Receive-side strategy loops.
//!
//! Buffers and descriptors are prepared before the loop; inside it, each
//! received message is handed straight to the correctness checker
//! (sequence headers, ancillary metadata, sender identity) before the
//! next syscall is issued.

use std::{io, mem, os::unix::io::AsRawFd, ptr};

use crate::buffers::{BatchBuffers, MsgBuf};
use crate::cmsg::{self, CTRL_LEN};
use crate::sock::{decode_sockaddr, BenchSocket};
use crate::stats::TimingRecord;
use crate::strategy::{check_res, Progress};
use crate::verify::{self, VerifyState};
use crate::{Config, RecvMeta};

/// Post-receive checks shared by all variants. `has_cmsg`/`has_sender`
/// describe what the syscall variant can deliver, not what was
/// requested.
fn inspect(
    slot: &MsgBuf,
    len: usize,
    meta: &RecvMeta,
    cfg: &Config,
    state: &mut VerifyState,
    has_cmsg: bool,
    has_sender: bool,
) -> io::Result<()> {
    let segs = slot.segments();
    state.observe(&segs, len, cfg.verify)?;
    if has_cmsg {
        verify::check_ancillary(meta, cfg.want_ttl, cfg.want_pktinfo)?;
    }
    if has_sender && cfg.validate_sender {
        if let Some(expected) = cfg.expect_sender {
            verify::check_sender(meta.addr, expected)?;
        }
    }
    Ok(())
}

/// Plain `read` on the descriptor.
pub(crate) fn sink_read(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
    state: &mut VerifyState,
) -> io::Result<u64> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, 1, 1, false);
    let fd = sock.as_raw_fd();

    while rec.packets < cfg.count {
        let slot = &mut bufs.slots[0];
        // SAFETY: pointer/length pair is the live payload slot.
        let res = unsafe {
            libc::read(
                fd,
                slot.payload_mut().as_mut_ptr() as *mut libc::c_void,
                cfg.payload_sz,
            )
        };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                slot.recv_len = n;
                let meta = RecvMeta {
                    len: n,
                    ..RecvMeta::default()
                };
                inspect(&bufs.slots[0], n, &meta, cfg, state, false, false)?;
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// `recv` with zero flags.
pub(crate) fn sink_recv(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
    state: &mut VerifyState,
) -> io::Result<u64> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, 1, 1, false);
    let fd = sock.as_raw_fd();

    while rec.packets < cfg.count {
        let slot = &mut bufs.slots[0];
        // SAFETY: pointer/length pair is the live payload slot.
        let res = unsafe {
            libc::recv(
                fd,
                slot.payload_mut().as_mut_ptr() as *mut libc::c_void,
                cfg.payload_sz,
                0,
            )
        };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                slot.recv_len = n;
                let meta = RecvMeta {
                    len: n,
                    ..RecvMeta::default()
                };
                inspect(&bufs.slots[0], n, &meta, cfg, state, false, false)?;
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// `recvfrom`, capturing the peer address per datagram.
pub(crate) fn sink_recvfrom(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
    state: &mut VerifyState,
) -> io::Result<u64> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, 1, 1, false);
    let fd = sock.as_raw_fd();
    // SAFETY: all-zeroes is a valid sockaddr_storage.
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };

    while rec.packets < cfg.count {
        let slot = &mut bufs.slots[0];
        let mut name_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: payload and name slots stay live across the call.
        let res = unsafe {
            libc::recvfrom(
                fd,
                slot.payload_mut().as_mut_ptr() as *mut libc::c_void,
                cfg.payload_sz,
                0,
                &mut name as *mut _ as *mut libc::sockaddr,
                &mut name_len,
            )
        };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                slot.recv_len = n;
                let meta = RecvMeta {
                    len: n,
                    addr: decode_sockaddr(&name, name_len),
                    ..RecvMeta::default()
                };
                inspect(&bufs.slots[0], n, &meta, cfg, state, false, true)?;
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// Points `hdr` at one slot's address slot, segment io-vector, and
/// control buffer, for `recvmsg`/`recvmmsg`.
fn prepare_recv_hdr(slot: &mut MsgBuf, iovs: &mut Vec<libc::iovec>, hdr: &mut libc::msghdr) {
    *iovs = slot.iovecs();
    hdr.msg_name = &mut slot.name as *mut _ as *mut libc::c_void;
    hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
    hdr.msg_iov = iovs.as_mut_ptr();
    hdr.msg_iovlen = iovs.len() as _;
    if let Some(ctrl) = slot.ctrl.as_mut() {
        hdr.msg_control = ctrl.0.as_mut_ptr() as _;
        hdr.msg_controllen = CTRL_LEN as _;
    }
    hdr.msg_flags = 0;
}

/// The kernel shrinks the name/control lengths to what it wrote; they
/// must be restored before the descriptor is reused.
fn rearm_recv_hdr(hdr: &mut libc::msghdr, has_ctrl: bool) {
    hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as _;
    if has_ctrl {
        hdr.msg_controllen = CTRL_LEN as _;
    }
    hdr.msg_flags = 0;
}

/// Decodes peer address and control messages the kernel attached to one
/// received message.
fn decode_recv_meta(slot: &MsgBuf, hdr: &libc::msghdr, len: usize) -> RecvMeta {
    let mut meta = RecvMeta {
        len,
        ..RecvMeta::default()
    };
    if !hdr.msg_control.is_null() && hdr.msg_controllen > 0 {
        // SAFETY: the kernel initialized `msg_controllen` bytes of cmsgs.
        for entry in unsafe { cmsg::Iter::new(hdr) } {
            // SAFETY: level/type of a kernel cmsg describe its payload.
            match unsafe { cmsg::parse(entry) } {
                cmsg::Parsed::Ttl(ttl) => meta.ttl = Some(ttl),
                cmsg::Parsed::PktInfo { dst, ifindex } => {
                    meta.dst_ip = Some(dst);
                    meta.ifindex = ifindex;
                }
                cmsg::Parsed::Other => {}
            }
        }
    }
    meta.addr = decode_sockaddr(&slot.name, hdr.msg_namelen);
    meta
}

/// `recvmsg`: scatter-gather, peer address, ancillary data.
pub(crate) fn sink_recvmsg(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
    state: &mut VerifyState,
) -> io::Result<u64> {
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, cfg.segments, 1, true);
    let fd = sock.as_raw_fd();

    let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
    let mut iovs = Vec::new();
    prepare_recv_hdr(&mut bufs.slots[0], &mut iovs, &mut hdr);

    while rec.packets < cfg.count {
        rearm_recv_hdr(&mut hdr, true);
        // SAFETY: hdr points into buffers that outlive the loop.
        let res = unsafe { libc::recvmsg(fd, &mut hdr, 0) };
        match check_res(res as isize, rec)? {
            Progress::Done(n) => {
                let slot = &mut bufs.slots[0];
                slot.recv_len = n;
                let meta = decode_recv_meta(slot, &hdr, n);
                inspect(&bufs.slots[0], n, &meta, cfg, state, true, true)?;
                rec.packets += 1;
                rec.bytes += n as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

/// `recvmmsg`: batched receive with wait-for-one and per-call timeout.
#[cfg(target_os = "linux")]
pub(crate) fn sink_recvmmsg(
    sock: &BenchSocket,
    cfg: &Config,
    rec: &mut TimingRecord,
    state: &mut VerifyState,
) -> io::Result<u64> {
    let batch = cfg.batch;
    let mut bufs = BatchBuffers::alloc(cfg.payload_sz, cfg.segments, batch, true);
    let fd = sock.as_raw_fd();

    let mut hdrs: Vec<libc::mmsghdr> = vec![unsafe { mem::zeroed() }; batch];
    let mut iov_store: Vec<Vec<libc::iovec>> = Vec::with_capacity(batch);
    for (slot, mmsg) in bufs.slots.iter_mut().zip(hdrs.iter_mut()) {
        let mut iovs = Vec::new();
        prepare_recv_hdr(slot, &mut iovs, &mut mmsg.msg_hdr);
        // Moving the Vec into the store moves only its handle; the heap
        // block msg_iov points at stays put.
        iov_store.push(iovs);
    }

    let flags = if cfg.wait_for_one {
        libc::MSG_WAITFORONE
    } else {
        0
    };

    let mut remaining = cfg.count;
    while remaining > 0 {
        let want = remaining.min(batch as u64) as usize;
        for mmsg in &mut hdrs[..want] {
            rearm_recv_hdr(&mut mmsg.msg_hdr, true);
        }
        // Fresh timespec per call; the kernel may rewrite it.
        let mut timeout = cfg.timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let timeout_ptr = timeout
            .as_mut()
            .map_or(ptr::null_mut(), |t| t as *mut libc::timespec);
        // SAFETY: hdrs and everything they point at outlive the call.
        let res = unsafe {
            libc::recvmmsg(
                fd,
                hdrs.as_mut_ptr(),
                want as libc::c_uint,
                flags,
                timeout_ptr,
            )
        };
        match check_res(res as isize, rec)? {
            Progress::Done(0) => continue,
            Progress::Done(got) => {
                for i in 0..got {
                    let n = hdrs[i].msg_len as usize;
                    let slot = &mut bufs.slots[i];
                    slot.recv_len = n;
                    let meta = decode_recv_meta(slot, &hdrs[i].msg_hdr, n);
                    inspect(&bufs.slots[i], n, &meta, cfg, state, true, true)?;
                    rec.bytes += n as u64;
                }
                rec.packets += got as u64;
                remaining -= got as u64;
            }
            Progress::Retry => continue,
        }
    }
    Ok(rec.packets)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sink_recvmmsg(
    _sock: &BenchSocket,
    _cfg: &Config,
    _rec: &mut TimingRecord,
    _state: &mut VerifyState,
) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "recvmmsg is not available on this platform",
    ))
}
