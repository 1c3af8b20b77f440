use std::{mem, net::IpAddr, ptr};

/// Control-message buffers handed to the kernel must be aligned like
/// `cmsghdr`; wrapping them in this keeps stack and heap buffers honest.
#[derive(Copy, Clone)]
#[repr(align(8))] // Conservative bound for align_of<cmsghdr>
pub struct Aligned<T>(pub T);

/// Space for the control messages one received datagram can carry here:
/// a TTL/hop-limit integer plus a v4 or v6 pktinfo record.
pub const CTRL_LEN: usize = 64;

/// Returns the control buffer space the kernel needs for the records we
/// request: TTL (`c_int`) and the larger of the two pktinfo structs.
pub fn space_for_recv() -> usize {
    unsafe {
        libc::CMSG_SPACE(mem::size_of::<libc::c_int>() as _) as usize
            + libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as _) as usize
    }
}

/// Helper to encode a series of control messages ("cmsgs") into a
/// `msghdr` control buffer for `sendmsg`/`sendmmsg`.
///
/// The operation must be "finished" for the msghdr to be usable, either
/// by calling `finish` explicitly or by dropping the `Encoder`.
pub struct Encoder<'a> {
    hdr: &'a mut libc::msghdr,
    cmsg: Option<&'a mut libc::cmsghdr>,
    len: usize,
}

impl<'a> Encoder<'a> {
    /// # Safety
    /// - `hdr.msg_control` must be a suitably aligned pointer to
    ///   `hdr.msg_controllen` bytes that can be safely written
    /// - The `Encoder` must be dropped before `hdr` is passed to a system
    ///   call, and must not be leaked.
    pub unsafe fn new(hdr: &'a mut libc::msghdr) -> Self {
        Self {
            cmsg: libc::CMSG_FIRSTHDR(hdr).as_mut(),
            hdr,
            len: 0,
        }
    }

    /// Append one control message.
    ///
    /// # Panics
    /// - If insufficient buffer space remains.
    /// - If `T` has stricter alignment requirements than `cmsghdr`
    pub fn push<T: Copy + ?Sized>(&mut self, level: libc::c_int, ty: libc::c_int, value: T) {
        assert!(mem::align_of::<T>() <= mem::align_of::<libc::cmsghdr>());
        let space = unsafe { libc::CMSG_SPACE(mem::size_of_val(&value) as _) as usize };
        assert!(
            self.hdr.msg_controllen as usize >= self.len + space,
            "control message buffer too small. Required: {}, Available: {}",
            self.len + space,
            self.hdr.msg_controllen
        );
        let cmsg = self.cmsg.take().expect("no control buffer space remaining");
        cmsg.cmsg_level = level;
        cmsg.cmsg_type = ty;
        cmsg.cmsg_len = unsafe { libc::CMSG_LEN(mem::size_of_val(&value) as _) } as _;
        unsafe {
            ptr::write(libc::CMSG_DATA(cmsg) as *const T as *mut T, value);
        }
        self.len += space;
        self.cmsg = unsafe { libc::CMSG_NXTHDR(self.hdr, cmsg).as_mut() };
    }

    /// Finishes appending control messages to the buffer
    pub fn finish(self) {
        // Delegates to the `Drop` impl
    }
}

// Statically guarantees that the encoding operation is "finished" before
// the control buffer is read by `sendmsg`.
impl Drop for Encoder<'_> {
    fn drop(&mut self) {
        self.hdr.msg_controllen = self.len as _;
    }
}

/// Appends the TTL (v4) or hop limit (v6) control message a transmit
/// should carry.
pub fn push_ttl(encoder: &mut Encoder, v6: bool, ttl: u32) {
    if v6 {
        encoder.push(libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT, ttl as libc::c_int);
    } else {
        encoder.push(libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int);
    }
}

/// # Safety
///
/// `cmsg` must refer to a cmsg containing a payload of type `T`
unsafe fn decode<T: Copy>(cmsg: &libc::cmsghdr) -> T {
    assert!(mem::align_of::<T>() <= mem::align_of::<libc::cmsghdr>());
    debug_assert_eq!(
        cmsg.cmsg_len as usize,
        libc::CMSG_LEN(mem::size_of::<T>() as _) as usize
    );
    ptr::read(libc::CMSG_DATA(cmsg) as *const T)
}

/// One control message attached to a received datagram, decoded into the
/// records this crate cares about.
#[derive(Debug, Clone, Copy)]
pub enum Parsed {
    /// IP_TTL / IPV6_HOPLIMIT value of the arriving packet
    Ttl(u32),
    /// Destination address and interface index from IP_PKTINFO / IPV6_PKTINFO
    PktInfo { dst: IpAddr, ifindex: u32 },
    /// Anything else the kernel attached
    Other,
}

/// Decodes a single `cmsghdr` into [`Parsed`].
///
/// # Safety
///
/// `cmsg` must be a fully initialized control message produced by the
/// kernel for this socket (level/type must describe the payload).
pub unsafe fn parse(cmsg: &libc::cmsghdr) -> Parsed {
    match (cmsg.cmsg_level, cmsg.cmsg_type) {
        (libc::IPPROTO_IP, libc::IP_TTL) => Parsed::Ttl(decode::<libc::c_int>(cmsg) as u32),
        (libc::IPPROTO_IPV6, libc::IPV6_HOPLIMIT) => {
            Parsed::Ttl(decode::<libc::c_int>(cmsg) as u32)
        }
        (libc::IPPROTO_IP, libc::IP_PKTINFO) => {
            let pktinfo = decode::<libc::in_pktinfo>(cmsg);
            Parsed::PktInfo {
                dst: IpAddr::V4(ptr::read(&pktinfo.ipi_addr as *const _ as _)),
                ifindex: pktinfo.ipi_ifindex as u32,
            }
        }
        (libc::IPPROTO_IPV6, libc::IPV6_PKTINFO) => {
            let pktinfo = decode::<libc::in6_pktinfo>(cmsg);
            Parsed::PktInfo {
                dst: IpAddr::V6(ptr::read(&pktinfo.ipi6_addr as *const _ as _)),
                ifindex: pktinfo.ipi6_ifindex,
            }
        }
        _ => Parsed::Other,
    }
}

pub struct Iter<'a> {
    hdr: &'a libc::msghdr,
    cmsg: Option<&'a libc::cmsghdr>,
}

impl<'a> Iter<'a> {
    /// # Safety
    ///
    /// `hdr.msg_control` must point to memory outliving `'a` which can be
    /// soundly read for the lifetime of the constructed `Iter` and
    /// contains a buffer of cmsgs, i.e. is aligned for `cmsghdr`, is
    /// fully initialized, and has correct internal links.
    pub unsafe fn new(hdr: &'a libc::msghdr) -> Self {
        Self {
            hdr,
            cmsg: libc::CMSG_FIRSTHDR(hdr).as_ref(),
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a libc::cmsghdr;
    fn next(&mut self) -> Option<&'a libc::cmsghdr> {
        let current = self.cmsg.take()?;
        self.cmsg = unsafe { libc::CMSG_NXTHDR(self.hdr, current).as_ref() };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_roundtrip() {
        let mut ctrl = Aligned([0u8; CTRL_LEN]);
        let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
        hdr.msg_control = ctrl.0.as_mut_ptr() as _;
        hdr.msg_controllen = CTRL_LEN as _;
        let mut encoder = unsafe { Encoder::new(&mut hdr) };
        push_ttl(&mut encoder, false, 64);
        encoder.finish();

        let mut found = None;
        for cmsg in unsafe { Iter::new(&hdr) } {
            if let Parsed::Ttl(t) = unsafe { parse(cmsg) } {
                found = Some(t);
            }
        }
        assert_eq!(found, Some(64));
    }

    #[test]
    fn recv_space_fits_ctrl_len() {
        assert!(space_for_recv() <= CTRL_LEN);
    }
}
