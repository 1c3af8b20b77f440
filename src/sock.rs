//! Socket setup for the benchmark engine.
//!
//! Strategies get an already-bound or already-connected blocking UDP
//! socket; everything here runs before the timed region.

use std::{
    io, mem,
    net::{SocketAddr, UdpSocket},
    os::unix::io::{AsRawFd, RawFd},
};

use socket2::{Domain, Protocol, Socket, Type};

/// Blocking UDP socket the strategies issue raw syscalls against.
#[derive(Debug)]
pub struct BenchSocket {
    io: UdpSocket,
}

impl AsRawFd for BenchSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }
}

impl BenchSocket {
    /// Creates a socket bound to `addr` (the receive side).
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        sock.bind(&addr.into())?;
        Ok(Self { io: sock.into() })
    }

    /// Creates a socket connected to `dest` (the transmit side). A
    /// connected socket reports ICMP errors back and spares the kernel a
    /// connect/unconnect cycle per send.
    pub fn connected(dest: SocketAddr) -> io::Result<Self> {
        let sock = Socket::new(Domain::for_address(dest), Type::DGRAM, Some(Protocol::UDP))?;
        sock.connect(&dest.into())?;
        Ok(Self { io: sock.into() })
    }

    /// Connects an already-bound socket, fixing the peer for the rest of
    /// the run.
    pub fn connect(&self, peer: SocketAddr) -> io::Result<()> {
        self.io.connect(peer)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.io.local_addr()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.io.set_nonblocking(nonblocking)
    }

    /// Blocking receive used for the warm-up packet; retried on EINTR by
    /// the caller like any other receive.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.io.recv_from(buf)
    }

    /// Asks the kernel to attach the requested per-packet metadata to
    /// received datagrams (TTL/hop limit, destination address info).
    pub fn enable_recv_meta(&self, want_ttl: bool, want_pktinfo: bool) -> io::Result<()> {
        let is_ipv4 = self.local_addr()?.is_ipv4();
        let fd = self.as_raw_fd();
        if is_ipv4 {
            if want_ttl {
                set_opt(fd, libc::IPPROTO_IP, libc::IP_RECVTTL, 1)?;
            }
            if want_pktinfo {
                set_opt(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1)?;
            }
        } else {
            if want_ttl {
                set_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
            }
            if want_pktinfo {
                set_opt(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
            }
        }
        Ok(())
    }
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: value is a live c_int and the length matches it.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as _,
            mem::size_of_val(&value) as _,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Decodes the peer address a receive syscall wrote into a
/// `sockaddr_storage` slot. `None` when the kernel wrote nothing
/// (family left as AF_UNSPEC).
pub(crate) fn decode_sockaddr(
    name: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> Option<SocketAddr> {
    if (len as usize) < mem::size_of::<libc::sa_family_t>() {
        return None;
    }
    // SAFETY: the kernel initialized `len` bytes of a valid sockaddr.
    let addr = unsafe { socket2::SockAddr::new(*name, len) };
    addr.as_socket()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_meta_opts() {
        let s = BenchSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        s.enable_recv_meta(true, true).unwrap();
        assert!(s.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn connected_socket_has_peer() {
        let sink = BenchSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = sink.local_addr().unwrap();
        let s = BenchSocket::connected(dest).unwrap();
        assert!(s.local_addr().unwrap().port() != 0);
    }

    #[test]
    fn decode_unwritten_name_is_none() {
        let name: libc::sockaddr_storage = unsafe { mem::zeroed() };
        assert_eq!(decode_sockaddr(&name, 0), None);
    }
}
