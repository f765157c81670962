//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! UDP/TCP socket facade: the handful of options and the `recvmsg` ancillary
//! data extraction the session engine needs, and nothing else.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

use nix::sys::socket::{self, ControlMessageOwned, MsgFlags, SockaddrStorage};

/// The GTSM TTL/hop-limit value: outgoing packets are sent with this value
/// and incoming packets are required to arrive with it unchanged.
pub const TTL_MAX: u8 = 255;

/// Ancillary data recovered from a single `recvmsg` call.
#[derive(Clone, Copy, Debug)]
pub struct RecvAncillary {
    pub src: SocketAddr,
    pub dst: Option<IpAddr>,
    pub ttl: Option<u8>,
}

/// Low-level socket option helpers shared by UDP and TCP sockets.
pub trait SocketExt {
    fn set_ipv4_ttl(&self, ttl: u8) -> io::Result<()>;
    fn set_ipv4_recvttl(&self, enable: bool) -> io::Result<()>;
    fn set_ipv4_pktinfo(&self, enable: bool) -> io::Result<()>;
    fn set_ipv6_unicast_hops(&self, hops: u8) -> io::Result<()>;
    fn set_ipv6_recvhoplimit(&self, enable: bool) -> io::Result<()>;
    fn set_ipv6_pktinfo(&self, enable: bool) -> io::Result<()>;
    fn set_ipv6_only(&self, enable: bool) -> io::Result<()>;
    fn set_reuseport(&self, enable: bool) -> io::Result<()>;
}

impl SocketExt for UdpSocket {
    fn set_ipv4_ttl(&self, ttl: u8) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int)
    }

    fn set_ipv4_recvttl(&self, enable: bool) -> io::Result<()> {
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_RECVTTL,
            enable as libc::c_int,
        )
    }

    fn set_ipv4_pktinfo(&self, enable: bool) -> io::Result<()> {
        setsockopt(
            self,
            libc::IPPROTO_IP,
            libc::IP_PKTINFO,
            enable as libc::c_int,
        )
    }

    fn set_ipv6_unicast_hops(&self, hops: u8) -> io::Result<()> {
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            hops as libc::c_int,
        )
    }

    fn set_ipv6_recvhoplimit(&self, enable: bool) -> io::Result<()> {
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVHOPLIMIT,
            enable as libc::c_int,
        )
    }

    fn set_ipv6_pktinfo(&self, enable: bool) -> io::Result<()> {
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_RECVPKTINFO,
            enable as libc::c_int,
        )
    }

    fn set_ipv6_only(&self, enable: bool) -> io::Result<()> {
        setsockopt(
            self,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            enable as libc::c_int,
        )
    }

    fn set_reuseport(&self, enable: bool) -> io::Result<()> {
        setsockopt(
            self,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            enable as libc::c_int,
        )
    }
}

/// Construction helpers for the engine's receive and per-session send
/// sockets.
pub trait UdpSocketExt: Sized {
    fn bind_reuseaddr(sockaddr: SocketAddr) -> io::Result<UdpSocket>;

    fn recv_ancillary(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, RecvAncillary)>;
}

impl UdpSocketExt for UdpSocket {
    fn bind_reuseaddr(sockaddr: SocketAddr) -> io::Result<UdpSocket> {
        use socket2::{Domain, Socket, Type};

        let domain = match sockaddr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        if cfg!(target_os = "linux") {
            let _ = socket.set_reuse_port(true);
        }
        socket.set_nonblocking(true)?;
        socket.bind(&sockaddr.into())?;
        Ok(socket.into())
    }

    fn recv_ancillary(
        &self,
        buf: &mut [u8],
    ) -> io::Result<(usize, RecvAncillary)> {
        let mut iov = [io::IoSliceMut::new(buf)];
        let mut cmsgspace =
            nix::cmsg_space!(libc::in6_pktinfo, libc::c_int, libc::c_int);

        let msg = socket::recvmsg::<SockaddrStorage>(
            self.as_raw_fd(),
            &mut iov,
            Some(&mut cmsgspace),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        let src = msg
            .address
            .as_ref()
            .and_then(sockaddr_to_std)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    "recvmsg returned no source address",
                )
            })?;

        let mut dst = None;
        let mut ttl = None;
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            match cmsg {
                ControlMessageOwned::Ipv4PacketInfo(pktinfo) => {
                    dst = Some(
                        Ipv4Addr::from(pktinfo.ipi_spec_dst.s_addr.to_be())
                            .into(),
                    );
                }
                ControlMessageOwned::Ipv6PacketInfo(pktinfo) => {
                    dst =
                        Some(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr).into());
                }
                ControlMessageOwned::Ipv4Ttl(v) => ttl = Some(v as u8),
                ControlMessageOwned::Ipv6HopLimit(v) => ttl = Some(v as u8),
                _ => {}
            }
        }

        Ok((msg.bytes, RecvAncillary { src, dst, ttl }))
    }
}

fn sockaddr_to_std(sa: &SockaddrStorage) -> Option<SocketAddr> {
    sa.as_sockaddr_in()
        .map(|sa| SocketAddr::V4((*sa).into()))
        .or_else(|| sa.as_sockaddr_in6().map(|sa| SocketAddr::V6((*sa).into())))
}

/// Control-transport listener helpers (no GTSM, no pktinfo: these are plain
/// loopback TCP sockets).
pub trait TcpListenerExt: Sized {
    fn bind_reuseaddr(sockaddr: SocketAddr) -> io::Result<TcpListener>;
}

impl TcpListenerExt for TcpListener {
    fn bind_reuseaddr(sockaddr: SocketAddr) -> io::Result<TcpListener> {
        use socket2::{Domain, Socket, Type};

        let domain = match sockaddr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&sockaddr.into())?;
        socket.listen(16)?;
        Ok(socket.into())
    }
}

pub fn set_nonblocking(fd: RawFd, enable: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if enable {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt<S: AsRawFd>(
    socket: &S,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(feature = "testing")]
pub mod mock {
    use std::io;
    use std::net::SocketAddr;

    use super::RecvAncillary;

    #[derive(Debug, Default)]
    pub struct UdpSocket {}

    impl UdpSocket {
        pub fn send_to(
            &self,
            _buf: &[u8],
            _addr: SocketAddr,
        ) -> io::Result<usize> {
            Ok(0)
        }

        pub fn recv_ancillary(
            &self,
            _buf: &mut [u8],
        ) -> io::Result<(usize, RecvAncillary)> {
            Err(io::Error::from(io::ErrorKind::WouldBlock))
        }
    }

    #[derive(Debug, Default)]
    pub struct TcpListener {}

    #[derive(Debug, Default)]
    pub struct TcpStream {}
}
