//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Construction of the Listener's two receive sockets (one per address
//! family), bound to the BFD destination port with the option set §4.2
//! requires: GTSM-ready TTL/hop-limit, destination-address and TTL/hops
//! ancillary reception, and (for the IPv6 socket) v6-only.

use std::net::{SocketAddr, UdpSocket};

use bfdd_util::addr::Addr;
use bfdd_util::capabilities;
use bfdd_util::socket::{SocketExt, TTL_MAX, UdpSocketExt};

use crate::error::IoError;
use crate::session::BFD_DEST_PORT;

/// Binds and configures the Listener's receive socket for `local`'s
/// address family. Requires elevated capabilities to bind the privileged
/// port and to raise the socket's outgoing TTL/hop-limit.
pub(crate) fn bind_recv_socket(local: Addr) -> Result<UdpSocket, IoError> {
    let sockaddr: SocketAddr = local.with_port(BFD_DEST_PORT).into();
    let socket = capabilities::raise(|| UdpSocket::bind_reuseaddr(sockaddr))
        .map_err(IoError::UdpSocketError)?;

    match local {
        Addr::V6(..) => {
            socket
                .set_ipv6_only(true)
                .map_err(IoError::UdpSocketError)?;
            socket
                .set_ipv6_unicast_hops(TTL_MAX)
                .map_err(IoError::UdpSocketError)?;
            socket
                .set_ipv6_recvhoplimit(true)
                .map_err(IoError::UdpSocketError)?;
            socket
                .set_ipv6_pktinfo(true)
                .map_err(IoError::UdpSocketError)?;
        }
        _ => {
            socket
                .set_ipv4_ttl(TTL_MAX)
                .map_err(IoError::UdpSocketError)?;
            socket
                .set_ipv4_recvttl(true)
                .map_err(IoError::UdpSocketError)?;
            socket
                .set_ipv4_pktinfo(true)
                .map_err(IoError::UdpSocketError)?;
        }
    }

    Ok(socket)
}
