//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Uniform IPv4/IPv6 address handling.
//!
//! Two flavors are exposed: [`Addr`], which never carries a port, and
//! [`BoundAddr`], which always does. Both are sum types over
//! `{Invalid, V4, V6}` so that a default-constructed value has an explicit,
//! checkable "not yet set" state instead of relying on an `Option` at every
//! call site.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// An IP address that never carries a port.
#[derive(Clone, Copy, Debug, Default, Eq)]
pub enum Addr {
    #[default]
    Invalid,
    V4(Ipv4Addr),
    V6(Ipv6Addr, u32),
}

/// An IP address that always carries a port (a "socket address").
#[derive(Clone, Copy, Debug, Default, Eq)]
pub enum BoundAddr {
    #[default]
    Invalid,
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u32, u16),
}

// ===== impl Addr =====

impl Addr {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Addr::Invalid)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self, Addr::V4(_))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Addr::V6(..))
    }

    pub fn is_unspecified(&self) -> bool {
        match self {
            Addr::Invalid => false,
            Addr::V4(addr) => addr.is_unspecified(),
            Addr::V6(addr, _) => addr.is_unspecified(),
        }
    }

    pub fn is_link_local(&self) -> bool {
        match self {
            Addr::Invalid => false,
            Addr::V4(addr) => addr.is_link_local(),
            Addr::V6(addr, _) => (addr.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    pub fn unspecified_v4() -> Addr {
        Addr::V4(Ipv4Addr::UNSPECIFIED)
    }

    pub fn unspecified_v6() -> Addr {
        Addr::V6(Ipv6Addr::UNSPECIFIED, 0)
    }

    /// Attaches a port, producing a [`BoundAddr`].
    pub fn with_port(&self, port: u16) -> BoundAddr {
        match *self {
            Addr::Invalid => BoundAddr::Invalid,
            Addr::V4(addr) => BoundAddr::V4(addr, port),
            Addr::V6(addr, scope) => BoundAddr::V6(addr, scope, port),
        }
    }

    pub fn scope_id(&self) -> u32 {
        match self {
            Addr::V6(_, scope) => *scope,
            _ => 0,
        }
    }
}

impl From<IpAddr> for Addr {
    fn from(addr: IpAddr) -> Addr {
        match addr {
            IpAddr::V4(addr) => Addr::V4(addr),
            IpAddr::V6(addr) => Addr::V6(addr, 0),
        }
    }
}

impl From<Addr> for IpAddr {
    fn from(addr: Addr) -> IpAddr {
        match addr {
            Addr::Invalid => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Addr::V4(addr) => IpAddr::V4(addr),
            Addr::V6(addr, _) => IpAddr::V6(addr),
        }
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Addr::Invalid, Addr::Invalid) => true,
            (Addr::V4(a), Addr::V4(b)) => a == b,
            (Addr::V6(a, sa), Addr::V6(b, sb)) => a == b && sa == sb,
            _ => false,
        }
    }
}

impl Ord for Addr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(addr: &Addr) -> u8 {
            match addr {
                Addr::Invalid => 0,
                Addr::V4(_) => 1,
                Addr::V6(..) => 2,
            }
        }
        match (self, other) {
            (Addr::V4(a), Addr::V4(b)) => a.cmp(b),
            (Addr::V6(a, sa), Addr::V6(b, sb)) => a.cmp(b).then(sa.cmp(sb)),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

impl PartialOrd for Addr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Addr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Addr::Invalid => 0u8.hash(state),
            Addr::V4(addr) => {
                1u8.hash(state);
                addr.hash(state);
            }
            Addr::V6(addr, scope) => {
                2u8.hash(state);
                addr.hash(state);
                scope.hash(state);
            }
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Invalid => write!(f, "<invalid>"),
            Addr::V4(addr) => write!(f, "{addr}"),
            Addr::V6(addr, 0) => write!(f, "{addr}"),
            Addr::V6(addr, scope) => write!(f, "{addr}%{scope}"),
        }
    }
}

impl FromStr for Addr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((addr, scope)) = s.split_once('%') {
            let addr: Ipv6Addr =
                addr.parse().map_err(|_| AddrParseError)?;
            let scope: u32 = scope.parse().map_err(|_| AddrParseError)?;
            return Ok(Addr::V6(addr, scope));
        }
        if let Ok(addr) = s.parse::<Ipv4Addr>() {
            return Ok(Addr::V4(addr));
        }
        if let Ok(addr) = s.parse::<Ipv6Addr>() {
            return Ok(Addr::V6(addr, 0));
        }
        Err(AddrParseError)
    }
}

// ===== impl BoundAddr =====

impl BoundAddr {
    pub fn is_valid(&self) -> bool {
        !matches!(self, BoundAddr::Invalid)
    }

    pub fn addr(&self) -> Addr {
        match *self {
            BoundAddr::Invalid => Addr::Invalid,
            BoundAddr::V4(addr, _) => Addr::V4(addr),
            BoundAddr::V6(addr, scope, _) => Addr::V6(addr, scope),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            BoundAddr::Invalid => 0,
            BoundAddr::V4(_, port) => *port,
            BoundAddr::V6(_, _, port) => *port,
        }
    }

    pub fn with_port(&self, port: u16) -> BoundAddr {
        self.addr().with_port(port)
    }
}

impl From<SocketAddr> for BoundAddr {
    fn from(sa: SocketAddr) -> BoundAddr {
        match sa {
            SocketAddr::V4(sa) => BoundAddr::V4(*sa.ip(), sa.port()),
            SocketAddr::V6(sa) => {
                BoundAddr::V6(*sa.ip(), sa.scope_id(), sa.port())
            }
        }
    }
}

impl From<BoundAddr> for SocketAddr {
    fn from(addr: BoundAddr) -> SocketAddr {
        match addr {
            BoundAddr::Invalid => {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            }
            BoundAddr::V4(addr, port) => SocketAddr::from((addr, port)),
            BoundAddr::V6(addr, scope, port) => SocketAddr::V6(
                std::net::SocketAddrV6::new(addr, port, 0, scope),
            ),
        }
    }
}

impl PartialEq for BoundAddr {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr() && self.port() == other.port()
    }
}

impl Ord for BoundAddr {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.addr()
            .cmp(&other.addr())
            .then(self.port().cmp(&other.port()))
    }
}

impl PartialOrd for BoundAddr {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for BoundAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
        self.port().hash(state);
    }
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Invalid => write!(f, "<invalid>"),
            BoundAddr::V4(addr, port) => write!(f, "{addr}:{port}"),
            BoundAddr::V6(addr, 0, port) => write!(f, "[{addr}]:{port}"),
            BoundAddr::V6(addr, scope, port) => {
                write!(f, "[{addr}%{scope}]:{port}")
            }
        }
    }
}

impl FromStr for BoundAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('[') {
            let (addr, port) =
                rest.split_once("]:").ok_or(AddrParseError)?;
            let port: u16 = port.parse().map_err(|_| AddrParseError)?;
            let addr: Addr = addr.parse()?;
            return Ok(addr.with_port(port));
        }
        let (addr, port) = s.rsplit_once(':').ok_or(AddrParseError)?;
        let port: u16 = port.parse().map_err(|_| AddrParseError)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| AddrParseError)?;
        Ok(BoundAddr::V4(addr, port))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddrParseError;

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address syntax")
    }
}

impl std::error::Error for AddrParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_v4() {
        let addr: Addr = "10.0.0.2".parse().unwrap();
        assert_eq!(addr.to_string(), "10.0.0.2");
        assert_eq!(addr, Addr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn roundtrip_v6() {
        let addr: Addr = "fe80::1%3".parse().unwrap();
        assert_eq!(addr.to_string(), "fe80::1%3");
        assert!(addr.is_link_local());
    }

    #[test]
    fn roundtrip_bound_v4() {
        let addr: BoundAddr = "192.0.2.1:3784".parse().unwrap();
        assert_eq!(addr.to_string(), "192.0.2.1:3784");
        assert_eq!(addr.port(), 3784);
    }

    #[test]
    fn roundtrip_bound_v6() {
        let addr: BoundAddr = "[2001:db8::1]:3784".parse().unwrap();
        assert_eq!(addr.to_string(), "[2001:db8::1]:3784");
        assert_eq!(addr.port(), 3784);
    }

    #[test]
    fn ordering_and_hash_are_consistent() {
        use std::collections::HashSet;

        let a: Addr = "10.0.0.1".parse().unwrap();
        let b: Addr = "10.0.0.2".parse().unwrap();
        assert!(a < b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&"10.0.0.1".parse::<Addr>().unwrap()));
    }

    #[test]
    fn invalid_strings_are_rejected() {
        assert!("not-an-address".parse::<Addr>().is_err());
        assert!("10.0.0.1".parse::<BoundAddr>().is_err());
    }
}
