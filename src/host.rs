//! IP host value object with BSD sockaddr wire encoding.
//!
//! Routing messages carry addresses as packed `sockaddr` structures whose
//! first byte is the structure's own length and whose second byte is the
//! address family. The layout used here is the classic BSD one and is
//! defined by this module rather than pulled from platform headers, so the
//! codec behaves identically on every build target.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Wire value of the IPv4 address family.
pub const AF_INET: u8 = 2;
/// Wire value of the IPv6 address family (BSD numbering).
pub const AF_INET6: u8 = 28;

/// Encoded size of a `sockaddr_in`.
pub const SA_IN_LEN: usize = 16;
/// Encoded size of a `sockaddr_in6`.
pub const SA_IN6_LEN: usize = 28;

/// An IP address as it appears on the routing socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Host {
    addr: IpAddr,
}

impl Host {
    pub fn ip(&self) -> IpAddr {
        self.addr
    }

    /// Address family byte used in the sockaddr encoding.
    pub fn family(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => AF_INET,
            IpAddr::V6(_) => AF_INET6,
        }
    }

    /// Length of the raw address in bytes (4 or 16).
    pub fn addr_len(&self) -> usize {
        match self.addr {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 16,
        }
    }

    pub fn is_any(&self) -> bool {
        match self.addr {
            IpAddr::V4(a) => a.is_unspecified(),
            IpAddr::V6(a) => a.is_unspecified(),
        }
    }

    /// IPv6 link-local scope (fe80::/10). IPv4 hosts are never link-local
    /// for the purposes of address enumeration.
    pub fn is_link_local(&self) -> bool {
        match self.addr {
            IpAddr::V4(_) => false,
            IpAddr::V6(a) => a.segments()[0] & 0xffc0 == 0xfe80,
        }
    }

    /// Decode a host from a sockaddr as found on a routing message.
    ///
    /// Returns `None` for families other than INET/INET6 or when the
    /// buffer is too short for the family's layout.
    pub fn from_sockaddr(buf: &[u8]) -> Option<Host> {
        if buf.len() < 2 {
            return None;
        }
        match buf[1] {
            AF_INET => {
                let octets: [u8; 4] = buf.get(4..8)?.try_into().ok()?;
                Some(Ipv4Addr::from(octets).into())
            }
            AF_INET6 => {
                let octets: [u8; 16] = buf.get(8..24)?.try_into().ok()?;
                Some(Ipv6Addr::from(octets).into())
            }
            _ => None,
        }
    }

    /// Encode this host as a BSD sockaddr.
    pub fn sockaddr(&self) -> Vec<u8> {
        match self.addr {
            IpAddr::V4(a) => {
                let mut sa = vec![0u8; SA_IN_LEN];
                sa[0] = SA_IN_LEN as u8;
                sa[1] = AF_INET;
                sa[4..8].copy_from_slice(&a.octets());
                sa
            }
            IpAddr::V6(a) => {
                let mut sa = vec![0u8; SA_IN6_LEN];
                sa[0] = SA_IN6_LEN as u8;
                sa[1] = AF_INET6;
                sa[8..24].copy_from_slice(&a.octets());
                sa
            }
        }
    }

    /// Build the netmask host for `prefix` bits of the given family.
    ///
    /// Returns `None` for unknown families or prefixes beyond the
    /// family's address width.
    pub fn netmask(family: u8, prefix: u8) -> Option<Host> {
        match family {
            AF_INET if prefix <= 32 => {
                let bits = if prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(prefix))
                };
                Some(Ipv4Addr::from(bits).into())
            }
            AF_INET6 if prefix <= 128 => {
                let bits = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(prefix))
                };
                Some(Ipv6Addr::from(bits).into())
            }
            _ => None,
        }
    }
}

impl From<IpAddr> for Host {
    fn from(addr: IpAddr) -> Self {
        Host { addr }
    }
}

impl From<Ipv4Addr> for Host {
    fn from(addr: Ipv4Addr) -> Self {
        Host { addr: addr.into() }
    }
}

impl From<Ipv6Addr> for Host {
    fn from(addr: Ipv6Addr) -> Self {
        Host { addr: addr.into() }
    }
}

impl FromStr for Host {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Host {
            addr: s.parse::<IpAddr>()?,
        })
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}
