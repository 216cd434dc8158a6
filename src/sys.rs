//! Operating-system plumbing: the raw routing socket and the OS view of
//! interfaces and addresses.
//!
//! The OS view sits behind a trait so tests can substitute a synthetic
//! host state; the production implementation uses `getifaddrs` and the
//! interface-name resolution calls.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::host::Host;

/// One row of the OS's interface/address listing. Link-level rows carry
/// no address but still announce the interface itself.
#[derive(Debug, Clone)]
pub struct IfaceAddr {
    pub name: String,
    pub flags: u32,
    pub addr: Option<Host>,
}

/// The parts of the operating system this component queries outside the
/// routing socket.
pub trait SystemView: Send + Sync {
    /// Snapshot of all interfaces and their addresses.
    fn addresses(&self) -> io::Result<Vec<IfaceAddr>>;

    /// Resolve an interface index to its name.
    fn index_to_name(&self, ifindex: u32) -> Option<String>;

    /// Resolve an interface name to its index, 0 when unknown.
    fn name_to_index(&self, name: &str) -> u32;
}

/// Production OS view.
pub struct OsSystem;

impl SystemView for OsSystem {
    fn addresses(&self) -> io::Result<Vec<IfaceAddr>> {
        let mut out = Vec::new();
        for ifaddr in nix::ifaddrs::getifaddrs()? {
            let flags = ifaddr.flags.bits() as u32;
            let Some(storage) = ifaddr.address else {
                continue;
            };
            let addr = if let Some(sin) = storage.as_sockaddr_in() {
                Some(Host::from(sin.ip()))
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                Some(Host::from(sin6.ip()))
            } else if storage.as_link_addr().is_some() {
                None
            } else {
                continue;
            };
            out.push(IfaceAddr {
                name: ifaddr.interface_name,
                flags,
                addr,
            });
        }
        Ok(out)
    }

    fn index_to_name(&self, ifindex: u32) -> Option<String> {
        let mut buf = [0 as libc::c_char; libc::IFNAMSIZ];
        let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
        if ret.is_null() {
            return None;
        }
        let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
        Some(name.to_string_lossy().into_owned())
    }

    fn name_to_index(&self, name: &str) -> u32 {
        nix::net::if_::if_nametoindex(name).unwrap_or(0)
    }
}

/// The shared raw routing socket.
///
/// One socket serves both directions: the event receiver blocks reading
/// it while request paths send on it; the kernel echoes requests and
/// replies to every listener.
pub struct RouteSocket {
    fd: OwnedFd,
}

impl RouteSocket {
    /// Open the kernel routing socket.
    pub fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_ROUTE, libc::SOCK_RAW, libc::AF_UNSPEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RouteSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Wrap an already-connected datagram socket, e.g. one end of a
    /// socketpair standing in for the kernel in tests.
    pub fn from_fd(fd: OwnedFd) -> Self {
        RouteSocket { fd }
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Shut down the read side; used when running without an event
    /// receiver so kernel events never queue up.
    pub fn shutdown_read(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RD) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Shut down both directions, unblocking a receiver stuck in `recv`.
    pub fn shutdown_both(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for RouteSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
