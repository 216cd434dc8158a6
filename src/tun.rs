//! Tunnel devices for virtual IPs.
//!
//! The backend only needs a narrow handle: bring the device up, assign
//! an address, report its name and address. Destroying the kernel device
//! happens on drop. A factory trait lets tests substitute fake devices.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Mutex;

use tracing::{debug, info};

use crate::host::Host;
use std::net::IpAddr;

/// A tunnel device carrying one virtual IP. Dropping the handle destroys
/// the underlying device.
pub trait TunDevice: Send + Sync {
    /// Bring the device up.
    fn up(&self) -> io::Result<()>;

    /// Assign `addr/prefix` to the device.
    fn set_address(&self, addr: &Host, prefix: u8) -> io::Result<()>;

    /// Kernel name of the device, e.g. `tun3`.
    fn name(&self) -> &str;

    /// The address assigned via `set_address`, if any.
    fn address(&self) -> Option<Host>;
}

/// Creates tunnel devices on demand.
pub trait TunFactory: Send + Sync {
    fn create(&self) -> io::Result<Box<dyn TunDevice>>;
}

// Classic BSD ioctl request values; defined locally so the crate builds
// on any target (only this device driver actually issues them).
const SIOCGIFFLAGS: libc::c_ulong = 0xc020_6911;
const SIOCSIFFLAGS: libc::c_ulong = 0x8020_6910;
const SIOCAIFADDR: libc::c_ulong = 0x8040_691a;
const SIOCAIFADDR_IN6: libc::c_ulong = 0x8080_691a;
const IFF_UP: libc::c_short = 0x1;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// `struct in_aliasreq`: name + address/broadcast/mask sockaddr_in's.
#[repr(C)]
struct InAliasReq {
    ifra_name: [libc::c_char; libc::IFNAMSIZ],
    ifra_addr: [u8; 16],
    ifra_broadaddr: [u8; 16],
    ifra_mask: [u8; 16],
}

/// `struct in6_aliasreq`: name + address/destination/prefix sockaddr_in6's,
/// flags and lifetimes.
#[repr(C)]
struct In6AliasReq {
    ifra_name: [libc::c_char; libc::IFNAMSIZ],
    ifra_addr: [u8; 28],
    ifra_dstaddr: [u8; 28],
    ifra_prefixmask: [u8; 28],
    ifra_flags: i32,
    ifra_lifetime: [u32; 4],
    _pad: [u8; 8],
}

fn ifname_bytes(name: &str) -> [libc::c_char; libc::IFNAMSIZ] {
    let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
    for (i, b) in name.bytes().take(libc::IFNAMSIZ - 1).enumerate() {
        out[i] = b as libc::c_char;
    }
    out
}

/// RAII guard for a short-lived ioctl socket.
struct SockGuard(libc::c_int);

impl SockGuard {
    fn open(family: libc::c_int) -> io::Result<Self> {
        let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SockGuard(fd))
    }
}

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// A kernel tunnel device opened from the `/dev/tunN` clone namespace.
pub struct SysTunDevice {
    name: String,
    file: File,
    addr: Mutex<Option<Host>>,
}

impl SysTunDevice {
    fn sockaddr_bytes<const N: usize>(host: &Host) -> [u8; N] {
        let mut out = [0u8; N];
        let sa = host.sockaddr();
        out[..sa.len()].copy_from_slice(&sa);
        out
    }
}

impl TunDevice for SysTunDevice {
    fn up(&self) -> io::Result<()> {
        let sock = SockGuard::open(libc::AF_INET)?;
        let mut ifr = IfReqFlags {
            ifr_name: ifname_bytes(&self.name),
            ifr_flags: 0,
            _pad: [0; 22],
        };
        let ret = unsafe { libc::ioctl(sock.0, SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        ifr.ifr_flags |= IFF_UP;
        let ret = unsafe { libc::ioctl(sock.0, SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(name = %self.name, "tunnel device up");
        Ok(())
    }

    fn set_address(&self, addr: &Host, prefix: u8) -> io::Result<()> {
        match addr.ip() {
            IpAddr::V4(_) => {
                let mask = Host::netmask(addr.family(), prefix)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                let req = InAliasReq {
                    ifra_name: ifname_bytes(&self.name),
                    ifra_addr: Self::sockaddr_bytes(addr),
                    ifra_broadaddr: Self::sockaddr_bytes(addr),
                    ifra_mask: Self::sockaddr_bytes(&mask),
                };
                let sock = SockGuard::open(libc::AF_INET)?;
                let ret = unsafe { libc::ioctl(sock.0, SIOCAIFADDR as _, &req) };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            IpAddr::V6(_) => {
                let mask = Host::netmask(addr.family(), prefix)
                    .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
                let req = In6AliasReq {
                    ifra_name: ifname_bytes(&self.name),
                    ifra_addr: Self::sockaddr_bytes(addr),
                    ifra_dstaddr: [0; 28],
                    ifra_prefixmask: Self::sockaddr_bytes(&mask),
                    ifra_flags: 0,
                    // infinite valid/preferred lifetimes
                    ifra_lifetime: [0, 0, u32::MAX, u32::MAX],
                    _pad: [0; 8],
                };
                let sock = SockGuard::open(libc::AF_INET6)?;
                let ret = unsafe { libc::ioctl(sock.0, SIOCAIFADDR_IN6 as _, &req) };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        info!(name = %self.name, address = %addr, prefix, "address assigned to tunnel");
        *self.addr.lock().unwrap() = Some(addr.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Option<Host> {
        self.addr.lock().unwrap().clone()
    }
}

impl Drop for SysTunDevice {
    fn drop(&mut self) {
        // closing the clone device destroys the interface
        debug!(name = %self.name, fd = self.file.as_raw_fd(), "tunnel device destroyed");
    }
}

/// Opens the next free `/dev/tunN` device.
pub struct SysTunFactory;

impl TunFactory for SysTunFactory {
    fn create(&self) -> io::Result<Box<dyn TunDevice>> {
        for unit in 0..256 {
            let path = format!("/dev/tun{unit}");
            match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => {
                    let name = format!("tun{unit}");
                    info!(name = %name, "tunnel device created");
                    return Ok(Box::new(SysTunDevice {
                        name,
                        file,
                        addr: Mutex::new(None),
                    }));
                }
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no free tunnel device",
        ))
    }
}
