//! In-memory model of the host's interfaces and addresses.
//!
//! The cache holds the ordered interface list, a reverse index from IP
//! address to owning interface, and the list of tunnel devices installed
//! for virtual IPs. All three belong to one invariant domain and are
//! guarded together by a single reader/writer lock owned by the backend;
//! the methods here assume the caller holds the appropriate side of it.

use std::collections::HashMap;
use std::net::IpAddr;

use bitflags::bitflags;

use crate::host::Host;
use crate::msg::{IFF_LOOPBACK, IFF_UP};
use crate::tun::TunDevice;

bitflags! {
    /// Selects which addresses an enumeration yields.
    ///
    /// `REGULAR`/`VIRTUAL` pick the address class; the remaining bits
    /// widen the interface filter to otherwise-skipped interfaces.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddressScope: u32 {
        const REGULAR = 1;
        const VIRTUAL = 2;
        const IGNORED = 4;
        const LOOPBACK = 8;
        const DOWN = 16;
    }
}

/// How `lookup_iface` decides whether an interface may answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfaceMatch {
    /// Interface must be up and allowed by the usability policy.
    UpAndUsable,
    /// Interface must be up; the usability policy is ignored.
    Up,
}

/// An address installed on an interface.
#[derive(Debug, Clone)]
pub struct AddrEntry {
    pub ip: Host,
    /// Installed by us on a tunnel device, as opposed to observed from
    /// the kernel. Virtual addresses are never reverse-indexed.
    pub is_virtual: bool,
}

/// A network interface of this system.
#[derive(Debug)]
pub struct IfaceEntry {
    pub ifindex: u32,
    pub ifname: String,
    /// Kernel interface flags as last reported on a link message.
    pub flags: u32,
    /// Allowed by the external usability policy, decided once on first
    /// observation.
    pub usable: bool,
    pub addrs: Vec<AddrEntry>,
}

impl IfaceEntry {
    pub fn is_up(&self) -> bool {
        self.flags & IFF_UP != 0
    }

    pub fn is_loopback(&self) -> bool {
        self.flags & IFF_LOOPBACK != 0
    }

    pub fn up_and_usable(&self) -> bool {
        self.usable && self.is_up()
    }
}

/// Interface list, reverse address index, and tunnel list.
#[derive(Default)]
pub struct NetCache {
    pub(crate) ifaces: Vec<IfaceEntry>,
    /// IP address to interface indexes carrying it. The same address may
    /// legitimately live on several interfaces.
    pub(crate) rev: HashMap<IpAddr, Vec<u32>>,
    /// Tunnel devices installed for virtual IPs.
    pub(crate) tuns: Vec<Box<dyn TunDevice>>,
}

impl NetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ifaces(&self) -> &[IfaceEntry] {
        &self.ifaces
    }

    pub fn iface_by_index(&self, ifindex: u32) -> Option<&IfaceEntry> {
        self.ifaces.iter().find(|i| i.ifindex == ifindex)
    }

    pub fn iface_by_name(&self, name: &str) -> Option<&IfaceEntry> {
        self.ifaces.iter().find(|i| i.ifname == name)
    }

    /// Find the interface named `name`, creating a record for it if this
    /// is its first observation. Returns the interface index.
    pub fn add_or_find(&mut self, name: &str, ifindex: u32, flags: u32, usable: bool) -> u32 {
        if let Some(iface) = self.ifaces.iter().find(|i| i.ifname == name) {
            return iface.ifindex;
        }
        self.ifaces.push(IfaceEntry {
            ifindex,
            ifname: name.to_string(),
            flags,
            usable,
            addrs: Vec::new(),
        });
        ifindex
    }

    /// Drop an interface record and the reverse-index entries of its
    /// addresses.
    pub fn remove_iface(&mut self, ifindex: u32) -> Option<IfaceEntry> {
        let pos = self.ifaces.iter().position(|i| i.ifindex == ifindex)?;
        let iface = self.ifaces.remove(pos);
        for addr in &iface.addrs {
            if !addr.is_virtual {
                self.rev_remove(&addr.ip, ifindex);
            }
        }
        Some(iface)
    }

    fn rev_add(&mut self, ip: &Host, ifindex: u32) {
        self.rev.entry(ip.ip()).or_default().push(ifindex);
    }

    fn rev_remove(&mut self, ip: &Host, ifindex: u32) {
        if let Some(owners) = self.rev.get_mut(&ip.ip()) {
            if let Some(pos) = owners.iter().position(|&i| i == ifindex) {
                owners.remove(pos);
            }
            if owners.is_empty() {
                self.rev.remove(&ip.ip());
            }
        }
    }

    /// Insert a non-virtual address record and its reverse-index entry.
    /// No-op when the interface is unknown or already carries the host.
    pub fn insert_addr(&mut self, ifindex: u32, ip: Host) -> bool {
        let Some(iface) = self.ifaces.iter_mut().find(|i| i.ifindex == ifindex) else {
            return false;
        };
        if iface.addrs.iter().any(|a| a.ip == ip) {
            return false;
        }
        iface.addrs.push(AddrEntry {
            ip: ip.clone(),
            is_virtual: false,
        });
        self.rev_add(&ip, ifindex);
        true
    }

    /// Remove an address record, dropping its reverse-index entry unless
    /// it was virtual.
    pub fn remove_addr(&mut self, ifindex: u32, ip: &Host) -> Option<AddrEntry> {
        let iface = self.ifaces.iter_mut().find(|i| i.ifindex == ifindex)?;
        let pos = iface.addrs.iter().position(|a| &a.ip == ip)?;
        let entry = iface.addrs.remove(pos);
        if !entry.is_virtual {
            self.rev_remove(ip, ifindex);
        }
        Some(entry)
    }

    pub fn set_flags(&mut self, ifindex: u32, flags: u32) {
        if let Some(iface) = self.ifaces.iter_mut().find(|i| i.ifindex == ifindex) {
            iface.flags = flags;
        }
    }

    /// Atomically replace all addresses of an interface with `current`.
    ///
    /// Used on link-state changes, which may implicitly add or drop
    /// addresses without individual address events. All replacement
    /// records are non-virtual.
    pub fn repopulate(&mut self, ifindex: u32, current: Vec<Host>) {
        let Some(pos) = self.ifaces.iter().position(|i| i.ifindex == ifindex) else {
            return;
        };
        let old = std::mem::take(&mut self.ifaces[pos].addrs);
        for entry in old {
            if !entry.is_virtual {
                self.rev_remove(&entry.ip, ifindex);
            }
        }
        for ip in current {
            self.insert_addr(ifindex, ip);
        }
    }

    /// Drop an address's reverse-index entry and mark it virtual.
    ///
    /// Called once the tunnel carrying a virtual IP became visible: the
    /// receiver indexed the address as regular before we could mark it,
    /// and a virtual IP must never resolve through the reverse index.
    pub fn mark_virtual(&mut self, ifname: &str, ip: &Host) {
        let Some(pos) = self.ifaces.iter().position(|i| i.ifname == ifname) else {
            return;
        };
        let ifindex = self.ifaces[pos].ifindex;
        let mut flipped = false;
        for addr in &mut self.ifaces[pos].addrs {
            if &addr.ip == ip && !addr.is_virtual {
                addr.is_virtual = true;
                flipped = true;
            }
        }
        if flipped {
            self.rev_remove(ip, ifindex);
        }
    }

    /// Resolve the interface carrying `ip` through the reverse index.
    pub fn lookup_iface(&self, ip: &Host, how: IfaceMatch) -> Option<&IfaceEntry> {
        let owners = self.rev.get(&ip.ip())?;
        owners
            .iter()
            .filter_map(|&idx| self.iface_by_index(idx))
            .find(|iface| match how {
                IfaceMatch::UpAndUsable => iface.up_and_usable(),
                IfaceMatch::Up => iface.is_up(),
            })
    }

    /// Snapshot of all addresses matching `which`.
    ///
    /// Interfaces are skipped unless ignored/loopback/down interfaces
    /// were explicitly requested; addresses are filtered by class, and
    /// IPv6 link-local addresses never appear.
    pub fn addresses(&self, which: AddressScope) -> Vec<Host> {
        let mut out = Vec::new();
        for iface in &self.ifaces {
            if !which.contains(AddressScope::IGNORED) && !iface.usable {
                continue;
            }
            if !which.contains(AddressScope::LOOPBACK) && iface.is_loopback() {
                continue;
            }
            if !which.contains(AddressScope::DOWN) && !iface.is_up() {
                continue;
            }
            for addr in &iface.addrs {
                if !which.contains(AddressScope::VIRTUAL) && addr.is_virtual {
                    continue;
                }
                if !which.contains(AddressScope::REGULAR) && !addr.is_virtual {
                    continue;
                }
                if addr.ip.is_link_local() {
                    continue;
                }
                out.push(addr.ip.clone());
            }
        }
        out
    }

    pub fn tuns(&self) -> &[Box<dyn TunDevice>] {
        &self.tuns
    }

    pub fn push_tun(&mut self, tun: Box<dyn TunDevice>) {
        self.tuns.push(tun);
    }

    /// Detach the tunnel carrying `vip` from the tunnel list, if any.
    pub fn take_tun(&mut self, vip: &Host) -> Option<Box<dyn TunDevice>> {
        let pos = self
            .tuns
            .iter()
            .position(|t| t.address().is_some_and(|a| &a == vip))?;
        Some(self.tuns.remove(pos))
    }
}
