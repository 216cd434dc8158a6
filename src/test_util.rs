//! Support code for unit and integration tests.
//!
//! Provides synthetic routing messages, fake OS/tunnel/listener
//! implementations, and cache invariant checks. Nothing here is used in
//! production paths.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{NetworkListener, PfrouteNet};
use crate::cache::NetCache;
use crate::host::Host;
use crate::msg::{self, IF_MSGHDR_LEN, IFA_MSGHDR_LEN, RTAX_IFA, RTM_VERSION};
use crate::sys::{IfaceAddr, SystemView};
use crate::tun::{TunDevice, TunFactory};

/// Build an `RTM_NEWADDR`/`RTM_DELADDR` message for `ip` on `ifindex`.
pub fn addr_msg(msg_type: u8, ifindex: u16, ip: &Host) -> Vec<u8> {
    let mut buf = vec![0u8; IFA_MSGHDR_LEN];
    buf[2] = RTM_VERSION;
    buf[3] = msg_type;
    msg::put_i32(&mut buf, 4, 1 << RTAX_IFA);
    msg::put_u16(&mut buf, 12, ifindex);
    buf.extend_from_slice(&ip.sockaddr());
    let len = buf.len() as u16;
    msg::put_u16(&mut buf, 0, len);
    buf
}

/// Build an `RTM_IFINFO` message announcing `flags` for `ifindex`.
pub fn link_msg(ifindex: u16, flags: i32) -> Vec<u8> {
    let mut buf = vec![0u8; IF_MSGHDR_LEN];
    buf[2] = RTM_VERSION;
    buf[3] = msg::RTM_IFINFO;
    msg::put_i32(&mut buf, 8, flags);
    msg::put_u16(&mut buf, 12, ifindex);
    msg::put_u16(&mut buf, 0, IF_MSGHDR_LEN as u16);
    buf
}

/// Build an `RTM_GET` reply carrying the given role/host pairs. Roles
/// must be listed in ascending order.
pub fn route_reply(seq: i32, pid: i32, flags: i32, addrs: &[(usize, &Host)]) -> Vec<u8> {
    let mut b = msg::MsgBuilder::new(msg::RTM_GET, flags, pid, seq);
    for &(role, host) in addrs {
        b.add_addr(role, host);
    }
    b.finish()
}

/// Verify the cache invariants: every non-virtual address is reachable
/// through the reverse index, every reverse entry is backed by a
/// matching address record, no virtual address is indexed, and no
/// interface carries the same host twice.
pub fn check_cache(cache: &NetCache) -> Result<(), String> {
    for iface in cache.ifaces() {
        for (i, addr) in iface.addrs.iter().enumerate() {
            if iface.addrs[..i].iter().any(|a| a.ip == addr.ip) {
                return Err(format!("{} duplicated on {}", addr.ip, iface.ifname));
            }
            let indexed = cache
                .rev
                .get(&addr.ip.ip())
                .is_some_and(|owners| owners.contains(&iface.ifindex));
            if addr.is_virtual && indexed {
                return Err(format!("virtual {} is reverse-indexed", addr.ip));
            }
            if !addr.is_virtual && !indexed {
                return Err(format!("{} missing from reverse index", addr.ip));
            }
        }
    }
    for (ip, owners) in &cache.rev {
        for idx in owners {
            let Some(iface) = cache.iface_by_index(*idx) else {
                return Err(format!("reverse entry {ip} points at unknown interface"));
            };
            if !iface
                .addrs
                .iter()
                .any(|a| a.ip.ip() == *ip && !a.is_virtual)
            {
                return Err(format!("reverse entry {ip} has no backing address"));
            }
        }
    }
    Ok(())
}

/// Run the invariant check against a live backend's cache.
pub fn check_backend(net: &PfrouteNet) -> Result<(), String> {
    check_cache(&net.shared.cache.read().unwrap())
}

/// Scriptable OS view.
#[derive(Default)]
pub struct FakeSystem {
    rows: Mutex<Vec<IfaceAddr>>,
    names: Mutex<HashMap<u32, String>>,
}

impl FakeSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an interface: its index/name mapping plus a link-level
    /// row, the way the OS listing announces address-less interfaces.
    pub fn add_iface(&self, name: &str, ifindex: u32, flags: u32) {
        self.names.lock().unwrap().insert(ifindex, name.to_string());
        self.rows.lock().unwrap().push(IfaceAddr {
            name: name.to_string(),
            flags,
            addr: None,
        });
    }

    pub fn add_addr(&self, name: &str, flags: u32, ip: &Host) {
        self.rows.lock().unwrap().push(IfaceAddr {
            name: name.to_string(),
            flags,
            addr: Some(ip.clone()),
        });
    }

    pub fn remove_addr(&self, name: &str, ip: &Host) {
        self.rows
            .lock()
            .unwrap()
            .retain(|row| !(row.name == name && row.addr.as_ref() == Some(ip)));
    }

    /// Drop every row of the named interface.
    pub fn remove_iface(&self, name: &str) {
        self.rows.lock().unwrap().retain(|row| row.name != name);
    }
}

impl SystemView for FakeSystem {
    fn addresses(&self) -> io::Result<Vec<IfaceAddr>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    fn index_to_name(&self, ifindex: u32) -> Option<String> {
        self.names.lock().unwrap().get(&ifindex).cloned()
    }

    fn name_to_index(&self, name: &str) -> u32 {
        self.names
            .lock()
            .unwrap()
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(idx, _)| *idx)
            .unwrap_or(0)
    }
}

/// Listener recording every callback.
#[derive(Default)]
pub struct TestListener {
    pub roams: Mutex<Vec<bool>>,
    pub tun_events: Mutex<Vec<(String, bool)>>,
    pub unusable: Mutex<Vec<String>>,
}

impl TestListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn roam_count(&self) -> usize {
        self.roams.lock().unwrap().len()
    }

    pub fn mark_unusable(&self, name: &str) {
        self.unusable.lock().unwrap().push(name.to_string());
    }
}

impl NetworkListener for TestListener {
    fn is_interface_usable(&self, name: &str) -> bool {
        !self.unusable.lock().unwrap().iter().any(|n| n == name)
    }

    fn roam(&self, address_changed: bool) {
        self.roams.lock().unwrap().push(address_changed);
    }

    fn tun_event(&self, tun: &dyn TunDevice, registered: bool) {
        self.tun_events
            .lock()
            .unwrap()
            .push((tun.name().to_string(), registered));
    }
}

/// Fake tunnel device wired to a [`FakeSystem`].
///
/// Assigning an address publishes the interface in the fake OS view and
/// invokes the link-change hook, which test harnesses use to inject the
/// matching kernel message; dropping the device retracts it the same
/// way. This mirrors how a real tunnel becomes visible to the receiver.
pub struct FakeTun {
    name: String,
    ifindex: u16,
    system: Arc<FakeSystem>,
    link_changed: Arc<dyn Fn(u16, i32) + Send + Sync>,
    addr: Mutex<Option<Host>>,
    assigned: Arc<Mutex<Vec<(Host, u8)>>>,
}

impl TunDevice for FakeTun {
    fn up(&self) -> io::Result<()> {
        Ok(())
    }

    fn set_address(&self, addr: &Host, prefix: u8) -> io::Result<()> {
        *self.addr.lock().unwrap() = Some(addr.clone());
        self.assigned.lock().unwrap().push((addr.clone(), prefix));
        self.system.add_addr(&self.name, msg::IFF_UP, addr);
        (self.link_changed)(self.ifindex, msg::IFF_UP as i32);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> Option<Host> {
        self.addr.lock().unwrap().clone()
    }
}

impl Drop for FakeTun {
    fn drop(&mut self) {
        self.system.remove_iface(&self.name);
        (self.link_changed)(self.ifindex, 0);
    }
}

/// Creates [`FakeTun`]s with a fixed name and index.
pub struct FakeTunFactory {
    name: String,
    ifindex: u16,
    system: Arc<FakeSystem>,
    link_changed: Arc<dyn Fn(u16, i32) + Send + Sync>,
    fail: AtomicBool,
    /// Every `(address, prefix)` assigned to a device of this factory.
    pub assigned: Arc<Mutex<Vec<(Host, u8)>>>,
}

impl FakeTunFactory {
    pub fn new(
        name: &str,
        ifindex: u16,
        system: Arc<FakeSystem>,
        link_changed: Arc<dyn Fn(u16, i32) + Send + Sync>,
    ) -> Self {
        FakeTunFactory {
            name: name.to_string(),
            ifindex,
            system,
            link_changed,
            fail: AtomicBool::new(false),
            assigned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make the next `create` call fail.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl TunFactory for FakeTunFactory {
    fn create(&self) -> io::Result<Box<dyn TunDevice>> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no free tunnel device",
            ));
        }
        self.system
            .names
            .lock()
            .unwrap()
            .insert(u32::from(self.ifindex), self.name.clone());
        Ok(Box::new(FakeTun {
            name: self.name.clone(),
            ifindex: self.ifindex,
            system: self.system.clone(),
            link_changed: self.link_changed.clone(),
            addr: Mutex::new(None),
            assigned: self.assigned.clone(),
        }))
    }
}
