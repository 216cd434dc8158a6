//! The network backend: construction, upward API, kernel queries,
//! virtual-IP lifecycle and route programming.
//!
//! One raw routing socket is shared between the event receiver and all
//! request paths. Synchronous kernel queries are serialized through a
//! single waiting-sequence slot: the receiver stores a reply matching
//! our pid and the waiting sequence, then broadcasts a condition
//! variable on every message so that query waiters and virtual-IP
//! install/remove waiters re-check their predicates.
//!
//! Lock order: the cache lock is taken before the broker mutex; the
//! receiver never holds both at once. Virtual-IP installation enters the
//! broker monitor first (to wait for the address to appear) and only
//! takes the cache write lock after leaving it.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;
use ipnet::IpNet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{AddressScope, IfaceMatch, NetCache};
use crate::events;
use crate::host::Host;
use crate::msg::{
    MsgBuilder, RT_MSGHDR_LEN, RTAX_DST, RTAX_GATEWAY, RTAX_IFA, RTAX_IFP, RTAX_NETMASK, RTF_GATEWAY,
    RTF_HOST, RTF_STATIC, RTF_UP, RTM_ADD, RTM_DELETE, RTM_GET, RtMsg, sockaddrs,
};
use crate::scheduler::{Debouncer, Scheduler};
use crate::sys::{OsSystem, RouteSocket, SystemView};
use crate::tun::{SysTunFactory, TunDevice, TunFactory};

/// How long to wait for a single kernel reply or cache-change event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

/// Delay before a roam notification is delivered; further topology
/// changes within this window are coalesced into the pending one.
pub const ROAM_DELAY: Duration = Duration::from_millis(100);

bitflags! {
    /// Capabilities this backend expects from its consumer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KernelFeatures: u32 {
        /// Explicit exclude routes are required for peers; the kernel
        /// offers no policy-based bypass.
        const REQUIRE_EXCLUDE_ROUTE = 1;
    }
}

/// Errors surfaced across the backend API.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("routing socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("kernel request failed")]
    Failed,
    #[error("virtual IP not found")]
    NotFound,
}

/// Callbacks into the embedding daemon.
///
/// Handed in at construction; implementations must be quick and must not
/// call back into the backend from `tun_event`, which runs under the
/// cache write lock.
pub trait NetworkListener: Send + Sync {
    /// Whether the named interface may be used at all. Decided once per
    /// interface, on first observation.
    fn is_interface_usable(&self, _name: &str) -> bool {
        true
    }

    /// The set of usable addresses or interface states changed.
    fn roam(&self, _address_changed: bool) {}

    /// A tunnel device was installed (`registered`) or removed.
    fn tun_event(&self, _tun: &dyn TunDevice, _registered: bool) {}
}

pub(crate) struct Broker {
    /// Sequence number the active query waits for; 0 when the slot is
    /// free.
    pub waiting_seq: i32,
    /// Last reply captured for the waiting sequence.
    pub reply: Option<Vec<u8>>,
}

pub(crate) struct Shared {
    pub cache: RwLock<NetCache>,
    pub broker: Mutex<Broker>,
    pub cv: Condvar,
    pub sock: RouteSocket,
    pub pid: i32,
    pub seq: AtomicI32,
    pub system: Arc<dyn SystemView>,
    pub listener: Arc<dyn NetworkListener>,
    pub scheduler: Scheduler,
    pub debounce: Debouncer,
}

impl Shared {
    pub fn next_seq(&self) -> i32 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Backend configuration. `listener` is mandatory; everything else has
/// production defaults.
pub struct Config {
    listener: Arc<dyn NetworkListener>,
    tun_factory: Arc<dyn TunFactory>,
    system: Arc<dyn SystemView>,
    events: bool,
    roam_delay: Duration,
    socket: Option<RouteSocket>,
}

impl Config {
    pub fn new(listener: Arc<dyn NetworkListener>) -> Self {
        Config {
            listener,
            tun_factory: Arc::new(SysTunFactory),
            system: Arc::new(OsSystem),
            events: true,
            roam_delay: ROAM_DELAY,
            socket: None,
        }
    }

    pub fn tun_factory(mut self, factory: Arc<dyn TunFactory>) -> Self {
        self.tun_factory = factory;
        self
    }

    pub fn system(mut self, system: Arc<dyn SystemView>) -> Self {
        self.system = system;
        self
    }

    /// Disable the event receiver. For hosts without background threads:
    /// the read side of the socket is shut down and the cache stays
    /// static after the initial scan.
    pub fn events(mut self, events: bool) -> Self {
        self.events = events;
        self
    }

    pub fn roam_delay(mut self, delay: Duration) -> Self {
        self.roam_delay = delay;
        self
    }

    /// Use an existing socket instead of opening the kernel routing
    /// socket, e.g. one end of a socketpair driven by a simulated
    /// kernel.
    pub fn socket(mut self, socket: RouteSocket) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn build(self) -> Result<PfrouteNet, NetError> {
        let sock = match self.socket {
            Some(sock) => sock,
            None => RouteSocket::open().inspect_err(|e| {
                warn!(error = %e, "unable to create routing socket");
            })?,
        };

        let shared = Arc::new(Shared {
            cache: RwLock::new(NetCache::new()),
            broker: Mutex::new(Broker {
                waiting_seq: 0,
                reply: None,
            }),
            cv: Condvar::new(),
            sock,
            pid: unsafe { libc::getpid() },
            seq: AtomicI32::new(0),
            system: self.system,
            listener: self.listener,
            scheduler: Scheduler::new(),
            debounce: Debouncer::new(self.roam_delay),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let receiver = if self.events {
            let shared_rx = shared.clone();
            let shutdown_rx = shutdown.clone();
            let handle = thread::Builder::new()
                .name("route-events".to_string())
                .spawn(move || events::receive_loop(shared_rx, shutdown_rx))
                .map_err(NetError::Socket)?;
            Some(handle)
        } else {
            if let Err(e) = shared.sock.shutdown_read() {
                warn!(error = %e, "closing read end of routing socket failed");
            }
            None
        };

        let net = PfrouteNet {
            shared,
            tun_factory: self.tun_factory,
            shutdown,
            receiver,
        };
        if let Err(e) = net.init_cache() {
            warn!(error = %e, "unable to get interface list");
            return Err(NetError::Socket(e));
        }
        Ok(net)
    }
}

/// Live view of the host's network state plus route and virtual-IP
/// management.
pub struct PfrouteNet {
    pub(crate) shared: Arc<Shared>,
    tun_factory: Arc<dyn TunFactory>,
    shutdown: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl PfrouteNet {
    pub fn features(&self) -> KernelFeatures {
        KernelFeatures::REQUIRE_EXCLUDE_ROUTE
    }

    /// Populate the cache from the OS's interface listing.
    fn init_cache(&self) -> io::Result<()> {
        let rows = self.shared.system.addresses()?;
        let mut cache = self.shared.cache.write().unwrap();
        for row in rows {
            let ifindex = self.shared.system.name_to_index(&row.name);
            let usable = self.shared.listener.is_interface_usable(&row.name);
            let idx = cache.add_or_find(&row.name, ifindex, row.flags, usable);
            if let Some(addr) = row.addr {
                cache.insert_addr(idx, addr);
            }
        }
        for iface in cache.ifaces() {
            if iface.up_and_usable() {
                let addrs: Vec<String> =
                    iface.addrs.iter().map(|a| a.ip.to_string()).collect();
                debug!(interface = %iface.ifname, addresses = ?addrs, "known interface");
            }
        }
        Ok(())
    }

    /// Name of the interface carrying `ip`, preferring up-and-usable
    /// interfaces. An address on an unusable (but up) interface is known
    /// yet yields no name.
    pub fn interface_name(&self, ip: &Host) -> Option<String> {
        if ip.is_any() || ip.is_link_local() {
            return None;
        }
        let cache = self.shared.cache.read().unwrap();
        if let Some(iface) = cache.lookup_iface(ip, IfaceMatch::UpAndUsable) {
            debug!(address = %ip, interface = %iface.ifname, "address is local");
            return Some(iface.ifname.clone());
        }
        if cache.lookup_iface(ip, IfaceMatch::Up).is_none() {
            debug!(address = %ip, "not a local address or the interface is down");
        }
        None
    }

    /// Snapshot of local addresses matching `which`.
    pub fn addresses(&self, which: AddressScope) -> Vec<Host> {
        self.shared.cache.read().unwrap().addresses(which)
    }

    /// Ask the kernel which source address it would pick for packets
    /// toward `dest`.
    pub fn source_addr(&self, dest: &Host, src_hint: Option<&Host>) -> Option<Host> {
        self.query_route(false, dest, src_hint)
    }

    /// Ask the kernel for the next hop toward `dest`.
    pub fn nexthop(&self, dest: &Host, src_hint: Option<&Host>) -> Option<Host> {
        self.query_route(true, dest, src_hint)
    }

    /// Issue an `RTM_GET` and wait for the correlated reply.
    ///
    /// Only one query is in flight at any time: the waiting-sequence
    /// slot is claimed under the broker mutex and every wake re-checks
    /// whether the stored reply belongs to this query.
    fn query_route(&self, nexthop: bool, dest: &Host, src_hint: Option<&Host>) -> Option<Host> {
        let shared = &self.shared;
        let seq = shared.next_seq();
        let mut b = MsgBuilder::new(RTM_GET, 0, shared.pid, seq);
        b.add_addr(RTAX_DST, dest);
        if !nexthop {
            // an empty interface-name sockaddr makes the kernel include
            // the source address in its reply
            b.add_ifname(RTAX_IFP, "");
        }
        if let Some(src) = src_hint {
            b.add_addr(RTAX_IFA, src);
        }
        let msg = b.finish();

        let mut broker = shared.broker.lock().unwrap();
        while broker.waiting_seq != 0 {
            broker = shared.cv.wait(broker).unwrap();
        }
        broker.waiting_seq = seq;

        let mut host = None;
        match shared.sock.send(&msg) {
            Ok(n) if n == msg.len() => loop {
                let (guard, timeout) = shared.cv.wait_timeout(broker, EVENT_TIMEOUT).unwrap();
                broker = guard;
                if timeout.timed_out() {
                    break;
                }
                {
                    let Some(reply) = broker.reply.as_deref() else {
                        continue;
                    };
                    let r = RtMsg::new(reply);
                    if reply.len() < RT_MSGHDR_LEN || r.rt_seq() != seq {
                        continue;
                    }
                    for (role, sa) in sockaddrs(reply, RT_MSGHDR_LEN, r.rt_addrs()) {
                        if nexthop && role == RTAX_GATEWAY {
                            host = Host::from_sockaddr(sa);
                            break;
                        }
                        if nexthop && role == RTAX_DST && r.rt_flags() & RTF_HOST != 0 {
                            // a cloned direct route: the destination is
                            // its own next hop
                            host = Host::from_sockaddr(sa);
                            break;
                        }
                        if !nexthop && role == RTAX_IFA {
                            host = Host::from_sockaddr(sa);
                            break;
                        }
                    }
                }
                break;
            },
            Ok(_) | Err(_) => {
                warn!(dest = %dest, "route lookup failed");
            }
        }

        broker.waiting_seq = 0;
        shared.cv.notify_one();
        drop(broker);
        host
    }

    /// Install a virtual IP on a fresh tunnel device.
    ///
    /// A negative prefix means a host route covering the full address
    /// width. Returns once the receiver has observed the address on the
    /// tunnel interface, or fails after the kernel stayed silent for a
    /// second.
    pub fn add_ip(&self, vip: &Host, prefix: i32, _ifname_hint: Option<&str>) -> Result<(), NetError> {
        let shared = &self.shared;
        let tun = self.tun_factory.create().map_err(|e| {
            warn!(error = %e, "unable to create tunnel device");
            NetError::Failed
        })?;
        let prefix = if prefix < 0 {
            (vip.addr_len() * 8) as u8
        } else {
            prefix as u8
        };
        if tun.up().and_then(|_| tun.set_address(vip, prefix)).is_err() {
            return Err(NetError::Failed);
        }

        // wait until the kernel's address event made it into the cache
        let mut timeout = false;
        {
            let mut broker = shared.broker.lock().unwrap();
            while !timeout && !self.vip_visible(vip) {
                let (guard, res) = shared.cv.wait_timeout(broker, EVENT_TIMEOUT).unwrap();
                broker = guard;
                timeout = res.timed_out();
            }
        }
        if timeout {
            warn!(vip = %vip, tun = %tun.name(), "virtual IP did not appear");
            return Err(NetError::Failed);
        }

        let mut cache = shared.cache.write().unwrap();
        let tun_name = tun.name().to_string();
        cache.push_tun(tun);
        cache.mark_virtual(&tun_name, vip);
        if let Some(tun) = cache.tuns().last() {
            // notify while holding the lock so nobody can delete the
            // tunnel concurrently; listeners are required to be quick
            shared.listener.tun_event(tun.as_ref(), true);
        }
        info!(vip = %vip, prefix, tun = %tun_name, "virtual IP installed");
        Ok(())
    }

    /// Remove the tunnel carrying `vip`. With `wait`, block until the
    /// address disappeared from the cache or a second passed.
    pub fn del_ip(&self, vip: &Host, _prefix: i32, wait: bool) -> Result<(), NetError> {
        let shared = &self.shared;
        {
            let mut cache = shared.cache.write().unwrap();
            let Some(tun) = cache.take_tun(vip) else {
                return Err(NetError::NotFound);
            };
            shared.listener.tun_event(tun.as_ref(), false);
            // destroying under the lock keeps the detach and the device
            // teardown atomic with respect to other tunnel operations
            drop(tun);
        }
        info!(vip = %vip, "virtual IP removed");

        if wait {
            let mut timeout = false;
            let mut broker = shared.broker.lock().unwrap();
            while !timeout && self.vip_visible(vip) {
                let (guard, res) = shared.cv.wait_timeout(broker, EVENT_TIMEOUT).unwrap();
                broker = guard;
                timeout = res.timed_out();
            }
            drop(broker);
            if timeout {
                warn!(vip = %vip, "virtual IP did not disappear from tunnel");
                return Err(NetError::Failed);
            }
        }
        Ok(())
    }

    /// Whether `vip` currently resolves to any up interface.
    fn vip_visible(&self, vip: &Host) -> bool {
        self.shared
            .cache
            .read()
            .unwrap()
            .lookup_iface(vip, IfaceMatch::Up)
            .is_some()
    }

    /// Program a static route.
    pub fn add_route(
        &self,
        dst: IpNet,
        gateway: Option<&Host>,
        src_ip: Option<&Host>,
        if_name: Option<&str>,
    ) -> Result<(), NetError> {
        let _ = src_ip;
        self.manage_route(RTM_ADD, dst.addr(), dst.prefix_len(), gateway, if_name)
    }

    /// Remove a static route.
    pub fn del_route(
        &self,
        dst: IpNet,
        gateway: Option<&Host>,
        src_ip: Option<&Host>,
        if_name: Option<&str>,
    ) -> Result<(), NetError> {
        let _ = src_ip;
        self.manage_route(RTM_DELETE, dst.addr(), dst.prefix_len(), gateway, if_name)
    }

    fn manage_route(
        &self,
        op: u8,
        dst: IpAddr,
        prefix: u8,
        gateway: Option<&Host>,
        if_name: Option<&str>,
    ) -> Result<(), NetError> {
        if prefix == 0 {
            // the kernel special-cases the 0/0 route; program two /1
            // halves instead
            let upper = match dst {
                IpAddr::V4(a) => {
                    let mut octets = a.octets();
                    octets[0] |= 0x80;
                    IpAddr::from(octets)
                }
                IpAddr::V6(a) => {
                    let mut octets = a.octets();
                    octets[0] |= 0x80;
                    IpAddr::from(octets)
                }
            };
            self.manage_route(op, upper, 1, gateway, if_name)?;
            return self.manage_route(op, dst, 1, gateway, if_name);
        }

        let dst = Host::from(dst);
        let host_route = match dst.ip() {
            IpAddr::V4(_) => prefix == 32,
            IpAddr::V6(_) => prefix == 128,
        };
        let mut flags = RTF_UP | RTF_STATIC;
        if gateway.is_some() {
            flags |= RTF_GATEWAY;
        }
        if host_route {
            flags |= RTF_HOST | RTF_GATEWAY;
        }

        let seq = self.shared.next_seq();
        let mut b = MsgBuilder::new(op, flags, self.shared.pid, seq);
        b.add_addr(RTAX_DST, &dst);
        if let Some(gw) = gateway {
            b.add_addr(RTAX_GATEWAY, gw);
        }
        if !host_route {
            b.add_netmask(RTAX_NETMASK, dst.family(), prefix);
        }
        if let Some(name) = if_name {
            b.add_ifname(RTAX_IFP, name);
        }
        let msg = b.finish();

        match self.shared.sock.send(&msg) {
            Ok(n) if n == msg.len() => Ok(()),
            Ok(_) => {
                warn!(dst = %dst, prefix, "short send while programming route");
                Err(NetError::Failed)
            }
            Err(e) => {
                let verb = if op == RTM_ADD { "adding" } else { "deleting" };
                warn!(dst = %dst, prefix, error = %e, "{verb} route failed");
                Err(NetError::Failed)
            }
        }
    }
}

impl Drop for PfrouteNet {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.shared.sock.shutdown_both();
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}
