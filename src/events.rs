//! Event receiver: reads the routing socket and keeps the cache current.
//!
//! Runs on a dedicated thread. Every message is validated (length and
//! version), dispatched by type, and then offered to the reply slot of
//! the request broker; the condition variable is broadcast
//! unconditionally since virtual-IP install/remove waiters re-check the
//! cache on any event.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::Shared;
use crate::host::Host;
use crate::msg::{
    IF_MSGHDR_LEN, IFA_MSGHDR_LEN, IFF_UP, RECV_BUF_LEN, RT_MSGHDR_LEN, RTAX_IFA, RTM_ADD,
    RTM_DELADDR, RTM_DELETE, RTM_GET, RTM_IFINFO, RTM_MIN_LEN, RTM_NEWADDR, RTM_VERSION, RtMsg,
    sockaddrs,
};
use crate::sys::SystemView;

/// Blocking receive loop; exits once `shutdown` is set and the socket is
/// shut down.
pub(crate) fn receive_loop(shared: Arc<Shared>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; RECV_BUF_LEN];
    while !shutdown.load(Ordering::Acquire) {
        let len = match shared.sock.recv(&mut buf) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                ) =>
            {
                continue;
            }
            Err(e) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                warn!(error = %e, "unable to receive from routing socket");
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        process_message(&shared, &buf[..len]);
    }
    debug!("route event receiver stopped");
}

/// Validate and dispatch one message, then run reply correlation.
pub(crate) fn process_message(shared: &Shared, data: &[u8]) {
    if data.len() < RTM_MIN_LEN {
        debug!(len = data.len(), "received invalid routing message");
        return;
    }
    let m = RtMsg::new(data);
    let msglen = m.msglen() as usize;
    if data.len() < msglen {
        debug!(len = data.len(), msglen, "received invalid routing message");
        return;
    }
    if m.version() != RTM_VERSION {
        warn!(version = m.version(), "routing message with unsupported version");
        return;
    }
    let hdrlen = match m.msg_type() {
        RTM_NEWADDR | RTM_DELADDR => IFA_MSGHDR_LEN,
        RTM_IFINFO => IF_MSGHDR_LEN,
        RTM_ADD | RTM_DELETE | RTM_GET => RT_MSGHDR_LEN,
        _ => return,
    };
    if msglen < hdrlen {
        debug!(msglen, hdrlen, "ignoring short routing message");
        return;
    }
    match m.msg_type() {
        RTM_NEWADDR | RTM_DELADDR => process_addr(shared, data),
        RTM_IFINFO => process_link(shared, data),
        // route changes made by other processes don't affect the cache
        RTM_ADD | RTM_DELETE | RTM_GET => {}
        _ => {}
    }

    let mut broker = shared.broker.lock().unwrap();
    if m.rt_pid() == shared.pid && m.rt_seq() == broker.waiting_seq {
        broker.reply = Some(data[..msglen].to_vec());
    }
    // wake every waiter: the query broker and any virtual-IP flow
    // re-testing cache visibility
    shared.cv.notify_all();
}

/// Apply an address appearance/disappearance to the cache.
fn process_addr(shared: &Shared, data: &[u8]) {
    let m = RtMsg::new(data);
    let host = sockaddrs(data, IFA_MSGHDR_LEN, m.ifa_addrs())
        .find(|(role, _)| *role == RTAX_IFA)
        .and_then(|(_, sa)| Host::from_sockaddr(sa));
    let Some(host) = host else {
        return;
    };
    let deleted = m.msg_type() == RTM_DELADDR;
    let ifindex = u32::from(m.ifa_index());

    let mut roam = false;
    {
        let mut cache = shared.cache.write().unwrap();
        let Some(iface) = cache.iface_by_index(ifindex) else {
            return;
        };
        let usable = iface.usable;
        let ifname = iface.ifname.clone();
        let present = iface.addrs.iter().any(|a| a.ip == host);

        let mut changed = false;
        if present && deleted {
            if let Some(entry) = cache.remove_addr(ifindex, &host) {
                if !entry.is_virtual && usable {
                    changed = true;
                    info!(address = %host, interface = %ifname, "address disappeared");
                }
            }
        } else if !present && !deleted {
            cache.insert_addr(ifindex, host.clone());
            changed = true;
            if usable {
                info!(address = %host, interface = %ifname, "address appeared");
            }
        }

        if changed
            && cache
                .iface_by_index(ifindex)
                .is_some_and(|i| i.up_and_usable())
        {
            roam = true;
        }
    }

    if roam {
        fire_roam(shared, true);
    }
}

/// Apply a link-state change: overwrite the flag word and repopulate the
/// interface's addresses, since some transitions add or drop addresses
/// without individual address events. Unknown indexes become new
/// interface records.
fn process_link(shared: &Shared, data: &[u8]) {
    let m = RtMsg::new(data);
    let ifindex = u32::from(m.ifm_index());
    let flags = m.ifm_flags() as u32;

    let mut roam = false;
    {
        let mut cache = shared.cache.write().unwrap();
        if let Some(iface) = cache.iface_by_index(ifindex) {
            let name = iface.ifname.clone();
            if iface.usable {
                let was_up = iface.is_up();
                let now_up = flags & IFF_UP != 0;
                if was_up != now_up {
                    roam = true;
                    if now_up {
                        info!(interface = %name, "interface activated");
                    } else {
                        info!(interface = %name, "interface deactivated");
                    }
                }
            }
            cache.set_flags(ifindex, flags);
            cache.repopulate(ifindex, os_addrs(shared.system.as_ref(), &name));
        } else if let Some(name) = shared.system.index_to_name(ifindex) {
            info!(interface = %name, "interface appeared");
            let usable = shared.listener.is_interface_usable(&name);
            cache.add_or_find(&name, ifindex, flags, usable);
            cache.repopulate(ifindex, os_addrs(shared.system.as_ref(), &name));
        }
    }

    if roam {
        fire_roam(shared, true);
    }
}

/// Current OS-reported addresses of the named interface; empty when the
/// query fails.
fn os_addrs(system: &dyn SystemView, name: &str) -> Vec<Host> {
    match system.addresses() {
        Ok(rows) => rows
            .into_iter()
            .filter(|row| row.name == name)
            .filter_map(|row| row.addr)
            .collect(),
        Err(e) => {
            debug!(error = %e, interface = %name, "interface address query failed");
            Vec::new()
        }
    }
}

/// Arm a debounced roam notification.
pub(crate) fn fire_roam(shared: &Shared, address_changed: bool) {
    let listener = shared.listener.clone();
    shared.debounce.fire(&shared.scheduler, move || {
        listener.roam(address_changed);
    });
}
