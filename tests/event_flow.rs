//! Address and link event handling against a simulated kernel.

mod harness;

use std::time::Duration;

use harness::{build, wait_for};
use pfroute_net::AddressScope;
use pfroute_net::Host;
use pfroute_net::msg::{IFF_UP, RTM_DELADDR, RTM_NEWADDR};
use pfroute_net::test_util::{FakeSystem, TestListener, addr_msg, check_backend, link_msg};

fn host(s: &str) -> Host {
    s.parse().unwrap()
}

#[test]
fn test_address_appears_and_roams() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);

    assert_eq!(t.net.interface_name(&host("10.1.0.5")), None);
    t.kernel.send(&addr_msg(RTM_NEWADDR, 3, &host("10.1.0.5")));

    assert!(wait_for(|| {
        t.net.interface_name(&host("10.1.0.5")) == Some("eth0".to_string())
    }));
    check_backend(&t.net).unwrap();

    // the roam notification is debounced, not immediate
    assert!(wait_for(|| t.listener.roam_count() == 1));
    assert_eq!(t.listener.roams.lock().unwrap()[0], true);
}

#[test]
fn test_address_disappears_and_roams_again() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);

    t.kernel.send(&addr_msg(RTM_NEWADDR, 3, &host("10.1.0.5")));
    assert!(wait_for(|| t.net.interface_name(&host("10.1.0.5")).is_some()));
    assert!(wait_for(|| t.listener.roam_count() == 1));

    t.kernel.send(&addr_msg(RTM_DELADDR, 3, &host("10.1.0.5")));
    assert!(wait_for(|| t.net.interface_name(&host("10.1.0.5")).is_none()));
    check_backend(&t.net).unwrap();
    assert!(wait_for(|| t.listener.roam_count() == 2));
}

#[test]
fn test_duplicate_newaddr_is_ignored() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);

    t.kernel.send(&addr_msg(RTM_NEWADDR, 3, &host("10.1.0.5")));
    assert!(wait_for(|| t.net.interface_name(&host("10.1.0.5")).is_some()));
    t.kernel.send(&addr_msg(RTM_NEWADDR, 3, &host("10.1.0.5")));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(t.net.addresses(AddressScope::REGULAR).len(), 1);
    check_backend(&t.net).unwrap();
}

#[test]
fn test_event_for_unknown_interface_is_ignored() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);

    t.kernel.send(&addr_msg(RTM_NEWADDR, 42, &host("10.9.0.1")));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(t.net.interface_name(&host("10.9.0.1")), None);
    assert_eq!(t.listener.roam_count(), 0);
}

#[test]
fn test_bad_version_is_dropped() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    system.add_addr("eth0", IFF_UP, &host("10.1.0.5"));
    let t = build(system, TestListener::new(), None);

    let mut msg = addr_msg(RTM_DELADDR, 3, &host("10.1.0.5"));
    msg[2] = 99;
    t.kernel.send(&msg);
    std::thread::sleep(Duration::from_millis(150));

    // cache unchanged, no roam fired
    assert_eq!(t.net.interface_name(&host("10.1.0.5")), Some("eth0".to_string()));
    assert_eq!(t.listener.roam_count(), 0);
}

#[test]
fn test_truncated_message_is_dropped() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);

    let msg = addr_msg(RTM_NEWADDR, 3, &host("10.1.0.5"));
    t.kernel.send(&msg[..6]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(t.net.interface_name(&host("10.1.0.5")), None);
}

#[test]
fn test_link_down_repopulates_and_roams() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    system.add_addr("eth0", IFF_UP, &host("10.1.0.5"));
    let t = build(system.clone(), TestListener::new(), None);

    assert_eq!(t.net.interface_name(&host("10.1.0.5")), Some("eth0".to_string()));

    // interface goes down and implicitly loses its address
    system.remove_addr("eth0", &host("10.1.0.5"));
    t.kernel.send(&link_msg(3, 0));

    assert!(wait_for(|| t.net.interface_name(&host("10.1.0.5")).is_none()));
    assert!(wait_for(|| t.listener.roam_count() == 1));
    check_backend(&t.net).unwrap();
}

#[test]
fn test_new_interface_appears_via_link_message() {
    let system = FakeSystem::new();
    let t = build(system.clone(), TestListener::new(), None);

    system.add_iface("eth1", 4, IFF_UP);
    system.add_addr("eth1", IFF_UP, &host("10.4.0.1"));
    t.kernel.send(&link_msg(4, IFF_UP as i32));

    assert!(wait_for(|| {
        t.net.interface_name(&host("10.4.0.1")) == Some("eth1".to_string())
    }));
    check_backend(&t.net).unwrap();
}

#[test]
fn test_link_message_for_unresolvable_index_is_discarded() {
    let system = FakeSystem::new();
    let t = build(system, TestListener::new(), None);

    t.kernel.send(&link_msg(17, IFF_UP as i32));
    std::thread::sleep(Duration::from_millis(50));
    assert!(t.net.addresses(AddressScope::all()).is_empty());
}

#[test]
fn test_event_replay_matches_fresh_scan() {
    // feed a sequence of events into one backend...
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);
    for ip in ["10.1.0.5", "10.1.0.6", "2001:db8::5"] {
        t.kernel.send(&addr_msg(RTM_NEWADDR, 3, &host(ip)));
    }
    t.kernel.send(&addr_msg(RTM_DELADDR, 3, &host("10.1.0.6")));
    assert!(wait_for(|| t.net.addresses(AddressScope::REGULAR).len() == 2));

    // ...and compare against a backend scanning the same final state
    let system2 = FakeSystem::new();
    system2.add_iface("eth0", 3, IFF_UP);
    system2.add_addr("eth0", IFF_UP, &host("10.1.0.5"));
    system2.add_addr("eth0", IFF_UP, &host("2001:db8::5"));
    let fresh = build(system2, TestListener::new(), None);

    let mut replayed: Vec<String> = t
        .net
        .addresses(AddressScope::REGULAR)
        .iter()
        .map(|h| h.to_string())
        .collect();
    let mut scanned: Vec<String> = fresh
        .net
        .addresses(AddressScope::REGULAR)
        .iter()
        .map(|h| h.to_string())
        .collect();
    replayed.sort();
    scanned.sort();
    assert_eq!(replayed, scanned);
}

#[test]
fn test_link_local_only_interface_never_answers() {
    let system = FakeSystem::new();
    system.add_iface("awdl0", 8, IFF_UP);
    system.add_addr("awdl0", IFF_UP, &host("fe80::9"));
    let t = build(system, TestListener::new(), None);

    // present in the cache but filtered from every enumeration and
    // from name lookups
    assert!(t.net.addresses(AddressScope::all()).is_empty());
    assert_eq!(t.net.interface_name(&host("fe80::9")), None);
    check_backend(&t.net).unwrap();
}

#[test]
fn test_roam_burst_is_debounced() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);

    for i in 0..8 {
        t.kernel
            .send(&addr_msg(RTM_NEWADDR, 3, &host(&format!("10.1.0.{}", i + 1))));
    }
    assert!(wait_for(|| t.net.addresses(AddressScope::REGULAR).len() == 8));
    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(t.listener.roam_count(), 1, "burst must coalesce into one roam");
}

#[test]
fn test_concurrent_enumeration_stays_consistent() {
    let system = FakeSystem::new();
    system.add_iface("eth0", 3, IFF_UP);
    let t = build(system, TestListener::new(), None);
    let net = std::sync::Arc::new(t.net);

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let net = net.clone();
            std::thread::spawn(move || {
                for _ in 0..100 {
                    check_backend(&net).unwrap();
                    let _ = net.addresses(AddressScope::all());
                }
            })
        })
        .collect();

    for i in 0..100u32 {
        let ip = host(&format!("10.1.{}.{}", i % 4, i % 200 + 1));
        let kind = if i % 3 == 0 { RTM_DELADDR } else { RTM_NEWADDR };
        t.kernel.send(&addr_msg(kind, 3, &ip));
    }
    for r in readers {
        r.join().unwrap();
    }
    assert!(wait_for(|| check_backend(&net).is_ok()));
}
