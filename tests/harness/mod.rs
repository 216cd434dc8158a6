//! Test harness simulating the kernel end of the routing socket.
//!
//! The backend is built on one end of an AF_UNIX datagram socketpair;
//! the harness holds the other end and plays kernel: it reads the
//! messages the backend sends and injects events and replies.

#![allow(dead_code)]

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

use pfroute_net::test_util::{FakeSystem, FakeTunFactory, TestListener, link_msg};
use pfroute_net::{Config, Host, PfrouteNet, RouteSocket};

/// The kernel side of the socketpair.
#[derive(Clone)]
pub struct SimKernel {
    fd: Arc<OwnedFd>,
}

impl SimKernel {
    /// Deliver one kernel message to the backend.
    pub fn send(&self, msg: &[u8]) {
        let n = unsafe { libc::send(self.fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
        assert_eq!(n, msg.len() as isize, "sim kernel send");
    }

    /// Read the next message the backend sent, if one arrives in time.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 2048];
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if n > 0 {
                return Some(buf[..n as usize].to_vec());
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn recv(&self) -> Vec<u8> {
        self.recv_timeout(Duration::from_secs(2))
            .expect("backend sent no message")
    }
}

pub struct TestNet {
    pub net: PfrouteNet,
    pub kernel: SimKernel,
    pub listener: Arc<TestListener>,
    pub system: Arc<FakeSystem>,
    /// Addresses assigned to fake tunnel devices, when a tunnel factory
    /// was configured.
    pub tun_assigned: Arc<Mutex<Vec<(Host, u8)>>>,
}

/// Build a backend against a simulated kernel. `tun` optionally names
/// the fake tunnel device (name, interface index) to offer to `add_ip`;
/// the fake feeds its link changes back through the simulated kernel,
/// just as a real tunnel's events would arrive on the routing socket.
pub fn build(
    system: Arc<FakeSystem>,
    listener: Arc<TestListener>,
    tun: Option<(&str, u16)>,
) -> TestNet {
    let (ours, kernel_end) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::empty(),
    )
    .expect("socketpair");
    let kernel_fd = Arc::new(kernel_end);

    let mut config = Config::new(listener.clone())
        .system(system.clone())
        .socket(RouteSocket::from_fd(ours));
    let mut tun_assigned = Arc::new(Mutex::new(Vec::new()));
    if let Some((name, ifindex)) = tun {
        let fd = kernel_fd.clone();
        let hook: Arc<dyn Fn(u16, i32) + Send + Sync> = Arc::new(move |idx, flags| {
            let msg = link_msg(idx, flags);
            let n = unsafe { libc::send(fd.as_raw_fd(), msg.as_ptr().cast(), msg.len(), 0) };
            assert_eq!(n, msg.len() as isize);
        });
        let factory = FakeTunFactory::new(name, ifindex, system.clone(), hook);
        tun_assigned = factory.assigned.clone();
        config = config.tun_factory(Arc::new(factory));
    }

    TestNet {
        net: config.build().expect("backend construction"),
        kernel: SimKernel { fd: kernel_fd },
        listener,
        system,
        tun_assigned,
    }
}

/// Poll `cond` for up to two seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
