//! Host network state tracking and route management over a BSD-style
//! routing socket.
//!
//! The crate keeps a live, in-memory mirror of the host's interfaces and
//! addresses by listening on the kernel's routing socket, answers
//! source-address and next-hop queries against the kernel routing table,
//! installs tunnel devices for virtual IPs, programs static routes, and
//! raises debounced roaming notifications when connectivity changes.

pub mod backend;
pub mod cache;
pub mod host;
pub mod msg;
pub mod scheduler;
pub mod sys;
pub mod test_util;
pub mod tun;

mod events;

pub use backend::{Config, KernelFeatures, NetError, NetworkListener, PfrouteNet};
pub use cache::{AddressScope, IfaceMatch, NetCache};
pub use host::Host;
pub use sys::{IfaceAddr, OsSystem, RouteSocket, SystemView};
pub use tun::{SysTunFactory, TunDevice, TunFactory};
