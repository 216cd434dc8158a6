//! Routing message codec.
//!
//! Messages exchanged on the routing socket share a common prefix
//! (length, version, type) followed by a type-specific fixed header and a
//! packed list of sockaddrs. Which sockaddrs are present is indicated by a
//! role bitfield in the header: bit `i` set means the sockaddr for role
//! `i` follows, in role order.
//!
//! Wire constants and layouts are defined here (classic BSD values) so
//! the codec is self-contained and byte-exact on every build target.
//! Offsets below are documented per header type; all fields are
//! native-endian, matching the kernel's in-memory structures.

use crate::host::Host;

/// Routing message version understood by this codec.
pub const RTM_VERSION: u8 = 5;

pub const RTM_ADD: u8 = 0x1;
pub const RTM_DELETE: u8 = 0x2;
pub const RTM_GET: u8 = 0x4;
pub const RTM_NEWADDR: u8 = 0xc;
pub const RTM_DELADDR: u8 = 0xd;
pub const RTM_IFINFO: u8 = 0xe;

/// Well-known sockaddr roles, in the order they appear on the wire.
pub const RTAX_DST: usize = 0;
pub const RTAX_GATEWAY: usize = 1;
pub const RTAX_NETMASK: usize = 2;
pub const RTAX_GENMASK: usize = 3;
pub const RTAX_IFP: usize = 4;
pub const RTAX_IFA: usize = 5;
pub const RTAX_AUTHOR: usize = 6;
pub const RTAX_BRD: usize = 7;
pub const RTAX_MAX: usize = 8;

pub const RTF_UP: i32 = 0x1;
pub const RTF_GATEWAY: i32 = 0x2;
pub const RTF_HOST: i32 = 0x4;
pub const RTF_STATIC: i32 = 0x800;

/// Interface flag bits mirrored from link messages.
pub const IFF_UP: u32 = 0x1;
pub const IFF_LOOPBACK: u32 = 0x8;

/// Route message header (`RTM_ADD`/`RTM_DELETE`/`RTM_GET`):
/// msglen u16 @0, version u8 @2, type u8 @3, index u16 @4, flags i32 @8,
/// addrs i32 @12, pid i32 @16, seq i32 @20, errno i32 @24, metrics after.
pub const RT_MSGHDR_LEN: usize = 92;

/// Address message header (`RTM_NEWADDR`/`RTM_DELADDR`):
/// addrs i32 @4, flags i32 @8, index u16 @12, metric i32 @16.
pub const IFA_MSGHDR_LEN: usize = 20;

/// Link message header (`RTM_IFINFO`):
/// addrs i32 @4, flags i32 @8, index u16 @12, interface data after.
pub const IF_MSGHDR_LEN: usize = 112;

/// Shortest buffer that can be validated at all: through the flags word
/// of the route header.
pub const RTM_MIN_LEN: usize = 8;

/// Link-layer sockaddr: len u8 @0, family u8 @1, index u16 @2, type u8 @4,
/// nlen u8 @5, alen u8 @6, slen u8 @7, name bytes from @8.
pub const AF_LINK: u8 = 18;
pub const SA_DL_LEN: usize = 20;
pub const SA_DL_DATA: usize = 12;

/// Room for the largest message a kernel can deliver: the biggest fixed
/// header plus one maximum-size sockaddr slot per role.
pub const RECV_BUF_LEN: usize = IF_MSGHDR_LEN + RTAX_MAX * 128;

pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    buf.get(off..off + 2)
        .map(|b| u16::from_ne_bytes([b[0], b[1]]))
        .unwrap_or(0)
}

pub(crate) fn get_i32(buf: &[u8], off: usize) -> i32 {
    buf.get(off..off + 4)
        .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

pub(crate) fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_ne_bytes());
}

pub(crate) fn put_i32(buf: &mut [u8], off: usize, val: i32) {
    buf[off..off + 4].copy_from_slice(&val.to_ne_bytes());
}

/// Read-only view of a routing message buffer.
///
/// Accessors are named for the header they belong to; callers pick the
/// right set based on `msg_type()`.
#[derive(Clone, Copy)]
pub struct RtMsg<'a> {
    buf: &'a [u8],
}

impl<'a> RtMsg<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        RtMsg { buf }
    }

    pub fn msglen(&self) -> u16 {
        get_u16(self.buf, 0)
    }

    pub fn version(&self) -> u8 {
        self.buf.get(2).copied().unwrap_or(0)
    }

    pub fn msg_type(&self) -> u8 {
        self.buf.get(3).copied().unwrap_or(0)
    }

    pub fn rt_flags(&self) -> i32 {
        get_i32(self.buf, 8)
    }

    pub fn rt_addrs(&self) -> i32 {
        get_i32(self.buf, 12)
    }

    pub fn rt_pid(&self) -> i32 {
        get_i32(self.buf, 16)
    }

    pub fn rt_seq(&self) -> i32 {
        get_i32(self.buf, 20)
    }

    pub fn ifa_addrs(&self) -> i32 {
        get_i32(self.buf, 4)
    }

    pub fn ifa_index(&self) -> u16 {
        get_u16(self.buf, 12)
    }

    pub fn ifm_addrs(&self) -> i32 {
        get_i32(self.buf, 4)
    }

    pub fn ifm_flags(&self) -> i32 {
        get_i32(self.buf, 8)
    }

    pub fn ifm_index(&self) -> u16 {
        get_u16(self.buf, 12)
    }
}

/// Iterator over the `(role, sockaddr)` pairs packed after a message
/// header.
///
/// Each yielded sockaddr is paired with the lowest role bit still set.
/// Iteration stops as soon as the remaining bytes cannot hold the next
/// sockaddr's self-declared length, silently truncating malformed tails.
pub struct AddrIter<'a> {
    roles: i32,
    buf: &'a [u8],
    off: usize,
}

/// Iterate the sockaddrs of `msg`, whose fixed header is `hdrlen` bytes
/// and whose role bitfield is `roles`.
pub fn sockaddrs(msg: &[u8], hdrlen: usize, roles: i32) -> AddrIter<'_> {
    let end = (get_u16(msg, 0) as usize).min(msg.len());
    AddrIter {
        roles,
        buf: &msg[..end],
        off: hdrlen.min(end),
    }
}

impl<'a> Iterator for AddrIter<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.buf.len().checked_sub(self.off)?;
        if remaining < 1 {
            return None;
        }
        let sa_len = self.buf[self.off] as usize;
        if remaining < sa_len {
            return None;
        }
        for role in 0..RTAX_MAX {
            let bit = 1 << role;
            if self.roles & bit != 0 {
                self.roles &= !bit;
                let sa = &self.buf[self.off..self.off + sa_len];
                self.off += sa_len;
                return Some((role, sa));
            }
        }
        None
    }
}

/// Builder for outgoing route messages.
///
/// Starts from a zeroed route header and appends role-tagged sockaddrs,
/// keeping the length field and the role bitfield in sync. Roles must be
/// appended in ascending role order, which is what the kernel expects.
pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    pub fn new(msg_type: u8, flags: i32, pid: i32, seq: i32) -> Self {
        let mut buf = vec![0u8; RT_MSGHDR_LEN];
        put_u16(&mut buf, 0, RT_MSGHDR_LEN as u16);
        buf[2] = RTM_VERSION;
        buf[3] = msg_type;
        put_i32(&mut buf, 8, flags);
        put_i32(&mut buf, 16, pid);
        put_i32(&mut buf, 20, seq);
        MsgBuilder { buf }
    }

    fn append(&mut self, role: usize, sa: &[u8]) {
        self.buf.extend_from_slice(sa);
        let len = self.buf.len() as u16;
        put_u16(&mut self.buf, 0, len);
        let roles = get_i32(&self.buf, 12) | (1 << role);
        put_i32(&mut self.buf, 12, roles);
    }

    /// Append the sockaddr of `host` under `role`.
    pub fn add_addr(&mut self, role: usize, host: &Host) {
        let sa = host.sockaddr();
        self.append(role, &sa);
    }

    /// Append a netmask sockaddr for `prefix` bits of `family`.
    pub fn add_netmask(&mut self, role: usize, family: u8, prefix: u8) {
        if let Some(mask) = Host::netmask(family, prefix) {
            self.add_addr(role, &mask);
        }
    }

    /// Append a link-layer sockaddr carrying an interface name. Names
    /// longer than the sockaddr's name field are skipped.
    pub fn add_ifname(&mut self, role: usize, name: &str) {
        if name.len() > SA_DL_DATA {
            return;
        }
        let mut sa = [0u8; SA_DL_LEN];
        sa[0] = SA_DL_LEN as u8;
        sa[1] = AF_LINK;
        sa[5] = name.len() as u8;
        sa[8..8 + name.len()].copy_from_slice(name.as_bytes());
        self.append(role, &sa);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_header_fields() {
        let msg = MsgBuilder::new(RTM_GET, RTF_UP | RTF_STATIC, 1234, 7).finish();
        let m = RtMsg::new(&msg);
        assert_eq!(m.msglen() as usize, RT_MSGHDR_LEN);
        assert_eq!(m.version(), RTM_VERSION);
        assert_eq!(m.msg_type(), RTM_GET);
        assert_eq!(m.rt_flags(), RTF_UP | RTF_STATIC);
        assert_eq!(m.rt_pid(), 1234);
        assert_eq!(m.rt_seq(), 7);
        assert_eq!(m.rt_addrs(), 0);
    }

    #[test]
    fn test_encode_then_iterate_roundtrip() {
        let dst: Host = "10.0.0.0".parse().unwrap();
        let gw: Host = "192.0.2.1".parse().unwrap();
        let mut b = MsgBuilder::new(RTM_ADD, RTF_UP | RTF_STATIC, 1, 2);
        b.add_addr(RTAX_DST, &dst);
        b.add_addr(RTAX_GATEWAY, &gw);
        b.add_netmask(RTAX_NETMASK, crate::host::AF_INET, 8);
        b.add_ifname(RTAX_IFP, "eth0");
        let msg = b.finish();

        let m = RtMsg::new(&msg);
        let got: Vec<(usize, Option<Host>)> = sockaddrs(&msg, RT_MSGHDR_LEN, m.rt_addrs())
            .map(|(role, sa)| (role, Host::from_sockaddr(sa)))
            .collect();
        assert_eq!(got.len(), 4);
        assert_eq!(got[0], (RTAX_DST, Some(dst)));
        assert_eq!(got[1], (RTAX_GATEWAY, Some(gw)));
        assert_eq!(got[2], (RTAX_NETMASK, Some("255.0.0.0".parse().unwrap())));
        assert_eq!(got[3].0, RTAX_IFP);
        assert_eq!(got[3].1, None);
    }

    #[test]
    fn test_ifname_sockaddr_layout() {
        let mut b = MsgBuilder::new(RTM_GET, 0, 1, 1);
        b.add_ifname(RTAX_IFP, "tun3");
        let msg = b.finish();
        let (role, sa) = sockaddrs(&msg, RT_MSGHDR_LEN, RtMsg::new(&msg).rt_addrs())
            .next()
            .unwrap();
        assert_eq!(role, RTAX_IFP);
        assert_eq!(sa[0] as usize, SA_DL_LEN);
        assert_eq!(sa[1], AF_LINK);
        assert_eq!(sa[5] as usize, 4);
        assert_eq!(&sa[8..12], b"tun3");
    }

    #[test]
    fn test_ifname_too_long_is_skipped() {
        let mut b = MsgBuilder::new(RTM_GET, 0, 1, 1);
        b.add_ifname(RTAX_IFP, "averylongifname");
        let msg = b.finish();
        assert_eq!(msg.len(), RT_MSGHDR_LEN);
        assert_eq!(RtMsg::new(&msg).rt_addrs(), 0);
    }

    #[test]
    fn test_empty_ifname_still_sets_role() {
        let mut b = MsgBuilder::new(RTM_GET, 0, 1, 1);
        b.add_ifname(RTAX_IFP, "");
        let msg = b.finish();
        let m = RtMsg::new(&msg);
        assert_eq!(m.rt_addrs(), 1 << RTAX_IFP);
        assert_eq!(msg.len(), RT_MSGHDR_LEN + SA_DL_LEN);
    }

    #[test]
    fn test_truncated_tail_stops_iteration() {
        let dst: Host = "10.0.0.1".parse().unwrap();
        let gw: Host = "192.0.2.1".parse().unwrap();
        let mut b = MsgBuilder::new(RTM_ADD, 0, 1, 2);
        b.add_addr(RTAX_DST, &dst);
        b.add_addr(RTAX_GATEWAY, &gw);
        let mut msg = b.finish();
        // chop the second sockaddr in half; its declared length no longer fits
        msg.truncate(RT_MSGHDR_LEN + 16 + 8);
        let len = msg.len() as u16;
        put_u16(&mut msg, 0, len);

        let m = RtMsg::new(&msg);
        let got: Vec<_> = sockaddrs(&msg, RT_MSGHDR_LEN, m.rt_addrs()).collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, RTAX_DST);
    }

    #[test]
    fn test_iteration_bounded_by_declared_msglen() {
        let dst: Host = "10.0.0.1".parse().unwrap();
        let mut b = MsgBuilder::new(RTM_ADD, 0, 1, 2);
        b.add_addr(RTAX_DST, &dst);
        let mut msg = b.finish();
        // extra garbage past msglen must not be interpreted
        msg.extend_from_slice(&[16, 2, 0, 0]);
        let m = RtMsg::new(&msg);
        let got: Vec<_> = sockaddrs(&msg, RT_MSGHDR_LEN, m.rt_addrs() | (1 << RTAX_GATEWAY)).collect();
        assert_eq!(got.len(), 1);
    }
}
