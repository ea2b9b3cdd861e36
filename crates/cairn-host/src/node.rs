//! Network addresses of remote nodes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use cairn_core::identity::NodeId;

/// TCP and UDP endpoints of a remote node. Discovery speaks UDP, sessions
/// speak TCP; both usually share an address but never have to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEndpoint {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl NodeEndpoint {
    pub fn new(ip: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            ip,
            udp_port,
            tcp_port,
        }
    }

    pub fn tcp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    pub fn is_private(&self) -> bool {
        is_private_address(self.ip)
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// Immutable description of a remote party: identity plus endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub endpoint: NodeEndpoint,
}

impl Node {
    pub fn new(id: NodeId, endpoint: NodeEndpoint) -> Self {
        Self { id, endpoint }
    }
}

// ── Address classification ────────────────────────────────────────────────────

/// Private-range addresses: RFC 1918 v4, link-local, and ULA/link-local v6.
pub fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => is_unique_local_v6(v6) || is_unicast_link_local_v6(v6),
    }
}

/// Loopback or unspecified — never publishable, never a peer address.
pub fn is_local_host_address(ip: IpAddr) -> bool {
    ip.is_loopback() || ip.is_unspecified()
}

fn is_unique_local_v6(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local_v6(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// True when an interface address is eligible to appear in the published
/// peer-address set.
pub fn is_publishable(ip: IpAddr, local_networking: bool) -> bool {
    if is_local_host_address(ip) {
        return false;
    }
    local_networking || !is_private_address(ip)
}

#[allow(unused)]
pub(crate) fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_socket_addrs() {
        let ep = NodeEndpoint::new(v4(203, 0, 113, 7), 30301, 30303);
        assert_eq!(ep.tcp(), "203.0.113.7:30303".parse().unwrap());
        assert_eq!(ep.udp(), "203.0.113.7:30301".parse().unwrap());
        assert!(!ep.is_private());
    }

    #[test]
    fn private_ranges_are_detected() {
        assert!(is_private_address(v4(10, 0, 0, 1)));
        assert!(is_private_address(v4(192, 168, 1, 1)));
        assert!(is_private_address(v4(172, 16, 0, 1)));
        assert!(is_private_address(v4(169, 254, 0, 1)));
        assert!(!is_private_address(v4(203, 0, 113, 7)));
        assert!(is_private_address("fd00::1".parse().unwrap()));
        assert!(is_private_address("fe80::1".parse().unwrap()));
        assert!(!is_private_address("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn loopback_endpoints_are_flagged() {
        let local = NodeEndpoint::new(v4(127, 0, 0, 1), 30303, 30303);
        assert!(local.is_loopback());
        assert!(!local.is_private());

        let public = NodeEndpoint::new(v4(203, 0, 113, 7), 30303, 30303);
        assert!(!public.is_loopback());
    }

    #[test]
    fn localhost_is_not_publishable() {
        assert!(!is_publishable(v4(127, 0, 0, 1), true));
        assert!(!is_publishable(v4(0, 0, 0, 0), true));
    }

    #[test]
    fn private_is_publishable_only_with_local_networking() {
        assert!(is_publishable(v4(10, 0, 0, 1), true));
        assert!(!is_publishable(v4(10, 0, 0, 1), false));
        assert!(is_publishable(v4(203, 0, 113, 7), false));
    }
}
