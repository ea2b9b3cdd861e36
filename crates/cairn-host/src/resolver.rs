//! Public endpoint determination.
//!
//! Figures out which TCP endpoint this node should advertise, from (in
//! order): an operator-supplied address, the interface scan, NAT traversal,
//! and finally private/unspecified fallbacks. Also collects the set of
//! interface addresses peers may legitimately know us by.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::node::{is_local_host_address, is_private_address, is_publishable};

/// NAT traversal seam. The default implementation does nothing; a UPnP or
/// PMP client can be injected where the deployment calls for one.
pub trait NatTraversal: Send + Sync {
    /// Try to obtain an externally reachable TCP endpoint for `port`.
    fn map_tcp(&self, if_addresses: &[IpAddr], port: u16) -> Option<SocketAddr>;
}

/// No NAT traversal. Rule 3 of the resolution order never fires.
#[derive(Default)]
pub struct NoTraversal;

impl NatTraversal for NoTraversal {
    fn map_tcp(&self, _if_addresses: &[IpAddr], _port: u16) -> Option<SocketAddr> {
        None
    }
}

/// Inputs to the resolution, separated from the Host so the rules are a pure
/// function.
pub struct ResolverInputs<'a> {
    /// Operator-supplied address, already parsed. `None` when unset.
    pub advertised_ip: Option<IpAddr>,
    pub upnp: bool,
    pub listen_port: u16,
    pub if_addresses: &'a [IpAddr],
    pub local_networking: bool,
}

/// Outcome: the endpoint to publish plus every interface address eligible
/// for the peer-address set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub public: SocketAddr,
    pub peer_addresses: BTreeSet<IpAddr>,
}

/// Apply the resolution rules, first match wins:
///
/// 1. advertised address, if public — or private with local networking on
/// 2. first public IPv4 interface address
/// 3. NAT traversal, if enabled and it produces a mapping
/// 4. first private IPv4 interface address, if local networking is on
/// 5. the unspecified address (still listening locally)
pub fn determine_public(inputs: &ResolverInputs<'_>, nat: &dyn NatTraversal) -> Resolution {
    let mut peer_addresses: BTreeSet<IpAddr> = inputs
        .if_addresses
        .iter()
        .copied()
        .filter(|ip| is_publishable(*ip, inputs.local_networking))
        .collect();

    // rule 1: operator override
    if let Some(advertised) = inputs.advertised_ip {
        let private = is_private_address(advertised);
        let public = !private && !is_local_host_address(advertised);
        if public || (private && inputs.local_networking) {
            peer_addresses.insert(advertised);
            return Resolution {
                public: SocketAddr::new(advertised, inputs.listen_port),
                peer_addresses,
            };
        }
    }

    // rule 2: first public IPv4 interface address
    if let Some(ip) = peer_addresses
        .iter()
        .find(|ip| ip.is_ipv4() && !is_private_address(**ip))
    {
        return Resolution {
            public: SocketAddr::new(*ip, inputs.listen_port),
            peer_addresses,
        };
    }

    // rule 3: NAT traversal
    if inputs.upnp {
        if let Some(mapped) = nat.map_tcp(inputs.if_addresses, inputs.listen_port) {
            peer_addresses.insert(mapped.ip());
            return Resolution {
                public: mapped,
                peer_addresses,
            };
        }
    }

    // rule 4: private IPv4, when local networking is allowed
    if inputs.local_networking {
        if let Some(ip) = peer_addresses
            .iter()
            .find(|ip| ip.is_ipv4() && is_private_address(**ip))
        {
            return Resolution {
                public: SocketAddr::new(*ip, inputs.listen_port),
                peer_addresses,
            };
        }
    }

    // rule 5: publish nothing useful, keep listening
    Resolution {
        public: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), inputs.listen_port),
        peer_addresses,
    }
}

/// Best-effort interface discovery: a connected UDP socket reveals which
/// local address the routing table would pick. No packet is sent.
pub fn probe_local_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("198.51.100.1:30303").is_ok() {
            if let Ok(local) = socket.local_addr() {
                if !is_local_host_address(local.ip()) {
                    addresses.push(local.ip());
                }
            }
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::v4;

    struct FixedNat(SocketAddr);

    impl NatTraversal for FixedNat {
        fn map_tcp(&self, _if_addresses: &[IpAddr], _port: u16) -> Option<SocketAddr> {
            Some(self.0)
        }
    }

    fn inputs<'a>(if_addresses: &'a [IpAddr]) -> ResolverInputs<'a> {
        ResolverInputs {
            advertised_ip: None,
            upnp: false,
            listen_port: 30303,
            if_addresses,
            local_networking: false,
        }
    }

    #[test]
    fn advertised_public_address_wins() {
        let ifs = [v4(10, 0, 0, 4), v4(203, 0, 113, 9)];
        let mut i = inputs(&ifs);
        i.advertised_ip = Some(v4(198, 51, 100, 7));

        let r = determine_public(&i, &NoTraversal);
        assert_eq!(r.public, "198.51.100.7:30303".parse().unwrap());
        assert!(r.peer_addresses.contains(&v4(198, 51, 100, 7)));
    }

    #[test]
    fn advertised_private_needs_local_networking() {
        let ifs = [v4(203, 0, 113, 9)];
        let mut i = inputs(&ifs);
        i.advertised_ip = Some(v4(10, 0, 0, 4));

        // without local networking the private override is ignored,
        // falling through to the public interface address
        let r = determine_public(&i, &NoTraversal);
        assert_eq!(r.public, "203.0.113.9:30303".parse().unwrap());

        i.local_networking = true;
        let r = determine_public(&i, &NoTraversal);
        assert_eq!(r.public, "10.0.0.4:30303".parse().unwrap());
    }

    #[test]
    fn first_public_interface_address_is_used() {
        let ifs = [v4(10, 0, 0, 4), v4(203, 0, 113, 9)];
        let r = determine_public(&inputs(&ifs), &NoTraversal);
        assert_eq!(r.public, "203.0.113.9:30303".parse().unwrap());
        // private address was not eligible without local networking
        assert!(!r.peer_addresses.contains(&v4(10, 0, 0, 4)));
    }

    #[test]
    fn nat_traversal_fires_when_enabled_and_nothing_public() {
        let ifs = [v4(192, 168, 1, 10)];
        let mut i = inputs(&ifs);
        i.upnp = true;

        let mapped: SocketAddr = "198.51.100.80:30310".parse().unwrap();
        let r = determine_public(&i, &FixedNat(mapped));
        assert_eq!(r.public, mapped);
        assert!(r.peer_addresses.contains(&mapped.ip()));

        // disabled: falls through to unspecified
        i.upnp = false;
        let r = determine_public(&i, &FixedNat(mapped));
        assert!(r.public.ip().is_unspecified());
    }

    #[test]
    fn private_fallback_requires_local_networking() {
        let ifs = [v4(192, 168, 1, 10)];
        let mut i = inputs(&ifs);

        let r = determine_public(&i, &NoTraversal);
        assert!(r.public.ip().is_unspecified());
        assert_eq!(r.public.port(), 30303);
        assert!(r.peer_addresses.is_empty());

        i.local_networking = true;
        let r = determine_public(&i, &NoTraversal);
        assert_eq!(r.public, "192.168.1.10:30303".parse().unwrap());
        assert!(r.peer_addresses.contains(&v4(192, 168, 1, 10)));
    }

    #[test]
    fn loopback_interfaces_never_qualify() {
        let ifs = [v4(127, 0, 0, 1)];
        let mut i = inputs(&ifs);
        i.local_networking = true;

        let r = determine_public(&i, &NoTraversal);
        assert!(r.public.ip().is_unspecified());
        assert!(r.peer_addresses.is_empty());
    }
}
