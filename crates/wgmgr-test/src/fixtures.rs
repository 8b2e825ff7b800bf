//! Test fixtures for common reconciliation scenarios

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use wgmgr_types::{IpFamily, IpPrefix, PeerAction, PeerEvent, PeerRecord, WgKey};
use wgmgrd::config::PortforwardConfig;
use wgmgrd::{DestinationMatch, MetricsCollector};

/// Chain used by every port forwarding fixture.
pub const TEST_CHAIN: &str = "PORTFORWARDING";

/// ipset names used by [`ipset_config`].
pub const TEST_IPSET_V4: &str = "PORTFORWARDING_IPV4";
pub const TEST_IPSET_V6: &str = "PORTFORWARDING_IPV6";

/// A valid key made of one repeated byte.
pub fn key(b: u8) -> WgKey {
    WgKey::from_bytes([b; 32])
}

/// Peer number `n` with addresses `10.99.0.n/32` and `fc00::n/128`.
pub fn peer(n: u8, ports: Vec<u16>) -> PeerRecord {
    PeerRecord::new(
        key(n).to_base64(),
        format!("10.99.0.{}/32", n),
        format!("fc00::{:x}/128", n),
        ports,
    )
}

/// The allowed IPs [`peer`] assigns to peer `n`.
pub fn allowed_ips(n: u8) -> Vec<IpPrefix> {
    vec![
        IpPrefix::host(IpAddr::V4(Ipv4Addr::new(10, 99, 0, n))),
        IpPrefix::host(IpAddr::V6(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, n.into()))),
    ]
}

pub fn add_event(peer: PeerRecord) -> PeerEvent {
    PeerEvent {
        action: PeerAction::Add,
        peer,
    }
}

pub fn remove_event(peer: PeerRecord) -> PeerEvent {
    PeerEvent {
        action: PeerAction::Remove,
        peer,
    }
}

/// Port forwarding matched by one ipset per family.
pub fn ipset_config() -> PortforwardConfig {
    PortforwardConfig {
        chain: TEST_CHAIN.to_string(),
        destinations: vec![
            DestinationMatch::IpSet {
                family: IpFamily::V4,
                name: TEST_IPSET_V4.to_string(),
            },
            DestinationMatch::IpSet {
                family: IpFamily::V6,
                name: TEST_IPSET_V6.to_string(),
            },
        ],
    }
}

/// Port forwarding matched by exit addresses.
pub fn exit_address_config(addresses: &[IpAddr]) -> PortforwardConfig {
    PortforwardConfig {
        chain: TEST_CHAIN.to_string(),
        destinations: addresses
            .iter()
            .map(|a| DestinationMatch::Address(*a))
            .collect(),
    }
}

/// A fresh metrics collector with its own registry.
pub fn metrics() -> Arc<MetricsCollector> {
    Arc::new(MetricsCollector::new().expect("failed to create metrics collector"))
}
