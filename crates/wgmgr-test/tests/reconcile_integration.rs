//! Reconciliation integration tests
//!
//! Drives both reconcilers against the in-memory tunnel devices and
//! firewall tables, pass after pass.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use pretty_assertions::assert_eq;
use wgmgr_common::Reconciler;
use wgmgr_test::{
    add_event, allowed_ips, exit_address_config, ipset_config, key, metrics, peer, remove_event,
    ChainVerifier, FakeRuleTables, FakeTunnelDevices, PeerVerifier, TEST_CHAIN, TEST_IPSET_V4,
    TEST_IPSET_V6,
};
use wgmgr_types::{IpFamily, PeerRecord};
use wgmgrd::config::PortforwardConfig;
use wgmgrd::wireguard::InterfaceReport;
use wgmgrd::{DestinationMatch, KernelPeer, NatRule, PortforwardMgr, Protocol, WireguardMgr};

struct Harness {
    devices: Arc<FakeTunnelDevices>,
    tables: Arc<FakeRuleTables>,
    wireguard: WireguardMgr,
    portforward: PortforwardMgr,
}

impl Harness {
    async fn new(interfaces: &[&str], config: PortforwardConfig) -> Self {
        let devices = Arc::new(FakeTunnelDevices::with_interfaces(interfaces));
        let tables = Arc::new(FakeRuleTables::new(TEST_CHAIN, &[TEST_IPSET_V4, TEST_IPSET_V6]));
        let metrics = metrics();

        let wireguard = WireguardMgr::new(
            interfaces.iter().map(|s| s.to_string()).collect(),
            devices.clone(),
            metrics.clone(),
        )
        .await
        .expect("Failed to create WireguardMgr");
        let portforward = PortforwardMgr::new(&config, tables.clone(), metrics)
            .await
            .expect("Failed to create PortforwardMgr");

        Self {
            devices,
            tables,
            wireguard,
            portforward,
        }
    }

    async fn pass(&self, peers: &[PeerRecord]) {
        self.wireguard.reconcile(peers).await.unwrap();
        self.portforward.reconcile(peers).await.unwrap();
    }

    fn clear_calls(&self) {
        self.devices.clear_calls();
        self.tables.clear_calls();
    }
}

fn ipset(family: IpFamily) -> DestinationMatch {
    DestinationMatch::IpSet {
        family,
        name: match family {
            IpFamily::V4 => TEST_IPSET_V4.to_string(),
            IpFamily::V6 => TEST_IPSET_V6.to_string(),
        },
    }
}

/// Test one peer being added and then withdrawn
///
/// Scenario:
/// 1. API lists peer 1 with ports {1234, 4321}
/// 2. Verify one peer upsert on wg0 and four DNAT rules
/// 3. API lists nobody
/// 4. Verify the peer and all four rules are gone
#[tokio::test]
async fn test_peer_added_then_withdrawn() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    let peers = vec![peer(1, vec![1234, 4321])];

    let report = h.wireguard.update_peers(&peers).await;
    assert_eq!(
        report.interfaces,
        vec![InterfaceReport {
            interface: "wg0".to_string(),
            upserts: 1,
            removes: 0,
            resets: 0,
        }]
    );
    let rules = h.portforward.update_portforwarding(&peers).await.unwrap();
    assert_eq!(rules.added, 4);
    assert_eq!(rules.failed, 0);

    let peer_verifier = PeerVerifier::new(&h.devices);
    peer_verifier
        .assert_peer("wg0", &key(1), &allowed_ips(1))
        .expect("Peer not installed");

    let chain = ChainVerifier::new(&h.tables, TEST_CHAIN);
    for family in IpFamily::ALL {
        chain.assert_rule_count(family, 2).unwrap();
        let to = allowed_ips(1)
            .into_iter()
            .find(|p| p.family() == family)
            .unwrap()
            .address();
        for protocol in Protocol::ALL {
            chain
                .assert_rule(&NatRule::new(protocol, ipset(family), &[1234, 4321], to))
                .expect("Rule not installed");
        }
    }

    h.pass(&[]).await;

    peer_verifier.assert_peer_absent("wg0", &key(1)).unwrap();
    peer_verifier.assert_peer_count("wg0", 0).unwrap();
    chain.assert_rule_count(IpFamily::V4, 0).unwrap();
    chain.assert_rule_count(IpFamily::V6, 0).unwrap();
}

#[tokio::test]
async fn test_second_pass_changes_nothing() {
    let h = Harness::new(&["wg0", "wg1"], ipset_config()).await;
    let peers = vec![peer(1, vec![80]), peer(2, vec![]), peer(3, vec![22, 443])];

    h.pass(&peers).await;
    h.clear_calls();

    let report = h.wireguard.update_peers(&peers).await;
    assert!(report.failed_interfaces.is_empty());
    let rules = h.portforward.update_portforwarding(&peers).await.unwrap();
    assert!(rules.is_noop());

    assert!(h.devices.calls().is_empty());
    assert_eq!(h.tables.mutation_count(), 0);
}

#[tokio::test]
async fn test_reordered_allowed_ips_cause_no_change() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    let mut reversed = allowed_ips(1);
    reversed.reverse();
    h.devices
        .insert_peer("wg0", KernelPeer::new(key(1), reversed));

    let report = h.wireguard.update_peers(&[peer(1, vec![])]).await;

    assert!(h.devices.calls().is_empty());
    assert_eq!(report.interfaces[0].upserts, 0);
}

#[tokio::test]
async fn test_port_order_and_duplicates_cause_no_churn() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    h.pass(&[peer(1, vec![1234, 4321])]).await;
    h.clear_calls();

    h.pass(&[peer(1, vec![4321, 1234, 1234])]).await;

    assert_eq!(h.tables.mutation_count(), 0);
    assert!(h.devices.calls().is_empty());
}

#[tokio::test]
async fn test_changed_ports_replace_rules() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    h.pass(&[peer(1, vec![1234])]).await;
    h.clear_calls();

    let report = h
        .portforward
        .update_portforwarding(&[peer(1, vec![1234, 5678])])
        .await
        .unwrap();

    assert_eq!(report.added, 4);
    assert_eq!(report.removed, 4);
    let chain = ChainVerifier::new(&h.tables, TEST_CHAIN);
    chain.assert_rule_count(IpFamily::V4, 2).unwrap();
    chain.assert_rule_count(IpFamily::V6, 2).unwrap();
}

#[tokio::test]
async fn test_failing_interface_does_not_block_others() {
    let h = Harness::new(&["wg0", "wg1"], ipset_config()).await;
    h.devices.set_failing("wg0", true);

    let report = h.wireguard.update_peers(&[peer(1, vec![])]).await;

    assert_eq!(report.failed_interfaces, vec!["wg0".to_string()]);
    let verifier = PeerVerifier::new(&h.devices);
    verifier.assert_peer_count("wg0", 0).unwrap();
    verifier
        .assert_peer("wg1", &key(1), &allowed_ips(1))
        .unwrap();

    // Next pass converges once the interface recovers
    h.devices.set_failing("wg0", false);
    let report = h.wireguard.update_peers(&[peer(1, vec![])]).await;
    assert!(report.failed_interfaces.is_empty());
    verifier
        .assert_peer("wg0", &key(1), &allowed_ips(1))
        .unwrap();
}

#[tokio::test]
async fn test_failing_rule_does_not_block_others() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    h.tables.fail_appends_containing(Some("--to-destination 10.99.0.2"));

    let peers = vec![peer(1, vec![80]), peer(2, vec![443])];
    let report = h.portforward.update_portforwarding(&peers).await.unwrap();

    assert_eq!(report.added, 6);
    assert_eq!(report.failed, 2);
    let chain = ChainVerifier::new(&h.tables, TEST_CHAIN);
    chain.assert_rule_count(IpFamily::V4, 2).unwrap();
    chain.assert_rule_count(IpFamily::V6, 4).unwrap();

    // The missing rules are retried on the next pass
    h.tables.fail_appends_containing(None);
    let report = h.portforward.update_portforwarding(&peers).await.unwrap();
    assert_eq!(report.added, 2);
    assert_eq!(report.failed, 0);
}

#[tokio::test]
async fn test_listing_failure_skips_firewall_pass() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    h.tables.set_fail_list(true);

    let result = h.portforward.reconcile(&[peer(1, vec![80])]).await;

    assert!(result.is_err());
    assert_eq!(h.tables.mutation_count(), 0);
}

#[tokio::test]
async fn test_stale_session_is_reset() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    let peers = vec![peer(1, vec![]), peer(2, vec![])];
    h.pass(&peers).await;

    let now = SystemTime::now();
    h.devices
        .set_handshake(&key(1), now - Duration::from_secs(181));
    h.devices.set_handshake(&key(2), now - Duration::from_secs(60));
    h.clear_calls();

    let report = h.wireguard.update_peers_at(&peers, now).await;

    assert_eq!(report.interfaces[0].resets, 1);
    assert_eq!(report.connected_peers, 1);
    let calls = h.devices.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1.len(), 1);
    assert_eq!(calls[0].1[0].public_key(), &key(1));
    assert_eq!(calls[1].1[0].public_key(), &key(1));

    // Removed and re-added: same allowed IPs, fresh session
    let kernel = h.devices.peer("wg0", &key(1)).unwrap();
    assert_eq!(kernel.last_handshake, None);
    PeerVerifier::new(&h.devices)
        .assert_peer("wg0", &key(1), &allowed_ips(1))
        .unwrap();
}

#[tokio::test]
async fn test_stale_session_with_new_routing_is_reset() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    let now = SystemTime::now();
    let mut kernel = KernelPeer::new(key(1), allowed_ips(7));
    kernel.last_handshake = Some(now - Duration::from_secs(600));
    h.devices.insert_peer("wg0", kernel);

    let report = h.wireguard.update_peers_at(&[peer(1, vec![])], now).await;

    assert_eq!(report.interfaces[0].resets, 1);
    assert_eq!(report.interfaces[0].upserts, 0);
    let kernel = h.devices.peer("wg0", &key(1)).unwrap();
    assert_eq!(kernel.last_handshake, None);
    PeerVerifier::new(&h.devices)
        .assert_peer("wg0", &key(1), &allowed_ips(1))
        .unwrap();
}

#[tokio::test]
async fn test_foreign_rules_are_removed() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    h.tables.push_line(
        IpFamily::V4,
        "-A PORTFORWARDING -p tcp -m tcp --dport 22 -j DNAT --to-destination 10.0.0.1",
    );

    let report = h
        .portforward
        .update_portforwarding(&[peer(1, vec![80])])
        .await
        .unwrap();

    assert_eq!(report.removed, 1);
    assert_eq!(report.added, 4);
    assert!(h
        .tables
        .lines(IpFamily::V4)
        .iter()
        .all(|l| !l.contains("--dport 22")));
}

#[tokio::test]
async fn test_exit_addresses_as_destination() {
    let exits: Vec<IpAddr> = vec![
        "192.0.2.1".parse().unwrap(),
        "192.0.2.2".parse().unwrap(),
        "2001:db8::1".parse().unwrap(),
    ];
    let h = Harness::new(&["wg0"], exit_address_config(&exits)).await;

    let report = h
        .portforward
        .update_portforwarding(&[peer(1, vec![8080])])
        .await
        .unwrap();

    // Two v4 exits and one v6 exit, both protocols each
    assert_eq!(report.added, 6);
    let chain = ChainVerifier::new(&h.tables, TEST_CHAIN);
    chain.assert_rule_count(IpFamily::V4, 4).unwrap();
    chain.assert_rule_count(IpFamily::V6, 2).unwrap();
    chain
        .assert_rule(&NatRule::new(
            Protocol::Udp,
            DestinationMatch::Address(exits[1]),
            &[8080],
            "10.99.0.1".parse().unwrap(),
        ))
        .unwrap();
}

#[tokio::test]
async fn test_events_apply_without_full_pass() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    let p = peer(7, vec![25565]);

    h.wireguard.apply_event(&add_event(p.clone())).await;
    h.portforward.apply_event(&add_event(p.clone())).await;

    PeerVerifier::new(&h.devices)
        .assert_peer("wg0", &key(7), &allowed_ips(7))
        .unwrap();
    let chain = ChainVerifier::new(&h.tables, TEST_CHAIN);
    chain.assert_rule_count(IpFamily::V4, 2).unwrap();

    // A full pass with the same list is a no-op afterwards
    h.clear_calls();
    h.pass(std::slice::from_ref(&p)).await;
    assert!(h.devices.calls().is_empty());
    assert_eq!(h.tables.mutation_count(), 0);

    h.wireguard.apply_event(&remove_event(p.clone())).await;
    h.portforward.apply_event(&remove_event(p)).await;
    PeerVerifier::new(&h.devices)
        .assert_peer_count("wg0", 0)
        .unwrap();
    chain.assert_rule_count(IpFamily::V4, 0).unwrap();
    chain.assert_rule_count(IpFamily::V6, 0).unwrap();
}

#[tokio::test]
async fn test_invalid_records_are_skipped() {
    let h = Harness::new(&["wg0"], ipset_config()).await;
    let peers = vec![
        peer(1, vec![80]),
        PeerRecord::new("not-a-key", "10.99.0.9/32", "fc00::9/128", vec![]),
        PeerRecord::new(key(3).to_base64(), "bogus", "fc00::3/128", vec![443]),
    ];

    h.pass(&peers).await;

    let verifier = PeerVerifier::new(&h.devices);
    verifier.assert_peer_count("wg0", 1).unwrap();
    verifier
        .assert_peer("wg0", &key(1), &allowed_ips(1))
        .unwrap();

    // Peer 3 still gets its IPv6 forwarding
    let chain = ChainVerifier::new(&h.tables, TEST_CHAIN);
    chain.assert_rule_count(IpFamily::V4, 2).unwrap();
    chain.assert_rule_count(IpFamily::V6, 4).unwrap();
}
