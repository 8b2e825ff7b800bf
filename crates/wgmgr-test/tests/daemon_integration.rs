//! Daemon integration tests
//!
//! Runs the daemon against a mocked peer API and the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wgmgr_test::{
    add_event, allowed_ips, ipset_config, key, metrics, peer, ChainVerifier, FakeRuleTables,
    FakeTunnelDevices, PeerVerifier, TEST_CHAIN, TEST_IPSET_V4, TEST_IPSET_V6,
};
use wgmgr_types::IpFamily;
use wgmgrd::api::PEERS_PATH;
use wgmgrd::config::ApiConfig;
use wgmgrd::{ApiClient, Daemon, JitterTicker, MetricsCollector, PortforwardMgr, WireguardMgr};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Setup {
    daemon: Daemon,
    devices: Arc<FakeTunnelDevices>,
    tables: Arc<FakeRuleTables>,
    metrics: Arc<MetricsCollector>,
}

async fn setup(server: &MockServer) -> Setup {
    let devices = Arc::new(FakeTunnelDevices::with_interfaces(&["wg0"]));
    let tables = Arc::new(FakeRuleTables::new(TEST_CHAIN, &[TEST_IPSET_V4, TEST_IPSET_V6]));
    let metrics = metrics();

    let api = ApiClient::new(&ApiConfig {
        base_url: server.uri(),
        credentials: None,
    })
    .unwrap();
    let wireguard = WireguardMgr::new(vec!["wg0".to_string()], devices.clone(), metrics.clone())
        .await
        .unwrap();
    let portforward = PortforwardMgr::new(&ipset_config(), tables.clone(), metrics.clone())
        .await
        .unwrap();

    Setup {
        daemon: Daemon::new(api, wireguard, portforward, metrics.clone()),
        devices,
        tables,
        metrics,
    }
}

/// Polls `check` until it holds or five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_synchronize_applies_api_peer_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(PEERS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([peer(1, vec![1234, 4321]), peer(2, vec![])])),
        )
        .mount(&server)
        .await;
    let s = setup(&server).await;

    assert!(s.daemon.synchronize().await);

    let peers = PeerVerifier::new(&s.devices);
    peers.assert_peer_count("wg0", 2).unwrap();
    peers.assert_peer("wg0", &key(1), &allowed_ips(1)).unwrap();
    let chain = ChainVerifier::new(&s.tables, TEST_CHAIN);
    chain.assert_rule_count(IpFamily::V4, 2).unwrap();
    chain.assert_rule_count(IpFamily::V6, 2).unwrap();
    assert!(s
        .metrics
        .gather_metrics()
        .contains("wgmgr_sync_duration_seconds_count 1"));
}

#[tokio::test]
async fn test_api_failure_leaves_state_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let s = setup(&server).await;
    s.tables.push_line(
        IpFamily::V4,
        "-A PORTFORWARDING -p tcp -m tcp --dport 22 -j DNAT --to-destination 10.0.0.1",
    );

    assert!(!s.daemon.synchronize().await);

    assert!(s.devices.calls().is_empty());
    assert_eq!(s.tables.mutation_count(), 0);
    assert!(s
        .metrics
        .gather_metrics()
        .contains("wgmgr_error_getting_peers_total 1"));
}

#[tokio::test]
async fn test_run_applies_events_until_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    let s = setup(&server).await;

    let (tx, rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let daemon = s.daemon;
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ticker = JitterTicker::new(Duration::from_secs(3600), Duration::ZERO);
            daemon.run(ticker, Some(rx), shutdown).await;
        })
    };

    tx.send(add_event(peer(5, vec![8080]))).await.unwrap();

    let devices = s.devices.clone();
    assert!(eventually(|| devices.peer("wg0", &key(5)).is_some()).await);
    let tables = s.tables.clone();
    assert!(eventually(|| tables.lines(IpFamily::V6).len() == 2).await);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("daemon did not stop")
        .unwrap();
    assert!(s
        .metrics
        .gather_metrics()
        .contains("wgmgr_events_received_total 1"));
}
