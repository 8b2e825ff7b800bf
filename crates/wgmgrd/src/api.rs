//! Client for the desired-state API.

use std::time::Duration;

use reqwest::Client;
use tracing::debug;
use wgmgr_common::{WgMgrError, WgMgrResult};
use wgmgr_types::PeerRecord;

use crate::config::{ApiConfig, BasicAuth};

/// Path of the active peer list, relative to the base URL.
pub const PEERS_PATH: &str = "/wg/active-pubkeys/v2/";

/// Timeout for a whole request, including reading the body.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ApiClient {
    http_client: Client,
    base_url: String,
    credentials: Option<BasicAuth>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> WgMgrResult<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| WgMgrError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            credentials: config.credentials.clone(),
        })
    }

    pub fn peers_url(&self) -> String {
        format!("{}{}", self.base_url, PEERS_PATH)
    }

    /// Fetches the list of active peers.
    ///
    /// Any transport error, non-2xx status or malformed body fails the whole
    /// request; no partial list is returned.
    pub async fn get_wireguard_peers(&self) -> WgMgrResult<Vec<PeerRecord>> {
        let url = self.peers_url();
        debug!(%url, "fetching wireguard peers");

        let mut request = self.http_client.get(&url);
        if let Some(auth) = &self.credentials {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let peers = request
            .send()
            .await
            .map_err(|e| WgMgrError::Api(format!("GET {}: {}", url, e)))?
            .error_for_status()
            .map_err(|e| WgMgrError::Api(e.to_string()))?
            .json::<Vec<PeerRecord>>()
            .await
            .map_err(|e| WgMgrError::Api(format!("invalid peer list: {}", e)))?;

        debug!(count = peers.len(), "fetched wireguard peers");
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

    fn client(server: &MockServer, credentials: Option<BasicAuth>) -> ApiClient {
        ApiClient::new(&ApiConfig {
            base_url: server.uri(),
            credentials,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_peers_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PEERS_PATH))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"ipv4": "10.99.0.1/32", "ipv6": "fc00::1/128", "ports": [1234, 4321], "pubkey": KEY},
                {"ipv4": "10.99.0.2/32", "ipv6": "fc00::2/128", "ports": null, "pubkey": KEY},
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let peers = client(&server, BasicAuth::from_parts("user", "pass"))
            .get_wireguard_peers()
            .await
            .unwrap();

        assert_eq!(
            peers,
            vec![
                PeerRecord::new(KEY, "10.99.0.1/32", "fc00::1/128", vec![1234, 4321]),
                PeerRecord::new(KEY, "10.99.0.2/32", "fc00::2/128", vec![]),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_auth_header_without_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PEERS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let peers = client(&server, None).get_wireguard_peers().await.unwrap();
        assert!(peers.is_empty());

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_error_status_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server, None).get_wireguard_peers().await.unwrap_err();
        assert!(matches!(err, WgMgrError::Api(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[{\"ipv4\": 1}]"))
            .mount(&server)
            .await;

        let err = client(&server, None).get_wireguard_peers().await.unwrap_err();
        assert!(err.to_string().contains("invalid peer list"));
    }

    #[test]
    fn test_peers_url_joins_base() {
        let client = ApiClient::new(&ApiConfig {
            base_url: "https://api.example.net/".to_string(),
            credentials: None,
        })
        .unwrap();
        assert_eq!(
            client.peers_url(),
            "https://api.example.net/wg/active-pubkeys/v2/"
        );
    }
}
