//! Peer records and peer change events as exchanged with the control plane.

use crate::{IpFamily, IpPrefix, ParseError, WgKey};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One authorized peer, as returned by the control plane API.
///
/// Fields are kept in their wire form; use the accessor methods to obtain
/// validated values. A record that fails validation is skipped by the
/// reconcilers instead of failing the whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Assigned IPv4 host prefix, e.g. `10.99.0.1/32`
    pub ipv4: String,
    /// Assigned IPv6 host prefix, e.g. `fc00:bbbb:bbbb:bb01::1/128`
    pub ipv6: String,
    /// Ports forwarded to this peer (TCP and UDP)
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ports: Vec<u16>,
    /// Base64 encoded WireGuard public key
    pub pubkey: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<u16>>::deserialize(deserializer)?.unwrap_or_default())
}

impl PeerRecord {
    pub fn new(
        pubkey: impl Into<String>,
        ipv4: impl Into<String>,
        ipv6: impl Into<String>,
        ports: Vec<u16>,
    ) -> Self {
        Self {
            ipv4: ipv4.into(),
            ipv6: ipv6.into(),
            ports,
            pubkey: pubkey.into(),
        }
    }

    /// Parses the public key.
    pub fn public_key(&self) -> Result<WgKey, ParseError> {
        WgKey::from_base64(&self.pubkey)
    }

    /// Parses the IPv4 prefix, rejecting IPv6 values.
    pub fn ipv4_prefix(&self) -> Result<IpPrefix, ParseError> {
        IpPrefix::parse_family(&self.ipv4, IpFamily::V4)
    }

    /// Parses the IPv6 prefix, rejecting IPv4 values.
    pub fn ipv6_prefix(&self) -> Result<IpPrefix, ParseError> {
        IpPrefix::parse_family(&self.ipv6, IpFamily::V6)
    }

    /// Parses the prefix assigned for the given family.
    pub fn prefix(&self, family: IpFamily) -> Result<IpPrefix, ParseError> {
        match family {
            IpFamily::V4 => self.ipv4_prefix(),
            IpFamily::V6 => self.ipv6_prefix(),
        }
    }

    /// Returns the full allowed-IP set for the tunnel device (v4 then v6).
    ///
    /// Both addresses must be valid.
    pub fn allowed_ips(&self) -> Result<Vec<IpPrefix>, ParseError> {
        Ok(vec![self.ipv4_prefix()?, self.ipv6_prefix()?])
    }

    /// Returns true if the peer has ports to forward.
    pub fn has_ports(&self) -> bool {
        !self.ports.is_empty()
    }
}

/// Kind of change carried by a [`PeerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PeerAction {
    Add,
    Remove,
}

impl fmt::Display for PeerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAction::Add => f.write_str("ADD"),
            PeerAction::Remove => f.write_str("REMOVE"),
        }
    }
}

/// A single peer change pushed by the message queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEvent {
    pub action: PeerAction,
    pub peer: PeerRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn valid_key() -> String {
        WgKey::from_bytes([b'a'; 32]).to_base64()
    }

    #[test]
    fn test_peer_record_deserialize() {
        let json = format!(
            r#"[{{"ipv4":"10.99.0.1/32","ipv6":"fc00:bbbb:bbbb:bb01::1/128","ports":[1234,4321],"pubkey":"{}"}}]"#,
            valid_key()
        );
        let peers: Vec<PeerRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(
            peers,
            vec![PeerRecord::new(
                valid_key(),
                "10.99.0.1/32",
                "fc00:bbbb:bbbb:bb01::1/128",
                vec![1234, 4321],
            )]
        );
    }

    #[test]
    fn test_peer_record_null_or_missing_ports() {
        let json = r#"{"ipv4":"10.99.0.1/32","ipv6":"fc00::1/128","ports":null,"pubkey":"k"}"#;
        let peer: PeerRecord = serde_json::from_str(json).unwrap();
        assert!(peer.ports.is_empty());

        let json = r#"{"ipv4":"10.99.0.1/32","ipv6":"fc00::1/128","pubkey":"k"}"#;
        let peer: PeerRecord = serde_json::from_str(json).unwrap();
        assert!(!peer.has_ports());
    }

    #[test]
    fn test_allowed_ips() {
        let peer = PeerRecord::new(valid_key(), "10.99.0.1/32", "fc00::1/128", vec![]);
        let ips = peer.allowed_ips().unwrap();
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0].to_string(), "10.99.0.1/32");
        assert_eq!(ips[1].to_string(), "fc00::1/128");
    }

    #[test]
    fn test_swapped_families_rejected() {
        let peer = PeerRecord::new(valid_key(), "fc00::1/128", "10.99.0.1/32", vec![]);
        assert!(peer.ipv4_prefix().is_err());
        assert!(peer.ipv6_prefix().is_err());
        assert!(peer.allowed_ips().is_err());
    }

    #[test]
    fn test_peer_event_deserialize() {
        let json = format!(
            r#"{{"action":"ADD","peer":{{"ipv4":"10.99.0.1/32","ipv6":"fc00::1/128","ports":[1234],"pubkey":"{}"}}}}"#,
            valid_key()
        );
        let event: PeerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.action, PeerAction::Add);
        assert_eq!(event.peer.ports, vec![1234]);

        let json = r#"{"action":"REMOVE","peer":{"ipv4":"","ipv6":"","pubkey":"k"}}"#;
        let event: PeerEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, PeerAction::Remove);
    }

    #[test]
    fn test_peer_event_unknown_action() {
        let json = r#"{"action":"RENAME","peer":{"ipv4":"","ipv6":"","pubkey":"k"}}"#;
        assert!(serde_json::from_str::<PeerEvent>(json).is_err());
    }
}
