//! Verification helpers for the state left behind by the reconcilers
//!
//! Provides assertion helpers over [`FakeTunnelDevices`] peers and
//! [`FakeRuleTables`] chains.

use thiserror::Error;
use wgmgr_types::{IpFamily, IpPrefix, WgKey};
use wgmgrd::portforward::{parse_listing, ListedRule};
use wgmgrd::NatRule;

use crate::{FakeRuleTables, FakeTunnelDevices};

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected peer {key} on {interface}, not found")]
    PeerNotFound { interface: String, key: String },

    #[error("Unexpected peer {key} on {interface}")]
    UnexpectedPeer { interface: String, key: String },

    #[error("Allowed IPs mismatch for {key} on {interface}: expected {expected:?}, got {actual:?}")]
    AllowedIpsMismatch {
        interface: String,
        key: String,
        expected: Vec<IpPrefix>,
        actual: Option<Vec<IpPrefix>>,
    },

    #[error("Expected {expected} peers on {interface}, found {actual}")]
    PeerCountMismatch {
        interface: String,
        expected: usize,
        actual: usize,
    },

    #[error("Expected {family} rule not found: {rule}")]
    RuleNotFound { family: IpFamily, rule: String },

    #[error("Expected {expected} {family} rules, found {actual}")]
    RuleCountMismatch {
        family: IpFamily,
        expected: usize,
        actual: usize,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// Tunnel peer verification helper
pub struct PeerVerifier<'a> {
    devices: &'a FakeTunnelDevices,
}

impl<'a> PeerVerifier<'a> {
    pub fn new(devices: &'a FakeTunnelDevices) -> Self {
        Self { devices }
    }

    /// Verify that a peer exists with exactly these allowed IPs (any order)
    pub fn assert_peer(
        &self,
        interface: &str,
        key: &WgKey,
        allowed_ips: &[IpPrefix],
    ) -> VerifyResult<()> {
        let peer = self
            .devices
            .peer(interface, key)
            .ok_or_else(|| VerificationError::PeerNotFound {
                interface: interface.to_string(),
                key: key.to_base64(),
            })?;

        if !wgmgr_common::equal_prefix_sets(peer.allowed_ips.as_deref(), Some(allowed_ips)) {
            return Err(VerificationError::AllowedIpsMismatch {
                interface: interface.to_string(),
                key: key.to_base64(),
                expected: allowed_ips.to_vec(),
                actual: peer.allowed_ips,
            });
        }
        Ok(())
    }

    pub fn assert_peer_absent(&self, interface: &str, key: &WgKey) -> VerifyResult<()> {
        if self.devices.peer(interface, key).is_some() {
            return Err(VerificationError::UnexpectedPeer {
                interface: interface.to_string(),
                key: key.to_base64(),
            });
        }
        Ok(())
    }

    pub fn assert_peer_count(&self, interface: &str, expected: usize) -> VerifyResult<()> {
        let actual = self.devices.peers(interface).len();
        if actual != expected {
            return Err(VerificationError::PeerCountMismatch {
                interface: interface.to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Port forwarding chain verification helper
pub struct ChainVerifier<'a> {
    tables: &'a FakeRuleTables,
    chain: &'a str,
}

impl<'a> ChainVerifier<'a> {
    pub fn new(tables: &'a FakeRuleTables, chain: &'a str) -> Self {
        Self { tables, chain }
    }

    /// Parsed rules currently in the chain.
    pub fn rules(&self, family: IpFamily) -> Vec<ListedRule> {
        parse_listing(self.chain, family, &self.tables.lines(family))
    }

    /// Verify that the chain holds `rule` in its family
    pub fn assert_rule(&self, rule: &NatRule) -> VerifyResult<()> {
        let found = self
            .rules(rule.family())
            .iter()
            .any(|listed| matches!(listed, ListedRule::Nat(r) if r == rule));
        if !found {
            return Err(VerificationError::RuleNotFound {
                family: rule.family(),
                rule: rule.to_string(),
            });
        }
        Ok(())
    }

    pub fn assert_rule_count(&self, family: IpFamily, expected: usize) -> VerifyResult<()> {
        let actual = self.rules(family).len();
        if actual != expected {
            return Err(VerificationError::RuleCountMismatch {
                family,
                expected,
                actual,
            });
        }
        Ok(())
    }
}
