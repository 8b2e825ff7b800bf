//! Common types for the WireGuard relay manager.
//!
//! This crate provides type-safe representations of the values exchanged
//! between the control plane, the kernel tunnel devices and the firewall:
//!
//! - [`IpPrefix`]: address/prefix-length pairs (allowed IPs, host routes)
//! - [`WgKey`]: 32-byte WireGuard keys in their base64 text form
//! - [`PeerRecord`]: one authorized peer as delivered by the control plane
//! - [`PeerEvent`]: a single peer change pushed over the event channel

mod ip;
mod key;
mod peer;

pub use ip::{IpFamily, IpPrefix};
pub use key::{WgKey, KEY_LEN};
pub use peer::{PeerAction, PeerEvent, PeerRecord};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),

    #[error("expected {expected} prefix, got {value}")]
    WrongFamily {
        expected: IpFamily,
        value: String,
    },
}
