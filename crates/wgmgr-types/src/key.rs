//! WireGuard key type.

use crate::ParseError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a Curve25519 key.
pub const KEY_LEN: usize = 32;

/// A WireGuard public or pre-shared key.
///
/// Keys are exchanged in standard base64 (44 characters with padding) and
/// compared by their raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Wraps raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        WgKey(bytes)
    }

    /// Parses a base64 encoded key.
    pub fn from_base64(s: &str) -> Result<Self, ParseError> {
        let decoded = STANDARD
            .decode(s.trim())
            .map_err(|_| ParseError::InvalidKey(s.to_string()))?;

        let bytes: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| ParseError::InvalidKey(s.to_string()))?;

        Ok(WgKey(bytes))
    }

    /// Returns the base64 text form of the key.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WgKey({})", self.to_base64())
    }
}

impl FromStr for WgKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WgKey::from_base64(s)
    }
}
