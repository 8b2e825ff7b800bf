//! Integration test infrastructure for the WireGuard relay manager
//!
//! Provides:
//! - In-memory tunnel devices and firewall tables behind the reconciler seams
//! - Test fixtures for keys, peers, events and port forwarding setups
//! - Verification helpers for the resulting kernel and firewall state

mod fakes;
pub mod fixtures;
mod verification;

pub use fakes::{FakeRuleTables, FakeTunnelDevices};
pub use fixtures::*;
pub use verification::*;
