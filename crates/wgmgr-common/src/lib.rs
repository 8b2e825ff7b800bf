//! Common infrastructure for the WireGuard relay manager.
//!
//! - [`shell`]: shell command execution with per-argument quoting
//! - [`Reconciler`]: the shape shared by the peer and rule reconcilers
//! - [`iputil`]: allowed-IP set comparison
//! - [`error`]: error types for reconciliation and startup

pub mod error;
pub mod iputil;
pub mod manager;
pub mod shell;

pub use error::{WgMgrError, WgMgrResult};
pub use iputil::equal_prefix_sets;
pub use manager::{defaults, Reconciler};
