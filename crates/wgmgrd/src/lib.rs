//! WireGuard relay manager daemon.
//!
//! This crate implements the `wgmgrd` daemon, which keeps the WireGuard
//! peers and the DNAT port forwarding rules of a relay in sync with the
//! peer list published by the control plane API.
//!
//! # Responsibilities
//!
//! - Fetch the active peer list from the API on a jittered interval
//! - Converge the peers of every configured tunnel device, resetting
//!   sessions that have gone quiet
//! - Converge the port forwarding chain in the `nat` table of both address
//!   families
//! - Apply peer events pushed over the message queue between passes
//!
//! # Example
//!
//! ```ignore
//! use wgmgrd::{Daemon, JitterTicker};
//!
//! let daemon = Daemon::new(api, wireguard, portforward, metrics);
//! daemon.run(JitterTicker::new(interval, delay), events, shutdown).await;
//! ```

pub mod api;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod metrics;
pub mod metrics_server;
pub mod portforward;
pub mod scheduler;
pub mod subscriber;
pub mod wireguard;

pub use api::ApiClient;
pub use config::{Args, BasicAuth, DaemonConfig};
pub use daemon::{Daemon, EVENT_CHANNEL_CAPACITY};
pub use metrics::MetricsCollector;
pub use portforward::{
    DestinationMatch, NatRule, PortforwardMgr, Protocol, RuleSyncReport, RuleTables,
    ShellRuleTables,
};
pub use scheduler::JitterTicker;
pub use subscriber::{Subscriber, SubscriberState};
pub use wireguard::{
    DeviceState, KernelDevices, KernelPeer, PeerOp, PeerSyncReport, TunnelDevices, WireguardMgr,
};
