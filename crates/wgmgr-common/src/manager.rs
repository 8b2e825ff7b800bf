//! Reconciler trait and shared defaults.
//!
//! Both the tunnel peer reconciler and the firewall rule reconciler take the
//! full desired peer list on every pass and apply single-peer changes pushed
//! by the event channel. This module captures that shape so the daemon loop
//! can drive them uniformly.

use async_trait::async_trait;
use std::fmt::Debug;
use wgmgr_types::{PeerAction, PeerEvent, PeerRecord};

use crate::error::WgMgrResult;

/// Default values for daemon configuration.
pub mod defaults {
    /// Default WireGuard interface.
    pub const DEFAULT_INTERFACE: &str = "wg0";

    /// Default firewall chain holding the port forwarding rules.
    pub const DEFAULT_PORTFORWARDING_CHAIN: &str = "PORTFORWARDING";

    /// Firewall table the port forwarding chain lives in.
    pub const NAT_TABLE: &str = "nat";

    /// WebSocket sub-protocol spoken by the message queue.
    pub const MESSAGE_QUEUE_PROTOCOL: &str = "message-queue-v1";
}

/// A component that converges live kernel state to the desired peer list.
///
/// Implementations hold no state between passes: every call to
/// [`reconcile`](Reconciler::reconcile) re-reads the live state.
///
/// # Example
///
/// ```ignore
/// use wgmgr_common::{Reconciler, WgMgrResult};
///
/// async fn pass<R: Reconciler>(r: &R, peers: &[PeerRecord]) -> WgMgrResult<()> {
///     let report = r.reconcile(peers).await?;
///     tracing::info!(reconciler = r.name(), ?report, "Pass complete");
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Summary of one reconciliation pass.
    type Report: Debug + Send;

    /// Returns the reconciler name used in logs.
    fn name(&self) -> &str;

    /// Converges live state to `peers`.
    ///
    /// Errors are returned only when the pass could not start at all;
    /// failures on individual resources are logged and reported.
    async fn reconcile(&self, peers: &[PeerRecord]) -> WgMgrResult<Self::Report>;

    /// Installs the state for a single peer without diffing.
    async fn add(&self, peer: &PeerRecord);

    /// Removes the state for a single peer without diffing.
    async fn remove(&self, peer: &PeerRecord);

    /// Applies a pushed peer change.
    async fn apply_event(&self, event: &PeerEvent) {
        match event.action {
            PeerAction::Add => self.add(&event.peer).await,
            PeerAction::Remove => self.remove(&event.peer).await,
        }
    }
}
