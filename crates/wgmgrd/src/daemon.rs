//! Daemon loop: periodic full passes plus pushed peer events.
//!
//! Passes and event applications run on the same task, so they never
//! overlap and the reconcilers need no locking.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgmgr_common::Reconciler;
use wgmgr_types::{PeerEvent, PeerRecord};

use crate::api::ApiClient;
use crate::metrics::MetricsCollector;
use crate::portforward::PortforwardMgr;
use crate::scheduler::JitterTicker;
use crate::wireguard::WireguardMgr;

/// Capacity of the channel between the subscriber and the daemon loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct Daemon {
    api: ApiClient,
    wireguard: WireguardMgr,
    portforward: PortforwardMgr,
    metrics: Arc<MetricsCollector>,
}

impl Daemon {
    pub fn new(
        api: ApiClient,
        wireguard: WireguardMgr,
        portforward: PortforwardMgr,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            api,
            wireguard,
            portforward,
            metrics,
        }
    }

    /// Runs one full pass: fetch the peer list, then converge the tunnel
    /// devices and then the firewall.
    ///
    /// Returns false if the peer list could not be fetched, in which case
    /// nothing was changed.
    pub async fn synchronize(&self) -> bool {
        let _timer = self.metrics.start_sync_timer();

        let peers = match self.api.get_wireguard_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Error getting peers: {}", e);
                self.metrics.record_error_getting_peers();
                return false;
            }
        };

        run_pass(&self.wireguard, &peers).await;
        run_pass(&self.portforward, &peers).await;
        true
    }

    /// Applies one pushed event to both reconcilers.
    pub async fn apply_event(&self, event: &PeerEvent) {
        self.metrics.record_event_received();
        info!(action = %event.action, peer = %event.peer.pubkey, "Applying peer event");
        self.wireguard.apply_event(event).await;
        self.portforward.apply_event(event).await;
    }

    /// Runs an initial pass, then loops until `shutdown` is cancelled.
    pub async fn run(
        &self,
        mut ticker: JitterTicker,
        mut events: Option<mpsc::Receiver<PeerEvent>>,
        shutdown: CancellationToken,
    ) {
        self.synchronize().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, leaving daemon loop");
                    break;
                }
                _ = ticker.tick() => {
                    self.synchronize().await;
                }
                event = next_event(&mut events) => match event {
                    Some(event) => self.apply_event(&event).await,
                    None => {
                        warn!("Peer event subscription ended, continuing with periodic passes only");
                        events = None;
                    }
                },
            }
        }
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_pass<R: Reconciler>(reconciler: &R, peers: &[PeerRecord]) {
    match reconciler.reconcile(peers).await {
        Ok(report) => debug!(reconciler = reconciler.name(), ?report, "Pass complete"),
        Err(e) => warn!(reconciler = reconciler.name(), "Pass skipped: {}", e),
    }
}
