//! WireGuard peer reconciliation
//!
//! Converges the peer table of each configured kernel interface to the
//! desired peer list:
//!
//! - peers missing from the interface, or with different allowed IPs, are
//!   upserted with replace-allowed-ips semantics
//! - peers the control plane no longer lists are removed
//! - peers whose last handshake is older than [`SESSION_RESET_THRESHOLD`]
//!   are removed and re-added, which drops their session state in the kernel
//!
//! Interfaces are handled independently; one broken interface does not
//! prevent the others from being configured.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wgmgr_common::{equal_prefix_sets, Reconciler, WgMgrError, WgMgrResult};
use wgmgr_types::{IpPrefix, PeerRecord, WgKey};
use wireguard_control::{
    Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder, PeerInfo,
};

use crate::metrics::MetricsCollector;

/// WireGuard re-handshakes roughly every two minutes, so a peer with a
/// handshake within this interval is considered connected.
pub const HANDSHAKE_INTERVAL: Duration = Duration::from_secs(120);

/// Handshake age after which a peer's session is reset.
pub const SESSION_RESET_THRESHOLD: Duration = Duration::from_secs(180);

/// A peer as configured on a kernel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPeer {
    pub public_key: WgKey,
    /// `None` when the allowed IPs are unknown
    pub allowed_ips: Option<Vec<IpPrefix>>,
    /// `None` when the peer never completed a handshake
    pub last_handshake: Option<SystemTime>,
    pub preshared_key: Option<WgKey>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl KernelPeer {
    pub fn new(public_key: WgKey, allowed_ips: Vec<IpPrefix>) -> Self {
        Self {
            public_key,
            allowed_ips: Some(allowed_ips),
            last_handshake: None,
            preshared_key: None,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    /// Time since the last handshake, if there was one. A handshake time in
    /// the future counts as zero.
    pub fn handshake_age(&self, now: SystemTime) -> Option<Duration> {
        self.last_handshake
            .map(|t| now.duration_since(t).unwrap_or(Duration::ZERO))
    }

    pub fn is_connected(&self, now: SystemTime) -> bool {
        self.handshake_age(now)
            .is_some_and(|age| age <= HANDSHAKE_INTERVAL)
    }

    pub fn needs_session_reset(&self, now: SystemTime) -> bool {
        self.handshake_age(now)
            .is_some_and(|age| age > SESSION_RESET_THRESHOLD)
    }
}

/// Snapshot of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub name: String,
    pub peers: Vec<KernelPeer>,
}

/// A single peer change applied to an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    /// Create the peer or replace its allowed IPs
    Upsert {
        public_key: WgKey,
        allowed_ips: Vec<IpPrefix>,
        preshared_key: Option<WgKey>,
    },
    Remove { public_key: WgKey },
}

impl PeerOp {
    pub fn public_key(&self) -> &WgKey {
        match self {
            PeerOp::Upsert { public_key, .. } | PeerOp::Remove { public_key } => public_key,
        }
    }
}

/// Access to WireGuard interfaces.
#[async_trait]
pub trait TunnelDevices: Send + Sync {
    async fn device(&self, interface: &str) -> WgMgrResult<DeviceState>;

    /// Applies all ops in one configuration call.
    async fn configure(&self, interface: &str, ops: &[PeerOp]) -> WgMgrResult<()>;
}

/// [`TunnelDevices`] backed by the kernel WireGuard module.
///
/// The netlink calls are blocking and run on the blocking thread pool.
#[derive(Debug, Default, Clone)]
pub struct KernelDevices;

impl KernelDevices {
    pub fn new() -> Self {
        Self
    }
}

fn interface_name(interface: &str) -> WgMgrResult<InterfaceName> {
    interface
        .parse::<InterfaceName>()
        .map_err(|e| WgMgrError::device(interface, e))
}

fn to_kernel_key(interface: &str, key: &WgKey) -> WgMgrResult<Key> {
    Key::from_base64(&key.to_base64()).map_err(|e| WgMgrError::device(interface, e))
}

fn from_kernel_key(key: &Key) -> Option<WgKey> {
    WgKey::from_base64(&key.to_base64()).ok()
}

fn kernel_peer(info: PeerInfo) -> Option<KernelPeer> {
    let allowed_ips = info
        .config
        .allowed_ips
        .iter()
        .filter_map(|ip| IpPrefix::new(ip.address, ip.cidr).ok())
        .collect();

    Some(KernelPeer {
        public_key: from_kernel_key(&info.config.public_key)?,
        allowed_ips: Some(allowed_ips),
        last_handshake: info.stats.last_handshake_time,
        preshared_key: info.config.preshared_key.as_ref().and_then(from_kernel_key),
        rx_bytes: info.stats.rx_bytes,
        tx_bytes: info.stats.tx_bytes,
    })
}

fn build_update(interface: &str, ops: &[PeerOp]) -> WgMgrResult<DeviceUpdate> {
    let mut update = DeviceUpdate::new();
    for op in ops {
        match op {
            PeerOp::Upsert {
                public_key,
                allowed_ips,
                preshared_key,
            } => {
                let mut peer =
                    PeerConfigBuilder::new(&to_kernel_key(interface, public_key)?).replace_allowed_ips();
                for ip in allowed_ips {
                    peer = peer.add_allowed_ip(ip.address(), ip.prefix_len());
                }
                if let Some(psk) = preshared_key {
                    peer = peer.set_preshared_key(to_kernel_key(interface, psk)?);
                }
                update = update.add_peer(peer);
            }
            PeerOp::Remove { public_key } => {
                update = update.remove_peer_by_key(&to_kernel_key(interface, public_key)?);
            }
        }
    }
    Ok(update)
}

#[async_trait]
impl TunnelDevices for KernelDevices {
    async fn device(&self, interface: &str) -> WgMgrResult<DeviceState> {
        let name = interface_name(interface)?;
        let device = tokio::task::spawn_blocking(move || Device::get(&name, Backend::Kernel))
            .await
            .map_err(|e| WgMgrError::internal(format!("device read task failed: {}", e)))?
            .map_err(|e| WgMgrError::device(interface, e))?;

        Ok(DeviceState {
            name: interface.to_string(),
            peers: device.peers.into_iter().filter_map(kernel_peer).collect(),
        })
    }

    async fn configure(&self, interface: &str, ops: &[PeerOp]) -> WgMgrResult<()> {
        let name = interface_name(interface)?;
        let update = build_update(interface, ops)?;
        tokio::task::spawn_blocking(move || update.apply(&name, Backend::Kernel))
            .await
            .map_err(|e| WgMgrError::internal(format!("device configure task failed: {}", e)))?
            .map_err(|e| WgMgrError::device(interface, e))
    }
}

/// Changes computed for one interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerPlan {
    /// Upserts, removes and the removal half of session resets
    pub batch: Vec<PeerOp>,
    /// The re-add half of session resets, applied after `batch` succeeded
    pub resets: Vec<PeerOp>,
    pub connected: usize,
}

impl PeerPlan {
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.resets.is_empty()
    }

    fn counts(&self, interface: &str) -> InterfaceReport {
        let upserts = self
            .batch
            .iter()
            .filter(|op| matches!(op, PeerOp::Upsert { .. }))
            .count();

        InterfaceReport {
            interface: interface.to_string(),
            upserts,
            removes: self.batch.len() - upserts - self.resets.len(),
            resets: self.resets.len(),
        }
    }
}

/// Builds the desired allowed-IP map, skipping records with an invalid key
/// or address.
pub fn desired_peers(peers: &[PeerRecord]) -> BTreeMap<WgKey, Vec<IpPrefix>> {
    let mut desired = BTreeMap::new();
    for peer in peers {
        let parsed = peer
            .public_key()
            .and_then(|key| Ok((key, peer.allowed_ips()?)));
        match parsed {
            Ok((key, allowed_ips)) => {
                desired.insert(key, allowed_ips);
            }
            Err(e) => debug!(peer = %peer.pubkey, "Skipping invalid peer: {}", e),
        }
    }
    desired
}

/// Computes the ops that converge `device` to `desired`.
pub fn plan_peer_ops(
    desired: &BTreeMap<WgKey, Vec<IpPrefix>>,
    device: &DeviceState,
    now: SystemTime,
) -> PeerPlan {
    let existing: HashMap<&WgKey, &KernelPeer> =
        device.peers.iter().map(|p| (&p.public_key, p)).collect();

    let mut plan = PeerPlan {
        connected: device.peers.iter().filter(|p| p.is_connected(now)).count(),
        ..PeerPlan::default()
    };
    let mut reset_removes = Vec::new();

    for (key, allowed_ips) in desired {
        match existing.get(key) {
            // A stale session is reset whether or not the allowed IPs changed;
            // the re-add carries the desired ones.
            Some(peer) if peer.needs_session_reset(now) => {
                reset_removes.push(PeerOp::Remove { public_key: *key });
                plan.resets.push(PeerOp::Upsert {
                    public_key: *key,
                    allowed_ips: allowed_ips.clone(),
                    preshared_key: peer.preshared_key,
                });
            }
            Some(peer)
                if equal_prefix_sets(Some(allowed_ips.as_slice()), peer.allowed_ips.as_deref()) => {}
            _ => plan.batch.push(PeerOp::Upsert {
                public_key: *key,
                allowed_ips: allowed_ips.clone(),
                preshared_key: None,
            }),
        }
    }

    for peer in &device.peers {
        if !desired.contains_key(&peer.public_key) {
            plan.batch.push(PeerOp::Remove {
                public_key: peer.public_key,
            });
        }
    }

    plan.batch.extend(reset_removes);
    plan
}

/// Per-interface outcome of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceReport {
    pub interface: String,
    pub upserts: usize,
    pub removes: usize,
    pub resets: usize,
}

/// Outcome of a peer synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSyncReport {
    pub interfaces: Vec<InterfaceReport>,
    pub connected_peers: usize,
    pub failed_interfaces: Vec<String>,
}

/// WireGuard peer manager
pub struct WireguardMgr {
    interfaces: Vec<String>,
    devices: Arc<dyn TunnelDevices>,
    metrics: Arc<MetricsCollector>,
}

impl WireguardMgr {
    /// Checks that every interface can be read and creates the manager.
    pub async fn new(
        interfaces: Vec<String>,
        devices: Arc<dyn TunnelDevices>,
        metrics: Arc<MetricsCollector>,
    ) -> WgMgrResult<Self> {
        if interfaces.is_empty() {
            return Err(WgMgrError::invalid_config(
                "interfaces",
                "no wireguard interfaces configured",
            ));
        }

        for interface in &interfaces {
            devices
                .device(interface)
                .await
                .map_err(|e| WgMgrError::DeviceNotFound {
                    interface: interface.clone(),
                    message: e.to_string(),
                })?;
        }

        info!("WireguardMgr initialized for interfaces {:?}", interfaces);

        Ok(Self {
            interfaces,
            devices,
            metrics,
        })
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Converges every interface to `peers`.
    pub async fn update_peers(&self, peers: &[PeerRecord]) -> PeerSyncReport {
        self.update_peers_at(peers, SystemTime::now()).await
    }

    /// Same as [`update_peers`](Self::update_peers) with an explicit clock.
    pub async fn update_peers_at(&self, peers: &[PeerRecord], now: SystemTime) -> PeerSyncReport {
        let desired = desired_peers(peers);
        let mut report = PeerSyncReport::default();

        for interface in &self.interfaces {
            let device = match self.devices.device(interface).await {
                Ok(device) => device,
                Err(e) => {
                    warn!(interface = %interface, "Error reading wireguard interface: {}", e);
                    self.metrics.record_device_error();
                    report.failed_interfaces.push(interface.clone());
                    continue;
                }
            };

            let plan = plan_peer_ops(&desired, &device, now);
            report.connected_peers += plan.connected;

            let counts = plan.counts(interface);
            if !plan.is_empty() {
                if !self.apply_plan(interface, plan).await {
                    report.failed_interfaces.push(interface.clone());
                    continue;
                }
                info!(
                    interface = %interface,
                    upserts = counts.upserts,
                    removes = counts.removes,
                    resets = counts.resets,
                    "Peers updated"
                );
            }
            report.interfaces.push(counts);
        }

        self.metrics.set_connected_peers(report.connected_peers);
        report
    }

    /// Applies both batches; returns false if either failed.
    async fn apply_plan(&self, interface: &str, plan: PeerPlan) -> bool {
        if let Err(e) = self.devices.configure(interface, &plan.batch).await {
            warn!(interface = %interface, "Error configuring wireguard interface: {}", e);
            self.metrics.record_device_error();
            return false;
        }

        if !plan.resets.is_empty() {
            if let Err(e) = self.devices.configure(interface, &plan.resets).await {
                warn!(interface = %interface, "Error re-adding reset peers: {}", e);
                self.metrics.record_device_error();
                return false;
            }
        }

        true
    }

    /// Upserts one peer on every interface.
    pub async fn add_peer(&self, peer: &PeerRecord) {
        let parsed = peer
            .public_key()
            .and_then(|key| Ok((key, peer.allowed_ips()?)));
        let (public_key, allowed_ips) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(peer = %peer.pubkey, "Ignoring invalid peer: {}", e);
                return;
            }
        };

        self.configure_all(&[PeerOp::Upsert {
            public_key,
            allowed_ips,
            preshared_key: None,
        }])
        .await;
    }

    /// Removes one peer from every interface.
    pub async fn remove_peer(&self, peer: &PeerRecord) {
        let public_key = match peer.public_key() {
            Ok(key) => key,
            Err(e) => {
                debug!(peer = %peer.pubkey, "Ignoring invalid peer: {}", e);
                return;
            }
        };

        self.configure_all(&[PeerOp::Remove { public_key }]).await;
    }

    async fn configure_all(&self, ops: &[PeerOp]) {
        for interface in &self.interfaces {
            if let Err(e) = self.devices.configure(interface, ops).await {
                warn!(interface = %interface, "Error configuring wireguard interface: {}", e);
                self.metrics.record_device_error();
            }
        }
    }
}

#[async_trait]
impl Reconciler for WireguardMgr {
    type Report = PeerSyncReport;

    fn name(&self) -> &str {
        "wireguard"
    }

    async fn reconcile(&self, peers: &[PeerRecord]) -> WgMgrResult<PeerSyncReport> {
        Ok(self.update_peers(peers).await)
    }

    async fn add(&self, peer: &PeerRecord) {
        self.add_peer(peer).await
    }

    async fn remove(&self, peer: &PeerRecord) {
        self.remove_peer(peer).await
    }
}
