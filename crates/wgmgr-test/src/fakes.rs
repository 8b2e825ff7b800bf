//! In-memory implementations of the kernel and firewall seams.
//!
//! Both fakes apply changes the way the kernel does, so the reconcilers can
//! be run pass after pass against them, and both record every mutating call.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use wgmgr_common::{WgMgrError, WgMgrResult};
use wgmgr_types::{IpFamily, WgKey};
use wgmgrd::{DeviceState, KernelPeer, PeerOp, RuleTables, TunnelDevices};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// WireGuard interfaces held in memory.
#[derive(Default)]
pub struct FakeTunnelDevices {
    peers: Mutex<BTreeMap<String, Vec<KernelPeer>>>,
    calls: Mutex<Vec<(String, Vec<PeerOp>)>>,
    unreadable: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeTunnelDevices {
    /// Creates empty interfaces with the given names.
    pub fn with_interfaces(names: &[&str]) -> Self {
        let devices = Self::default();
        for name in names {
            lock(&devices.peers).insert(name.to_string(), Vec::new());
        }
        devices
    }

    /// Adds a peer directly, bypassing the call log.
    pub fn insert_peer(&self, interface: &str, peer: KernelPeer) {
        lock(&self.peers)
            .entry(interface.to_string())
            .or_default()
            .push(peer);
    }

    /// Sets the last handshake of a peer on every interface.
    pub fn set_handshake(&self, key: &WgKey, at: SystemTime) {
        for peers in lock(&self.peers).values_mut() {
            for peer in peers.iter_mut().filter(|p| p.public_key == *key) {
                peer.last_handshake = Some(at);
            }
        }
    }

    /// Makes reads of `interface` fail.
    pub fn set_unreadable(&self, interface: &str, unreadable: bool) {
        let mut set = lock(&self.unreadable);
        if unreadable {
            set.insert(interface.to_string());
        } else {
            set.remove(interface);
        }
    }

    /// Makes configuration of `interface` fail.
    pub fn set_failing(&self, interface: &str, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(interface.to_string());
        } else {
            set.remove(interface);
        }
    }

    pub fn peers(&self, interface: &str) -> Vec<KernelPeer> {
        lock(&self.peers)
            .get(interface)
            .cloned()
            .unwrap_or_default()
    }

    pub fn peer(&self, interface: &str, key: &WgKey) -> Option<KernelPeer> {
        self.peers(interface)
            .into_iter()
            .find(|p| p.public_key == *key)
    }

    /// Every configure call so far, in order.
    pub fn calls(&self) -> Vec<(String, Vec<PeerOp>)> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }
}

#[async_trait]
impl TunnelDevices for FakeTunnelDevices {
    async fn device(&self, interface: &str) -> WgMgrResult<DeviceState> {
        if lock(&self.unreadable).contains(interface) {
            return Err(WgMgrError::device(interface, "operation not permitted"));
        }
        let peers = lock(&self.peers)
            .get(interface)
            .cloned()
            .ok_or_else(|| WgMgrError::device(interface, "no such device"))?;
        Ok(DeviceState {
            name: interface.to_string(),
            peers,
        })
    }

    async fn configure(&self, interface: &str, ops: &[PeerOp]) -> WgMgrResult<()> {
        lock(&self.calls).push((interface.to_string(), ops.to_vec()));
        if lock(&self.failing).contains(interface) {
            return Err(WgMgrError::device(interface, "configure failed"));
        }

        let mut all = lock(&self.peers);
        let peers = all
            .get_mut(interface)
            .ok_or_else(|| WgMgrError::device(interface, "no such device"))?;
        for op in ops {
            match op {
                PeerOp::Upsert {
                    public_key,
                    allowed_ips,
                    preshared_key,
                } => match peers.iter_mut().find(|p| p.public_key == *public_key) {
                    Some(peer) => peer.allowed_ips = Some(allowed_ips.clone()),
                    None => {
                        let mut peer = KernelPeer::new(*public_key, allowed_ips.clone());
                        peer.preshared_key = *preshared_key;
                        peers.push(peer);
                    }
                },
                PeerOp::Remove { public_key } => peers.retain(|p| p.public_key != *public_key),
            }
        }
        Ok(())
    }
}

/// One `nat` table chain per family, stored as `iptables -S` lines.
pub struct FakeRuleTables {
    chain: String,
    lines: Mutex<BTreeMap<IpFamily, Vec<String>>>,
    sets: Vec<String>,
    appended: Mutex<Vec<(IpFamily, Vec<String>)>>,
    deleted: Mutex<Vec<(IpFamily, Vec<String>)>>,
    fail_list: Mutex<bool>,
    fail_append_containing: Mutex<Option<String>>,
}

impl FakeRuleTables {
    /// Creates an empty `chain` in both families, plus the named ipsets.
    pub fn new(chain: &str, sets: &[&str]) -> Self {
        Self {
            chain: chain.to_string(),
            lines: Mutex::new(BTreeMap::new()),
            sets: sets.iter().map(|s| s.to_string()).collect(),
            appended: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            fail_list: Mutex::new(false),
            fail_append_containing: Mutex::new(None),
        }
    }

    /// Adds a raw `-A CHAIN ...` line, as if written by someone else.
    pub fn push_line(&self, family: IpFamily, line: &str) {
        lock(&self.lines)
            .entry(family)
            .or_default()
            .push(line.to_string());
    }

    /// The rule lines of the chain, without the `-N` line.
    pub fn lines(&self, family: IpFamily) -> Vec<String> {
        lock(&self.lines)
            .get(&family)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_fail_list(&self, fail: bool) {
        *lock(&self.fail_list) = fail;
    }

    /// Makes appends of rules containing `needle` fail.
    pub fn fail_appends_containing(&self, needle: Option<&str>) {
        *lock(&self.fail_append_containing) = needle.map(str::to_string);
    }

    pub fn appended(&self) -> Vec<(IpFamily, Vec<String>)> {
        lock(&self.appended).clone()
    }

    pub fn deleted(&self) -> Vec<(IpFamily, Vec<String>)> {
        lock(&self.deleted).clone()
    }

    /// Total number of append and delete calls so far.
    pub fn mutation_count(&self) -> usize {
        lock(&self.appended).len() + lock(&self.deleted).len()
    }

    pub fn clear_calls(&self) {
        lock(&self.appended).clear();
        lock(&self.deleted).clear();
    }

    fn check_chain(&self, table: &str, chain: &str) -> WgMgrResult<()> {
        if table != wgmgr_common::defaults::NAT_TABLE || chain != self.chain {
            return Err(WgMgrError::ShellCommandFailed {
                command: format!("iptables -t {} -S {}", table, chain),
                exit_code: 1,
                output: "No chain/target/match by that name.".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuleTables for FakeRuleTables {
    async fn list_chains(&self, _family: IpFamily, table: &str) -> WgMgrResult<Vec<String>> {
        let mut chains = vec!["PREROUTING".to_string(), "POSTROUTING".to_string()];
        if table == wgmgr_common::defaults::NAT_TABLE {
            chains.push(self.chain.clone());
        }
        Ok(chains)
    }

    async fn list_rules(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
    ) -> WgMgrResult<Vec<String>> {
        self.check_chain(table, chain)?;
        if *lock(&self.fail_list) {
            return Err(WgMgrError::ShellCommandFailed {
                command: format!("iptables -t {} -S {}", table, chain),
                exit_code: 4,
                output: "Another app is currently holding the xtables lock.".to_string(),
            });
        }
        let mut lines = vec![format!("-N {}", chain)];
        lines.extend(self.lines(family));
        Ok(lines)
    }

    async fn append_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> WgMgrResult<()> {
        self.check_chain(table, chain)?;
        lock(&self.appended).push((family, rule.to_vec()));

        let line = rule.join(" ");
        if let Some(needle) = lock(&self.fail_append_containing).as_deref() {
            if line.contains(needle) {
                return Err(WgMgrError::ShellCommandFailed {
                    command: format!("iptables -A {} {}", chain, line),
                    exit_code: 2,
                    output: "Bad argument".to_string(),
                });
            }
        }
        self.push_line(family, &format!("-A {} {}", chain, line));
        Ok(())
    }

    async fn delete_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> WgMgrResult<()> {
        self.check_chain(table, chain)?;
        lock(&self.deleted).push((family, rule.to_vec()));

        let line = format!("-A {} {}", chain, rule.join(" "));
        let mut all = lock(&self.lines);
        let lines = all.entry(family).or_default();
        match lines.iter().position(|l| *l == line) {
            Some(i) => {
                lines.remove(i);
                Ok(())
            }
            None => Err(WgMgrError::ShellCommandFailed {
                command: format!("iptables -D {}", line.trim_start_matches("-A ")),
                exit_code: 1,
                output: "Bad rule (does a matching rule exist in that chain?).".to_string(),
            }),
        }
    }

    async fn list_sets(&self) -> WgMgrResult<Vec<String>> {
        Ok(self.sets.clone())
    }
}

