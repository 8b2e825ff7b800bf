//! Port forwarding - DNAT rule reconciliation
//!
//! Every peer with forwarded ports gets one TCP and one UDP multiport DNAT
//! rule per configured destination match, pointing at its tunnel address.
//! The rules live in a pre-provisioned chain of the `nat` table in both the
//! IPv4 and IPv6 firewalls; the chain is fully managed, so anything in it
//! that does not correspond to a desired rule is deleted.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wgmgr_common::defaults::NAT_TABLE;
use wgmgr_common::shell::ShellCommand;
use wgmgr_common::{Reconciler, WgMgrError, WgMgrResult};
use wgmgr_types::{IpFamily, PeerRecord};

use crate::commands::*;
use crate::config::PortforwardConfig;
use crate::metrics::MetricsCollector;

/// Transport protocol of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Both protocols; every forwarded port is forwarded for each.
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule matches traffic addressed to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationMatch {
    /// Destination address is a member of the named ipset
    IpSet { family: IpFamily, name: String },
    /// Destination address equals a single exit address
    Address(IpAddr),
}

impl DestinationMatch {
    pub fn family(&self) -> IpFamily {
        match self {
            DestinationMatch::IpSet { family, .. } => *family,
            DestinationMatch::Address(addr) => IpFamily::of(addr),
        }
    }

    pub fn is_ipset(&self) -> bool {
        matches!(self, DestinationMatch::IpSet { .. })
    }
}

impl fmt::Display for DestinationMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationMatch::IpSet { name, .. } => write!(f, "set:{}", name),
            DestinationMatch::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// A structured multiport DNAT rule.
///
/// Ports are sorted and deduplicated at construction, so two rules for the
/// same port set compare equal regardless of the order the ports were given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NatRule {
    family: IpFamily,
    protocol: Protocol,
    destination: DestinationMatch,
    ports: Vec<u16>,
    to_destination: IpAddr,
}

impl NatRule {
    pub fn new(
        protocol: Protocol,
        destination: DestinationMatch,
        ports: &[u16],
        to_destination: IpAddr,
    ) -> Self {
        let mut ports = ports.to_vec();
        ports.sort_unstable();
        ports.dedup();

        Self {
            family: destination.family(),
            protocol,
            destination,
            ports,
            to_destination,
        }
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn destination(&self) -> &DestinationMatch {
        &self.destination
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn to_destination(&self) -> IpAddr {
        self.to_destination
    }

    /// Returns the rule specification in the form `iptables -S` prints it,
    /// without the `-A CHAIN` prefix.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(16);

        match &self.destination {
            DestinationMatch::Address(addr) => {
                args.extend(["-d".to_string(), addr.to_string()]);
                args.extend(["-p".to_string(), self.protocol.to_string()]);
            }
            DestinationMatch::IpSet { name, .. } => {
                args.extend(["-p".to_string(), self.protocol.to_string()]);
                args.extend(["-m", "set", "--match-set"].map(String::from));
                args.extend([name.clone(), "dst".to_string()]);
            }
        }

        args.extend(["-m", "multiport", "--dports"].map(String::from));
        args.push(ports_list(&self.ports));
        args.extend(["-j", "DNAT", "--to-destination"].map(String::from));
        args.push(self.to_destination.to_string());
        args
    }

    /// Parses a listed rule specification (without `-A CHAIN`).
    ///
    /// Returns `None` for anything that is not exactly a rule this module
    /// would have written.
    pub fn parse_args(family: IpFamily, args: &[String]) -> Option<Self> {
        let mut protocol = None;
        let mut destination = None;
        let mut ports: Option<Vec<u16>> = None;
        let mut to_destination = None;
        let mut dnat = false;

        let mut tokens = args.iter().map(String::as_str);
        while let Some(token) = tokens.next() {
            match token {
                "-p" => protocol = Some(Protocol::from_name(tokens.next()?)?),
                "-d" => {
                    let addr = parse_host(tokens.next()?, family)?;
                    if destination.replace(DestinationMatch::Address(addr)).is_some() {
                        return None;
                    }
                }
                "-m" => match tokens.next()? {
                    "set" | "multiport" => {}
                    module if Some(module) == protocol.map(|p: Protocol| p.as_str()) => {}
                    _ => return None,
                },
                "--match-set" => {
                    let name = tokens.next()?.to_string();
                    if tokens.next()? != "dst" {
                        return None;
                    }
                    if destination
                        .replace(DestinationMatch::IpSet { family, name })
                        .is_some()
                    {
                        return None;
                    }
                }
                "--dports" => ports = Some(parse_ports(tokens.next()?)?),
                "-j" => {
                    if tokens.next()? != "DNAT" {
                        return None;
                    }
                    dnat = true;
                }
                "--to-destination" => to_destination = Some(parse_host(tokens.next()?, family)?),
                _ => return None,
            }
        }

        if !dnat {
            return None;
        }

        Some(NatRule::new(protocol?, destination?, &ports?, to_destination?))
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_args().join(" "))
    }
}

fn ports_list(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_ports(list: &str) -> Option<Vec<u16>> {
    let ports = list
        .split(',')
        .map(|p| p.parse::<u16>().ok())
        .collect::<Option<Vec<_>>>()?;
    (!ports.is_empty()).then_some(ports)
}

/// Parses an address as listed by iptables, which appends `/32` or `/128`
/// to host addresses.
fn parse_host(value: &str, family: IpFamily) -> Option<IpAddr> {
    let addr = match value.split_once('/') {
        Some((addr, len)) => {
            if len.parse::<u8>().ok()? != family.host_prefix_len() {
                return None;
            }
            addr
        }
        None => value,
    };
    let addr: IpAddr = addr.parse().ok()?;
    (IpFamily::of(&addr) == family).then_some(addr)
}

/// Splits a listed rule into arguments, honoring double quotes.
fn split_rule_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

/// A rule found in the managed chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListedRule {
    /// A rule this module recognizes
    Nat(NatRule),
    /// Anything else; kept verbatim so it can be deleted
    Raw { family: IpFamily, args: Vec<String> },
}

impl ListedRule {
    pub fn family(&self) -> IpFamily {
        match self {
            ListedRule::Nat(rule) => rule.family(),
            ListedRule::Raw { family, .. } => *family,
        }
    }

    pub fn args(&self) -> Vec<String> {
        match self {
            ListedRule::Nat(rule) => rule.to_args(),
            ListedRule::Raw { args, .. } => args.clone(),
        }
    }
}

impl fmt::Display for ListedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListedRule::Nat(rule) => write!(f, "{}", rule),
            ListedRule::Raw { args, .. } => f.write_str(&args.join(" ")),
        }
    }
}

/// Parses `iptables -S CHAIN` output.
///
/// Only `-A CHAIN ...` lines are rules; the chain creation line (`-N CHAIN`)
/// that comes first is skipped.
pub fn parse_listing(chain: &str, family: IpFamily, lines: &[String]) -> Vec<ListedRule> {
    lines
        .iter()
        .filter_map(|line| {
            let tokens = split_rule_line(line);
            match tokens.as_slice() {
                [append, name, args @ ..] if append == "-A" && name == chain => {
                    Some(match NatRule::parse_args(family, args) {
                        Some(rule) => ListedRule::Nat(rule),
                        None => ListedRule::Raw {
                            family,
                            args: args.to_vec(),
                        },
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// Access to the firewall rule tables.
#[async_trait]
pub trait RuleTables: Send + Sync {
    /// Lists the chain names of a table.
    async fn list_chains(&self, family: IpFamily, table: &str) -> WgMgrResult<Vec<String>>;

    /// Lists a chain in `iptables -S` form, one rule per line.
    async fn list_rules(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
    ) -> WgMgrResult<Vec<String>>;

    async fn append_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> WgMgrResult<()>;

    async fn delete_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> WgMgrResult<()>;

    /// Lists the names of all ipsets.
    async fn list_sets(&self) -> WgMgrResult<Vec<String>>;
}

/// [`RuleTables`] backed by the `iptables`, `ip6tables` and `ipset` commands.
#[derive(Default)]
pub struct ShellRuleTables {
    #[cfg(test)]
    mock_mode: bool,

    #[cfg(test)]
    mock_outputs: std::sync::Mutex<std::collections::HashMap<String, String>>,

    #[cfg(test)]
    captured_commands: std::sync::Mutex<Vec<String>>,
}

impl ShellRuleTables {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn new_mock() -> Self {
        Self {
            mock_mode: true,
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn set_mock_output(&self, cmd: &ShellCommand, output: &str) {
        self.mock_outputs
            .lock()
            .unwrap()
            .insert(cmd.to_string(), output.to_string());
    }

    /// Execute shell command (or capture in mock mode)
    async fn exec(&self, cmd: ShellCommand) -> WgMgrResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            let line = cmd.to_string();
            self.captured_commands.lock().unwrap().push(line.clone());
            return Ok(self
                .mock_outputs
                .lock()
                .unwrap()
                .get(&line)
                .cloned()
                .unwrap_or_default());
        }

        cmd.output().await
    }
}

fn output_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extracts chain names from `iptables -S` output (`-P BUILTIN POLICY` and
/// `-N USER` lines).
fn parse_chain_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some("-P" | "-N"), Some(name)) => Some(name.to_string()),
                _ => None,
            }
        })
        .collect()
}

#[async_trait]
impl RuleTables for ShellRuleTables {
    async fn list_chains(&self, family: IpFamily, table: &str) -> WgMgrResult<Vec<String>> {
        let output = self.exec(build_list_table_cmd(family, table)).await?;
        Ok(parse_chain_names(&output))
    }

    async fn list_rules(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
    ) -> WgMgrResult<Vec<String>> {
        let output = self.exec(build_list_rules_cmd(family, table, chain)).await?;
        Ok(output_lines(&output))
    }

    async fn append_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> WgMgrResult<()> {
        self.exec(build_append_rule_cmd(family, table, chain, rule))
            .await
            .map(|_| ())
    }

    async fn delete_rule(
        &self,
        family: IpFamily,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> WgMgrResult<()> {
        self.exec(build_delete_rule_cmd(family, table, chain, rule))
            .await
            .map(|_| ())
    }

    async fn list_sets(&self) -> WgMgrResult<Vec<String>> {
        let output = self.exec(build_list_sets_cmd()).await?;
        Ok(output_lines(&output))
    }
}

/// Outcome of a port forwarding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSyncReport {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
}

impl RuleSyncReport {
    /// Returns true if nothing needed to change.
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.failed == 0
    }
}

/// Port forwarding manager
///
/// Converges the managed chain to the rules derived from the peer list.
pub struct PortforwardMgr {
    tables: Arc<dyn RuleTables>,
    chain: String,
    destinations: Vec<DestinationMatch>,
    metrics: Arc<MetricsCollector>,
}

impl PortforwardMgr {
    /// Validates the firewall setup and creates the manager.
    ///
    /// Fails if a family has no destination match, if the chain is missing
    /// from the `nat` table of either family, or if a configured ipset does
    /// not exist.
    pub async fn new(
        config: &PortforwardConfig,
        tables: Arc<dyn RuleTables>,
        metrics: Arc<MetricsCollector>,
    ) -> WgMgrResult<Self> {
        for family in IpFamily::ALL {
            if !config.destinations.iter().any(|d| d.family() == family) {
                return Err(WgMgrError::invalid_config(
                    "portforwarding",
                    format!("no {} ipset or exit address configured", family),
                ));
            }

            let chains = tables.list_chains(family, NAT_TABLE).await?;
            if !chains.iter().any(|c| c == &config.chain) {
                return Err(WgMgrError::ChainNotFound {
                    family: family.to_string(),
                    table: NAT_TABLE.to_string(),
                    chain: config.chain.clone(),
                });
            }
        }

        if config.destinations.iter().any(DestinationMatch::is_ipset) {
            let sets: HashSet<String> = tables.list_sets().await?.into_iter().collect();
            for destination in &config.destinations {
                if let DestinationMatch::IpSet { name, .. } = destination {
                    if !sets.contains(name) {
                        return Err(WgMgrError::IpSetNotFound(name.clone()));
                    }
                }
            }
        }

        info!(
            "PortforwardMgr initialized for chain {} ({} destination matches)",
            config.chain,
            config.destinations.len()
        );

        Ok(Self {
            tables,
            chain: config.chain.clone(),
            destinations: config.destinations.clone(),
            metrics,
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    /// Derives the rules for one peer.
    ///
    /// A family whose address does not parse is skipped; the other family
    /// is still forwarded.
    pub fn rules_for_peer(&self, peer: &PeerRecord) -> Vec<NatRule> {
        if !peer.has_ports() {
            return Vec::new();
        }

        let mut rules = Vec::new();
        for family in IpFamily::ALL {
            let prefix = match peer.prefix(family) {
                Ok(prefix) => prefix,
                Err(e) => {
                    debug!(peer = %peer.pubkey, "Skipping {} forwarding: {}", family, e);
                    continue;
                }
            };

            for destination in self.destinations.iter().filter(|d| d.family() == family) {
                for protocol in Protocol::ALL {
                    rules.push(NatRule::new(
                        protocol,
                        destination.clone(),
                        &peer.ports,
                        prefix.address(),
                    ));
                }
            }
        }
        rules
    }

    /// Derives the full desired rule set.
    pub fn desired_rules(&self, peers: &[PeerRecord]) -> BTreeSet<NatRule> {
        peers.iter().flat_map(|p| self.rules_for_peer(p)).collect()
    }

    /// Reads the managed chain of both families.
    pub async fn current_rules(&self) -> WgMgrResult<Vec<ListedRule>> {
        let mut rules = Vec::new();
        for family in IpFamily::ALL {
            let lines = self
                .tables
                .list_rules(family, NAT_TABLE, &self.chain)
                .await?;
            rules.extend(parse_listing(&self.chain, family, &lines));
        }
        Ok(rules)
    }

    /// Converges the managed chain to the rules derived from `peers`.
    ///
    /// Fails without changing anything if the chain cannot be listed.
    /// Individual append/delete failures are logged, counted and skipped.
    pub async fn update_portforwarding(&self, peers: &[PeerRecord]) -> WgMgrResult<RuleSyncReport> {
        let desired = self.desired_rules(peers);

        let current = match self.current_rules().await {
            Ok(current) => current,
            Err(e) => {
                self.metrics.record_rule_error();
                return Err(e);
            }
        };

        // A rule listed twice is kept once and the copy is removed.
        let mut present = HashSet::new();
        let mut to_remove = Vec::new();
        for listed in current {
            let keep = matches!(
                &listed,
                ListedRule::Nat(rule) if desired.contains(rule) && present.insert(rule.clone())
            );
            if !keep {
                to_remove.push(listed);
            }
        }

        let to_add: Vec<&NatRule> = desired.iter().filter(|r| !present.contains(*r)).collect();

        let mut report = RuleSyncReport::default();

        for rule in to_add {
            match self.append(rule.family(), &rule.to_args()).await {
                Ok(()) => {
                    debug!(rule = %rule, "Added port forwarding rule");
                    report.added += 1;
                }
                Err(_) => report.failed += 1,
            }
        }

        for listed in to_remove {
            match self.delete(listed.family(), &listed.args()).await {
                Ok(()) => {
                    debug!(rule = %listed, "Removed port forwarding rule");
                    report.removed += 1;
                }
                Err(_) => report.failed += 1,
            }
        }

        if !report.is_noop() {
            info!(
                chain = %self.chain,
                added = report.added,
                removed = report.removed,
                failed = report.failed,
                "Port forwarding updated"
            );
        }

        Ok(report)
    }

    /// Appends the rules for a single peer without diffing.
    ///
    /// Failures are already logged and counted by the time they show up in
    /// the report; the next full pass retries them.
    pub async fn add_portforwarding(&self, peer: &PeerRecord) -> RuleSyncReport {
        let mut report = RuleSyncReport::default();
        for rule in self.rules_for_peer(peer) {
            match self.append(rule.family(), &rule.to_args()).await {
                Ok(()) => report.added += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// Deletes the rules for a single peer without diffing.
    pub async fn remove_portforwarding(&self, peer: &PeerRecord) -> RuleSyncReport {
        let mut report = RuleSyncReport::default();
        for rule in self.rules_for_peer(peer) {
            match self.delete(rule.family(), &rule.to_args()).await {
                Ok(()) => report.removed += 1,
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    async fn append(&self, family: IpFamily, rule: &[String]) -> WgMgrResult<()> {
        let result = self
            .tables
            .append_rule(family, NAT_TABLE, &self.chain, rule)
            .await;
        if let Err(e) = &result {
            warn!(rule = %rule.join(" "), "Error adding {} rule: {}", family, e);
            self.metrics.record_rule_error();
        }
        result
    }

    async fn delete(&self, family: IpFamily, rule: &[String]) -> WgMgrResult<()> {
        let result = self
            .tables
            .delete_rule(family, NAT_TABLE, &self.chain, rule)
            .await;
        if let Err(e) = &result {
            warn!(rule = %rule.join(" "), "Error deleting {} rule: {}", family, e);
            self.metrics.record_rule_error();
        }
        result
    }
}

#[async_trait]
impl Reconciler for PortforwardMgr {
    type Report = RuleSyncReport;

    fn name(&self) -> &str {
        "portforward"
    }

    async fn reconcile(&self, peers: &[PeerRecord]) -> WgMgrResult<RuleSyncReport> {
        self.update_portforwarding(peers).await
    }

    async fn add(&self, peer: &PeerRecord) {
        self.add_portforwarding(peer).await;
    }

    async fn remove(&self, peer: &PeerRecord) {
        self.remove_portforwarding(peer).await;
    }
}
