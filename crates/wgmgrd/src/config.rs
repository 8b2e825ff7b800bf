//! Command line and environment configuration.
//!
//! Every flag can also be given as an environment variable with the `WG_`
//! prefix, e.g. `--portforwarding-chain` as `WG_PORTFORWARDING_CHAIN`.
//! [`Args`] is what clap parses; [`DaemonConfig`] is the validated form the
//! daemon is built from.

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use url::Url;
use wgmgr_common::defaults::{DEFAULT_INTERFACE, DEFAULT_PORTFORWARDING_CHAIN};
use wgmgr_common::{WgMgrError, WgMgrResult};
use wgmgr_types::IpFamily;

use crate::portforward::DestinationMatch;

/// Command line arguments for wgmgrd
#[derive(Parser, Debug, Clone)]
#[command(name = "wgmgrd")]
#[command(author, version, about = "Keeps WireGuard peers and port forwarding rules in sync with the API", long_about = None)]
pub struct Args {
    /// How often peers are synchronized with the API
    #[arg(long, env = "WG_INTERVAL", default_value = "1m", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Max random delay added to each synchronization
    #[arg(long, env = "WG_DELAY", default_value = "45s", value_parser = humantime::parse_duration)]
    pub delay: Duration,

    /// API base URL
    #[arg(long, env = "WG_URL")]
    pub url: String,

    /// API username
    #[arg(long, env = "WG_USERNAME", default_value = "")]
    pub username: String,

    /// API password
    #[arg(long, env = "WG_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// WireGuard interfaces to configure, e.g. 'wg0,wg1,wg2'
    #[arg(long, env = "WG_INTERFACES", value_delimiter = ',', default_value = DEFAULT_INTERFACE)]
    pub interfaces: Vec<String>,

    /// Firewall chain in the nat table used for port forwarding
    #[arg(long, env = "WG_PORTFORWARDING_CHAIN", default_value = DEFAULT_PORTFORWARDING_CHAIN)]
    pub portforwarding_chain: String,

    /// ipset matching the IPv4 relay addresses to forward from
    #[arg(long, env = "WG_PORTFORWARDING_IPSET_IPV4")]
    pub portforwarding_ipset_ipv4: Option<String>,

    /// ipset matching the IPv6 relay addresses to forward from
    #[arg(long, env = "WG_PORTFORWARDING_IPSET_IPV6")]
    pub portforwarding_ipset_ipv6: Option<String>,

    /// Exit addresses to forward from, e.g. '192.0.2.1,2001:db8::1'
    #[arg(long, env = "WG_PORTFORWARDING_EXIT_ADDRESSES", value_delimiter = ',')]
    pub portforwarding_exit_addresses: Vec<String>,

    /// Message queue base URL; peer events are not subscribed to when unset
    #[arg(long, env = "WG_MQ_URL")]
    pub mq_url: Option<String>,

    /// Message queue channel to subscribe to
    #[arg(long, env = "WG_MQ_CHANNEL")]
    pub mq_channel: Option<String>,

    /// Message queue username
    #[arg(long, env = "WG_MQ_USERNAME", default_value = "")]
    pub mq_username: String,

    /// Message queue password
    #[arg(long, env = "WG_MQ_PASSWORD", default_value = "", hide_env_values = true)]
    pub mq_password: String,

    /// Address to serve Prometheus metrics on, e.g. '127.0.0.1:9090'
    #[arg(long, env = "WG_METRICS_ADDRESS")]
    pub metrics_address: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "WG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// HTTP Basic credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// Returns credentials only when both parts are non-empty.
    pub fn from_parts(username: &str, password: &str) -> Option<Self> {
        if username.is_empty() || password.is_empty() {
            return None;
        }
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Desired-state API settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub credentials: Option<BasicAuth>,
}

/// Port forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortforwardConfig {
    pub chain: String,
    pub destinations: Vec<DestinationMatch>,
}

/// Event subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub base_url: String,
    pub channel: String,
    pub credentials: Option<BasicAuth>,
}

/// Validated daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub interval: Duration,
    pub delay: Duration,
    pub api: ApiConfig,
    pub interfaces: Vec<String>,
    pub portforward: PortforwardConfig,
    pub subscriber: Option<SubscriberConfig>,
    pub metrics_address: Option<SocketAddr>,
    pub log_level: String,
}

impl DaemonConfig {
    /// Validates parsed arguments.
    pub fn from_args(args: Args) -> WgMgrResult<Self> {
        if args.interval.is_zero() {
            return Err(WgMgrError::invalid_config("interval", "must be greater than zero"));
        }

        let api = ApiConfig {
            base_url: validate_url("url", &args.url)?,
            credentials: BasicAuth::from_parts(&args.username, &args.password),
        };

        let interfaces = non_empty_items(&args.interfaces);
        if interfaces.is_empty() {
            return Err(WgMgrError::invalid_config(
                "interfaces",
                "no wireguard interfaces configured",
            ));
        }

        if args.portforwarding_chain.trim().is_empty() {
            return Err(WgMgrError::invalid_config(
                "portforwarding_chain",
                "chain name is empty",
            ));
        }

        let portforward = PortforwardConfig {
            chain: args.portforwarding_chain.trim().to_string(),
            destinations: destinations(&args)?,
        };

        let subscriber = match args.mq_url.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(url) => {
                let channel = args
                    .mq_channel
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| {
                        WgMgrError::invalid_config("mq_channel", "required when mq_url is set")
                    })?;
                Some(SubscriberConfig {
                    base_url: validate_url("mq_url", url)?,
                    channel: channel.to_string(),
                    credentials: BasicAuth::from_parts(&args.mq_username, &args.mq_password),
                })
            }
        };

        Ok(Self {
            interval: args.interval,
            delay: args.delay,
            api,
            interfaces,
            portforward,
            subscriber,
            metrics_address: args.metrics_address,
            log_level: args.log_level,
        })
    }
}

/// Builds the DNAT destination matches. ipsets take precedence over exit
/// addresses for their family.
fn destinations(args: &Args) -> WgMgrResult<Vec<DestinationMatch>> {
    let mut destinations = Vec::new();

    let ipsets = [
        (IpFamily::V4, &args.portforwarding_ipset_ipv4),
        (IpFamily::V6, &args.portforwarding_ipset_ipv6),
    ];
    for (family, name) in ipsets {
        if let Some(name) = name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            destinations.push(DestinationMatch::IpSet {
                family,
                name: name.to_string(),
            });
        }
    }

    for item in non_empty_items(&args.portforwarding_exit_addresses) {
        let addr: IpAddr = item.parse().map_err(|_| {
            WgMgrError::invalid_config(
                "portforwarding_exit_addresses",
                format!("invalid address {}", item),
            )
        })?;
        let family = IpFamily::of(&addr);
        if destinations.iter().any(|d| d.is_ipset() && d.family() == family) {
            continue;
        }
        let destination = DestinationMatch::Address(addr);
        if !destinations.contains(&destination) {
            destinations.push(destination);
        }
    }

    Ok(destinations)
}

fn validate_url(field: &str, value: &str) -> WgMgrResult<String> {
    let url = Url::parse(value.trim())
        .map_err(|e| WgMgrError::invalid_config(field, format!("{}: {}", value, e)))?;
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn non_empty_items(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
