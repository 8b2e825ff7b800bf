//! wgmgrd daemon entry point.
//!
//! Parses configuration, validates the kernel and firewall setup, then runs
//! the synchronization loop until SIGINT or SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wgmgrd::config::SubscriberConfig;
use wgmgrd::metrics_server::spawn_metrics_server;
use wgmgrd::{
    ApiClient, Args, Daemon, DaemonConfig, JitterTicker, KernelDevices, MetricsCollector,
    PortforwardMgr, ShellRuleTables, Subscriber, WireguardMgr, EVENT_CHANNEL_CAPACITY,
};

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Resolves once SIGINT or SIGTERM is received.
async fn wait_for_signal() -> anyhow::Result<&'static str> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

fn spawn_subscriber(
    config: SubscriberConfig,
    shutdown: CancellationToken,
) -> mpsc::Receiver<wgmgr_types::PeerEvent> {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let subscriber = Subscriber::new(config.base_url, config.credentials);
    tokio::spawn(async move {
        if let Err(e) = subscriber.subscribe(&config.channel, tx, shutdown).await {
            error!("Peer event subscription failed: {}", e);
        }
    });
    rx
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let metrics = Arc::new(MetricsCollector::new().context("failed to register metrics")?);

    let metrics_task = match config.metrics_address {
        Some(addr) => Some(
            spawn_metrics_server(addr, metrics.clone(), shutdown.clone())
                .await
                .context("failed to start metrics server")?,
        ),
        None => None,
    };

    let api = ApiClient::new(&config.api).context("failed to initialize API client")?;

    let wireguard = WireguardMgr::new(
        config.interfaces.clone(),
        Arc::new(KernelDevices::new()),
        metrics.clone(),
    )
    .await
    .context("failed to initialize wireguard")?;

    let portforward = PortforwardMgr::new(
        &config.portforward,
        Arc::new(ShellRuleTables::new()),
        metrics.clone(),
    )
    .await
    .context("failed to initialize portforwarding")?;

    let events = config
        .subscriber
        .clone()
        .map(|sub| spawn_subscriber(sub, shutdown.child_token()));
    if events.is_none() {
        info!("No message queue configured, relying on periodic synchronization");
    }

    let daemon = Daemon::new(api, wireguard, portforward, metrics);
    let ticker = JitterTicker::new(config.interval, config.delay);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => info!("Received {}, shutting down", name),
            Err(e) => error!("Signal handling failed, shutting down: {:#}", e),
        }
        signal_token.cancel();
    });

    info!(
        interval = %humantime::format_duration(config.interval),
        delay = %humantime::format_duration(config.delay),
        "Starting synchronization loop"
    );
    daemon.run(ticker, events, shutdown.clone()).await;
    shutdown.cancel();

    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Metrics server stopped with error: {}", e),
            Err(e) => warn!("Metrics server task failed: {}", e),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting wgmgrd ---");

    let config = match DaemonConfig::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("wgmgrd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("wgmgrd error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
