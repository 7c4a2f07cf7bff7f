use anyhow::{Context, Result};
use clap::Parser;
use sriov_probe::{PciIdsIndex, Sysfs};
use sriovd::config::{DEFAULT_CONFIG_PATH, DaemonConfig};
use sriovd::discovery::DiscoveryEngine;
use sriovd::rpc::DEFAULT_BIND_ADDR;
use sriovd::server;
use sriovd::service::Service;
use sriovd::watcher::{self, DeviceWatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// SR-IOV device inventory and pool daemon
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// bind address for the remote API
    #[arg(short, long, default_value = DEFAULT_BIND_ADDR)]
    bind: String,

    /// sysfs root (override for testing against a fake tree)
    #[arg(long, default_value = sriov_probe::sysfs::DEFAULT_SYS_ROOT)]
    sys_root: PathBuf,

    /// pci.ids hardware database
    #[arg(long, default_value = sriov_probe::pci_ids::DEFAULT_PCI_IDS_PATH)]
    pci_ids: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = match DaemonConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            warn!("starting with an empty configuration: {err:#}");
            DaemonConfig::default()
        }
    };

    let ids = Arc::new(PciIdsIndex::load(&args.pci_ids));
    let discovery = Arc::new(DiscoveryEngine::new(
        Sysfs::new(&args.sys_root),
        ids,
        config.discovery.clone(),
    ));

    // populate the inventory before serving
    {
        let discovery = Arc::clone(&discovery);
        tokio::task::spawn_blocking(move || discovery.rediscover())
            .await
            .context("initial discovery task failed")??;
    }

    let service = Arc::new(Service::new(Arc::clone(&discovery), &config.pools)?);

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    let shutdown = CancellationToken::new();

    let watcher = DeviceWatcher::new(Arc::clone(&discovery));
    let watcher_task = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = watcher.run(token).await {
                error!("device watcher failed: {err:#}");
            }
        })
    };
    let ethtool_task = tokio::spawn(watcher::run_ethtool_sweep(
        Arc::clone(&discovery),
        shutdown.clone(),
    ));
    let enablement_task = tokio::spawn(watcher::run_enablement_sweep(
        Arc::clone(&discovery),
        shutdown.clone(),
    ));
    let server_task = tokio::spawn(server::serve(
        listener,
        Arc::clone(&service),
        shutdown.clone(),
    ));

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => reload(&args.config, &service, &discovery),
            _ = interrupt.recv() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = terminate.recv() => {
                info!("terminate received, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("server failed: {err:#}"),
        Err(err) => error!("server task failed: {err}"),
    }
    let _ = watcher_task.await;
    let _ = ethtool_task.await;
    let _ = enablement_task.await;

    info!("shutdown complete");
    Ok(())
}

/// SIGHUP: reload the configuration in place; failure leaves the previous
/// configuration in force
fn reload(path: &Path, service: &Service, discovery: &DiscoveryEngine) {
    info!("SIGHUP received, reloading configuration");
    match DaemonConfig::load(path) {
        Ok(config) => {
            if let Err(err) = service.reload(&config.pools) {
                error!("pool reload failed, previous configuration stays in force: {err:#}");
                return;
            }
            discovery.set_config(config.discovery);
            info!("configuration reloaded");
        }
        Err(err) => {
            error!("config reload failed, previous configuration stays in force: {err:#}");
        }
    }
}
