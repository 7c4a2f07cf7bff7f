//! filesystem watches, per-PF debounce, and periodic sweeps
//!
//! PCI sysfs changes arrive as inotify events; ethtool-derived state is not
//! exported there at useful granularity, so two timed sweeps back the event
//! path up. Rescans triggered by events are debounced per PF: every event
//! inside the window coalesces into the one already-scheduled rescan, and
//! nothing extends the window.

use crate::discovery::DiscoveryEngine;
use anyhow::{Context, Result};
use futures::StreamExt;
use inotify::{Event, EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use sriov_probe::ethtool;
use sriov_probe::sysfs::{SriovCapacity, Sysfs};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
pub const ETHTOOL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const ENABLEMENT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// coalesces rescan triggers per key inside a fixed window
pub struct Debouncer {
    window: Duration,
    pending: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::Sender<String>,
}

impl Debouncer {
    pub fn new(window: Duration) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                window,
                pending: Arc::new(Mutex::new(HashSet::new())),
                tx,
            },
            rx,
        )
    }

    /// schedule a rescan for a key; hits while one is pending are absorbed
    /// by the already-scheduled rescan
    pub fn hit(&self, key: &str) {
        {
            let mut pending = self.pending.lock().expect("debouncer lock");
            if !pending.insert(key.to_string()) {
                return;
            }
        }

        let pending = Arc::clone(&self.pending);
        let tx = self.tx.clone();
        let window = self.window;
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            pending.lock().expect("debouncer lock").remove(&key);
            let _ = tx.send(key).await;
        });
    }
}

/// inotify watch set with the directory each descriptor points at
struct WatchedDirs {
    watches: Watches,
    dirs: HashMap<WatchDescriptor, PathBuf>,
    pf_dirs: HashSet<PathBuf>,
}

fn dir_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::CLOSE_WRITE
        | WatchMask::ATTRIB
        | WatchMask::MOVED_TO
        | WatchMask::MOVED_FROM
}

impl WatchedDirs {
    fn new(watches: Watches) -> Self {
        Self {
            watches,
            dirs: HashMap::new(),
            pf_dirs: HashSet::new(),
        }
    }

    fn add(&mut self, dir: PathBuf) -> Result<()> {
        let wd = self
            .watches
            .add(&dir, dir_mask())
            .with_context(|| format!("failed to watch {}", dir.display()))?;
        self.dirs.insert(wd, dir);
        Ok(())
    }

    fn add_best_effort(&mut self, dir: PathBuf) {
        if let Err(err) = self.add(dir) {
            debug!("optional watch skipped: {err:#}");
        }
    }

    fn add_pf_dir(&mut self, dir: PathBuf) {
        if self.pf_dirs.contains(&dir) {
            return;
        }
        match self.add(dir.clone()) {
            Ok(()) => {
                self.pf_dirs.insert(dir);
            }
            Err(err) => debug!("PF watch skipped: {err:#}"),
        }
    }

    /// the PF key a relevant event maps to, None for noise
    fn relevant_key(&self, event: &Event<OsString>, sysfs: &Sysfs) -> Option<String> {
        let dir = self.dirs.get(&event.wd)?;
        let name = event.name.as_ref()?.to_string_lossy().to_string();

        // VF count toggles and virtfn links inside a watched PF directory
        if self.pf_dirs.contains(dir)
            && (name == "sriov_numvfs" || name == "sriov_totalvfs" || name.starts_with("virtfn"))
        {
            return dir
                .file_name()
                .map(|pf| pf.to_string_lossy().to_string());
        }

        // a new device directory that itself exposes SR-IOV capability
        if *dir == sysfs.pci_devices_dir()
            && event.mask.intersects(EventMask::CREATE | EventMask::MOVED_TO)
            && sysfs.pci_device_dir(&name).join("sriov_totalvfs").exists()
        {
            return Some(name);
        }

        None
    }
}

pub struct DeviceWatcher {
    discovery: Arc<DiscoveryEngine>,
}

impl DeviceWatcher {
    pub fn new(discovery: Arc<DiscoveryEngine>) -> Self {
        Self { discovery }
    }

    /// event loop: feed relevant inotify events through the debouncer and
    /// rescan when a window closes
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let sysfs = self.discovery.sysfs().clone();
        let inotify = Inotify::init().context("failed to initialize inotify")?;
        let mut watches = WatchedDirs::new(inotify.watches());

        watches
            .add(sysfs.pci_devices_dir())
            .context("cannot watch the PCI device directory")?;
        watches.add_best_effort(sysfs.net_class_dir());
        watches.add_best_effort(sysfs.pci_drivers_dir());
        self.refresh_pf_watches(&mut watches);

        let (debouncer, mut rescans) = Debouncer::new(DEBOUNCE_WINDOW);
        let mut stream = inotify
            .into_event_stream([0u8; 4096])
            .context("failed to open inotify event stream")?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(key) = rescans.recv() => {
                    debug!("debounced rescan for {key}");
                    self.rescan().await;
                    self.refresh_pf_watches(&mut watches);
                }
                event = stream.next() => {
                    match event {
                        Some(Ok(event)) => {
                            if let Some(key) = watches.relevant_key(&event, &sysfs) {
                                debouncer.hit(&key);
                            }
                        }
                        Some(Err(err)) => warn!("inotify read failed: {err}"),
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    fn refresh_pf_watches(&self, watches: &mut WatchedDirs) {
        let sysfs = self.discovery.sysfs();
        let inventory = self.discovery.inventory();
        let pfs: Vec<String> = inventory
            .read()
            .expect("inventory lock")
            .pfs
            .keys()
            .cloned()
            .collect();

        for pci in pfs {
            watches.add_pf_dir(sysfs.pci_device_dir(&pci));
        }
    }

    async fn rescan(&self) {
        let discovery = Arc::clone(&self.discovery);
        match tokio::task::spawn_blocking(move || discovery.rediscover()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("rescan failed: {err:#}"),
            Err(err) => warn!("rescan task failed: {err}"),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
struct EthtoolSnapshot {
    features: BTreeMap<String, bool>,
    rings: BTreeMap<String, u32>,
    channels: BTreeMap<String, u32>,
}

fn collect_ethtool_snapshots(ifaces: &[String]) -> HashMap<String, EthtoolSnapshot> {
    let mut snapshots = HashMap::new();
    for iface in ifaces {
        snapshots.insert(
            iface.clone(),
            EthtoolSnapshot {
                features: ethtool::feature_flags(iface).into_iter().collect(),
                rings: ethtool::ring_params(iface).into_iter().collect(),
                channels: ethtool::channel_counts(iface).into_iter().collect(),
            },
        );
    }
    snapshots
}

/// 30 s sweep: rescan when any monitored ethtool field moved since the
/// cached snapshot
pub async fn run_ethtool_sweep(discovery: Arc<DiscoveryEngine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(ETHTOOL_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cache: Option<HashMap<String, EthtoolSnapshot>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let ifaces = discovery
            .inventory()
            .read()
            .expect("inventory lock")
            .pf_ifaces();
        let snapshots =
            match tokio::task::spawn_blocking(move || collect_ethtool_snapshots(&ifaces)).await {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    warn!("ethtool sweep task failed: {err}");
                    continue;
                }
            };

        let changed = cache.as_ref().is_some_and(|prev| *prev != snapshots);
        cache = Some(snapshots);

        if changed {
            debug!("ethtool state changed, rescanning");
            let engine = Arc::clone(&discovery);
            match tokio::task::spawn_blocking(move || engine.rediscover()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("ethtool-triggered rescan failed: {err:#}"),
                Err(err) => warn!("ethtool-triggered rescan task failed: {err}"),
            }
        }
    }
}

/// whether SR-IOV enablement drifted from the inventory: a tracked PF with
/// a different VF count, a new capable device, or a vanished PF
fn enablement_changed(discovery: &DiscoveryEngine) -> bool {
    let sysfs = discovery.sysfs();
    let config = discovery.config_snapshot();
    let inventory = discovery.inventory();
    let inv = inventory.read().expect("inventory lock");

    let Ok(devices) = sysfs.list_pci_devices() else {
        return false;
    };

    let mut seen = HashSet::new();
    for pci in &devices {
        if let SriovCapacity::Capable { num_vfs, .. } = sysfs.read_sriov_capacity(pci) {
            if !config.vendor_allowed(&sysfs.read_identity(pci).vendor_id) {
                continue;
            }
            seen.insert(pci.clone());
            match inv.pfs.get(pci) {
                Some(pf) if pf.num_vfs == num_vfs => {}
                _ => return true,
            }
        }
    }

    inv.pfs.keys().any(|pci| !seen.contains(pci))
}

/// 10 s safety net against missed filesystem events
pub async fn run_enablement_sweep(discovery: Arc<DiscoveryEngine>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(ENABLEMENT_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let engine = Arc::clone(&discovery);
        let changed = tokio::task::spawn_blocking(move || enablement_changed(&engine))
            .await
            .unwrap_or(false);

        if changed {
            debug!("SR-IOV enablement changed, rescanning");
            let engine = Arc::clone(&discovery);
            match tokio::task::spawn_blocking(move || engine.rediscover()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("enablement-triggered rescan failed: {err:#}"),
                Err(err) => warn!("enablement-triggered rescan task failed: {err}"),
            }
        }
    }
}
