//! sysfs scan: builds the PF/VF/representor graph
//!
//! `rediscover` constructs a complete new Inventory and swaps it in under
//! the write lock, so readers never observe a half-built graph. Individual
//! attribute failures degrade to empty fields; only a failure to list the
//! PCI device directory aborts a scan.

use crate::config::DiscoveryConfig;
use crate::inventory::{Inventory, PfInfo, RepresentorInfo, VfInfo, vf_key};
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use sriov_probe::sysfs::{PciDeviceAttrs, SriovCapacity, Sysfs};
use sriov_probe::{PciIdsIndex, ethtool, parse_capabilities, pci_domain};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

const VENDOR_MELLANOX: &str = "15b3";
const VENDOR_INTEL: &str = "8086";
const VENDOR_EMULEX: &str = "10df";
const VENDOR_QLOGIC: &str = "1077";
const VENDOR_BROADCOM: &str = "14e4";
const VENDOR_SOLARFLARE: &str = "1924";
const VENDOR_HUAWEI: &str = "19e5";

const MELLANOX_REP_DRIVER: &str = "mlx5e_rep";

const INTEL_X710_DEVICES: &[&str] = &[
    "1572", "1580", "1581", "1583", "1584", "1585", "1589", "158a", "158b",
];
const INTEL_E810_DEVICES: &[&str] = &["1591", "1592", "1593", "1599", "159b"];

static VF_PORT_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"vf(\d+)$").expect("static regex"));
static IFACE_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_(\d+)$").expect("static regex"));

pub struct DiscoveryEngine {
    sysfs: Sysfs,
    ids: Arc<PciIdsIndex>,
    config: RwLock<DiscoveryConfig>,
    inventory: Arc<RwLock<Inventory>>,
}

impl DiscoveryEngine {
    pub fn new(sysfs: Sysfs, ids: Arc<PciIdsIndex>, config: DiscoveryConfig) -> Self {
        Self {
            sysfs,
            ids,
            config: RwLock::new(config),
            inventory: Arc::new(RwLock::new(Inventory::default())),
        }
    }

    pub fn sysfs(&self) -> &Sysfs {
        &self.sysfs
    }

    /// shared handle to the canonical inventory
    pub fn inventory(&self) -> Arc<RwLock<Inventory>> {
        Arc::clone(&self.inventory)
    }

    /// replace the discovery filters; takes effect on the next rescan
    pub fn set_config(&self, config: DiscoveryConfig) {
        *self.config.write().expect("discovery config lock") = config;
    }

    pub fn config_snapshot(&self) -> DiscoveryConfig {
        self.config.read().expect("discovery config lock").clone()
    }

    /// full rescan: enumerate, filter, build, link, swap
    pub fn rediscover(&self) -> Result<()> {
        let config = self.config.read().expect("discovery config lock").clone();
        let devices = self
            .sysfs
            .list_pci_devices()
            .context("failed to enumerate PCI devices")?;

        let mut inventory = Inventory::default();

        for pci in devices {
            let SriovCapacity::Capable { total_vfs, num_vfs } =
                self.sysfs.read_sriov_capacity(&pci)
            else {
                continue;
            };

            let attrs = self.sysfs.read_device_attrs(&pci);
            if !config.vendor_allowed(&attrs.identity.vendor_id) {
                debug!("{pci}: vendor {} filtered out", attrs.identity.vendor_id);
                continue;
            }

            let mut pf = self.build_pf(&pci, total_vfs, num_vfs, attrs);

            if num_vfs > 0 {
                for (index, vf_pci) in self.sysfs.enumerate_vfs(&pci) {
                    let vf = self.build_vf(&pci, index, &vf_pci);
                    inventory.vfs.insert(vf_pci.clone(), vf.clone());
                    pf.vfs.insert(vf_pci, vf);
                }

                if config.enable_representor_discovery && self.representors_apply(&config, &pf) {
                    for rep in self.detect_representors(&pf) {
                        if let Some(vf) = pf.vfs.values_mut().find(|vf| vf.index == rep.vf_index)
                        {
                            vf.representor = Some(rep.iface.clone());
                            if let Some(entry) = inventory.vfs.get_mut(&vf.pci_addr) {
                                entry.representor = Some(rep.iface.clone());
                            }
                        }
                        inventory.representors.insert(rep.iface.clone(), rep.clone());
                        pf.representors.insert(rep.iface.clone(), rep);
                    }
                }
            }

            inventory.pfs.insert(pci, pf);
        }

        info!(
            "discovery complete: {} PFs, {} VFs",
            inventory.pf_count(),
            inventory.vf_count()
        );
        *self.inventory.write().expect("inventory lock") = inventory;
        Ok(())
    }

    fn build_pf(&self, pci: &str, total_vfs: u32, num_vfs: u32, attrs: PciDeviceAttrs) -> PfInfo {
        let identity = attrs.identity;
        let names = self.ids.resolve(
            &identity.vendor_id,
            &identity.device_id,
            &identity.subsystem_vendor_id,
            &identity.subsystem_device_id,
        );

        let mut pf = PfInfo {
            pci_addr: pci.to_string(),
            driver: attrs.driver,
            iface: attrs.iface,
            total_vfs,
            num_vfs,
            vendor_id: identity.vendor_id,
            device_id: identity.device_id,
            subsystem_vendor_id: identity.subsystem_vendor_id,
            subsystem_device_id: identity.subsystem_device_id,
            class: identity.class,
            vendor_name: names.vendor,
            device_name: names.device,
            subsystem_vendor_name: names.subsystem_vendor,
            subsystem_device_name: names.subsystem_device,
            numa_node: attrs.numa_node,
            capabilities: parse_capabilities(&self.sysfs.read_config_space(pci)),
            ..Default::default()
        };

        if let Some(revision) =
            sriov_probe::sysfs::read_string(&self.sysfs.pci_device_dir(pci).join("revision"))
        {
            pf.properties.insert("revision".to_string(), revision);
        }

        if !pf.iface.is_empty() {
            let netdev = self.sysfs.read_netdev_attrs(&pf.iface);
            pf.link_state = netdev.link_state;
            pf.link_speed = netdev.link_speed;
            pf.mtu = netdev.mtu;
            pf.mac = netdev.mac;
            pf.properties.extend(netdev.properties);
            pf.eswitch_mode = self.sysfs.read_eswitch_mode(&pf.iface);

            for (key, value) in [
                ("phys_switch_id", self.sysfs.read_phys_switch_id(&pf.iface)),
                ("phys_port_name", self.sysfs.read_phys_port_name(&pf.iface)),
            ] {
                if !value.is_empty() {
                    pf.properties.insert(key.to_string(), value);
                }
            }

            pf.features = ethtool::feature_flags(&pf.iface);
            pf.ring_params = ethtool::ring_params(&pf.iface);
            pf.channels = ethtool::channel_counts(&pf.iface);
        }

        pf
    }

    fn build_vf(&self, pf_pci: &str, index: u32, vf_pci: &str) -> VfInfo {
        let attrs = self.sysfs.read_device_attrs(vf_pci);
        let identity = attrs.identity;
        let names = self.ids.resolve(
            &identity.vendor_id,
            &identity.device_id,
            &identity.subsystem_vendor_id,
            &identity.subsystem_device_id,
        );

        let mut vf = VfInfo {
            pci_addr: vf_pci.to_string(),
            pf_pci_addr: pf_pci.to_string(),
            index,
            driver: attrs.driver,
            iface: attrs.iface,
            vendor_id: identity.vendor_id,
            device_id: identity.device_id,
            subsystem_vendor_id: identity.subsystem_vendor_id,
            subsystem_device_id: identity.subsystem_device_id,
            class: identity.class,
            vendor_name: names.vendor,
            device_name: names.device,
            numa_node: attrs.numa_node,
            ..Default::default()
        };

        if !vf.iface.is_empty() {
            let netdev = self.sysfs.read_netdev_attrs(&vf.iface);
            vf.link_state = netdev.link_state;
            vf.mtu = netdev.mtu;
            vf.mac = netdev.mac;
            vf.properties = netdev.properties;
        }

        vf
    }

    /// whether representor detection applies to this PF under the current
    /// configuration
    fn representors_apply(&self, config: &DiscoveryConfig, pf: &PfInfo) -> bool {
        if !config.enable_switchdev_mode_check {
            return true;
        }
        pf.eswitch_mode == "switchdev"
            && supports_eswitch_mode(&pf.vendor_id, &pf.device_id)
            && self.supports_representors(pf)
    }

    /// stricter per-device representor support check
    fn supports_representors(&self, pf: &PfInfo) -> bool {
        match strip_hex(&pf.vendor_id).as_str() {
            VENDOR_MELLANOX => {
                self.sysfs.pci_driver_present(MELLANOX_REP_DRIVER)
                    || self.has_representor_entries(&pf.iface)
            }
            VENDOR_INTEL => {
                INTEL_E810_DEVICES.contains(&strip_hex(&pf.device_id).as_str())
                    && self.has_representor_entries(&pf.iface)
            }
            _ => self.has_representor_entries(&pf.iface),
        }
    }

    fn has_representor_entries(&self, iface: &str) -> bool {
        !self.sysfs.read_phys_switch_id(iface).is_empty()
            || !self.sysfs.read_phys_port_name(iface).is_empty()
            || !self.sysfs.read_phys_port_id(iface).is_empty()
    }

    /// scan `class/net` for interfaces that represent this PF's VFs
    fn detect_representors(&self, pf: &PfInfo) -> Vec<RepresentorInfo> {
        let pf_switch_id = self.sysfs.read_phys_switch_id(&pf.iface);
        let mut reps = Vec::new();

        for iface in self.sysfs.list_net_interfaces() {
            if iface == pf.iface || is_regular_iface_name(&iface) {
                continue;
            }

            let rep_pci = self.sysfs.iface_pci_addr(&iface).unwrap_or_default();
            let port_name = self.sysfs.read_phys_port_name(&iface);
            let switch_id = self.sysfs.read_phys_switch_id(&iface);

            let mellanox_rep = strip_hex(&pf.vendor_id) == VENDOR_MELLANOX
                && self.sysfs.iface_driver(&iface) == MELLANOX_REP_DRIVER
                && pci_domain(&rep_pci) == pci_domain(&pf.pci_addr);
            let switch_match = !switch_id.is_empty() && switch_id == pf_switch_id;
            let port_match = port_name.contains("pf") || port_name.contains("vf");

            if !(mellanox_rep || switch_match || port_match) {
                continue;
            }

            let Some(index) =
                vf_index_from_port_name(&port_name).or_else(|| vf_index_from_iface_name(&iface))
            else {
                debug!("{iface}: representor-like interface without a VF index, skipping");
                continue;
            };

            debug!("{iface}: representor for {} vf{index}", pf.pci_addr);
            reps.push(RepresentorInfo {
                iface,
                pci_addr: rep_pci,
                vf_key: vf_key(&pf.pci_addr, index),
                vf_index: index,
                rep_type: "switchdev".to_string(),
            });
        }

        reps
    }
}

/// e-switch capable vendor/device allowlist
pub fn supports_eswitch_mode(vendor_id: &str, device_id: &str) -> bool {
    let device = strip_hex(device_id);
    match strip_hex(vendor_id).as_str() {
        VENDOR_MELLANOX | VENDOR_EMULEX | VENDOR_QLOGIC | VENDOR_BROADCOM | VENDOR_SOLARFLARE
        | VENDOR_HUAWEI => true,
        VENDOR_INTEL => {
            INTEL_X710_DEVICES.contains(&device.as_str())
                || INTEL_E810_DEVICES.contains(&device.as_str())
        }
        _ => false,
    }
}

fn strip_hex(id: &str) -> String {
    id.trim().trim_start_matches("0x").to_ascii_lowercase()
}

/// names that can never be representors; `en*` and `p*` are deliberately
/// not rejected, switchdev representors commonly carry those prefixes
fn is_regular_iface_name(name: &str) -> bool {
    const REGULAR_PREFIXES: &[&str] = &["eth", "bond", "br", "veth", "docker", "cali", "flannel"];
    if REGULAR_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    // BIOS-style em1/em2 names only; emX with a non-digit tail may be a rep
    if let Some(rest) = name.strip_prefix("em") {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            return true;
        }
    }
    false
}

/// VF index from a `phys_port_name` such as `pf0vf7`
fn vf_index_from_port_name(port_name: &str) -> Option<u32> {
    VF_PORT_NAME_RE
        .captures(port_name)
        .and_then(|c| c[1].parse().ok())
}

/// fallback: VF index from the interface name itself
fn vf_index_from_iface_name(iface: &str) -> Option<u32> {
    VF_PORT_NAME_RE
        .captures(iface)
        .or_else(|| IFACE_SUFFIX_RE.captures(iface))
        .and_then(|c| c[1].parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const PCI_IDS_SAMPLE: &str = "\
15b3  Mellanox Technologies
\t101d  MT2892 Family [ConnectX-6 Dx]
8086  Intel Corporation
\t1572  Ethernet Controller X710 for 10GbE SFP+
";

    struct FakeHost {
        _tmp: TempDir,
        sysfs: Sysfs,
    }

    impl FakeHost {
        fn new() -> Self {
            let tmp = TempDir::new().unwrap();
            fs::create_dir_all(tmp.path().join("bus/pci/devices")).unwrap();
            fs::create_dir_all(tmp.path().join("bus/pci/drivers")).unwrap();
            fs::create_dir_all(tmp.path().join("class/net")).unwrap();
            let sysfs = Sysfs::new(tmp.path());
            Self { _tmp: tmp, sysfs }
        }

        fn device_dir(&self, pci: &str) -> PathBuf {
            let dir = self.sysfs.pci_device_dir(pci);
            fs::create_dir_all(&dir).unwrap();
            dir
        }

        fn add_pf(&self, pci: &str, iface: &str, vendor: &str, device: &str, total: u32) {
            let dir = self.device_dir(pci);
            fs::write(dir.join("vendor"), format!("{vendor}\n")).unwrap();
            fs::write(dir.join("device"), format!("{device}\n")).unwrap();
            fs::write(dir.join("subsystem_vendor"), format!("{vendor}\n")).unwrap();
            fs::write(dir.join("subsystem_device"), "0x0001\n").unwrap();
            fs::write(dir.join("class"), "0x020000\n").unwrap();
            fs::write(dir.join("numa_node"), "0\n").unwrap();
            fs::write(dir.join("sriov_totalvfs"), format!("{total}\n")).unwrap();
            fs::write(dir.join("sriov_numvfs"), "0\n").unwrap();
            fs::create_dir_all(dir.join(format!("net/{iface}"))).unwrap();

            let iface_dir = self.sysfs.iface_dir(iface);
            fs::create_dir_all(&iface_dir).unwrap();
            fs::write(iface_dir.join("operstate"), "up\n").unwrap();
            fs::write(iface_dir.join("mtu"), "1500\n").unwrap();
            fs::write(iface_dir.join("address"), "aa:bb:cc:dd:ee:00\n").unwrap();
        }

        fn enable_vfs(&self, pci: &str, vf_pcis: &[&str]) {
            let dir = self.sysfs.pci_device_dir(pci);
            fs::write(dir.join("sriov_numvfs"), format!("{}\n", vf_pcis.len())).unwrap();
            for (index, vf_pci) in vf_pcis.iter().enumerate() {
                let vf_dir = self.device_dir(vf_pci);
                fs::write(vf_dir.join("vendor"), "0x15b3\n").unwrap();
                fs::write(vf_dir.join("device"), "0x101e\n").unwrap();
                fs::write(vf_dir.join("class"), "0x020000\n").unwrap();
                symlink(format!("../{vf_pci}"), dir.join(format!("virtfn{index}"))).unwrap();
            }
        }

        fn make_switchdev(&self, iface: &str, switch_id: &str) {
            let iface_dir = self.sysfs.iface_dir(iface);
            fs::create_dir_all(iface_dir.join("compat/devlink")).unwrap();
            fs::write(iface_dir.join("compat/devlink/mode"), "switchdev\n").unwrap();
            fs::write(iface_dir.join("phys_switch_id"), format!("{switch_id}\n")).unwrap();
            fs::write(iface_dir.join("phys_port_name"), "p0\n").unwrap();
            fs::create_dir_all(self.sysfs.pci_drivers_dir().join("mlx5e_rep")).unwrap();
        }

        fn add_representor(&self, name: &str, pci: &str, port_name: &str, switch_id: &str) {
            let iface_dir = self.sysfs.iface_dir(name);
            fs::create_dir_all(&iface_dir).unwrap();
            fs::write(iface_dir.join("phys_port_name"), format!("{port_name}\n")).unwrap();
            fs::write(iface_dir.join("phys_switch_id"), format!("{switch_id}\n")).unwrap();
            symlink(self.sysfs.pci_device_dir(pci), iface_dir.join("device")).unwrap();
        }

        fn engine(&self, config: DiscoveryConfig) -> DiscoveryEngine {
            DiscoveryEngine::new(
                self.sysfs.clone(),
                Arc::new(PciIdsIndex::parse(PCI_IDS_SAMPLE)),
                config,
            )
        }
    }

    #[test]
    fn test_rediscover_builds_graph() {
        let host = FakeHost::new();
        host.add_pf("0000:01:00.0", "enp1s0f0", "0x15b3", "0x101d", 8);
        host.enable_vfs("0000:01:00.0", &["0000:01:10.0", "0000:01:10.1"]);

        let engine = host.engine(DiscoveryConfig::default());
        engine.rediscover().unwrap();

        let inventory = engine.inventory();
        let inv = inventory.read().unwrap();
        assert_eq!(inv.pf_count(), 1);
        assert_eq!(inv.vf_count(), 2);
        inv.check_consistency().unwrap();

        let pf = &inv.pfs["0000:01:00.0"];
        assert_eq!(pf.iface, "enp1s0f0");
        assert_eq!(pf.total_vfs, 8);
        assert_eq!(pf.num_vfs, 2);
        assert_eq!(pf.vendor_name, "Mellanox Technologies");
        assert_eq!(pf.device_name, "MT2892 Family [ConnectX-6 Dx]");
        assert_eq!(pf.class, "ethernet");
        assert_eq!(pf.mac, "aa:bb:cc:dd:ee:00");

        let vf = &inv.vfs["0000:01:10.1"];
        assert_eq!(vf.pf_pci_addr, "0000:01:00.0");
        assert_eq!(vf.index, 1);
        assert_eq!(vf.synthetic_key(), "0000:01:00.0-vf1");
    }

    #[test]
    fn test_rediscover_skips_non_sriov_devices() {
        let host = FakeHost::new();
        host.device_dir("0000:00:1f.0"); // no sriov_totalvfs at all

        let engine = host.engine(DiscoveryConfig::default());
        engine.rediscover().unwrap();

        assert_eq!(engine.inventory().read().unwrap().pf_count(), 0);
    }

    #[test]
    fn test_excluded_vendor_beats_allowed() {
        let host = FakeHost::new();
        host.add_pf("0000:01:00.0", "enp1s0f0", "0x15b3", "0x101d", 8);

        let engine = host.engine(DiscoveryConfig {
            allowed_vendor_ids: vec!["0x15b3".to_string()],
            excluded_vendor_ids: vec!["0x15b3".to_string()],
            ..Default::default()
        });
        engine.rediscover().unwrap();

        assert_eq!(engine.inventory().read().unwrap().pf_count(), 0);
    }

    #[test]
    fn test_representor_detection_and_linking() {
        let host = FakeHost::new();
        host.add_pf("0000:01:00.0", "enp1s0f0", "0x15b3", "0x101d", 8);
        host.enable_vfs("0000:01:00.0", &["0000:01:10.0", "0000:01:10.1"]);
        host.make_switchdev("enp1s0f0", "00aabbccdd");
        host.add_representor("enp1s0f0r1", "0000:01:00.0", "pf0vf1", "00aabbccdd");

        let engine = host.engine(DiscoveryConfig::default());
        engine.rediscover().unwrap();

        let inventory = engine.inventory();
        let inv = inventory.read().unwrap();
        let rep = &inv.representors["enp1s0f0r1"];
        assert_eq!(rep.vf_index, 1);
        assert_eq!(rep.vf_key, "0000:01:00.0-vf1");
        assert_eq!(rep.rep_type, "switchdev");

        let vf = &inv.vfs["0000:01:10.1"];
        assert_eq!(vf.representor.as_deref(), Some("enp1s0f0r1"));
        assert_eq!(inv.vfs["0000:01:10.0"].representor, None);
        assert!(inv.pfs["0000:01:00.0"].representors.contains_key("enp1s0f0r1"));
    }

    #[test]
    fn test_no_representors_in_legacy_mode() {
        let host = FakeHost::new();
        host.add_pf("0000:01:00.0", "enp1s0f0", "0x15b3", "0x101d", 8);
        host.enable_vfs("0000:01:00.0", &["0000:01:10.0"]);
        // representor-shaped interface but the PF stays in legacy mode
        host.add_representor("enp1s0f0r0", "0000:01:00.0", "pf0vf0", "00aabbccdd");

        let engine = host.engine(DiscoveryConfig::default());
        engine.rediscover().unwrap();

        assert!(engine.inventory().read().unwrap().representors.is_empty());
    }

    #[test]
    fn test_eswitch_vendor_allowlist() {
        assert!(supports_eswitch_mode("0x15b3", "0x101d"));
        assert!(supports_eswitch_mode("0x15b3", "0xffff"));
        assert!(supports_eswitch_mode("0x8086", "0x1572"));
        assert!(supports_eswitch_mode("0x8086", "0x1593"));
        assert!(!supports_eswitch_mode("0x8086", "0x10fb"));
        assert!(supports_eswitch_mode("0x14e4", "0x16d7"));
        assert!(!supports_eswitch_mode("0x10de", "0x2203"));
    }

    #[test]
    fn test_regular_interface_names() {
        assert!(is_regular_iface_name("eth0"));
        assert!(is_regular_iface_name("bond0"));
        assert!(is_regular_iface_name("br-ex"));
        assert!(is_regular_iface_name("veth12ab"));
        assert!(is_regular_iface_name("docker0"));
        assert!(is_regular_iface_name("cali01234"));
        assert!(is_regular_iface_name("flannel.1"));
        assert!(is_regular_iface_name("em1"));
        // representor-capable prefixes must survive
        assert!(!is_regular_iface_name("enp59s0f0"));
        assert!(!is_regular_iface_name("p0"));
        assert!(!is_regular_iface_name("pf0vf3"));
        assert!(!is_regular_iface_name("em0_rep"));
    }

    #[test]
    fn test_vf_index_extraction() {
        assert_eq!(vf_index_from_port_name("pf0vf7"), Some(7));
        assert_eq!(vf_index_from_port_name("vf12"), Some(12));
        assert_eq!(vf_index_from_port_name("p0"), None);
        assert_eq!(vf_index_from_port_name(""), None);

        assert_eq!(vf_index_from_iface_name("enp1s0f0vf3"), Some(3));
        assert_eq!(vf_index_from_iface_name("enp1s0f0_2"), Some(2));
        assert_eq!(vf_index_from_iface_name("enp1s0f0"), None);
    }
}
