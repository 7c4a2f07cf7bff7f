//! sysfs readers for PCI device and netdev state
//!
//! All readers are stateless and tolerate concurrent kernel churn: a file
//! that disappears mid-read is reported as absent, never as an error. Only
//! the top-level device listing can fail.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_SYS_ROOT: &str = "/sys";

/// SR-IOV capability of a PCI device as reported by sysfs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SriovCapacity {
    /// no `sriov_totalvfs` attribute at all
    NotCapable,
    /// attribute present but unparsable or zero
    Unusable,
    Capable { total_vfs: u32, num_vfs: u32 },
}

/// PCI identity attributes, `0x`-prefixed hex strings as sysfs reports them
#[derive(Debug, Clone, Default)]
pub struct PciIdentity {
    pub vendor_id: String,
    pub device_id: String,
    pub subsystem_vendor_id: String,
    pub subsystem_device_id: String,
    pub class: String,
}

/// PCI-side attributes of a physical or virtual function
#[derive(Debug, Clone, Default)]
pub struct PciDeviceAttrs {
    pub driver: String,
    pub iface: String,
    pub numa_node: String,
    pub identity: PciIdentity,
}

/// netdev attributes read from `/sys/class/net/<iface>`
#[derive(Debug, Clone, Default)]
pub struct NetdevAttrs {
    pub link_state: String,
    pub link_speed: String,
    pub mtu: String,
    pub mac: String,
    pub properties: HashMap<String, String>,
}

/// sysfs accessor rooted at a path (default `/sys`, overridable for tests)
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new(DEFAULT_SYS_ROOT)
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pci_devices_dir(&self) -> PathBuf {
        self.root.join("bus/pci/devices")
    }

    pub fn pci_drivers_dir(&self) -> PathBuf {
        self.root.join("bus/pci/drivers")
    }

    pub fn net_class_dir(&self) -> PathBuf {
        self.root.join("class/net")
    }

    pub fn pci_device_dir(&self, pci: &str) -> PathBuf {
        self.pci_devices_dir().join(pci)
    }

    pub fn iface_dir(&self, iface: &str) -> PathBuf {
        self.net_class_dir().join(iface)
    }

    /// enumerate PCI addresses under `bus/pci/devices`, skipping entries
    /// whose name lacks a `:` separator
    pub fn list_pci_devices(&self) -> Result<Vec<String>> {
        let dir = self.pci_devices_dir();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to read {}", dir.display()))?;

        let mut devices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.contains(':') {
                continue;
            }
            devices.push(name);
        }

        devices.sort();
        Ok(devices)
    }

    /// read `sriov_totalvfs` / `sriov_numvfs` for a device
    pub fn read_sriov_capacity(&self, pci: &str) -> SriovCapacity {
        let dev = self.pci_device_dir(pci);
        let total = match read_string(&dev.join("sriov_totalvfs")) {
            Some(raw) => raw,
            None => return SriovCapacity::NotCapable,
        };

        let total_vfs = match total.parse::<u32>() {
            Ok(n) if n > 0 => n,
            Ok(_) => {
                debug!("{pci}: sriov_totalvfs is zero, skipping");
                return SriovCapacity::Unusable;
            }
            Err(_) => {
                debug!("{pci}: unparsable sriov_totalvfs {total:?}, skipping");
                return SriovCapacity::Unusable;
            }
        };

        let num_vfs = read_string(&dev.join("sriov_numvfs"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        SriovCapacity::Capable { total_vfs, num_vfs }
    }

    /// read the PCI-side attributes of a device
    pub fn read_device_attrs(&self, pci: &str) -> PciDeviceAttrs {
        let dev = self.pci_device_dir(pci);

        PciDeviceAttrs {
            driver: symlink_basename(&dev.join("driver")),
            iface: single_dir_entry(&dev.join("net")),
            numa_node: read_string(&dev.join("numa_node")).unwrap_or_default(),
            identity: self.read_identity(pci),
        }
    }

    pub fn read_identity(&self, pci: &str) -> PciIdentity {
        let dev = self.pci_device_dir(pci);

        PciIdentity {
            vendor_id: read_string(&dev.join("vendor")).unwrap_or_default(),
            device_id: read_string(&dev.join("device")).unwrap_or_default(),
            subsystem_vendor_id: read_string(&dev.join("subsystem_vendor")).unwrap_or_default(),
            subsystem_device_id: read_string(&dev.join("subsystem_device")).unwrap_or_default(),
            class: read_string(&dev.join("class"))
                .map(|raw| class_label(&raw))
                .unwrap_or_default(),
        }
    }

    /// raw config-space bytes, empty when unreadable
    pub fn read_config_space(&self, pci: &str) -> Vec<u8> {
        fs::read(self.pci_device_dir(pci).join("config")).unwrap_or_default()
    }

    /// `(index, vf_pci)` pairs from the PF's `virtfnN` symlinks
    pub fn enumerate_vfs(&self, pf_pci: &str) -> Vec<(u32, String)> {
        let dev = self.pci_device_dir(pf_pci);
        let mut vfs = Vec::new();

        let entries = match fs::read_dir(&dev) {
            Ok(entries) => entries,
            Err(_) => return vfs,
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = name.strip_prefix("virtfn").and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            let vf_pci = target.strip_prefix("../").unwrap_or(&target);
            // guard against unexpected multi-component targets
            let vf_pci = vf_pci.rsplit('/').next().unwrap_or(vf_pci);

            vfs.push((index, vf_pci.to_string()));
        }

        vfs.sort_by_key(|(index, _)| *index);
        vfs
    }

    /// e-switch mode of a PF interface: contents of `compat/devlink/mode`
    /// or `eswitch_mode`, a bare `switchdev/` directory, else empty
    pub fn read_eswitch_mode(&self, iface: &str) -> String {
        let dir = self.iface_dir(iface);

        if let Some(mode) = read_string(&dir.join("compat/devlink/mode")) {
            return mode;
        }
        if let Some(mode) = read_string(&dir.join("eswitch_mode")) {
            return mode;
        }
        if dir.join("switchdev").is_dir() {
            return "switchdev".to_string();
        }
        String::new()
    }

    pub fn read_phys_switch_id(&self, iface: &str) -> String {
        read_string(&self.iface_dir(iface).join("phys_switch_id")).unwrap_or_default()
    }

    pub fn read_phys_port_name(&self, iface: &str) -> String {
        read_string(&self.iface_dir(iface).join("phys_port_name")).unwrap_or_default()
    }

    pub fn read_phys_port_id(&self, iface: &str) -> String {
        read_string(&self.iface_dir(iface).join("phys_port_id")).unwrap_or_default()
    }

    /// link and addressing state of a netdev; values may be placeholders
    /// when the kernel reports nothing useful
    pub fn read_netdev_attrs(&self, iface: &str) -> NetdevAttrs {
        let dir = self.iface_dir(iface);

        let mut properties = HashMap::new();
        for key in ["duplex", "carrier", "dev_port"] {
            if let Some(value) = read_string(&dir.join(key)) {
                properties.insert(key.to_string(), value);
            }
        }

        NetdevAttrs {
            link_state: read_string(&dir.join("operstate")).unwrap_or_default(),
            link_speed: read_string(&dir.join("speed")).unwrap_or_default(),
            mtu: read_string(&dir.join("mtu")).unwrap_or_default(),
            mac: read_string(&dir.join("address")).unwrap_or_default(),
            properties,
        }
    }

    /// all interface names under `class/net`
    pub fn list_net_interfaces(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = fs::read_dir(self.net_class_dir()) {
            for entry in entries.flatten() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        names
    }

    /// PCI address of the device behind a netdev, from its `device` symlink
    pub fn iface_pci_addr(&self, iface: &str) -> Option<String> {
        let target = fs::read_link(self.iface_dir(iface).join("device")).ok()?;
        target
            .components()
            .rev()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .find(|c| looks_like_pci_addr(c))
    }

    /// kernel driver bound to the device behind a netdev
    pub fn iface_driver(&self, iface: &str) -> String {
        symlink_basename(&self.iface_dir(iface).join("device/driver"))
    }

    /// whether a PCI driver node exists under `bus/pci/drivers`
    pub fn pci_driver_present(&self, driver: &str) -> bool {
        self.pci_drivers_dir().join(driver).is_dir()
    }
}

/// read a sysfs attribute as a trimmed, non-empty string
pub fn read_string(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// basename of a symlink target, empty when the link is absent
fn symlink_basename(path: &Path) -> String {
    fs::read_link(path)
        .ok()
        .and_then(|t| t.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_default()
}

/// the single directory entry under `path`, empty when none
fn single_dir_entry(path: &Path) -> String {
    fs::read_dir(path)
        .ok()
        .and_then(|mut entries| entries.next())
        .and_then(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// whether a string has the `DDDD:BB:DD.F` PCI address shape
pub fn looks_like_pci_addr(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return false;
    }
    let (domain, bus, dev_fn) = (parts[0], parts[1], parts[2]);
    let Some((device, function)) = dev_fn.split_once('.') else {
        return false;
    };

    let hex = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    hex(domain) && hex(bus) && hex(device) && hex(function)
}

/// PCI domain component of an address (`0000` of `0000:3b:00.0`)
pub fn pci_domain(addr: &str) -> &str {
    addr.split(':').next().unwrap_or("")
}

/// coarse device class from the sysfs `class` value: the first four hex
/// digits after `0x` select a label, everything else maps to
/// `unknown_class_<hex>`
pub fn class_label(raw: &str) -> String {
    let hex = raw.trim().trim_start_matches("0x");
    let code = &hex[..hex.len().min(4)];

    let label = match code {
        "0100" => "scsi",
        "0106" => "sata",
        "0107" => "sas",
        "0108" => "nvme",
        "0200" => "ethernet",
        "0207" => "infiniband",
        "0280" => "network_other",
        "0300" => "vga",
        "0302" => "3d",
        "0604" => "pci_bridge",
        "0c03" => "usb",
        "0c06" => "fabric",
        _ => return format!("unknown_class_{code}"),
    };
    label.to_string()
}
