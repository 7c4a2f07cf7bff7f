//! in-memory device graph: PFs, their VFs, and switchdev representors
//!
//! The graph is rebuilt wholesale by discovery and swapped in atomically;
//! readers always see either the whole old snapshot or the whole new one.
//! PF→VF is the owning edge. VF→PF and VF→representor are stored as plain
//! strings and resolved on demand, never as pointer cycles.

use anyhow::{Result, bail};
use serde::Serialize;
use sriov_probe::PciCapability;
use std::collections::{BTreeMap, HashMap};

/// synthetic VF key used by the service layer: `<pfPCI>-vf<index>`
pub fn vf_key(pf_pci: &str, index: u32) -> String {
    format!("{pf_pci}-vf{index}")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PfInfo {
    pub pci_addr: String,
    pub driver: String,
    pub iface: String,
    pub total_vfs: u32,
    pub num_vfs: u32,
    pub vendor_id: String,
    pub device_id: String,
    pub subsystem_vendor_id: String,
    pub subsystem_device_id: String,
    pub class: String,
    pub vendor_name: String,
    pub device_name: String,
    pub subsystem_vendor_name: String,
    pub subsystem_device_name: String,
    pub numa_node: String,
    pub link_state: String,
    pub link_speed: String,
    pub mtu: String,
    pub mac: String,
    pub eswitch_mode: String,
    /// feature name → enabled, from ethtool
    pub features: HashMap<String, bool>,
    /// ring parameter → value, maxima and current
    pub ring_params: HashMap<String, u32>,
    /// channel parameter → value, maxima and current
    pub channels: HashMap<String, u32>,
    /// open property bag; the key set tracks kernel versions, never hoist
    /// these into fixed fields
    pub properties: HashMap<String, String>,
    /// ordered standard capability list from the config-space walk
    pub capabilities: Vec<PciCapability>,
    /// owned VFs keyed by the VF's real PCI address
    pub vfs: BTreeMap<String, VfInfo>,
    /// owned representors keyed by interface name
    pub representors: BTreeMap<String, RepresentorInfo>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VfInfo {
    /// the VF's real PCI address, from the PF's `virtfnN` symlink
    pub pci_addr: String,
    /// parent PF PCI address, lookup only
    pub pf_pci_addr: String,
    /// N of the `virtfnN` symlink, unique within a PF
    pub index: u32,
    pub driver: String,
    pub iface: String,
    pub vendor_id: String,
    pub device_id: String,
    pub subsystem_vendor_id: String,
    pub subsystem_device_id: String,
    pub class: String,
    pub vendor_name: String,
    pub device_name: String,
    pub numa_node: String,
    pub link_state: String,
    pub mtu: String,
    pub mac: String,
    pub properties: HashMap<String, String>,
    pub allocated: bool,
    pub masked: bool,
    /// owning pool name, empty when unpooled
    pub pool: String,
    /// associated representor interface name, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representor: Option<String>,
}

impl VfInfo {
    pub fn synthetic_key(&self) -> String {
        vf_key(&self.pf_pci_addr, self.index)
    }
}

/// a host-visible netdev proxying a VF in switchdev mode
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepresentorInfo {
    pub iface: String,
    pub pci_addr: String,
    /// synthetic key of the proxied VF
    pub vf_key: String,
    pub vf_index: u32,
    pub rep_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub pfs: BTreeMap<String, PfInfo>,
    /// denormalized VF map for fast lookup by real PCI address
    pub vfs: BTreeMap<String, VfInfo>,
    pub representors: BTreeMap<String, RepresentorInfo>,
}

impl Inventory {
    pub fn pf_count(&self) -> usize {
        self.pfs.len()
    }

    pub fn vf_count(&self) -> usize {
        self.vfs.len()
    }

    /// interface names of all known PFs, for the ethtool sweep
    pub fn pf_ifaces(&self) -> Vec<String> {
        self.pfs
            .values()
            .filter(|pf| !pf.iface.is_empty())
            .map(|pf| pf.iface.clone())
            .collect()
    }

    /// verify the graph invariants: every VF in the denormalized map is
    /// owned by exactly one PF and its back-reference names that PF
    pub fn check_consistency(&self) -> Result<()> {
        for (vf_pci, vf) in &self.vfs {
            if vf_pci != &vf.pci_addr {
                bail!("VF map key {vf_pci} does not match VF address {}", vf.pci_addr);
            }

            let owners: Vec<&String> = self
                .pfs
                .iter()
                .filter(|(_, pf)| pf.vfs.contains_key(vf_pci))
                .map(|(pci, _)| pci)
                .collect();

            match owners.as_slice() {
                [owner] => {
                    if *owner != &vf.pf_pci_addr {
                        bail!(
                            "VF {vf_pci} back-reference {} does not match owner {owner}",
                            vf.pf_pci_addr
                        );
                    }
                }
                [] => bail!("VF {vf_pci} is owned by no PF"),
                _ => bail!("VF {vf_pci} is owned by {} PFs", owners.len()),
            }
        }

        for (pci, pf) in &self.pfs {
            for vf_pci in pf.vfs.keys() {
                if !self.vfs.contains_key(vf_pci) {
                    bail!("PF {pci} owns VF {vf_pci} missing from the VF map");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vf(pf: &str, index: u32, pci: &str) -> VfInfo {
        VfInfo {
            pci_addr: pci.to_string(),
            pf_pci_addr: pf.to_string(),
            index,
            ..Default::default()
        }
    }

    fn inventory_with_one_pf() -> Inventory {
        let pf_pci = "0000:01:00.0";
        let mut pf = PfInfo {
            pci_addr: pf_pci.to_string(),
            ..Default::default()
        };
        let vf0 = vf(pf_pci, 0, "0000:01:10.0");
        let vf1 = vf(pf_pci, 1, "0000:01:10.1");
        pf.vfs.insert(vf0.pci_addr.clone(), vf0.clone());
        pf.vfs.insert(vf1.pci_addr.clone(), vf1.clone());

        let mut inv = Inventory::default();
        inv.vfs.insert(vf0.pci_addr.clone(), vf0);
        inv.vfs.insert(vf1.pci_addr.clone(), vf1);
        inv.pfs.insert(pf_pci.to_string(), pf);
        inv
    }

    #[test]
    fn test_vf_key_format() {
        assert_eq!(vf_key("0000:01:00.0", 0), "0000:01:00.0-vf0");
        assert_eq!(vf_key("0000:3b:00.1", 12), "0000:3b:00.1-vf12");
    }

    #[test]
    fn test_consistent_inventory_passes() {
        let inv = inventory_with_one_pf();
        assert!(inv.check_consistency().is_ok());
        assert_eq!(inv.pf_count(), 1);
        assert_eq!(inv.vf_count(), 2);
    }

    #[test]
    fn test_orphan_vf_fails_consistency() {
        let mut inv = inventory_with_one_pf();
        inv.vfs
            .insert("0000:02:10.0".to_string(), vf("0000:02:00.0", 0, "0000:02:10.0"));

        assert!(inv.check_consistency().is_err());
    }

    #[test]
    fn test_wrong_back_reference_fails_consistency() {
        let mut inv = inventory_with_one_pf();
        inv.vfs.get_mut("0000:01:10.0").unwrap().pf_pci_addr = "0000:ff:00.0".to_string();

        assert!(inv.check_consistency().is_err());
    }

    #[test]
    fn test_missing_from_vf_map_fails_consistency() {
        let mut inv = inventory_with_one_pf();
        inv.vfs.remove("0000:01:10.1");

        assert!(inv.check_consistency().is_err());
    }
}
