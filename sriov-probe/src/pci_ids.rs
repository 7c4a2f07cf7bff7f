//! lazy pci.ids database for vendor and device name resolution
//!
//! The hardware database is parsed at most once per process. A missing or
//! unreadable file is non-fatal: lookups simply return empty names.

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

pub const DEFAULT_PCI_IDS_PATH: &str = "/usr/share/hwdata/pci.ids";

static GLOBAL: OnceCell<PciIdsIndex> = OnceCell::new();

/// resolved names for a vendor/device/subsystem tuple; empty when unknown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedNames {
    pub vendor: String,
    pub device: String,
    pub subsystem_vendor: String,
    pub subsystem_device: String,
}

#[derive(Debug, Default)]
pub struct PciIdsIndex {
    vendors: HashMap<String, String>,
    devices: HashMap<(String, String), String>,
}

impl PciIdsIndex {
    /// parse a pci.ids file; absence yields an empty index
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => {
                let index = Self::parse(&text);
                debug!(
                    "loaded {} vendors / {} devices from {}",
                    index.vendors.len(),
                    index.devices.len(),
                    path.display()
                );
                index
            }
            Err(err) => {
                warn!("pci.ids not loaded from {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// parse pci.ids text: unindented `<4hex> <name>` vendor lines,
    /// single-indented device lines scoped to the last vendor
    pub fn parse(text: &str) -> Self {
        let mut vendors = HashMap::new();
        let mut devices = HashMap::new();
        let mut current_vendor: Option<String> = None;

        for line in text.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // device class section ends the vendor list
            if line.starts_with("C ") {
                break;
            }
            // subsystem lines are doubly indented and out of scope here
            if line.starts_with("\t\t") || line.starts_with("  ") {
                continue;
            }

            let indented = line.starts_with('\t') || line.starts_with(' ');
            let Some((id, name)) = split_id_line(line.trim_start()) else {
                continue;
            };

            if indented {
                if let Some(vendor) = &current_vendor {
                    devices.insert((vendor.clone(), id), name);
                }
            } else {
                vendors.insert(id.clone(), name);
                current_vendor = Some(id);
            }
        }

        Self { vendors, devices }
    }

    /// process-wide index, initialized from the default path on first use
    pub fn global() -> &'static PciIdsIndex {
        GLOBAL.get_or_init(|| Self::load(Path::new(DEFAULT_PCI_IDS_PATH)))
    }

    /// initialize the process-wide index from an explicit path; a second
    /// call is a no-op and returns false
    pub fn init_global(path: &Path) -> bool {
        GLOBAL.set(Self::load(path)).is_ok()
    }

    pub fn vendor_name(&self, vendor_id: &str) -> String {
        self.vendors
            .get(&normalize(vendor_id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn device_name(&self, vendor_id: &str, device_id: &str) -> String {
        self.devices
            .get(&(normalize(vendor_id), normalize(device_id)))
            .cloned()
            .unwrap_or_default()
    }

    /// resolve all four names for a device; `0x` prefixes are stripped
    pub fn resolve(
        &self,
        vendor_id: &str,
        device_id: &str,
        subsys_vendor_id: &str,
        subsys_device_id: &str,
    ) -> ResolvedNames {
        ResolvedNames {
            vendor: self.vendor_name(vendor_id),
            device: self.device_name(vendor_id, device_id),
            subsystem_vendor: self.vendor_name(subsys_vendor_id),
            subsystem_device: self.device_name(subsys_vendor_id, subsys_device_id),
        }
    }
}

fn normalize(id: &str) -> String {
    id.trim().trim_start_matches("0x").to_ascii_lowercase()
}

/// split `<4hex>  <name>` into its parts
fn split_id_line(line: &str) -> Option<(String, String)> {
    let (id, name) = line.split_once(char::is_whitespace)?;
    if id.len() != 4 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((id.to_ascii_lowercase(), name.to_string()))
}
