//! PCI config-space capability list walk
//!
//! Standard capabilities live in the first 256 bytes of config space as a
//! singly linked list rooted at the byte pointer at offset 0x34. Each node
//! is `[id, next, payload...]`; the walk stops on a zero pointer, a pointer
//! whose 8-byte window runs past the buffer, or a pointer already visited.

use serde::{Deserialize, Serialize};

const CAP_LIST_POINTER: usize = 0x34;
const PCI_CAP_ID_EXP: u8 = 0x10;

/// one entry of the standard capability list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciCapability {
    /// capability id as two lowercase hex digits
    pub id: String,
    pub name: String,
    /// capability version, only populated for PCI Express
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// human-readable name for a standard PCI capability id
pub fn capability_name(id: u8) -> String {
    let name = match id {
        0x01 => "Power Management",
        0x02 => "AGP",
        0x03 => "Vital Product Data",
        0x04 => "Slot Identification",
        0x05 => "MSI",
        0x06 => "CompactPCI Hot Swap",
        0x07 => "PCI-X",
        0x08 => "HyperTransport",
        0x09 => "Vendor Specific",
        0x0a => "Debug Port",
        0x0b => "CompactPCI Central Resource Control",
        0x0c => "PCI Hot-Plug",
        0x0d => "Bridge Subsystem Vendor ID",
        0x0e => "AGP 8x",
        0x0f => "Secure Device",
        0x10 => "PCI Express",
        0x11 => "MSI-X",
        0x12 => "SATA Data/Index Configuration",
        0x13 => "Advanced Features",
        0x14 => "Enhanced Allocation",
        0x15 => "Flattening Portal Bridge",
        _ => return format!("Unknown Capability 0x{id:02x}"),
    };
    name.to_string()
}

/// walk the standard capability list of a config-space dump
pub fn parse_capabilities(config: &[u8]) -> Vec<PciCapability> {
    let mut caps = Vec::new();
    if config.len() <= CAP_LIST_POINTER {
        return caps;
    }

    let mut visited = [false; 256];
    let mut pointer = config[CAP_LIST_POINTER] as usize;

    while pointer != 0 && pointer + 8 <= config.len() {
        if visited[pointer] {
            break;
        }
        visited[pointer] = true;

        let id = config[pointer];
        let next = config[pointer + 1];

        let version = if id == PCI_CAP_ID_EXP {
            // PCIe capabilities register: version in the low nibble
            Some(format!("v{}", config[pointer + 2] & 0x0f))
        } else {
            None
        };

        caps.push(PciCapability {
            id: format!("{id:02x}"),
            name: capability_name(id),
            version,
        });

        pointer = next as usize;
    }

    caps
}
