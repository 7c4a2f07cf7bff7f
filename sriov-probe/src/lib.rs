//! stateless probes for SR-IOV capable PCI network devices
//!
//! This crate only ever reads: sysfs attributes, PCI config space, the
//! pci.ids hardware database, and ethtool state. Mutating hardware (VF
//! counts, driver bindings) is out of scope by design.

pub mod caps;
pub mod ethtool;
pub mod pci_ids;
pub mod sysfs;

pub use caps::{PciCapability, parse_capabilities};
pub use pci_ids::{PciIdsIndex, ResolvedNames};
pub use sysfs::{
    NetdevAttrs, PciDeviceAttrs, PciIdentity, SriovCapacity, Sysfs, looks_like_pci_addr,
    pci_domain,
};
