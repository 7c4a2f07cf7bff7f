//! YAML configuration: pool definitions and discovery filters
//!
//! A reload that fails to parse leaves the previous configuration in force;
//! the daemon never aborts on a bad config file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sriovd/config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// an administratively defined subset of a PF's VF index range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub pf_pci: String,
    pub vf_range: String,
    #[serde(default)]
    pub mask: bool,
    #[serde(default)]
    pub mask_reason: String,
    #[serde(default)]
    pub required_features: Vec<String>,
    #[serde(default)]
    pub numa: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub allowed_vendor_ids: Vec<String>,
    #[serde(default)]
    pub excluded_vendor_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_representor_discovery: bool,
    #[serde(default = "default_true")]
    pub enable_switchdev_mode_check: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            allowed_vendor_ids: Vec::new(),
            excluded_vendor_ids: Vec::new(),
            enable_representor_discovery: true,
            enable_switchdev_mode_check: true,
        }
    }
}

impl DiscoveryConfig {
    /// vendor filter: excluded beats allowed, an empty allowed list means
    /// allow-all
    pub fn vendor_allowed(&self, vendor_id: &str) -> bool {
        let vendor = normalize_vendor(vendor_id);

        if self
            .excluded_vendor_ids
            .iter()
            .any(|v| normalize_vendor(v) == vendor)
        {
            return false;
        }
        if self.allowed_vendor_ids.is_empty() {
            return true;
        }
        self.allowed_vendor_ids
            .iter()
            .any(|v| normalize_vendor(v) == vendor)
    }
}

fn normalize_vendor(id: &str) -> String {
    id.trim().trim_start_matches("0x").to_ascii_lowercase()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}
