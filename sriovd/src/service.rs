//! service layer: pool status, allocation, masking, and snapshots
//!
//! All operations serialize through one mutex over the pool state. The
//! inventory read lock is only ever taken while building a dump, and the
//! service mutex is never held across a rediscover — refreshing runs on a
//! blocking task that takes the inventory write lock on its own.

use crate::config::PoolConfig;
use crate::discovery::DiscoveryEngine;
use crate::inventory::{Inventory, VfInfo};
use crate::pools::PoolState;
use crate::rpc::{
    AckResponse, AllocateRequest, AllocateResponse, ApiError, DeviceList, DumpResponse, PfRecord,
    PoolList, PoolStatus, ReleaseResponse, StatusList, VfRecord,
};
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Service {
    state: Mutex<PoolState>,
    discovery: Arc<DiscoveryEngine>,
    inventory: Arc<RwLock<Inventory>>,
}

impl Service {
    pub fn new(discovery: Arc<DiscoveryEngine>, pools: &[PoolConfig]) -> Result<Self> {
        let mut state = PoolState::default();
        state.reload(pools)?;
        let inventory = discovery.inventory();
        Ok(Self {
            state: Mutex::new(state),
            discovery,
            inventory,
        })
    }

    /// rebuild pool state from a new configuration; allocations carry over
    pub fn reload(&self, pools: &[PoolConfig]) -> Result<()> {
        let mut state = self.state.lock().expect("service state lock");
        state.reload(pools)?;
        info!("pool configuration reloaded: {} pools", state.pools.len());
        Ok(())
    }

    /// one PF record per pool label; a VF listed by two pools is reported
    /// twice, with shared allocation state
    pub fn list_devices(&self) -> DeviceList {
        let state = self.state.lock().expect("service state lock");
        let now = now_rfc3339();

        let pfs = state
            .pools
            .values()
            .map(|pool| PfRecord {
                pf_pci: pool.pf_pci.clone(),
                pool: pool.name.clone(),
                vfs: pool
                    .vfs
                    .iter()
                    .map(|key| VfRecord {
                        vf_key: key.clone(),
                        pf_pci: pool.pf_pci.clone(),
                        allocated: state.is_allocated(key),
                        masked: state.is_masked(key),
                        pool: pool.name.clone(),
                        timestamp: now.clone(),
                    })
                    .collect(),
            })
            .collect();

        DeviceList { pfs }
    }

    pub fn get_status(&self) -> StatusList {
        let state = self.state.lock().expect("service state lock");

        let pools = state
            .pools
            .values()
            .map(|pool| {
                let total = pool.vfs.len();
                let allocated = pool.vfs.iter().filter(|k| state.is_allocated(k)).count();
                let masked = pool.vfs.iter().filter(|k| state.is_masked(k)).count();
                let free = total - allocated - masked;
                let percent_free = if total == 0 {
                    0.0
                } else {
                    100.0 * free as f64 / total as f64
                };

                PoolStatus {
                    name: pool.name.clone(),
                    total,
                    allocated,
                    masked,
                    free,
                    percent_free,
                }
            })
            .collect();

        StatusList { pools }
    }

    /// greedy allocation from the first pool on the PF with enough free
    /// VFs; no cross-pool fallback
    pub fn allocate_vfs(&self, request: &AllocateRequest) -> Result<AllocateResponse, ApiError> {
        let mut state = self.state.lock().expect("service state lock");

        if !state.pools.values().any(|p| p.pf_pci == request.pf_pci) {
            return Err(ApiError::not_found(format!(
                "no pool configured for PF {}",
                request.pf_pci
            )));
        }

        let count = request.count as usize;
        let candidate = state
            .pools
            .values()
            .filter(|pool| pool.pf_pci == request.pf_pci)
            .map(|pool| (pool.name.clone(), state.free_keys(pool)))
            .find(|(_, free)| free.len() >= count);

        let Some((pool_name, free)) = candidate else {
            debug!(
                "allocation of {count} VFs on {} found no pool with capacity",
                request.pf_pci
            );
            return Ok(AllocateResponse {
                vfs: Vec::new(),
                message: "No available VFs found".to_string(),
            });
        };

        let now = now_rfc3339();
        let mut vfs = Vec::with_capacity(count);
        for key in free.into_iter().take(count) {
            state.allocated.insert(key.clone(), true);
            vfs.push(VfRecord {
                vf_key: key,
                pf_pci: request.pf_pci.clone(),
                allocated: true,
                masked: false,
                pool: pool_name.clone(),
                timestamp: now.clone(),
            });
        }

        info!(
            "allocated {} VFs from pool {pool_name:?} on {}",
            vfs.len(),
            request.pf_pci
        );
        Ok(AllocateResponse {
            message: format!("Allocated {} VFs from pool {pool_name}", vfs.len()),
            vfs,
        })
    }

    /// flip keys back to free; keys that were not allocated are dropped
    /// silently
    pub fn release_vfs(&self, vf_keys: &[String]) -> ReleaseResponse {
        let mut state = self.state.lock().expect("service state lock");

        let mut released = Vec::new();
        for key in vf_keys {
            if state.is_allocated(key) {
                state.allocated.insert(key.clone(), false);
                released.push(key.clone());
            }
        }

        info!("released {} of {} requested VFs", released.len(), vf_keys.len());
        ReleaseResponse {
            message: format!("Released {} VFs", released.len()),
            released,
        }
    }

    pub fn mask_vf(&self, vf_key: &str, reason: &str) -> AckResponse {
        let mut state = self.state.lock().expect("service state lock");

        if state.is_allocated(vf_key) {
            warn!("refusing to mask allocated VF {vf_key}");
            return AckResponse {
                success: false,
                message: "Cannot mask allocated VF".to_string(),
            };
        }

        state.masked.insert(vf_key.to_string(), true);
        state
            .mask_reason
            .insert(vf_key.to_string(), reason.to_string());
        AckResponse {
            success: true,
            message: format!("Masked {vf_key}"),
        }
    }

    pub fn unmask_vf(&self, vf_key: &str) -> AckResponse {
        let mut state = self.state.lock().expect("service state lock");

        state.masked.insert(vf_key.to_string(), false);
        state.mask_reason.remove(vf_key);
        AckResponse {
            success: true,
            message: format!("Unmasked {vf_key}"),
        }
    }

    pub fn list_pools(&self) -> PoolList {
        let state = self.state.lock().expect("service state lock");
        let names: BTreeSet<String> = state.pools.values().map(|p| p.name.clone()).collect();
        PoolList {
            pools: names.into_iter().collect(),
        }
    }

    /// the configuration frozen at reload time
    pub fn get_pool_config(&self, name: &str) -> Result<PoolConfig, ApiError> {
        let state = self.state.lock().expect("service state lock");
        state
            .pools
            .values()
            .find(|p| p.name == name)
            .map(|p| p.config.clone())
            .ok_or_else(|| ApiError::not_found(format!("pool {name:?} not found")))
    }

    /// full JSON snapshot of pools, hardware graph, and allocation state
    pub fn dump_interfaces(&self) -> DumpResponse {
        let state = self.state.lock().expect("service state lock");
        let inventory = self.inventory.read().expect("inventory lock");
        let timestamp = now_rfc3339();

        let mut virtual_functions: Vec<VfInfo> = inventory.vfs.values().cloned().collect();
        for vf in &mut virtual_functions {
            let key = vf.synthetic_key();
            vf.allocated = state.is_allocated(&key);
            vf.masked = state.is_masked(&key);
            vf.pool = state.vf_to_pool.get(&key).cloned().unwrap_or_default();
        }

        let allocated_keys: BTreeSet<&String> = state
            .allocated
            .iter()
            .filter(|&(_, &v)| v)
            .map(|(k, _)| k)
            .collect();
        let masked_keys: BTreeSet<&String> = state
            .masked
            .iter()
            .filter(|&(_, &v)| v)
            .map(|(k, _)| k)
            .collect();

        let total_vfs = inventory.vf_count();
        let allocated_count = allocated_keys.len();
        let masked_count = masked_keys.len();
        let snapshot = serde_json::json!({
            "server_info": {
                "version": VERSION,
                "pid": std::process::id(),
                "hostname": read_hostname(),
                "generated_at": &timestamp,
            },
            "pools": &state.pools,
            "physical_functions": &inventory.pfs,
            "virtual_functions": virtual_functions,
            "allocations": {
                "allocated_vfs": allocated_keys,
                "masked_vfs": masked_keys,
            },
            "statistics": {
                "total_pfs": inventory.pf_count(),
                "total_vfs": total_vfs,
                "allocated_vfs": allocated_count,
                "masked_vfs": masked_count,
                "available_vfs": total_vfs.saturating_sub(allocated_count + masked_count),
            },
        });

        DumpResponse {
            json: snapshot.to_string(),
            timestamp,
            version: VERSION.to_string(),
        }
    }

    /// trigger a rediscover off the request path; the service mutex is not
    /// held while the inventory write lock is taken
    pub async fn refresh_devices(&self) -> AckResponse {
        let discovery = Arc::clone(&self.discovery);
        match tokio::task::spawn_blocking(move || discovery.rediscover()).await {
            Ok(Ok(())) => AckResponse {
                success: true,
                message: "Device rediscovery complete".to_string(),
            },
            Ok(Err(err)) => AckResponse {
                success: false,
                message: format!("rediscovery failed: {err:#}"),
            },
            Err(err) => AckResponse {
                success: false,
                message: format!("rediscovery task failed: {err}"),
            },
        }
    }

    #[cfg(test)]
    fn assert_never_allocated_and_masked(&self) {
        let state = self.state.lock().unwrap();
        let keys: Vec<&String> = state
            .allocated
            .keys()
            .chain(state.masked.keys())
            .collect();
        for key in keys {
            assert!(
                !(state.is_allocated(key) && state.is_masked(key)),
                "{key} is both allocated and masked"
            );
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn read_hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, PoolConfig};
    use sriov_probe::{PciIdsIndex, Sysfs};
    use std::fs;
    use tempfile::TempDir;

    fn pool(name: &str, pf: &str, range: &str) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            pf_pci: pf.to_string(),
            vf_range: range.to_string(),
            ..Default::default()
        }
    }

    fn service_with(pools: &[PoolConfig]) -> (TempDir, Service) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("bus/pci/devices")).unwrap();
        let discovery = Arc::new(DiscoveryEngine::new(
            Sysfs::new(tmp.path()),
            Arc::new(PciIdsIndex::parse("")),
            DiscoveryConfig::default(),
        ));
        let service = Service::new(discovery, pools).unwrap();
        (tmp, service)
    }

    #[test]
    fn test_masked_pool_after_reload() {
        let (_tmp, service) = service_with(&[PoolConfig {
            mask: true,
            mask_reason: "held".to_string(),
            ..pool("res", "0000:01:00.0", "4-5")
        }]);

        assert_eq!(service.list_pools().pools, vec!["res"]);
        assert_eq!(service.get_pool_config("res").unwrap().vf_range, "4-5");

        let status = service.get_status();
        assert_eq!(status.pools.len(), 1);
        let summary = &status.pools[0];
        assert_eq!(summary.name, "res");
        assert_eq!(summary.total, 2);
        assert_eq!(summary.allocated, 0);
        assert_eq!(summary.masked, 2);
        assert_eq!(summary.free, 0);
        assert_eq!(summary.percent_free, 0.0);
    }

    #[test]
    fn test_allocate_then_release() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-3")]);

        let allocated = service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:01:00.0".to_string(),
                count: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(allocated.vfs.len(), 2);
        for vf in &allocated.vfs {
            assert!(vf.allocated);
            assert!(vf.vf_key.starts_with("0000:01:00.0-vf"));
            let index: u32 = vf.vf_key.rsplit("vf").next().unwrap().parse().unwrap();
            assert!(index <= 3);
        }

        let status = service.get_status();
        assert_eq!(status.pools[0].allocated, 2);
        assert_eq!(status.pools[0].free, 2);

        let keys: Vec<String> = allocated.vfs.iter().map(|v| v.vf_key.clone()).collect();
        let released = service.release_vfs(&keys);
        assert_eq!(released.released, keys);

        let status = service.get_status();
        assert_eq!(status.pools[0].allocated, 0);
        assert_eq!(status.pools[0].free, 4);
    }

    #[test]
    fn test_mask_rejects_allocated_vf() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-3")]);

        let allocated = service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:01:00.0".to_string(),
                count: 1,
                ..Default::default()
            })
            .unwrap();
        let key = allocated.vfs[0].vf_key.clone();

        let ack = service.mask_vf(&key, "x");
        assert!(!ack.success);
        assert_eq!(ack.message, "Cannot mask allocated VF");

        // the VF stays unmasked and the invariant holds
        let status = service.get_status();
        assert_eq!(status.pools[0].masked, 0);
        service.assert_never_allocated_and_masked();
    }

    #[test]
    fn test_release_returns_only_allocated_subset() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-3")]);

        let allocated = service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:01:00.0".to_string(),
                count: 1,
                ..Default::default()
            })
            .unwrap();
        let key = allocated.vfs[0].vf_key.clone();

        let released = service.release_vfs(&[
            key.clone(),
            "0000:01:00.0-vf3".to_string(),
            "0000:ff:00.0-vf0".to_string(),
        ]);
        assert_eq!(released.released, vec![key]);
    }

    #[test]
    fn test_allocate_skips_masked_vfs() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-1")]);

        assert!(service.mask_vf("0000:01:00.0-vf0", "reserved").success);
        let allocated = service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:01:00.0".to_string(),
                count: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(allocated.vfs.len(), 1);
        assert_eq!(allocated.vfs[0].vf_key, "0000:01:00.0-vf1");
        service.assert_never_allocated_and_masked();
    }

    #[test]
    fn test_allocate_without_capacity_reports_no_vfs() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-1")]);

        let response = service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:01:00.0".to_string(),
                count: 5,
                ..Default::default()
            })
            .unwrap();
        assert!(response.vfs.is_empty());
        assert_eq!(response.message, "No available VFs found");
    }

    #[test]
    fn test_allocate_unknown_pf_is_not_found() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-1")]);

        let err = service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:ff:00.0".to_string(),
                count: 1,
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::rpc::ErrorKind::NotFound);
    }

    #[test]
    fn test_unmask_frees_vf() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-0")]);

        service.mask_vf("0000:01:00.0-vf0", "hold");
        assert_eq!(service.get_status().pools[0].free, 0);

        let ack = service.unmask_vf("0000:01:00.0-vf0");
        assert!(ack.success);
        assert_eq!(service.get_status().pools[0].free, 1);
    }

    #[test]
    fn test_list_devices_reports_overlapping_pools_twice() {
        let (_tmp, service) = service_with(&[
            pool("a", "0000:01:00.0", "0-1"),
            pool("b", "0000:01:00.0", "1-2"),
        ]);

        let devices = service.list_devices();
        assert_eq!(devices.pfs.len(), 2);

        let seen: Vec<&str> = devices
            .pfs
            .iter()
            .flat_map(|pf| pf.vfs.iter())
            .filter(|vf| vf.vf_key == "0000:01:00.0-vf1")
            .map(|vf| vf.pool.as_str())
            .collect();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_status_totals_add_up() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-7")]);

        service.mask_vf("0000:01:00.0-vf7", "spare");
        service
            .allocate_vfs(&AllocateRequest {
                pf_pci: "0000:01:00.0".to_string(),
                count: 3,
                ..Default::default()
            })
            .unwrap();

        let summary = &service.get_status().pools[0];
        assert_eq!(summary.total, summary.allocated + summary.masked + summary.free);
        assert_eq!(summary.allocated, 3);
        assert_eq!(summary.masked, 1);
        assert_eq!(summary.percent_free, 50.0);
    }

    #[test]
    fn test_dump_interfaces_shape() {
        let (_tmp, service) = service_with(&[pool("p", "0000:01:00.0", "0-3")]);
        service.mask_vf("0000:01:00.0-vf0", "hold");

        let dump = service.dump_interfaces();
        assert_eq!(dump.version, VERSION);

        let value: serde_json::Value = serde_json::from_str(&dump.json).unwrap();
        for key in [
            "server_info",
            "pools",
            "physical_functions",
            "virtual_functions",
            "allocations",
            "statistics",
        ] {
            assert!(value.get(key).is_some(), "missing top-level key {key}");
        }
        assert_eq!(value["allocations"]["masked_vfs"][0], "0000:01:00.0-vf0");
        assert_eq!(value["statistics"]["total_pfs"], 0);
    }
}
