//! pool definitions over VF index ranges and their runtime state
//!
//! Pool metadata is kept apart from the hardware graph so that it survives
//! rescans. A configuration reload rebuilds everything from scratch except
//! the allocation map, which carries across reloads and rescans alike.

use crate::config::PoolConfig;
use crate::inventory::vf_key;
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// expand a VF range string: comma-separated decimal integers and
/// inclusive `start-end` spans, whitespace tolerated
pub fn expand_vf_range(spec: &str) -> Result<Vec<u32>> {
    if spec.trim().is_empty() {
        bail!("empty VF range");
    }

    let mut indices = Vec::new();
    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            bail!("empty item in VF range {spec:?}");
        }

        let parts: Vec<&str> = item.split('-').map(str::trim).collect();
        match parts.as_slice() {
            [single] => {
                let index: u32 = single
                    .parse()
                    .with_context(|| format!("invalid VF index {single:?} in range {spec:?}"))?;
                indices.push(index);
            }
            [start, end] => {
                let start: u32 = start
                    .parse()
                    .with_context(|| format!("invalid range start {start:?} in {spec:?}"))?;
                let end: u32 = end
                    .parse()
                    .with_context(|| format!("invalid range end {end:?} in {spec:?}"))?;
                if start > end {
                    bail!("descending range {item:?} in {spec:?}");
                }
                indices.extend(start..=end);
            }
            _ => bail!("malformed range item {item:?} in {spec:?}"),
        }
    }

    Ok(indices)
}

/// canonical form of an index set: sorted, deduplicated, runs collapsed
pub fn collapse_vf_range(indices: &[u32]) -> String {
    let mut sorted: Vec<u32> = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut items: Vec<String> = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let start = sorted[i];
        let mut end = start;
        while i + 1 < sorted.len() && sorted[i + 1] == end + 1 {
            end = sorted[i + 1];
            i += 1;
        }
        if start == end {
            items.push(start.to_string());
        } else {
            items.push(format!("{start}-{end}"));
        }
        i += 1;
    }
    items.join(",")
}

/// a pool as materialized at reload time
#[derive(Debug, Clone, Serialize)]
pub struct PoolLabel {
    pub name: String,
    pub pf_pci: String,
    /// synthetic keys of every VF the pool covers
    pub vfs: BTreeSet<String>,
    /// configuration frozen at reload time
    pub config: PoolConfig,
}

/// allocation and mask state overlaid on the device graph
#[derive(Debug, Default)]
pub struct PoolState {
    /// PFs referenced by at least one pool
    pub allowed_pfs: BTreeSet<String>,
    /// synthetic key → allocated; survives reloads and rescans
    pub allocated: HashMap<String, bool>,
    /// synthetic key → masked
    pub masked: HashMap<String, bool>,
    /// synthetic key → reason, present only while masked
    pub mask_reason: HashMap<String, String>,
    /// synthetic key → owning pool name
    pub vf_to_pool: HashMap<String, String>,
    /// `name:pfPCI` → pool label
    pub pools: BTreeMap<String, PoolLabel>,
}

impl PoolState {
    /// rebuild every map from the pool list; the allocation map is the one
    /// piece of state that carries over. A failed rebuild leaves the
    /// previous state untouched.
    pub fn reload(&mut self, pools: &[PoolConfig]) -> Result<()> {
        let mut next = Self::build(pools)?;
        next.allocated = std::mem::take(&mut self.allocated);
        *self = next;
        Ok(())
    }

    fn build(pools: &[PoolConfig]) -> Result<Self> {
        let mut state = Self::default();

        for pool in pools {
            let indices = expand_vf_range(&pool.vf_range)
                .with_context(|| format!("pool {:?}", pool.name))?;

            let mut keys = BTreeSet::new();
            for index in &indices {
                let key = vf_key(&pool.pf_pci, *index);

                if let Some(other) = state.vf_to_pool.get(&key) {
                    // overlapping pools share allocation state; tolerated
                    warn!("VF {key} listed in pools {other:?} and {:?}", pool.name);
                }
                state.vf_to_pool.insert(key.clone(), pool.name.clone());

                if pool.mask {
                    state.masked.insert(key.clone(), true);
                    state
                        .mask_reason
                        .insert(key.clone(), pool.mask_reason.clone());
                }
                keys.insert(key);
            }

            state.allowed_pfs.insert(pool.pf_pci.clone());
            let label = PoolLabel {
                name: pool.name.clone(),
                pf_pci: pool.pf_pci.clone(),
                vfs: keys,
                config: pool.clone(),
            };
            state
                .pools
                .insert(format!("{}:{}", pool.name, pool.pf_pci), label);

            debug!(
                "pool {:?} on {} covers {} VFs",
                pool.name,
                pool.pf_pci,
                indices.len()
            );
        }

        Ok(state)
    }

    pub fn is_allocated(&self, key: &str) -> bool {
        self.allocated.get(key).copied().unwrap_or(false)
    }

    pub fn is_masked(&self, key: &str) -> bool {
        self.masked.get(key).copied().unwrap_or(false)
    }

    /// free VFs of a pool: neither allocated nor masked
    pub fn free_keys(&self, pool: &PoolLabel) -> Vec<String> {
        pool.vfs
            .iter()
            .filter(|key| !self.is_allocated(key) && !self.is_masked(key))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str, pf: &str, range: &str) -> PoolConfig {
        PoolConfig {
            name: name.to_string(),
            pf_pci: pf.to_string(),
            vf_range: range.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_expand_mixed_range() {
        assert_eq!(
            expand_vf_range("0-2,5,7-9").unwrap(),
            vec![0, 1, 2, 5, 7, 8, 9]
        );
    }

    #[test]
    fn test_expand_single_index() {
        assert_eq!(expand_vf_range("3").unwrap(), vec![3]);
    }

    #[test]
    fn test_expand_tolerates_whitespace() {
        assert_eq!(expand_vf_range(" 0 - 2 , 5 ").unwrap(), vec![0, 1, 2, 5]);
    }

    #[test]
    fn test_expand_rejects_bad_input() {
        assert!(expand_vf_range("").is_err());
        assert!(expand_vf_range("  ").is_err());
        assert!(expand_vf_range("0-1-2").is_err());
        assert!(expand_vf_range("a").is_err());
        assert!(expand_vf_range("1,,2").is_err());
        assert!(expand_vf_range("5-3").is_err());
    }

    #[test]
    fn test_collapse_canonical_form() {
        assert_eq!(collapse_vf_range(&[0, 1, 2, 5, 7, 8, 9]), "0-2,5,7-9");
        assert_eq!(collapse_vf_range(&[3]), "3");
        assert_eq!(collapse_vf_range(&[9, 7, 8, 2, 1, 0, 5]), "0-2,5,7-9");
        assert_eq!(collapse_vf_range(&[1, 1, 2, 2]), "1-2");
        assert_eq!(collapse_vf_range(&[]), "");
    }

    #[test]
    fn test_expand_collapse_idempotent() {
        for spec in ["0-2,5,7-9", "3", "0-7", "1,3,5,7"] {
            let indices = expand_vf_range(spec).unwrap();
            assert_eq!(collapse_vf_range(&indices), spec);
        }
    }

    #[test]
    fn test_reload_builds_masks_and_mapping() {
        let mut state = PoolState::default();
        state
            .reload(&[PoolConfig {
                mask: true,
                mask_reason: "held".to_string(),
                ..pool("res", "0000:01:00.0", "4-5")
            }])
            .unwrap();

        assert!(state.is_masked("0000:01:00.0-vf4"));
        assert!(state.is_masked("0000:01:00.0-vf5"));
        assert_eq!(state.mask_reason["0000:01:00.0-vf4"], "held");
        assert_eq!(state.vf_to_pool["0000:01:00.0-vf5"], "res");
        assert!(state.allowed_pfs.contains("0000:01:00.0"));
        assert_eq!(state.pools["res:0000:01:00.0"].vfs.len(), 2);
    }

    #[test]
    fn test_reload_preserves_allocations() {
        let mut state = PoolState::default();
        state
            .reload(&[pool("p", "0000:01:00.0", "0-3")])
            .unwrap();
        state.allocated.insert("0000:01:00.0-vf1".to_string(), true);

        state
            .reload(&[pool("p", "0000:01:00.0", "0-7")])
            .unwrap();
        assert!(state.is_allocated("0000:01:00.0-vf1"));
        // masks do not carry over, they are rebuilt from config
        assert!(!state.is_masked("0000:01:00.0-vf1"));
    }

    #[test]
    fn test_failed_reload_keeps_previous_state() {
        let mut state = PoolState::default();
        state
            .reload(&[pool("p", "0000:01:00.0", "0-3")])
            .unwrap();
        state.allocated.insert("0000:01:00.0-vf0".to_string(), true);

        let err = state.reload(&[pool("bad", "0000:01:00.0", "0-1-2")]);
        assert!(err.is_err());
        assert!(state.pools.contains_key("p:0000:01:00.0"));
        assert!(state.is_allocated("0000:01:00.0-vf0"));
    }

    #[test]
    fn test_free_keys_excludes_allocated_and_masked() {
        let mut state = PoolState::default();
        state
            .reload(&[pool("p", "0000:01:00.0", "0-3")])
            .unwrap();
        state.allocated.insert("0000:01:00.0-vf0".to_string(), true);
        state.masked.insert("0000:01:00.0-vf1".to_string(), true);

        let label = state.pools["p:0000:01:00.0"].clone();
        assert_eq!(
            state.free_keys(&label),
            vec!["0000:01:00.0-vf2", "0000:01:00.0-vf3"]
        );
    }
}
