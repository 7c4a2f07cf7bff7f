//! SIOCETHTOOL helpers: feature flags, ring parameters, channel counts
//!
//! These attributes are not exported through sysfs at useful granularity,
//! so they are read with raw ethtool ioctls over a datagram socket. The
//! handle is created once per process; every per-interface failure is
//! downgraded to an empty map at the call sites.

use anyhow::{Context, Result, bail};
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use tracing::{debug, warn};

const SIOCETHTOOL: libc::c_ulong = 0x8946;

const ETHTOOL_GRINGPARAM: u32 = 0x0000_0010;
const ETHTOOL_GSTRINGS: u32 = 0x0000_001b;
const ETHTOOL_GSSET_INFO: u32 = 0x0000_0037;
const ETHTOOL_GFEATURES: u32 = 0x0000_003a;
const ETHTOOL_GCHANNELS: u32 = 0x0000_003c;

const ETH_SS_FEATURES: u64 = 4;
const ETH_GSTRING_LEN: usize = 32;
const GSTRINGS_HEADER_LEN: usize = 12;
const GFEATURES_HEADER_LEN: usize = 8;
const GFEATURES_BLOCK_LEN: usize = 16;
// sanity cap well above any kernel feature-string set
const MAX_FEATURES: u32 = 4096;

#[repr(C)]
struct EthtoolRingparam {
    cmd: u32,
    rx_max_pending: u32,
    rx_mini_max_pending: u32,
    rx_jumbo_max_pending: u32,
    tx_max_pending: u32,
    rx_pending: u32,
    rx_mini_pending: u32,
    rx_jumbo_pending: u32,
    tx_pending: u32,
}

#[repr(C)]
struct EthtoolChannels {
    cmd: u32,
    max_rx: u32,
    max_tx: u32,
    max_other: u32,
    max_combined: u32,
    rx_count: u32,
    tx_count: u32,
    other_count: u32,
    combined_count: u32,
}

#[repr(C)]
struct EthtoolSsetInfo {
    cmd: u32,
    reserved: u32,
    sset_mask: u64,
    data: u32,
}

/// once-init ethtool control socket
pub struct EthtoolHandle {
    fd: OwnedFd,
}

impl EthtoolHandle {
    pub fn new() -> Result<Self> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .context("failed to open ethtool control socket")?;
        Ok(Self { fd })
    }

    /// process-wide handle; None when the socket cannot be created
    pub fn global() -> Option<&'static EthtoolHandle> {
        static HANDLE: OnceCell<Option<EthtoolHandle>> = OnceCell::new();
        HANDLE
            .get_or_init(|| match EthtoolHandle::new() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!("ethtool helpers unavailable: {err:#}");
                    None
                }
            })
            .as_ref()
    }

    fn ioctl(&self, iface: &str, data: *mut libc::c_void) -> Result<()> {
        if iface.is_empty() || iface.len() >= libc::IFNAMSIZ {
            bail!("invalid interface name {iface:?}");
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(iface.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_data = data as *mut libc::c_char;

        let rc = unsafe { libc::ioctl(self.fd.as_raw_fd(), SIOCETHTOOL as _, &mut ifr) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            bail!("SIOCETHTOOL failed for {iface}: {err}");
        }
        Ok(())
    }

    /// ring parameters: maxima and current values, keyed by kernel name
    pub fn ring_params(&self, iface: &str) -> Result<HashMap<String, u32>> {
        let mut ring: EthtoolRingparam = unsafe { std::mem::zeroed() };
        ring.cmd = ETHTOOL_GRINGPARAM;
        self.ioctl(iface, (&raw mut ring).cast())?;

        let mut map = HashMap::new();
        map.insert("rx_max_pending".to_string(), ring.rx_max_pending);
        map.insert("rx_mini_max_pending".to_string(), ring.rx_mini_max_pending);
        map.insert(
            "rx_jumbo_max_pending".to_string(),
            ring.rx_jumbo_max_pending,
        );
        map.insert("tx_max_pending".to_string(), ring.tx_max_pending);
        map.insert("rx_pending".to_string(), ring.rx_pending);
        map.insert("rx_mini_pending".to_string(), ring.rx_mini_pending);
        map.insert("rx_jumbo_pending".to_string(), ring.rx_jumbo_pending);
        map.insert("tx_pending".to_string(), ring.tx_pending);
        Ok(map)
    }

    /// channel counts: maxima and current values, keyed by kernel name
    pub fn channels(&self, iface: &str) -> Result<HashMap<String, u32>> {
        let mut channels: EthtoolChannels = unsafe { std::mem::zeroed() };
        channels.cmd = ETHTOOL_GCHANNELS;
        self.ioctl(iface, (&raw mut channels).cast())?;

        let mut map = HashMap::new();
        map.insert("max_rx".to_string(), channels.max_rx);
        map.insert("max_tx".to_string(), channels.max_tx);
        map.insert("max_other".to_string(), channels.max_other);
        map.insert("max_combined".to_string(), channels.max_combined);
        map.insert("rx_count".to_string(), channels.rx_count);
        map.insert("tx_count".to_string(), channels.tx_count);
        map.insert("other_count".to_string(), channels.other_count);
        map.insert("combined_count".to_string(), channels.combined_count);
        Ok(map)
    }

    /// feature flags by name, true when the feature is active
    pub fn features(&self, iface: &str) -> Result<HashMap<String, bool>> {
        let count = self.feature_count(iface)?;
        if count == 0 {
            return Ok(HashMap::new());
        }

        let names = self.feature_names(iface, count)?;
        let active = self.feature_bits(iface, count)?;
        Ok(features_to_map(&names, &active))
    }

    fn feature_count(&self, iface: &str) -> Result<u32> {
        let mut info: EthtoolSsetInfo = unsafe { std::mem::zeroed() };
        info.cmd = ETHTOOL_GSSET_INFO;
        info.sset_mask = 1 << ETH_SS_FEATURES;
        self.ioctl(iface, (&raw mut info).cast())?;

        if info.sset_mask == 0 {
            // string set not supported by this driver
            return Ok(0);
        }
        if info.data > MAX_FEATURES {
            bail!("implausible feature count {} for {iface}", info.data);
        }
        Ok(info.data)
    }

    fn feature_names(&self, iface: &str, count: u32) -> Result<Vec<String>> {
        let mut buf = vec![0u8; GSTRINGS_HEADER_LEN + count as usize * ETH_GSTRING_LEN];
        put_u32(&mut buf, 0, ETHTOOL_GSTRINGS);
        put_u32(&mut buf, 4, ETH_SS_FEATURES as u32);
        put_u32(&mut buf, 8, count);
        self.ioctl(iface, buf.as_mut_ptr().cast())?;

        let returned = get_u32(&buf, 8).min(count);
        Ok(parse_gstrings(&buf, returned as usize))
    }

    fn feature_bits(&self, iface: &str, count: u32) -> Result<Vec<u32>> {
        let blocks = count.div_ceil(32) as usize;
        let mut buf = vec![0u8; GFEATURES_HEADER_LEN + blocks * GFEATURES_BLOCK_LEN];
        put_u32(&mut buf, 0, ETHTOOL_GFEATURES);
        put_u32(&mut buf, 4, blocks as u32);
        self.ioctl(iface, buf.as_mut_ptr().cast())?;

        let returned = (get_u32(&buf, 4) as usize).min(blocks);
        let mut active = Vec::with_capacity(returned);
        for block in 0..returned {
            // block layout: available, requested, active, never_changed
            let offset = GFEATURES_HEADER_LEN + block * GFEATURES_BLOCK_LEN + 8;
            active.push(get_u32(&buf, offset));
        }
        Ok(active)
    }
}

/// feature flags via the global handle, empty on any failure
pub fn feature_flags(iface: &str) -> HashMap<String, bool> {
    query(iface, "features", |h| h.features(iface))
}

/// ring parameters via the global handle, empty on any failure
pub fn ring_params(iface: &str) -> HashMap<String, u32> {
    query(iface, "ring parameters", |h| h.ring_params(iface))
}

/// channel counts via the global handle, empty on any failure
pub fn channel_counts(iface: &str) -> HashMap<String, u32> {
    query(iface, "channels", |h| h.channels(iface))
}

fn query<T>(
    iface: &str,
    what: &str,
    op: impl FnOnce(&EthtoolHandle) -> Result<HashMap<String, T>>,
) -> HashMap<String, T> {
    let Some(handle) = EthtoolHandle::global() else {
        return HashMap::new();
    };
    match op(handle) {
        Ok(map) => map,
        Err(err) => {
            debug!("{what} unavailable for {iface}: {err:#}");
            HashMap::new()
        }
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

/// decode NUL-padded 32-byte string blocks following the gstrings header
fn parse_gstrings(buf: &[u8], count: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(count);
    for i in 0..count {
        let start = GSTRINGS_HEADER_LEN + i * ETH_GSTRING_LEN;
        let block = &buf[start..start + ETH_GSTRING_LEN];
        let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
        names.push(String::from_utf8_lossy(&block[..end]).trim().to_string());
    }
    names
}

/// pair feature names with their bits from the active bitmap words
fn features_to_map(names: &[String], active_words: &[u32]) -> HashMap<String, bool> {
    let mut map = HashMap::new();
    for (i, name) in names.iter().enumerate() {
        if name.is_empty() {
            continue;
        }
        let enabled = active_words
            .get(i / 32)
            .map(|word| word >> (i % 32) & 1 == 1)
            .unwrap_or(false);
        map.insert(name.clone(), enabled);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gstrings_buf(names: &[&str]) -> Vec<u8> {
        let mut buf = vec![0u8; GSTRINGS_HEADER_LEN + names.len() * ETH_GSTRING_LEN];
        for (i, name) in names.iter().enumerate() {
            let start = GSTRINGS_HEADER_LEN + i * ETH_GSTRING_LEN;
            buf[start..start + name.len()].copy_from_slice(name.as_bytes());
        }
        buf
    }

    #[test]
    fn test_parse_gstrings() {
        let buf = gstrings_buf(&["rx-checksum", "tx-checksum-ipv4", ""]);
        let names = parse_gstrings(&buf, 3);
        assert_eq!(names, vec!["rx-checksum", "tx-checksum-ipv4", ""]);
    }

    #[test]
    fn test_features_to_map_bit_positions() {
        let names: Vec<String> = (0..34).map(|i| format!("feature-{i}")).collect();
        // bit 0 and bit 33 set
        let words = vec![0x1, 0x2];

        let map = features_to_map(&names, &words);
        assert_eq!(map["feature-0"], true);
        assert_eq!(map["feature-1"], false);
        assert_eq!(map["feature-33"], true);
        assert_eq!(map.len(), 34);
    }

    #[test]
    fn test_features_to_map_skips_empty_names() {
        let names = vec!["rx-checksum".to_string(), String::new()];
        let map = features_to_map(&names, &[0x3]);
        assert_eq!(map.len(), 1);
        assert_eq!(map["rx-checksum"], true);
    }

    #[test]
    fn test_missing_interface_downgrades_to_empty() {
        assert!(feature_flags("definitely-not-an-iface0").is_empty());
        assert!(ring_params("definitely-not-an-iface0").is_empty());
        assert!(channel_counts("definitely-not-an-iface0").is_empty());
    }
}
