/*!
 * Device Filter Registry
 * Kernel-verified cgroup-device program shared by all unified-hierarchy
 * job groups, keyed by (cgroup inode, major, minor)
 */

use crate::cgroup::types::DeviceAccess;
use crate::core::errors::{CraneError, CraneResult};
use crate::device::{DeviceFileMeta, DeviceType};
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::links::FdLink;
use aya::programs::{CgroupAttachMode, CgroupDevice};
use aya::{Ebpf, EbpfLoader};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const DEV_MAP_NAME: &str = "crane_dev_map";
pub const DEV_PROG_NAME: &str = "crane_cgroup_device";
pub const DEFAULT_PIN_DIR: &str = "/sys/fs/bpf/crane";

// Access and device-type bits from linux/bpf.h.
pub const BPF_DEVCG_ACC_MKNOD: u16 = 1;
pub const BPF_DEVCG_ACC_READ: u16 = 2;
pub const BPF_DEVCG_ACC_WRITE: u16 = 4;
pub const BPF_DEVCG_DEV_BLOCK: u16 = 1;
pub const BPF_DEVCG_DEV_CHAR: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FilterAction {
    Deny = 0,
    Allow = 1,
}

/// Key into the shared device map.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfDeviceKey {
    pub cgroup_id: u64,
    pub major: u32,
    pub minor: u32,
}

// Plain #[repr(C)] integers; safe to copy through the map fd.
unsafe impl aya::Pod for BpfDeviceKey {}

/// Value stored per key: the rule the program applies.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BpfDeviceMeta {
    pub major: u32,
    pub minor: u32,
    pub action: u32,
    pub access: u16,
    pub device_type: u16,
}

unsafe impl aya::Pod for BpfDeviceMeta {}

impl BpfDeviceMeta {
    /// Denial rule for one excluded device file.
    pub fn deny(meta: &DeviceFileMeta, access: DeviceAccess) -> Self {
        Self {
            major: meta.major,
            minor: meta.minor,
            action: FilterAction::Deny as u32,
            access: access_bits(access),
            device_type: device_type_bits(meta.device_type),
        }
    }
}

pub fn access_bits(access: DeviceAccess) -> u16 {
    let mut bits = 0;
    if access.read {
        bits |= BPF_DEVCG_ACC_READ;
    }
    if access.write {
        bits |= BPF_DEVCG_ACC_WRITE;
    }
    if access.mknod {
        bits |= BPF_DEVCG_ACC_MKNOD;
    }
    bits
}

pub fn device_type_bits(device_type: DeviceType) -> u16 {
    match device_type {
        DeviceType::Char => BPF_DEVCG_DEV_CHAR,
        DeviceType::Block => BPF_DEVCG_DEV_BLOCK,
        DeviceType::Any => 0xffff,
    }
}

struct Inner {
    runtime: Option<Ebpf>,
    attached_groups: usize,
}

/// Owns the shared program and map. Loaded on the first attached group,
/// unloaded (and the pinned map removed) when the count returns to zero.
pub struct BpfRegistry {
    object_path: PathBuf,
    pin_dir: PathBuf,
    enable_logging: bool,
    inner: Mutex<Inner>,
}

impl BpfRegistry {
    pub fn new(object_path: PathBuf, pin_dir: PathBuf, enable_logging: bool) -> Self {
        Self {
            object_path,
            pin_dir,
            enable_logging,
            inner: Mutex::new(Inner {
                runtime: None,
                attached_groups: 0,
            }),
        }
    }

    fn map_pin_path(&self) -> PathBuf {
        self.pin_dir.join(DEV_MAP_NAME)
    }

    fn link_pin_path(&self, cgroup_id: u64) -> PathBuf {
        self.pin_dir.join(format!("link_{}", cgroup_id))
    }

    fn ensure_loaded(&self, inner: &mut Inner) -> CraneResult<()> {
        if inner.runtime.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.pin_dir).map_err(|e| {
            CraneError::Cgroup(format!("create {}: {}", self.pin_dir.display(), e))
        })?;

        let mut ebpf = EbpfLoader::new()
            .map_pin_path(&self.pin_dir)
            .load_file(&self.object_path)
            .map_err(|e| {
                CraneError::Cgroup(format!(
                    "load BPF object {}: {}",
                    self.object_path.display(),
                    e
                ))
            })?;

        let program: &mut CgroupDevice = ebpf
            .program_mut(DEV_PROG_NAME)
            .ok_or_else(|| {
                CraneError::Cgroup(format!("BPF program {} not found", DEV_PROG_NAME))
            })?
            .try_into()
            .map_err(|e| CraneError::Cgroup(format!("BPF program type: {}", e)))?;
        program
            .load()
            .map_err(|e| CraneError::Cgroup(format!("load BPF program: {}", e)))?;

        inner.runtime = Some(ebpf);

        // Sentinel key toggling in-kernel rule logging.
        let sentinel_key = BpfDeviceKey {
            cgroup_id: 0,
            major: 0,
            minor: 0,
        };
        let sentinel_meta = BpfDeviceMeta {
            major: 0,
            minor: 0,
            action: self.enable_logging as u32,
            access: 0,
            device_type: 0,
        };
        Self::with_map(inner, |map| {
            map.insert(sentinel_key, sentinel_meta, 0)
                .map_err(|e| CraneError::Cgroup(format!("set BPF log level: {}", e)))
        })?;

        info!("BPF device filter loaded from {}", self.object_path.display());
        Ok(())
    }

    fn with_map<R>(
        inner: &mut Inner,
        f: impl FnOnce(&mut BpfHashMap<&mut MapData, BpfDeviceKey, BpfDeviceMeta>) -> CraneResult<R>,
    ) -> CraneResult<R> {
        let ebpf = inner
            .runtime
            .as_mut()
            .ok_or_else(|| CraneError::Cgroup("BPF runtime not loaded".to_string()))?;
        let map = ebpf
            .map_mut(DEV_MAP_NAME)
            .ok_or_else(|| CraneError::Cgroup(format!("BPF map {} not found", DEV_MAP_NAME)))?;
        let mut map: BpfHashMap<&mut MapData, BpfDeviceKey, BpfDeviceMeta> =
            BpfHashMap::try_from(map)
                .map_err(|e| CraneError::Cgroup(format!("BPF map type: {}", e)))?;
        f(&mut map)
    }

    /// Install rules for one group and, on its first install, attach the
    /// program to the group directory.
    pub fn install(
        &self,
        cgroup_dir: &Path,
        cgroup_id: u64,
        rules: &[BpfDeviceMeta],
        first_attach: bool,
    ) -> CraneResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;

        Self::with_map(&mut inner, |map| {
            for rule in rules {
                let key = BpfDeviceKey {
                    cgroup_id,
                    major: rule.major,
                    minor: rule.minor,
                };
                map.insert(key, *rule, 0).map_err(|e| {
                    CraneError::Cgroup(format!(
                        "update BPF map {}:{} cgroup {}: {}",
                        rule.major, rule.minor, cgroup_id, e
                    ))
                })?;
            }
            Ok(())
        })?;

        if first_attach {
            let cgroup = File::open(cgroup_dir).map_err(|e| {
                CraneError::Cgroup(format!("open {}: {}", cgroup_dir.display(), e))
            })?;
            let ebpf = inner.runtime.as_mut().unwrap();
            let program: &mut CgroupDevice = ebpf
                .program_mut(DEV_PROG_NAME)
                .ok_or_else(|| {
                    CraneError::Cgroup(format!("BPF program {} not found", DEV_PROG_NAME))
                })?
                .try_into()
                .map_err(|e| CraneError::Cgroup(format!("BPF program type: {}", e)))?;
            let link_id = program
                .attach(&cgroup, CgroupAttachMode::Single)
                .map_err(|e| CraneError::Cgroup(format!("attach BPF program: {}", e)))?;

            // Pin the link so enforcement survives an agent restart.
            let link = program
                .take_link(link_id)
                .map_err(|e| CraneError::Cgroup(format!("take BPF link: {}", e)))?;
            let fd_link: FdLink = link
                .try_into()
                .map_err(|e| CraneError::Cgroup(format!("BPF link fd: {}", e)))?;
            fd_link
                .pin(self.link_pin_path(cgroup_id))
                .map_err(|e| CraneError::Cgroup(format!("pin BPF link: {}", e)))?;

            inner.attached_groups += 1;
            debug!(
                "BPF program attached to cgroup inode {} ({} attached)",
                cgroup_id, inner.attached_groups
            );
        }
        Ok(())
    }

    /// Account for a group recovered from a previous agent life. Its link
    /// is still pinned; only the refcount needs reconstructing.
    pub fn adopt(&self) -> CraneResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;
        inner.attached_groups += 1;
        Ok(())
    }

    /// Tear down one group's rules and link. Idempotent: missing keys and
    /// an already-removed link are tolerated.
    pub fn release_group(&self, cgroup_id: u64, keys: &[BpfDeviceKey]) {
        let mut inner = self.inner.lock();
        if inner.runtime.is_none() {
            return;
        }

        let result = Self::with_map(&mut inner, |map| {
            for key in keys {
                if let Err(e) = map.remove(key) {
                    debug!(
                        "BPF map entry {}:{} cgroup {} already gone: {}",
                        key.major, key.minor, key.cgroup_id, e
                    );
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            error!("Failed to clear BPF map for cgroup {}: {}", cgroup_id, e);
        }

        let link_path = self.link_pin_path(cgroup_id);
        if link_path.exists() {
            if let Err(e) = std::fs::remove_file(&link_path) {
                warn!("Failed to unpin BPF link {}: {}", link_path.display(), e);
            }
        }

        inner.attached_groups = inner.attached_groups.saturating_sub(1);
        if inner.attached_groups == 0 {
            self.unload(&mut inner);
        }
    }

    /// All live keys in the shared map, sentinel excluded.
    pub fn map_keys(&self) -> CraneResult<Vec<BpfDeviceKey>> {
        let mut inner = self.inner.lock();
        self.ensure_loaded(&mut inner)?;
        Self::with_map(&mut inner, |map| {
            let mut keys = Vec::new();
            for key in map.keys() {
                let key =
                    key.map_err(|e| CraneError::Cgroup(format!("iterate BPF map: {}", e)))?;
                if key.cgroup_id != 0 {
                    keys.push(key);
                }
            }
            Ok(keys)
        })
    }

    /// Recovery-scan eviction: drop every entry whose cgroup inode belongs
    /// to a removed group directory.
    pub fn evict_inodes(&self, inodes: &HashSet<u64>) -> CraneResult<usize> {
        if inodes.is_empty() {
            return Ok(0);
        }
        let stale: Vec<BpfDeviceKey> = self
            .map_keys()?
            .into_iter()
            .filter(|k| inodes.contains(&k.cgroup_id))
            .collect();

        let mut inner = self.inner.lock();
        let count = stale.len();
        Self::with_map(&mut inner, |map| {
            for key in &stale {
                if let Err(e) = map.remove(key) {
                    debug!("Stale BPF entry already gone: {}", e);
                }
            }
            Ok(())
        })?;
        for inode in inodes {
            let link_path = self.link_pin_path(*inode);
            if link_path.exists() {
                let _ = std::fs::remove_file(&link_path);
            }
        }
        Ok(count)
    }

    fn unload(&self, inner: &mut Inner) {
        inner.runtime = None;
        let map_path = self.map_pin_path();
        if map_path.exists() {
            if let Err(e) = std::fs::remove_file(&map_path) {
                warn!("Failed to remove pinned BPF map {}: {}", map_path.display(), e);
            }
        }
        info!("BPF device filter unloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_bits() {
        assert_eq!(
            access_bits(DeviceAccess::ALL),
            BPF_DEVCG_ACC_READ | BPF_DEVCG_ACC_WRITE | BPF_DEVCG_ACC_MKNOD
        );
        let none = DeviceAccess {
            read: false,
            write: false,
            mknod: false,
        };
        assert_eq!(access_bits(none), 0);
    }

    #[test]
    fn test_device_type_bits() {
        assert_eq!(device_type_bits(DeviceType::Char), BPF_DEVCG_DEV_CHAR);
        assert_eq!(device_type_bits(DeviceType::Block), BPF_DEVCG_DEV_BLOCK);
        assert_eq!(device_type_bits(DeviceType::Any), 0xffff);
    }

    #[test]
    fn test_deny_rule_packing() {
        let meta = DeviceFileMeta {
            path: "/dev/nvidia0".into(),
            major: 195,
            minor: 0,
            device_type: DeviceType::Char,
        };
        let rule = BpfDeviceMeta::deny(&meta, DeviceAccess::ALL);
        assert_eq!(rule.major, 195);
        assert_eq!(rule.action, FilterAction::Deny as u32);
        assert_eq!(rule.device_type, BPF_DEVCG_DEV_CHAR);
    }
}
