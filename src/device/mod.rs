/*!
 * Device Registry
 * Node-local dedicated devices: slot identifiers, device-file metadata and
 * the environment variables injected for allocations
 */

use crate::core::errors::{CraneError, CraneResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Opaque name of one dedicated device instance. By convention the path of
/// its first device file, e.g. `/dev/nvidia0`.
pub type SlotId = String;

/// Kind of a device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Char,
    Block,
    Any,
}

impl DeviceType {
    /// Single-letter form used in cgroup v1 `devices.deny` lines.
    pub fn as_char(&self) -> char {
        match self {
            DeviceType::Char => 'c',
            DeviceType::Block => 'b',
            DeviceType::Any => 'a',
        }
    }
}

/// One device file belonging to a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceFileMeta {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    pub device_type: DeviceType,
}

/// Which environment variable a device family expects its visible-device
/// list in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvInjector {
    None,
    Nvidia,
    Hip,
    Ascend,
}

impl EnvInjector {
    pub fn from_str_opt(s: Option<&str>) -> Option<Self> {
        match s {
            None | Some("") | Some("none") => Some(EnvInjector::None),
            Some("nvidia") => Some(EnvInjector::Nvidia),
            Some("hip") => Some(EnvInjector::Hip),
            Some("ascend") => Some(EnvInjector::Ascend),
            Some(_) => None,
        }
    }

    fn env_name(&self) -> Option<&'static str> {
        match self {
            EnvInjector::None => None,
            EnvInjector::Nvidia => Some("CUDA_VISIBLE_DEVICES"),
            EnvInjector::Hip => Some("HIP_VISIBLE_DEVICES"),
            EnvInjector::Ascend => Some("ASCEND_RT_VISIBLE_DEVICES"),
        }
    }
}

/// One dedicated device instance on this node.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub type_name: String,
    pub slot_id: SlotId,
    pub file_metas: Vec<DeviceFileMeta>,
    pub env_injector: EnvInjector,
}

impl Device {
    /// Build a device by probing its device files on disk.
    pub fn probe(
        name: impl Into<String>,
        type_name: impl Into<String>,
        paths: &[PathBuf],
        env_injector: EnvInjector,
    ) -> CraneResult<Self> {
        let mut file_metas = Vec::with_capacity(paths.len());
        for path in paths {
            file_metas.push(probe_device_file(path)?);
        }
        let slot_id = file_metas
            .first()
            .map(|m| m.path.to_string_lossy().into_owned())
            .ok_or_else(|| CraneError::Generic(format!("device has no files: {:?}", paths)))?;
        Ok(Self {
            name: name.into(),
            type_name: type_name.into(),
            slot_id,
            file_metas,
            env_injector,
        })
    }

    /// Build a device from already-known metadata. Used by configuration
    /// loaders and tests.
    pub fn with_metas(
        name: impl Into<String>,
        type_name: impl Into<String>,
        file_metas: Vec<DeviceFileMeta>,
        env_injector: EnvInjector,
    ) -> Self {
        let slot_id = file_metas
            .first()
            .map(|m| m.path.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: name.into(),
            type_name: type_name.into(),
            slot_id,
            file_metas,
            env_injector,
        }
    }
}

fn probe_device_file(path: &Path) -> CraneResult<DeviceFileMeta> {
    use nix::sys::stat::{major, minor, stat, SFlag};

    let st = stat(path).map_err(|e| {
        CraneError::FileNotFound(format!("stat {}: {}", path.display(), e))
    })?;
    let fmt = st.st_mode & SFlag::S_IFMT.bits();
    let device_type = if fmt == SFlag::S_IFCHR.bits() {
        DeviceType::Char
    } else if fmt == SFlag::S_IFBLK.bits() {
        DeviceType::Block
    } else {
        return Err(CraneError::Generic(format!(
            "{} is not a device file",
            path.display()
        )));
    };
    Ok(DeviceFileMeta {
        path: path.to_path_buf(),
        major: major(st.st_rdev) as u32,
        minor: minor(st.st_rdev) as u32,
        device_type,
    })
}

/// All dedicated devices discovered on this node, keyed by slot id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<SlotId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: Device) {
        debug!(
            "Registered device slot {} with {} file(s)",
            device.slot_id,
            device.file_metas.len()
        );
        self.devices.insert(device.slot_id.clone(), device);
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn slot_ids(&self) -> impl Iterator<Item = &SlotId> {
        self.devices.keys()
    }

    /// Device files of every slot NOT in the allocation. These are the
    /// files a job's resource group denies access to.
    pub fn deny_metas_for(&self, allocated: &HashSet<SlotId>) -> Vec<DeviceFileMeta> {
        self.devices
            .values()
            .filter(|d| !allocated.contains(&d.slot_id))
            .flat_map(|d| d.file_metas.iter().cloned())
            .collect()
    }

    /// Environment variables for an allocation, e.g.
    /// `CUDA_VISIBLE_DEVICES=0,1` for two allocated nvidia slots.
    pub fn env_map_for(&self, allocated: &HashSet<SlotId>) -> HashMap<String, String> {
        let mut by_injector: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();

        for device in self.devices.values() {
            if !allocated.contains(&device.slot_id) {
                continue;
            }
            if let Some(env_name) = device.env_injector.env_name() {
                by_injector
                    .entry(env_name)
                    .or_default()
                    .push(device_index(&device.slot_id));
            }
        }

        by_injector
            .into_iter()
            .map(|(name, indexes)| (name.to_string(), indexes.join(",")))
            .collect()
    }
}

/// Visible-device index for a slot: the trailing decimal of its device
/// file name (`/dev/nvidia1` -> "1"), or the whole slot id if there is
/// none.
fn device_index(slot_id: &str) -> String {
    let digits: String = slot_id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.is_empty() {
        slot_id.to_string()
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nvidia_slot(idx: u32) -> Device {
        Device::with_metas(
            "gpu",
            "a100",
            vec![DeviceFileMeta {
                path: PathBuf::from(format!("/dev/nvidia{}", idx)),
                major: 195,
                minor: idx,
                device_type: DeviceType::Char,
            }],
            EnvInjector::Nvidia,
        )
    }

    #[test]
    fn test_deny_metas_exclude_allocation() {
        let mut registry = DeviceRegistry::new();
        registry.insert(nvidia_slot(0));
        registry.insert(nvidia_slot(1));

        let allocated: HashSet<SlotId> = ["/dev/nvidia0".to_string()].into();
        let deny = registry.deny_metas_for(&allocated);
        assert_eq!(deny.len(), 1);
        assert_eq!(deny[0].minor, 1);
    }

    #[test]
    fn test_env_map_joins_indexes() {
        let mut registry = DeviceRegistry::new();
        registry.insert(nvidia_slot(0));
        registry.insert(nvidia_slot(1));
        registry.insert(nvidia_slot(2));

        let allocated: HashSet<SlotId> =
            ["/dev/nvidia0".to_string(), "/dev/nvidia2".to_string()].into();
        let env = registry.env_map_for(&allocated);
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").unwrap(), "0,2");
    }

    #[test]
    fn test_env_map_skips_injector_none() {
        let mut registry = DeviceRegistry::new();
        registry.insert(Device::with_metas(
            "nic",
            "mlx5",
            vec![DeviceFileMeta {
                path: PathBuf::from("/dev/infiniband/uverbs0"),
                major: 231,
                minor: 192,
                device_type: DeviceType::Char,
            }],
            EnvInjector::None,
        ));

        let allocated: HashSet<SlotId> = ["/dev/infiniband/uverbs0".to_string()].into();
        assert!(registry.env_map_for(&allocated).is_empty());
    }

    #[test]
    fn test_device_index_fallback() {
        assert_eq!(device_index("/dev/nvidia12"), "12");
        assert_eq!(device_index("/dev/weird"), "/dev/weird");
    }
}
