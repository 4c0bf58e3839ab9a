/*!
 * Unified Backend
 * Single-hierarchy groups: one Crane_Task_<id> directory under the root,
 * device access enforced through the shared BPF filter
 */

use crate::cgroup::bpf::{BpfDeviceKey, BpfDeviceMeta, BpfRegistry};
use crate::cgroup::types::{
    cpu_quota, CgroupInterface, CgroupVersion, DeviceAccess, CPU_PERIOD_BASE,
};
use crate::core::errors::{CraneError, CraneResult};
use crate::device::DeviceFileMeta;
use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

pub struct CgroupV2 {
    name: String,
    root: PathBuf,
    inode: u64,
    bpf: Option<Arc<BpfRegistry>>,
    bpf_keys: Vec<BpfDeviceKey>,
    bpf_attached: bool,
}

impl CgroupV2 {
    /// Create the group directory (idempotent on presence) and record its
    /// inode, the key the device filter is shared under.
    pub fn create(
        name: String,
        root: PathBuf,
        bpf: Option<Arc<BpfRegistry>>,
    ) -> CraneResult<Self> {
        let dir = root.join(&name);
        fs::create_dir_all(&dir)
            .map_err(|e| CraneError::Cgroup(format!("create {}: {}", dir.display(), e)))?;
        let inode = fs::metadata(&dir)
            .map_err(|e| CraneError::Cgroup(format!("stat {}: {}", dir.display(), e)))?
            .ino();
        Ok(Self {
            name,
            root,
            inode,
            bpf,
            bpf_keys: Vec::new(),
            bpf_attached: false,
        })
    }

    /// Wrap an existing group without mutating limits. The caller
    /// reconstructs the device-filter vector afterwards so teardown can
    /// reverse it.
    pub fn open(
        name: String,
        root: PathBuf,
        bpf: Option<Arc<BpfRegistry>>,
    ) -> CraneResult<Self> {
        let dir = root.join(&name);
        let inode = fs::metadata(&dir)
            .map_err(|e| CraneError::Cgroup(format!("stat {}: {}", dir.display(), e)))?
            .ino();
        Ok(Self {
            name,
            root,
            inode,
            bpf,
            bpf_keys: Vec::new(),
            bpf_attached: false,
        })
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    fn dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    fn write_value(&self, file: &str, value: &str) -> CraneResult<()> {
        let path = self.dir().join(file);
        fs::write(&path, value)
            .map_err(|e| CraneError::Cgroup(format!("write {}: {}", path.display(), e)))
    }

    fn read_pids(&self) -> CraneResult<Vec<i32>> {
        let path = self.dir().join("cgroup.procs");
        let content = fs::read_to_string(&path)
            .map_err(|e| CraneError::Cgroup(format!("read {}: {}", path.display(), e)))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Rebuild device-filter bookkeeping for a recovered group. The rules
    /// and the pinned program link survived the agent restart; only the
    /// in-memory key vector and the registry refcount need restoring.
    pub fn recover_device_filter(&mut self, deny: &[DeviceFileMeta]) -> CraneResult<()> {
        let registry = match &self.bpf {
            Some(r) => Arc::clone(r),
            None => return Ok(()),
        };
        self.bpf_keys = deny
            .iter()
            .map(|meta| BpfDeviceKey {
                cgroup_id: self.inode,
                major: meta.major,
                minor: meta.minor,
            })
            .collect();
        registry.adopt()?;
        self.bpf_attached = true;
        Ok(())
    }

    fn release_bpf(&mut self) {
        if !self.bpf_attached {
            return;
        }
        if let Some(registry) = &self.bpf {
            let keys = std::mem::take(&mut self.bpf_keys);
            registry.release_group(self.inode, &keys);
        }
        self.bpf_attached = false;
    }
}

impl CgroupInterface for CgroupV2 {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> CgroupVersion {
        CgroupVersion::Unified
    }

    fn set_cpu_core_limit(&self, cores: f64) -> CraneResult<()> {
        let value = format!("{} {}", cpu_quota(cores), CPU_PERIOD_BASE);
        self.write_value("cpu.max", &value)
    }

    fn set_memory_limit_bytes(&self, bytes: u64) -> CraneResult<()> {
        self.write_value("memory.max", &bytes.to_string())
    }

    fn set_memory_soft_limit_bytes(&self, bytes: u64) -> CraneResult<()> {
        self.write_value("memory.high", &bytes.to_string())
    }

    fn set_memory_sw_limit_bytes(&self, bytes: u64) -> CraneResult<()> {
        self.write_value("memory.swap.max", &bytes.to_string())
    }

    fn set_device_access(
        &mut self,
        deny: &[DeviceFileMeta],
        access: DeviceAccess,
    ) -> CraneResult<()> {
        let registry = match &self.bpf {
            Some(r) => Arc::clone(r),
            None => {
                warn!(
                    "Device filtering requested for cgroup {} but no BPF object is configured",
                    self.name
                );
                return Err(CraneError::Cgroup(
                    "BPF device filtering is not available".to_string(),
                ));
            }
        };

        let rules: Vec<BpfDeviceMeta> = deny
            .iter()
            .map(|meta| BpfDeviceMeta::deny(meta, access))
            .collect();
        let keys: Vec<BpfDeviceKey> = rules
            .iter()
            .map(|rule| BpfDeviceKey {
                cgroup_id: self.inode,
                major: rule.major,
                minor: rule.minor,
            })
            .collect();

        // The program must be attached exactly once per group.
        registry.install(&self.dir(), self.inode, &rules, !self.bpf_attached)?;
        self.bpf_keys.extend(keys);
        self.bpf_attached = true;
        Ok(())
    }

    fn attach(&self, pid: u32) -> CraneResult<()> {
        self.write_value("cgroup.procs", &pid.to_string())?;
        debug!("Attached pid {} to cgroup {}", pid, self.name);
        Ok(())
    }

    fn empty(&self) -> CraneResult<bool> {
        Ok(self.read_pids()?.is_empty())
    }

    fn kill_all(&self) -> CraneResult<()> {
        for pid in self.read_pids()? {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("Failed to kill pid {} in cgroup {}: {}", pid, self.name, e);
            }
        }
        Ok(())
    }

    fn remove(&self) -> CraneResult<()> {
        let dir = self.dir();
        if let Err(e) = fs::remove_dir(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(CraneError::Cgroup(format!(
                    "remove {}: {}",
                    dir.display(),
                    e
                )));
            }
        }
        Ok(())
    }
}

impl Drop for CgroupV2 {
    fn drop(&mut self) {
        // Group directory goes before the map entries so no window exists
        // where the group runs unfiltered.
        match self.empty() {
            Ok(true) => {
                if let Err(e) = self.remove() {
                    error!("Failed to remove cgroup {} on drop: {}", self.name, e);
                }
            }
            Ok(false) => debug!("Cgroup {} still populated, deferring removal", self.name),
            Err(_) => {}
        }
        self.release_bpf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let cg = CgroupV2::create("Crane_Task_9".into(), root.clone(), None).unwrap();

        cg.set_cpu_core_limit(2.0).unwrap();
        cg.set_memory_limit_bytes(64 << 20).unwrap();

        let cpu_max = fs::read_to_string(root.join("Crane_Task_9/cpu.max")).unwrap();
        assert_eq!(cpu_max, "131072 65536");
        assert!(cg.inode() > 0);
    }

    #[test]
    fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let first = CgroupV2::create("Crane_Task_9".into(), root.clone(), None).unwrap();
        let second = CgroupV2::create("Crane_Task_9".into(), root, None).unwrap();
        assert_eq!(first.inode(), second.inode());
    }

    #[test]
    fn test_device_access_without_bpf_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cg =
            CgroupV2::create("Crane_Task_9".into(), dir.path().to_path_buf(), None).unwrap();
        let result = cg.set_device_access(&[], DeviceAccess::ALL);
        assert!(matches!(result, Err(CraneError::Cgroup(_))));
    }
}
