/*!
 * Legacy Backend
 * Per-controller hierarchies: one Crane_Task_<id> directory under each
 * mounted controller root
 */

use crate::cgroup::types::{
    cpu_quota, CgroupInterface, CgroupVersion, Controller, ControllerSet, DeviceAccess,
    CPU_PERIOD_BASE,
};
use crate::core::errors::{CraneError, CraneResult};
use crate::device::DeviceFileMeta;
use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::PathBuf;

/// Controllers a job group is created under when mounted.
const JOB_CONTROLLERS: [Controller; 4] = [
    Controller::Cpu,
    Controller::Memory,
    Controller::Devices,
    Controller::BlockIo,
];

pub struct CgroupV1 {
    name: String,
    root: PathBuf,
    mounted: ControllerSet,
}

impl CgroupV1 {
    /// Create (or re-open, idempotently) the per-controller directories.
    pub fn create(
        name: String,
        root: PathBuf,
        mounted: ControllerSet,
    ) -> CraneResult<Self> {
        let cg = Self {
            name,
            root,
            mounted,
        };
        for controller in JOB_CONTROLLERS {
            if !cg.mounted.contains(controller) {
                continue;
            }
            let dir = cg.controller_dir(controller);
            fs::create_dir_all(&dir).map_err(|e| {
                CraneError::Cgroup(format!("create {}: {}", dir.display(), e))
            })?;
        }
        Ok(cg)
    }

    /// Wrap an existing group without touching it.
    pub fn open(name: String, root: PathBuf, mounted: ControllerSet) -> Self {
        Self {
            name,
            root,
            mounted,
        }
    }

    fn controller_dir(&self, controller: Controller) -> PathBuf {
        self.root.join(controller.as_str()).join(&self.name)
    }

    fn write_value(
        &self,
        controller: Controller,
        file: &str,
        value: &str,
    ) -> CraneResult<()> {
        if !self.mounted.contains(controller) {
            return Err(CraneError::Cgroup(format!(
                "controller {} not mounted, cannot set {}",
                controller.as_str(),
                file
            )));
        }
        let path = self.controller_dir(controller).join(file);
        fs::write(&path, value)
            .map_err(|e| CraneError::Cgroup(format!("write {}: {}", path.display(), e)))
    }

    fn read_pids(&self) -> CraneResult<Vec<i32>> {
        let path = self.controller_dir(Controller::Cpu).join("cgroup.procs");
        let content = fs::read_to_string(&path)
            .map_err(|e| CraneError::Cgroup(format!("read {}: {}", path.display(), e)))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }
}

impl CgroupInterface for CgroupV1 {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> CgroupVersion {
        CgroupVersion::Legacy
    }

    fn set_cpu_core_limit(&self, cores: f64) -> CraneResult<()> {
        self.write_value(
            Controller::Cpu,
            "cpu.cfs_quota_us",
            &cpu_quota(cores).to_string(),
        )?;
        self.write_value(
            Controller::Cpu,
            "cpu.cfs_period_us",
            &CPU_PERIOD_BASE.to_string(),
        )
    }

    fn set_memory_limit_bytes(&self, bytes: u64) -> CraneResult<()> {
        self.write_value(Controller::Memory, "memory.limit_in_bytes", &bytes.to_string())
    }

    fn set_memory_soft_limit_bytes(&self, bytes: u64) -> CraneResult<()> {
        self.write_value(
            Controller::Memory,
            "memory.soft_limit_in_bytes",
            &bytes.to_string(),
        )
    }

    fn set_memory_sw_limit_bytes(&self, bytes: u64) -> CraneResult<()> {
        self.write_value(
            Controller::Memory,
            "memory.memsw.limit_in_bytes",
            &bytes.to_string(),
        )
    }

    fn set_device_access(
        &mut self,
        deny: &[DeviceFileMeta],
        access: DeviceAccess,
    ) -> CraneResult<()> {
        let op = access.as_str();
        for meta in deny {
            let line = format!(
                "{} {}:{} {}",
                meta.device_type.as_char(),
                meta.major,
                meta.minor,
                op
            );
            self.write_value(Controller::Devices, "devices.deny", &line)?;
        }
        Ok(())
    }

    fn attach(&self, pid: u32) -> CraneResult<()> {
        for controller in JOB_CONTROLLERS {
            if !self.mounted.contains(controller) {
                continue;
            }
            self.write_value(controller, "tasks", &pid.to_string())?;
        }
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
        for controller in JOB_CONTROLLERS {
            if !self.mounted.contains(controller) {
                continue;
            }
            let dir = self.controller_dir(controller);
            if let Err(e) = fs::remove_dir(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(CraneError::Cgroup(format!(
                        "remove {}: {}",
                        dir.display(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Drop for CgroupV1 {
    fn drop(&mut self) {
        // Deletion of a populated group is deferred to the recovery scan.
        match self.empty() {
            Ok(true) => {
                if let Err(e) = self.remove() {
                    error!("Failed to remove cgroup {} on drop: {}", self.name, e);
                }
            }
            Ok(false) => debug!("Cgroup {} still populated, deferring removal", self.name),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceType;

    fn mounted_all() -> ControllerSet {
        Controller::LEGACY.into_iter().collect()
    }

    fn fake_root(dir: &tempfile::TempDir) -> PathBuf {
        let root = dir.path().to_path_buf();
        for c in Controller::LEGACY {
            fs::create_dir_all(root.join(c.as_str())).unwrap();
        }
        root
    }

    #[test]
    fn test_create_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(&dir);
        let cg =
            CgroupV1::create("Crane_Task_1".into(), root.clone(), mounted_all()).unwrap();

        cg.set_cpu_core_limit(1.5).unwrap();
        cg.set_memory_limit_bytes(128 << 20).unwrap();

        let quota =
            fs::read_to_string(root.join("cpu/Crane_Task_1/cpu.cfs_quota_us")).unwrap();
        assert_eq!(quota, "98304");
        let mem =
            fs::read_to_string(root.join("memory/Crane_Task_1/memory.limit_in_bytes"))
                .unwrap();
        assert_eq!(mem, (128u64 << 20).to_string());
    }

    #[test]
    fn test_device_deny_lines() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(&dir);
        let mut cg =
            CgroupV1::create("Crane_Task_2".into(), root.clone(), mounted_all()).unwrap();

        let deny = vec![DeviceFileMeta {
            path: "/dev/nvidia0".into(),
            major: 195,
            minor: 0,
            device_type: DeviceType::Char,
        }];
        cg.set_device_access(&deny, DeviceAccess::ALL).unwrap();

        let line =
            fs::read_to_string(root.join("devices/Crane_Task_2/devices.deny")).unwrap();
        assert_eq!(line, "c 195:0 rwm");
    }

    #[test]
    fn test_unmounted_controller_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = fake_root(&dir);
        let mut mounted = ControllerSet::new();
        mounted.insert(Controller::Cpu);
        let cg = CgroupV1::create("Crane_Task_3".into(), root, mounted).unwrap();

        assert!(matches!(
            cg.set_memory_limit_bytes(1),
            Err(CraneError::Cgroup(_))
        ));
    }
}
