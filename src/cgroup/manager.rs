/*!
 * Cgroup Manager
 * Version discovery, group allocation and teardown, the startup recovery
 * scan and resource-derived environment
 */

use crate::cgroup::bpf::BpfRegistry;
use crate::cgroup::types::{
    CgroupInterface, CgroupSpec, CgroupVersion, Controller, ControllerSet, DeviceAccess,
    ResourceEnvelope,
};
use crate::cgroup::v1::CgroupV1;
use crate::cgroup::v2::CgroupV2;
use crate::core::errors::{CraneError, CraneResult};
use crate::core::types::JobId;
use crate::device::DeviceRegistry;
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const PROC_CGROUPS: &str = "/proc/cgroups";

const CGROUP_NAME_PREFIX: &str = "Crane_Task_";

pub struct CgroupManager {
    version: CgroupVersion,
    mounted: ControllerSet,
    root: PathBuf,
    devices: Arc<DeviceRegistry>,
    bpf: Option<Arc<BpfRegistry>>,
}

impl CgroupManager {
    /// Probe the kernel and fail if the active variant is unusable.
    pub fn init(
        devices: Arc<DeviceRegistry>,
        bpf: Option<Arc<BpfRegistry>>,
    ) -> CraneResult<Self> {
        Self::init_at(Path::new(CGROUP_ROOT), Path::new(PROC_CGROUPS), devices, bpf)
    }

    /// Probe against explicit roots. Tests use this with scratch trees.
    pub fn init_at(
        root: &Path,
        proc_cgroups: &Path,
        devices: Arc<DeviceRegistry>,
        bpf: Option<Arc<BpfRegistry>>,
    ) -> CraneResult<Self> {
        let unified_controllers = fs::read_to_string(root.join("cgroup.controllers")).ok();
        let proc_cgroups = fs::read_to_string(proc_cgroups).ok();

        let (version, mounted) =
            resolve_version(unified_controllers.as_deref(), proc_cgroups.as_deref())?;

        let manager = Self {
            version,
            mounted,
            root: root.to_path_buf(),
            devices,
            bpf,
        };
        manager.check_controllers()?;

        if version == CgroupVersion::Unified {
            manager.enable_subtree_control();
        }

        info!("Cgroup manager initialized, variant: {:?}", version);
        Ok(manager)
    }

    pub fn version(&self) -> CgroupVersion {
        self.version
    }

    pub fn mounted(&self, controller: Controller) -> bool {
        self.mounted.contains(controller)
    }

    /// Warn about missing optional controllers; fail on required ones.
    fn check_controllers(&self) -> CraneResult<()> {
        let (all, required): (&[Controller], &[Controller]) = match self.version {
            CgroupVersion::Legacy => (
                &Controller::LEGACY,
                &[Controller::Cpu, Controller::Memory, Controller::Devices],
            ),
            CgroupVersion::Unified => (
                &Controller::UNIFIED,
                &[Controller::CpuV2, Controller::MemoryV2, Controller::IoV2],
            ),
        };

        for controller in all {
            if !self.mounted.contains(*controller) {
                warn!(
                    "Cgroup controller {} is not available",
                    controller.as_str()
                );
            }
        }
        for controller in required {
            if !self.mounted.contains(*controller) {
                error!(
                    "Required cgroup controller {} is not available",
                    controller.as_str()
                );
                return Err(CraneError::Cgroup(format!(
                    "required controller {} missing",
                    controller.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Delegate controllers to children of the root the manager owns.
    /// Often pre-configured by the init system; failure is not fatal.
    fn enable_subtree_control(&self) {
        let path = self.root.join("cgroup.subtree_control");
        if let Err(e) = fs::write(&path, "+cpu +memory +io +pids") {
            warn!("Failed to enable subtree control: {}", e);
        }
    }

    pub fn cgroup_name(job_id: JobId) -> String {
        format!("{}{}", CGROUP_NAME_PREFIX, job_id)
    }

    /// Inverse of `cgroup_name`; full-string match only.
    pub fn parse_job_id(name: &str) -> Option<JobId> {
        let digits = name.strip_prefix(CGROUP_NAME_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    pub fn exists(&self, job_id: JobId) -> bool {
        let name = Self::cgroup_name(job_id);
        match self.version {
            CgroupVersion::Legacy => self
                .root
                .join(Controller::Cpu.as_str())
                .join(&name)
                .is_dir(),
            CgroupVersion::Unified => self.root.join(&name).is_dir(),
        }
    }

    /// Create (or re-open with `recovered`) one job's group and apply its
    /// resource envelope.
    pub fn allocate(&self, spec: &CgroupSpec) -> CraneResult<Box<dyn CgroupInterface>> {
        let name = Self::cgroup_name(spec.job_id);
        let allocated: HashSet<String> = spec.resource.dedicated_slots.iter().cloned().collect();
        let deny = self.devices.deny_metas_for(&allocated);

        match self.version {
            CgroupVersion::Legacy => {
                let mut cg = if spec.recovered {
                    CgroupV1::open(name, self.root.clone(), self.mounted)
                } else {
                    CgroupV1::create(name, self.root.clone(), self.mounted)?
                };
                if !spec.recovered {
                    self.apply_limits(&cg, spec)?;
                    if !allocated.is_empty() && !deny.is_empty() {
                        cg.set_device_access(&deny, DeviceAccess::ALL)?;
                    }
                }
                Ok(Box::new(cg))
            }
            CgroupVersion::Unified => {
                let mut cg = if spec.recovered {
                    CgroupV2::open(name, self.root.clone(), self.bpf.clone())?
                } else {
                    CgroupV2::create(name, self.root.clone(), self.bpf.clone())?
                };
                if spec.recovered {
                    if !allocated.is_empty() {
                        cg.recover_device_filter(&deny)?;
                    }
                } else {
                    self.apply_limits(&cg, spec)?;
                    if !allocated.is_empty() && !deny.is_empty() {
                        cg.set_device_access(&deny, DeviceAccess::ALL)?;
                    }
                }
                Ok(Box::new(cg))
            }
        }
    }

    fn apply_limits(&self, cg: &dyn CgroupInterface, spec: &CgroupSpec) -> CraneResult<()> {
        let res = &spec.resource.allocatable;
        trace!(
            "Setting cgroup limit of job #{}. CPU: {:.2}, Mem: {:.2} MB",
            spec.job_id,
            res.cpu_cores,
            res.memory_bytes as f64 / (1024.0 * 1024.0)
        );

        cg.set_cpu_core_limit(res.cpu_cores)?;
        cg.set_memory_limit_bytes(res.memory_bytes)?;

        // Swap and soft limits depend on system configuration; ignore
        // their result.
        if let Some(sw) = res.memory_swap_bytes {
            let _ = cg.set_memory_soft_limit_bytes(sw);
            let _ = cg.set_memory_sw_limit_bytes(sw);
        }
        Ok(())
    }

    /// Remove one job's group. If still populated the error is reported
    /// and the directory left for a later scan.
    pub fn release(&self, job_id: JobId) -> CraneResult<()> {
        let name = Self::cgroup_name(job_id);
        match self.version {
            CgroupVersion::Legacy => {
                for controller in [Controller::Cpu, Controller::Memory, Controller::Devices, Controller::BlockIo] {
                    if !self.mounted.contains(controller) {
                        continue;
                    }
                    let dir = self.root.join(controller.as_str()).join(&name);
                    remove_cgroup_dir(&dir)?;
                }
            }
            CgroupVersion::Unified => {
                let dir = self.root.join(&name);
                if let (Some(bpf), Ok(meta)) = (&self.bpf, fs::metadata(&dir)) {
                    let inode = meta.ino();
                    let mut inodes = HashSet::new();
                    inodes.insert(inode);
                    if let Err(e) = bpf.evict_inodes(&inodes) {
                        warn!("Failed to evict BPF entries for job #{}: {}", job_id, e);
                    }
                }
                remove_cgroup_dir(&dir)?;
            }
        }
        debug!("Released cgroup for job #{}", job_id);
        Ok(())
    }

    /// Place a pid into a job's group. Called between fork and exec.
    pub fn attach(&self, job_id: JobId, pid: u32) -> CraneResult<()> {
        if !self.exists(job_id) {
            return Err(CraneError::Cgroup(format!(
                "no cgroup for job #{}",
                job_id
            )));
        }
        let name = Self::cgroup_name(job_id);
        match self.version {
            CgroupVersion::Legacy => {
                for controller in [
                    Controller::Cpu,
                    Controller::Memory,
                    Controller::Devices,
                    Controller::BlockIo,
                ] {
                    if !self.mounted.contains(controller) {
                        continue;
                    }
                    let path = self
                        .root
                        .join(controller.as_str())
                        .join(&name)
                        .join("tasks");
                    fs::write(&path, pid.to_string()).map_err(|e| {
                        CraneError::Cgroup(format!("write {}: {}", path.display(), e))
                    })?;
                }
            }
            CgroupVersion::Unified => {
                let path = self.root.join(&name).join("cgroup.procs");
                fs::write(&path, pid.to_string()).map_err(|e| {
                    CraneError::Cgroup(format!("write {}: {}", path.display(), e))
                })?;
            }
        }
        debug!("Attached pid {} to cgroup of job #{}", pid, job_id);
        Ok(())
    }

    /// The procs file(s) a child pid must be written to so it lands in a
    /// job's group. Handed to the Supervisor, which performs the write
    /// between fork and exec.
    pub fn procs_paths(&self, job_id: JobId) -> Vec<PathBuf> {
        let name = Self::cgroup_name(job_id);
        match self.version {
            CgroupVersion::Legacy => [
                Controller::Cpu,
                Controller::Memory,
                Controller::Devices,
                Controller::BlockIo,
            ]
            .into_iter()
            .filter(|c| self.mounted.contains(*c))
            .map(|c| self.root.join(c.as_str()).join(&name).join("tasks"))
            .collect(),
            CgroupVersion::Unified => {
                vec![self.root.join(&name).join("cgroup.procs")]
            }
        }
    }

    /// Resource-derived environment for a job: device visibility plus
    /// CRANE_MEM_PER_NODE in MiB.
    pub fn env_for(&self, envelope: &ResourceEnvelope) -> HashMap<String, String> {
        let allocated: HashSet<String> = envelope.dedicated_slots.iter().cloned().collect();
        let mut env = self.devices.env_map_for(&allocated);
        env.insert(
            "CRANE_MEM_PER_NODE".to_string(),
            (envelope.allocatable.memory_bytes / (1024 * 1024)).to_string(),
        );
        env
    }

    /// Startup scan: remove every surviving Crane_Task_<id> directory whose
    /// id is not in `surviving`, and evict matching device-filter entries.
    pub fn recover_scan(&self, surviving: &HashSet<JobId>) {
        match self.version {
            CgroupVersion::Legacy => {
                for controller in [Controller::Cpu, Controller::Memory, Controller::Devices, Controller::BlockIo] {
                    if !self.mounted.contains(controller) {
                        continue;
                    }
                    let controller_root = self.root.join(controller.as_str());
                    scan_and_remove(&controller_root, surviving, &mut |_| {});
                }
            }
            CgroupVersion::Unified => {
                let mut stale_inodes = HashSet::new();
                scan_and_remove(&self.root, surviving, &mut |dir| {
                    if let Ok(meta) = fs::metadata(dir) {
                        stale_inodes.insert(meta.ino());
                    }
                });
                if let Some(bpf) = &self.bpf {
                    match bpf.evict_inodes(&stale_inodes) {
                        Ok(count) if count > 0 => {
                            debug!("Evicted {} stale BPF map entries", count)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("BPF eviction during recovery failed: {}", e),
                    }
                }
            }
        }
    }
}

fn remove_cgroup_dir(dir: &Path) -> CraneResult<()> {
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CraneError::Cgroup(format!(
            "remove {}: {}",
            dir.display(),
            e
        ))),
    }
}

/// Walk one controller root, removing stale job directories. `on_removed`
/// sees each directory just before removal.
fn scan_and_remove(
    controller_root: &Path,
    surviving: &HashSet<JobId>,
    on_removed: &mut dyn FnMut(&Path),
) {
    let entries = match fs::read_dir(controller_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "Cannot walk cgroup root {}: {}",
                controller_root.display(),
                e
            );
            return;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let Some(job_id) = CgroupManager::parse_job_id(&name) else {
            continue;
        };
        if surviving.contains(&job_id) {
            trace!("Skip removing running job #{} cgroup {}", job_id, name);
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        debug!("Removing remaining job cgroup: {}", path.display());
        on_removed(&path);
        if let Err(e) = fs::remove_dir(&path) {
            error!("Failed to remove cgroup {}: {}", path.display(), e);
        }
    }
}

/// Decide the active variant from the unified `cgroup.controllers` content
/// and `/proc/cgroups`. Hybrid setups (both active) are rejected.
pub fn resolve_version(
    unified_controllers: Option<&str>,
    proc_cgroups: Option<&str>,
) -> CraneResult<(CgroupVersion, ControllerSet)> {
    let legacy_mounted = proc_cgroups.map(parse_proc_cgroups).unwrap_or_default();

    match unified_controllers {
        Some(content) => {
            if !legacy_mounted.is_empty() {
                return Err(CraneError::Cgroup(
                    "hybrid cgroup setup is not supported".to_string(),
                ));
            }
            Ok((CgroupVersion::Unified, parse_controllers_file(content)))
        }
        None if !legacy_mounted.is_empty() => Ok((CgroupVersion::Legacy, legacy_mounted)),
        None => Err(CraneError::Cgroup(
            "no usable cgroup hierarchy found".to_string(),
        )),
    }
}

/// Parse `/proc/cgroups`. A controller is mounted when its hierarchy id is
/// non-zero.
pub fn parse_proc_cgroups(content: &str) -> ControllerSet {
    let mut set = ControllerSet::new();
    for line in content.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(hierarchy)) = (fields.next(), fields.next()) else {
            continue;
        };
        if hierarchy.parse::<u32>().unwrap_or(0) == 0 {
            continue;
        }
        match name {
            "cpu" => set.insert(Controller::Cpu),
            "cpuacct" => set.insert(Controller::CpuAcct),
            "memory" => set.insert(Controller::Memory),
            "devices" => set.insert(Controller::Devices),
            "freezer" => set.insert(Controller::Freezer),
            "blkio" => set.insert(Controller::BlockIo),
            _ => {}
        }
    }
    set
}

/// Parse the root `cgroup.controllers` file of the unified hierarchy.
pub fn parse_controllers_file(content: &str) -> ControllerSet {
    let mut set = ControllerSet::new();
    for name in content.split_whitespace() {
        match name {
            "cpu" => set.insert(Controller::CpuV2),
            "memory" => set.insert(Controller::MemoryV2),
            "io" => set.insert(Controller::IoV2),
            "cpuset" => set.insert(Controller::CpusetV2),
            "pids" => set.insert(Controller::PidsV2),
            _ => {}
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::types::AllocatableResource;

    const PROC_CGROUPS_V1: &str = "\
#subsys_name\thierarchy\tnum_cgroups\tenabled
cpuset\t2\t1\t1
cpu\t3\t10\t1
cpuacct\t3\t10\t1
memory\t4\t50\t1
devices\t5\t50\t1
freezer\t6\t1\t1
blkio\t7\t1\t1
";

    const PROC_CGROUPS_V2: &str = "\
#subsys_name\thierarchy\tnum_cgroups\tenabled
cpu\t0\t1\t1
memory\t0\t1\t1
devices\t0\t1\t1
";

    #[test]
    fn test_parse_proc_cgroups() {
        let set = parse_proc_cgroups(PROC_CGROUPS_V1);
        assert!(set.contains(Controller::Cpu));
        assert!(set.contains(Controller::Memory));
        assert!(set.contains(Controller::Devices));
        assert!(set.contains(Controller::BlockIo));

        // Hierarchy 0 means unified-only; nothing is mounted.
        assert!(parse_proc_cgroups(PROC_CGROUPS_V2).is_empty());
    }

    #[test]
    fn test_resolve_version() {
        let (version, set) =
            resolve_version(Some("cpuset cpu io memory pids"), Some(PROC_CGROUPS_V2))
                .unwrap();
        assert_eq!(version, CgroupVersion::Unified);
        assert!(set.contains(Controller::CpuV2));
        assert!(set.contains(Controller::PidsV2));

        let (version, _) = resolve_version(None, Some(PROC_CGROUPS_V1)).unwrap();
        assert_eq!(version, CgroupVersion::Legacy);

        // Both hierarchies active: hybrid, rejected.
        assert!(resolve_version(Some("cpu memory io"), Some(PROC_CGROUPS_V1)).is_err());
        assert!(resolve_version(None, None).is_err());
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(CgroupManager::parse_job_id("Crane_Task_42"), Some(42));
        assert_eq!(CgroupManager::parse_job_id("Crane_Task_"), None);
        assert_eq!(CgroupManager::parse_job_id("Crane_Task_4x"), None);
        assert_eq!(CgroupManager::parse_job_id("other"), None);
        assert_eq!(CgroupManager::parse_job_id("Crane_Task_42_extra"), None);
    }

    fn unified_manager(dir: &tempfile::TempDir) -> CgroupManager {
        let root = dir.path();
        fs::write(root.join("cgroup.controllers"), "cpu memory io pids").unwrap();
        let proc_cgroups = root.join("proc_cgroups");
        fs::write(&proc_cgroups, PROC_CGROUPS_V2).unwrap();
        CgroupManager::init_at(
            root,
            &proc_cgroups,
            Arc::new(DeviceRegistry::new()),
            None,
        )
        .unwrap()
    }

    fn envelope(cores: f64, memory: u64) -> ResourceEnvelope {
        ResourceEnvelope {
            allocatable: AllocatableResource {
                cpu_cores: cores,
                memory_bytes: memory,
                memory_swap_bytes: None,
            },
            dedicated_slots: vec![],
        }
    }

    #[test]
    fn test_allocate_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = unified_manager(&dir);

        let before: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();

        // Recovered mode: a scratch tree is not a kernel cgroupfs, so
        // controller files would make the directory non-removable.
        fs::create_dir(dir.path().join("Crane_Task_42")).unwrap();
        let spec = CgroupSpec {
            job_id: 42,
            resource: envelope(1.0, 128 << 20),
            recovered: true,
        };
        {
            let _cg = manager.allocate(&spec).unwrap();
            assert!(manager.exists(42));
        }
        manager.release(42).unwrap();
        assert!(!manager.exists(42));

        let after: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn test_recover_scan_removes_stale_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = unified_manager(&dir);

        fs::create_dir(dir.path().join("Crane_Task_7")).unwrap();
        fs::create_dir(dir.path().join("Crane_Task_9")).unwrap();
        fs::create_dir(dir.path().join("unrelated")).unwrap();

        let surviving: HashSet<JobId> = [9].into();
        manager.recover_scan(&surviving);

        assert!(!dir.path().join("Crane_Task_7").exists());
        assert!(dir.path().join("Crane_Task_9").exists());
        assert!(dir.path().join("unrelated").exists());
    }

    #[test]
    fn test_env_for_includes_memory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = unified_manager(&dir);
        let env = manager.env_for(&envelope(1.0, 256 << 20));
        assert_eq!(env.get("CRANE_MEM_PER_NODE").unwrap(), "256");
    }
}
