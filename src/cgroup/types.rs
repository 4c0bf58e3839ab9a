/*!
 * Cgroup Types
 * Version tags, controller sets and the resource envelope applied to a
 * job's control group
 */

use crate::core::errors::CraneResult;
use crate::core::types::JobId;
use crate::device::{DeviceFileMeta, SlotId};
use serde::{Deserialize, Serialize};

/// Which kernel cgroup variant is active. Hybrid setups are rejected at
/// manager initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CgroupVersion {
    Legacy,
    Unified,
}

/// Cgroup controllers across both hierarchies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    // Legacy hierarchy
    Cpu,
    CpuAcct,
    Memory,
    Devices,
    Freezer,
    BlockIo,
    // Unified hierarchy
    CpuV2,
    MemoryV2,
    IoV2,
    CpusetV2,
    PidsV2,
}

impl Controller {
    /// Name of the controller as the kernel spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Controller::Cpu | Controller::CpuV2 => "cpu",
            Controller::CpuAcct => "cpuacct",
            Controller::Memory | Controller::MemoryV2 => "memory",
            Controller::Devices => "devices",
            Controller::Freezer => "freezer",
            Controller::BlockIo => "blkio",
            Controller::IoV2 => "io",
            Controller::CpusetV2 => "cpuset",
            Controller::PidsV2 => "pids",
        }
    }

    const fn bit(&self) -> u16 {
        match self {
            Controller::Cpu => 1 << 0,
            Controller::CpuAcct => 1 << 1,
            Controller::Memory => 1 << 2,
            Controller::Devices => 1 << 3,
            Controller::Freezer => 1 << 4,
            Controller::BlockIo => 1 << 5,
            Controller::CpuV2 => 1 << 6,
            Controller::MemoryV2 => 1 << 7,
            Controller::IoV2 => 1 << 8,
            Controller::CpusetV2 => 1 << 9,
            Controller::PidsV2 => 1 << 10,
        }
    }

    pub const LEGACY: [Controller; 6] = [
        Controller::Cpu,
        Controller::CpuAcct,
        Controller::Memory,
        Controller::Devices,
        Controller::Freezer,
        Controller::BlockIo,
    ];

    pub const UNIFIED: [Controller; 5] = [
        Controller::CpuV2,
        Controller::MemoryV2,
        Controller::IoV2,
        Controller::CpusetV2,
        Controller::PidsV2,
    ];
}

/// Small set of mounted controllers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerSet(u16);

impl ControllerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, controller: Controller) {
        self.0 |= controller.bit();
    }

    pub fn contains(&self, controller: Controller) -> bool {
        self.0 & controller.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Controller> for ControllerSet {
    fn from_iter<T: IntoIterator<Item = Controller>>(iter: T) -> Self {
        let mut set = Self::new();
        for c in iter {
            set.insert(c);
        }
        set
    }
}

/// Access kinds a device rule covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAccess {
    pub read: bool,
    pub write: bool,
    pub mknod: bool,
}

impl DeviceAccess {
    /// The default denial scope for unallocated devices.
    pub const ALL: DeviceAccess = DeviceAccess {
        read: true,
        write: true,
        mknod: true,
    };

    /// "rwm"-style string for legacy `devices.deny` lines.
    pub fn as_str(&self) -> String {
        let mut s = String::with_capacity(3);
        if self.read {
            s.push('r');
        }
        if self.write {
            s.push('w');
        }
        if self.mknod {
            s.push('m');
        }
        s
    }
}

/// Allocatable share of one node granted to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatableResource {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub memory_swap_bytes: Option<u64>,
}

/// The full resource envelope: allocatable share plus dedicated device
/// slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub allocatable: AllocatableResource,
    pub dedicated_slots: Vec<SlotId>,
}

/// What the manager needs to create (or re-open) one job's control group.
#[derive(Debug, Clone)]
pub struct CgroupSpec {
    pub job_id: JobId,
    pub resource: ResourceEnvelope,
    /// True when wrapping an RCG that survived an agent restart: limits are
    /// left untouched and the device-filter bookkeeping is reconstructed.
    pub recovered: bool,
}

/// Behavior common to both hierarchy backends. One handle per job.
pub trait CgroupInterface: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> CgroupVersion;

    fn set_cpu_core_limit(&self, cores: f64) -> CraneResult<()>;

    fn set_memory_limit_bytes(&self, bytes: u64) -> CraneResult<()>;

    fn set_memory_soft_limit_bytes(&self, bytes: u64) -> CraneResult<()>;

    fn set_memory_sw_limit_bytes(&self, bytes: u64) -> CraneResult<()>;

    /// Deny the given device files. `deny` lists every device file NOT in
    /// the job's allocation.
    fn set_device_access(
        &mut self,
        deny: &[DeviceFileMeta],
        access: DeviceAccess,
    ) -> CraneResult<()>;

    /// Place a pid into this group. Called exactly once per child between
    /// fork and exec.
    fn attach(&self, pid: u32) -> CraneResult<()>;

    fn empty(&self) -> CraneResult<bool>;

    fn kill_all(&self) -> CraneResult<()>;

    /// Remove the group directory. Fails if still populated.
    fn remove(&self) -> CraneResult<()>;
}

/// CPU share math shared by both backends: quota/period pairs with a
/// 65536-tick period.
pub const CPU_PERIOD_BASE: u64 = 1 << 16;

pub fn cpu_quota(cores: f64) -> u64 {
    (CPU_PERIOD_BASE as f64 * cores).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_set() {
        let mut set = ControllerSet::new();
        assert!(set.is_empty());
        set.insert(Controller::Cpu);
        set.insert(Controller::MemoryV2);
        assert!(set.contains(Controller::Cpu));
        assert!(set.contains(Controller::MemoryV2));
        assert!(!set.contains(Controller::Memory));
    }

    #[test]
    fn test_cpu_quota_rounding() {
        assert_eq!(cpu_quota(1.0), 65536);
        assert_eq!(cpu_quota(0.5), 32768);
        assert_eq!(cpu_quota(2.25), 147456);
    }

    #[test]
    fn test_device_access_string() {
        assert_eq!(DeviceAccess::ALL.as_str(), "rwm");
        let read_only = DeviceAccess {
            read: true,
            write: false,
            mknod: false,
        };
        assert_eq!(read_only.as_str(), "r");
    }
}
