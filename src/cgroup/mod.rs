/*!
 * Cgroup Module
 * Hierarchical resource-control groups: legacy and unified backends,
 * kernel-verified device filtering, recovery and teardown
 */

pub mod bpf;
mod manager;
pub mod types;
mod v1;
mod v2;

pub use bpf::{BpfDeviceKey, BpfDeviceMeta, BpfRegistry, FilterAction};
pub use manager::CgroupManager;
pub use types::{
    AllocatableResource, CgroupInterface, CgroupSpec, CgroupVersion, Controller, ControllerSet,
    DeviceAccess, ResourceEnvelope,
};
pub use v1::CgroupV1;
pub use v2::CgroupV2;
