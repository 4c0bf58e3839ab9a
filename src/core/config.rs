/*!
 * Configuration
 * Agent and Supervisor settings derived from a single base directory
 */

use crate::core::types::{JobId, StepId};
use std::path::PathBuf;

pub const DEFAULT_CRANE_BASE_DIR: &str = "/var/crane";
pub const DEFAULT_CRANED_LISTEN_PORT: u16 = 10010;
pub const DEFAULT_CTLD_PORT: u16 = 10120;
pub const DEFAULT_CFORED_PORT: u16 = 10012;

/// TLS material for the controller channel. Paths only; reading and
/// validation happen in the transport layer.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub domain_suffix: String,
}

/// Agent-wide configuration. The file/CLI parsers that populate this live
/// outside the core; defaults here are enough to run on one node.
#[derive(Debug, Clone)]
pub struct CranedConfig {
    /// Identifier of this agent inside the cluster (its hostname).
    pub craned_id: String,
    pub base_dir: PathBuf,
    pub listen_addr: String,
    pub listen_port: u16,
    pub ctld_addr: String,
    pub ctld_port: u16,
    pub cfored_port: u16,
    pub tls: Option<TlsConfig>,
    /// Path of the Supervisor executable the keeper forks.
    pub supervisor_bin: PathBuf,
    /// Path of the cgroup-device BPF object file, when device filtering
    /// on the unified hierarchy is enabled.
    pub bpf_object_path: Option<PathBuf>,
}

impl Default for CranedConfig {
    fn default() -> Self {
        let base_dir = std::env::var("CRANE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CRANE_BASE_DIR));
        Self {
            craned_id: crate::core::os::hostname(),
            base_dir,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_CRANED_LISTEN_PORT,
            ctld_addr: String::new(),
            ctld_port: DEFAULT_CTLD_PORT,
            cfored_port: DEFAULT_CFORED_PORT,
            tls: None,
            supervisor_bin: PathBuf::from("csupervisor"),
            bpf_object_path: None,
        }
    }
}

impl CranedConfig {
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_ctld_addr(mut self, addr: impl Into<String>) -> Self {
        self.ctld_addr = addr.into();
        self
    }

    /// Directory holding generated batch scripts, files mode 0755.
    pub fn script_dir(&self) -> PathBuf {
        self.base_dir.join("script")
    }

    pub fn script_path(&self, job_id: JobId) -> PathBuf {
        self.script_dir().join(format!("Crane-{}.sh", job_id))
    }

    /// Directory holding per-job Supervisor unix sockets.
    pub fn supervisor_sock_dir(&self) -> PathBuf {
        self.base_dir.join("supervisor")
    }

    pub fn supervisor_sock_path(&self, job_id: JobId) -> PathBuf {
        self.supervisor_sock_dir()
            .join(format!("task_{}.sock", job_id))
    }

    /// Singleton mutex file held with an exclusive advisory lock.
    pub fn mutex_file(&self) -> PathBuf {
        self.base_dir.join("craned.mutex")
    }

    /// The agent's own local socket; Supervisors report status over it.
    pub fn craned_sock_path(&self) -> PathBuf {
        self.base_dir.join("craned.sock")
    }
}

/// Per-job Supervisor configuration, passed down from the keeper through
/// the child environment plus the job id on the command line.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub job_id: JobId,
    pub step_id: StepId,
    pub craned_id: String,
    pub base_dir: PathBuf,
    pub cfored_port: u16,
}

pub const ENV_SUPERVISOR_CRANED_ID: &str = "CRANE_SUPERVISOR_CRANED_ID";
pub const ENV_SUPERVISOR_BASE_DIR: &str = "CRANE_SUPERVISOR_BASE_DIR";
pub const ENV_SUPERVISOR_STEP_ID: &str = "CRANE_SUPERVISOR_STEP_ID";
pub const ENV_SUPERVISOR_CFORED_PORT: &str = "CRANE_SUPERVISOR_CFORED_PORT";

impl SupervisorConfig {
    /// Rebuild the configuration inside the Supervisor process from the
    /// environment the keeper prepared.
    pub fn from_env(job_id: JobId) -> Self {
        let base_dir = std::env::var(ENV_SUPERVISOR_BASE_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CRANE_BASE_DIR));
        let step_id = std::env::var(ENV_SUPERVISOR_STEP_ID)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let cfored_port = std::env::var(ENV_SUPERVISOR_CFORED_PORT)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CFORED_PORT);
        Self {
            job_id,
            step_id,
            craned_id: std::env::var(ENV_SUPERVISOR_CRANED_ID)
                .unwrap_or_else(|_| crate::core::os::hostname()),
            base_dir,
            cfored_port,
        }
    }

    pub fn sock_path(&self) -> PathBuf {
        self.base_dir
            .join("supervisor")
            .join(format!("task_{}.sock", self.job_id))
    }

    pub fn craned_sock_path(&self) -> PathBuf {
        self.base_dir.join("craned.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let config = CranedConfig::default().with_base_dir("/tmp/crane-test");
        assert_eq!(
            config.script_path(42),
            PathBuf::from("/tmp/crane-test/script/Crane-42.sh")
        );
        assert_eq!(
            config.supervisor_sock_path(42),
            PathBuf::from("/tmp/crane-test/supervisor/task_42.sock")
        );
        assert_eq!(
            config.mutex_file(),
            PathBuf::from("/tmp/crane-test/craned.mutex")
        );
    }
}
