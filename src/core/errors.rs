/*!
 * Error Types
 * Crate-wide tagged error kinds mirroring the agent's failure taxonomy
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across all agent components.
pub type CraneResult<T> = Result<T, CraneError>;

/// The agent's error taxonomy. Errors are values passed over queues and
/// reply ports; they never cross a thread boundary as a panic.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum CraneError {
    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("System error: {0}")]
    System(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Failed to spawn process: {0}")]
    SpawnProcessFail(String),

    #[error("Job {0} exceeded its time limit")]
    ExceedTimeLimit(u32),

    #[error("Addressed entity does not exist: {0}")]
    NonExistent(String),

    #[error("Generic failure: {0}")]
    Generic(String),
}

impl CraneError {
    /// Exit code reported to the controller for a synthetic (pre-exec)
    /// failure of this kind.
    pub fn exit_code(&self) -> u32 {
        match self {
            CraneError::Cgroup(_) => exit_code::CGROUP_ERROR,
            CraneError::PermissionDenied(_) => exit_code::PERMISSION_DENIED,
            CraneError::FileNotFound(_) => exit_code::FILE_NOT_FOUND,
            CraneError::SpawnProcessFail(_) => exit_code::SPAWN_PROCESS_FAIL,
            CraneError::ExceedTimeLimit(_) => exit_code::EXCEED_TIME_LIMIT,
            _ => exit_code::GENERIC_FAILURE,
        }
    }
}

impl From<std::io::Error> for CraneError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            CraneError::FileNotFound(err.to_string())
        } else {
            CraneError::System(err.to_string())
        }
    }
}

impl From<nix::errno::Errno> for CraneError {
    fn from(err: nix::errno::Errno) -> Self {
        CraneError::System(err.desc().to_string())
    }
}

/// Exit codes reported in terminal status changes.
pub mod exit_code {
    /// Children terminated by a signal report base + signal number.
    pub const TERMINATION_SIGNAL_BASE: u32 = 256;

    pub const EXCEED_TIME_LIMIT: u32 = 320;
    pub const CGROUP_ERROR: u32 = 321;
    pub const PERMISSION_DENIED: u32 = 322;
    pub const FILE_NOT_FOUND: u32 = 323;
    pub const SPAWN_PROCESS_FAIL: u32 = 324;
    pub const GENERIC_FAILURE: u32 = 325;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            CraneError::Cgroup("x".into()).exit_code(),
            exit_code::CGROUP_ERROR
        );
        assert_eq!(
            CraneError::ExceedTimeLimit(7).exit_code(),
            exit_code::EXCEED_TIME_LIMIT
        );
        assert_eq!(
            CraneError::Generic("x".into()).exit_code(),
            exit_code::GENERIC_FAILURE
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let not_found = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            CraneError::from(not_found),
            CraneError::FileNotFound(_)
        ));

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(matches!(CraneError::from(refused), CraneError::System(_)));
    }
}
