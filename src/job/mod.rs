/*!
 * Job Module
 * Per-node job lifecycle: admission, execution, time limits, termination
 * and terminal status delivery
 */

mod manager;
pub mod types;

pub use manager::JobManager;
pub use types::{
    format_time_limit, parse_file_path_pattern, Execution, JobSpec, JobStatusSpec, StatusChange,
    TaskKind, TaskSpec, TaskStatus, TerminateReason,
};
