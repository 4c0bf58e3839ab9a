/*!
 * Job Types
 * Job and task specifications, environment construction, output-path
 * pattern parsing and status changes
 */

use crate::cgroup::types::{AllocatableResource, ResourceEnvelope};
use crate::core::errors::CraneError;
use crate::core::passwd::PasswordEntry;
use crate::core::types::JobId;
use crate::rpc::crane as proto;
use std::collections::HashMap;

/// Resource side of one job on this node.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: JobId,
    pub resource: ResourceEnvelope,
    pub uid: u32,
    pub gid: u32,
}

impl From<proto::JobSpec> for JobSpec {
    fn from(spec: proto::JobSpec) -> Self {
        let res = spec.res.unwrap_or_default();
        let allocatable = res.allocatable.unwrap_or_default();
        Self {
            job_id: spec.job_id,
            resource: ResourceEnvelope {
                allocatable: AllocatableResource {
                    cpu_cores: allocatable.cpu_core_limit,
                    memory_bytes: allocatable.memory_limit_bytes,
                    memory_swap_bytes: if allocatable.memory_sw_limit_bytes == 0 {
                        None
                    } else {
                        Some(allocatable.memory_sw_limit_bytes)
                    },
                },
                dedicated_slots: res.dedicated.map(|d| d.slots).unwrap_or_default(),
            },
            uid: spec.uid,
            gid: spec.gid,
        }
    }
}

/// One-of task flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Batch,
    Crun,
    Calloc,
}

/// Execution side of one job. Thin wrapper around the wire TaskSpec with
/// typed accessors; the raw spec travels on to the Supervisor untouched.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub inner: proto::TaskSpec,
}

impl From<proto::TaskSpec> for TaskSpec {
    fn from(inner: proto::TaskSpec) -> Self {
        Self { inner }
    }
}

impl TaskSpec {
    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    pub fn kind(&self) -> TaskKind {
        if self.inner.r#type == proto::TaskType::Batch as i32 {
            return TaskKind::Batch;
        }
        match &self.inner.interactive_meta {
            Some(meta) if meta.interactive_type == proto::InteractiveType::Calloc as i32 => {
                TaskKind::Calloc
            }
            _ => TaskKind::Crun,
        }
    }

    pub fn is_batch(&self) -> bool {
        self.kind() == TaskKind::Batch
    }

    pub fn is_crun(&self) -> bool {
        self.kind() == TaskKind::Crun
    }

    pub fn is_calloc(&self) -> bool {
        self.kind() == TaskKind::Calloc
    }

    pub fn script(&self) -> &str {
        if self.is_batch() {
            self.inner
                .batch_meta
                .as_ref()
                .map(|m| m.sh_script.as_str())
                .unwrap_or("")
        } else {
            self.inner
                .interactive_meta
                .as_ref()
                .map(|m| m.sh_script.as_str())
                .unwrap_or("")
        }
    }

    pub fn pty(&self) -> bool {
        self.inner
            .interactive_meta
            .as_ref()
            .map(|m| m.pty)
            .unwrap_or(false)
    }

    pub fn cfored_name(&self) -> &str {
        self.inner
            .interactive_meta
            .as_ref()
            .map(|m| m.cfored_name.as_str())
            .unwrap_or("")
    }

    /// The task environment map, merged in override order: task env, user
    /// env, cluster identity, TERM for crun, the formatted time limit.
    /// Resource-derived variables are appended by the caller.
    pub fn env_map(&self, pwd: &PasswordEntry) -> HashMap<String, String> {
        let task = &self.inner;
        let mut env: HashMap<String, String> = task.env.clone();

        if task.get_user_env {
            // Mimic the login module: the shell is started with --login
            // elsewhere, here only HOME and SHELL are set.
            env.insert("HOME".to_string(), pwd.home_dir.clone());
            env.insert("SHELL".to_string(), pwd.shell.clone());
        }

        env.insert(
            "CRANE_JOB_NODELIST".to_string(),
            task.allocated_nodes.join(";"),
        );
        env.insert("CRANE_EXCLUDES".to_string(), task.excludes.join(";"));
        env.insert("CRANE_JOB_NAME".to_string(), task.name.clone());
        env.insert("CRANE_ACCOUNT".to_string(), task.account.clone());
        env.insert("CRANE_PARTITION".to_string(), task.partition.clone());
        env.insert("CRANE_QOS".to_string(), task.qos.clone());
        env.insert("CRANE_JOB_ID".to_string(), task.job_id.to_string());

        if self.is_crun() {
            if let Some(meta) = &task.interactive_meta {
                if !meta.term_env.is_empty() {
                    env.insert("TERM".to_string(), meta.term_env.clone());
                }
            }
        }

        env.insert(
            "CRANE_TIMELIMIT".to_string(),
            format_time_limit(task.time_limit_seconds),
        );
        env
    }
}

/// HH:MM:SS rendering of a time limit.
pub fn format_time_limit(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    format!("{:0>2}:{:0>2}:{:0>2}", hours, minutes, secs)
}

/// Resolve an output-file pattern against the job working directory and
/// substitute `%j` (job id), `%u` (username) and `%x` (job name).
pub fn parse_file_path_pattern(
    pattern: &str,
    cwd: &str,
    job_id: JobId,
    username: &str,
    job_name: &str,
) -> String {
    let mut resolved = if pattern.is_empty() {
        format!("{}/", cwd)
    } else if pattern.starts_with('/') {
        pattern.to_string()
    } else {
        format!("{}/{}", cwd, pattern)
    };

    // A pattern ending with a directory gets the default file name.
    if resolved.ends_with('/') {
        resolved.push_str(&format!("Crane-{}.out", job_id));
    }

    resolved
        .replace("%j", &job_id.to_string())
        .replace("%u", username)
        .replace("%x", job_name)
}

/// Terminal and transient states reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    ExceedTimeLimit,
}

impl TaskStatus {
    pub fn to_proto(self) -> proto::TaskStatus {
        match self {
            TaskStatus::Running => proto::TaskStatus::Running,
            TaskStatus::Completed => proto::TaskStatus::Completed,
            TaskStatus::Failed => proto::TaskStatus::Failed,
            TaskStatus::Cancelled => proto::TaskStatus::Cancelled,
            TaskStatus::ExceedTimeLimit => proto::TaskStatus::ExceedTimeLimit,
        }
    }

    pub fn from_proto(status: proto::TaskStatus) -> Option<Self> {
        match status {
            proto::TaskStatus::Running => Some(TaskStatus::Running),
            proto::TaskStatus::Completed => Some(TaskStatus::Completed),
            proto::TaskStatus::Failed => Some(TaskStatus::Failed),
            proto::TaskStatus::Cancelled => Some(TaskStatus::Cancelled),
            proto::TaskStatus::ExceedTimeLimit => Some(TaskStatus::ExceedTimeLimit),
            proto::TaskStatus::Pending => None,
        }
    }
}

/// One status-change entry on the controller queue.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub job_id: JobId,
    pub status: TaskStatus,
    pub exit_code: u32,
    pub reason: Option<String>,
}

impl StatusChange {
    pub fn from_error(job_id: JobId, err: &CraneError) -> Self {
        Self {
            job_id,
            status: TaskStatus::Failed,
            exit_code: err.exit_code(),
            reason: Some(err.to_string()),
        }
    }
}

/// Why a job is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    UserCancel,
    Orphaned,
    Timeout,
}

/// One running child owned by a job.
#[derive(Debug, Clone)]
pub struct Execution {
    pub pid: u32,
    pub stdout_path: String,
    pub stderr_path: String,
    pub script_path: String,
}

/// Everything needed to re-adopt one running job after an agent restart.
#[derive(Debug, Clone)]
pub struct JobStatusSpec {
    pub job_spec: JobSpec,
    pub task_spec: TaskSpec,
    pub task_pid: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pwd() -> PasswordEntry {
        PasswordEntry {
            username: "alice".into(),
            uid: 1000,
            gid: 1000,
            home_dir: "/home/alice".into(),
            shell: "/bin/zsh".into(),
        }
    }

    fn batch_task(job_id: JobId) -> TaskSpec {
        TaskSpec::from(proto::TaskSpec {
            job_id,
            name: "train".into(),
            r#type: proto::TaskType::Batch as i32,
            batch_meta: Some(proto::BatchMeta {
                sh_script: "echo hi".into(),
                output_file_pattern: String::new(),
                error_file_pattern: String::new(),
            }),
            cwd: "/tmp".into(),
            time_limit_seconds: 3661,
            allocated_nodes: vec!["cn1".into(), "cn2".into()],
            account: "acct".into(),
            partition: "cpu".into(),
            qos: "normal".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_format_time_limit() {
        assert_eq!(format_time_limit(0), "00:00:00");
        assert_eq!(format_time_limit(3661), "01:01:01");
        assert_eq!(format_time_limit(86400), "24:00:00");
    }

    #[test]
    fn test_env_map_identity_vars() {
        let task = batch_task(42);
        let env = task.env_map(&pwd());
        assert_eq!(env.get("CRANE_JOB_ID").unwrap(), "42");
        assert_eq!(env.get("CRANE_JOB_NODELIST").unwrap(), "cn1;cn2");
        assert_eq!(env.get("CRANE_TIMELIMIT").unwrap(), "01:01:01");
        // get_user_env unset: no HOME/SHELL injection.
        assert!(!env.contains_key("HOME"));
    }

    #[test]
    fn test_env_map_user_env() {
        let mut task = batch_task(42);
        task.inner.get_user_env = true;
        let env = task.env_map(&pwd());
        assert_eq!(env.get("HOME").unwrap(), "/home/alice");
        assert_eq!(env.get("SHELL").unwrap(), "/bin/zsh");
    }

    #[test]
    fn test_crun_term_env() {
        let task = TaskSpec::from(proto::TaskSpec {
            job_id: 3,
            r#type: proto::TaskType::Interactive as i32,
            interactive_meta: Some(proto::InteractiveMeta {
                interactive_type: proto::InteractiveType::Crun as i32,
                term_env: "xterm-256color".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(task.is_crun());
        let env = task.env_map(&pwd());
        assert_eq!(env.get("TERM").unwrap(), "xterm-256color");
    }

    #[test]
    fn test_task_kind() {
        assert_eq!(batch_task(1).kind(), TaskKind::Batch);

        let calloc = TaskSpec::from(proto::TaskSpec {
            r#type: proto::TaskType::Interactive as i32,
            interactive_meta: Some(proto::InteractiveMeta {
                interactive_type: proto::InteractiveType::Calloc as i32,
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(calloc.kind(), TaskKind::Calloc);
    }

    #[test]
    fn test_pattern_empty_defaults_to_cwd() {
        let path = parse_file_path_pattern("", "/tmp", 42, "alice", "train");
        assert_eq!(path, "/tmp/Crane-42.out");
    }

    #[test]
    fn test_pattern_relative_resolved_against_cwd() {
        let path = parse_file_path_pattern("out/%j.log", "/work", 7, "alice", "train");
        assert_eq!(path, "/work/out/7.log");
    }

    #[test]
    fn test_pattern_trailing_slash_gets_default_name() {
        let path = parse_file_path_pattern("logs/", "/work", 7, "alice", "train");
        assert_eq!(path, "/work/logs/Crane-7.out");
    }

    #[test]
    fn test_pattern_substitutions() {
        let path =
            parse_file_path_pattern("/data/%u/%x-%j.out", "/work", 9, "alice", "train");
        assert_eq!(path, "/data/alice/train-9.out");
    }
}
