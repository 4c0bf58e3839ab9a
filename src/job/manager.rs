/*!
 * Job Manager
 * Owns the JobInstances on this node: admission, execution through
 * Supervisors, time limits, termination and terminal status delivery
 */

use crate::cgroup::types::{CgroupInterface, CgroupSpec};
use crate::cgroup::CgroupManager;
use crate::core::config::CranedConfig;
use crate::core::errors::{exit_code, CraneError, CraneResult};
use crate::core::os;
use crate::core::passwd::PasswordEntry;
use crate::core::types::JobId;
use crate::ctld::CtldClient;
use crate::job::types::{
    parse_file_path_pattern, Execution, JobSpec, JobStatusSpec, StatusChange, TaskSpec,
    TaskStatus, TerminateReason,
};
use crate::rpc::crane as proto;
use crate::supervisor::{SupervisorExit, SupervisorKeeper};
use dashmap::DashMap;
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// One job on this node: its resource allocation plus execution state.
struct JobInstance {
    spec: JobSpec,
    // Held for its Drop: releases the group (when empty) and the
    // device-filter entries.
    #[allow(dead_code)]
    cgroup: Option<Box<dyn CgroupInterface>>,
    task: Option<TaskSpec>,
    executions: HashMap<u32, Execution>,
    orphaned: bool,
    err_before_exec: Option<CraneError>,
}

struct TimerHandle {
    abort: AbortHandle,
    start: Instant,
}

pub struct JobManager {
    config: CranedConfig,
    cgroup: Arc<CgroupManager>,
    keeper: Arc<SupervisorKeeper>,
    ctld: Arc<CtldClient>,
    jobs: DashMap<JobId, JobInstance>,
    timers: DashMap<JobId, TimerHandle>,
    ending: AtomicBool,
}

impl JobManager {
    pub fn new(
        config: CranedConfig,
        cgroup: Arc<CgroupManager>,
        keeper: Arc<SupervisorKeeper>,
        ctld: Arc<CtldClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cgroup,
            keeper,
            ctld,
            jobs: DashMap::new(),
            timers: DashMap::new(),
            ending: AtomicBool::new(false),
        })
    }

    /// Start the Supervisor exit watcher. A Supervisor that dies without
    /// reporting a terminal status gets one synthesized here.
    pub fn start(self: &Arc<Self>, mut exits: mpsc::UnboundedReceiver<SupervisorExit>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                manager.on_supervisor_exit(exit);
            }
        });
    }

    fn on_supervisor_exit(&self, exit: SupervisorExit) {
        if !self.jobs.contains_key(&exit.job_id) {
            // Normal path: the Supervisor reported first and the job is
            // already gone.
            return;
        }
        warn!(
            "[Job #{}] Supervisor exited without reporting a status",
            exit.job_id
        );
        let status = self
            .jobs
            .get(&exit.job_id)
            .and_then(|j| j.err_before_exec.clone())
            .map(|e| StatusChange::from_error(exit.job_id, &e))
            .unwrap_or_else(|| StatusChange {
                job_id: exit.job_id,
                status: TaskStatus::Failed,
                exit_code: exit_code::GENERIC_FAILURE,
                reason: Some("Supervisor exited unexpectedly".to_string()),
            });
        self.task_status_change(status);
    }

    /// Admission: create the RCG (idempotent on presence) and the
    /// JobInstance. Execution comes separately.
    pub fn admit(&self, specs: Vec<JobSpec>) -> bool {
        if self.ending.load(Ordering::Acquire) {
            warn!("Refusing job admission while shutting down");
            return false;
        }

        let mut ok = true;
        for spec in specs {
            let job_id = spec.job_id;
            if self.jobs.contains_key(&job_id) {
                error!("Duplicated admission for job #{}. Ignoring it.", job_id);
                continue;
            }

            let cg_spec = CgroupSpec {
                job_id,
                resource: spec.resource.clone(),
                recovered: false,
            };
            match self.cgroup.allocate(&cg_spec) {
                Ok(cgroup) => {
                    info!("Admitted job #{}", job_id);
                    self.jobs.insert(
                        job_id,
                        JobInstance {
                            spec,
                            cgroup: Some(cgroup),
                            task: None,
                            executions: HashMap::new(),
                            orphaned: false,
                            err_before_exec: None,
                        },
                    );
                }
                Err(e) => {
                    error!("Failed to allocate cgroup for job #{}: {}", job_id, e);
                    ok = false;
                }
            }
        }
        ok
    }

    /// Re-adopt jobs whose Supervisors survived an agent restart.
    pub fn recover(&self, statuses: Vec<JobStatusSpec>) {
        for status in statuses {
            let job_id = status.job_spec.job_id;
            let cg_spec = CgroupSpec {
                job_id,
                resource: status.job_spec.resource.clone(),
                recovered: true,
            };
            let cgroup = match self.cgroup.allocate(&cg_spec) {
                Ok(cg) => Some(cg),
                Err(e) => {
                    error!("Failed to recover cgroup of job #{}: {}", job_id, e);
                    None
                }
            };

            let mut executions = HashMap::new();
            executions.insert(
                status.task_pid,
                Execution {
                    pid: status.task_pid,
                    stdout_path: String::new(),
                    stderr_path: String::new(),
                    script_path: self
                        .config
                        .script_path(job_id)
                        .to_string_lossy()
                        .into_owned(),
                },
            );

            info!(
                "Recovered job #{} with running child pid {}",
                job_id, status.task_pid
            );
            self.jobs.insert(
                job_id,
                JobInstance {
                    spec: status.job_spec,
                    cgroup,
                    task: Some(status.task_spec),
                    executions,
                    orphaned: false,
                    err_before_exec: None,
                },
            );
        }
    }

    /// Launch one job's task: resolve the user, materialize the script,
    /// parse output paths, spawn the Supervisor and arm the time limit.
    pub async fn execute_task(self: &Arc<Self>, task: TaskSpec) -> CraneResult<()> {
        let job_id = task.job_id();

        if self.ending.load(Ordering::Acquire) {
            return Err(CraneError::Generic(
                "agent is shutting down, no new tasks".to_string(),
            ));
        }
        if !self.jobs.contains_key(&job_id) || !self.cgroup.exists(job_id) {
            debug!(
                "Executing task #{} without an allocated cgroup. Ignoring it.",
                job_id
            );
            return Err(CraneError::Cgroup(format!(
                "no cgroup allocated for job #{}",
                job_id
            )));
        }
        if self
            .jobs
            .get(&job_id)
            .map(|j| j.task.is_some())
            .unwrap_or(false)
        {
            error!("Duplicated ExecuteTask request for job #{}. Ignoring it.", job_id);
            return Err(CraneError::Generic(format!(
                "job #{} already has a task",
                job_id
            )));
        }
        info!("Executing task of job #{}", job_id);

        let pwd = match PasswordEntry::lookup(task.inner.uid) {
            Ok(pwd) => pwd,
            Err(e) => {
                debug!(
                    "Failed to look up password entry for uid {} of job #{}",
                    task.inner.uid, job_id
                );
                let err = CraneError::PermissionDenied(format!(
                    "no password entry for uid {} of job #{}",
                    task.inner.uid, job_id
                ));
                self.fail_before_spawn(job_id, &err);
                return Err(e);
            }
        };

        let time_limit = task.inner.time_limit_seconds;

        // Calloc jobs have nothing to run; their lifetime is the
        // allocation itself.
        if task.is_calloc() {
            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                job.task = Some(task);
            }
            self.arm_timer(job_id, time_limit, true);
            return Ok(());
        }

        let script_path = self.config.script_path(job_id);
        if let Err(e) = self.materialize_script(&script_path, task.script()) {
            error!("Cannot write shell script for job #{}: {}", job_id, e);
            let err =
                CraneError::FileNotFound(format!("cannot write script for job #{}", job_id));
            self.fail_before_spawn(job_id, &err);
            return Err(err);
        }

        // Batch output path resolution with %j/%u/%x substitution. An
        // empty stderr pattern merges stderr into stdout.
        let (stdout_path, stderr_path) = if task.is_batch() {
            let meta = task.inner.batch_meta.clone().unwrap_or_default();
            let stdout = parse_file_path_pattern(
                &meta.output_file_pattern,
                &task.inner.cwd,
                job_id,
                &pwd.username,
                &task.inner.name,
            );
            let stderr = if meta.error_file_pattern.is_empty() {
                String::new()
            } else {
                parse_file_path_pattern(
                    &meta.error_file_pattern,
                    &task.inner.cwd,
                    job_id,
                    &pwd.username,
                    &task.inner.name,
                )
            };
            (stdout, stderr)
        } else {
            (String::new(), String::new())
        };

        let resource = self
            .jobs
            .get(&job_id)
            .map(|j| j.spec.resource.clone())
            .ok_or_else(|| CraneError::NonExistent(format!("job #{}", job_id)))?;

        let mut env = task.env_map(&pwd);
        env.extend(self.cgroup.env_for(&resource));

        let request = proto::supervisor::TaskExecutionRequest {
            task: Some(task.inner.clone()),
            env,
            script_path: script_path.to_string_lossy().into_owned(),
            stdout_path: stdout_path.clone(),
            stderr_path: stderr_path.clone(),
            uid: pwd.uid,
            gid: task.inner.gid,
            cgroup_procs_paths: self
                .cgroup
                .procs_paths(job_id)
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
        };

        let client = match self.keeper.spawn_supervisor(job_id).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to spawn Supervisor for job #{}: {}", job_id, e);
                let err = CraneError::SpawnProcessFail(format!(
                    "cannot spawn Supervisor for job #{}",
                    job_id
                ));
                self.fail_before_spawn(job_id, &err);
                return Err(err);
            }
        };

        let pid = match client.execute_task(request).await {
            Ok(pid) => pid,
            Err(e) => {
                error!("Supervisor of job #{} failed to start the task: {}", job_id, e);
                let _ = client.terminate().await;
                let err = CraneError::SpawnProcessFail(format!(
                    "cannot spawn a new process inside the instance of job #{}",
                    job_id
                ));
                self.fail_before_spawn(job_id, &err);
                return Err(err);
            }
        };

        match self.jobs.get_mut(&job_id) {
            Some(mut job) => {
                job.task = Some(task);
                job.executions.insert(
                    pid,
                    Execution {
                        pid,
                        stdout_path,
                        stderr_path,
                        script_path: script_path.to_string_lossy().into_owned(),
                    },
                );
            }
            None => {
                // Terminated while spawning; hand the orphan to its
                // Supervisor for teardown.
                warn!("Job #{} vanished during spawn, terminating it", job_id);
                let _ = client.terminate_task(true, false).await;
                return Err(CraneError::NonExistent(format!("job #{}", job_id)));
            }
        }

        debug!("[Job #{}] Task started with pid {}", job_id, pid);
        self.arm_timer(job_id, time_limit, false);
        Ok(())
    }

    fn materialize_script(&self, path: &std::path::Path, script: &str) -> CraneResult<()> {
        os::create_folders_for_file(path)?;
        std::fs::write(path, script)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }

    /// Pre-spawn failure: destroy the partial JobInstance and emit a
    /// synthetic Failed status with the corresponding reason.
    fn fail_before_spawn(&self, job_id: JobId, err: &CraneError) {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            job.err_before_exec = Some(err.clone());
        }
        self.task_status_change(StatusChange::from_error(job_id, err));
    }

    fn arm_timer(self: &Arc<Self>, job_id: JobId, time_limit_seconds: u64, interactive: bool) {
        self.disarm_timer(job_id);

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(time_limit_seconds)).await;
            trace!("Job #{} exceeded its time limit. Terminating it...", job_id);
            if interactive {
                // Crun/Calloc: deliver the terminal kind directly; the
                // Supervisor is told to kill the child without reporting.
                if let Some(client) = manager.keeper.client(job_id) {
                    let _ = client.terminate_task(true, true).await;
                }
                manager.task_status_change(StatusChange {
                    job_id,
                    status: TaskStatus::ExceedTimeLimit,
                    exit_code: exit_code::EXCEED_TIME_LIMIT,
                    reason: None,
                });
            } else if let Some(client) = manager.keeper.client(job_id) {
                // Batch: ask the Supervisor to terminate with the timeout
                // kind; its reaper reports ExceedTimeLimit.
                let _ = client.terminate_task(false, true).await;
            }
        });

        self.timers.insert(
            job_id,
            TimerHandle {
                abort: handle.abort_handle(),
                start: Instant::now(),
            },
        );
    }

    fn disarm_timer(&self, job_id: JobId) {
        if let Some((_, timer)) = self.timers.remove(&job_id) {
            timer.abort.abort();
        }
    }

    /// Disarm and re-arm against the original start instant. An already
    /// exceeded limit terminates immediately.
    pub async fn change_time_limit(
        self: &Arc<Self>,
        job_id: JobId,
        new_limit_seconds: u64,
    ) -> CraneResult<()> {
        let Some(timer) = self.timers.get(&job_id).map(|t| t.start) else {
            // No local timer: forward to the Supervisor which owns the
            // clock for recovered jobs.
            if let Some(client) = self.keeper.client(job_id) {
                return client.change_time_limit(new_limit_seconds).await;
            }
            error!(
                "Trying to update the time limit of a non-existent job #{}.",
                job_id
            );
            return Err(CraneError::NonExistent(format!("job #{}", job_id)));
        };

        self.disarm_timer(job_id);
        let elapsed = timer.elapsed().as_secs();
        if elapsed >= new_limit_seconds {
            self.terminate(job_id, TerminateReason::Timeout).await;
        } else {
            let interactive = self
                .jobs
                .get(&job_id)
                .and_then(|j| j.task.as_ref().map(|t| !t.is_batch()))
                .unwrap_or(false);
            self.arm_timer(job_id, new_limit_seconds - elapsed, interactive);
            if let Some(client) = self.keeper.client(job_id) {
                let _ = client.change_time_limit(new_limit_seconds).await;
            }
        }
        Ok(())
    }

    /// Forward a termination to the job's Supervisor. Jobs without one
    /// (admitted but never launched, or Calloc) get their status here.
    pub async fn terminate(&self, job_id: JobId, reason: TerminateReason) {
        if reason == TerminateReason::Orphaned {
            if let Some(mut job) = self.jobs.get_mut(&job_id) {
                job.orphaned = true;
            }
        }

        let has_execution = self
            .jobs
            .get(&job_id)
            .map(|j| !j.executions.is_empty())
            .unwrap_or(false);

        if has_execution {
            if let Some(client) = self.keeper.client(job_id) {
                let timeout = reason == TerminateReason::Timeout;
                if let Err(e) = client.terminate_task(reason == TerminateReason::Orphaned, timeout).await
                {
                    warn!("Failed to forward terminate to Supervisor of job #{}: {}", job_id, e);
                }
                // The Supervisor's reaper reports the terminal status.
                return;
            }
        }

        if self.jobs.contains_key(&job_id) {
            let (status, exit) = match reason {
                TerminateReason::Timeout => {
                    (TaskStatus::ExceedTimeLimit, exit_code::EXCEED_TIME_LIMIT)
                }
                _ => (
                    TaskStatus::Cancelled,
                    exit_code::TERMINATION_SIGNAL_BASE + nix::libc::SIGTERM as u32,
                ),
            };
            self.task_status_change(StatusChange {
                job_id,
                status,
                exit_code: exit,
                reason: None,
            });
        } else {
            debug!("Terminate for unknown job #{}", job_id);
        }
    }

    /// Terminal delivery: tear the JobInstance down and queue the status
    /// change, unless the job was marked orphaned.
    pub fn task_status_change(&self, status: StatusChange) {
        let job_id = status.job_id;
        self.disarm_timer(job_id);

        let Some((_, job)) = self.jobs.remove(&job_id) else {
            // A double change can occur when shutdown races a reap; the
            // first one wins.
            return;
        };

        for execution in job.executions.values() {
            if !execution.script_path.is_empty() {
                os::delete_file(std::path::Path::new(&execution.script_path));
            }
        }
        if job.executions.is_empty() {
            // Never launched; remove the script if it was materialized.
            os::delete_file(&self.config.script_path(job_id));
        }

        self.keeper.forget(job_id);

        // Dropping the handle releases the group when empty; a populated
        // group is left for the recovery scan.
        drop(job.cgroup);
        if let Err(e) = self.cgroup.release(job_id) {
            debug!("Deferred cgroup release for job #{}: {}", job_id, e);
        }

        if job.orphaned {
            debug!("[Job #{}] Orphaned; status change withheld", job_id);
            return;
        }

        info!(
            "[Job #{}] Terminal status {:?}, exit code {}",
            job_id, status.status, status.exit_code
        );
        self.ctld.enqueue_status_change(status);
    }

    /// Free job allocations without a status change: the controller
    /// releases admitted-but-finished jobs explicitly.
    pub fn free_jobs(&self, job_ids: Vec<JobId>) -> bool {
        let mut ok = true;
        for job_id in job_ids {
            self.disarm_timer(job_id);
            if let Some((_, job)) = self.jobs.remove(&job_id) {
                drop(job.cgroup);
            }
            self.keeper.forget(job_id);
            if let Err(e) = self.cgroup.release(job_id) {
                debug!("Deferred cgroup release for job #{}: {}", job_id, e);
                ok = false;
            }
        }
        ok
    }

    /// Answer "has this job already ended?" without asking the kernel.
    pub fn check_task_status(&self, job_id: JobId) -> Option<TaskStatus> {
        if self.jobs.contains_key(&job_id) {
            return Some(TaskStatus::Running);
        }
        self.ctld.withdraw(job_id).map(|sc| sc.status)
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|e| *e.key()).collect()
    }

    pub fn is_ending(&self) -> bool {
        self.ending.load(Ordering::Acquire)
    }

    /// Graceful shutdown: refuse admissions and ask every Supervisor to
    /// terminate after its task completes.
    pub async fn shutdown(&self) {
        self.ending.store(true, Ordering::Release);
        let ids = self.running_jobs();
        for job_id in ids {
            if let Some(client) = self.keeper.client(job_id) {
                if let Err(e) = client.terminate().await {
                    warn!("Failed to stop Supervisor of job #{}: {}", job_id, e);
                }
            }
        }
    }
}

