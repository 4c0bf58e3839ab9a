/*!
 * Task Runner
 * The Supervisor side of one job: forks the user child with the
 * CanStart/ChildReady handshake, transitions credentials, wires stdio,
 * reaps the child and reports its terminal status to the agent
 */

use crate::cfored::CforedClient;
use crate::core::config::SupervisorConfig;
use crate::core::errors::{exit_code, CraneError, CraneResult};
use crate::core::os;
use crate::core::passwd::PasswordEntry;
use crate::core::types::JobId;
use crate::job::types::{StatusChange, TaskSpec, TaskStatus};
use crate::rpc::crane as proto;
use crate::rpc::crane::craned_client::CranedClient;
use crate::supervisor::keeper::connect_uds;
use log::{debug, error, info, trace, warn};
use nix::pty::ForkptyResult;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

const TERMINATE_GRACE: Duration = Duration::from_secs(5);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const REPORT_RETRIES: u32 = 3;

/// Parent half of the startup handshake.
#[derive(Debug, Serialize, Deserialize)]
struct CanStartMessage {
    ok: bool,
}

/// Child half of the startup handshake.
#[derive(Debug, Serialize, Deserialize)]
struct ChildProcessReady {
    ok: bool,
}

/// Everything the agent resolved for this execution.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub task: TaskSpec,
    pub env: HashMap<String, String>,
    pub script_path: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub uid: u32,
    pub gid: u32,
    pub cgroup_procs_paths: Vec<PathBuf>,
}

impl From<proto::supervisor::TaskExecutionRequest> for ExecutionSpec {
    fn from(req: proto::supervisor::TaskExecutionRequest) -> Self {
        Self {
            task: TaskSpec::from(req.task.unwrap_or_default()),
            env: req.env,
            script_path: req.script_path,
            stdout_path: req.stdout_path,
            stderr_path: req.stderr_path,
            uid: req.uid,
            gid: req.gid,
            cgroup_procs_paths: req.cgroup_procs_paths.into_iter().map(PathBuf::from).collect(),
        }
    }
}

/// Data the forked child needs, fully materialized before fork so the
/// child branch touches no locks or owned heap of the parent.
struct PreparedChild {
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
    uid: Uid,
    gids: Vec<Gid>,
    stdout_path: Option<CString>,
    stderr_path: Option<CString>,
    cgroup_procs_paths: Vec<PathBuf>,
    is_batch: bool,
    is_crun: bool,
    pty: bool,
}

impl PreparedChild {
    fn new(spec: &ExecutionSpec, pwd: &PasswordEntry) -> CraneResult<Self> {
        let cstring = |s: &str, what: &str| {
            CString::new(s).map_err(|_| CraneError::Generic(format!("NUL byte in {}", what)))
        };

        let mut argv = vec![cstring("CraneScript", "argv0")?];
        if spec.task.inner.get_user_env {
            // Reload the user's profile the way a login shell would.
            argv.push(cstring("--login", "argv")?);
        }
        argv.push(cstring(&spec.script_path, "script path")?);

        let mut envp = Vec::with_capacity(spec.env.len());
        for (name, value) in &spec.env {
            envp.push(cstring(&format!("{}={}", name, value), "environment")?);
        }

        // Supplementary groups: the task gid plus the user's primary gid.
        let mut gids = Vec::new();
        if spec.gid != pwd.gid {
            gids.push(Gid::from_raw(spec.gid));
        }
        gids.push(Gid::from_raw(pwd.gid));

        Ok(Self {
            argv,
            envp,
            cwd: cstring(&spec.task.inner.cwd, "cwd")?,
            uid: Uid::from_raw(spec.uid),
            gids,
            stdout_path: if spec.stdout_path.is_empty() {
                None
            } else {
                Some(cstring(&spec.stdout_path, "stdout path")?)
            },
            stderr_path: if spec.stderr_path.is_empty() {
                None
            } else {
                Some(cstring(&spec.stderr_path, "stderr path")?)
            },
            cgroup_procs_paths: spec.cgroup_procs_paths.clone(),
            is_batch: spec.task.is_batch(),
            is_crun: spec.task.is_crun(),
            pty: spec.task.pty(),
        })
    }
}

struct SpawnOutcome {
    pid: i32,
    msg_fd: Option<OwnedFd>,
    err_before_exec: Option<CraneError>,
}

struct RunnerState {
    executed: bool,
    child_pid: Option<i32>,
    orphaned: bool,
    terminated_by_timeout: bool,
    err_before_exec: Option<CraneError>,
    cfored: Option<Arc<CforedClient>>,
    timer: Option<AbortHandle>,
    start: Option<Instant>,
}

pub struct TaskRunner {
    config: SupervisorConfig,
    shutdown: Arc<Notify>,
    state: Mutex<RunnerState>,
}

impl TaskRunner {
    pub fn new(config: SupervisorConfig, shutdown: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            config,
            shutdown,
            state: Mutex::new(RunnerState {
                executed: false,
                child_pid: None,
                orphaned: false,
                terminated_by_timeout: false,
                err_before_exec: None,
                cfored: None,
                timer: None,
                start: None,
            }),
        })
    }

    /// Launch the child. May only succeed once per Supervisor.
    pub async fn execute(self: &Arc<Self>, spec: ExecutionSpec) -> CraneResult<u32> {
        {
            let mut state = self.state.lock();
            if state.executed {
                return Err(CraneError::Generic(
                    "task was already executed on this Supervisor".to_string(),
                ));
            }
            state.executed = true;
        }

        let pwd = PasswordEntry::lookup(spec.uid)?;

        // Connect to the fan-out service before forking so a dead cfored
        // fails the execution cleanly.
        let cfored = if spec.task.is_crun() {
            Some(CforedClient::start(&self.config, spec.task.cfored_name()).await?)
        } else {
            None
        };

        let time_limit = spec.task.inner.time_limit_seconds;
        let pty = spec.task.pty();
        let prepared = PreparedChild::new(&spec, &pwd)?;

        let job_id = self.config.job_id;
        let outcome = tokio::task::spawn_blocking(move || spawn_child(job_id, prepared))
            .await
            .map_err(|e| CraneError::System(format!("spawn task join: {}", e)))??;

        {
            let mut state = self.state.lock();
            state.child_pid = Some(outcome.pid);
            state.err_before_exec = outcome.err_before_exec.clone();
            state.start = Some(Instant::now());
            state.cfored = cfored.clone();
        }

        if let (Some(client), Some(msg_fd)) = (&cfored, outcome.msg_fd) {
            if let Err(e) = client.register_task_fwd(outcome.pid as u32, msg_fd, pty) {
                warn!(
                    "[Job #{}] Failed to set up I/O forwarding: {}",
                    self.config.job_id, e
                );
            }
        }

        self.arm_timer(time_limit);
        debug!(
            "[Job #{}] Subprocess was created with pid: {}",
            self.config.job_id, outcome.pid
        );
        Ok(outcome.pid as u32)
    }

    pub fn check(&self) -> Option<(JobId, u32)> {
        self.state
            .lock()
            .child_pid
            .map(|pid| (self.config.job_id, pid as u32))
    }

    fn arm_timer(self: &Arc<Self>, time_limit_seconds: u64) {
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(time_limit_seconds)).await;
            trace!(
                "Job #{} exceeded its time limit. Terminating it...",
                runner.config.job_id
            );
            runner.terminate_task(false, true);
        });
        let mut state = self.state.lock();
        if let Some(old) = state.timer.replace(handle.abort_handle()) {
            old.abort();
        }
    }

    /// Re-arm the termination timer against the original start instant.
    pub fn change_time_limit(self: &Arc<Self>, new_limit_seconds: u64) -> bool {
        let start = {
            let state = self.state.lock();
            if state.child_pid.is_none() {
                return false;
            }
            state.start
        };
        let Some(start) = start else { return false };

        let elapsed = start.elapsed().as_secs();
        if elapsed >= new_limit_seconds {
            self.terminate_task(false, true);
        } else {
            self.arm_timer(new_limit_seconds - elapsed);
        }
        true
    }

    /// SIGTERM the task group, then SIGKILL after the grace interval.
    pub fn terminate_task(self: &Arc<Self>, mark_orphaned: bool, terminated_by_timeout: bool) {
        let pid = {
            let mut state = self.state.lock();
            state.orphaned |= mark_orphaned;
            state.terminated_by_timeout |= terminated_by_timeout;
            state.child_pid
        };

        let Some(pid) = pid else {
            debug!("TerminateTask with no running child");
            return;
        };

        trace!("Killing task group {} with SIGTERM", pid);
        if let Err(e) = kill(Pid::from_raw(-pid), Signal::SIGTERM) {
            warn!("kill({}) failed: {}", -pid, e);
        }

        let runner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATE_GRACE).await;
            if runner.state.lock().child_pid == Some(pid) {
                debug!("Grace interval elapsed, sending SIGKILL to group {}", pid);
                let _ = kill(Pid::from_raw(-pid), Signal::SIGKILL);
            }
        });
    }

    /// Self-exit once any active task completes. The reaper always ends
    /// the process after its single child, so an active task only defers
    /// the exit.
    pub fn terminate_supervisor(&self) {
        let state = self.state.lock();
        if state.child_pid.is_none() {
            self.shutdown.notify_one();
        }
    }

    /// The Supervisor's own reaper: drains child-termination notifications
    /// non-blockingly and finishes the job on its single child.
    pub fn start_reaper(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut sigchld = match signal(SignalKind::child()) {
                Ok(sigchld) => sigchld,
                Err(e) => {
                    error!("Failed to install the SIGCHLD handle: {}", e);
                    return;
                }
            };
            loop {
                sigchld.recv().await;
                loop {
                    match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::Exited(pid, code)) => {
                            runner.handle_reap(pid.as_raw(), code as u32, None).await;
                        }
                        Ok(WaitStatus::Signaled(pid, sig, _)) => {
                            runner
                                .handle_reap(
                                    pid.as_raw(),
                                    exit_code::TERMINATION_SIGNAL_BASE + sig as u32,
                                    Some(sig),
                                )
                                .await;
                        }
                        Ok(WaitStatus::StillAlive) => break,
                        Ok(_) => continue,
                        Err(nix::errno::Errno::ECHILD) => break,
                        Err(e) => {
                            debug!("waitpid() error: {}", e);
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn handle_reap(&self, pid: i32, raw_exit_code: u32, sig: Option<Signal>) {
        let (is_ours, cfored, orphaned, timed_out, err_before_exec) = {
            let mut state = self.state.lock();
            if state.child_pid != Some(pid) {
                (false, None, false, false, None)
            } else {
                state.child_pid = None;
                if let Some(timer) = state.timer.take() {
                    timer.abort();
                }
                (
                    true,
                    state.cfored.take(),
                    state.orphaned,
                    state.terminated_by_timeout,
                    state.err_before_exec.take(),
                )
            }
        };
        if !is_ours {
            return;
        }
        info!("[Job #{}] Child {} was reaped", self.config.job_id, pid);

        // Drain the interactive output before unregistering so no suffix
        // is dropped while the stream is healthy.
        if let Some(client) = &cfored {
            if !client.task_process_stop(pid as u32) {
                client.wait_outputs_drained(OUTPUT_DRAIN_TIMEOUT).await;
            }
            client.drain_and_unregister().await;
        }

        let status = if let Some(err) = err_before_exec {
            // Exits pre-forecast with an error use that reason verbatim.
            StatusChange::from_error(self.config.job_id, &err)
        } else if timed_out {
            StatusChange {
                job_id: self.config.job_id,
                status: TaskStatus::ExceedTimeLimit,
                exit_code: exit_code::EXCEED_TIME_LIMIT,
                reason: None,
            }
        } else if let Some(sig) = sig {
            StatusChange {
                job_id: self.config.job_id,
                status: TaskStatus::Failed,
                exit_code: raw_exit_code,
                reason: Some(format!("terminated by signal {}", sig)),
            }
        } else if raw_exit_code == 0 {
            StatusChange {
                job_id: self.config.job_id,
                status: TaskStatus::Completed,
                exit_code: 0,
                reason: None,
            }
        } else {
            StatusChange {
                job_id: self.config.job_id,
                status: TaskStatus::Failed,
                exit_code: raw_exit_code,
                reason: None,
            }
        };

        if orphaned {
            debug!("[Job #{}] Orphaned; not reporting status", self.config.job_id);
        } else {
            self.report_status(status).await;
        }
        self.shutdown.notify_one();
    }

    /// Write the final status to the agent over its local socket.
    async fn report_status(&self, status: StatusChange) {
        let request = proto::TaskStatusChangeRequest {
            task_id: status.job_id,
            craned_id: self.config.craned_id.clone(),
            new_status: status.status.to_proto() as i32,
            exit_code: status.exit_code,
            reason: status.reason.clone(),
        };

        for attempt in 1..=REPORT_RETRIES {
            match connect_uds(self.config.craned_sock_path()).await {
                Ok(channel) => {
                    let mut client = CranedClient::new(channel);
                    match client.task_status_change(request.clone()).await {
                        Ok(_) => return,
                        Err(e) => warn!(
                            "TaskStatusChange attempt {}/{} failed: {}",
                            attempt, REPORT_RETRIES, e
                        ),
                    }
                }
                Err(e) => warn!(
                    "Cannot reach agent socket (attempt {}/{}): {}",
                    attempt, REPORT_RETRIES, e
                ),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        error!(
            "[Job #{}] Failed to deliver terminal status to the agent",
            self.config.job_id
        );
    }
}

/// Fork (or forkpty) and run the handshake. Runs on a blocking thread.
/// An error return means fork was never performed; parent-side failures
/// after a successful fork are recorded in `err_before_exec` and the
/// reaper provides the status.
fn spawn_child(job_id: JobId, prepared: PreparedChild) -> CraneResult<SpawnOutcome> {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    let (ctrl_parent, ctrl_child) =
        socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty()).map_err(
            |e| CraneError::System(format!("[Job #{}] create socket pair: {}", job_id, e)),
        )?;

    // Socket pair forwarding crun stdio; the parent reads from index 0.
    let crun_io_pair = if prepared.is_crun && !prepared.pty {
        Some(
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(|e| {
                    CraneError::System(format!(
                        "[Job #{}] create io socket pair: {}",
                        job_id, e
                    ))
                })?,
        )
    } else {
        None
    };

    enum Forked {
        Parent { pid: Pid, msg_fd: Option<OwnedFd> },
        Child,
    }

    let forked = if prepared.pty {
        debug!("[Job #{}] Launching crun child with pty", job_id);
        match unsafe {
            nix::pty::forkpty(
                None::<&nix::pty::Winsize>,
                None::<&nix::sys::termios::Termios>,
            )
        }
        .map_err(|e| CraneError::System(format!("[Job #{}] forkpty() failed: {}", job_id, e)))?
        {
            ForkptyResult::Parent { child, master } => Forked::Parent {
                pid: child,
                msg_fd: Some(master),
            },
            ForkptyResult::Child => Forked::Child,
        }
    } else {
        match unsafe { fork() }
            .map_err(|e| CraneError::System(format!("[Job #{}] fork() failed: {}", job_id, e)))?
        {
            ForkResult::Parent { child } => Forked::Parent {
                pid: child,
                msg_fd: None,
            },
            ForkResult::Child => Forked::Child,
        }
    };

    match forked {
        Forked::Parent { pid, msg_fd } => {
            drop(ctrl_child);
            let msg_fd = match (msg_fd, crun_io_pair) {
                (Some(master), _) => Some(master),
                (None, Some((parent_end, child_end))) => {
                    drop(child_end);
                    Some(parent_end)
                }
                (None, None) => None,
            };
            parent_after_fork(job_id, pid, ctrl_parent, msg_fd, &prepared)
        }
        Forked::Child => {
            drop(ctrl_parent);
            let io_child_end = crun_io_pair.map(|(parent_end, child_end)| {
                drop(parent_end);
                child_end
            });
            child_exec(ctrl_child, io_child_end, prepared)
        }
    }
}

fn parent_after_fork(
    job_id: JobId,
    pid: Pid,
    ctrl_fd: OwnedFd,
    msg_fd: Option<OwnedFd>,
    prepared: &PreparedChild,
) -> CraneResult<SpawnOutcome> {
    let mut ctrl = UnixStream::from(ctrl_fd);
    let mut outcome = SpawnOutcome {
        pid: pid.as_raw(),
        msg_fd,
        err_before_exec: None,
    };

    // The child joins the resource group before it may exec.
    let mut attach_ok = true;
    for path in &prepared.cgroup_procs_paths {
        if let Err(e) = write_procs_file(path, pid.as_raw()) {
            error!(
                "[Job #{}] Terminating the subprocess due to failure of cgroup migration: {}",
                job_id, e
            );
            attach_ok = false;
            break;
        }
    }

    if !attach_ok {
        outcome.err_before_exec = Some(CraneError::Cgroup(format!(
            "cannot attach pid {} to the job cgroup",
            pid
        )));
        let ask = bincode::serialize_into(&mut ctrl, &CanStartMessage { ok: false });
        if ask.is_err() {
            error!("[Job #{}] Failed to ask subprocess {} to suicide.", job_id, pid);
            outcome.err_before_exec = Some(CraneError::Protocol(
                "control channel broke before ready-ack".to_string(),
            ));
            let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
        }
        return Ok(outcome);
    }

    trace!("[Job #{}] Task is ready. Asking subprocess to execv...", job_id);
    if bincode::serialize_into(&mut ctrl, &CanStartMessage { ok: true }).is_err() {
        // The parent cannot ask the child to commit suicide any more;
        // kill it and let the reaper send the single status change.
        error!("[Job #{}] Failed to send ok=true to subprocess {}", job_id, pid);
        outcome.err_before_exec = Some(CraneError::Protocol(
            "control channel broke before ready-ack".to_string(),
        ));
        let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
        return Ok(outcome);
    }

    match bincode::deserialize_from::<_, ChildProcessReady>(&mut ctrl) {
        Ok(ready) if ready.ok => Ok(outcome),
        other => {
            if let Err(e) = other {
                error!("[Job #{}] Socket child endpoint failed: {}", job_id, e);
            } else {
                error!("[Job #{}] Received false from subprocess {}", job_id, pid);
            }
            outcome.err_before_exec = Some(CraneError::Protocol(
                "child never acknowledged readiness".to_string(),
            ));
            let _ = kill(Pid::from_raw(-pid.as_raw()), Signal::SIGKILL);
            Ok(outcome)
        }
    }
}

fn write_procs_file(path: &std::path::Path, pid: i32) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(pid.to_string().as_bytes())
}

/// The child half: never returns. Everything here happens between fork
/// and exec; failures abort so the parent reaps a SIGABRT child.
fn child_exec(ctrl_fd: OwnedFd, io_fd: Option<OwnedFd>, prepared: PreparedChild) -> ! {
    use nix::libc;

    unsafe {
        libc::signal(libc::SIGABRT, libc::SIG_DFL);
    }

    let mut ctrl = UnixStream::from(ctrl_fd);

    match bincode::deserialize_from::<_, CanStartMessage>(&mut ctrl) {
        Ok(msg) if msg.ok => {}
        Ok(_) => {
            eprintln!("[Subprocess] Error: Parent process asked to suicide.");
            unsafe { libc::abort() }
        }
        Err(e) => {
            eprintln!("[Subprocess] Error: Failed to read socket from parent: {}", e);
            unsafe { libc::abort() }
        }
    }

    if let Err(e) = nix::unistd::setgroups(&prepared.gids) {
        eprintln!("[Subprocess] Error: setgroups() failed: {}", e);
        unsafe { libc::abort() }
    }
    let gid = prepared.gids[0];
    if let Err(e) = nix::unistd::setresgid(gid, gid, gid) {
        eprintln!("[Subprocess] Error: setresgid() failed: {}", e);
        unsafe { libc::abort() }
    }
    if let Err(e) = nix::unistd::setresuid(prepared.uid, prepared.uid, prepared.uid) {
        eprintln!("[Subprocess] Error: setresuid() failed: {}", e);
        unsafe { libc::abort() }
    }
    if unsafe { libc::chdir(prepared.cwd.as_ptr()) } != 0 {
        eprintln!("[Subprocess] Error: chdir failed");
        unsafe { libc::abort() }
    }

    // The task group id is the pid of the task root process.
    let _ = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0));

    if prepared.is_batch {
        let stdout_fd = match &prepared.stdout_path {
            Some(path) => unsafe {
                libc::open(
                    path.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                    0o644,
                )
            },
            None => {
                eprintln!("[Subprocess] Error: no stdout path for batch task");
                unsafe { libc::abort() }
            }
        };
        if stdout_fd == -1 {
            eprintln!("[Subprocess] Error: cannot open stdout file");
            unsafe { libc::abort() }
        }
        unsafe {
            libc::dup2(stdout_fd, 1);
        }
        match &prepared.stderr_path {
            None => unsafe {
                libc::dup2(stdout_fd, 2);
            },
            Some(path) => {
                let stderr_fd = unsafe {
                    libc::open(
                        path.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                        0o644,
                    )
                };
                if stderr_fd == -1 {
                    eprintln!("[Subprocess] Error: cannot open stderr file");
                    unsafe { libc::abort() }
                }
                unsafe {
                    libc::dup2(stderr_fd, 2);
                    libc::close(stderr_fd);
                }
            }
        }
        unsafe {
            libc::close(stdout_fd);
        }
    } else if let Some(io_fd) = &io_fd {
        let raw = io_fd.as_raw_fd();
        unsafe {
            libc::dup2(raw, 0);
            libc::dup2(raw, 1);
            libc::dup2(raw, 2);
        }
    }

    let ready = bincode::serialize_into(&mut ctrl, &ChildProcessReady { ok: true });
    if ready.is_err() {
        eprintln!("[Subprocess] Error: Failed to flush.");
        unsafe { libc::abort() }
    }
    drop(ctrl);

    // Close stdin for batch tasks; programs like mpirun otherwise wait on
    // it forever.
    if prepared.is_batch {
        unsafe {
            libc::close(0);
        }
    }
    os::close_fds_from(3);

    let _ = nix::unistd::execve(c"/bin/bash", &prepared.argv, &prepared.envp);

    // execv returned: errno is set and nothing can be salvaged.
    eprintln!("[Subprocess] Error: execv() failed");
    unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::crane as crane_proto;

    #[test]
    fn test_prepared_child_argv_login() {
        let pwd = PasswordEntry {
            username: "alice".into(),
            uid: 1000,
            gid: 1000,
            home_dir: "/home/alice".into(),
            shell: "/bin/bash".into(),
        };
        let spec = ExecutionSpec {
            task: TaskSpec::from(crane_proto::TaskSpec {
                job_id: 1,
                r#type: crane_proto::TaskType::Batch as i32,
                cwd: "/tmp".into(),
                get_user_env: true,
                ..Default::default()
            }),
            env: HashMap::new(),
            script_path: "/var/crane/script/Crane-1.sh".into(),
            stdout_path: "/tmp/Crane-1.out".into(),
            stderr_path: String::new(),
            uid: 1000,
            gid: 2000,
            cgroup_procs_paths: vec![],
        };

        let prepared = PreparedChild::new(&spec, &pwd).unwrap();
        let argv: Vec<_> = prepared
            .argv
            .iter()
            .map(|c| c.to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            argv,
            vec!["CraneScript", "--login", "/var/crane/script/Crane-1.sh"]
        );
        // Task gid first, primary gid last.
        assert_eq!(prepared.gids.len(), 2);
        assert_eq!(prepared.gids[0].as_raw(), 2000);
        assert_eq!(prepared.gids[1].as_raw(), 1000);
    }

    #[test]
    fn test_prepared_child_rejects_nul() {
        let pwd = PasswordEntry {
            username: "alice".into(),
            uid: 1000,
            gid: 1000,
            home_dir: "/home/alice".into(),
            shell: "/bin/bash".into(),
        };
        let spec = ExecutionSpec {
            task: TaskSpec::from(crane_proto::TaskSpec {
                cwd: "/tmp\0evil".into(),
                ..Default::default()
            }),
            env: HashMap::new(),
            script_path: String::new(),
            stdout_path: String::new(),
            stderr_path: String::new(),
            uid: 1000,
            gid: 1000,
            cgroup_procs_paths: vec![],
        };
        assert!(PreparedChild::new(&spec, &pwd).is_err());
    }
}
