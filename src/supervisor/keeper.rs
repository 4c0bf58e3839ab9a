/*!
 * Supervisor Keeper
 * Discovers Supervisors that survived an agent restart, spawns new ones,
 * and hands out clients for their per-job sockets
 */

use crate::core::config::{
    CranedConfig, ENV_SUPERVISOR_BASE_DIR, ENV_SUPERVISOR_CFORED_PORT,
    ENV_SUPERVISOR_CRANED_ID, ENV_SUPERVISOR_STEP_ID,
};
use crate::core::errors::{CraneError, CraneResult};
use crate::core::os;
use crate::core::types::JobId;
use crate::rpc::crane::supervisor as proto;
use crate::rpc::crane::supervisor::supervisor_client::SupervisorClient as GrpcClient;
use dashmap::DashMap;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

const RPC_TIMEOUT: Duration = Duration::from_secs(5);
const SCAN_TIMEOUT: Duration = Duration::from_secs(3);
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Dial a unix-domain gRPC socket.
pub async fn connect_uds(path: PathBuf) -> CraneResult<Channel> {
    // The URI is required by the API but never used for a UDS connector.
    let endpoint = Endpoint::try_from("http://[::]:50051")
        .map_err(|e| CraneError::System(format!("endpoint: {}", e)))?;
    endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                Ok::<_, std::io::Error>(TokioIo::new(
                    tokio::net::UnixStream::connect(path).await?,
                ))
            }
        }))
        .await
        .map_err(|e| CraneError::System(format!("connect supervisor socket: {}", e)))
}

/// Client for one Supervisor's socket. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorClient {
    inner: GrpcClient<Channel>,
}

impl SupervisorClient {
    pub async fn connect(path: &Path) -> CraneResult<Self> {
        let channel = connect_uds(path.to_path_buf()).await?;
        Ok(Self {
            inner: GrpcClient::new(channel),
        })
    }

    pub async fn execute_task(
        &self,
        request: proto::TaskExecutionRequest,
    ) -> CraneResult<u32> {
        let mut client = self.inner.clone();
        let reply = tokio::time::timeout(RPC_TIMEOUT, client.execute_task(request))
            .await
            .map_err(|_| CraneError::System("ExecuteTask timed out".to_string()))?
            .map_err(|e| CraneError::System(format!("ExecuteTask: {}", e)))?
            .into_inner();
        if reply.ok {
            Ok(reply.pid)
        } else {
            Err(CraneError::SpawnProcessFail(
                "Supervisor reported spawn failure".to_string(),
            ))
        }
    }

    pub async fn check_task_status(&self) -> CraneResult<Option<(JobId, u32)>> {
        let mut client = self.inner.clone();
        let reply = tokio::time::timeout(
            SCAN_TIMEOUT,
            client.check_task_status(proto::CheckTaskStatusRequest {}),
        )
        .await
        .map_err(|_| CraneError::System("CheckTaskStatus timed out".to_string()))?
        .map_err(|e| CraneError::System(format!("CheckTaskStatus: {}", e)))?
        .into_inner();
        if reply.ok {
            Ok(Some((reply.job_id, reply.pid)))
        } else {
            Ok(None)
        }
    }

    pub async fn change_time_limit(&self, time_limit_seconds: u64) -> CraneResult<()> {
        let mut client = self.inner.clone();
        let reply = tokio::time::timeout(
            RPC_TIMEOUT,
            client.change_task_time_limit(proto::ChangeTaskTimeLimitRequest {
                time_limit_seconds,
            }),
        )
        .await
        .map_err(|_| CraneError::System("ChangeTaskTimeLimit timed out".to_string()))?
        .map_err(|e| CraneError::System(format!("ChangeTaskTimeLimit: {}", e)))?
        .into_inner();
        if reply.ok {
            Ok(())
        } else {
            Err(CraneError::NonExistent("no running task".to_string()))
        }
    }

    pub async fn terminate_task(
        &self,
        mark_orphaned: bool,
        terminated_by_timeout: bool,
    ) -> CraneResult<()> {
        let mut client = self.inner.clone();
        tokio::time::timeout(
            RPC_TIMEOUT,
            client.terminate_task(proto::TerminateTaskRequest {
                mark_orphaned,
                terminated_by_timeout,
            }),
        )
        .await
        .map_err(|_| CraneError::System("TerminateTask timed out".to_string()))?
        .map_err(|e| CraneError::System(format!("TerminateTask: {}", e)))?;
        Ok(())
    }

    pub async fn terminate(&self) -> CraneResult<()> {
        let mut client = self.inner.clone();
        tokio::time::timeout(RPC_TIMEOUT, client.terminate(proto::TerminateRequest {}))
            .await
            .map_err(|_| CraneError::System("Terminate timed out".to_string()))?
            .map_err(|e| CraneError::System(format!("Terminate: {}", e)))?;
        Ok(())
    }
}

/// Notification that a directly-spawned Supervisor process exited.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorExit {
    pub job_id: JobId,
}

pub struct SupervisorKeeper {
    config: CranedConfig,
    clients: DashMap<JobId, SupervisorClient>,
    exit_tx: mpsc::UnboundedSender<SupervisorExit>,
}

impl SupervisorKeeper {
    pub fn new(config: CranedConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<SupervisorExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                config,
                clients: DashMap::new(),
                exit_tx,
            }),
            exit_rx,
        )
    }

    /// Parse `task_<id>.sock` names.
    fn parse_sock_name(name: &str) -> Option<JobId> {
        let digits = name.strip_prefix("task_")?.strip_suffix(".sock")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// Startup scan: every socket that answers CheckTaskStatus within the
    /// timeout is adopted; the rest are told to Terminate and forgotten.
    pub async fn scan(&self) -> HashMap<JobId, u32> {
        let sock_dir = self.config.supervisor_sock_dir();
        let mut alive = HashMap::new();

        let entries = match std::fs::read_dir(&sock_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No supervisor sockets to scan ({}): {}", sock_dir.display(), e);
                return alive;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let Some(job_id) = Self::parse_sock_name(&name) else {
                continue;
            };
            let path = entry.path();

            let client = match tokio::time::timeout(
                SCAN_TIMEOUT,
                SupervisorClient::connect(&path),
            )
            .await
            {
                Ok(Ok(client)) => client,
                _ => {
                    warn!("Supervisor socket {} is dead, removing it", path.display());
                    os::delete_file(&path);
                    continue;
                }
            };

            match client.check_task_status().await {
                Ok(Some((reported_job_id, pid))) => {
                    info!(
                        "Found living Supervisor of job #{} (child pid {})",
                        reported_job_id, pid
                    );
                    self.clients.insert(reported_job_id, client);
                    alive.insert(reported_job_id, pid);
                }
                _ => {
                    warn!(
                        "Supervisor of job #{} did not answer; terminating it",
                        job_id
                    );
                    let _ = client.terminate().await;
                    os::delete_file(&path);
                }
            }
        }
        alive
    }

    /// Fork a Supervisor for one job and wait for its ready line on the
    /// startup pipe. Failure to become ready means SIGKILL.
    pub async fn spawn_supervisor(&self, job_id: JobId) -> CraneResult<SupervisorClient> {
        let sock_path = self.config.supervisor_sock_path(job_id);
        os::create_folders(&self.config.supervisor_sock_dir())?;
        os::delete_file(&sock_path);

        let mut child = tokio::process::Command::new(&self.config.supervisor_bin)
            .arg("--job-id")
            .arg(job_id.to_string())
            .env(ENV_SUPERVISOR_CRANED_ID, &self.config.craned_id)
            .env(ENV_SUPERVISOR_BASE_DIR, &self.config.base_dir)
            .env(ENV_SUPERVISOR_STEP_ID, "0")
            .env(ENV_SUPERVISOR_CFORED_PORT, self.config.cfored_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| CraneError::SpawnProcessFail(format!("fork Supervisor: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CraneError::SpawnProcessFail("no startup pipe".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::time::timeout(READY_TIMEOUT, lines.next_line()).await;
        match ready {
            Ok(Ok(Some(line))) if line.trim() == "ready" => {}
            _ => {
                error!(
                    "Supervisor of job #{} did not become ready in time",
                    job_id
                );
                let _ = child.kill().await;
                return Err(CraneError::SpawnProcessFail(format!(
                    "Supervisor of job #{} not ready",
                    job_id
                )));
            }
        }

        let client = SupervisorClient::connect(&sock_path).await?;
        self.clients.insert(job_id, client.clone());
        debug!("Supervisor of job #{} is ready at {}", job_id, sock_path.display());

        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = exit_tx.send(SupervisorExit { job_id });
        });

        Ok(client)
    }

    pub fn client(&self, job_id: JobId) -> Option<SupervisorClient> {
        self.clients.get(&job_id).map(|c| c.clone())
    }

    pub fn forget(&self, job_id: JobId) {
        self.clients.remove(&job_id);
        os::delete_file(&self.config.supervisor_sock_path(job_id));
    }

    pub fn tracked_jobs(&self) -> Vec<JobId> {
        self.clients.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sock_name() {
        assert_eq!(SupervisorKeeper::parse_sock_name("task_42.sock"), Some(42));
        assert_eq!(SupervisorKeeper::parse_sock_name("task_.sock"), None);
        assert_eq!(SupervisorKeeper::parse_sock_name("task_4x.sock"), None);
        assert_eq!(SupervisorKeeper::parse_sock_name("craned.sock"), None);
        assert_eq!(SupervisorKeeper::parse_sock_name("task_7.sock.bak"), None);
    }
}
