/*!
 * Supervisor Server
 * Per-job RPC surface on unix://<base>/supervisor/task_<id>.sock
 */

use crate::core::errors::{CraneError, CraneResult};
use crate::core::os;
use crate::rpc::crane::supervisor as proto;
use crate::rpc::crane::supervisor::supervisor_server::{Supervisor, SupervisorServer};
use crate::supervisor::task::{ExecutionSpec, TaskRunner};
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};

pub struct SupervisorService {
    runner: Arc<TaskRunner>,
}

impl SupervisorService {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self { runner }
    }
}

#[tonic::async_trait]
impl Supervisor for SupervisorService {
    async fn execute_task(
        &self,
        request: Request<proto::TaskExecutionRequest>,
    ) -> Result<Response<proto::TaskExecutionReply>, Status> {
        let spec = ExecutionSpec::from(request.into_inner());
        match self.runner.execute(spec).await {
            Ok(pid) => Ok(Response::new(proto::TaskExecutionReply { ok: true, pid })),
            Err(e) => {
                error!("ExecuteTask failed: {}", e);
                Ok(Response::new(proto::TaskExecutionReply {
                    ok: false,
                    pid: 0,
                }))
            }
        }
    }

    async fn check_task_status(
        &self,
        _request: Request<proto::CheckTaskStatusRequest>,
    ) -> Result<Response<proto::CheckTaskStatusReply>, Status> {
        let reply = match self.runner.check() {
            Some((job_id, pid)) => proto::CheckTaskStatusReply {
                ok: true,
                job_id,
                pid,
            },
            None => proto::CheckTaskStatusReply {
                ok: false,
                job_id: 0,
                pid: 0,
            },
        };
        Ok(Response::new(reply))
    }

    async fn change_task_time_limit(
        &self,
        request: Request<proto::ChangeTaskTimeLimitRequest>,
    ) -> Result<Response<proto::ChangeTaskTimeLimitReply>, Status> {
        let ok = self
            .runner
            .change_time_limit(request.into_inner().time_limit_seconds);
        Ok(Response::new(proto::ChangeTaskTimeLimitReply { ok }))
    }

    async fn terminate_task(
        &self,
        request: Request<proto::TerminateTaskRequest>,
    ) -> Result<Response<proto::TerminateTaskReply>, Status> {
        let req = request.into_inner();
        self.runner
            .terminate_task(req.mark_orphaned, req.terminated_by_timeout);
        Ok(Response::new(proto::TerminateTaskReply { ok: true }))
    }

    async fn terminate(
        &self,
        _request: Request<proto::TerminateRequest>,
    ) -> Result<Response<proto::TerminateReply>, Status> {
        self.runner.terminate_supervisor();
        Ok(Response::new(proto::TerminateReply { ok: true }))
    }
}

/// Bind the per-job socket. Separate from serving so the caller can
/// announce readiness on its startup pipe only once the socket exists.
pub fn bind_uds(sock_path: &Path) -> CraneResult<UnixListener> {
    if let Some(parent) = sock_path.parent() {
        os::create_folders(parent)?;
    }
    os::delete_file(sock_path);
    UnixListener::bind(sock_path)
        .map_err(|e| CraneError::System(format!("bind {}: {}", sock_path.display(), e)))
}

/// Serve the Supervisor service until `shutdown` resolves. The socket
/// file is removed on the way out.
pub async fn serve_uds(
    runner: Arc<TaskRunner>,
    listener: UnixListener,
    sock_path: &Path,
    shutdown: impl std::future::Future<Output = ()>,
) -> CraneResult<()> {
    info!("Supervisor listening on {}", sock_path.display());

    let result = Server::builder()
        .add_service(SupervisorServer::new(SupervisorService::new(runner)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| CraneError::System(format!("supervisor server: {}", e)));

    os::delete_file(sock_path);
    result
}
