/*!
 * Craned Service
 * Configure handoff, task execution and termination, cgroup admission
 * RPCs and Supervisor status reporting, gated on recovery readiness
 */

use crate::core::errors::{CraneError, CraneResult};
use crate::core::os;
use crate::job::types::{JobSpec, StatusChange, TaskSpec, TaskStatus, TerminateReason};
use crate::job::JobManager;
use crate::rpc::crane as proto;
use crate::rpc::crane::craned_server::{Craned, CranedServer};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::{transport::Server, Request, Response, Status};

/// Who a request came from. Supervisors may report while the controller
/// channel is down; controller requests additionally need a live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSource {
    Ctld,
    Supervisor,
}

/// Gate for incoming requests until recovery finished and (for
/// controller-sourced requests) the controller link is up.
pub struct Readiness {
    recovered: AtomicBool,
    ctld_ready: AtomicBool,
}

impl Readiness {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recovered: AtomicBool::new(false),
            ctld_ready: AtomicBool::new(false),
        })
    }

    pub fn finish_recover(&self) {
        debug!("Craned finished recover.");
        self.recovered.store(true, Ordering::Release);
    }

    pub fn set_ctld_ready(&self, ready: bool) {
        self.ctld_ready.store(ready, Ordering::Release);
    }

    pub fn ready_for(&self, source: RequestSource) -> bool {
        if !self.recovered.load(Ordering::Acquire) {
            return false;
        }
        match source {
            RequestSource::Ctld => self.ctld_ready.load(Ordering::Acquire),
            RequestSource::Supervisor => true,
        }
    }
}

#[derive(Clone)]
pub struct CranedService {
    job_mgr: Arc<JobManager>,
    readiness: Arc<Readiness>,
    configure_tx: Arc<Mutex<Option<oneshot::Sender<proto::ConfigureCranedRequest>>>>,
}

impl CranedService {
    pub fn new(
        job_mgr: Arc<JobManager>,
        readiness: Arc<Readiness>,
        configure_tx: oneshot::Sender<proto::ConfigureCranedRequest>,
    ) -> Self {
        Self {
            job_mgr,
            readiness,
            configure_tx: Arc::new(Mutex::new(Some(configure_tx))),
        }
    }

    fn check_ready(&self, source: RequestSource) -> Result<(), Status> {
        if self.readiness.ready_for(source) {
            Ok(())
        } else {
            Err(Status::unavailable("craned is not ready"))
        }
    }
}

#[tonic::async_trait]
impl Craned for CranedService {
    async fn configure(
        &self,
        request: Request<proto::ConfigureCranedRequest>,
    ) -> Result<Response<proto::ConfigureCranedReply>, Status> {
        info!("Received Configure from CraneCtld");
        match self.configure_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(request.into_inner());
            }
            None => debug!("Configure received after recovery; ignoring"),
        }
        Ok(Response::new(proto::ConfigureCranedReply { ok: true }))
    }

    async fn execute_task(
        &self,
        request: Request<proto::ExecuteTasksRequest>,
    ) -> Result<Response<proto::ExecuteTasksReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        let mut failed_task_ids = Vec::new();
        for task in request.into_inner().tasks {
            let job_id = task.job_id;
            if let Err(e) = self.job_mgr.execute_task(TaskSpec::from(task)).await {
                error!("ExecuteTask for job #{} failed: {}", job_id, e);
                failed_task_ids.push(job_id);
            }
        }
        Ok(Response::new(proto::ExecuteTasksReply { failed_task_ids }))
    }

    async fn create_cgroup_for_tasks(
        &self,
        request: Request<proto::CreateCgroupForTasksRequest>,
    ) -> Result<Response<proto::CreateCgroupForTasksReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        let specs: Vec<JobSpec> = request
            .into_inner()
            .job_specs
            .into_iter()
            .map(JobSpec::from)
            .collect();
        let ok = self.job_mgr.admit(specs);
        Ok(Response::new(proto::CreateCgroupForTasksReply { ok }))
    }

    async fn release_cgroup_for_tasks(
        &self,
        request: Request<proto::ReleaseCgroupForTasksRequest>,
    ) -> Result<Response<proto::ReleaseCgroupForTasksReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        let ok = self.job_mgr.free_jobs(request.into_inner().job_ids);
        Ok(Response::new(proto::ReleaseCgroupForTasksReply { ok }))
    }

    async fn terminate_tasks(
        &self,
        request: Request<proto::TerminateTasksRequest>,
    ) -> Result<Response<proto::TerminateTasksReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        for job_id in request.into_inner().task_ids {
            self.job_mgr.terminate(job_id, TerminateReason::UserCancel).await;
        }
        Ok(Response::new(proto::TerminateTasksReply { ok: true }))
    }

    async fn terminate_orphaned_task(
        &self,
        request: Request<proto::TerminateOrphanedTaskRequest>,
    ) -> Result<Response<proto::TerminateOrphanedTaskReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        self.job_mgr
            .terminate(request.into_inner().task_id, TerminateReason::Orphaned)
            .await;
        Ok(Response::new(proto::TerminateOrphanedTaskReply { ok: true }))
    }

    async fn change_task_time_limit(
        &self,
        request: Request<proto::ChangeTaskTimeLimitRequest>,
    ) -> Result<Response<proto::ChangeTaskTimeLimitReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        let req = request.into_inner();
        let ok = self
            .job_mgr
            .change_time_limit(req.task_id, req.time_limit_seconds)
            .await
            .is_ok();
        Ok(Response::new(proto::ChangeTaskTimeLimitReply { ok }))
    }

    async fn check_task_status(
        &self,
        request: Request<proto::CheckTaskStatusRequest>,
    ) -> Result<Response<proto::CheckTaskStatusReply>, Status> {
        self.check_ready(RequestSource::Ctld)?;

        let reply = match self.job_mgr.check_task_status(request.into_inner().task_id) {
            Some(status) => proto::CheckTaskStatusReply {
                ok: true,
                status: status.to_proto() as i32,
            },
            None => proto::CheckTaskStatusReply {
                ok: false,
                status: proto::TaskStatus::Pending as i32,
            },
        };
        Ok(Response::new(reply))
    }

    async fn task_status_change(
        &self,
        request: Request<proto::TaskStatusChangeRequest>,
    ) -> Result<Response<proto::TaskStatusChangeReply>, Status> {
        self.check_ready(RequestSource::Supervisor)?;

        let req = request.into_inner();
        let status = proto::TaskStatus::try_from(req.new_status)
            .ok()
            .and_then(TaskStatus::from_proto)
            .ok_or_else(|| Status::invalid_argument("invalid task status"))?;

        self.job_mgr.task_status_change(StatusChange {
            job_id: req.task_id,
            status,
            exit_code: req.exit_code,
            reason: req.reason,
        });
        Ok(Response::new(proto::TaskStatusChangeReply { ok: true }))
    }
}

/// Serve toward the controller on TCP.
pub async fn serve_tcp(
    service: CranedService,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()>,
) -> CraneResult<()> {
    info!("Craned gRPC server listening on {}", addr);
    Server::builder()
        .add_service(CranedServer::new(service))
        .serve_with_shutdown(addr, shutdown)
        .await
        .map_err(|e| CraneError::System(format!("craned server: {}", e)))
}

/// Serve the same surface on the agent's local socket; Supervisors report
/// status over it.
pub async fn serve_uds(
    service: CranedService,
    sock_path: &Path,
    shutdown: impl std::future::Future<Output = ()>,
) -> CraneResult<()> {
    if let Some(parent) = sock_path.parent() {
        os::create_folders(parent)?;
    }
    os::delete_file(sock_path);
    let listener = UnixListener::bind(sock_path)
        .map_err(|e| CraneError::System(format!("bind {}: {}", sock_path.display(), e)))?;
    info!("Craned local server listening on {}", sock_path.display());

    let result = Server::builder()
        .add_service(CranedServer::new(service))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await
        .map_err(|e| CraneError::System(format!("craned local server: {}", e)));

    os::delete_file(sock_path);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_gating() {
        let readiness = Readiness::new();
        assert!(!readiness.ready_for(RequestSource::Ctld));
        assert!(!readiness.ready_for(RequestSource::Supervisor));

        // Supervisors may report as soon as recovery is done, even while
        // the controller link is down.
        readiness.finish_recover();
        assert!(readiness.ready_for(RequestSource::Supervisor));
        assert!(!readiness.ready_for(RequestSource::Ctld));

        readiness.set_ctld_ready(true);
        assert!(readiness.ready_for(RequestSource::Ctld));

        readiness.set_ctld_ready(false);
        assert!(!readiness.ready_for(RequestSource::Ctld));
        assert!(readiness.ready_for(RequestSource::Supervisor));
    }
}
