/*!
 * Ctld Client
 * Reconnect loop with capped exponential backoff and the at-least-once
 * status-change queue
 */

use crate::core::config::CranedConfig;
use crate::core::errors::{CraneError, CraneResult};
use crate::core::types::JobId;
use crate::job::types::StatusChange;
use crate::rpc::crane as proto;
use crate::rpc::crane::crane_ctld_client::CraneCtldClient;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tonic::transport::Channel;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct CtldClient {
    craned_id: String,
    endpoint: String,
    /// Unbounded FIFO of undelivered status changes. The head is retried
    /// until the controller accepts it.
    queue: Mutex<VecDeque<StatusChange>>,
    queue_notify: Notify,
    connected: watch::Sender<bool>,
}

impl CtldClient {
    pub fn new(config: &CranedConfig) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            craned_id: config.craned_id.clone(),
            endpoint: format!("http://{}:{}", config.ctld_addr, config.ctld_port),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            connected,
        })
    }

    /// Observe connection state; the agent server gates CTLD-sourced
    /// requests on it.
    pub fn subscribe_connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Queue one status change for at-least-once delivery.
    pub fn enqueue_status_change(&self, status: StatusChange) {
        self.queue.lock().push_back(status);
        self.queue_notify.notify_one();
    }

    /// Withdraw an entry before delivery. CheckTaskStatus uses this to
    /// answer "has this job already ended?" without asking the kernel.
    pub fn withdraw(&self, job_id: JobId) -> Option<StatusChange> {
        let mut queue = self.queue.lock();
        let pos = queue.iter().position(|sc| sc.job_id == job_id)?;
        queue.remove(pos)
    }

    fn pop_if_front(&self, job_id: JobId) {
        let mut queue = self.queue.lock();
        if queue.front().map(|sc| sc.job_id) == Some(job_id) {
            queue.pop_front();
        }
    }

    fn status_request(&self, status: &StatusChange) -> proto::TaskStatusChangeRequest {
        proto::TaskStatusChangeRequest {
            task_id: status.job_id,
            craned_id: self.craned_id.clone(),
            new_status: status.status.to_proto() as i32,
            exit_code: status.exit_code,
            reason: status.reason.clone(),
        }
    }

    /// Run the connection loop forever: connect, register, drain the
    /// queue, back off on failure.
    pub fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = BACKOFF_INITIAL;
            loop {
                match client.connect_and_register().await {
                    Ok(grpc) => {
                        info!("Connected to CraneCtld at {}", client.endpoint);
                        let _ = client.connected.send(true);
                        backoff = BACKOFF_INITIAL;
                        client.drain_until_failure(grpc).await;
                        let _ = client.connected.send(false);
                        warn!("Connection to CraneCtld lost");
                    }
                    Err(e) => {
                        debug!("Cannot reach CraneCtld: {}", e);
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        });
    }

    async fn connect_and_register(&self) -> CraneResult<CraneCtldClient<Channel>> {
        let mut grpc = CraneCtldClient::connect(self.endpoint.clone())
            .await
            .map_err(|e| CraneError::System(format!("connect {}: {}", self.endpoint, e)))?;
        grpc.craned_register(proto::CranedRegisterRequest {
            craned_id: self.craned_id.clone(),
        })
        .await
        .map_err(|e| CraneError::Protocol(format!("CranedRegister: {}", e)))?;
        Ok(grpc)
    }

    /// Send queued entries in order; a transport failure leaves the item
    /// at the head for the next connection.
    async fn drain_until_failure(&self, mut grpc: CraneCtldClient<Channel>) {
        loop {
            let front = self.queue.lock().front().cloned();
            let Some(status) = front else {
                self.queue_notify.notified().await;
                continue;
            };

            let send =
                tokio::time::timeout(SEND_TIMEOUT, grpc.task_status_change(self.status_request(&status)))
                    .await;
            match send {
                Ok(Ok(_)) => {
                    debug!(
                        "[Job #{}] Status change delivered to CraneCtld",
                        status.job_id
                    );
                    self.pop_if_front(status.job_id);
                }
                Ok(Err(e)) => {
                    warn!(
                        "[Job #{}] Status change rejected by transport: {}",
                        status.job_id, e
                    );
                    return;
                }
                Err(_) => {
                    warn!("[Job #{}] Status change send timed out", status.job_id);
                    return;
                }
            }
        }
    }

    /// Report recovery results: jobs the controller knows but no local
    /// Supervisor survived for.
    pub async fn craned_ready(&self, nonexistent_jobs: Vec<JobId>) -> CraneResult<()> {
        let mut grpc = CraneCtldClient::connect(self.endpoint.clone())
            .await
            .map_err(|e| CraneError::System(format!("connect {}: {}", self.endpoint, e)))?;
        grpc.craned_ready(proto::CranedReadyRequest {
            craned_id: self.craned_id.clone(),
            nonexistent_jobs,
        })
        .await
        .map_err(|e| CraneError::Protocol(format!("CranedReady: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::types::TaskStatus;

    fn client() -> Arc<CtldClient> {
        let config = CranedConfig::default()
            .with_base_dir("/tmp/crane-test")
            .with_ctld_addr("127.0.0.1");
        CtldClient::new(&config)
    }

    fn change(job_id: JobId) -> StatusChange {
        StatusChange {
            job_id,
            status: TaskStatus::Completed,
            exit_code: 0,
            reason: None,
        }
    }

    #[test]
    fn test_queue_order_and_withdraw() {
        let client = client();
        client.enqueue_status_change(change(1));
        client.enqueue_status_change(change(2));
        client.enqueue_status_change(change(3));

        let withdrawn = client.withdraw(2).unwrap();
        assert_eq!(withdrawn.job_id, 2);
        assert!(client.withdraw(2).is_none());

        // Remaining entries keep their order.
        let queue = client.queue.lock();
        let ids: Vec<_> = queue.iter().map(|sc| sc.job_id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_pop_if_front_guards_against_withdrawn_head() {
        let client = client();
        client.enqueue_status_change(change(1));
        client.enqueue_status_change(change(2));

        // Head was withdrawn while a send of job 1 was in flight; the
        // ack must not pop job 2.
        client.withdraw(1);
        client.pop_if_front(1);
        assert_eq!(client.queue.lock().front().unwrap().job_id, 2);
    }
}
