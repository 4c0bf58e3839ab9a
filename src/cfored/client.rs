/*!
 * Cfored Client
 * Bidirectional stream to the I/O fan-out service: ordered task output
 * forwarding with a one-slot write token, task input fan-in, and a
 * drain-then-unregister shutdown
 */

use crate::core::config::SupervisorConfig;
use crate::core::errors::{CraneError, CraneResult};
use crate::core::types::{JobId, StepId};
use crate::rpc::crane::crane_fored_client::CraneForedClient;
use crate::rpc::crane::{
    stream_task_io_reply, stream_task_io_request, StreamTaskIoReply, StreamTaskIoRequest,
};
use log::{debug, error, trace, warn};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;

const READ_BUF_SIZE: usize = 4096;
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwarding state of one child's descriptors.
struct TaskFwdMeta {
    input_fd: Arc<OwnedFd>,
    pty: bool,
    input_stopped: bool,
    output_stopped: bool,
    proc_stopped: bool,
}

/// AsRawFd view over a shared descriptor for the readiness watcher.
struct WatchedFd(Arc<OwnedFd>);

impl AsRawFd for WatchedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

pub struct CforedClient {
    cfored_name: String,
    craned_id: String,
    job_id: JobId,
    step_id: StepId,
    /// Ordered per-client output queue. Taken (and closed) at shutdown so
    /// the drain task can finish.
    output_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// One-slot channel into the stream; the bounded capacity is the
    /// "write pending" token.
    req_tx: mpsc::Sender<StreamTaskIoRequest>,
    fwd_map: Arc<Mutex<HashMap<u32, TaskFwdMeta>>>,
    stopped: Arc<AtomicBool>,
    unregistering: Arc<AtomicBool>,
    outputs_done: watch::Sender<bool>,
    drain_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    unregister_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl CforedClient {
    /// Connect, register and enter the Forwarding state.
    pub async fn start(
        config: &SupervisorConfig,
        cfored_name: &str,
    ) -> CraneResult<Arc<Self>> {
        let endpoint = format!("http://{}:{}", cfored_name, config.cfored_port);
        let mut grpc = CraneForedClient::connect(endpoint.clone())
            .await
            .map_err(|e| CraneError::System(format!("connect {}: {}", endpoint, e)))?;

        let (req_tx, req_rx) = mpsc::channel::<StreamTaskIoRequest>(1);
        let response = grpc
            .task_io_stream(ReceiverStream::new(req_rx))
            .await
            .map_err(|e| CraneError::Protocol(format!("open stream: {}", e)))?;
        let mut inbound = response.into_inner();

        debug!("Registering new stream on cfored {}", cfored_name);
        let register = StreamTaskIoRequest {
            r#type: stream_task_io_request::Type::SupervisorRegister as i32,
            payload: Some(stream_task_io_request::Payload::PayloadRegisterReq(
                stream_task_io_request::RegisterPayload {
                    craned_id: config.craned_id.clone(),
                    task_id: config.job_id,
                    step_id: config.step_id,
                },
            )),
        };
        req_tx
            .send(register)
            .await
            .map_err(|_| CraneError::Protocol("stream closed before register".to_string()))?;

        // Other frame kinds before the ack are skipped and the read
        // re-issued.
        loop {
            let reply = inbound
                .message()
                .await
                .map_err(|e| CraneError::Protocol(format!("read register ack: {}", e)))?
                .ok_or_else(|| {
                    CraneError::Protocol("stream ended before register ack".to_string())
                })?;
            if reply.r#type == stream_task_io_reply::Type::RegisterAck as i32 {
                trace!("Cfored RegisterAck read. Start forwarding.");
                break;
            }
            trace!("Expected REGISTER_ACK, got {}. Ignoring it.", reply.r#type);
        }

        let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(64);
        let (outputs_done, _) = watch::channel(false);
        let (unregister_tx, unregister_rx) = oneshot::channel();

        let client = Arc::new(Self {
            cfored_name: cfored_name.to_string(),
            craned_id: config.craned_id.clone(),
            job_id: config.job_id,
            step_id: config.step_id,
            output_tx: Mutex::new(Some(output_tx)),
            req_tx: req_tx.clone(),
            fwd_map: Arc::new(Mutex::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            unregistering: Arc::new(AtomicBool::new(false)),
            outputs_done,
            drain_task: Mutex::new(None),
            unregister_rx: Mutex::new(Some(unregister_rx)),
        });

        // Outbound drain: one frame in flight at a time, in queue order.
        let drain_req_tx = req_tx.clone();
        let drain = tokio::spawn(async move {
            while let Some(chunk) = output_rx.recv().await {
                let frame = StreamTaskIoRequest {
                    r#type: stream_task_io_request::Type::TaskOutput as i32,
                    payload: Some(stream_task_io_request::Payload::PayloadTaskOutputReq(
                        stream_task_io_request::OutputPayload { msg: chunk },
                    )),
                };
                if drain_req_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });
        *client.drain_task.lock() = Some(drain);

        // Inbound loop: task input fan-in plus the unregister reply.
        let inbound_client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut unregister_tx = Some(unregister_tx);
            loop {
                let reply = match inbound.message().await {
                    Ok(Some(reply)) => reply,
                    Ok(None) => {
                        debug!("Cfored stream closed");
                        break;
                    }
                    Err(e) => {
                        if !inbound_client.stopped.load(Ordering::Acquire) {
                            error!("Cfored connection failed: {}", e);
                        }
                        break;
                    }
                };
                inbound_client.handle_reply(reply, &mut unregister_tx).await;
                if inbound_client.ended() {
                    break;
                }
            }
        });

        Ok(client)
    }

    fn ended(&self) -> bool {
        self.unregistering.load(Ordering::Acquire) && self.unregister_rx.lock().is_none()
    }

    async fn handle_reply(
        &self,
        reply: StreamTaskIoReply,
        unregister_tx: &mut Option<oneshot::Sender<()>>,
    ) {
        if reply.r#type == stream_task_io_reply::Type::UnregisterReply as i32 {
            if self.unregistering.load(Ordering::Acquire) {
                trace!("UNREGISTER_REPLY received.");
                if let Some(tx) = unregister_tx.take() {
                    let _ = tx.send(());
                }
            }
            return;
        }

        if reply.r#type != stream_task_io_reply::Type::TaskInput as i32 {
            trace!("Unexpected reply type {}. Ignoring it.", reply.r#type);
            return;
        }

        let Some(stream_task_io_reply::Payload::PayloadTaskInput(input)) = reply.payload else {
            return;
        };

        // Deliver to every child whose input is still open. A broken pipe
        // stops that child only.
        let targets: Vec<(u32, Arc<OwnedFd>)> = {
            let map = self.fwd_map.lock();
            map.iter()
                .filter(|(_, meta)| !meta.input_stopped)
                .map(|(pid, meta)| (*pid, Arc::clone(&meta.input_fd)))
                .collect()
        };
        for (pid, fd) in targets {
            if !write_all_retry(fd.as_raw_fd(), &input.msg).await {
                error!("Pipe to task #{} child {} was broken.", self.job_id, pid);
                if let Some(meta) = self.fwd_map.lock().get_mut(&pid) {
                    meta.input_stopped = true;
                }
            }
        }
    }

    /// Watch one child descriptor pair: reads go to the output queue in
    /// order, the same descriptor receives task input.
    pub fn register_task_fwd(self: &Arc<Self>, pid: u32, fd: OwnedFd, pty: bool) -> CraneResult<()> {
        set_nonblocking(fd.as_raw_fd())?;
        let fd = Arc::new(fd);

        self.fwd_map.lock().insert(
            pid,
            TaskFwdMeta {
                input_fd: Arc::clone(&fd),
                pty,
                input_stopped: false,
                output_stopped: false,
                proc_stopped: false,
            },
        );

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.read_output_loop(pid, fd, pty).await;
        });
        Ok(())
    }

    async fn read_output_loop(self: Arc<Self>, pid: u32, fd: Arc<OwnedFd>, pty: bool) {
        let async_fd = match AsyncFd::with_interest(WatchedFd(fd), Interest::READABLE) {
            Ok(async_fd) => async_fd,
            Err(e) => {
                error!("Cannot watch output fd of pid {}: {}", pid, e);
                self.output_finished(pid);
                return;
            }
        };

        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let mut guard = match async_fd.readable().await {
                Ok(guard) => guard,
                Err(_) => break,
            };

            let n = unsafe {
                nix::libc::read(
                    async_fd.get_ref().as_raw_fd(),
                    buf.as_mut_ptr() as *mut nix::libc::c_void,
                    READ_BUF_SIZE,
                )
            };

            if n == 0 {
                if !pty {
                    trace!("Task #{} finished its output.", self.job_id);
                    break;
                }
                // A pty master signals child exit with -1/EIO, not EOF.
                guard.clear_ready();
                continue;
            }
            if n < 0 {
                match Errno::last() {
                    Errno::EAGAIN => {
                        guard.clear_ready();
                        continue;
                    }
                    Errno::EIO if pty => {
                        trace!("Read EOF from pty task #{}", self.job_id);
                        break;
                    }
                    errno => {
                        error!(
                            "Error when reading task #{} output: {}",
                            self.job_id, errno
                        );
                        break;
                    }
                }
            }

            let chunk = buf[..n as usize].to_vec();
            let tx = self.output_tx.lock().clone();
            match tx {
                Some(tx) => {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }

        self.output_finished(pid);
    }

    fn output_finished(&self, pid: u32) {
        let all_done = {
            let mut map = self.fwd_map.lock();
            if let Some(meta) = map.get_mut(&pid) {
                meta.output_stopped = true;
            }
            map.values().all(|meta| meta.output_stopped)
        };
        if all_done {
            debug!(
                "Task #{} on cfored {} finished its output.",
                self.job_id, self.cfored_name
            );
            let _ = self.outputs_done.send(true);
        }
    }

    /// Record a reaped child. Returns true when its output is already
    /// drained and unregistering may proceed.
    pub fn task_process_stop(&self, pid: u32) -> bool {
        let mut map = self.fwd_map.lock();
        match map.get_mut(&pid) {
            Some(meta) => {
                meta.proc_stopped = true;
                meta.output_stopped
            }
            None => true,
        }
    }

    /// Wait (bounded) until every registered output hit EOF.
    pub async fn wait_outputs_drained(&self, timeout: Duration) {
        let mut rx = self.outputs_done.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = tokio::time::timeout(timeout, rx.changed()).await;
    }

    /// Drain-then-unregister: close the output queue, wait for the drain
    /// task, send UNREGISTER and await its reply.
    pub async fn drain_and_unregister(&self) {
        self.stopped.store(true, Ordering::Release);

        let output_tx = self.output_tx.lock().take();
        drop(output_tx);
        let drain = self.drain_task.lock().take();
        if let Some(drain) = drain {
            let _ = drain.await;
        }

        debug!("Unregistering on cfored {}.", self.cfored_name);
        self.unregistering.store(true, Ordering::Release);
        let unregister = StreamTaskIoRequest {
            r#type: stream_task_io_request::Type::SupervisorUnregister as i32,
            payload: Some(stream_task_io_request::Payload::PayloadUnregisterReq(
                stream_task_io_request::UnregisterPayload {
                    craned_id: self.craned_id.clone(),
                    task_id: self.job_id,
                    step_id: self.step_id,
                },
            )),
        };
        if self.req_tx.send(unregister).await.is_err() {
            warn!("Cfored stream already closed before unregister");
            self.unregister_rx.lock().take();
            return;
        }

        let rx = self.unregister_rx.lock().take();
        if let Some(rx) = rx {
            if tokio::time::timeout(UNREGISTER_TIMEOUT, rx).await.is_err() {
                warn!("Timed out waiting for UNREGISTER_REPLY from {}", self.cfored_name);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> CraneResult<()> {
    unsafe {
        let flags = nix::libc::fcntl(fd, nix::libc::F_GETFL);
        if flags < 0 {
            return Err(CraneError::System("F_GETFL failed".to_string()));
        }
        if nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK) < 0 {
            return Err(CraneError::System("F_SETFL failed".to_string()));
        }
    }
    Ok(())
}

/// Write the whole buffer, retrying partial writes and EAGAIN. Returns
/// false on a broken pipe or other hard error.
async fn write_all_retry(fd: RawFd, buf: &[u8]) -> bool {
    let mut sent = 0;
    while sent < buf.len() {
        let n = unsafe {
            nix::libc::write(
                fd,
                buf[sent..].as_ptr() as *const nix::libc::c_void,
                buf.len() - sent,
            )
        };
        if n >= 0 {
            sent += n as usize;
            continue;
        }
        match Errno::last() {
            Errno::EAGAIN => tokio::time::sleep(Duration::from_millis(10)).await,
            Errno::EINTR => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_all_retry_handles_partial_writes() {
        let (read_end, write_end) =
            nix::unistd::pipe().expect("pipe");
        set_nonblocking(write_end.as_raw_fd()).unwrap();

        let payload = b"hello\n";
        assert!(write_all_retry(write_end.as_raw_fd(), payload).await);

        let mut buf = [0u8; 16];
        let n = unsafe {
            nix::libc::read(
                read_end.as_raw_fd(),
                buf.as_mut_ptr() as *mut nix::libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(&buf[..n as usize], payload);
    }

    #[tokio::test]
    async fn test_write_all_retry_detects_broken_pipe() {
        let (read_end, write_end) = nix::unistd::pipe().expect("pipe");
        drop(read_end);
        set_nonblocking(write_end.as_raw_fd()).unwrap();

        // SIGPIPE must be ignored for EPIPE to surface as an errno.
        crate::core::os::ignore_sigpipe();
        assert!(!write_all_retry(write_end.as_raw_fd(), b"data").await);
    }
}
