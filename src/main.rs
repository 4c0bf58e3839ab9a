/*!
 * Craned - Main Entry Point
 *
 * Per-node execution agent:
 * - cgroup-backed resource enforcement
 * - job lifecycle through per-job Supervisors
 * - recovery of jobs that outlived an agent restart
 * - durable status channel to CraneCtld
 */

use craned::cgroup::bpf::BpfRegistry;
use craned::core::config::CranedConfig;
use craned::core::os;
use craned::core::types::JobId;
use craned::job::types::{JobSpec, JobStatusSpec, TaskSpec};
use craned::job::JobManager;
use craned::rpc::crane as proto;
use craned::server::{serve_tcp, serve_uds, CranedService, Readiness};
use craned::supervisor::SupervisorKeeper;
use craned::{init_logging, CgroupManager, CtldClient, DeviceRegistry};
use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

fn fatal(message: &str) -> ! {
    error!("{}", message);
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    init_logging("info");

    let mut config = CranedConfig::default();
    if let Ok(addr) = std::env::var("CRANE_CTLD_ADDR") {
        config.ctld_addr = addr;
    }
    if config.ctld_addr.is_empty() {
        fatal("CraneCtld address must be configured (CRANE_CTLD_ADDR)");
    }
    if let Ok(path) = std::env::var("CRANE_BPF_OBJECT") {
        config.bpf_object_path = Some(path.into());
    }

    info!("Craned starting on {}", config.craned_id);

    // Exactly one agent per node.
    let _lock_guard = match os::lock_singleton(&config.mutex_file()) {
        Ok(guard) => guard,
        Err(e) => fatal(&format!("Cannot acquire the craned mutex: {}", e)),
    };

    for dir in [config.script_dir(), config.supervisor_sock_dir()] {
        if let Err(e) = os::create_folders(&dir) {
            fatal(&format!("Cannot create {}: {}", dir.display(), e));
        }
    }

    // Broken pipes to spawned processes must not kill the agent.
    os::ignore_sigpipe();

    // Device discovery runs outside the core; its outputs would be
    // registered here before anything else touches the cgroup layer.
    let devices = Arc::new(DeviceRegistry::new());

    let bpf = config.bpf_object_path.as_ref().map(|path| {
        Arc::new(BpfRegistry::new(
            path.clone(),
            craned::cgroup::bpf::DEFAULT_PIN_DIR.into(),
            false,
        ))
    });

    info!("Initializing cgroup manager...");
    let cgroup = match CgroupManager::init(devices, bpf) {
        Ok(cgroup) => Arc::new(cgroup),
        Err(e) => fatal(&format!("Failed to initialize cgroup manager: {}", e)),
    };

    // Find Supervisors that survived a previous agent life.
    let (keeper, exit_rx) = SupervisorKeeper::new(config.clone());
    let alive_supervisors: HashMap<JobId, u32> = keeper.scan().await;
    if !alive_supervisors.is_empty() {
        info!(
            "Supervisors still running for jobs: {:?}",
            alive_supervisors.keys().collect::<Vec<_>>()
        );
    }

    let ctld = CtldClient::new(&config);
    let job_mgr = JobManager::new(config.clone(), Arc::clone(&cgroup), Arc::clone(&keeper), Arc::clone(&ctld));
    job_mgr.start(exit_rx);

    let readiness = Readiness::new();
    let (configure_tx, configure_rx) = oneshot::channel::<proto::ConfigureCranedRequest>();
    let service = CranedService::new(Arc::clone(&job_mgr), Arc::clone(&readiness), configure_tx);

    // Shutdown is signalled to both server frontends through a watch.
    let (stop_tx, stop_rx) = watch::channel(false);
    let wait_stop = |mut rx: watch::Receiver<bool>| async move {
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    };

    let listen_addr = match format!("{}:{}", config.listen_addr, config.listen_port)
        .parse::<std::net::SocketAddr>()
    {
        Ok(addr) => addr,
        Err(e) => fatal(&format!("Invalid listen address: {}", e)),
    };
    {
        let service = service.clone();
        let stop = wait_stop(stop_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = serve_tcp(service, listen_addr, stop).await {
                error!("gRPC server error: {}", e);
            }
        });
    }
    {
        let service = service.clone();
        let sock_path = config.craned_sock_path();
        let stop = wait_stop(stop_rx.clone());
        tokio::spawn(async move {
            if let Err(e) = serve_uds(service, &sock_path, stop).await {
                error!("Local gRPC server error: {}", e);
            }
        });
    }

    // Mirror controller connectivity into request gating.
    {
        let readiness = Arc::clone(&readiness);
        let mut connection = ctld.subscribe_connection();
        tokio::spawn(async move {
            loop {
                readiness.set_ctld_ready(*connection.borrow());
                if connection.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    info!("Connecting to CraneCtld and waiting for Configure...");
    ctld.start();

    let configure = match configure_rx.await {
        Ok(configure) => configure,
        Err(_) => fatal("Configure channel closed before recovery"),
    };

    // Recovery bookkeeping: controller jobs with a live Supervisor are
    // recovered; the rest are reported back as nonexistent. Local
    // Supervisors unknown to the controller are terminated.
    let mut recovered = Vec::new();
    let mut nonexistent_jobs = Vec::new();
    let mut local_only: HashSet<JobId> = alive_supervisors.keys().copied().collect();

    for (job_id, job_spec) in configure.job_map {
        if let Some(&task_pid) = alive_supervisors.get(&job_id) {
            local_only.remove(&job_id);
            let Some(task_spec) = configure.job_tasks_map.get(&job_id) else {
                warn!("Job #{} has no task spec in Configure", job_id);
                nonexistent_jobs.push(job_id);
                continue;
            };
            recovered.push(JobStatusSpec {
                job_spec: JobSpec::from(job_spec),
                task_spec: TaskSpec::from(task_spec.clone()),
                task_pid,
            });
        } else {
            nonexistent_jobs.push(job_id);
        }
    }

    for job_id in local_only {
        error!("Job #{} is not recorded in CraneCtld; terminating its Supervisor", job_id);
        if let Some(client) = keeper.client(job_id) {
            let _ = client.terminate().await;
        }
        keeper.forget(job_id);
    }

    let surviving: HashSet<JobId> = recovered.iter().map(|s| s.job_spec.job_id).collect();
    cgroup.recover_scan(&surviving);
    job_mgr.recover(recovered);

    readiness.finish_recover();
    if let Err(e) = ctld.craned_ready(nonexistent_jobs).await {
        warn!("CranedReady failed (will rely on reconnect): {}", e);
    }
    info!("Craned is ready");

    // SIGINT starts the cooperative shutdown.
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("SIGINT received, shutting down..."),
        Err(e) => error!("Cannot listen for SIGINT: {}", e),
    }

    job_mgr.shutdown().await;
    let _ = stop_tx.send(true);

    // Leave Supervisors a moment to report before the process exits.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    info!("Craned exiting");
    std::process::exit(0);
}
