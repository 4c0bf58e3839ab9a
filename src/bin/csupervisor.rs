/*!
 * Supervisor - Main Entry Point
 *
 * One process per job: owns the user child, its I/O plumbing and its
 * termination clock. Announces readiness on the startup pipe once the
 * per-job socket is listening.
 */

use craned::core::config::SupervisorConfig;
use craned::init_logging;
use craned::supervisor::{bind_uds, serve_uds, TaskRunner};
use log::{error, info};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::Notify;

fn parse_job_id() -> Option<u32> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == "--job-id" {
            return args.next()?.parse().ok();
        }
    }
    None
}

#[tokio::main]
async fn main() {
    init_logging("info");

    let Some(job_id) = parse_job_id() else {
        eprintln!("usage: csupervisor --job-id <id>");
        std::process::exit(1);
    };
    let config = SupervisorConfig::from_env(job_id);
    info!("Supervisor for job #{} starting", job_id);

    craned::core::os::ignore_sigpipe();

    let shutdown = Arc::new(Notify::new());
    let runner = TaskRunner::new(config.clone(), Arc::clone(&shutdown));
    runner.start_reaper();

    let sock_path = config.sock_path();
    let listener = match bind_uds(&sock_path) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {}: {}", sock_path.display(), e);
            std::process::exit(1);
        }
    };

    // The keeper waits for this line on the startup pipe.
    println!("ready");
    let _ = std::io::stdout().flush();

    let stop = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            shutdown.notified().await;
        }
    };
    if let Err(e) = serve_uds(runner, listener, &sock_path, stop).await {
        error!("Supervisor server failed: {}", e);
        std::process::exit(1);
    }

    info!("Supervisor for job #{} exiting", job_id);
}
