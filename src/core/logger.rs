/*!
 * Logging Setup
 * Structured subscriber shared by the agent and Supervisor binaries
 */

use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. Library modules log through the
/// `log` facade; the subscriber's compatibility layer picks those up.
/// Lines go to stderr: the Supervisor's stdout is its startup pipe.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
