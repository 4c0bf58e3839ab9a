/*!
 * Supervisor Module
 * The per-job helper process and the agent-side keeper that discovers,
 * spawns and talks to it
 */

mod keeper;
mod server;
mod task;

pub use keeper::{connect_uds, SupervisorClient, SupervisorExit, SupervisorKeeper};
pub use server::{bind_uds, serve_uds, SupervisorService};
pub use task::{ExecutionSpec, TaskRunner};
