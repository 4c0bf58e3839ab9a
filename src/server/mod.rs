/*!
 * Server Module
 * The agent's own gRPC surface toward the controller and its Supervisors
 */

mod service;

pub use service::{serve_tcp, serve_uds, CranedService, Readiness, RequestSource};
