/*!
 * Cfored Module
 * Interactive-task I/O forwarding toward the remote fan-out service
 */

mod client;

pub use client::CforedClient;
