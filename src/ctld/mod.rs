/*!
 * Ctld Module
 * The agent's durable channel to the cluster controller
 */

mod client;

pub use client::CtldClient;
