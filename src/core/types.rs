/*!
 * Core Types
 * Cluster-assigned identifiers shared across components
 */

/// Cluster-assigned job identifier.
pub type JobId = u32;

/// Step identifier inside a job. Currently one task per job, so step 0.
pub type StepId = u32;

/// Identifier of this agent inside the cluster (its hostname).
pub type CranedId = String;
