/*!
 * Core Module
 * Shared types, error taxonomy, configuration and OS helpers
 */

pub mod config;
pub mod errors;
pub mod logger;
pub mod os;
pub mod passwd;
pub mod types;

pub use config::{CranedConfig, SupervisorConfig};
pub use errors::{exit_code, CraneError, CraneResult};
pub use passwd::PasswordEntry;
pub use types::{JobId, StepId};
