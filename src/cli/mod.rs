//! Control-plane client commands.

mod client;
pub mod status;
mod status_format;

pub use client::{CliError, CliIpcClient};
pub use status::{run_status, HealthState, SystemStatus};
