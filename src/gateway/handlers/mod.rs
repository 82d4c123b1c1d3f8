//! HTTP handlers
//!
//! - `transfer`: execute, status, cancel
//! - `health`: liveness and metrics
//! - `compensation`: operator views over the audit store

pub mod compensation;
pub mod health;
pub mod transfer;

pub use compensation::{get_stats, list_pending};
pub use health::{HealthResponse, health_check, metrics};
pub use transfer::{cancel_transfer, create_transfer, get_transfer};
