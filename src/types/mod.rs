//! Core types for the agent runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SessionId, ApprovalId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration snapshot for security, lifecycle, turn loop and sandbox

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ExecutorConfig, LifecycleConfig, ObservabilityConfig, OrchestratorConfig,
    SecurityConfig,
};
pub use errors::{Error, Result};
pub use ids::{ApprovalId, SessionId};
