//! Permission gateway: rules, rate limits, approvals and audit.
//!
//! `SecurityGateway` is the only entry point used by the rest of the runtime.
//! The leaf components are plain structs owned by the gateway and mutated via
//! `&mut self` under its lock; they are public so they can be tested and
//! reused in isolation.

mod approvals;
mod audit;
mod gateway;
mod operation;
mod rate_limiter;
mod rules;

pub use approvals::{ApprovalEvent, ApprovalOutcome, ApprovalRegistry, PendingApproval};
pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use gateway::{PermissionCheck, SecurityGateway, SecurityStatus, REASON_RATE_LIMITED};
pub use operation::{Operation, OperationKind};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use rules::{Decision, RuleEngine, SecurityRule};
