//! Security gateway.
//!
//! Composes block lists, server permission flags, the rate limiter, the rule
//! engine and the approval registry into one decision. Evaluation order is
//! fixed and short-circuiting:
//!
//! ```text
//! blocked lists / permission flags -> rate limiter -> rules
//!                                                     ├─ allowed  -> Allow
//!                                                     ├─ denied   -> Deny
//!                                                     └─ approval -> grant? Allow : Pending
//! ```
//!
//! Every decision is audited. All mutable state sits behind one async mutex so
//! the read-prune-append sequences in the limiter and registry never interleave.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::{broadcast, Mutex};

use super::approvals::{ApprovalEvent, ApprovalOutcome, ApprovalRegistry, PendingApproval};
use super::audit::{AuditEntry, AuditLog, AuditOutcome};
use super::operation::{Operation, OperationKind};
use super::rate_limiter::RateLimiter;
use super::rules::{Decision, RuleEngine, SecurityRule};
use crate::servers::ServerDescriptor;
use crate::types::{ApprovalId, Error, Result, SecurityConfig};

pub const REASON_RATE_LIMITED: &str = "Rate limit exceeded";

/// Result of a permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Denied because a rate window is exhausted.
    pub rate_limited: bool,
}

impl PermissionCheck {
    fn allow() -> Self {
        Self {
            allowed: true,
            requires_approval: false,
            approval_id: None,
            reason: None,
            rate_limited: false,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            requires_approval: false,
            approval_id: None,
            reason: Some(reason.into()),
            rate_limited: false,
        }
    }

    fn throttled() -> Self {
        Self {
            rate_limited: true,
            ..Self::deny(REASON_RATE_LIMITED)
        }
    }

    fn pending(id: ApprovalId) -> Self {
        Self {
            allowed: false,
            requires_approval: true,
            reason: Some(format!("Approval required ({})", id)),
            approval_id: Some(id),
            rate_limited: false,
        }
    }

    /// Convert into the error taxonomy: Ok only when allowed.
    pub fn into_result(self) -> Result<()> {
        if self.allowed {
            return Ok(());
        }
        let reason = self.reason.unwrap_or_else(|| "denied".to_string());
        if self.requires_approval {
            let approval_id = self
                .approval_id
                .map(|id| id.to_string())
                .unwrap_or_default();
            return Err(Error::ApprovalRequired { approval_id });
        }
        if self.rate_limited {
            return Err(Error::rate_limited(reason));
        }
        Err(Error::permission_denied(reason))
    }
}

/// Snapshot of gateway state for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityStatus {
    pub rules: usize,
    pub default_decision: Decision,
    pub pending_approvals: usize,
    pub blocked_servers: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub blocked_resources: Vec<String>,
    pub audit_entries: usize,
}

#[derive(Debug, Default)]
struct BlockLists {
    servers: HashSet<String>,
    tools: HashSet<String>,
    resources: HashSet<String>,
}

impl BlockLists {
    fn from_config(config: &SecurityConfig) -> Self {
        Self {
            servers: config.blocked_servers.iter().cloned().collect(),
            tools: config.blocked_tools.iter().cloned().collect(),
            resources: config.blocked_resources.iter().cloned().collect(),
        }
    }

    fn reason_for(&self, op: &Operation) -> Option<&'static str> {
        if self.servers.contains(&op.server) {
            return Some("Server is blocked");
        }
        if op.tool.as_ref().is_some_and(|t| self.tools.contains(t)) {
            return Some("Tool is blocked");
        }
        if op.resource.as_ref().is_some_and(|r| self.resources.contains(r)) {
            return Some("Resource is blocked");
        }
        None
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut v: Vec<_> = set.iter().cloned().collect();
    v.sort();
    v
}

#[derive(Debug)]
struct GatewayState {
    rules: RuleEngine,
    limiter: RateLimiter,
    approvals: ApprovalRegistry,
    blocked: BlockLists,
    /// Declared per-server permission flags (`execute`, `read`).
    permissions: HashMap<String, BTreeMap<String, bool>>,
}

impl GatewayState {
    fn permission_flag_denial(&self, op: &Operation) -> Option<String> {
        let flag = match op.kind {
            OperationKind::ToolCall => "execute",
            OperationKind::ResourceRead => "read",
            OperationKind::ServerStart | OperationKind::ServerStop => return None,
        };
        let granted = self
            .permissions
            .get(&op.server)
            .and_then(|p| p.get(flag))
            .copied()
            .unwrap_or(true);
        (!granted).then(|| format!("Server '{}' does not grant '{}' permission", op.server, flag))
    }

    fn audit_denied(&mut self, op: &Operation, reason: &str, now: DateTime<Utc>) {
        tracing::info!(kind = %op.kind, target = %op.target(), reason, "operation denied");
        self.approvals.audit_mut().record(
            AuditEntry::new(op.clone(), AuditOutcome::Denied, now).with_reason(reason),
        );
    }

    fn check(&mut self, op: &Operation, context: Value, now: DateTime<Utc>) -> PermissionCheck {
        if let Some(reason) = self.blocked.reason_for(op) {
            self.audit_denied(op, reason, now);
            return PermissionCheck::deny(reason);
        }
        if let Some(reason) = self.permission_flag_denial(op) {
            self.audit_denied(op, &reason, now);
            return PermissionCheck::deny(reason);
        }

        if !self.limiter.try_consume_at(&op.server, now) {
            self.audit_denied(op, REASON_RATE_LIMITED, now);
            return PermissionCheck::throttled();
        }

        let matched = self.rules.matching_rule(op).map(|r| (r.name.clone(), r.decision));
        let decision = match &matched {
            Some((name, decision)) => {
                tracing::debug!(rule = %name, kind = %op.kind, target = %op.target(), "security rule matched");
                *decision
            }
            None => self.rules.default_decision(),
        };

        match decision {
            Decision::Allowed => {
                let mut entry = AuditEntry::new(op.clone(), AuditOutcome::Allowed, now);
                if let Some((name, _)) = &matched {
                    entry = entry.with_reason(format!("rule '{}'", name));
                }
                self.approvals.audit_mut().record(entry);
                PermissionCheck::allow()
            }
            Decision::Denied => {
                let reason = match &matched {
                    Some((name, _)) => format!("Permission denied by security rule '{}'", name),
                    None => "Permission denied by default policy".to_string(),
                };
                self.audit_denied(op, &reason, now);
                PermissionCheck::deny(reason)
            }
            Decision::RequireApproval => {
                let id = op.approval_id();
                if self.approvals.take_grant(&id, now) {
                    self.approvals.audit_mut().record(
                        AuditEntry::new(op.clone(), AuditOutcome::Allowed, now)
                            .with_approval_id(id)
                            .with_reason("previously approved"),
                    );
                    return PermissionCheck::allow();
                }
                let id = self.approvals.create_at(op.clone(), context, now);
                PermissionCheck::pending(id)
            }
        }
    }
}

/// The single owner of all security state. Share it behind an `Arc`.
#[derive(Debug)]
pub struct SecurityGateway {
    state: Mutex<GatewayState>,
}

impl SecurityGateway {
    pub fn new(config: &SecurityConfig) -> Result<Self> {
        Self::with_servers(config, &[])
    }

    /// Build a gateway that also enforces the descriptors' permission flags.
    pub fn with_servers(config: &SecurityConfig, servers: &[ServerDescriptor]) -> Result<Self> {
        let rules = RuleEngine::new(&config.rules, config.default_decision)?;
        let audit = AuditLog::new(config.max_audit_entries, config.audit_file.clone());
        Ok(Self {
            state: Mutex::new(GatewayState {
                rules,
                limiter: RateLimiter::new(config.rate_limits.clone()),
                approvals: ApprovalRegistry::new(config.approval_ttl, audit),
                blocked: BlockLists::from_config(config),
                permissions: permissions_of(servers),
            }),
        })
    }

    /// Decide an operation.
    pub async fn check_permission(&self, operation: &Operation) -> PermissionCheck {
        self.check_permission_with_context(operation, Value::Null).await
    }

    /// Decide an operation; `context` is stored with any approval it creates.
    pub async fn check_permission_with_context(
        &self,
        operation: &Operation,
        context: Value,
    ) -> PermissionCheck {
        let mut state = self.state.lock().await;
        state.check(operation, context, Utc::now())
    }

    // =========================================================================
    // Approvals
    // =========================================================================

    pub async fn approve(&self, id: &ApprovalId, actor: Option<&str>) -> bool {
        self.state.lock().await.approvals.approve(id, actor)
    }

    pub async fn reject(&self, id: &ApprovalId, reason: Option<&str>, actor: Option<&str>) -> bool {
        self.state.lock().await.approvals.reject(id, reason, actor)
    }

    pub async fn resolve(
        &self,
        id: &ApprovalId,
        outcome: ApprovalOutcome,
        actor: Option<&str>,
    ) -> bool {
        self.state.lock().await.approvals.resolve(id, outcome, actor)
    }

    pub async fn list_pending(&self) -> Vec<PendingApproval> {
        self.state.lock().await.approvals.list_pending()
    }

    pub async fn subscribe_approvals(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.state.lock().await.approvals.subscribe()
    }

    pub async fn audit_entries(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        self.state.lock().await.approvals.audit().entries(limit)
    }

    // =========================================================================
    // Block lists
    // =========================================================================

    pub async fn block_server(&self, name: &str) {
        tracing::warn!(server = name, "server blocked");
        self.state.lock().await.blocked.servers.insert(name.to_string());
    }

    pub async fn unblock_server(&self, name: &str) -> bool {
        let removed = self.state.lock().await.blocked.servers.remove(name);
        if removed {
            tracing::info!(server = name, "server unblocked");
        }
        removed
    }

    pub async fn block_tool(&self, name: &str) {
        tracing::warn!(tool = name, "tool blocked");
        self.state.lock().await.blocked.tools.insert(name.to_string());
    }

    pub async fn unblock_tool(&self, name: &str) -> bool {
        let removed = self.state.lock().await.blocked.tools.remove(name);
        if removed {
            tracing::info!(tool = name, "tool unblocked");
        }
        removed
    }

    pub async fn block_resource(&self, uri: &str) {
        tracing::warn!(resource = uri, "resource blocked");
        self.state.lock().await.blocked.resources.insert(uri.to_string());
    }

    pub async fn unblock_resource(&self, uri: &str) -> bool {
        let removed = self.state.lock().await.blocked.resources.remove(uri);
        if removed {
            tracing::info!(resource = uri, "resource unblocked");
        }
        removed
    }

    // =========================================================================
    // Policy
    // =========================================================================

    pub async fn add_rule(&self, rule: SecurityRule) -> Result<()> {
        let name = rule.name.clone();
        self.state.lock().await.rules.add_rule(rule)?;
        tracing::info!(rule = %name, "security rule added");
        Ok(())
    }

    pub async fn remove_rule(&self, name: &str) -> bool {
        self.state.lock().await.rules.remove_rule(name)
    }

    pub async fn rules(&self) -> Vec<SecurityRule> {
        self.state.lock().await.rules.rules().cloned().collect()
    }

    /// Swap the whole policy snapshot. Pending approvals, grants, rate
    /// history and the audit trail are kept.
    pub async fn apply_config(
        &self,
        config: &SecurityConfig,
        servers: &[ServerDescriptor],
    ) -> Result<()> {
        let rules = RuleEngine::new(&config.rules, config.default_decision)?;
        let mut state = self.state.lock().await;
        state.rules = rules;
        state.blocked = BlockLists::from_config(config);
        state.permissions = permissions_of(servers);
        state.limiter.set_config(config.rate_limits.clone());
        state.approvals.set_ttl(config.approval_ttl);
        state
            .approvals
            .set_audit_retention(config.max_audit_entries, config.audit_file.clone());
        tracing::info!(rules = state.rules.len(), "security policy reloaded");
        Ok(())
    }

    pub async fn status(&self) -> SecurityStatus {
        let mut state = self.state.lock().await;
        let pending_approvals = state.approvals.list_pending().len();
        SecurityStatus {
            rules: state.rules.len(),
            default_decision: state.rules.default_decision(),
            pending_approvals,
            blocked_servers: sorted(&state.blocked.servers),
            blocked_tools: sorted(&state.blocked.tools),
            blocked_resources: sorted(&state.blocked.resources),
            audit_entries: state.approvals.audit().len(),
        }
    }
}

fn permissions_of(servers: &[ServerDescriptor]) -> HashMap<String, BTreeMap<String, bool>> {
    servers
        .iter()
        .map(|s| (s.name.clone(), s.permissions.clone()))
        .collect()
}
