//! Human approval registry.
//!
//! Pending approvals are keyed by a content hash of the operation, so
//! identical requests collapse to one entry. Expiry is evaluated lazily on
//! read; there is no timer. Every `create` and every resolution of a known id
//! appends exactly one audit entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::broadcast;

use super::audit::{AuditEntry, AuditLog, AuditOutcome};
use super::operation::Operation;
use crate::types::ApprovalId;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: ApprovalId,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
}

/// Notification published for approval state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalEvent {
    Requested(PendingApproval),
    Resolved {
        id: ApprovalId,
        outcome: ApprovalOutcome,
        actor: Option<String>,
    },
    Expired(ApprovalId),
}

/// Pending approvals, one-shot grants and the audit log.
#[derive(Debug)]
pub struct ApprovalRegistry {
    pending: HashMap<ApprovalId, PendingApproval>,
    /// Approved operations not yet retried, with their own expiry.
    grants: HashMap<ApprovalId, DateTime<Utc>>,
    ttl: chrono::Duration,
    audit: AuditLog,
    events: broadcast::Sender<ApprovalEvent>,
}

impl ApprovalRegistry {
    pub fn new(ttl: std::time::Duration, audit: AuditLog) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            pending: HashMap::new(),
            grants: HashMap::new(),
            ttl: to_chrono(ttl),
            audit,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }

    pub fn set_ttl(&mut self, ttl: std::time::Duration) {
        self.ttl = to_chrono(ttl);
    }

    pub fn set_audit_retention(&mut self, max_entries: usize, mirror: Option<PathBuf>) {
        self.audit.set_retention(max_entries, mirror);
    }

    /// Register an operation awaiting approval and return its id.
    ///
    /// Re-requesting an identical live operation returns the existing id.
    pub fn create(&mut self, operation: Operation, context: Value) -> ApprovalId {
        self.create_at(operation, context, Utc::now())
    }

    pub fn create_at(
        &mut self,
        operation: Operation,
        context: Value,
        now: DateTime<Utc>,
    ) -> ApprovalId {
        let id = operation.approval_id();

        let reused = self
            .pending
            .get(&id)
            .map(|p| !p.is_expired(now))
            .unwrap_or(false);

        if reused {
            tracing::debug!(approval_id = %id, target = %operation.target(), "approval already pending");
        } else {
            let pending = PendingApproval {
                id: id.clone(),
                operation: operation.clone(),
                context,
                created_at: now,
                expires_at: now + self.ttl,
            };
            tracing::info!(
                approval_id = %id,
                kind = %operation.kind,
                target = %operation.target(),
                "approval requested"
            );
            let _ = self.events.send(ApprovalEvent::Requested(pending.clone()));
            self.pending.insert(id.clone(), pending);
        }

        self.audit.record(
            AuditEntry::new(operation, AuditOutcome::PendingApproval, now)
                .with_approval_id(id.clone())
                .with_reason("awaiting approval"),
        );
        id
    }

    /// Resolve a pending approval exactly once.
    ///
    /// Returns false for unknown or already-resolved ids, and for expired
    /// entries (which are purged and audited as expired).
    pub fn resolve(
        &mut self,
        id: &ApprovalId,
        outcome: ApprovalOutcome,
        actor: Option<&str>,
    ) -> bool {
        self.resolve_at(id, outcome, actor, None, Utc::now())
    }

    pub fn approve(&mut self, id: &ApprovalId, actor: Option<&str>) -> bool {
        self.resolve(id, ApprovalOutcome::Approved, actor)
    }

    pub fn reject(&mut self, id: &ApprovalId, reason: Option<&str>, actor: Option<&str>) -> bool {
        self.resolve_at(id, ApprovalOutcome::Rejected, actor, reason, Utc::now())
    }

    pub fn resolve_at(
        &mut self,
        id: &ApprovalId,
        outcome: ApprovalOutcome,
        actor: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(pending) = self.pending.remove(id) else {
            tracing::debug!(approval_id = %id, "resolve on unknown approval");
            return false;
        };

        if pending.is_expired(now) {
            self.record_expired(pending, now);
            return false;
        }

        let audit_outcome = match outcome {
            ApprovalOutcome::Approved => {
                self.grants.insert(id.clone(), now + self.ttl);
                AuditOutcome::Approved
            }
            ApprovalOutcome::Rejected => AuditOutcome::Rejected,
        };

        tracing::info!(approval_id = %id, ?outcome, actor = actor.unwrap_or("-"), "approval resolved");

        let mut entry = AuditEntry::new(pending.operation, audit_outcome, now)
            .with_approval_id(id.clone())
            .with_actor(actor);
        if let Some(reason) = reason {
            entry = entry.with_reason(reason);
        }
        self.audit.record(entry);

        let _ = self.events.send(ApprovalEvent::Resolved {
            id: id.clone(),
            outcome,
            actor: actor.map(str::to_string),
        });
        true
    }

    /// Live pending approvals, oldest first. Expired entries are purged.
    pub fn list_pending(&mut self) -> Vec<PendingApproval> {
        self.list_pending_at(Utc::now())
    }

    pub fn list_pending_at(&mut self, now: DateTime<Utc>) -> Vec<PendingApproval> {
        self.evict_expired(now);
        let mut live: Vec<_> = self.pending.values().cloned().collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        live
    }

    pub fn get(&self, id: &ApprovalId) -> Option<&PendingApproval> {
        self.pending.get(id)
    }

    /// Consume a one-shot grant left by an approval. Expired grants are dropped.
    pub fn take_grant(&mut self, id: &ApprovalId, now: DateTime<Utc>) -> bool {
        match self.grants.remove(id) {
            Some(expires_at) => now < expires_at,
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn audit_mut(&mut self) -> &mut AuditLog {
        &mut self.audit
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<ApprovalId> = self
            .pending
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.id.clone())
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                self.record_expired(pending, now);
            }
        }
        self.grants.retain(|_, expires_at| now < *expires_at);
    }

    fn record_expired(&mut self, pending: PendingApproval, now: DateTime<Utc>) {
        tracing::info!(approval_id = %pending.id, "approval expired");
        let _ = self.events.send(ApprovalEvent::Expired(pending.id.clone()));
        self.audit.record(
            AuditEntry::new(pending.operation, AuditOutcome::Expired, now)
                .with_approval_id(pending.id)
                .with_reason("approval expired"),
        );
    }
}

fn to_chrono(ttl: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> ApprovalRegistry {
        ApprovalRegistry::new(Duration::from_secs(30 * 60), AuditLog::new(100, None))
    }

    fn delete_op() -> Operation {
        Operation::tool_call("fs", "delete", json!({"path": "/tmp/x"}))
    }

    #[test]
    fn test_identical_requests_share_id() {
        let mut registry = registry();
        let now = Utc::now();
        let a = registry.create_at(delete_op(), Value::Null, now);
        let b = registry.create_at(delete_op(), json!({"turn": 2}), now);
        assert_eq!(a, b);
        assert_eq!(registry.list_pending_at(now).len(), 1);
        // One audit entry per create call.
        assert_eq!(registry.audit().len(), 2);
    }

    #[test]
    fn test_resolve_removes_from_pending() {
        let mut registry = registry();
        let now = Utc::now();
        let id = registry.create_at(delete_op(), Value::Null, now);
        assert!(registry.resolve_at(&id, ApprovalOutcome::Approved, Some("alice"), None, now));
        assert!(registry.list_pending_at(now).is_empty());

        // Exactly once.
        assert!(!registry.resolve_at(&id, ApprovalOutcome::Rejected, None, None, now));

        let last = registry.audit().entries(Some(1)).remove(0);
        assert_eq!(last.outcome, AuditOutcome::Approved);
        assert_eq!(last.actor.as_deref(), Some("alice"));
    }

    #[test]
    fn test_expired_is_absent_and_denied() {
        let mut registry = registry();
        let created = Utc::now();
        let id = registry.create_at(delete_op(), Value::Null, created);

        let later = created + chrono::Duration::minutes(31);
        assert!(!registry.resolve_at(&id, ApprovalOutcome::Approved, None, None, later));
        assert!(registry.list_pending_at(later).is_empty());
        assert!(!registry.take_grant(&id, later));

        let last = registry.audit().entries(Some(1)).remove(0);
        assert_eq!(last.outcome, AuditOutcome::Expired);
    }

    #[test]
    fn test_list_pending_evicts_and_audits_expired() {
        let mut registry = registry();
        let created = Utc::now();
        registry.create_at(delete_op(), Value::Null, created);
        let later = created + chrono::Duration::minutes(30);
        assert!(registry.list_pending_at(later).is_empty());
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(
            registry.audit().entries(Some(1))[0].outcome,
            AuditOutcome::Expired
        );
    }

    #[test]
    fn test_expired_entry_is_recreated() {
        let mut registry = registry();
        let created = Utc::now();
        let first = registry.create_at(delete_op(), Value::Null, created);
        let later = created + chrono::Duration::hours(1);
        let second = registry.create_at(delete_op(), Value::Null, later);
        assert_eq!(first, second);
        let pending = registry.list_pending_at(later);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].created_at, later);
    }

    #[test]
    fn test_approval_leaves_single_use_grant() {
        let mut registry = registry();
        let now = Utc::now();
        let id = registry.create_at(delete_op(), Value::Null, now);
        assert!(!registry.take_grant(&id, now));
        registry.resolve_at(&id, ApprovalOutcome::Approved, None, None, now);
        assert!(registry.take_grant(&id, now));
        assert!(!registry.take_grant(&id, now));
    }

    #[test]
    fn test_rejection_leaves_no_grant() {
        let mut registry = registry();
        let now = Utc::now();
        let id = registry.create_at(delete_op(), Value::Null, now);
        registry.resolve_at(&id, ApprovalOutcome::Rejected, None, Some("too risky"), now);
        assert!(!registry.take_grant(&id, now));
        let last = registry.audit().entries(Some(1)).remove(0);
        assert_eq!(last.reason.as_deref(), Some("too risky"));
    }

    #[tokio::test]
    async fn test_events_published() {
        let mut registry = registry();
        let mut rx = registry.subscribe();
        let id = registry.create(delete_op(), Value::Null);
        registry.approve(&id, Some("bob"));

        assert!(matches!(rx.recv().await.unwrap(), ApprovalEvent::Requested(p) if p.id == id));
        match rx.recv().await.unwrap() {
            ApprovalEvent::Resolved { outcome, actor, .. } => {
                assert_eq!(outcome, ApprovalOutcome::Approved);
                assert_eq!(actor.as_deref(), Some("bob"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
