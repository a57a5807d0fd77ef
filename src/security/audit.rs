//! Append-only audit trail of permission decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::operation::Operation;
use crate::types::ApprovalId;

/// What happened to an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    PendingApproval,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(operation: Operation, outcome: AuditOutcome, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            operation,
            outcome,
            approval_id: None,
            actor: None,
            reason: None,
        }
    }

    pub fn with_approval_id(mut self, id: ApprovalId) -> Self {
        self.approval_id = Some(id);
        self
    }

    pub fn with_actor(mut self, actor: Option<&str>) -> Self {
        self.actor = actor.map(str::to_string);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Bounded in-memory audit log with an optional JSONL mirror.
#[derive(Debug)]
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    max_entries: usize,
    mirror: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(max_entries: usize, mirror: Option<PathBuf>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            mirror,
        }
    }

    /// Append an entry, dropping the oldest past the retention cap.
    pub fn record(&mut self, entry: AuditEntry) {
        if let Some(path) = &self.mirror {
            if let Err(e) = append_jsonl(path, &entry) {
                tracing::warn!(path = %path.display(), error = %e, "failed to mirror audit entry");
            }
        }
        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Most recent entries in chronological order (all when `limit` is None).
    pub fn entries(&self, limit: Option<usize>) -> Vec<AuditEntry> {
        let skip = limit
            .map(|n| self.entries.len().saturating_sub(n))
            .unwrap_or(0);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_retention(&mut self, max_entries: usize, mirror: Option<PathBuf>) {
        self.max_entries = max_entries.max(1);
        self.mirror = mirror;
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }
}

fn append_jsonl(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tool: &str) -> AuditEntry {
        AuditEntry::new(
            Operation::tool_call("fs", tool, serde_json::Value::Null),
            AuditOutcome::Allowed,
            Utc::now(),
        )
    }

    #[test]
    fn test_oldest_entries_dropped_first() {
        let mut log = AuditLog::new(2, None);
        log.record(entry("a"));
        log.record(entry("b"));
        log.record(entry("c"));
        let tools: Vec<_> = log
            .entries(None)
            .into_iter()
            .map(|e| e.operation.tool.unwrap())
            .collect();
        assert_eq!(tools, vec!["b", "c"]);
    }

    #[test]
    fn test_entries_limit_returns_most_recent() {
        let mut log = AuditLog::new(10, None);
        for tool in ["a", "b", "c"] {
            log.record(entry(tool));
        }
        let recent = log.entries(Some(1));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].operation.tool.as_deref(), Some("c"));
        assert_eq!(log.entries(Some(10)).len(), 3);
    }

    #[test]
    fn test_jsonl_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut log = AuditLog::new(10, Some(path.clone()));
        log.record(entry("a").with_reason("ok"));
        log.record(entry("b"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.reason.as_deref(), Some("ok"));
    }

    #[test]
    fn test_mirror_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let mut log = AuditLog::new(10, Some(dir.path().to_path_buf()));
        log.record(entry("a"));
        assert_eq!(log.len(), 1);
    }
}
