//! Operation descriptors checked by the gateway.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::ApprovalId;

/// Kind of operation a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ToolCall,
    ResourceRead,
    ServerStart,
    ServerStop,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::ToolCall => "tool_call",
            OperationKind::ResourceRead => "resource_read",
            OperationKind::ServerStart => "server_start",
            OperationKind::ServerStop => "server_stop",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single operation presented to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
}

impl Operation {
    pub fn tool_call(server: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            kind: OperationKind::ToolCall,
            server: server.into(),
            tool: Some(tool.into()),
            resource: None,
            arguments,
        }
    }

    pub fn resource_read(server: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::ResourceRead,
            server: server.into(),
            tool: None,
            resource: Some(uri.into()),
            arguments: Value::Null,
        }
    }

    pub fn server_start(server: impl Into<String>) -> Self {
        Self::bare(OperationKind::ServerStart, server)
    }

    pub fn server_stop(server: impl Into<String>) -> Self {
        Self::bare(OperationKind::ServerStop, server)
    }

    fn bare(kind: OperationKind, server: impl Into<String>) -> Self {
        Self {
            kind,
            server: server.into(),
            tool: None,
            resource: None,
            arguments: Value::Null,
        }
    }

    /// Canonical byte form used for content hashing.
    ///
    /// `serde_json::Map` keeps keys sorted, so argument objects that differ only
    /// in key order serialize identically.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let canonical = serde_json::json!({
            "kind": self.kind.as_str(),
            "server": self.server,
            "tool": self.tool,
            "resource": self.resource,
            "arguments": self.arguments,
        });
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    /// Content-derived approval id for this operation.
    pub fn approval_id(&self) -> ApprovalId {
        ApprovalId::from_content(&self.canonical_bytes())
    }

    /// Short human-readable target (`server/tool`, `server:uri` or `server`).
    pub fn target(&self) -> String {
        match (&self.tool, &self.resource) {
            (Some(tool), _) => format!("{}/{}", self.server, tool),
            (None, Some(uri)) => format!("{}:{}", self.server, uri),
            (None, None) => self.server.clone(),
        }
    }
}
