//! Execution results and their in-text markers.

use serde::Serialize;
use std::time::Duration;

use crate::directives::{Directive, DirectiveKind};
use crate::types::Error;

/// Why an execution did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    PermissionDenied,
    RateLimited,
    ApprovalRequired { approval_id: String },
    Timeout,
    /// Non-zero exit or a tool-reported error.
    Execution,
    Unsupported,
    NotFound,
    InvalidArguments,
    Connection,
    Internal,
}

impl FailureKind {
    fn from_error(error: &Error) -> Self {
        match error {
            Error::PermissionDenied(_) => FailureKind::PermissionDenied,
            Error::RateLimitExceeded(_) => FailureKind::RateLimited,
            Error::ApprovalRequired { approval_id } => FailureKind::ApprovalRequired {
                approval_id: approval_id.clone(),
            },
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Execution(_) => FailureKind::Execution,
            Error::Unsupported(_) => FailureKind::Unsupported,
            Error::NotFound(_) => FailureKind::NotFound,
            Error::Parse(_) | Error::Serialization(_) => FailureKind::InvalidArguments,
            Error::Connection(_) | Error::Io(_) => FailureKind::Connection,
            Error::Configuration(_)
            | Error::StateTransition(_)
            | Error::Cancelled(_)
            | Error::Internal(_) => FailureKind::Internal,
        }
    }
}

/// Outcome of one executed directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            failure: None,
            elapsed,
        }
    }

    pub fn failure(
        kind: FailureKind,
        error: impl Into<String>,
        output: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            failure: Some(kind),
            elapsed,
        }
    }

    /// Fold an error into a failed result. The message keeps the error's
    /// own wording without the category prefix.
    pub fn from_error(error: &Error, elapsed: Duration) -> Self {
        let message = match error {
            Error::PermissionDenied(m)
            | Error::RateLimitExceeded(m)
            | Error::Timeout(m)
            | Error::Execution(m)
            | Error::Unsupported(m)
            | Error::Parse(m)
            | Error::NotFound(m)
            | Error::Connection(m) => m.clone(),
            other => other.to_string(),
        };
        Self::failure(FailureKind::from_error(error), message, "", elapsed)
    }

    pub fn is_timeout(&self) -> bool {
        self.failure == Some(FailureKind::Timeout)
    }

    pub fn approval_id(&self) -> Option<&str> {
        match &self.failure {
            Some(FailureKind::ApprovalRequired { approval_id }) => Some(approval_id),
            _ => None,
        }
    }

    /// Human-readable body used in markers and tool messages.
    pub fn display_text(&self) -> String {
        let output = self.output.trim();
        if self.success {
            return if output.is_empty() {
                "(no output)".to_string()
            } else {
                output.to_string()
            };
        }
        let mut text = format!("Error: {}", self.error.as_deref().unwrap_or("unknown failure"));
        if !output.is_empty() {
            text.push('\n');
            text.push_str(output);
        }
        text
    }
}

/// Marker text inserted right after a directive's raw span.
pub fn render_marker(directive: &Directive, result: &ExecutionResult) -> String {
    match &directive.kind {
        DirectiveKind::CodeBlock { .. } => {
            format!("\n\n<code_output>\n{}\n</code_output>", result.display_text())
        }
        DirectiveKind::ToolInvocation { name, .. } => format!(
            "\n<tool_result name=\"{}\">\n{}\n</tool_result>",
            name,
            result.display_text()
        ),
    }
}
