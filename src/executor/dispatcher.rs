//! Directive dispatch.
//!
//! Tool invocations go through the security gateway and then to the owning
//! server via the lifecycle manager; code blocks go to the sandboxed runner.
//! Every outcome, denials included, comes back as an `ExecutionResult`.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

use super::result::{ExecutionResult, FailureKind};
use super::sandbox::CodeRunner;
use crate::directives::{Directive, DirectiveKind};
use crate::recovery::guard;
use crate::security::{Operation, SecurityGateway};
use crate::servers::LifecycleManager;
use crate::types::{Error, Result};

#[derive(Debug, Clone)]
pub struct Dispatcher {
    gateway: Arc<SecurityGateway>,
    servers: Arc<LifecycleManager>,
    runner: CodeRunner,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<SecurityGateway>,
        servers: Arc<LifecycleManager>,
        runner: CodeRunner,
    ) -> Self {
        Self {
            gateway,
            servers,
            runner,
        }
    }

    pub fn runner(&self) -> &CodeRunner {
        &self.runner
    }

    /// Execute one directive.
    pub async fn execute(&self, directive: &Directive) -> ExecutionResult {
        match &directive.kind {
            DirectiveKind::CodeBlock { language, source } => {
                tracing::info!(language = %language, "executing code block");
                self.runner.run(language, source).await
            }
            DirectiveKind::ToolInvocation {
                name,
                arguments,
                server,
            } => {
                let context = json!({ "directive": directive.raw });
                self.invoke(server.as_deref(), name, arguments.clone(), context)
                    .await
            }
        }
    }

    /// Execute directives one after another, in order.
    pub async fn execute_all(&self, directives: &[Directive]) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(directives.len());
        for directive in directives {
            results.push(self.execute(directive).await);
        }
        results
    }

    /// Call a tool by name, resolving the owning server when not given.
    pub async fn call_tool(
        &self,
        server: Option<&str>,
        tool: &str,
        arguments: Map<String, Value>,
    ) -> ExecutionResult {
        self.invoke(server, tool, arguments, Value::Null).await
    }

    async fn invoke(
        &self,
        server: Option<&str>,
        tool: &str,
        arguments: Map<String, Value>,
        context: Value,
    ) -> ExecutionResult {
        let started = Instant::now();
        match self.try_invoke(server, tool, arguments, context).await {
            Ok(result) => ExecutionResult {
                elapsed: started.elapsed(),
                ..result
            },
            Err(e) => {
                tracing::info!(tool, code = e.code(), error = %e, "tool call not executed");
                ExecutionResult::from_error(&e, started.elapsed())
            }
        }
    }

    async fn try_invoke(
        &self,
        server: Option<&str>,
        tool: &str,
        arguments: Map<String, Value>,
        context: Value,
    ) -> Result<ExecutionResult> {
        let server = self.resolve_tool_server(server, tool).await?;
        if let Some(info) = self.servers.tool_info(&server, tool).await {
            guard("validate_arguments", || {
                validate_arguments(&info.input_schema, &arguments)
            })?;
        }

        let arguments = Value::Object(arguments);
        let operation = Operation::tool_call(&server, tool, arguments.clone());
        self.gateway
            .check_permission_with_context(&operation, context)
            .await
            .into_result()?;

        tracing::info!(server = %server, tool, "invoking tool");
        let response = self.servers.call_tool(&server, tool, arguments).await?;
        if response.is_error {
            return Ok(ExecutionResult::failure(
                FailureKind::Execution,
                response.content,
                "",
                Default::default(),
            ));
        }
        Ok(ExecutionResult::success(response.content, Default::default()))
    }

    async fn resolve_tool_server(&self, explicit: Option<&str>, tool: &str) -> Result<String> {
        match explicit {
            Some(name) => Ok(name.to_string()),
            None => self
                .servers
                .find_tool_server(tool)
                .await
                .ok_or_else(|| Error::not_found(format!("No running server provides tool '{}'", tool))),
        }
    }

    /// Read a resource through the gateway (`resource_read`).
    pub async fn read_resource(&self, uri: &str, server: Option<&str>) -> ExecutionResult {
        let started = Instant::now();
        let outcome = async {
            let server = match server {
                Some(name) => name.to_string(),
                None => self.servers.find_resource_server(uri).await.ok_or_else(|| {
                    Error::not_found(format!("No running server provides resource '{}'", uri))
                })?,
            };
            self.gateway
                .check_permission(&Operation::resource_read(&server, uri))
                .await
                .into_result()?;
            self.servers.read_resource(&server, uri).await
        }
        .await;

        match outcome {
            Ok(content) => ExecutionResult::success(content.content, started.elapsed()),
            Err(e) => ExecutionResult::from_error(&e, started.elapsed()),
        }
    }
}

/// Check arguments against a tool's declared input schema. Absent or
/// uncompilable schemas accept anything.
fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<()> {
    let declared = match schema {
        Value::Object(map) => !map.is_empty(),
        _ => false,
    };
    if !declared {
        return Ok(());
    }

    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "tool schema does not compile; skipping validation");
            return Ok(());
        }
    };
    let instance = Value::Object(arguments.clone());
    let messages: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| e.to_string())
        .collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(Error::parse(format!("invalid arguments: {}", messages.join("; "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_arguments() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "integer"}},
            "required": ["a"]
        });
        let ok: Map<String, Value> = serde_json::from_value(json!({"a": 1})).unwrap();
        let bad: Map<String, Value> = serde_json::from_value(json!({"a": "x"})).unwrap();
        assert!(validate_arguments(&schema, &ok).is_ok());
        let err = validate_arguments(&schema, &bad).unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
        assert!(validate_arguments(&schema, &Map::new()).is_err());
    }

    #[test]
    fn test_missing_schema_accepts_anything() {
        let args: Map<String, Value> = serde_json::from_value(json!({"x": [1, 2]})).unwrap();
        assert!(validate_arguments(&Value::Null, &args).is_ok());
        assert!(validate_arguments(&json!({}), &args).is_ok());
    }
}
