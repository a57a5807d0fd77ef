//! Stdio tool provider.
//!
//! Speaks newline-delimited JSON-RPC 2.0 over a child process's stdin/stdout.
//! A reader task routes responses to waiting requests by id and answers
//! server-initiated `ping` requests. The child is killed on shutdown or drop.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};

use super::provider::{ProviderLauncher, ToolProvider};
use super::types::{ResourceContent, ResourceInfo, ServerDescriptor, ToolInfo, ToolResponse};
use crate::types::{Error, Result};

const PROTOCOL_VERSION: &str = "2025-06-18";
const METHOD_NOT_FOUND: i64 = -32601;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// Launches [`StdioProvider`]s.
#[derive(Debug, Clone)]
pub struct StdioLauncher {
    request_timeout: Duration,
}

impl StdioLauncher {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl ProviderLauncher for StdioLauncher {
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolProvider>> {
        let provider = StdioProvider::spawn(descriptor, self.request_timeout).await?;
        Ok(Arc::new(provider))
    }
}

/// JSON-RPC connection to one child process.
#[derive(Debug)]
pub struct StdioProvider {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    server: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<BufWriter<ChildStdin>>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    alive: AtomicBool,
    request_timeout: Duration,
}

impl StdioProvider {
    /// Spawn the configured command and complete the `initialize` handshake.
    pub async fn spawn(descriptor: &ServerDescriptor, request_timeout: Duration) -> Result<Self> {
        let (program, args) = descriptor
            .command
            .split_first()
            .ok_or_else(|| Error::configuration(format!("server '{}' has no command", descriptor.name)))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &descriptor.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::connection(format!("failed to spawn server '{}': {}", descriptor.name, e))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::connection("failed to capture server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::connection("failed to capture server stdout"))?;

        let inner = Arc::new(Inner {
            server: descriptor.name.clone(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(BufWriter::new(stdin))),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            request_timeout,
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            reader.reader_loop(stdout).await;
        });

        let provider = Self { inner };
        if let Err(e) = provider.initialize().await {
            let _ = provider.shutdown().await;
            return Err(e);
        }
        Ok(provider)
    }

    async fn initialize(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.inner.request("initialize", params).await?;
        self.inner
            .notify("notifications/initialized", json!({}))
            .await?;
        tracing::debug!(server = %self.inner.server, "handshake complete");
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for StdioProvider {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.inner.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(tools)?)
    }

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        match self.inner.request("resources/list", json!({})).await {
            Ok(result) => {
                let resources = result.get("resources").cloned().unwrap_or_else(|| json!([]));
                Ok(serde_json::from_value(resources)?)
            }
            // Servers without resource support answer "method not found".
            Err(Error::Unsupported(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<ToolResponse> {
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        let result = self
            .inner
            .request("tools/call", json!({"name": tool, "arguments": arguments}))
            .await?;
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = result
            .get("content")
            .map(flatten_content)
            .unwrap_or_default();
        Ok(ToolResponse { content, is_error })
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContent> {
        let result = self
            .inner
            .request("resources/read", json!({"uri": uri}))
            .await?;
        let contents = result
            .get("contents")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mime_type = contents
            .iter()
            .find_map(|c| c.get("mimeType").and_then(Value::as_str))
            .map(str::to_string);
        Ok(ResourceContent {
            uri: uri.to_string(),
            content: flatten_content(&Value::Array(contents)),
            mime_type,
        })
    }

    async fn ping(&self) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::connection(format!(
                "server '{}' has exited",
                self.inner.server
            )));
        }
        self.inner.request("ping", json!({})).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.alive.store(false, Ordering::SeqCst);
        // Closing stdin asks a well-behaved server to exit.
        drop(self.inner.writer.lock().await.take());

        if let Some(mut child) = self.inner.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(server = %self.inner.server, error = %e, "failed to kill server process");
                    }
                }
            }
        }
        self.inner.fail_pending("server shut down").await;
        Ok(())
    }
}

impl Inner {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::connection(format!(
                "server '{}' dropped request '{}'",
                self.server, method
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::timeout(format!(
                    "server '{}' did not answer '{}' within {:?}",
                    self.server, method, self.request_timeout
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, payload: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::connection(format!("server '{}' is not connected", self.server)))?;
        writer
            .write_all(&line)
            .await
            .map_err(|e| Error::connection(format!("write to '{}' failed: {}", self.server, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::connection(format!("flush to '{}' failed: {}", self.server, e)))
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(raw)) = lines.next_line().await {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => self.dispatch(message).await,
                Err(e) => {
                    tracing::debug!(server = %self.server, line = trimmed, error = %e, "skipping non-JSON line");
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        self.fail_pending("server closed its output").await;
        tracing::debug!(server = %self.server, "reader loop finished");
    }

    async fn dispatch(&self, message: Value) {
        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str);

        match (id, method) {
            (Some(id), Some(method)) => self.answer_server_request(id, method).await,
            (Some(id), None) => self.complete(id, message).await,
            (None, Some(method)) => {
                tracing::debug!(server = %self.server, method, "notification from server");
            }
            (None, None) => {}
        }
    }

    async fn complete(&self, id: Value, message: Value) {
        let Some(key) = id.as_u64() else {
            return;
        };
        let Some(sender) = self.pending.lock().await.remove(&key) else {
            tracing::debug!(server = %self.server, id = key, "response for unknown request");
            return;
        };

        let outcome = match message.get("error") {
            Some(err) => {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(-32000);
                let text = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                if code == METHOD_NOT_FOUND {
                    Err(Error::unsupported(format!("{} ({})", text, self.server)))
                } else {
                    Err(Error::execution(format!("{} (code {})", text, code)))
                }
            }
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = sender.send(outcome);
    }

    async fn answer_server_request(&self, id: Value, method: &str) {
        let payload = if method == "ping" {
            json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            tracing::warn!(server = %self.server, method, "server sent unsupported request");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": METHOD_NOT_FOUND,
                    "message": format!("client does not implement method '{}'", method),
                }
            })
        };
        if let Err(e) = self.write_message(&payload).await {
            tracing::warn!(server = %self.server, error = %e, "failed to answer server request");
        }
    }

    async fn fail_pending(&self, reason: &str) {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, sender) in drained {
            let _ = sender.send(Err(Error::connection(format!("{}: {}", self.server, reason))));
        }
    }
}

/// Join MCP-style content items into text. Text items contribute their text,
/// other items their JSON form.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
