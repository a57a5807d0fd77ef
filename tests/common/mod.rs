//! Shared fakes for integration tests.

#![allow(dead_code)]

use agent_runtime::llm::{ChunkStream, Generation, LlmProvider, Message, StreamChunk};
use agent_runtime::servers::{
    ProviderLauncher, ResourceContent, ResourceInfo, ServerDescriptor, ToolInfo, ToolProvider,
    ToolResponse,
};
use agent_runtime::{Config, Error, Result, Runtime};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Language model
// =============================================================================

/// Replies from a queue; once empty, repeats `repeat` (or an empty reply).
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<String>>,
    pub repeat: Option<String>,
    pub chunk_size: usize,
    pub completions: Mutex<VecDeque<String>>,
    pub supports_completion: bool,
    pub seen: Mutex<Vec<Vec<Message>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            chunk_size: 4,
            ..Self::default()
        }
    }

    pub fn repeating(reply: &str) -> Self {
        Self {
            repeat: Some(reply.to_string()),
            chunk_size: 4,
            ..Self::default()
        }
    }

    pub fn with_completions(mut self, completions: &[&str]) -> Self {
        self.supports_completion = true;
        self.completions = Mutex::new(completions.iter().map(|s| s.to_string()).collect());
        self
    }

    fn next(&self, messages: &[Message]) -> String {
        self.seen.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.repeat.clone())
            .unwrap_or_default()
    }

    pub fn requests(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate(&self, messages: &[Message]) -> Result<Generation> {
        Ok(Generation::new(self.next(messages)))
    }

    async fn generate_stream(&self, messages: &[Message]) -> Result<ChunkStream> {
        let chars: Vec<char> = self.next(messages).chars().collect();
        let mut chunks: Vec<Result<StreamChunk>> = chars
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(StreamChunk::text(c.iter().collect::<String>())))
            .collect();
        chunks.push(Ok(StreamChunk::last("", None)));
        Ok(stream::iter(chunks).boxed())
    }

    fn supports_completion(&self) -> bool {
        self.supports_completion
    }

    async fn completion(&self, prompt: &str, _stop: &[String], _max_tokens: u32) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::connection("no completion scripted"))
    }
}

// =============================================================================
// Tool provider
// =============================================================================

/// In-memory provider with `add`, `echo` and `fail` tools and one resource.
#[derive(Debug)]
pub struct MemoryProvider {
    pub calls: Arc<AtomicUsize>,
    pub unhealthy: Arc<AtomicBool>,
}

#[async_trait]
impl ToolProvider for MemoryProvider {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        Ok(vec![
            ToolInfo::new(
                "add",
                "Add two integers",
                json!({
                    "type": "object",
                    "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                    "required": ["a", "b"]
                }),
            ),
            ToolInfo::new("echo", "Echo the arguments", json!({"type": "object"})),
            ToolInfo::new("fail", "Always reports an error", Value::Null),
        ])
    }

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        Ok(vec![ResourceInfo {
            uri: "mem://greeting".into(),
            name: "greeting".into(),
            mime_type: Some("text/plain".into()),
        }])
    }

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<ToolResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match tool {
            "add" => {
                let a = arguments["a"].as_i64().unwrap_or(0);
                let b = arguments["b"].as_i64().unwrap_or(0);
                Ok(ToolResponse::ok((a + b).to_string()))
            }
            "echo" => Ok(ToolResponse::ok(arguments.to_string())),
            "fail" => Ok(ToolResponse::error("tool exploded")),
            other => Err(Error::unsupported(format!("unknown tool {}", other))),
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceContent> {
        Ok(ResourceContent {
            uri: uri.to_string(),
            content: "hello from memory".into(),
            mime_type: Some("text/plain".into()),
        })
    }

    async fn ping(&self) -> Result<()> {
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(Error::connection("gone"))
        } else {
            Ok(())
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Launches [`MemoryProvider`]s and counts launches.
#[derive(Debug, Default)]
pub struct MemoryLauncher {
    pub launches: AtomicUsize,
    pub fail: AtomicBool,
    pub calls: Arc<AtomicUsize>,
    pub unhealthy: Arc<AtomicBool>,
}

impl MemoryLauncher {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderLauncher for MemoryLauncher {
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolProvider>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} refused to start", descriptor.name)));
        }
        Ok(Arc::new(MemoryProvider {
            calls: Arc::clone(&self.calls),
            unhealthy: Arc::clone(&self.unhealthy),
        }))
    }
}

// =============================================================================
// Runtime helpers
// =============================================================================

/// Config with one in-memory server named `math` and no restart delay.
pub fn config_with_math_server() -> Config {
    let mut config = Config::default();
    config
        .servers
        .push(ServerDescriptor::new("math", vec!["memory".into()]));
    config.lifecycle.restart_delay = Duration::ZERO;
    config
}

pub async fn started_runtime(config: Config) -> (Runtime, Arc<MemoryLauncher>) {
    let launcher = Arc::new(MemoryLauncher::default());
    let runtime = Runtime::with_launcher(config, launcher.clone()).unwrap();
    runtime.servers().start_all().await;
    (runtime, launcher)
}

pub fn has_program(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
