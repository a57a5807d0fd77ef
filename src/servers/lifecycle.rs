//! Process lifecycle management for tool-provider servers.
//!
//! State machine per instance:
//!
//! ```text
//! Stopped --start--> Starting --handshake ok--> Running --probe fails / crash--> Error
//!                       |                          |                               |
//!                       +--launch fails--> Error   +--stop--> Stopped              +--restart--> Starting
//! ```
//!
//! The manager is the single owner of instance state. Each instance carries an
//! operation lock so only one start/stop/restart runs at a time per server;
//! readers take a short read lock on the state and never block behind a launch.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

use super::provider::{ProviderLauncher, RestartPolicy, ToolProvider};
use super::types::{
    Capabilities, ResourceContent, ResourceInfo, ServerDescriptor, ServerEvent, ServerInfo,
    ServerStatus, ToolInfo, ToolResponse,
};
use crate::recovery::guard_async;
use crate::types::{Error, LifecycleConfig, Result};

const EVENT_CAPACITY: usize = 128;

/// Mutable state of one server. Owned exclusively by the manager.
#[derive(Debug)]
struct ServerInstance {
    descriptor: ServerDescriptor,
    status: ServerStatus,
    /// Some iff status is Running.
    capabilities: Option<Capabilities>,
    provider: Option<Arc<dyn ToolProvider>>,
    restart_count: u32,
    last_restart: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ServerInstance {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            status: ServerStatus::Stopped,
            capabilities: None,
            provider: None,
            restart_count: 0,
            last_restart: None,
            last_error: None,
        }
    }

    fn set_running(&mut self, provider: Arc<dyn ToolProvider>, capabilities: Capabilities) {
        self.status = ServerStatus::Running;
        self.provider = Some(provider);
        self.capabilities = Some(capabilities);
        self.last_error = None;
    }

    fn set_error(&mut self, error: impl Into<String>) {
        self.status = ServerStatus::Error;
        self.capabilities = None;
        self.last_error = Some(error.into());
    }

    fn set_stopped(&mut self) {
        self.status = ServerStatus::Stopped;
        self.capabilities = None;
        self.provider = None;
    }

    fn info(&self) -> ServerInfo {
        let (tool_count, resource_count) = self
            .capabilities
            .as_ref()
            .map(|c| (c.tools.len(), c.resources.len()))
            .unwrap_or((0, 0));
        ServerInfo {
            name: self.descriptor.name.clone(),
            description: self.descriptor.description.clone(),
            status: self.status,
            enabled: self.descriptor.enabled,
            tool_count,
            resource_count,
            restart_count: self.restart_count,
            last_restart: self.last_restart,
            last_error: self.last_error.clone(),
        }
    }

    fn running_provider(&self) -> Result<Arc<dyn ToolProvider>> {
        match (&self.status, &self.provider) {
            (ServerStatus::Running, Some(provider)) => Ok(Arc::clone(provider)),
            _ => Err(Error::connection(format!(
                "server '{}' is not running ({})",
                self.descriptor.name, self.status
            ))),
        }
    }
}

#[derive(Debug)]
struct InstanceSlot {
    name: String,
    /// Serializes start/stop/restart for this instance.
    op: Mutex<()>,
    /// Restarts carried out so far; lets queued callers detect one that
    /// finished while they waited for `op`.
    restarts: AtomicU64,
    state: RwLock<ServerInstance>,
}

impl InstanceSlot {
    fn new(descriptor: ServerDescriptor) -> Arc<Self> {
        Arc::new(Self {
            name: descriptor.name.clone(),
            op: Mutex::new(()),
            restarts: AtomicU64::new(0),
            state: RwLock::new(ServerInstance::new(descriptor)),
        })
    }
}

/// Lifecycle manager - owner of all tool-provider instances.
///
/// Share it behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct LifecycleManager {
    launcher: Arc<dyn ProviderLauncher>,
    config: RwLock<LifecycleConfig>,
    /// Declaration order is preserved for tool resolution.
    slots: RwLock<Vec<Arc<InstanceSlot>>>,
    events: broadcast::Sender<ServerEvent>,
}

impl LifecycleManager {
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        config: LifecycleConfig,
        launcher: Arc<dyn ProviderLauncher>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            launcher,
            config: RwLock::new(config),
            slots: RwLock::new(descriptors.into_iter().map(InstanceSlot::new).collect()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub async fn config(&self) -> LifecycleConfig {
        self.config.read().await.clone()
    }

    async fn slot(&self, name: &str) -> Option<Arc<InstanceSlot>> {
        self.slots
            .read()
            .await
            .iter()
            .find(|s| s.name == name)
            .cloned()
    }

    async fn all_slots(&self) -> Vec<Arc<InstanceSlot>> {
        self.slots.read().await.clone()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Launch, handshake and cache capabilities. Failures leave the instance
    /// in Error and return false.
    pub async fn start(&self, name: &str) -> bool {
        let Some(slot) = self.slot(name).await else {
            tracing::warn!(server = name, "start requested for unknown server");
            return false;
        };
        let _op = slot.op.lock().await;
        self.start_locked(&slot).await
    }

    async fn start_locked(&self, slot: &InstanceSlot) -> bool {
        let descriptor = {
            let mut state = slot.state.write().await;
            if state.status == ServerStatus::Running {
                return true;
            }
            if !state.descriptor.enabled {
                tracing::warn!(server = %slot.name, "server is disabled");
                return false;
            }
            state.status = ServerStatus::Starting;
            state.capabilities = None;
            state.descriptor.clone()
        };

        tracing::info!(server = %slot.name, command = ?descriptor.command, "starting server");
        match self.launch_and_discover(&descriptor).await {
            Ok((provider, capabilities)) => {
                let tools = capabilities.tools.len();
                slot.state.write().await.set_running(provider, capabilities);
                tracing::info!(server = %slot.name, tools, "server running");
                self.emit(ServerEvent::Started {
                    server: slot.name.clone(),
                    tools,
                });
                true
            }
            Err(e) => {
                tracing::error!(server = %slot.name, error = %e, "server failed to start");
                slot.state.write().await.set_error(e.to_string());
                self.emit(ServerEvent::Failed {
                    server: slot.name.clone(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    async fn launch_and_discover(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<(Arc<dyn ToolProvider>, Capabilities)> {
        let provider = guard_async("launch", self.launcher.launch(descriptor)).await?;

        let tools = match guard_async("list_tools", provider.list_tools()).await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = provider.shutdown().await;
                return Err(e);
            }
        };
        let resources = match guard_async("list_resources", provider.list_resources()).await {
            Ok(resources) => resources,
            Err(e) => {
                tracing::debug!(server = %descriptor.name, error = %e, "resource listing unavailable");
                Vec::new()
            }
        };
        Ok((provider, Capabilities { tools, resources }))
    }

    /// Stop the instance. Returns false for unknown servers.
    pub async fn stop(&self, name: &str) -> bool {
        let Some(slot) = self.slot(name).await else {
            return false;
        };
        let _op = slot.op.lock().await;
        self.stop_locked(&slot).await;
        true
    }

    async fn stop_locked(&self, slot: &InstanceSlot) {
        let (provider, was) = {
            let mut state = slot.state.write().await;
            let provider = state.provider.take();
            let was = state.status;
            state.set_stopped();
            (provider, was)
        };
        if let Some(provider) = provider {
            if let Err(e) = guard_async("shutdown", provider.shutdown()).await {
                tracing::warn!(server = %slot.name, error = %e, "error while stopping server");
            }
        }
        if was != ServerStatus::Stopped {
            tracing::info!(server = %slot.name, "server stopped");
            self.emit(ServerEvent::Stopped {
                server: slot.name.clone(),
            });
        }
    }

    /// Stop and start again under the bounded restart policy.
    ///
    /// Refused (false, no launch) while the last failed restart is inside the
    /// cooldown window and the failure counter has reached the cap. A caller
    /// that queued behind another restart takes that restart's outcome
    /// instead of launching a second process.
    pub async fn restart(&self, name: &str) -> bool {
        self.restart_at(name, Utc::now()).await
    }

    pub async fn restart_at(&self, name: &str, now: DateTime<Utc>) -> bool {
        let Some(slot) = self.slot(name).await else {
            return false;
        };
        let seen = slot.restarts.load(Ordering::SeqCst);
        let _op = slot.op.lock().await;
        if slot.restarts.load(Ordering::SeqCst) != seen {
            let status = slot.state.read().await.status;
            tracing::debug!(server = %slot.name, %status, "restart already done by a concurrent caller");
            return status == ServerStatus::Running;
        }
        let config = self.config().await;
        let policy = RestartPolicy {
            max_attempts: config.max_restart_attempts,
            cooldown: config.restart_cooldown,
        };

        let (count, last) = {
            let state = slot.state.read().await;
            (state.restart_count, state.last_restart)
        };
        if !policy.permits(count, last, now) {
            tracing::warn!(server = %slot.name, restart_count = count, "restart refused: cooldown active");
            self.emit(ServerEvent::RestartRefused {
                server: slot.name.clone(),
                restart_count: count,
            });
            return false;
        }

        tracing::info!(server = %slot.name, attempt = count + 1, "restarting server");
        self.stop_locked(&slot).await;
        if !config.restart_delay.is_zero() {
            tokio::time::sleep(config.restart_delay).await;
        }

        let started = self.start_locked(&slot).await;
        let mut state = slot.state.write().await;
        if started {
            state.restart_count = 0;
        } else {
            state.restart_count += 1;
            state.last_restart = Some(now);
        }
        slot.restarts.fetch_add(1, Ordering::SeqCst);
        started
    }

    /// Start every enabled server. Returns how many are running afterwards.
    pub async fn start_all(&self) -> usize {
        let mut running = 0;
        for slot in self.all_slots().await {
            let enabled = slot.state.read().await.descriptor.enabled;
            if enabled && self.start(&slot.name).await {
                running += 1;
            }
        }
        running
    }

    pub async fn stop_all(&self) {
        for slot in self.all_slots().await {
            self.stop(&slot.name).await;
        }
    }

    /// Probe a Running instance. A failed probe moves it to Error.
    pub async fn check_health(&self, name: &str) -> bool {
        let Some(slot) = self.slot(name).await else {
            return false;
        };
        let provider = match slot.state.read().await.running_provider() {
            Ok(p) => p,
            Err(_) => return false,
        };
        match guard_async("ping", provider.ping()).await {
            Ok(()) => true,
            Err(e) => {
                self.mark_failed(&slot, &e).await;
                false
            }
        }
    }

    async fn mark_failed(&self, slot: &InstanceSlot, error: &Error) {
        let mut state = slot.state.write().await;
        if state.status != ServerStatus::Running {
            return;
        }
        tracing::error!(server = %slot.name, error = %error, "server unhealthy");
        state.set_error(error.to_string());
        drop(state);
        self.emit(ServerEvent::Failed {
            server: slot.name.clone(),
            error: error.to_string(),
        });
    }

    /// Replace the descriptor set. All current servers are stopped first.
    pub async fn replace_servers(&self, descriptors: Vec<ServerDescriptor>) {
        self.stop_all().await;
        *self.slots.write().await = descriptors.into_iter().map(InstanceSlot::new).collect();
    }

    pub async fn set_config(&self, config: LifecycleConfig) {
        *self.config.write().await = config;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn status(&self, name: &str) -> Option<ServerStatus> {
        let slot = self.slot(name).await?;
        let status = slot.state.read().await.status;
        Some(status)
    }

    pub async fn server_info(&self, name: &str) -> Option<ServerInfo> {
        let slot = self.slot(name).await?;
        let info = slot.state.read().await.info();
        Some(info)
    }

    pub async fn servers(&self) -> Vec<ServerInfo> {
        let mut out = Vec::new();
        for slot in self.all_slots().await {
            out.push(slot.state.read().await.info());
        }
        out
    }

    pub async fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        let slot = self.slot(name).await?;
        let descriptor = slot.state.read().await.descriptor.clone();
        Some(descriptor)
    }

    /// Tools of every Running server, in declaration order.
    pub async fn list_tools(&self) -> Vec<(String, ToolInfo)> {
        let mut out = Vec::new();
        for slot in self.all_slots().await {
            if let Some(caps) = &slot.state.read().await.capabilities {
                out.extend(caps.tools.iter().map(|t| (slot.name.clone(), t.clone())));
            }
        }
        out
    }

    pub async fn list_resources(&self) -> Vec<(String, ResourceInfo)> {
        let mut out = Vec::new();
        for slot in self.all_slots().await {
            if let Some(caps) = &slot.state.read().await.capabilities {
                out.extend(caps.resources.iter().map(|r| (slot.name.clone(), r.clone())));
            }
        }
        out
    }

    /// First Running server whose cached tool list contains `tool`.
    pub async fn find_tool_server(&self, tool: &str) -> Option<String> {
        for slot in self.all_slots().await {
            let state = slot.state.read().await;
            if state.capabilities.as_ref().is_some_and(|c| c.tool(tool).is_some()) {
                return Some(slot.name.clone());
            }
        }
        None
    }

    /// First Running server whose cached resource list contains `uri`.
    pub async fn find_resource_server(&self, uri: &str) -> Option<String> {
        for slot in self.all_slots().await {
            let state = slot.state.read().await;
            if state.capabilities.as_ref().is_some_and(|c| c.has_resource(uri)) {
                return Some(slot.name.clone());
            }
        }
        None
    }

    /// Cached tool metadata for a Running server.
    pub async fn tool_info(&self, server: &str, tool: &str) -> Option<ToolInfo> {
        let slot = self.slot(server).await?;
        let state = slot.state.read().await;
        state.capabilities.as_ref()?.tool(tool).cloned()
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Invoke a tool on a Running server. Connection failures move the
    /// instance to Error so the health monitor can restart it.
    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> Result<ToolResponse> {
        let slot = self
            .slot(server)
            .await
            .ok_or_else(|| Error::not_found(format!("server '{}'", server)))?;
        let provider = slot.state.read().await.running_provider()?;
        let timeout = self.config.read().await.request_timeout;

        tracing::debug!(server, tool, "calling tool");
        let call = guard_async("call_tool", provider.invoke(tool, arguments));
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "tool '{}' on '{}' exceeded {:?}",
                tool, server, timeout
            ))),
        };
        if let Err(e @ Error::Connection(_)) = &result {
            self.mark_failed(&slot, e).await;
        }
        result
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ResourceContent> {
        let slot = self
            .slot(server)
            .await
            .ok_or_else(|| Error::not_found(format!("server '{}'", server)))?;
        let provider = slot.state.read().await.running_provider()?;
        let timeout = self.config.read().await.request_timeout;

        let read = guard_async("read_resource", provider.read_resource(uri));
        let result = match tokio::time::timeout(timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "reading '{}' from '{}' exceeded {:?}",
                uri, server, timeout
            ))),
        };
        if let Err(e @ Error::Connection(_)) = &result {
            self.mark_failed(&slot, e).await;
        }
        result
    }
}
