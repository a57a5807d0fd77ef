//! Tool-provider abstraction and restart policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use super::types::{ResourceContent, ResourceInfo, ServerDescriptor, ToolInfo, ToolResponse};
use crate::types::Result;

/// A connected tool provider (one external server process).
#[async_trait]
pub trait ToolProvider: Send + Sync + Debug {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>>;

    async fn list_resources(&self) -> Result<Vec<ResourceInfo>>;

    async fn invoke(&self, tool: &str, arguments: Value) -> Result<ToolResponse>;

    async fn read_resource(&self, uri: &str) -> Result<ResourceContent>;

    /// Liveness probe used by the health monitor.
    async fn ping(&self) -> Result<()> {
        self.list_tools().await.map(|_| ())
    }

    /// Terminate the connection and the underlying process.
    async fn shutdown(&self) -> Result<()>;
}

/// Launches a provider for a descriptor and completes its handshake.
#[async_trait]
pub trait ProviderLauncher: Send + Sync + Debug {
    async fn launch(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolProvider>>;
}

/// Bounded restart policy, kept as plain data so it is testable without sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl RestartPolicy {
    /// A restart is refused while the last failed restart is inside the
    /// cooldown window and the failure counter has reached the cap.
    pub fn permits(
        &self,
        restart_count: u32,
        last_restart: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(last) = last_restart else {
            return true;
        };
        let cooldown = chrono::Duration::from_std(self.cooldown)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));
        let within_cooldown = now - last < cooldown;
        !(within_cooldown && restart_count >= self.max_attempts)
    }
}
