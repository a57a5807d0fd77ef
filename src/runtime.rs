//! Runtime - composition root.
//!
//! Owns the process-wide shared state: one security gateway, one lifecycle
//! manager and its health monitor, and the current configuration snapshot.
//! Sessions (`TurnOrchestrator`) borrow handles to the shared parts.
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!   sessions  →   │              Runtime                 │
//!                 │  ┌──────────┐  ┌──────────────────┐  │
//!                 │  │ Security │  │ LifecycleManager │  │
//!                 │  │ Gateway  │  │  + HealthMonitor │  │
//!                 │  └──────────┘  └──────────────────┘  │
//!                 └──────────────────────────────────────┘
//! ```

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::executor::{CodeRunner, Dispatcher};
use crate::llm::LlmProvider;
use crate::orchestrator::TurnOrchestrator;
use crate::security::{SecurityGateway, SecurityStatus};
use crate::servers::{HealthMonitor, LifecycleManager, ProviderLauncher, StdioLauncher};
use crate::types::{Config, Result};

#[derive(Debug)]
pub struct Runtime {
    config: RwLock<Arc<Config>>,
    gateway: Arc<SecurityGateway>,
    servers: Arc<LifecycleManager>,
    monitor: Mutex<HealthMonitor>,
}

impl Runtime {
    /// Build a runtime whose servers are child processes speaking JSON-RPC
    /// over stdio.
    pub fn new(config: Config) -> Result<Self> {
        let launcher = Arc::new(StdioLauncher::new(config.lifecycle.request_timeout));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: Config, launcher: Arc<dyn ProviderLauncher>) -> Result<Self> {
        config.validate()?;
        let gateway = Arc::new(SecurityGateway::with_servers(
            &config.security,
            &config.servers,
        )?);
        let servers = Arc::new(LifecycleManager::new(
            config.servers.clone(),
            config.lifecycle.clone(),
            launcher,
        ));
        let monitor = HealthMonitor::new(
            Arc::clone(&servers),
            config.lifecycle.health_check_interval,
        );
        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            gateway,
            servers,
            monitor: Mutex::new(monitor),
        })
    }

    /// Start every enabled server and the health monitor. Returns the number
    /// of servers running.
    pub async fn start(&self) -> usize {
        let running = self.servers.start_all().await;
        self.monitor.lock().await.start();
        tracing::info!(running, "runtime started");
        running
    }

    pub async fn config(&self) -> Arc<Config> {
        Arc::clone(&*self.config.read().await)
    }

    pub fn gateway(&self) -> &Arc<SecurityGateway> {
        &self.gateway
    }

    pub fn servers(&self) -> &Arc<LifecycleManager> {
        &self.servers
    }

    /// A dispatcher bound to the current executor configuration.
    pub async fn dispatcher(&self) -> Dispatcher {
        let config = self.config().await;
        Dispatcher::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.servers),
            CodeRunner::new(&config.executor),
        )
    }

    /// Open a new conversation session against `llm`.
    pub async fn session(&self, llm: Arc<dyn LlmProvider>) -> TurnOrchestrator {
        let config = self.config().await;
        TurnOrchestrator::new(llm, self.dispatcher().await, config.orchestrator.clone())
    }

    pub async fn security_status(&self) -> SecurityStatus {
        self.gateway.status().await
    }

    /// Swap in a new configuration snapshot.
    ///
    /// The new config is validated first; on failure nothing changes. The
    /// security policy is replaced in one step, then servers are stopped,
    /// replaced and the enabled ones started again. Sessions opened earlier
    /// keep their executor and loop settings.
    pub async fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        self.gateway
            .apply_config(&config.security, &config.servers)
            .await?;

        let mut monitor = self.monitor.lock().await;
        let was_running = monitor.is_running();
        monitor.stop().await;

        self.servers.set_config(config.lifecycle.clone()).await;
        self.servers.replace_servers(config.servers.clone()).await;
        let running = self.servers.start_all().await;

        *monitor = HealthMonitor::new(
            Arc::clone(&self.servers),
            config.lifecycle.health_check_interval,
        );
        if was_running {
            monitor.start();
        }
        drop(monitor);

        *self.config.write().await = Arc::new(config);
        tracing::info!(running, "configuration reloaded");
        Ok(())
    }

    /// Stop the health monitor and every server.
    pub async fn shutdown(&self) {
        self.monitor.lock().await.stop().await;
        self.servers.stop_all().await;
        tracing::info!("runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{Decision, OperationKind, SecurityRule};
    use crate::servers::ServerDescriptor;

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.servers.push(ServerDescriptor::new("", vec!["x".into()]));
        let err = Runtime::new(config).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_snapshot() {
        let runtime = Runtime::new(Config::default()).unwrap();
        let mut bad = Config::default();
        bad.security.rules.push(
            SecurityRule::new("broken", OperationKind::ToolCall, Decision::Allowed)
                .with_tool_pattern("("),
        );

        assert!(runtime.reload(bad).await.is_err());
        assert!(runtime.config().await.security.rules.is_empty());
        assert_eq!(runtime.security_status().await.rules, 0);
    }
}
