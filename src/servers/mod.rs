//! Tool-provider servers and their lifecycle.
//!
//! - **Types**: descriptors, status, capability cache, events
//! - **Provider**: the `ToolProvider`/`ProviderLauncher` seams and restart policy
//! - **Stdio**: JSON-RPC over a child process's stdio
//! - **Lifecycle**: start/stop/restart and capability discovery
//! - **Health**: background probe-and-restart loop

mod health;
mod lifecycle;
mod provider;
mod stdio;
mod types;

pub use health::{HealthMonitor, HealthReport};
pub use lifecycle::LifecycleManager;
pub use provider::{ProviderLauncher, RestartPolicy, ToolProvider};
pub use stdio::{StdioLauncher, StdioProvider};
pub use types::{
    Capabilities, ResourceContent, ResourceInfo, ServerDescriptor, ServerEvent, ServerInfo,
    ServerStatus, ToolInfo, ToolResponse,
};
