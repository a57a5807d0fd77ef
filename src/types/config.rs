//! Configuration structures.
//!
//! Configuration is produced outside the runtime (file, environment, caller)
//! and handed in as one immutable snapshot. Reloading swaps the whole snapshot.

use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors;
use crate::security::{Decision, RateLimitConfig, SecurityRule};
use crate::servers::ServerDescriptor;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, JsonSchema)]
pub struct Config {
    /// Tool-provider servers.
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,

    /// Permission gateway policy.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Process lifecycle and health monitoring.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Turn loop bounds.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Code execution sandbox.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(raw: &str) -> errors::Result<Self> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| errors::Error::configuration(format!("invalid config document: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> errors::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            errors::Error::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// JSON schema of the configuration document.
    pub fn json_schema() -> serde_json::Value {
        let schema = schemars::schema_for!(Config);
        serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
    }

    /// Validate structural invariants. Failures are configuration errors.
    pub fn validate(&self) -> errors::Result<()> {
        let mut names = HashSet::new();
        for (i, server) in self.servers.iter().enumerate() {
            let errors = server.validate();
            if let Some(first) = errors.first() {
                return Err(errors::Error::configuration(format!("server #{}: {}", i, first)));
            }
            if !names.insert(server.name.as_str()) {
                return Err(errors::Error::configuration(format!(
                    "duplicate server name '{}'",
                    server.name
                )));
            }
        }

        for rule in &self.security.rules {
            rule.validate()?;
        }

        let limits = &self.security.rate_limits;
        if limits.calls_per_minute == 0 || limits.calls_per_hour == 0 {
            return Err(errors::Error::configuration("rate limits must be greater than zero"));
        }
        if self.security.max_audit_entries == 0 {
            return Err(errors::Error::configuration("max_audit_entries must be greater than zero"));
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(errors::Error::configuration("max_iterations must be greater than zero"));
        }
        if self.lifecycle.health_check_interval.is_zero() {
            return Err(errors::Error::configuration("health_check_interval must be non-zero"));
        }
        if self.executor.code_timeout.is_zero() {
            return Err(errors::Error::configuration("code_timeout must be non-zero"));
        }
        for (language, command) in &self.executor.interpreters {
            if command.is_empty() {
                return Err(errors::Error::configuration(format!(
                    "interpreter for '{}' has an empty command",
                    language
                )));
            }
        }
        Ok(())
    }
}

/// Durations are written as humantime strings ("30s", "5m").
fn duration_schema(gen: &mut SchemaGenerator) -> Schema {
    let mut schema = String::json_schema(gen).into_object();
    schema.format = Some("duration".to_string());
    Schema::Object(schema)
}

/// Permission gateway policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SecurityConfig {
    /// Decision when no rule matches.
    pub default_decision: Decision,

    /// Ordered rules; first match wins.
    pub rules: Vec<SecurityRule>,

    pub blocked_servers: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub blocked_resources: Vec<String>,

    /// Per-server call caps.
    pub rate_limits: RateLimitConfig,

    /// Pending approval lifetime.
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "humantime_serde::deserialize"
    )]
    #[schemars(schema_with = "duration_schema")]
    pub approval_ttl: Duration,

    /// In-memory audit retention (oldest dropped first).
    pub max_audit_entries: usize,

    /// Optional JSONL mirror of the audit log.
    pub audit_file: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            default_decision: Decision::RequireApproval,
            rules: Vec::new(),
            blocked_servers: Vec::new(),
            blocked_tools: Vec::new(),
            blocked_resources: Vec::new(),
            rate_limits: RateLimitConfig::default(),
            approval_ttl: Duration::from_secs(30 * 60),
            max_audit_entries: 10_000,
            audit_file: None,
        }
    }
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Health monitor polling interval.
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "humantime_serde::deserialize"
    )]
    #[schemars(schema_with = "duration_schema")]
    pub health_check_interval: Duration,

    /// Failed restarts tolerated inside one cooldown window.
    pub max_restart_attempts: u32,

    /// Window in which failed restarts are counted against the cap.
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "humantime_serde::deserialize"
    )]
    #[schemars(schema_with = "duration_schema")]
    pub restart_cooldown: Duration,

    /// Pause between stop and start during a restart.
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "humantime_serde::deserialize"
    )]
    #[schemars(schema_with = "duration_schema")]
    pub restart_delay: Duration,

    /// Per-request deadline for tool-provider RPCs.
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "humantime_serde::deserialize"
    )]
    #[schemars(schema_with = "duration_schema")]
    pub request_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            max_restart_attempts: 3,
            restart_cooldown: Duration::from_secs(5 * 60),
            restart_delay: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Turn loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Hard bound on generate/execute iterations per turn.
    pub max_iterations: u32,

    /// Prefer streamed generation.
    pub streaming: bool,

    /// Resume generation in place after code results when the backend supports it.
    pub continuation: bool,

    /// Token budget for one continuation request.
    pub continuation_max_tokens: u32,

    /// Messages (excluding system) sent with each generation request.
    pub max_history: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            streaming: true,
            continuation: true,
            continuation_max_tokens: 300,
            max_history: 20,
        }
    }
}

/// Code execution sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard wall-clock limit per code block.
    #[serde(
        serialize_with = "humantime_serde::serialize",
        deserialize_with = "humantime_serde::deserialize"
    )]
    #[schemars(schema_with = "duration_schema")]
    pub code_timeout: Duration,

    /// language tag -> interpreter argv (source file path is appended).
    pub interpreters: BTreeMap<String, Vec<String>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let mut interpreters = BTreeMap::new();
        interpreters.insert("python".to_string(), vec!["python3".to_string()]);
        interpreters.insert("sh".to_string(), vec!["sh".to_string()]);
        Self {
            code_timeout: Duration::from_secs(30),
            interpreters,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
