//! # Agent Runtime - model-driven tool calls behind a permission gateway
//!
//! Lets a language model drive external actions while policy stays in
//! control:
//! - Per-turn orchestration: generate, detect directives, execute, re-generate
//! - Security gateway: block lists, rate limits, ordered rules, approvals, audit
//! - Tool-provider lifecycle: start/stop, capability caching, bounded restarts
//! - Sandboxed code execution with hard timeouts
//! - In-place generation continuation for raw-completion backends
//!
//! ## Architecture
//!
//! ```text
//!   LlmProvider ──► TurnOrchestrator ──► DirectiveScanner
//!                         │
//!                         ▼
//!                    Dispatcher ──► CodeRunner (tempdir subprocess)
//!                         │
//!                         ├──► SecurityGateway (blocks → rate → rules → approvals)
//!                         └──► LifecycleManager ──► ToolProvider (stdio JSON-RPC)
//!                                      ▲
//!                                HealthMonitor
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod directives;
pub mod executor;
pub mod llm;
pub mod orchestrator;
pub mod runtime;
pub mod security;
pub mod servers;
pub mod types;

// Internal utilities
pub mod observability;
pub mod recovery;

pub use runtime::Runtime;
pub use types::{Config, Error, Result};
