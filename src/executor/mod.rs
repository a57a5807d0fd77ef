//! Directive execution: sandboxed code runs and gated tool calls.

mod dispatcher;
mod result;
mod sandbox;

pub use dispatcher::Dispatcher;
pub use result::{render_marker, ExecutionResult, FailureKind};
pub use sandbox::CodeRunner;
