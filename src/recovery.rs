//! Panic containment.
//!
//! A panic inside a tool provider, a directive execution or a health-monitor
//! cycle is caught, logged and converted to `Error::Internal`, so one
//! misbehaving component never takes down the session or the monitor loop.

use futures::FutureExt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::types::{Error, Result};

/// Run a closure, converting a panic into an error.
pub fn guard<F, T>(operation_name: &str, operation: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = extract_panic_message(&payload);
            tracing::error!(operation = operation_name, panic = %panic_msg, "panic_recovered");
            Err(Error::internal(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Await a future, converting a panic at any poll into an error.
pub async fn guard_async<Fut, T>(operation_name: &str, future: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let panic_msg = extract_panic_message(&payload);
            tracing::error!(operation = operation_name, panic = %panic_msg, "async_panic_recovered");
            Err(Error::internal(format!(
                "Async panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
