//! Sandboxed code execution.
//!
//! Each block runs in a fresh temporary directory with the configured
//! interpreter, a hard wall-clock timeout and captured stdout/stderr. The
//! child is killed when the timeout fires (the handle is `kill_on_drop`).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

use super::result::{ExecutionResult, FailureKind};
use crate::types::{Error, ExecutorConfig, Result};

#[derive(Debug, Clone)]
pub struct CodeRunner {
    timeout: Duration,
    interpreters: BTreeMap<String, Vec<String>>,
}

impl CodeRunner {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            timeout: config.code_timeout,
            interpreters: config.interpreters.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn supports(&self, language: &str) -> bool {
        self.interpreters
            .get(language)
            .is_some_and(|argv| !argv.is_empty())
    }

    /// Run `source` with the interpreter registered for `language`.
    /// Never returns an error: every failure is a failed result.
    pub async fn run(&self, language: &str, source: &str) -> ExecutionResult {
        let started = Instant::now();
        let Some(argv) = self.interpreters.get(language).filter(|a| !a.is_empty()) else {
            return ExecutionResult::failure(
                FailureKind::Unsupported,
                format!("Language '{}' is not supported", language),
                "",
                started.elapsed(),
            );
        };

        match self.run_interpreter(argv, language, source, started).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(language, error = %e, "code execution failed to start");
                ExecutionResult::from_error(&e, started.elapsed())
            }
        }
    }

    /// Creating and removing the working directory are blocking filesystem
    /// calls, so both happen on the blocking pool.
    async fn run_interpreter(
        &self,
        argv: &[String],
        language: &str,
        source: &str,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let workdir = tokio::task::spawn_blocking(tempfile::tempdir)
            .await
            .map_err(|e| Error::internal(format!("sandbox setup task failed: {}", e)))??;
        let result = self
            .run_in(workdir.path(), argv, language, source, started)
            .await;
        tokio::task::spawn_blocking(move || drop(workdir));
        result
    }

    async fn run_in(
        &self,
        workdir: &Path,
        argv: &[String],
        language: &str,
        source: &str,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let script = workdir.join(format!("snippet.{}", extension(language)));
        tokio::fs::write(&script, source).await?;

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .arg(&script)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| Error::execution(format!("cannot start '{}': {}", argv[0], e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                tracing::warn!(language, timeout = ?self.timeout, "code execution timed out");
                return Ok(ExecutionResult::failure(
                    FailureKind::Timeout,
                    format!("Execution timeout ({:?})", self.timeout),
                    "",
                    started.elapsed(),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let elapsed = started.elapsed();

        if output.status.success() {
            tracing::debug!(language, ?elapsed, "code executed");
            return Ok(ExecutionResult::success(stdout, elapsed));
        }

        let error = match output.status.code() {
            Some(code) => format!("Process exited with code {}", code),
            None => "Process terminated by signal".to_string(),
        };
        Ok(ExecutionResult::failure(
            FailureKind::Execution,
            error,
            format!("{}{}", stdout, stderr),
            elapsed,
        ))
    }
}

fn extension(language: &str) -> &str {
    match language {
        "python" => "py",
        "javascript" | "node" => "js",
        "bash" => "sh",
        other => other,
    }
}
