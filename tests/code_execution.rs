//! Code execution integration tests - directive text to sandboxed subprocess.

mod common;

use agent_runtime::directives::{extract, DirectiveKind};
use agent_runtime::executor::{render_marker, CodeRunner, FailureKind};
use agent_runtime::types::ExecutorConfig;
use common::{config_with_math_server, has_program, started_runtime};
use std::time::Duration;

#[tokio::test]
async fn test_python_block_prints_result() {
    if !has_program("python3") {
        eprintln!("python3 not available; skipping");
        return;
    }
    let (runtime, _launcher) = started_runtime(config_with_math_server()).await;
    let dispatcher = runtime.dispatcher().await;

    let directive = extract("<code>```python\nprint((2+3)*4)\n```</code>").remove(0);
    let result = dispatcher.execute(&directive).await;
    assert!(result.success, "{:?}", result);
    assert_eq!(result.output, "20\n");
    assert!(result.elapsed < Duration::from_secs(30));
}

#[tokio::test]
async fn test_python_is_default_language() {
    let directive = extract("<code>print(1)</code>").remove(0);
    match &directive.kind {
        DirectiveKind::CodeBlock { language, source } => {
            assert_eq!(language, "python");
            assert_eq!(source, "print(1)");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_python_exception_is_failed_result() {
    if !has_program("python3") {
        eprintln!("python3 not available; skipping");
        return;
    }
    let runner = CodeRunner::new(&ExecutorConfig::default());
    let result = runner.run("python", "raise ValueError('bad input')").await;
    assert!(!result.success);
    assert_eq!(result.failure, Some(FailureKind::Execution));
    assert!(result.output.contains("ValueError: bad input"));
}

#[tokio::test]
async fn test_sleeping_block_times_out() {
    let config = ExecutorConfig {
        code_timeout: Duration::from_millis(300),
        ..ExecutorConfig::default()
    };
    let runner = CodeRunner::new(&config);
    let directive = extract("<code>```sh\nsleep 10\n```</code>").remove(0);
    let DirectiveKind::CodeBlock { language, source } = &directive.kind else {
        panic!("expected code block");
    };

    let result = runner.run(language, source).await;
    assert!(result.is_timeout());
    assert!(result.elapsed < Duration::from_secs(5));
    let marker = render_marker(&directive, &result);
    assert!(marker.starts_with("\n\n<code_output>\nError: Execution timeout"));
}

#[tokio::test]
async fn test_unsupported_language_reported() {
    let runner = CodeRunner::new(&ExecutorConfig::default());
    let result = runner.run("fortran", "print *, 'hi'").await;
    assert_eq!(result.failure, Some(FailureKind::Unsupported));
    assert_eq!(
        result.error.as_deref(),
        Some("Language 'fortran' is not supported")
    );
}
