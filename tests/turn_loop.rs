//! Turn loop integration tests - directives flow through the gateway and the
//! lifecycle manager and come back spliced into the transcript.

mod common;

use agent_runtime::executor::FailureKind;
use agent_runtime::llm::{Message, Role};
use agent_runtime::orchestrator::TurnStatus;
use agent_runtime::security::{Decision, Operation, OperationKind, SecurityRule};
use agent_runtime::types::ApprovalId;
use common::{config_with_math_server, started_runtime, ScriptedLlm};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

const ADD_2_3: &str = r#"<tool_use> name: add parameters: {"a": 2, "b": 3} </tool_use>"#;

fn allow_math_tools() -> agent_runtime::Config {
    let mut config = config_with_math_server();
    config.security.rules.push(
        SecurityRule::new("math-tools", OperationKind::ToolCall, Decision::Allowed)
            .with_tool_pattern("(add|echo|fail)$"),
    );
    config
}

#[tokio::test]
async fn test_allowed_tool_call_is_spliced_and_recorded() {
    let (runtime, launcher) = started_runtime(allow_math_tools()).await;
    let llm = Arc::new(ScriptedLlm::new(&[
        &format!("Let me add.\n{}", ADD_2_3),
        "2 + 3 = 5.",
    ]));
    let mut session = runtime.session(llm.clone()).await;

    let outcome = session.run_turn("what is 2+3?").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.text, "2 + 3 = 5.");
    assert_eq!(outcome.results.len(), 1);
    assert!(outcome.results[0].result.success);
    assert_eq!(outcome.results[0].result.output, "5");
    assert_eq!(launcher.calls(), 1);

    let messages = session.conversation().messages();
    assert_eq!(
        messages[1].content,
        format!(
            "Let me add.\n{}\n<tool_result name=\"add\">\n5\n</tool_result>",
            ADD_2_3
        )
    );
    assert_eq!(messages[2], Message::tool("add", "5"));

    // The second generation saw the tool result.
    let second_request = llm.seen.lock().unwrap()[1].clone();
    assert_eq!(second_request.last().unwrap().role, Role::Tool);
}

#[tokio::test]
async fn test_approval_required_then_granted() {
    let (runtime, launcher) = started_runtime(config_with_math_server()).await;
    let llm = Arc::new(ScriptedLlm::new(&[ADD_2_3, "Waiting for approval.", ADD_2_3, "Done."]));
    let mut session = runtime.session(llm).await;

    let outcome = session.run_turn("add please").await.unwrap();
    let first = &outcome.results[0].result;
    let expected_id = Operation::tool_call("math", "add", json!({"a": 2, "b": 3})).approval_id();
    assert_eq!(first.approval_id(), Some(expected_id.as_str()));
    assert_eq!(launcher.calls(), 0);

    let pending = runtime.gateway().list_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, expected_id);
    assert!(runtime.gateway().approve(&expected_id, Some("operator")).await);

    let outcome = session.run_turn("try again").await.unwrap();
    assert!(outcome.results[0].result.success);
    assert_eq!(outcome.results[0].result.output, "5");
    assert_eq!(launcher.calls(), 1);
    assert!(runtime.gateway().list_pending().await.is_empty());
}

#[tokio::test]
async fn test_blocked_tool_fails_without_ending_turn() {
    let (runtime, launcher) = started_runtime(allow_math_tools()).await;
    runtime.gateway().block_tool("add").await;
    let llm = Arc::new(ScriptedLlm::new(&[ADD_2_3, "I cannot add right now."]));
    let mut session = runtime.session(llm).await;

    let outcome = session.run_turn("add").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    let result = &outcome.results[0].result;
    assert_eq!(result.failure, Some(FailureKind::PermissionDenied));
    assert_eq!(launcher.calls(), 0);
    assert!(session.conversation().messages()[1]
        .content
        .ends_with("<tool_result name=\"add\">\nError: Tool is blocked\n</tool_result>"));
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_provider() {
    let (runtime, launcher) = started_runtime(allow_math_tools()).await;
    let llm = Arc::new(ScriptedLlm::new(&[
        r#"<tool_use>name: add parameters: {"a": "two", "b": 3}</tool_use>"#,
        "oops",
    ]));
    let mut session = runtime.session(llm).await;

    let outcome = session.run_turn("add").await.unwrap();
    assert_eq!(
        outcome.results[0].result.failure,
        Some(FailureKind::InvalidArguments)
    );
    assert_eq!(launcher.calls(), 0);
    // Schema rejection happens before the gateway, so nothing is audited.
    let gateway = runtime.gateway();
    assert!(gateway.audit_entries(None).await.is_empty());
    assert!(gateway.list_pending().await.is_empty());
}

#[tokio::test]
async fn test_tool_error_and_unknown_tool() {
    let (runtime, _launcher) = started_runtime(allow_math_tools()).await;
    let llm = Arc::new(ScriptedLlm::new(&[
        "<tool_use>name: fail parameters: {}</tool_use> <tool_use>name: nope parameters: {}</tool_use>",
        "Both failed.",
    ]));
    let mut session = runtime.session(llm).await;

    let outcome = session.run_turn("go").await.unwrap();
    assert_eq!(outcome.results.len(), 2);
    assert_eq!(outcome.results[0].result.failure, Some(FailureKind::Execution));
    assert_eq!(outcome.results[0].result.error.as_deref(), Some("tool exploded"));
    assert_eq!(outcome.results[1].result.failure, Some(FailureKind::NotFound));
    assert_eq!(outcome.status, TurnStatus::Completed);
}

#[tokio::test]
async fn test_block_syntax_with_explicit_server() {
    let (runtime, _launcher) = started_runtime(allow_math_tools()).await;
    let llm = Arc::new(ScriptedLlm::new(&[
        "<tool_use>\nname: echo\nserver: math\nparameters:\n  text: \"hello world\"\n</tool_use>",
        "Echoed.",
    ]));
    let mut session = runtime.session(llm).await;

    let outcome = session.run_turn("echo").await.unwrap();
    let result = &outcome.results[0].result;
    assert!(result.success, "{:?}", result);
    assert_eq!(result.output, r#"{"text":"hello world"}"#);
}

#[tokio::test]
async fn test_continuation_resumes_after_code_output() {
    let mut config = config_with_math_server();
    config.orchestrator.continuation = true;
    let (runtime, _launcher) = started_runtime(config).await;
    let llm = Arc::new(
        ScriptedLlm::new(&["Computing:\n<code>```sh\necho 20\n```</code>\nguessing ahead"])
            .with_completions(&["\nSo the answer is 20."]),
    );
    let mut session = runtime.session(llm.clone()).await;

    let outcome = session.run_turn("compute").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(
        outcome.text,
        "Computing:\n<code>```sh\necho 20\n```</code>\n\n<code_output>\n20\n</code_output>\nSo the answer is 20."
    );
    assert_eq!(llm.requests(), 1);

    let prompt = llm.prompts.lock().unwrap()[0].clone();
    assert!(prompt.ends_with("<code_output>\n20\n</code_output>"));

    let messages = session.conversation().messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].content, outcome.text);
    assert_eq!(messages[2], Message::tool("code", "20"));
}

#[tokio::test]
async fn test_repeating_directives_hit_iteration_bound() {
    let mut config = allow_math_tools();
    config.orchestrator.max_iterations = 2;
    let (runtime, launcher) = started_runtime(config).await;
    let llm = Arc::new(ScriptedLlm::repeating(ADD_2_3));
    let mut session = runtime.session(llm.clone()).await;

    let outcome = session.run_turn("loop").await.unwrap();
    assert_eq!(outcome.status, TurnStatus::MaxIterations);
    assert_eq!(outcome.iterations, 2);
    assert!(outcome.warning.is_some());
    assert_eq!(launcher.calls(), 2);
    assert_eq!(llm.requests(), 2);
}

#[tokio::test]
async fn test_approval_ids_are_content_derived() {
    let a = Operation::tool_call("math", "add", json!({"a": 1, "b": 2})).approval_id();
    let b = Operation::tool_call("math", "add", json!({"b": 2, "a": 1})).approval_id();
    assert_eq!(a, b);
    assert_ne!(
        a,
        ApprovalId::from_content(b"something else entirely")
    );
}
