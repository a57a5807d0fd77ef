//! Turn orchestration - the bounded generate/scan/execute loop.
//!
//! ```text
//! Generating -> Scanning -> Executing -> Generating ...
//!                        \-> Done (no directives, max iterations, cancelled)
//! ```
//!
//! Directives are executed as soon as they are complete in the text (during
//! streaming, on every growth) and each result marker is spliced in right
//! after its directive. A result is either spliced whole or not at all.

use futures::StreamExt;
use serde::Serialize;
use std::ops::Range;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::directives::{splice_at, Directive, DirectiveScanner};
use crate::executor::{render_marker, Dispatcher, ExecutionResult};
use crate::llm::{ContinuationCoordinator, Conversation, LlmProvider, Message};
use crate::types::{OrchestratorConfig, Result, SessionId};

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Generating,
    Scanning,
    Executing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// A generation came back with no directives.
    Completed,
    /// The iteration bound was hit while directives kept coming.
    MaxIterations,
    /// The caller cancelled the turn.
    Cancelled,
}

/// A directive together with its result and where the marker landed.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedDirective {
    #[serde(skip)]
    pub directive: Directive,
    pub name: String,
    pub result: ExecutionResult,
    /// Byte range of the result marker in the assistant text it was spliced into.
    pub marker: Range<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// Final assistant text, result markers included.
    pub text: String,
    pub iterations: u32,
    pub results: Vec<ExecutedDirective>,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Text produced by one generation (or continuation) with its executions.
#[derive(Debug, Default)]
struct Pass {
    text: String,
    executed: Vec<ExecutedDirective>,
    cancelled: bool,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns one session's conversation and drives its turns.
#[derive(Debug)]
pub struct TurnOrchestrator {
    llm: Arc<dyn LlmProvider>,
    dispatcher: Dispatcher,
    continuation: ContinuationCoordinator,
    config: OrchestratorConfig,
    conversation: Conversation,
    state: TurnState,
    session_id: SessionId,
}

impl TurnOrchestrator {
    pub fn new(llm: Arc<dyn LlmProvider>, dispatcher: Dispatcher, config: OrchestratorConfig) -> Self {
        Self {
            llm,
            dispatcher,
            continuation: ContinuationCoordinator::new(config.continuation_max_tokens),
            conversation: Conversation::new(config.max_history),
            config,
            state: TurnState::Idle,
            session_id: SessionId::new(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.conversation = self.conversation.with_system(prompt);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Forget everything but the system prompt.
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.state = TurnState::Idle;
    }

    pub async fn run_turn(&mut self, input: &str) -> Result<TurnOutcome> {
        self.run_turn_with_cancel(input, CancellationToken::new()).await
    }

    /// Run one turn for `input`.
    ///
    /// Only a generation failure that survives the non-streaming fallback is
    /// returned as `Err`; everything local to a directive ends up in
    /// `results`.
    pub async fn run_turn_with_cancel(
        &mut self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        self.conversation.push(Message::user(input));
        let max_iterations = self.config.max_iterations.max(1);
        tracing::debug!(session = %self.session_id, max_iterations, "turn started");

        let mut results = Vec::new();
        let mut uncommitted: Vec<ExecutedDirective> = Vec::new();
        let mut carried: Option<(String, usize)> = None;
        let mut last_text = String::new();

        for iteration in 1..=max_iterations {
            let pass = match carried.take() {
                Some((text, resolved)) => self.execute_carried(text, resolved, &cancel).await,
                None => match self.generate_pass(&cancel).await {
                    Ok(pass) => pass,
                    Err(e) => {
                        self.state = TurnState::Done;
                        return Err(e);
                    }
                },
            };
            results.extend(pass.executed.iter().cloned());

            if pass.cancelled {
                tracing::info!(session = %self.session_id, iteration, "turn cancelled");
                uncommitted.extend(pass.executed);
                self.commit(&pass.text, uncommitted);
                return Ok(self.finish(pass.text, iteration, results, TurnStatus::Cancelled, None));
            }

            if pass.executed.is_empty() {
                self.commit(&pass.text, uncommitted);
                return Ok(self.finish(pass.text, iteration, results, TurnStatus::Completed, None));
            }

            uncommitted.extend(pass.executed.iter().cloned());
            if let Some(extended) = self.try_continue(&pass).await {
                carried = Some(extended);
                continue;
            }

            self.commit(&pass.text, std::mem::take(&mut uncommitted));
            last_text = pass.text;
        }

        let warning = format!(
            "Reached maximum iterations ({}); returning the latest response",
            max_iterations
        );
        tracing::warn!(session = %self.session_id, max_iterations, "turn hit the iteration bound");
        if let Some((text, _)) = carried {
            self.commit(&text, uncommitted);
            last_text = text;
        }
        Ok(self.finish(
            last_text,
            max_iterations,
            results,
            TurnStatus::MaxIterations,
            Some(warning),
        ))
    }

    fn finish(
        &mut self,
        text: String,
        iterations: u32,
        results: Vec<ExecutedDirective>,
        status: TurnStatus,
        warning: Option<String>,
    ) -> TurnOutcome {
        self.state = TurnState::Done;
        TurnOutcome {
            text,
            iterations,
            results,
            status,
            warning,
        }
    }

    /// Append the assistant text and one tool message per executed directive.
    fn commit(&mut self, text: &str, executed: Vec<ExecutedDirective>) {
        if !text.is_empty() {
            self.conversation.push(Message::assistant(text));
        }
        for item in executed {
            self.conversation
                .push(Message::tool(item.name, item.result.display_text()));
        }
    }

    // =========================================================================
    // Generation
    // =========================================================================

    /// One generation with directive execution. The primary path (streamed or
    /// whole, per config) gets one non-streaming fallback.
    async fn generate_pass(&mut self, cancel: &CancellationToken) -> Result<Pass> {
        let messages = self.conversation.window();

        let primary = if self.config.streaming {
            self.streamed_pass(&messages, cancel).await
        } else {
            self.whole_pass(&messages, cancel).await
        };
        match primary {
            Ok(pass) => Ok(pass),
            Err(e) => {
                tracing::warn!(error = %e, "generation failed; retrying without streaming");
                self.whole_pass(&messages, cancel).await
            }
        }
    }

    async fn streamed_pass(&mut self, messages: &[Message], cancel: &CancellationToken) -> Result<Pass> {
        self.state = TurnState::Generating;
        let llm = Arc::clone(&self.llm);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Pass { cancelled: true, ..Pass::default() }),
            stream = llm.generate_stream(messages) => stream?,
        };

        let mut pass = Pass::default();
        let mut scanner = DirectiveScanner::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pass.cancelled = true;
                    return Ok(pass);
                }
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            pass.text.push_str(&chunk.text);

            if self.execute_ready(&mut pass, &mut scanner, cancel).await {
                return Ok(pass);
            }
            self.state = TurnState::Generating;
            if chunk.is_final {
                break;
            }
        }
        Ok(pass)
    }

    async fn whole_pass(&mut self, messages: &[Message], cancel: &CancellationToken) -> Result<Pass> {
        self.state = TurnState::Generating;
        let llm = Arc::clone(&self.llm);
        let generation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Pass { cancelled: true, ..Pass::default() }),
            generation = llm.generate(messages) => generation?,
        };

        let mut pass = Pass {
            text: generation.text,
            ..Pass::default()
        };
        self.execute_ready(&mut pass, &mut DirectiveScanner::new(), cancel)
            .await;
        Ok(pass)
    }

    /// Scan and execute text produced by a continuation, past `resolved`.
    async fn execute_carried(&mut self, text: String, resolved: usize, cancel: &CancellationToken) -> Pass {
        let mut pass = Pass {
            text,
            ..Pass::default()
        };
        let mut scanner = DirectiveScanner::new();
        scanner.resolve_through(resolved);
        self.execute_ready(&mut pass, &mut scanner, cancel).await;
        pass
    }

    /// Execute every complete directive past the scanner cursor, splicing each
    /// result in. Returns true when cancelled; the interrupted directive's
    /// result is then dropped.
    async fn execute_ready(
        &mut self,
        pass: &mut Pass,
        scanner: &mut DirectiveScanner,
        cancel: &CancellationToken,
    ) -> bool {
        self.state = TurnState::Scanning;
        while let Some(directive) = scanner.next_directive(&pass.text) {
            self.state = TurnState::Executing;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pass.cancelled = true;
                    return true;
                }
                result = self.dispatcher.execute(&directive) => result,
            };

            let marker = render_marker(&directive, &result);
            let (spliced, resume) = splice_at(&pass.text, directive.span.end, &marker);
            pass.text = spliced;
            scanner.resolve_through(resume);
            pass.executed.push(ExecutedDirective {
                name: directive.label().to_string(),
                marker: directive.span.end..resume,
                directive,
                result,
            });
            self.state = TurnState::Scanning;
        }
        false
    }

    // =========================================================================
    // Continuation
    // =========================================================================

    /// Resume the assistant message right after the last code result.
    ///
    /// Applies only when every directive in the pass was a code block and the
    /// backend supports raw completion. Text generated after the last code
    /// block (written before its output existed) is replaced by the
    /// continuation. Returns the extended text and the offset up to which it
    /// is already resolved.
    async fn try_continue(&mut self, pass: &Pass) -> Option<(String, usize)> {
        if !self.config.continuation || !self.llm.supports_completion() {
            return None;
        }
        if !pass.executed.iter().all(|e| e.directive.is_code()) {
            return None;
        }
        let last = pass.executed.last()?;
        let partial = pass.text.get(..last.marker.start)?;
        let result_text = pass.text.get(last.marker.clone())?;

        self.state = TurnState::Generating;
        let extended = self
            .continuation
            .continue_generation(
                self.llm.as_ref(),
                &self.conversation.window(),
                partial,
                result_text,
            )
            .await;
        if extended == partial {
            return None;
        }
        tracing::debug!(added = extended.len() - last.marker.end, "continued generation in place");
        Some((extended, last.marker.end))
    }
}
