//! Generation continuation.
//!
//! After a result is spliced into a partial assistant message, completion
//! backends can resume the same message in place instead of starting a new
//! turn. The coordinator never fabricates a discontinuity: anything other than
//! a non-empty extension of the supplied prefix leaves the partial untouched.

use super::message::Message;
use super::provider::LlmProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationCoordinator {
    max_tokens: u32,
}

impl Default for ContinuationCoordinator {
    fn default() -> Self {
        Self { max_tokens: 300 }
    }
}

impl ContinuationCoordinator {
    pub fn new(max_tokens: u32) -> Self {
        Self { max_tokens }
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Extend `partial + result_text` with a bounded completion.
    ///
    /// Returns `partial` unchanged when the provider lacks completion support,
    /// the request fails, or nothing new comes back.
    pub async fn continue_generation(
        &self,
        provider: &dyn LlmProvider,
        conversation: &[Message],
        partial: &str,
        result_text: &str,
    ) -> String {
        if !provider.supports_completion() {
            return partial.to_string();
        }

        let prefix = format!("{}{}", partial, result_text);
        let prompt = provider.render_prompt(conversation, &prefix);
        let stop = provider.stop_sequences();

        let raw = match provider.completion(&prompt, &stop, self.max_tokens).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "continuation request failed");
                return partial.to_string();
            }
        };

        // Some backends echo the prompt or the prefix before the new text.
        let fresh = raw
            .strip_prefix(prompt.as_str())
            .or_else(|| raw.strip_prefix(prefix.as_str()))
            .unwrap_or(raw.as_str());
        let fresh = truncate_at_stop(fresh, &stop);

        if fresh.trim().is_empty() {
            tracing::debug!("continuation produced no new text");
            return partial.to_string();
        }
        format!("{}{}", prefix, fresh)
    }
}

/// Cut text at the earliest stop sequence the backend failed to honor.
fn truncate_at_stop<'a>(text: &'a str, stop: &[String]) -> &'a str {
    let cut = stop
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .unwrap_or(text.len());
    &text[..cut]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::provider::Generation;
    use crate::types::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct Completer {
        supports: bool,
        reply: Result<String>,
        seen_prompt: Mutex<Option<String>>,
    }

    impl Completer {
        fn replying(reply: Result<String>) -> Self {
            Self {
                supports: true,
                reply,
                seen_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for Completer {
        async fn generate(&self, _messages: &[Message]) -> Result<Generation> {
            Ok(Generation::default())
        }

        fn supports_completion(&self) -> bool {
            self.supports
        }

        async fn completion(&self, prompt: &str, _stop: &[String], max_tokens: u32) -> Result<String> {
            assert_eq!(max_tokens, 300);
            *self.seen_prompt.lock().unwrap() = Some(prompt.to_string());
            match &self.reply {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(Error::connection("down")),
            }
        }
    }

    const PARTIAL: &str = "Let me compute.\n<code>```python\nprint(1)\n```</code>";
    const RESULT: &str = "\n<code_output>\n1\n</code_output>";

    #[tokio::test]
    async fn test_extends_prefix() {
        let provider = Completer::replying(Ok("\nThe result is 1.".into()));
        let out = ContinuationCoordinator::default()
            .continue_generation(&provider, &[Message::user("go")], PARTIAL, RESULT)
            .await;
        assert_eq!(out, format!("{}{}\nThe result is 1.", PARTIAL, RESULT));

        let prompt = provider.seen_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.ends_with(RESULT));
        assert!(prompt.contains("<|im_start|>user\ngo<|im_end|>"));
    }

    #[tokio::test]
    async fn test_strips_echoed_prefix_and_stop_tokens() {
        let reply = format!("{}{} Done.<|im_end|>junk", PARTIAL, RESULT);
        let provider = Completer::replying(Ok(reply));
        let out = ContinuationCoordinator::default()
            .continue_generation(&provider, &[], PARTIAL, RESULT)
            .await;
        assert_eq!(out, format!("{}{} Done.", PARTIAL, RESULT));
    }

    #[tokio::test]
    async fn test_empty_continuation_returns_partial() {
        let provider = Completer::replying(Ok("   \n".into()));
        let out = ContinuationCoordinator::default()
            .continue_generation(&provider, &[], PARTIAL, RESULT)
            .await;
        assert_eq!(out, PARTIAL);
    }

    #[tokio::test]
    async fn test_failure_returns_partial() {
        let provider = Completer::replying(Err(Error::connection("x")));
        let out = ContinuationCoordinator::default()
            .continue_generation(&provider, &[], PARTIAL, RESULT)
            .await;
        assert_eq!(out, PARTIAL);
    }

    #[tokio::test]
    async fn test_unsupported_is_noop() {
        let mut provider = Completer::replying(Ok("more".into()));
        provider.supports = false;
        let out = ContinuationCoordinator::default()
            .continue_generation(&provider, &[], PARTIAL, RESULT)
            .await;
        assert_eq!(out, PARTIAL);
        assert!(provider.seen_prompt.lock().unwrap().is_none());
    }
}
