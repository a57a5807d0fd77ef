//! Language-model provider abstraction.
//!
//! Concrete HTTP clients live outside this crate; the runtime only needs
//! whole and streamed generation, optional raw completion, and a health probe.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use super::message::Message;
use crate::types::{Error, Result};

pub const CHATML_START: &str = "<|im_start|>";
pub const CHATML_END: &str = "<|im_end|>";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A complete generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Generation {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// One fragment of a streamed generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub text: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            usage: None,
        }
    }

    pub fn last(text: impl Into<String>, usage: Option<Usage>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            usage,
        }
    }
}

/// Finite, single-consumer stream of generation fragments.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

#[async_trait]
pub trait LlmProvider: Send + Sync + Debug {
    /// Generate a whole response for the message list.
    async fn generate(&self, messages: &[Message]) -> Result<Generation>;

    /// Generate incrementally. The default yields the whole generation as one
    /// final chunk.
    async fn generate_stream(&self, messages: &[Message]) -> Result<ChunkStream> {
        let generation = self.generate(messages).await?;
        let chunk = StreamChunk::last(generation.text, generation.usage);
        Ok(stream::iter(vec![Ok(chunk)]).boxed())
    }

    /// Whether `completion` is available (raw prompt continuation).
    fn supports_completion(&self) -> bool {
        false
    }

    async fn completion(&self, _prompt: &str, _stop: &[String], _max_tokens: u32) -> Result<String> {
        Err(Error::unsupported("raw completion"))
    }

    /// Stop sequences for completion requests.
    fn stop_sequences(&self) -> Vec<String> {
        vec![CHATML_END.to_string(), format!("{}user", CHATML_START)]
    }

    /// Render a conversation followed by an open assistant turn that already
    /// contains `partial`.
    fn render_prompt(&self, messages: &[Message], partial: &str) -> String {
        render_chatml(messages, partial)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// ChatML rendering with an open assistant turn.
pub fn render_chatml(messages: &[Message], partial: &str) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str(CHATML_START);
        prompt.push_str(message.role.as_str());
        if let Some(name) = &message.name {
            prompt.push(' ');
            prompt.push_str(name);
        }
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str(CHATML_END);
        prompt.push('\n');
    }
    prompt.push_str(CHATML_START);
    prompt.push_str("assistant\n");
    prompt.push_str(partial);
    prompt
}
