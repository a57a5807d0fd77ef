//! Language-model side of the runtime: messages, the provider seam and
//! in-place continuation.

mod continuation;
mod message;
mod provider;

pub use continuation::ContinuationCoordinator;
pub use message::{Conversation, Message, Role};
pub use provider::{
    render_chatml, ChunkStream, Generation, LlmProvider, StreamChunk, Usage, CHATML_END,
    CHATML_START,
};
