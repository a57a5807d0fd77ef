//! Directives embedded in model output: tool invocations and code blocks.

mod arguments;
mod extractor;
mod splice;

pub use arguments::{parse_parameters, parse_tool_body, ToolCallBody};
pub use extractor::{
    contains_directive, extract, Directive, DirectiveKind, DirectiveScanner, DEFAULT_LANGUAGE,
};
pub use splice::{render, segments, splice_at, Segment};
