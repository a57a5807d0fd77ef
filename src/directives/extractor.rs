//! Directive extraction from model output.
//!
//! Two tagged regions are recognized, case-insensitively:
//! `<tool_use>...</tool_use>` for tool invocations and `<code>...</code>` for
//! code blocks. Regions never nest; the first closing tag ends a region.

use regex::Regex;
use serde_json::{Map, Value};
use std::ops::Range;
use std::sync::LazyLock;

use super::arguments::parse_tool_body;

pub const DEFAULT_LANGUAGE: &str = "python";

#[allow(clippy::expect_used)]
static REGION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<tool_use>(.*?)</tool_use>|<code>(.*?)</code>")
        .expect("directive region pattern is valid")
});

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveKind {
    ToolInvocation {
        name: String,
        arguments: Map<String, Value>,
        /// Explicit owning server, when the body names one.
        server: Option<String>,
    },
    CodeBlock {
        language: String,
        source: String,
    },
}

/// A parsed directive and the exact text it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub kind: DirectiveKind,
    /// Byte range of the raw region (tags included) in the scanned text.
    pub span: Range<usize>,
    pub raw: String,
}

impl Directive {
    /// Name used for result markers and tool messages.
    pub fn label(&self) -> &str {
        match &self.kind {
            DirectiveKind::ToolInvocation { name, .. } => name,
            DirectiveKind::CodeBlock { .. } => "code",
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, DirectiveKind::CodeBlock { .. })
    }
}

/// A tagged region located in text, parsed or not.
#[derive(Debug)]
enum Region {
    Parsed(Directive),
    Malformed { span: Range<usize>, reason: String },
}

impl Region {
    fn end(&self) -> usize {
        match self {
            Region::Parsed(d) => d.span.end,
            Region::Malformed { span, .. } => span.end,
        }
    }
}

fn regions_from(text: &str, from: usize) -> impl Iterator<Item = Region> + '_ {
    std::iter::successors(REGION_PATTERN.captures_at(text, from), move |prev| {
        let end = prev.get(0)?.end();
        REGION_PATTERN.captures_at(text, end)
    })
    .map(|caps| {
        // Group 0 always exists for a match.
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let raw = &text[whole.clone()];
        let parsed = if let Some(body) = caps.get(1) {
            parse_tool_region(body.as_str())
        } else if let Some(body) = caps.get(2) {
            parse_code_region(body.as_str())
        } else {
            Err("empty region".to_string())
        };
        match parsed {
            Ok(kind) => Region::Parsed(Directive {
                kind,
                span: whole,
                raw: raw.to_string(),
            }),
            Err(reason) => Region::Malformed {
                span: whole,
                reason,
            },
        }
    })
}

fn parse_tool_region(body: &str) -> std::result::Result<DirectiveKind, String> {
    let call = parse_tool_body(body).map_err(|e| e.to_string())?;
    Ok(DirectiveKind::ToolInvocation {
        name: call.name,
        arguments: call.arguments,
        server: call.server,
    })
}

fn parse_code_region(body: &str) -> std::result::Result<DirectiveKind, String> {
    let trimmed = body.trim();
    let (language, code) = match trimmed.strip_prefix("```") {
        Some(fenced) => {
            let (tag, rest) = fenced.split_once('\n').unwrap_or((fenced, ""));
            let rest = rest.trim_end();
            let rest = rest.strip_suffix("```").unwrap_or(rest);
            let tag = tag.trim();
            let language = if tag.is_empty() {
                DEFAULT_LANGUAGE.to_string()
            } else {
                tag.to_lowercase()
            };
            (language, rest)
        }
        None => (DEFAULT_LANGUAGE.to_string(), trimmed),
    };

    let source = dedent(code).trim().to_string();
    if source.is_empty() {
        return Err("code block is empty".to_string());
    }
    Ok(DirectiveKind::CodeBlock { language, source })
}

/// Remove the whitespace prefix common to every non-blank line.
pub(crate) fn dedent(text: &str) -> String {
    let prefix = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| &l[..l.len() - l.trim_start().len()])
        .reduce(|common, indent| {
            let shared = common
                .char_indices()
                .zip(indent.chars())
                .find(|((_, a), b)| a != b)
                .map_or(common.len().min(indent.len()), |((i, _), _)| i);
            &common[..shared]
        })
        .unwrap_or("");

    text.lines()
        .map(|l| l.strip_prefix(prefix).unwrap_or(l.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn log_malformed(span: &Range<usize>, reason: &str) {
    tracing::warn!(start = span.start, end = span.end, reason, "Skipping malformed directive");
}

/// Extract every well-formed directive from `text`, in order.
///
/// Malformed regions are logged and skipped; they never stop extraction of
/// the regions after them.
pub fn extract(text: &str) -> Vec<Directive> {
    regions_from(text, 0)
        .filter_map(|region| match region {
            Region::Parsed(d) => Some(d),
            Region::Malformed { span, reason } => {
                log_malformed(&span, &reason);
                None
            }
        })
        .collect()
}

/// Whether the text contains at least one well-formed directive.
pub fn contains_directive(text: &str) -> bool {
    regions_from(text, 0).any(|r| matches!(r, Region::Parsed(_)))
}

/// Incremental extraction over a growing buffer.
///
/// Everything before the cursor is resolved: either already returned, skipped
/// as malformed, or covered by a spliced result. Re-scanning after growth
/// therefore never yields a region twice.
#[derive(Debug, Clone, Default)]
pub struct DirectiveScanner {
    cursor: usize,
}

impl DirectiveScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Next complete directive after the cursor. The cursor moves past it.
    pub fn next_directive(&mut self, text: &str) -> Option<Directive> {
        if self.cursor > text.len() {
            return None;
        }
        for region in regions_from(text, self.cursor) {
            self.cursor = region.end();
            match region {
                Region::Parsed(d) => return Some(d),
                Region::Malformed { span, reason } => log_malformed(&span, &reason),
            }
        }
        None
    }

    /// Mark everything up to `offset` as resolved, typically the end of a
    /// result marker just spliced in.
    pub fn resolve_through(&mut self, offset: usize) {
        self.cursor = self.cursor.max(offset);
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(d: &Directive) -> (&str, &str) {
        match &d.kind {
            DirectiveKind::CodeBlock { language, source } => (language, source),
            other => panic!("expected code block, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_tool_and_code() {
        let text = "I'll check.\n<tool_use> name: get_time parameters: {} </tool_use>\nThen\n<code>```python\nprint(1)\n```</code> done";
        let found = extract(text);
        assert_eq!(found.len(), 2);

        match &found[0].kind {
            DirectiveKind::ToolInvocation { name, arguments, .. } => {
                assert_eq!(name, "get_time");
                assert!(arguments.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(&text[found[0].span.clone()], found[0].raw);
        assert!(found[0].raw.starts_with("<tool_use>"));

        assert_eq!(code(&found[1]), ("python", "print(1)"));
        assert_eq!(found[1].label(), "code");
    }

    #[test]
    fn test_code_language_defaults_and_lowercases() {
        let found = extract("<code>x = 1</code><CODE>```Bash\necho hi\n```</CODE><code>```\n  y = 2\n```</code>");
        assert_eq!(found.len(), 3);
        assert_eq!(code(&found[0]), ("python", "x = 1"));
        assert_eq!(code(&found[1]), ("bash", "echo hi"));
        assert_eq!(code(&found[2]), ("python", "y = 2"));
    }

    #[test]
    fn test_code_is_dedented() {
        let found = extract("<code>```python\n    if True:\n        print(1)\n```</code>");
        assert_eq!(code(&found[0]).1, "if True:\n    print(1)");
    }

    #[test]
    fn test_malformed_region_skipped_not_fatal() {
        let text = "<tool_use>no name here</tool_use> <code></code> <tool_use>name: ok parameters: {\"a\": 1}</tool_use>";
        let found = extract(text);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].label(), "ok");
    }

    #[test]
    fn test_unclosed_region_is_not_a_directive() {
        assert!(extract("<tool_use>name: x parameters: {}").is_empty());
        assert!(!contains_directive("<code>print(1)"));
        assert!(contains_directive("<code>print(1)</code>"));
    }

    #[test]
    fn test_scanner_is_incremental() {
        let mut scanner = DirectiveScanner::new();
        let mut text = String::from("Working <code>```python\nprint(");
        assert!(scanner.next_directive(&text).is_none());

        text.push_str("1)\n```</code>");
        let first = scanner.next_directive(&text).unwrap();
        assert_eq!(code(&first).1, "print(1)");
        assert!(scanner.next_directive(&text).is_none());

        // Result text containing tags must not be picked up once resolved.
        let marker = "\n<code_output>\n<code>fake</code>\n</code_output>";
        text.insert_str(first.span.end, marker);
        scanner.resolve_through(first.span.end + marker.len());
        assert!(scanner.next_directive(&text).is_none());

        text.push_str(" and <tool_use>name: t parameters: {}</tool_use>");
        let second = scanner.next_directive(&text).unwrap();
        assert_eq!(second.label(), "t");
        assert_eq!(&text[second.span.clone()], second.raw);
    }

    #[test]
    fn test_scanner_skips_malformed_once() {
        let mut scanner = DirectiveScanner::new();
        let text = "<tool_use>???</tool_use>";
        assert!(scanner.next_directive(text).is_none());
        assert_eq!(scanner.cursor(), text.len());
        scanner.reset();
        assert_eq!(scanner.cursor(), 0);
    }

    #[test]
    fn test_dedent_common_prefix() {
        assert_eq!(dedent("  a\n    b\n\n  c"), "a\n  b\n\nc");
        assert_eq!(dedent("a\n b"), "a\n b");
    }
}
