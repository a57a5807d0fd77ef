//! Placing execution results back into text.
//!
//! A result marker is inserted immediately after the raw directive span; the
//! directive itself is never rewritten, so the transcript stays one linear
//! text with every original byte in place.

use super::extractor::{extract, Directive};

/// A text decomposed into literal runs and directives.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    Text(&'a str),
    Directive(Directive),
}

/// Split `text` into alternating literal and directive segments.
/// Malformed regions stay inside literal segments.
pub fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    for directive in extract(text) {
        if directive.span.start > last {
            out.push(Segment::Text(&text[last..directive.span.start]));
        }
        last = directive.span.end;
        out.push(Segment::Directive(directive));
    }
    if last < text.len() {
        out.push(Segment::Text(&text[last..]));
    }
    out
}

/// Reassemble segments without inserting any results.
pub fn render(segments: &[Segment<'_>]) -> String {
    segments
        .iter()
        .map(|s| match s {
            Segment::Text(t) => *t,
            Segment::Directive(d) => d.raw.as_str(),
        })
        .collect()
}

/// Insert `marker` at byte offset `at` (a directive span end).
///
/// Returns the new text and the offset just past the inserted marker.
pub fn splice_at(text: &str, at: usize, marker: &str) -> (String, usize) {
    let at = at.min(text.len());
    let mut out = String::with_capacity(text.len() + marker.len());
    out.push_str(&text[..at]);
    out.push_str(marker);
    out.push_str(&text[at..]);
    (out, at + marker.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const SAMPLE: &str = "Check <tool_use>name: now parameters: {}</tool_use> and <code>print(1)</code>.";

    #[test]
    fn test_segments_alternate() {
        let segs = segments(SAMPLE);
        assert_eq!(segs.len(), 5);
        assert_eq!(segs[0], Segment::Text("Check "));
        assert!(matches!(segs[1], Segment::Directive(_)));
        assert_eq!(segs[4], Segment::Text("."));
        assert_eq!(render(&segs), SAMPLE);
    }

    #[test]
    fn test_splice_at_reports_resume_offset() {
        let (out, resume) = splice_at("ab", 1, "XY");
        assert_eq!(out, "aXYb");
        assert_eq!(resume, 3);
        assert_eq!(&out[resume..], "b");
    }

    proptest! {
        #[test]
        fn prop_round_trip_is_byte_exact(
            parts in prop::collection::vec(
                prop_oneof![
                    "[a-zA-Z0-9 .,\n]{0,20}",
                    Just("<code>print(1)</code>".to_string()),
                    Just("<CODE>```sh\necho hi\n```</CODE>".to_string()),
                    Just("<tool_use>name: t parameters: {\"a\": 1}</tool_use>".to_string()),
                    Just("<tool_use>broken</tool_use>".to_string()),
                    Just("<code>".to_string()),
                    Just("</tool_use>".to_string()),
                ],
                0..12,
            )
        ) {
            let text: String = parts.concat();
            prop_assert_eq!(render(&segments(&text)), text.clone());
            let (unchanged, _) = splice_at(&text, text.len(), "");
            prop_assert_eq!(unchanged, text);
        }
    }
}
