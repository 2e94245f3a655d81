//! Text span generator: a sliding window over extracted body text
//! (spec.md §4.3).
//!
//! Target span size is 500-1000 characters with a default 100-character
//! overlap. The generator prefers break points in this order: paragraph
//! boundary (blank line) > sentence boundary (`.!?` followed by
//! whitespace) > word boundary (last space) > hard cut. Overlap never
//! regresses the start offset of the next span.

use crate::models::{Locator, SpanType};

use super::{make_span, SpanData};

pub const TARGET_MIN: usize = 500;
pub const TARGET_MAX: usize = 1000;
pub const DEFAULT_OVERLAP: usize = 100;

/// Generate text spans over `body`, deriving page hints from a
/// `page_breaks: [offset, ...]` array in `metadata` when present.
pub fn generate_text_spans(
    body: &str,
    metadata: &serde_json::Value,
    target_size: usize,
    overlap: usize,
) -> Vec<SpanData> {
    let target_size = target_size.clamp(TARGET_MIN, TARGET_MAX);
    let overlap = overlap.min(target_size.saturating_sub(1));
    let page_breaks = parse_page_breaks(metadata);

    let chars: Vec<char> = body.chars().collect();
    let len = chars.len();
    if len == 0 {
        return Vec::new();
    }

    let mut spans = Vec::new();
    let mut start = 0usize;

    while start < len {
        let ideal_end = (start + target_size).min(len);
        let end = if ideal_end >= len {
            len
        } else {
            find_break_point(&chars, start, ideal_end)
        };

        let text_content: String = chars[start..end].iter().collect();
        let page_hint = page_hint_for_offset(&page_breaks, start);
        let locator = Locator::Text {
            offset_start: start as i64,
            offset_end: end as i64,
            page_hint,
        };
        spans.push(make_span(
            text_content,
            locator,
            None,
            SpanType::Text,
            serde_json::json!({}),
        ));

        if end >= len {
            break;
        }

        // Advance by at least one character past the overlap so two
        // successive spans never share the same start offset (spec.md §4.3).
        let next_start = end.saturating_sub(overlap).max(start + 1);
        start = next_start;
    }

    spans
}

fn parse_page_breaks(metadata: &serde_json::Value) -> Vec<i64> {
    metadata
        .get("page_breaks")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_i64()).collect())
        .unwrap_or_default()
}

fn page_hint_for_offset(page_breaks: &[i64], offset: usize) -> Option<i64> {
    if page_breaks.is_empty() {
        return None;
    }
    let mut page = 1i64;
    for &brk in page_breaks {
        if (offset as i64) >= brk {
            page += 1;
        } else {
            break;
        }
    }
    Some(page)
}

/// Search backward from `ideal_end` within the current window for the
/// best break point, falling back in priority order to a hard cut.
fn find_break_point(chars: &[char], start: usize, ideal_end: usize) -> usize {
    let window_floor = start + (ideal_end - start) / 2; // don't search back past the window's midpoint
    let search_range = window_floor..ideal_end;

    // Paragraph boundary: a blank line (\n\n) ending at or before ideal_end.
    if let Some(pos) = rfind_paragraph_break(chars, search_range.clone()) {
        return pos;
    }
    // Sentence boundary: '.', '!', or '?' followed by whitespace.
    if let Some(pos) = rfind_sentence_break(chars, search_range.clone()) {
        return pos;
    }
    // Word boundary: last space.
    if let Some(pos) = rfind_word_break(chars, search_range) {
        return pos;
    }
    ideal_end
}

fn rfind_paragraph_break(chars: &[char], range: std::ops::Range<usize>) -> Option<usize> {
    let mut i = range.end;
    while i > range.start {
        i -= 1;
        if i + 1 < chars.len() && chars[i] == '\n' && chars.get(i.wrapping_sub(1)) == Some(&'\n') {
            return Some(i + 1);
        }
    }
    None
}

fn rfind_sentence_break(chars: &[char], range: std::ops::Range<usize>) -> Option<usize> {
    let mut i = range.end;
    while i > range.start {
        i -= 1;
        if matches!(chars[i], '.' | '!' | '?') {
            if let Some(next) = chars.get(i + 1) {
                if next.is_whitespace() {
                    return Some(i + 1);
                }
            }
        }
    }
    None
}

fn rfind_word_break(chars: &[char], range: std::ops::Range<usize>) -> Option<usize> {
    let mut i = range.end;
    while i > range.start {
        i -= 1;
        if chars[i] == ' ' {
            return Some(i + 1);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_short_document_yields_one_span() {
        let spans = generate_text_spans("hello world", &serde_json::json!({}), 500, 100);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text_content, "hello world");
    }

    #[test]
    fn long_document_splits_into_multiple_spans_without_regressing_start() {
        let paragraph = "Lorem ipsum dolor sit amet consectetur adipiscing elit. ".repeat(40);
        let spans = generate_text_spans(&paragraph, &serde_json::json!({}), 500, 100);
        assert!(spans.len() > 1);
        let mut last_start = -1i64;
        for span in &spans {
            if let Locator::Text { offset_start, .. } = span.locator {
                assert!(offset_start > last_start, "start offsets must strictly advance");
                last_start = offset_start;
            }
        }
    }

    #[test]
    fn prefers_sentence_boundary_over_hard_cut() {
        let text = format!("{}. {}", "a".repeat(490), "b".repeat(600));
        let spans = generate_text_spans(&text, &serde_json::json!({}), 500, 50);
        let first = &spans[0];
        assert!(first.text_content.ends_with(". ") || first.text_content.ends_with('.'));
    }

    #[test]
    fn regenerating_spans_is_deterministic() {
        let text = "Paragraph one is here.\n\nParagraph two follows after a break and is considerably longer than the first to force a split across the window boundary many times over indeed.".repeat(3);
        let first = generate_text_spans(&text, &serde_json::json!({}), 500, 100);
        let second = generate_text_spans(&text, &serde_json::json!({}), 500, 100);
        let hashes_a: Vec<&str> = first.iter().map(|s| s.span_hash.as_str()).collect();
        let hashes_b: Vec<&str> = second.iter().map(|s| s.span_hash.as_str()).collect();
        assert_eq!(hashes_a, hashes_b);
    }

    #[test]
    fn page_hint_derived_from_page_breaks_metadata() {
        let text = "a".repeat(1200);
        let metadata = serde_json::json!({ "page_breaks": [600] });
        let spans = generate_text_spans(&text, &metadata, 500, 50);
        let first_page = match spans[0].locator {
            Locator::Text { page_hint, .. } => page_hint,
            _ => None,
        };
        assert_eq!(first_page, Some(1));
        let later_page_2 = spans.iter().any(|s| match s.locator {
            Locator::Text { page_hint, offset_start, .. } => page_hint == Some(2) && offset_start >= 600,
            _ => false,
        });
        assert!(later_page_2);
    }
}
