//! Local search over the loaded window.
//!
//! Case-insensitive substring matching over text bodies. Nothing here
//! fetches history: what is not loaded is not searched.

use std::ops::Range;

use super::store::{Message, MessageKey};

/// One matching message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// The matching message.
    pub key: MessageKey,
    /// Byte ranges of every match in the message body, for highlighting.
    pub spans: Vec<Range<usize>>,
}

/// Filter `messages` down to the ones whose text contains `query`.
///
/// Results keep store order. An empty or all-whitespace query matches
/// everything with no spans. Otherwise the query is matched as typed,
/// surrounding whitespace included. Attachments are never matched.
#[must_use]
pub fn search(messages: &[Message], query: &str) -> Vec<SearchHit> {
    if query.trim().is_empty() {
        return messages
            .iter()
            .map(|m| SearchHit {
                key: m.key.clone(),
                spans: Vec::new(),
            })
            .collect();
    }

    messages
        .iter()
        .filter_map(|m| {
            let text = m.payload.as_text()?;
            let spans = find_spans(text, query);
            (!spans.is_empty()).then(|| SearchHit {
                key: m.key.clone(),
                spans,
            })
        })
        .collect()
}

/// Non-overlapping case-insensitive occurrences of `needle` in `haystack`,
/// as byte ranges into `haystack`.
#[must_use]
pub fn find_spans(haystack: &str, needle: &str) -> Vec<Range<usize>> {
    let needle: Vec<char> = needle.chars().flat_map(char::to_lowercase).collect();
    if needle.is_empty() {
        return Vec::new();
    }

    // Lowercase char by char, remembering where each lowered char came from.
    let mut folded: Vec<(char, usize, usize)> = Vec::with_capacity(haystack.len());
    for (start, c) in haystack.char_indices() {
        let end = start + c.len_utf8();
        folded.extend(c.to_lowercase().map(|lc| (lc, start, end)));
    }

    let mut spans = Vec::new();
    let mut i = 0;
    while i + needle.len() <= folded.len() {
        let window = &folded[i..i + needle.len()];
        if window.iter().map(|(c, _, _)| *c).eq(needle.iter().copied()) {
            spans.push(window[0].1..window[needle.len() - 1].2);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    spans
}
