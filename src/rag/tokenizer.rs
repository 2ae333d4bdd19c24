//! Deterministic token counting for the chunker.
//!
//! Uses the cl100k byte-pair encoding so counts are stable across builds
//! and machines, independent of whichever model actually serves requests.

use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

static BPE: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base tables are embedded"));

/// Count tokens in `text`.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_ordinary(text).len()
}

/// Split `text` on sentence boundaries, keeping terminators attached.
///
/// Boundary = `.`, `!`, or `?` followed by whitespace, or a newline. Used
/// when oversized prose has to be split; code and tables never pass
/// through here.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().is_none_or(|next| next.is_whitespace()),
            _ => false,
        };
        if boundary && !current.trim().is_empty() {
            sentences.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_is_deterministic() {
        let text = "Terraform manages infrastructure as code.";
        assert_eq!(count_tokens(text), count_tokens(text));
        assert!(count_tokens(text) > 0);
    }

    #[test]
    fn longer_text_counts_more() {
        assert!(count_tokens("one two three four five") > count_tokens("one"));
    }

    #[test]
    fn sentences_keep_their_terminators() {
        let parts = split_sentences("First sentence. Second one! A third? tail");
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].trim(), "First sentence.");
        assert_eq!(parts[1].trim(), "Second one!");
        assert_eq!(parts[3].trim(), "tail");
    }

    #[test]
    fn abbreviation_like_dots_without_space_do_not_split() {
        let parts = split_sentences("See v1.2.3 for details.");
        assert_eq!(parts.len(), 1);
    }
}
