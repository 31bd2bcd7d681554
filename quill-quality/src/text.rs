//! Small text helpers shared by scoring, rules and repair.

pub fn words(text: &str) -> Vec<&str> {
    text.split_whitespace().collect()
}

/// Sentences, split on terminal punctuation. A trailing fragment counts as a sentence.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            let s = text[start..end].trim();
            if s.chars().any(|c| c.is_alphanumeric()) {
                out.push(s);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if tail.chars().any(|c| c.is_alphanumeric()) {
        out.push(tail);
    }
    out
}

pub fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

pub fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn ends_cleanly(text: &str) -> bool {
    text.trim_end()
        .chars()
        .last()
        .map_or(false, |c| matches!(c, '.' | '!' | '?' | '"' | '\u{201d}' | '\u{2019}' | '\u{2026}' | '*'))
}
