//! Text preparation for speech: markdown/URL cleanup and chunking.

use std::sync::LazyLock;

use regex::Regex;

static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+"#).unwrap());
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`]+)`").unwrap());

/// Strip markup that reads badly aloud and collapse whitespace.
///
/// Returns an empty string when nothing speakable is left.
pub fn prepare_for_speech(text: &str) -> String {
    let text = MD_LINK.replace_all(text, "$1");
    let text = URL.replace_all(&text, "");
    let text = BOLD.replace_all(&text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = CODE.replace_all(&text, "$1");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split text into speakable chunks.
///
/// Sentences end at `.`, `!` or `?` followed by whitespace. A sentence longer
/// than `max_chars` is broken at word boundaries; a single word longer than
/// `max_chars` becomes its own chunk.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    for sentence in split_sentences(text) {
        if sentence.chars().count() <= max_chars {
            chunks.push(sentence.to_string());
            continue;
        }
        let mut current = String::new();
        for word in sentence.split_whitespace() {
            let needed = if current.is_empty() {
                word.chars().count()
            } else {
                current.chars().count() + 1 + word.chars().count()
            };
            if needed > max_chars && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            chunks.push(current);
        }
    }
    chunks
}

/// Split text into sentences at .!? boundaries.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if (b == b'.' || b == b'!' || b == b'?')
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_whitespace()
        {
            let end = i + 1;
            let s = text[start..end].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = end;
        }
    }

    let s = text[start..].trim();
    if !s.is_empty() {
        sentences.push(s);
    }

    sentences
}
