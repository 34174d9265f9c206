//! Greedy packing of sentences into size-bounded blocks.

const STRONG_BREAKS: &[char] = &['.', '!', '?', '…'];
const CLAUSE_BREAKS: &[char] = &[',', ';', ':', '–', '—'];

/// Pack sentences into blocks of at most `max_chars` characters.
///
/// Sentences are joined with single spaces. A sentence longer than the limit
/// flushes the current block and is force-split on its own.
pub fn pack_blocks(sentences: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for sentence in sentences {
        let len = sentence.chars().count();
        if len == 0 {
            continue;
        }

        if len > max_chars {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            blocks.extend(force_split(&sentence, max_chars));
            continue;
        }

        if current.is_empty() {
            current = sentence;
            current_len = len;
        } else if current_len + 1 + len <= max_chars {
            current.push(' ');
            current.push_str(&sentence);
            current_len += 1 + len;
        } else {
            blocks.push(std::mem::replace(&mut current, sentence));
            current_len = len;
        }
    }

    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// Split an oversized sentence into pieces of at most `max_chars` characters.
///
/// Cut preference: after sentence punctuation within the look-behind window
/// `[max/2, max]`, then after clause punctuation in the same window, then the
/// last whitespace, then a hard cut at exactly `max_chars`.
pub fn force_split(sentence: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut rest = sentence.trim();

    while rest.chars().count() > max_chars {
        let cut = split_point(rest, max_chars);
        let (head, tail) = rest.split_at(cut);
        let head = head.trim_end();
        if !head.is_empty() {
            pieces.push(head.to_string());
        }
        rest = tail.trim_start();
    }

    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Byte offset to cut `text` at; the head holds at most `max_chars` characters.
///
/// `text` must be longer than `max_chars` characters.
fn split_point(text: &str, max_chars: usize) -> usize {
    // chars[0..=max_chars] exists because text is longer than max_chars
    let chars: Vec<(usize, char)> = text.char_indices().take(max_chars + 1).collect();
    let window_start = (max_chars / 2).max(1);

    // A cut at `c` keeps chars[..c]; punctuation cuts need whitespace right after.
    let punct_cut = |set: &[char]| {
        (window_start..=max_chars)
            .rev()
            .find(|&c| set.contains(&chars[c - 1].1) && chars[c].1.is_whitespace())
    };

    let cut = punct_cut(STRONG_BREAKS)
        .or_else(|| punct_cut(CLAUSE_BREAKS))
        .or_else(|| (1..=max_chars).rev().find(|&c| chars[c].1.is_whitespace()))
        .unwrap_or(max_chars);

    chars[cut].0
}
