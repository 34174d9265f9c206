//! Rule-based sentence splitting.
//!
//! A boundary is a run of terminal punctuation, optionally followed by
//! closing quotes or brackets, then whitespace, then a token that does not
//! start lowercase. Abbreviations and single-letter initials are skipped.

const TERMINALS: &[char] = &['.', '!', '?', '…'];
const CLOSERS: &[char] = &['"', '\'', '”', '’', ')', ']', '}', '»'];
const OPENERS: &[char] = &['"', '\'', '“', '‘', '(', '[', '{', '«'];

const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "mt", "fig", "figs", "vol",
    "ch", "p", "pp", "ed", "eds", "approx", "dept", "est", "inc", "ltd", "co", "corp", "gen",
    "col", "lt", "sgt", "capt", "rev", "hon", "e.g", "i.e", "cf", "al", "op", "cit", "ibid",
];

/// Split one normalized paragraph into trimmed sentences.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < n {
        if !TERMINALS.contains(&chars[i].1) {
            i += 1;
            continue;
        }

        let mut run_end = i;
        while run_end + 1 < n && TERMINALS.contains(&chars[run_end + 1].1) {
            run_end += 1;
        }
        let mut j = run_end;
        while j + 1 < n && CLOSERS.contains(&chars[j + 1].1) {
            j += 1;
        }

        let followed_by_space = j + 1 < n && chars[j + 1].1.is_whitespace();
        if !followed_by_space {
            i = j + 1;
            continue;
        }

        let mut k = j + 1;
        while k < n && chars[k].1.is_whitespace() {
            k += 1;
        }
        if k >= n {
            break;
        }

        let starts_lower = chars[k].1.is_lowercase();
        let abbreviation =
            chars[i].1 == '.' && run_end == i && is_abbreviation(&text[start..chars[i].0]);

        if starts_lower || abbreviation {
            i = k;
            continue;
        }

        let end = chars[j].0 + chars[j].1.len_utf8();
        push_trimmed(&mut sentences, &text[start..end]);
        start = chars[k].0;
        i = k;
    }

    if start < text.len() {
        push_trimmed(&mut sentences, &text[start..]);
    }
    sentences
}

fn push_trimmed(out: &mut Vec<String>, s: &str) {
    let s = s.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
}

/// Whether the word right before a period is an abbreviation or an initial.
fn is_abbreviation(before_period: &str) -> bool {
    let word = before_period
        .rsplit(char::is_whitespace)
        .next()
        .unwrap_or("")
        .trim_start_matches(OPENERS);
    if word.is_empty() {
        return false;
    }

    let mut letters = word.chars();
    if let (Some(c), None) = (letters.next(), letters.next()) {
        if c.is_uppercase() {
            return true;
        }
    }

    let lower = word.to_lowercase();
    ABBREVIATIONS.contains(&lower.as_str())
}
