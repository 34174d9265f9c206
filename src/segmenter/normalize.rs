//! Cleanup of text-extraction artifacts before sentence splitting.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static BLANK_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t\r\f\v]*\n").unwrap());

// A word broken across a line wrap: "exam-\nple".
static HYPHEN_WRAP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{L})-[ \t]*\r?\n[ \t]*(\p{Ll})").unwrap());

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:https?://|www\.)([^\s/?#]+)\S*").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static MISSING_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\p{Ll}\d][.!?])(\p{Lu})").unwrap());

const URL_TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '"', '\''];

/// Split on blank lines (lines containing only whitespace count as blank).
pub(super) fn split_blank_lines(text: &str) -> Vec<&str> {
    BLANK_LINE.split(text).collect()
}

/// Join hyphenated wraps, speak URLs as their host, collapse whitespace.
pub fn normalize_paragraph(paragraph: &str) -> String {
    let joined = HYPHEN_WRAP.replace_all(paragraph, "$1$2");
    let spoken = URL.replace_all(&joined, |caps: &Captures| {
        let full = &caps[0];
        let trailing_start = full.trim_end_matches(URL_TRAILING).len();
        let host = caps[1]
            .trim_end_matches(URL_TRAILING)
            .trim_start_matches("www.")
            .to_string();
        format!("link to {host}{}", &full[trailing_start..])
    });
    WHITESPACE.replace_all(&spoken, " ").trim().to_string()
}

/// Restore the space PDF extraction drops between sentences (`end.Next`).
///
/// Only fires after a lowercase letter or digit so initials (`U.S.A`) and
/// decimals (`3.14`) are left alone.
pub fn insert_missing_spaces(text: &str) -> String {
    MISSING_SPACE.replace_all(text, "$1 $2").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hyphenated_wrap_is_joined() {
        assert_eq!(normalize_paragraph("an exam-\nple of it"), "an example of it");
        // capitalized continuation is a real compound, keep the hyphen
        assert_eq!(normalize_paragraph("Rust-\nLang"), "Rust- Lang");
    }

    #[test]
    fn urls_become_spoken_placeholder() {
        assert_eq!(
            normalize_paragraph("See https://www.example.com/docs/a?b=1. Then go."),
            "See link to example.com. Then go."
        );
        assert_eq!(normalize_paragraph("visit www.rust-lang.org"), "visit link to rust-lang.org");
    }

    #[test]
    fn whitespace_collapses() {
        assert_eq!(normalize_paragraph("  a\t\tb \n c  "), "a b c");
    }

    #[test]
    fn missing_spaces_inserted_only_after_lowercase_or_digit() {
        assert_eq!(insert_missing_spaces("done.Next"), "done. Next");
        assert_eq!(insert_missing_spaces("page 4!What"), "page 4! What");
        assert_eq!(insert_missing_spaces("U.S.A"), "U.S.A");
        assert_eq!(insert_missing_spaces("3.14"), "3.14");
    }

    #[test]
    fn blank_lines_split_paragraphs() {
        assert_eq!(split_blank_lines("a\nb\n \nc"), vec!["a\nb", "c"]);
    }
}
