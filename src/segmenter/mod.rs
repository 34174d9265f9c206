//! Sentence segmenter: raw document text → TTS-ready blocks.
//!
//! Pipeline, per paragraph:
//! 1. Normalize extraction artifacts (hyphenated wraps, URLs, whitespace)
//! 2. Insert sentence-boundary spaces PDF extraction dropped (`end.Next`)
//! 3. Split into sentences (rule-based, abbreviation aware)
//! 4. Merge sentences that leave a quotation open
//! 5. Greedily pack sentences into blocks of at most `max_block_chars`
//!
//! The whole thing is a pure function of its input, so a reader can restart
//! playback at any block index by segmenting again.

mod normalize;
mod pack;
mod quotes;
mod sentences;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use normalize::{insert_missing_spaces, normalize_paragraph};
pub use pack::{force_split, pack_blocks};
pub use quotes::{has_open_quote, merge_quoted};
pub use sentences::split_sentences;

/// Nominal upper bound for one synthesis call.
pub const DEFAULT_MAX_BLOCK_CHARS: usize = 450;

/// How paragraph boundaries are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentMode {
    /// Blank lines separate paragraphs; single newlines are line wraps.
    #[default]
    Pdf,
    /// Every newline separates paragraphs, so block text matches the EPUB DOM.
    #[serde(alias = "html")]
    Epub,
}

impl FromStr for SegmentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(Self::Pdf),
            "epub" | "html" => Ok(Self::Epub),
            other => Err(format!("unknown segment mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub max_block_chars: usize,
    pub mode: SegmentMode,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_block_chars: DEFAULT_MAX_BLOCK_CHARS,
            mode: SegmentMode::Pdf,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        let max_block_chars = config.max_block_chars.max(1);
        Self {
            config: SegmenterConfig {
                max_block_chars,
                ..config
            },
        }
    }

    pub fn config(&self) -> SegmenterConfig {
        self.config
    }

    /// Segment text into ordered, non-empty blocks.
    ///
    /// A block never spans two paragraphs and never exceeds
    /// `max_block_chars` characters.
    pub fn segment(&self, text: &str) -> Vec<String> {
        let max = self.config.max_block_chars;
        let mut blocks = Vec::new();

        for paragraph in paragraphs(text, self.config.mode) {
            let prepared = prepare_paragraph(paragraph);
            if prepared.is_empty() {
                continue;
            }
            let sentences = split_sentences(&prepared);
            let merged = merge_quoted(sentences, max);
            blocks.extend(pack_blocks(merged, max));
        }

        blocks
    }
}

/// Normalized text of all paragraphs joined by single spaces.
///
/// Joining the blocks of [`Segmenter::segment`] with single spaces gives
/// back this string, except where an unbroken token had to be hard-cut.
pub fn normalize_text(text: &str, mode: SegmentMode) -> String {
    paragraphs(text, mode)
        .into_iter()
        .map(prepare_paragraph)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn prepare_paragraph(paragraph: &str) -> String {
    insert_missing_spaces(&normalize_paragraph(paragraph))
}

fn paragraphs(text: &str, mode: SegmentMode) -> Vec<&str> {
    match mode {
        SegmentMode::Pdf => normalize::split_blank_lines(text),
        SegmentMode::Epub => text.split('\n').collect(),
    }
}
