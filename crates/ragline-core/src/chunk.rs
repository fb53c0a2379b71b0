//! Overlapping passage splitter.
//!
//! Splits extracted document text into passages that target a maximum
//! length, with a configurable overlap between consecutive passages so
//! context survives the boundary.
//!
//! # Algorithm
//!
//! 1. From the current start, take a window of `max_chars`.
//! 2. Inside the trailing `lookback_fraction` of that window, look for a
//!    break point, in order of preference: paragraph (`\n\n`), sentence end
//!    (`.`, `!`, `?` followed by whitespace), any whitespace. Fall back to a
//!    hard cut at the window end.
//! 3. The next passage starts `overlap_fraction × max_chars` before the
//!    previous end, moved forward to the next word start when one exists
//!    inside the overlap.
//! 4. Passages whose trimmed text is shorter than `min_chars` are filtered
//!    and counted, never raised as an error.
//!
//! Passage text is always the exact slice `text[start_offset..end_offset]`,
//! so removing overlaps and concatenating reconstructs the input.
//!
//! Lengths and offsets are UTF-8 byte positions, snapped to char boundaries.
//!
//! # Example
//!
//! ```rust
//! use ragline_core::chunk::{plan_chunks, ChunkOptions};
//!
//! let plan = plan_chunks("Hello world.\n\nSecond paragraph.", &ChunkOptions::default());
//! assert_eq!(plan.passages.len(), 1);
//! assert_eq!(plan.filtered_count, 0);
//! ```

use crate::error::{Error, Result};

/// Approximate characters-per-token ratio used to turn a token budget into
/// a character budget.
pub const CHARS_PER_TOKEN: usize = 4;

/// Chunking policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOptions {
    /// Target maximum passage length.
    pub max_chars: usize,
    /// Overlap between consecutive passages, as a fraction of `max_chars`.
    pub overlap_fraction: f64,
    /// Passages with fewer trimmed characters are filtered.
    pub min_chars: usize,
    /// Fraction of the window, counted back from its end, searched for a
    /// natural break point.
    pub lookback_fraction: f64,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            max_chars: 700 * CHARS_PER_TOKEN,
            overlap_fraction: 0.15,
            min_chars: 16,
            lookback_fraction: 0.3,
        }
    }
}

impl ChunkOptions {
    pub fn from_tokens(max_tokens: usize) -> Self {
        Self {
            max_chars: max_tokens * CHARS_PER_TOKEN,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chars == 0 {
            return Err(Error::validation("chunking.max_chars must be > 0"));
        }
        if !(0.0..=0.5).contains(&self.overlap_fraction) {
            return Err(Error::validation(
                "chunking.overlap_fraction must be in [0.0, 0.5]",
            ));
        }
        if !(0.0..0.5).contains(&self.lookback_fraction) {
            return Err(Error::validation(
                "chunking.lookback_fraction must be in [0.0, 0.5)",
            ));
        }
        Ok(())
    }

    pub fn overlap_chars(&self) -> usize {
        (self.max_chars as f64 * self.overlap_fraction).round() as usize
    }

    fn lookback_chars(&self) -> usize {
        (self.max_chars as f64 * self.lookback_fraction).round() as usize
    }
}

/// A passage borrowed from the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Passage<'a> {
    pub text: &'a str,
    pub start_offset: usize,
    pub end_offset: usize,
}

impl Passage<'_> {
    /// Whether the passage survives the filtering policy.
    pub fn is_substantive(&self, min_chars: usize) -> bool {
        let trimmed = self.text.trim();
        !trimmed.is_empty() && trimmed.chars().count() >= min_chars
    }
}

/// Lazy, finite iterator over raw (unfiltered) passages.
///
/// Restart by cloning before iterating, or by calling [`chunk_text`] again.
#[derive(Debug, Clone)]
pub struct Passages<'a> {
    text: &'a str,
    max_chars: usize,
    overlap: usize,
    lookback: usize,
    cursor: Option<usize>,
}

/// Split `text` into raw passages according to `options`.
pub fn chunk_text<'a>(text: &'a str, options: &ChunkOptions) -> Passages<'a> {
    Passages {
        text,
        max_chars: options.max_chars.max(1),
        overlap: options.overlap_chars(),
        lookback: options.lookback_chars(),
        cursor: if text.is_empty() { None } else { Some(0) },
    }
}

impl<'a> Iterator for Passages<'a> {
    type Item = Passage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor?;
        let text = self.text;
        let len = text.len();
        if start >= len {
            self.cursor = None;
            return None;
        }

        let end = if start + self.max_chars >= len {
            len
        } else {
            let mut hard_end = floor_char_boundary(text, start + self.max_chars);
            if hard_end <= start {
                hard_end = next_char_boundary(text, start);
            }
            self.find_break(start, hard_end)
        };

        self.cursor = if end >= len {
            None
        } else {
            Some(self.next_start(start, end))
        };

        Some(Passage {
            text: &text[start..end],
            start_offset: start,
            end_offset: end,
        })
    }
}

impl Passages<'_> {
    /// Pick the end of the passage starting at `start`, at or before
    /// `hard_end`.
    fn find_break(&self, start: usize, hard_end: usize) -> usize {
        let text = self.text;
        let window_start = ceil_char_boundary(
            text,
            hard_end.saturating_sub(self.lookback).max(start + 1),
        );
        if window_start >= hard_end {
            return hard_end;
        }
        let window = &text[window_start..hard_end];

        if let Some(pos) = window.rfind("\n\n") {
            return window_start + pos + 2;
        }

        let mut sentence_end = None;
        let mut prev: Option<(usize, char)> = None;
        for (i, c) in window.char_indices() {
            if let Some((_, p)) = prev {
                if matches!(p, '.' | '!' | '?') && c.is_whitespace() {
                    sentence_end = Some(i + c.len_utf8());
                }
            }
            prev = Some((i, c));
        }
        if let Some(pos) = sentence_end {
            return window_start + pos;
        }

        if let Some((pos, c)) = window
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
        {
            return window_start + pos + c.len_utf8();
        }

        hard_end
    }

    /// Start of the passage that follows one ending at `end`.
    fn next_start(&self, start: usize, end: usize) -> usize {
        let text = self.text;
        let mut next = ceil_char_boundary(text, end.saturating_sub(self.overlap));
        if next <= start || next > end {
            return end;
        }
        let at_word_start = text[..next]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        if !at_word_start {
            let window = &text[next..end];
            if let Some(ws) = window.find(char::is_whitespace) {
                if let Some(word) = window[ws..].find(|c: char| !c.is_whitespace()) {
                    next += ws + word;
                }
            }
        }
        next
    }
}

/// Passages that survived filtering, plus the number dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPlan<'a> {
    pub passages: Vec<Passage<'a>>,
    pub filtered_count: usize,
}

impl ChunkPlan<'_> {
    /// Passages produced before filtering.
    pub fn total_produced(&self) -> usize {
        self.passages.len() + self.filtered_count
    }
}

/// Chunk `text` and apply the filtering policy.
pub fn plan_chunks<'a>(text: &'a str, options: &ChunkOptions) -> ChunkPlan<'a> {
    let mut passages = Vec::new();
    let mut filtered_count = 0;
    for passage in chunk_text(text, options) {
        if passage.is_substantive(options.min_chars) {
            passages.push(passage);
        } else {
            filtered_count += 1;
        }
    }
    if filtered_count > 0 {
        tracing::debug!(
            kept = passages.len(),
            filtered = filtered_count,
            "filtered short passages"
        );
    }
    ChunkPlan {
        passages,
        filtered_count,
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .chars()
        .next()
        .map_or(s.len(), |c| index + c.len_utf8())
}
