//! Chunking utilities for splitting documents into overlapping segments.
//!
//! Text is split recursively on a priority list of separators: the
//! highest-priority separator present in the text is used first, pieces
//! that are still too long are re-split with the next separators, and
//! short pieces are merged back into chunks of at most `max_size`
//! characters. Adjacent chunks share up to `overlap` characters so that a
//! sentence cut at a boundary still appears whole in one of them.
//!
//! Lengths are counted in characters (Unicode scalar values), not bytes.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default maximum chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Default overlap between adjacent chunks in characters.
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Paragraph, line, word, then character boundaries.
pub fn default_separators() -> Vec<String> {
    ["\n\n", "\n", " ", ""].iter().map(|s| s.to_string()).collect()
}

/// Splitter settings.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{ChunkingConfig, DEFAULT_CHUNK_SIZE};
///
/// let config = ChunkingConfig::default();
/// assert_eq!(config.max_size, DEFAULT_CHUNK_SIZE);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Maximum chunk size in characters.
    #[serde(rename = "max_chunk_size")]
    pub max_size: usize,
    /// Characters shared between adjacent chunks.
    #[serde(rename = "chunk_overlap")]
    pub overlap: usize,
    /// Separators to try, highest priority first. The empty string means
    /// "split between any two characters".
    pub separator_priority: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
            separator_priority: default_separators(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config(
                "chunking.max_chunk_size must be > 0".into(),
            ));
        }
        if self.overlap >= self.max_size {
            return Err(Error::Config(format!(
                "chunking.chunk_overlap ({}) must be smaller than \
                 chunking.max_chunk_size ({})",
                self.overlap, self.max_size
            )));
        }
        if self.separator_priority.is_empty() {
            return Err(Error::Config(
                "chunking.separator_priority must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// A chunk of text from one source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Identity of the source document.
    pub partition_id: String,
    /// Zero-based position within the document.
    pub ordinal: usize,
    /// The chunk text content.
    pub text: String,
}

/// Split `text` into chunks and tag them with contiguous ordinals.
pub fn chunk_document(
    partition_id: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    split(text, config)
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| Chunk {
            partition_id: partition_id.to_string(),
            ordinal,
            text,
        })
        .collect()
}

/// Split text into overlapping chunks of at most `config.max_size`
/// characters.
///
/// Text that already fits returns a single trimmed chunk; blank text
/// returns no chunks.
///
/// # Examples
///
/// ```
/// use docrag::chunking::{split, ChunkingConfig};
///
/// let config = ChunkingConfig::default();
/// assert_eq!(split("  Hello, world!  ", &config), vec!["Hello, world!"]);
/// assert!(split("", &config).is_empty());
///
/// let config = ChunkingConfig { max_size: 10, overlap: 2, ..config };
/// let chunks = split("abcdefghijklmnopqrstuvwxy", &config);
/// assert_eq!(chunks, vec!["abcdefghij", "ijklmnopqr", "qrstuvwxy"]);
/// ```
pub fn split(text: &str, config: &ChunkingConfig) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    if char_len(text) <= config.max_size {
        return vec![text.trim().to_string()];
    }

    let separators: Vec<&str> =
        config.separator_priority.iter().map(String::as_str).collect();
    let splitter = Splitter {
        max_size: config.max_size.max(1),
        overlap: config.overlap.min(config.max_size.saturating_sub(1)),
    };
    splitter.split_recursive(text, &separators)
}

struct Splitter {
    max_size: usize,
    overlap: usize,
}

impl Splitter {
    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (separator, remaining) = pick_separator(text, separators);

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.max_size {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }

            if remaining.is_empty() {
                chunks.extend(self.hard_cut(piece));
            } else {
                chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }

        chunks
    }

    /// Greedily merge short pieces into chunks, carrying a tail of at most
    /// `overlap` characters into the next chunk.
    fn merge(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0;

        for &piece in pieces {
            let len = char_len(piece);

            if total + len > self.max_size && !window.is_empty() {
                push_joined(&mut chunks, &window);

                while let Some(&(_, front_len)) = window.front() {
                    let too_much_overlap = total > self.overlap;
                    let no_room = total + len > self.max_size;
                    if !too_much_overlap && !no_room {
                        break;
                    }
                    window.pop_front();
                    total -= front_len;
                }
            }

            window.push_back((piece, len));
            total += len;
        }

        push_joined(&mut chunks, &window);
        chunks
    }

    /// Cut text with no usable separator into fixed windows whose starts
    /// advance by `max_size - overlap`.
    fn hard_cut(&self, text: &str) -> Vec<String> {
        // char index -> byte index, with a trailing entry for text.len()
        let char_to_byte: Vec<usize> = text
            .char_indices()
            .map(|(byte_idx, _)| byte_idx)
            .chain(std::iter::once(text.len()))
            .collect();
        let char_count = char_to_byte.len() - 1;
        let step = self.max_size.saturating_sub(self.overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0;
        loop {
            let end = (start + self.max_size).min(char_count);
            let window = text[char_to_byte[start]..char_to_byte[end]].trim();
            if !window.is_empty() {
                chunks.push(window.to_string());
            }
            if end == char_count {
                break;
            }
            start += step;
        }
        chunks
    }
}

/// Choose the first separator present in `text`; returns it along with
/// the lower-priority separators left for recursive re-splitting.
fn pick_separator<'a, 's>(
    text: &str,
    separators: &'s [&'a str],
) -> (&'a str, &'s [&'a str]) {
    for (i, &separator) in separators.iter().enumerate() {
        if separator.is_empty() {
            return (separator, &[]);
        }
        if text.contains(separator) {
            return (separator, &separators[i + 1..]);
        }
    }
    (separators.last().copied().unwrap_or(""), &[])
}

/// Split on `separator`, keeping each separator at the start of the piece
/// that follows it. Empty pieces are dropped.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
            start = idx;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<(&str, usize)>) {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
