//! Recursive character splitter.
//!
//! The text is cut at the coarsest separator it contains (`"\n## "` before
//! `"\n### "` before paragraphs, lines, words). Pieces that still exceed
//! `chunk_size` are cut again with the next separator; pieces that fit are
//! merged greedily into chunks. When a chunk is emitted, its trailing pieces
//! (at most `chunk_overlap` characters) start the next one. Separators stay at
//! the front of the piece they introduce, so a heading travels with its body.

use std::collections::VecDeque;

use crate::ChunkingConfig;

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `text` into trimmed, non-empty chunks.
pub fn split_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let mut raw = Vec::new();
    split_recursive(text, &config.separators, config, &mut raw);
    raw.into_iter()
        .map(|chunk| chunk.trim().to_string())
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn split_recursive(text: &str, separators: &[String], config: &ChunkingConfig, out: &mut Vec<String>) {
    let Some(pos) = separators.iter().position(|s| text.contains(s.as_str())) else {
        hard_split(text, config, out);
        return;
    };
    let separator = separators[pos].as_str();
    let finer = &separators[pos + 1..];

    let mut pending: Vec<&str> = Vec::new();
    for piece in split_keeping_separator(text, separator) {
        if char_len(piece) <= config.chunk_size {
            pending.push(piece);
            continue;
        }
        merge_pieces(&pending, config, out);
        pending.clear();
        split_recursive(piece, finer, config, out);
    }
    merge_pieces(&pending, config, out);
}

/// `"a\n\nb\n\nc"` on `"\n\n"` -> `["a", "\n\nb", "\n\nc"]`.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
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

fn merge_pieces(pieces: &[&str], config: &ChunkingConfig, out: &mut Vec<String>) {
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut len = 0usize;

    for &piece in pieces {
        let piece_len = char_len(piece);
        if len + piece_len > config.chunk_size && !window.is_empty() {
            out.push(window.iter().copied().collect());
            // Keep a tail no longer than the overlap that still leaves room.
            while len > config.chunk_overlap || (len > 0 && len + piece_len > config.chunk_size) {
                match window.pop_front() {
                    Some(front) => len -= char_len(front),
                    None => break,
                }
            }
        }
        window.push_back(piece);
        len += piece_len;
    }

    if !window.is_empty() {
        out.push(window.iter().copied().collect());
    }
}

/// Fixed windows on char boundaries, for text with no separator left.
fn hard_split(text: &str, config: &ChunkingConfig, out: &mut Vec<String>) {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= config.chunk_size {
        out.push(text.to_string());
        return;
    }
    let step = config.chunk_size.saturating_sub(config.chunk_overlap).max(1);
    let mut start = 0;
    loop {
        let end = (start + config.chunk_size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
}
