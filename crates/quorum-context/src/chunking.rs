// Chunking Module
// Cuts file content into ordinally-stable, semantically-typed chunks.

use std::path::Path;

use quorum_types::ChunkKind;
use tiktoken_rs::cl100k_base;

use crate::error::{ContextError, ContextResult};

/// Content shorter than this stays a single chunk.
const MIN_SPLIT_LENGTH: usize = 200;

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in estimated tokens.
    pub chunk_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { chunk_tokens: 512 }
    }
}

/// A cut piece, before it is persisted. Ordinals are contiguous from 0.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub ordinal: u32,
    pub kind: ChunkKind,
    pub start_line: u32,
    pub end_line: u32,
    pub token_estimate: u32,
    pub content: String,
}

/// Tokenizer wrapper used for accurate counts where they matter.
pub struct Tokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl Tokenizer {
    pub fn new() -> ContextResult<Self> {
        let bpe = cl100k_base().map_err(|e| ContextError::Chunking(e.to_string()))?;
        Ok(Self { bpe })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Rough token estimate without tokenizing (~4 chars per token).
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

/// Chunk kind for a file, from its extension.
pub fn kind_for_path(path: &Path) -> ChunkKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("rs" | "py" | "ts" | "tsx" | "js" | "jsx" | "go" | "java" | "kt" | "kts" | "c"
        | "h" | "cpp" | "cc" | "hpp" | "sh") => ChunkKind::Code,
        Some("md" | "markdown" | "rst") => ChunkKind::Markdown,
        Some("toml" | "json" | "yaml" | "yml" | "ini" | "cfg") => ChunkKind::Config,
        _ => ChunkKind::Text,
    }
}

/// Split file content into chunks with stable ordinals.
///
/// Splitting is by blank-line separated segments packed up to the token
/// target, so an unchanged file always yields the same chunk sequence.
pub fn chunk_content(
    content: &str,
    kind: ChunkKind,
    config: &ChunkingConfig,
) -> ContextResult<Vec<ChunkPiece>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if content.len() < MIN_SPLIT_LENGTH || estimate_tokens(content) <= config.chunk_tokens {
        let line_count = content.lines().count().max(1) as u32;
        return Ok(vec![ChunkPiece {
            ordinal: 0,
            kind,
            start_line: 1,
            end_line: line_count,
            token_estimate: estimate_tokens(content) as u32,
            content: content.to_string(),
        }]);
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_start_line = 1u32;
    let mut line_cursor = 1u32;
    let mut current_end_line = 1u32;

    for segment in split_segments(content) {
        let segment_lines = segment.text.lines().count().max(1) as u32;
        let would_be = current.len() + segment.text.len();
        if !current.is_empty() && estimate_tokens(&current) + estimate_tokens(&segment.text)
            > config.chunk_tokens
            && would_be > MIN_SPLIT_LENGTH
        {
            push_piece(
                &mut pieces,
                kind,
                &current,
                current_start_line,
                current_end_line,
            );
            current.clear();
            current_start_line = line_cursor;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(&segment.text);
        current_end_line = line_cursor + segment_lines - 1;
        line_cursor += segment_lines + segment.trailing_blank_lines;
    }

    if !current.is_empty() {
        push_piece(
            &mut pieces,
            kind,
            &current,
            current_start_line,
            current_end_line,
        );
    }

    Ok(pieces)
}

struct Segment {
    text: String,
    trailing_blank_lines: u32,
}

fn split_segments(content: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut blanks = 0u32;

    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blanks += 1;
            }
            continue;
        }
        if blanks > 0 && !current.is_empty() {
            segments.push(Segment {
                text: current.join("\n"),
                trailing_blank_lines: blanks,
            });
            current = Vec::new();
            blanks = 0;
        }
        current.push(line);
    }
    if !current.is_empty() {
        segments.push(Segment {
            text: current.join("\n"),
            trailing_blank_lines: 0,
        });
    }
    segments
}

fn push_piece(
    pieces: &mut Vec<ChunkPiece>,
    kind: ChunkKind,
    content: &str,
    start_line: u32,
    end_line: u32,
) {
    pieces.push(ChunkPiece {
        ordinal: pieces.len() as u32,
        kind,
        start_line,
        end_line: end_line.max(start_line),
        token_estimate: estimate_tokens(content) as u32,
        content: content.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_yields_no_chunks() {
        let pieces = chunk_content("", ChunkKind::Text, &ChunkingConfig::default()).unwrap();
        assert!(pieces.is_empty());
        let pieces = chunk_content("  \n ", ChunkKind::Text, &ChunkingConfig::default()).unwrap();
        assert!(pieces.is_empty());
    }

    #[test]
    fn short_content_is_a_single_chunk() {
        let pieces =
            chunk_content("fn main() {}", ChunkKind::Code, &ChunkingConfig::default()).unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].ordinal, 0);
        assert_eq!(pieces[0].start_line, 1);
    }

    #[test]
    fn ordinals_are_contiguous_and_stable() {
        let paragraph = "word ".repeat(120);
        let content = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let config = ChunkingConfig { chunk_tokens: 100 };

        let first = chunk_content(&content, ChunkKind::Markdown, &config).unwrap();
        assert!(first.len() > 1);
        for (i, piece) in first.iter().enumerate() {
            assert_eq!(piece.ordinal, i as u32);
            assert!(piece.start_line <= piece.end_line);
        }

        // Identical input must produce the identical cut.
        let second = chunk_content(&content, ChunkKind::Markdown, &config).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.ordinal, b.ordinal);
        }
    }

    #[test]
    fn kind_follows_extension() {
        assert_eq!(kind_for_path(Path::new("src/main.rs")), ChunkKind::Code);
        assert_eq!(kind_for_path(Path::new("README.md")), ChunkKind::Markdown);
        assert_eq!(kind_for_path(Path::new("Cargo.toml")), ChunkKind::Config);
        assert_eq!(kind_for_path(Path::new("notes")), ChunkKind::Text);
    }

    #[test]
    fn tokenizer_counts_tokens() {
        let tokenizer = Tokenizer::new().unwrap();
        assert!(tokenizer.count_tokens("Hello world") > 0);
    }

    #[test]
    fn estimate_is_roughly_quarter_of_length() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
