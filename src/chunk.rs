//! Overlapping character-window chunker.
//!
//! Splits document text into [`Chunk`]s of at most `chunk_size` characters,
//! each overlapping its predecessor by `chunk_overlap` characters. Windows
//! prefer to end just after a whitespace character so words are not cut,
//! falling back to a hard cut when a window contains no usable whitespace.
//!
//! Offsets are counted in characters, not bytes. Every chunk's text is
//! exactly the characters `start..end` of the source, and ids are derived
//! from the document id and chunk index, so re-chunking the same input
//! always yields the same chunks.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{Chunk, Document};

/// Split a loaded document.
pub fn split_document(
    document: &Document,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>> {
    split_text(&document.id, &document.text, chunk_size, chunk_overlap)
}

/// Split text into overlapping windows with contiguous indices starting at 0.
pub fn split_text(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>> {
    validate(chunk_size, chunk_overlap)?;

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    if total == 0 {
        return Ok(chunks);
    }

    let mut start = 0usize;
    loop {
        let hard_end = (start + chunk_size).min(total);
        let end = if hard_end < total {
            // Only accept a break that leaves the next window ahead of this one.
            (start + chunk_overlap..hard_end)
                .rev()
                .find(|&i| chars[i].is_whitespace())
                .map(|i| i + 1)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };

        let piece: String = chars[start..end].iter().collect();
        chunks.push(make_chunk(document_id, chunks.len(), start, end, piece));

        if end >= total {
            break;
        }
        start = end - chunk_overlap;
    }

    Ok(chunks)
}

fn validate(chunk_size: usize, chunk_overlap: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidParameter(
            "chunk_size must be > 0".to_string(),
        ));
    }
    if chunk_overlap >= chunk_size {
        return Err(Error::InvalidParameter(format!(
            "chunk_overlap ({}) must be smaller than chunk_size ({})",
            chunk_overlap, chunk_size
        )));
    }
    Ok(())
}

fn make_chunk(document_id: &str, index: usize, start: usize, end: usize, text: String) -> Chunk {
    Chunk {
        id: format!("{}:{}", document_id, index),
        document_id: document_id.to_string(),
        index,
        start,
        end,
        hash: sha256_hex(&text),
        text,
    }
}

/// Lowercase hex SHA-256 of a string.
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("doc1", "The sky is blue.", 1000, 20).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "The sky is blue.");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 16));
        assert_eq!(chunks[0].id, "doc1:0");
    }

    #[test]
    fn test_empty_text() {
        let chunks = split_text("doc1", "", 1000, 20).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let err = split_text("doc1", "abc", 10, 10).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
        let err = split_text("doc1", "abc", 0, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn test_hard_split_without_whitespace() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        let chunks = split_text("doc1", text, 10, 2).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcdefghij", "ijklmnopqr", "qrstuvwxyz"]);
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 10));
    }

    #[test]
    fn test_windows_overlap_and_cover_text() {
        let text = (0..200)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = split_text("doc1", &text, 50, 10).unwrap();
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, text.chars().count());
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start, pair[0].end - 10, "windows must overlap by 10");
            assert!(pair[1].start > pair[0].start);
        }
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.text.chars().count() <= 50);
            let expected: String = text.chars().skip(c.start).take(c.end - c.start).collect();
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn test_prefers_whitespace_boundary() {
        let chunks = split_text("doc1", "alpha beta gamma delta", 12, 2).unwrap();
        assert_eq!(chunks[0].text, "alpha beta ");
    }

    #[test]
    fn test_multibyte_characters() {
        let text = "héllo wörld ünïcode çhårs ëverywhere";
        let chunks = split_text("doc1", text, 8, 2).unwrap();
        for c in &chunks {
            assert!(c.text.chars().count() <= 8);
        }
        assert_eq!(chunks.last().unwrap().end, text.chars().count());
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let c1 = split_text("doc1", text, 15, 3).unwrap();
        let c2 = split_text("doc1", text, 15, 3).unwrap();
        assert_eq!(c1, c2);
    }
}
