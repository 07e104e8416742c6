//! Tokenizers used for cost accounting.
//!
//! [`ApproxTokenizer`] needs no model files and approximates BPE
//! tokenizers: each run of letters and digits costs one token per four
//! characters, each other visible character costs one token, and whitespace
//! is free. Appending text never lowers the count.
//!
//! With the `hf-tokenizer` feature, [`HfTokenizer`] loads a Hugging Face
//! `tokenizer.json` for exact counts.

use std::sync::Arc;

use crate::config::TokenizerConfig;
use crate::error::{Error, Result};

/// Splits text into token ids. Never fails; unknown models fall back to a generic scheme.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, model_name: &str) -> Vec<u32>;
}

const APPROX_CHARS_PER_TOKEN: usize = 4;
const APPROX_VOCAB: u32 = 100_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct ApproxTokenizer;

impl ApproxTokenizer {
    fn piece_id(piece: &str) -> u32 {
        let mut hash: u32 = 5381;
        for byte in piece.bytes() {
            hash = hash.wrapping_mul(33) ^ byte as u32;
        }
        hash % APPROX_VOCAB
    }
}

impl Tokenizer for ApproxTokenizer {
    fn encode(&self, text: &str, _model_name: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut word = String::new();

        let flush = |word: &mut String, ids: &mut Vec<u32>| {
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(APPROX_CHARS_PER_TOKEN) {
                ids.push(Self::piece_id(&piece.iter().collect::<String>()));
            }
            word.clear();
        };

        for c in text.chars() {
            if c.is_alphanumeric() {
                word.push(c);
                continue;
            }
            flush(&mut word, &mut ids);
            if !c.is_whitespace() {
                ids.push(Self::piece_id(c.encode_utf8(&mut [0; 4])));
            }
        }
        flush(&mut word, &mut ids);
        ids
    }
}

/// Exact tokenizer backed by a Hugging Face `tokenizer.json`.
#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenizer {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            Error::Configuration(format!("failed to load tokenizer {}: {}", path.display(), e))
        })?;
        Ok(Self { inner })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, model_name: &str) -> Vec<u32> {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().to_vec(),
            Err(e) => {
                tracing::warn!(error = %e, "tokenizer failed, using approximate count");
                ApproxTokenizer.encode(text, model_name)
            }
        }
    }
}

/// Build the tokenizer selected by `[tokenizer]`.
pub fn create_tokenizer(config: &TokenizerConfig) -> Result<Arc<dyn Tokenizer>> {
    match &config.path {
        None => Ok(Arc::new(ApproxTokenizer)),
        #[cfg(feature = "hf-tokenizer")]
        Some(path) => Ok(Arc::new(HfTokenizer::from_file(path)?)),
        #[cfg(not(feature = "hf-tokenizer"))]
        Some(path) => Err(Error::Configuration(format!(
            "tokenizer.path ({}) requires building with --features hf-tokenizer",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(text: &str) -> usize {
        ApproxTokenizer.encode(text, "gpt-3.5-turbo").len()
    }

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(count(""), 0);
        assert_eq!(count("   \n\t"), 0);
    }

    #[test]
    fn words_and_punctuation() {
        // "The"=1, "sky"=1, "is"=1, "blue"=1, "."=1
        assert_eq!(count("The sky is blue."), 5);
        // "internationalization" = 20 chars -> 5 pieces
        assert_eq!(count("internationalization"), 5);
    }

    #[test]
    fn deterministic_ids() {
        let a = ApproxTokenizer.encode("hello, world", "m");
        let b = ApproxTokenizer.encode("hello, world", "m");
        assert_eq!(a, b);
        assert!(a.iter().all(|&id| id < APPROX_VOCAB));
    }

    #[test]
    fn appending_never_decreases_count() {
        let mut text = String::from("What color is the sky");
        let mut prev = count(&text);
        for suffix in ["?", " It", "s", " blue", "!!", "ish", " ok"] {
            text.push_str(suffix);
            let n = count(&text);
            assert!(n >= prev, "{:?} has fewer tokens than its prefix", text);
            prev = n;
        }
    }

    #[test]
    fn default_tokenizer_without_path() {
        let tok = create_tokenizer(&TokenizerConfig::default()).unwrap();
        assert_eq!(tok.encode("a b", "m").len(), 2);
    }
}
