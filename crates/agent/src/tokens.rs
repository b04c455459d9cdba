//! Pluggable token counting for session bookkeeping.

use std::sync::Arc;
use tracing::warn;

pub trait TokenCounter: Send + Sync {
    fn name(&self) -> &'static str;
    fn count(&self, text: &str) -> u64;
}

/// cl100k BPE via `tiktoken-rs`. Close enough for every supported assistant.
pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    pub fn new() -> Option<Self> {
        match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(Self { bpe }),
            Err(e) => {
                warn!(error = %e, "cl100k tokenizer unavailable");
                None
            }
        }
    }
}

impl TokenCounter for TiktokenCounter {
    fn name(&self) -> &'static str {
        "tiktoken"
    }

    fn count(&self, text: &str) -> u64 {
        self.bpe.encode_with_special_tokens(text).len() as u64
    }
}

/// Character-class heuristic: roughly one token per four ASCII word
/// characters plus one per separator, and one per non-ASCII character.
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn count(&self, text: &str) -> u64 {
        estimate_tokens(text) as u64
    }
}

fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut tokens: usize = 0;
    let mut word_chars: usize = 0;
    for ch in text.chars() {
        if ch.is_ascii() {
            if ch.is_ascii_whitespace() || ch.is_ascii_punctuation() {
                if word_chars > 0 {
                    tokens += 1 + word_chars / 4;
                    word_chars = 0;
                }
                if !ch.is_ascii_whitespace() {
                    tokens += 1;
                }
            } else {
                word_chars += 1;
            }
        } else {
            if word_chars > 0 {
                tokens += 1 + word_chars / 4;
                word_chars = 0;
            }
            tokens += 1;
        }
    }
    if word_chars > 0 {
        tokens += 1 + word_chars / 4;
    }
    tokens
}

/// Build the configured counter, falling back to the heuristic when the
/// accurate tokenizer cannot be loaded.
pub fn counter_for(kind: &str) -> Arc<dyn TokenCounter> {
    if kind == "tiktoken" {
        if let Some(c) = TiktokenCounter::new() {
            return Arc::new(c);
        }
        warn!("Falling back to heuristic token counting");
    }
    Arc::new(HeuristicCounter)
}
