//! Token Counting
//!
//! Client-side estimates of token usage. Provider-reported usage stays
//! authoritative; these counters fill the gap while a turn streams and for
//! endpoints that never report usage.
//!
//! The counter is picked once from configuration and used through the
//! [`TokenCounter`] trait, so call sites never branch on which one is active.

use serde::{Deserialize, Serialize};

/// Estimates how many tokens a piece of text costs
pub trait TokenCounter: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Estimated token count of `text`
    fn count(&self, text: &str) -> u64;
}

/// Characters divided by four, rounded up
#[derive(Clone, Copy, Debug, Default)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn count(&self, text: &str) -> u64 {
        (text.chars().count() as u64).div_ceil(4)
    }
}

/// Word and punctuation pieces, long words split every four characters
///
/// Closer to what BPE tokenizers produce for prose and code than the plain
/// character heuristic.
#[derive(Clone, Copy, Debug, Default)]
pub struct LexicalCounter;

impl LexicalCounter {
    const PIECE: u64 = 4;
}

impl TokenCounter for LexicalCounter {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn count(&self, text: &str) -> u64 {
        let mut total = 0;
        let mut word = 0u64;

        for c in text.chars() {
            if c.is_alphanumeric() || c == '_' {
                word += 1;
                continue;
            }
            total += word.div_ceil(Self::PIECE);
            word = 0;
            if !c.is_whitespace() {
                total += 1;
            }
        }
        total + word.div_ceil(Self::PIECE)
    }
}

/// Which counter a session uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenCounterKind {
    /// [`HeuristicCounter`]
    #[default]
    Heuristic,
    /// [`LexicalCounter`]
    Lexical,
}

impl TokenCounterKind {
    /// Build the selected counter
    #[must_use]
    pub fn build(self) -> Box<dyn TokenCounter> {
        match self {
            Self::Heuristic => Box::new(HeuristicCounter),
            Self::Lexical => Box::new(LexicalCounter),
        }
    }
}
