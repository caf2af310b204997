//! Error types for dictionary decoding and building.

use thiserror::Error;

/// Errors raised while opening or building a word dictionary.
///
/// Lookups never fail: a missing word id is an ordinary `None`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DictionaryError {
    /// The buffer cannot hold the 26 bucket offsets.
    #[error("dictionary is {len} bytes, shorter than the {needed}-byte bucket header")]
    TooShort {
        /// Length of the rejected buffer.
        len: usize,
        /// Minimum length of a valid dictionary.
        needed: usize,
    },
    /// A word cannot be stored in the format.
    #[error("word {word:?} cannot be encoded: {reason}")]
    InvalidWord {
        /// The offending word.
        word: String,
        /// What is wrong with it.
        reason: &'static str,
    },
    /// The encoded dictionary does not fit 16-bit bucket offsets.
    #[error("encoded dictionary is {size} bytes, bucket offsets are limited to 65535")]
    TooLarge {
        /// Size the encoder reached.
        size: usize,
    },
}
