//! Error taxonomy for backends and generation.
//!
//! Only [`BackendError`] ever reaches a caller: it means the backend could
//! not be constructed and the host should keep using its exact-match parser.
//! [`GenerationError`] stays inside the crate's protocols, which turn it into
//! a fallback value before returning.

use thiserror::Error;

use crate::config::BackendKind;

/// Backend construction failed. Fatal for that backend instance only.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Model, tokenizer or adapter files could not be loaded.
    #[error("failed to load {backend} model '{model}': {reason}")]
    ModelLoad {
        backend: BackendKind,
        model: String,
        reason: String,
    },
    /// The remote backend has neither a configured nor an environment credential.
    #[error("no API credential configured and ${env_var} is not set")]
    MissingCredential { env_var: &'static str },
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The HTTP client could not be built.
    #[error("failed to create HTTP transport: {0}")]
    Transport(String),
}

/// A single completion request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("tokenization failed: {0}")]
    Tokenize(String),
    #[error("prompt produced no tokens")]
    EmptyPrompt,
    #[error("prompt is {tokens} tokens, context window is {context}")]
    PromptTooLong { tokens: usize, context: usize },
    /// Feeding the prompt failed before any token was generated.
    #[error("prompt decode failed: {0}")]
    PromptDecode(String),
    #[error("model returned no logits for the final prompt token")]
    NoLogits,
    #[error("remote request failed: {0}")]
    Transport(String),
    #[error("remote response has no content field")]
    MissingContent,
    #[error("backend has been shut down")]
    ShutDown,
}
