//! # advlm
//!
//! Natural-language command resolution for text adventure interpreters.
//!
//! A player types free-form input in any language; the resolver either
//! rewrites it into the canonical English "verb noun" the game's parser
//! understands, or asks a model whether it means an expected command. It can
//! also retell the game's answer in the player's language.
//!
//! Three backends implement the same [`Backend`] contract: a full-precision
//! on-device model, a quantized GGUF model and a hosted chat-completion API.
//! Every operation degrades to the host's exact-match behaviour on failure.

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod lora;
pub mod model;
pub mod prompt;
pub mod quantized;
pub mod remote;
pub mod resolver;
pub mod response;
pub mod sampler;
pub mod session;
pub mod testing;

pub use backend::{Backend, LocalBackend, QuantizedBackend, RemoteBackend, create_backend};
pub use config::{BackendConfig, BackendKind, ChatFormat, ResolverMode};
pub use context::{EventKind, GameContext};
pub use error::{BackendError, GenerationError};
pub use prompt::PromptBuilder;
pub use resolver::CommandResolver;
pub use response::{LanguageCache, ResponseGenerator};
pub use session::{Completion, CompletionRequest, InferenceSession};
