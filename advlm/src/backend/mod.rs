//! The backend capability contract and its three implementations.
//!
//! A backend is chosen once from [`BackendConfig::backend`] and owned by the
//! resolver as a `Box<dyn Backend>`. Every operation is total: when a
//! backend cannot answer it returns the documented fallback.

mod local;
mod quantized;
mod remote;

pub use local::LocalBackend;
pub use quantized::QuantizedBackend;
pub use remote::RemoteBackend;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{BackendError, GenerationError};
use crate::prompt::PromptBuilder;
use crate::resolver::{extract_canonical, semantic_match};
use crate::response::ResponseGenerator;
use crate::session::Completion;

/// What every inference provider offers the resolver.
pub trait Backend: Send {
    /// Load models or open the connection described by `config`.
    fn initialize(config: &BackendConfig) -> Result<Self, BackendError>
    where
        Self: Sized;

    /// Release models and caches. Later calls return their fallbacks.
    fn shutdown(&mut self);

    /// Canonical lower-case English for `input`, or `input` itself.
    fn extract_canonical(&mut self, input: &str, vocabulary_hint: Option<&str>) -> String;

    /// Whether `input` means the command spelled by `expected_words`.
    fn matches(&mut self, input: &str, expected_words: &[String]) -> bool;

    /// Narration of `game_text` in the language of `user_text`, grounded in
    /// the rendered game `context` when given.
    fn generate_response(
        &mut self,
        game_text: &str,
        user_text: &str,
        context: Option<&str>,
    ) -> Option<String>;
}

/// Validate `config` and initialize the backend it names.
pub fn create_backend(config: &BackendConfig) -> Result<Box<dyn Backend>, BackendError> {
    config.validate()?;
    log::info!("Initializing {} backend (mode {})", config.backend, config.mode);
    Ok(match config.backend {
        BackendKind::Local => Box::new(LocalBackend::initialize(config)?),
        BackendKind::Quantized => Box::new(QuantizedBackend::initialize(config)?),
        BackendKind::Remote => Box::new(RemoteBackend::initialize(config)?),
    })
}

/// Protocol state shared by the backend variants: a completion source plus
/// prompts, the narrator and the match budget.
pub(crate) struct BackendCore<C> {
    kind: BackendKind,
    completion: Option<C>,
    prompts: PromptBuilder,
    responder: ResponseGenerator,
    match_tokens: usize,
}

impl<C: Completion> BackendCore<C> {
    pub(crate) fn new(kind: BackendKind, completion: C, config: &BackendConfig) -> Self {
        Self {
            kind,
            completion: Some(completion),
            prompts: PromptBuilder::from_config(config),
            responder: ResponseGenerator::from_config(config),
            match_tokens: config.max_tokens,
        }
    }

    pub(crate) fn completion(&self) -> Option<&C> {
        self.completion.as_ref()
    }

    pub(crate) fn shutdown(&mut self) {
        if self.completion.take().is_some() {
            log::info!("{} backend shut down", self.kind);
        }
    }

    pub(crate) fn extract_canonical(&mut self, input: &str, vocabulary_hint: Option<&str>) -> String {
        let Self {
            completion,
            prompts,
            ..
        } = self;
        match completion.as_mut() {
            Some(completion) => extract_canonical(completion, prompts, input, vocabulary_hint),
            None => {
                log::debug!("Extraction skipped: {}", GenerationError::ShutDown);
                input.to_string()
            }
        }
    }

    pub(crate) fn matches(&mut self, input: &str, expected_words: &[String]) -> bool {
        let max_tokens = self.match_tokens;
        let Self {
            completion,
            prompts,
            ..
        } = self;
        match completion.as_mut() {
            Some(completion) => semantic_match(completion, prompts, input, expected_words, max_tokens),
            None => {
                log::debug!("Match skipped: {}", GenerationError::ShutDown);
                false
            }
        }
    }

    pub(crate) fn generate_response(
        &mut self,
        game_text: &str,
        user_text: &str,
        context: Option<&str>,
    ) -> Option<String> {
        let Self {
            completion,
            prompts,
            responder,
            ..
        } = self;
        match completion.as_mut() {
            Some(completion) => responder.generate(completion, prompts, game_text, user_text, context),
            None => {
                log::debug!("Response skipped: {}", GenerationError::ShutDown);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverMode;
    use crate::session::InferenceSession;
    use crate::testing::ScriptedModel;

    fn core(responses: &[&str]) -> BackendCore<InferenceSession> {
        let config = BackendConfig::default();
        let session = InferenceSession::new(Box::new(ScriptedModel::responding(responses)), &config);
        BackendCore::new(BackendKind::Local, session, &config)
    }

    #[test]
    fn test_shutdown_turns_calls_into_fallbacks() {
        let mut core = core(&["look castle", "yes", "English", "Hello"]);
        core.shutdown();
        assert!(core.completion().is_none());
        assert_eq!(core.extract_canonical("mira", None), "mira");
        assert!(!core.matches("mira", &["look".into()]));
        assert_eq!(core.generate_response("Hi.", "hola", None), None);
        // A second shutdown is harmless.
        core.shutdown();
    }

    #[test]
    fn test_core_runs_protocols() {
        let mut core = core(&["look castle", "yes"]);
        assert_eq!(core.extract_canonical("mira el castillo", None), "look castle");
        assert!(core.matches("mira el castillo", &["look".into(), "castle".into()]));
    }

    #[test]
    fn test_create_backend_rejects_invalid_config() {
        let config = BackendConfig {
            batch_size: 0,
            mode: ResolverMode::Semantic,
            ..BackendConfig::default()
        };
        assert!(matches!(
            create_backend(&config).err(),
            Some(BackendError::InvalidConfig(_))
        ));
    }
}
