//! Full-precision on-device backend.

use crate::backend::{Backend, BackendCore};
use crate::config::{BackendConfig, BackendKind};
use crate::engine::LanguageModel;
use crate::error::BackendError;
use crate::model::CandleLlama;
use crate::session::InferenceSession;

/// Safetensors Llama-family model on GPU when available, else CPU.
pub struct LocalBackend {
    core: BackendCore<InferenceSession>,
}

impl LocalBackend {
    /// Wrap an already loaded engine.
    pub fn with_model(model: Box<dyn LanguageModel>, config: &BackendConfig) -> Self {
        let session = InferenceSession::new(model, config);
        Self {
            core: BackendCore::new(BackendKind::Local, session, config),
        }
    }

    /// `None` after shutdown.
    pub fn session(&self) -> Option<&InferenceSession> {
        self.core.completion()
    }
}

impl Backend for LocalBackend {
    fn initialize(config: &BackendConfig) -> Result<Self, BackendError> {
        config.validate()?;
        config.apply_thread_count();
        let model = CandleLlama::load(config).map_err(|e| BackendError::ModelLoad {
            backend: BackendKind::Local,
            model: config.model_path.clone(),
            reason: format!("{e:#}"),
        })?;
        Ok(Self::with_model(Box::new(model), config))
    }

    fn shutdown(&mut self) {
        self.core.shutdown();
    }

    fn extract_canonical(&mut self, input: &str, vocabulary_hint: Option<&str>) -> String {
        self.core.extract_canonical(input, vocabulary_hint)
    }

    fn matches(&mut self, input: &str, expected_words: &[String]) -> bool {
        self.core.matches(input, expected_words)
    }

    fn generate_response(
        &mut self,
        game_text: &str,
        user_text: &str,
        context: Option<&str>,
    ) -> Option<String> {
        self.core.generate_response(game_text, user_text, context)
    }
}
