//! Low-bit GGUF backend for CPU-only machines.

use crate::backend::{Backend, BackendCore};
use crate::config::{BackendConfig, BackendKind};
use crate::engine::LanguageModel;
use crate::error::BackendError;
use crate::quantized::QuantizedLlama;
use crate::session::InferenceSession;

pub struct QuantizedBackend {
    core: BackendCore<InferenceSession>,
}

impl QuantizedBackend {
    pub fn with_model(model: Box<dyn LanguageModel>, config: &BackendConfig) -> Self {
        let session = InferenceSession::new(model, config);
        Self {
            core: BackendCore::new(BackendKind::Quantized, session, config),
        }
    }

    pub fn session(&self) -> Option<&InferenceSession> {
        self.core.completion()
    }
}

impl Backend for QuantizedBackend {
    fn initialize(config: &BackendConfig) -> Result<Self, BackendError> {
        config.validate()?;
        config.apply_thread_count();
        if config.use_gpu {
            log::warn!("Quantized backend runs on the CPU; ignoring use_gpu");
        }
        let cpu_only = BackendConfig {
            use_gpu: false,
            ..config.clone()
        };
        let model = QuantizedLlama::load(&cpu_only).map_err(|e| BackendError::ModelLoad {
            backend: BackendKind::Quantized,
            model: config.model_path.clone(),
            reason: format!("{e:#}"),
        })?;
        Ok(Self::with_model(Box::new(model), &cpu_only))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    #[test]
    fn test_missing_gguf_is_load_error() {
        let config = BackendConfig {
            model_path: "/nonexistent/bitnet.gguf".into(),
            ..BackendConfig::for_backend(BackendKind::Quantized)
        };
        let err = QuantizedBackend::initialize(&config).err().unwrap();
        assert!(matches!(
            err,
            BackendError::ModelLoad {
                backend: BackendKind::Quantized,
                ..
            }
        ));
        assert!(err.to_string().contains("/nonexistent/bitnet.gguf"));
    }

    #[test]
    fn test_uses_smaller_slot_count() {
        let config = BackendConfig::for_backend(BackendKind::Quantized);
        let mut backend = QuantizedBackend::with_model(
            Box::new(ScriptedModel::responding(&["get key"])),
            &config,
        );
        assert_eq!(backend.session().map(|s| s.max_sequences()), Some(4));
        assert_eq!(backend.extract_canonical("coge la llave", None), "get key");
    }
}
