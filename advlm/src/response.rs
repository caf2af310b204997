//! Narrator responses in the player's language.
//!
//! Detection runs on the reserved slot with greedy decoding; the answer is
//! validated and cached so a failed detection later on keeps the last good
//! language.

use crate::config::BackendConfig;
use crate::prompt::{PromptBuilder, ResponsePrompt};
use crate::session::{Completion, CompletionRequest, SlotChoice};

/// Tokens sampled for a language name.
pub const LANGUAGE_TOKEN_BUDGET: usize = 15;

/// Language names recognised by prefix.
pub const KNOWN_LANGUAGES: [&str; 9] = [
    "English",
    "Spanish",
    "French",
    "German",
    "Italian",
    "Portuguese",
    "Russian",
    "Japanese",
    "Chinese",
];

/// Turn a raw model answer into a language name.
///
/// Known names win by prefix ("Spanish language" is "Spanish"). Anything
/// else between 3 and 31 characters is taken as is; the rest is rejected.
pub fn validate_language(raw: &str) -> Option<String> {
    let answer = raw
        .trim_start_matches([' ', '\n', '\r', '\t'])
        .trim_end_matches([' ', '\n', '\r', '\t', '.']);
    if let Some(known) = KNOWN_LANGUAGES.iter().find(|lang| answer.starts_with(*lang)) {
        return Some(known.to_string());
    }
    let len = answer.chars().count();
    (len > 2 && len < 32).then(|| answer.to_string())
}

/// Last detected language, with a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageCache {
    detected: Option<String>,
    default: String,
}

impl LanguageCache {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            detected: None,
            default: default.into(),
        }
    }

    /// The cached language, else the default.
    pub fn current(&self) -> &str {
        self.detected.as_deref().unwrap_or(&self.default)
    }

    pub fn detected(&self) -> Option<&str> {
        self.detected.as_deref()
    }

    pub fn store(&mut self, language: String) {
        self.detected = Some(language);
    }

    pub fn clear(&mut self) {
        self.detected = None;
    }
}

/// Detects the player's language and writes narrator responses in it.
#[derive(Debug, Clone)]
pub struct ResponseGenerator {
    languages: LanguageCache,
    max_tokens: usize,
}

impl ResponseGenerator {
    pub fn new(default_language: &str, max_tokens: usize) -> Self {
        Self {
            languages: LanguageCache::new(default_language),
            max_tokens,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(&config.default_language, config.response_max_tokens)
    }

    pub fn languages(&self) -> &LanguageCache {
        &self.languages
    }

    /// Language of `input`.
    ///
    /// Empty input answers from the cache. A rejected answer stores and
    /// returns the default; a failed completion returns the default and
    /// leaves the cache alone.
    pub fn detect_language<C: Completion + ?Sized>(
        &mut self,
        completion: &mut C,
        prompts: &mut PromptBuilder,
        input: &str,
    ) -> String {
        if input.trim().is_empty() {
            return self.languages.current().to_string();
        }

        let prompt = prompts.language_detection(input);
        let request = CompletionRequest::deterministic(prompt, LANGUAGE_TOKEN_BUDGET)
            .on_slot(SlotChoice::Reserved);
        let raw = match completion.complete(&request) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Language detection failed: {}", e);
                return self.languages.default.clone();
            }
        };

        match validate_language(&raw) {
            Some(language) => {
                log::debug!("Detected language {:?} for {:?}", language, input);
                self.languages.store(language.clone());
                language
            }
            None => {
                log::warn!("Unusable language answer {:?}", raw.trim());
                let language = self.languages.default.clone();
                self.languages.store(language.clone());
                language
            }
        }
    }

    /// Rewrite `game_text` for the player. `None` when generation failed or
    /// produced nothing, in which case the host shows `game_text`.
    pub fn generate<C: Completion + ?Sized>(
        &mut self,
        completion: &mut C,
        prompts: &mut PromptBuilder,
        game_text: &str,
        user_text: &str,
        context: Option<&str>,
    ) -> Option<String> {
        if game_text.trim().is_empty() {
            return None;
        }
        let language = self.detect_language(completion, prompts, user_text);
        let prompt = prompts.response(&ResponsePrompt {
            language: &language,
            player_input: user_text,
            game_text,
            context,
        });

        match completion.complete(&CompletionRequest::creative(prompt, self.max_tokens)) {
            Ok(text) => {
                let text = text.trim();
                if text.is_empty() {
                    log::warn!("Narrator produced no text");
                    return None;
                }
                Some(text.to_string())
            }
            Err(e) => {
                log::warn!("Response generation failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatFormat;
    use crate::session::InferenceSession;
    use crate::testing::ScriptedModel;

    #[test]
    fn test_validate_language() {
        assert_eq!(validate_language("Spanish.\n").as_deref(), Some("Spanish"));
        assert_eq!(validate_language("  French language").as_deref(), Some("French"));
        assert_eq!(validate_language("Catalan").as_deref(), Some("Catalan"));
        assert_eq!(validate_language("es"), None);
        assert_eq!(validate_language(&"x".repeat(40)), None);
        assert_eq!(validate_language(" . "), None);
    }

    #[test]
    fn test_cache_falls_back_to_default() {
        let mut cache = LanguageCache::new("English");
        assert_eq!(cache.current(), "English");
        cache.store("Spanish".into());
        assert_eq!(cache.current(), "Spanish");
        cache.clear();
        assert_eq!(cache.detected(), None);
    }

    #[test]
    fn test_detection_caches_and_reuses() {
        let model = ScriptedModel::responding(&["Spanish"]);
        let script = model.handle();
        let mut session = InferenceSession::new(Box::new(model), &BackendConfig::default());
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        let mut generator = ResponseGenerator::new("English", 150);

        assert_eq!(generator.detect_language(&mut session, &mut prompts, ""), "English");
        assert_eq!(
            generator.detect_language(&mut session, &mut prompts, "mira el castillo"),
            "Spanish"
        );
        assert_eq!(generator.detect_language(&mut session, &mut prompts, ""), "Spanish");
        assert_eq!(script.prompts().len(), 1);
        assert_eq!(script.prompt_slots(), vec![session.reserved_slot()]);
    }

    #[test]
    fn test_rejected_detection_resets_cache() {
        let model = ScriptedModel::responding(&["Spanish", "?"]);
        let mut session = InferenceSession::new(Box::new(model), &BackendConfig::default());
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        let mut generator = ResponseGenerator::new("English", 150);

        generator.detect_language(&mut session, &mut prompts, "hola");
        assert_eq!(generator.languages().current(), "Spanish");
        assert_eq!(generator.detect_language(&mut session, &mut prompts, "??"), "English");
        assert_eq!(generator.languages().current(), "English");
        assert_eq!(generator.detect_language(&mut session, &mut prompts, ""), "English");
    }

    #[test]
    fn test_generate_trims_and_uses_language() {
        let model = ScriptedModel::responding(&["Spanish", "  Ves un castillo.\n"]);
        let script = model.handle();
        let mut session = InferenceSession::new(Box::new(model), &BackendConfig::default());
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        let mut generator = ResponseGenerator::new("English", 150);

        let text = generator.generate(
            &mut session,
            &mut prompts,
            "You see a castle.",
            "mira el castillo",
            None,
        );
        assert_eq!(text.as_deref(), Some("Ves un castillo."));
        assert!(script.prompts()[1].contains("into Spanish"));
    }

    #[test]
    fn test_generate_empty_output_is_none() {
        let model = ScriptedModel::responding(&["English", ""]);
        let mut session = InferenceSession::new(Box::new(model), &BackendConfig::default());
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        let mut generator = ResponseGenerator::new("English", 150);
        assert_eq!(
            generator.generate(&mut session, &mut prompts, "Ok.", "look", None),
            None
        );
        assert_eq!(
            generator.generate(&mut session, &mut prompts, "  ", "look", None),
            None
        );
    }
}
