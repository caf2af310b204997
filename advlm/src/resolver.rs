//! Command resolution: extraction and semantic matching.
//!
//! The free functions are the protocols every backend runs over its
//! [`Completion`]; [`CommandResolver`] is the host-facing entry point that
//! owns a backend, the dictionary view and the game context.
//!
//! Every entry point is total. Backend trouble degrades to the value the
//! host's exact-match parser would have worked with anyway.

use wordtok::{Dictionary, DictionaryError};

use crate::backend::{Backend, create_backend};
use crate::config::{BackendConfig, ResolverMode};
use crate::context::GameContext;
use crate::error::BackendError;
use crate::prompt::PromptBuilder;
use crate::session::{Completion, CompletionRequest};

/// Tokens sampled for an extraction.
pub const EXTRACTION_TOKEN_BUDGET: usize = 10;

/// Default number of dictionary words in the vocabulary hint.
pub const DEFAULT_HINT_WORDS: usize = 50;

/// A parsed semantic-match answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    Yes,
    No,
    /// Neither; counted as no match.
    Unclear,
}

/// Classify a model answer by its leading word.
pub fn parse_match_answer(text: &str) -> MatchVerdict {
    let answer = text.trim_start().to_lowercase();
    if answer.starts_with("yes") {
        MatchVerdict::Yes
    } else if answer.starts_with("no") {
        MatchVerdict::No
    } else {
        MatchVerdict::Unclear
    }
}

/// Rewrite `input` as canonical lower-case English ("verb noun").
///
/// Returns `input` unchanged when it is empty, when generation cannot run,
/// or when the model produced nothing.
pub fn extract_canonical<C: Completion + ?Sized>(
    completion: &mut C,
    prompts: &mut PromptBuilder,
    input: &str,
    vocabulary_hint: Option<&str>,
) -> String {
    if input.trim().is_empty() {
        return input.to_string();
    }
    let prompt = prompts.extraction(input, vocabulary_hint);
    match completion.complete(&CompletionRequest::deterministic(prompt, EXTRACTION_TOKEN_BUDGET)) {
        Ok(text) => {
            let canonical = text.trim().to_lowercase();
            if canonical.is_empty() {
                log::warn!("Extraction produced no text for {:?}; using input", input);
                return input.to_string();
            }
            log::debug!("Extracted {:?} -> {:?}", input, canonical);
            canonical
        }
        Err(e) => {
            log::warn!("Extraction failed for {:?}: {}", input, e);
            input.to_string()
        }
    }
}

/// Ask whether `input` means the command spelled by `expected_words`.
///
/// Only an answer starting with "yes" is a match; errors and unclear
/// answers are not.
pub fn semantic_match<C: Completion + ?Sized>(
    completion: &mut C,
    prompts: &mut PromptBuilder,
    input: &str,
    expected_words: &[String],
    max_tokens: usize,
) -> bool {
    let phrase = expected_words
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if phrase.is_empty() || input.trim().is_empty() {
        return false;
    }

    let prompt = prompts.semantic_match(&phrase, input);
    match completion.complete(&CompletionRequest::deterministic(prompt, max_tokens.max(1))) {
        Ok(text) => {
            let verdict = parse_match_answer(&text);
            if verdict == MatchVerdict::Unclear {
                log::warn!("Unclear match answer {:?} for {:?} vs {:?}", text.trim(), input, phrase);
            } else {
                log::debug!("Match {:?} vs {:?}: {:?}", input, phrase, verdict);
            }
            verdict == MatchVerdict::Yes
        }
        Err(e) => {
            log::warn!("Semantic match failed for {:?}: {}", input, e);
            false
        }
    }
}

/// Host-facing resolver.
///
/// Borrows the game's dictionary for `'d` and owns exactly one backend.
pub struct CommandResolver<'d> {
    backend: Box<dyn Backend>,
    mode: ResolverMode,
    dictionary: Option<Dictionary<'d>>,
    vocabulary_hint: Option<String>,
    hint_words: usize,
    context: GameContext,
}

impl<'d> CommandResolver<'d> {
    pub fn new(backend: Box<dyn Backend>, mode: ResolverMode) -> Self {
        Self {
            backend,
            mode,
            dictionary: None,
            vocabulary_hint: None,
            hint_words: DEFAULT_HINT_WORDS,
            context: GameContext::new(),
        }
    }

    /// Construct the configured backend and wrap it.
    ///
    /// A failure here means the resolver is unavailable; the host keeps its
    /// exact-match parser.
    pub fn from_config(config: &BackendConfig) -> Result<Self, BackendError> {
        let backend = create_backend(config)?;
        Ok(Self::new(backend, config.mode).with_hint_words(config.vocabulary_hint_words))
    }

    pub fn with_hint_words(mut self, words: usize) -> Self {
        self.hint_words = words;
        self
    }

    pub fn mode(&self) -> ResolverMode {
        self.mode
    }

    /// Attach the game dictionary and compute the vocabulary hint once.
    /// Returns the number of dictionary entries.
    pub fn set_dictionary(&mut self, data: &'d [u8]) -> Result<usize, DictionaryError> {
        let dictionary = Dictionary::new(data)?;
        let count = dictionary.len();
        let hint = dictionary.sample_common_words(self.hint_words);
        log::info!(
            "Dictionary attached: {} words, hint of {} words",
            count,
            hint.split(", ").filter(|w| !w.is_empty()).count()
        );
        self.vocabulary_hint = (!hint.is_empty()).then_some(hint);
        self.dictionary = Some(dictionary);
        Ok(count)
    }

    pub fn dictionary(&self) -> Option<&Dictionary<'d>> {
        self.dictionary.as_ref()
    }

    pub fn vocabulary_hint(&self) -> Option<&str> {
        self.vocabulary_hint.as_deref()
    }

    pub fn context(&self) -> &GameContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut GameContext {
        &mut self.context
    }

    /// Canonical English for `input`, or `input` itself.
    pub fn extract_words(&mut self, input: &str) -> String {
        if self.mode == ResolverMode::Disabled || input.trim().is_empty() {
            return input.to_string();
        }
        self.backend
            .extract_canonical(input, self.vocabulary_hint.as_deref())
    }

    /// Whether `input` means the command made of `expected_ids`.
    ///
    /// Ids missing from the dictionary are skipped; with none left, or no
    /// dictionary at all, the answer is no.
    pub fn matches_expected(&mut self, input: &str, expected_ids: &[u16]) -> bool {
        if expected_ids.is_empty() || self.mode != ResolverMode::Semantic {
            return false;
        }
        let Some(dictionary) = self.dictionary.as_ref() else {
            log::debug!("No dictionary attached; cannot match {:?}", input);
            return false;
        };
        let words: Vec<String> = expected_ids
            .iter()
            .filter_map(|&id| {
                let word = dictionary.lookup(id);
                if word.is_none() {
                    log::debug!("Word id {} not in dictionary", id);
                }
                word
            })
            .collect();
        self.matches_words(input, &words)
    }

    /// Like [`matches_expected`](Self::matches_expected) for hosts that
    /// already hold the expected words.
    pub fn matches_words(&mut self, input: &str, expected_words: &[String]) -> bool {
        if expected_words.is_empty() || self.mode != ResolverMode::Semantic {
            return false;
        }
        self.backend.matches(input, expected_words)
    }

    /// Narrate `game_text` in the player's language. `None` means the host
    /// should show `game_text` as is.
    ///
    /// An empty `user_text` falls back to the last input recorded in the
    /// game context.
    pub fn generate_response(&mut self, game_text: &str, user_text: &str) -> Option<String> {
        if self.mode == ResolverMode::Disabled {
            return None;
        }
        let user_text = if user_text.trim().is_empty() {
            self.context.last_player_input().unwrap_or_default().to_string()
        } else {
            user_text.to_string()
        };
        let context = if self.context.is_empty() {
            None
        } else {
            Some(self.context.rendered().to_string())
        };
        self.backend
            .generate_response(game_text, &user_text, context.as_deref())
    }

    /// Release the backend. Later calls return their fallbacks.
    pub fn shutdown(&mut self) {
        self.backend.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use crate::{config::ChatFormat, session::InferenceSession};

    fn session(responses: &[&str]) -> (InferenceSession, crate::testing::ScriptHandle) {
        let model = ScriptedModel::responding(responses);
        let handle = model.handle();
        (InferenceSession::new(Box::new(model), &BackendConfig::default()), handle)
    }

    #[test]
    fn test_parse_match_answer() {
        assert_eq!(parse_match_answer("Yes, it matches."), MatchVerdict::Yes);
        assert_eq!(parse_match_answer("  yes"), MatchVerdict::Yes);
        assert_eq!(parse_match_answer("No."), MatchVerdict::No);
        assert_eq!(parse_match_answer("I'm not sure"), MatchVerdict::Unclear);
        assert_eq!(parse_match_answer(""), MatchVerdict::Unclear);
    }

    #[test]
    fn test_extraction_normalizes_output() {
        let (mut completion, script) = session(&["  Look Castle \n"]);
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        let out = extract_canonical(&mut completion, &mut prompts, "mira el castillo", Some("look, get"));
        assert_eq!(out, "look castle");
        assert!(script.prompts()[0].contains("Translate to English using these verbs: look, get"));
    }

    #[test]
    fn test_extraction_falls_back_to_input() {
        // Empty generation.
        let (mut completion, _) = session(&[""]);
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        assert_eq!(
            extract_canonical(&mut completion, &mut prompts, "xyzzy", None),
            "xyzzy"
        );
        // Empty input never reaches the model.
        let (mut completion, script) = session(&[]);
        assert_eq!(extract_canonical(&mut completion, &mut prompts, "", None), "");
        assert!(script.prompts().is_empty());
    }

    #[test]
    fn test_semantic_match_requires_yes() {
        let (mut completion, script) = session(&["Yes, it matches.", "no", "maybe"]);
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        let words = vec!["look".to_string(), "castle".to_string()];
        assert!(semantic_match(&mut completion, &mut prompts, "mira el castillo", &words, 5));
        assert!(!semantic_match(&mut completion, &mut prompts, "salir", &words, 5));
        assert!(!semantic_match(&mut completion, &mut prompts, "hmm", &words, 5));
        assert!(script.prompts()[0].contains("Expected command: look castle\nUser input: mira el castillo"));
    }

    #[test]
    fn test_semantic_match_empty_inputs() {
        let (mut completion, script) = session(&["yes"]);
        let mut prompts = PromptBuilder::new(ChatFormat::Phi);
        assert!(!semantic_match(&mut completion, &mut prompts, "look", &[], 5));
        assert!(!semantic_match(&mut completion, &mut prompts, "look", &[" ".to_string()], 5));
        assert!(!semantic_match(&mut completion, &mut prompts, " ", &["look".to_string()], 5));
        assert!(script.prompts().is_empty());
    }
}
