//! Prompt building for command resolution and narration.
//!
//! Every prompt is a chat transcript: optional system turn, few-shot
//! user/assistant pairs, then the real user turn and an open assistant turn.
//! The role markers depend on [`ChatFormat`].

use std::fmt::Write;

use crate::config::{BackendConfig, ChatFormat, FewShot, MatchExample};

/// Game context lines embedded in the narrator prompt are cut at this many
/// characters.
pub const CONTEXT_PROMPT_LIMIT: usize = 512;

const MATCHER_RULES: &str = "You are a command matcher for a text adventure game. \
Your job is to determine if a user's input (in any language) has the same meaning \
as a specific game command (in English).\n\n\
Rules:\n\
- If the input means the same action as the expected command, answer 'yes'\n\
- If the input means something different, answer 'no'\n\
- Only answer with 'yes' or 'no', nothing else\n";

/// Few-shot pairs for the language detection prompt.
const LANGUAGE_SHOTS: [(&str, &str); 3] = [
    ("mira el castillo", "Spanish"),
    ("look at the castle", "English"),
    ("prends la clé", "French"),
];

/// Inputs for the narrator prompt.
#[derive(Debug, Clone, Copy)]
pub struct ResponsePrompt<'a> {
    pub language: &'a str,
    pub player_input: &'a str,
    pub game_text: &'a str,
    /// Rendered game context. Empty or `None` omits the line.
    pub context: Option<&'a str>,
}

/// Builds prompts into a reused buffer.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    buffer: String,
    format: ChatFormat,
    extraction_examples: Vec<FewShot>,
    match_examples: Vec<MatchExample>,
}

impl PromptBuilder {
    /// Create a builder with the built-in few-shot examples.
    pub fn new(format: ChatFormat) -> Self {
        Self {
            buffer: String::with_capacity(4096),
            format,
            extraction_examples: crate::config::default_extraction_examples(),
            match_examples: crate::config::default_match_examples(),
        }
    }

    /// Create a builder using the format and examples from a config.
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            extraction_examples: config.extraction_examples.clone(),
            match_examples: config.match_examples.clone(),
            ..Self::new(config.chat_format)
        }
    }

    pub fn format(&self) -> ChatFormat {
        self.format
    }

    /// Translate-to-canonical-English prompt.
    ///
    /// With a vocabulary hint the model is told which verbs the game knows;
    /// without one it is only asked for a verb and a noun.
    ///
    /// # Format (Phi markers, hint present)
    /// ```text
    /// <|user|>
    /// Translate to English using these verbs: look, get, open
    /// Input: mira el castillo<|end|>
    /// <|assistant|>
    /// look castle<|end|>
    /// <|user|>
    /// Translate to English using these verbs: look, get, open
    /// Input: abre la puerta<|end|>
    /// <|assistant|>
    /// ```
    pub fn extraction(&mut self, input: &str, vocabulary_hint: Option<&str>) -> &str {
        self.buffer.clear();
        let hint = vocabulary_hint.filter(|h| !h.trim().is_empty());
        let request = |text: &str| match hint {
            Some(hint) => format!("Translate to English using these verbs: {hint}\nInput: {text}"),
            None => format!("Translate to English (verb noun only):\n{text}"),
        };

        for shot in &self.extraction_examples {
            push_user(&mut self.buffer, self.format, &request(&shot.input));
            push_assistant(&mut self.buffer, self.format, &shot.output);
        }
        push_user(&mut self.buffer, self.format, &request(input));
        open_assistant(&mut self.buffer, self.format);
        &self.buffer
    }

    /// Yes/no prompt asking whether `input` means `expected`.
    pub fn semantic_match(&mut self, expected: &str, input: &str) -> &str {
        self.buffer.clear();
        push_system(&mut self.buffer, self.format, MATCHER_RULES);
        for example in &self.match_examples {
            push_user(
                &mut self.buffer,
                self.format,
                &match_question(&example.expected, &example.input),
            );
            let answer = if example.matches { "yes" } else { "no" };
            push_assistant(&mut self.buffer, self.format, answer);
        }
        push_user(&mut self.buffer, self.format, &match_question(expected, input));
        open_assistant(&mut self.buffer, self.format);
        &self.buffer
    }

    /// Prompt asking for the English name of the language of `input`.
    pub fn language_detection(&mut self, input: &str) -> &str {
        self.buffer.clear();
        let question = |text: &str| {
            format!(
                "Which language is this text written in? \
                 Answer with the English name of the language only.\nText: {text}"
            )
        };
        for (text, language) in LANGUAGE_SHOTS {
            push_user(&mut self.buffer, self.format, &question(text));
            push_assistant(&mut self.buffer, self.format, language);
        }
        push_user(&mut self.buffer, self.format, &question(input));
        open_assistant(&mut self.buffer, self.format);
        &self.buffer
    }

    /// Narrator prompt rewriting the game's answer in the player's language.
    pub fn response(&mut self, request: &ResponsePrompt<'_>) -> &str {
        self.buffer.clear();
        let language = request.language;
        let mut body = String::with_capacity(512);
        let _ = write!(
            body,
            "You are a text adventure game narrator. Translate ONLY the game response \
             into {language}, the language the player used. Do NOT include any context \
             information in your answer.\n\n\
             Player said: {}\n\
             Game responded: {}\n",
            request.player_input, request.game_text
        );
        if let Some(context) = request.context.map(str::trim).filter(|c| !c.is_empty()) {
            let _ = writeln!(body, "Game context: {}", truncate_chars(context, CONTEXT_PROMPT_LIMIT));
        }
        let _ = write!(
            body,
            "Be creative, but keep the meaning of the game response. \
             Output only the translated text in {language}, nothing else:"
        );
        push_user(&mut self.buffer, self.format, &body);
        open_assistant(&mut self.buffer, self.format);
        &self.buffer
    }
}

fn match_question(expected: &str, input: &str) -> String {
    format!("Expected command: {expected}\nUser input: {input}\nDoes the input match the command?")
}

fn push_system(buf: &mut String, format: ChatFormat, text: &str) {
    let _ = match format {
        ChatFormat::Phi => write!(buf, "<|system|>\n{text}<|end|>\n"),
        ChatFormat::BitNet => write!(buf, "<start_of_system>\n{text}<end_of_system>\n"),
        ChatFormat::Plain => write!(buf, "{text}\n"),
    };
}

fn push_user(buf: &mut String, format: ChatFormat, text: &str) {
    let _ = match format {
        ChatFormat::Phi => write!(buf, "<|user|>\n{text}<|end|>\n"),
        ChatFormat::BitNet => write!(buf, "<start_of_user>\n{text}<end_of_user>\n"),
        ChatFormat::Plain => write!(buf, "User: {text}\n"),
    };
}

fn push_assistant(buf: &mut String, format: ChatFormat, text: &str) {
    let _ = match format {
        ChatFormat::Phi => write!(buf, "<|assistant|>\n{text}<|end|>\n"),
        ChatFormat::BitNet => write!(buf, "<start_of_assistant>\n{text}<end_of_assistant>\n"),
        ChatFormat::Plain => write!(buf, "Assistant: {text}\n\n"),
    };
}

fn open_assistant(buf: &mut String, format: ChatFormat) {
    buf.push_str(match format {
        ChatFormat::Phi => "<|assistant|>\n",
        ChatFormat::BitNet => "<start_of_assistant>\n",
        ChatFormat::Plain => "Assistant:",
    });
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
