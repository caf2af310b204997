//! Scripted stand-ins for model engines and HTTP transports.
//!
//! [`ScriptedModel`] plays back queued responses through one-hot logits, so
//! the real session loop, samplers and protocols run unchanged without
//! weights. Each prompt (a decode starting at position 0) consumes the next
//! queued response. [`CannedTransport`] does the same for the remote backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, bail};
use candle_core::{Device, Tensor};

use crate::engine::{Batch, LanguageModel, SequenceSlot};
use crate::remote::Transport;

/// End-of-generation token id.
pub const END_TOKEN: u32 = 0;
/// Id every prompt word tokenizes to.
pub const PROMPT_TOKEN: u32 = 1;

const ONE_HOT_LOGIT: f32 = 100.0;

/// Something the scripted model was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    Cleared(SequenceSlot),
    Decoded {
        slot: SequenceSlot,
        start_pos: usize,
        len: usize,
        want_logits: bool,
    },
}

#[derive(Debug)]
struct ScriptState {
    vocab: Vec<String>,
    responses: VecDeque<Vec<u32>>,
    current: Vec<u32>,
    logits_served: usize,
    generated_fed: usize,
    fail_after: Option<usize>,
    prompts: Vec<String>,
    events: Vec<ModelEvent>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            vocab: vec![String::new(), " ".to_string()],
            responses: VecDeque::new(),
            current: Vec::new(),
            logits_served: 0,
            generated_fed: 0,
            fail_after: None,
            prompts: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl ScriptState {
    fn intern(&mut self, piece: &str) -> u32 {
        if let Some(id) = self.vocab.iter().skip(2).position(|p| p == piece) {
            return id as u32 + 2;
        }
        self.vocab.push(piece.to_string());
        (self.vocab.len() - 1) as u32
    }
}

/// Shared view of a [`ScriptedModel`], usable after the model has been moved
/// into a session or backend.
#[derive(Debug, Clone, Default)]
pub struct ScriptHandle(Arc<Mutex<ScriptState>>);

impl ScriptHandle {
    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the text the model generates for the next prompt.
    pub fn respond_with(&self, text: &str) {
        let pieces = split_pieces(text);
        let mut state = self.state();
        let ids = pieces.iter().map(|p| state.intern(p)).collect();
        state.responses.push_back(ids);
    }

    /// Register pieces and return their ids.
    pub fn intern_pieces(&self, pieces: &[&str]) -> Vec<u32> {
        let mut state = self.state();
        pieces.iter().map(|p| state.intern(p)).collect()
    }

    /// Make the decode of generated token `n + 1` fail (the first `n`
    /// generated tokens are fed normally).
    pub fn fail_generation_after(&self, n: usize) {
        self.state().fail_after = Some(n);
    }

    pub fn events(&self) -> Vec<ModelEvent> {
        self.state().events.clone()
    }

    pub fn cleared_slots(&self) -> Vec<SequenceSlot> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::Cleared(slot) => Some(*slot),
                ModelEvent::Decoded { .. } => None,
            })
            .collect()
    }

    /// Slot of every prompt, in order.
    pub fn prompt_slots(&self) -> Vec<SequenceSlot> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::Decoded { slot, start_pos: 0, .. } => Some(*slot),
                _ => None,
            })
            .collect()
    }

    /// Every prompt text passed to `tokenize`.
    pub fn prompts(&self) -> Vec<String> {
        self.state().prompts.clone()
    }

    pub fn pending_responses(&self) -> usize {
        self.state().responses.len()
    }
}

/// A [`LanguageModel`] that emits scripted text.
///
/// Prompts tokenize to one [`PROMPT_TOKEN`] per whitespace-separated word.
/// Responses are split into word pieces carrying their leading space;
/// newlines are pieces of their own.
#[derive(Debug)]
pub struct ScriptedModel {
    script: ScriptHandle,
    context_size: usize,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::with_context_size(4096)
    }

    pub fn with_context_size(context_size: usize) -> Self {
        Self {
            script: ScriptHandle::default(),
            context_size,
        }
    }

    /// Build a model whose first responses are `texts`.
    pub fn responding(texts: &[&str]) -> Self {
        let model = Self::new();
        for text in texts {
            model.script.respond_with(text);
        }
        model
    }

    pub fn handle(&self) -> ScriptHandle {
        self.script.clone()
    }
}

impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        self.script.state().prompts.push(text.to_string());
        Ok(text.split_whitespace().map(|_| PROMPT_TOKEN).collect())
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        let state = self.script.state();
        let mut text = String::new();
        for &token in tokens {
            match state.vocab.get(token as usize) {
                Some(piece) => text.push_str(piece),
                None => bail!("unknown token {}", token),
            }
        }
        Ok(text)
    }

    fn is_end_of_generation(&self, token: u32) -> bool {
        token == END_TOKEN
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn clear_sequence(&mut self, slot: SequenceSlot) -> Result<()> {
        self.script.state().events.push(ModelEvent::Cleared(slot));
        Ok(())
    }

    fn decode(&mut self, batch: &Batch<'_>) -> Result<Option<Tensor>> {
        let mut state = self.script.state();
        state.events.push(ModelEvent::Decoded {
            slot: batch.slot,
            start_pos: batch.start_pos,
            len: batch.tokens.len(),
            want_logits: batch.want_logits,
        });

        if batch.start_pos == 0 {
            state.current = state.responses.pop_front().unwrap_or_default();
            state.logits_served = 0;
            state.generated_fed = 0;
        } else if state.logits_served > 0 {
            if state.fail_after.is_some_and(|n| state.generated_fed >= n) {
                bail!("scripted decode failure");
            }
            state.generated_fed += 1;
        }

        if !batch.want_logits {
            return Ok(None);
        }
        let next = state
            .current
            .get(state.logits_served)
            .copied()
            .unwrap_or(END_TOKEN);
        state.logits_served += 1;

        let mut logits = vec![0.0f32; state.vocab.len()];
        logits[next as usize] = ONE_HOT_LOGIT;
        Ok(Some(Tensor::from_vec(logits, state.vocab.len(), &Device::Cpu)?))
    }
}

/// Split text into word pieces: spaces attach to the following word and
/// each newline stands alone.
fn split_pieces(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c == '\n' {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }
            pieces.push("\n".to_string());
        } else if c == ' ' && !current.is_empty() && !current.chars().all(|ch| ch == ' ') {
            pieces.push(std::mem::take(&mut current));
            current.push(c);
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// A request seen by [`CannedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub credential: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct CannedState {
    replies: VecDeque<Result<String, String>>,
    requests: Vec<RecordedRequest>,
}

/// A [`Transport`] returning queued bodies and recording requests.
#[derive(Debug, Clone, Default)]
pub struct CannedTransport(Arc<Mutex<CannedState>>);

impl CannedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, CannedState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a raw response body.
    pub fn reply(&self, body: &str) -> &Self {
        self.state().replies.push_back(Ok(body.to_string()));
        self
    }

    /// Queue a chat-completion body whose message content is `content`.
    pub fn reply_content(&self, content: &str) -> &Self {
        let body = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        });
        self.reply(&body.to_string())
    }

    /// Queue a transport failure.
    pub fn fail(&self, message: &str) -> &Self {
        self.state().replies.push_back(Err(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state().requests.clone()
    }
}

impl Transport for CannedTransport {
    fn post_json(&mut self, url: &str, credential: &str, body: String) -> Result<String> {
        let mut state = self.state();
        state.requests.push(RecordedRequest {
            url: url.to_string(),
            credential: credential.to_string(),
            body,
        });
        match state.replies.pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => bail!("{}", message),
            None => bail!("no canned reply queued"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pieces() {
        assert_eq!(split_pieces("look castle"), vec!["look", " castle"]);
        assert_eq!(split_pieces("Yes, it matches."), vec!["Yes,", " it", " matches."]);
        assert_eq!(split_pieces("a\nb"), vec!["a", "\n", "b"]);
        assert_eq!(split_pieces(" no"), vec![" no"]);
    }

    #[test]
    fn test_prompt_consumes_next_response() {
        let mut model = ScriptedModel::responding(&["first", "second"]);
        let handle = model.handle();
        let batch = Batch {
            tokens: &[PROMPT_TOKEN],
            start_pos: 0,
            slot: SequenceSlot(0),
            want_logits: true,
        };
        let logits = model.decode(&batch).unwrap().unwrap();
        let values: Vec<f32> = logits.to_vec1().unwrap();
        let argmax = values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i as u32)
            .unwrap();
        assert_eq!(model.detokenize(&[argmax]).unwrap(), "first");
        assert_eq!(handle.pending_responses(), 1);
    }
}
