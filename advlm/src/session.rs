//! Inference session: one loaded model, two samplers and a rotating set of
//! cache slots.
//!
//! Every request runs the same loop: pick a slot, clear it, tokenize the
//! prompt, feed it in batches (logits only for the final token), then sample
//! until end-of-generation, a newline (if requested) or the token budget.

use crate::config::BackendConfig;
use crate::engine::{Batch, LanguageModel, SequenceSlot, TokenStream};
use crate::error::GenerationError;
use crate::sampler::{Sampler, SamplerKind};

/// Which slot a request runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotChoice {
    /// Next slot of the round-robin rotation.
    Rotating,
    /// The last slot, used for language detection and cleared after use.
    Reserved,
}

/// One generation request.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub prompt: &'a str,
    pub sampler: SamplerKind,
    pub max_tokens: usize,
    pub stop_at_newline: bool,
    pub slot: SlotChoice,
}

impl<'a> CompletionRequest<'a> {
    /// Deterministic, newline-terminated request on a rotating slot.
    pub fn deterministic(prompt: &'a str, max_tokens: usize) -> Self {
        Self {
            prompt,
            sampler: SamplerKind::Deterministic,
            max_tokens,
            stop_at_newline: true,
            slot: SlotChoice::Rotating,
        }
    }

    /// Creative request that only stops at end-of-generation.
    pub fn creative(prompt: &'a str, max_tokens: usize) -> Self {
        Self {
            prompt,
            sampler: SamplerKind::Creative,
            max_tokens,
            stop_at_newline: false,
            slot: SlotChoice::Rotating,
        }
    }

    pub fn on_slot(mut self, slot: SlotChoice) -> Self {
        self.slot = slot;
        self
    }

    pub fn stop_at_newline(mut self, stop: bool) -> Self {
        self.stop_at_newline = stop;
        self
    }
}

/// Anything that can turn a prompt into text.
///
/// Implemented by [`InferenceSession`] for on-device engines and by the
/// remote client. Failures before any text exists are errors; failures
/// after some text was produced end generation with the partial text.
pub trait Completion: Send {
    fn complete(&mut self, request: &CompletionRequest<'_>) -> Result<String, GenerationError>;
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    Newline,
    TokenBudget,
    ContextFull,
    /// Decoding or sampling failed mid-generation; text is partial.
    Failure,
}

/// Result of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens: usize,
    pub slot: SequenceSlot,
    pub stop: StopReason,
}

/// Exclusive owner of a model and its samplers.
pub struct InferenceSession {
    model: Box<dyn LanguageModel>,
    deterministic: Sampler,
    /// `None` routes creative requests to the deterministic sampler.
    creative: Option<Sampler>,
    counter: usize,
    max_sequences: usize,
    batch_size: usize,
    micro_batch_size: usize,
    log_level: log::Level,
}

impl InferenceSession {
    pub fn new(model: Box<dyn LanguageModel>, config: &BackendConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        let creative = config
            .creative_sampling
            .then(|| Sampler::creative(config, seed.wrapping_add(1)));
        log::info!(
            "Inference session for {}: {} slots, batch {}/{}, creative sampling {}",
            model.name(),
            config.max_concurrent_sequences.max(1),
            config.batch_size,
            config.micro_batch_size,
            if creative.is_some() { "on" } else { "off" }
        );
        Self {
            model,
            deterministic: Sampler::deterministic(config, seed),
            creative,
            counter: 0,
            max_sequences: config.max_concurrent_sequences.max(1),
            batch_size: config.batch_size.max(1),
            micro_batch_size: config.micro_batch_size.clamp(1, config.batch_size.max(1)),
            log_level: config.prompt_log_level(),
        }
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub fn max_sequences(&self) -> usize {
        self.max_sequences
    }

    /// Number of rotating slots handed out so far.
    pub fn counter(&self) -> usize {
        self.counter
    }

    /// Next rotating slot: `counter++ mod N`.
    pub fn next_slot(&mut self) -> SequenceSlot {
        let slot = SequenceSlot(self.counter % self.max_sequences);
        self.counter = self.counter.wrapping_add(1);
        slot
    }

    pub fn reserved_slot(&self) -> SequenceSlot {
        SequenceSlot(self.max_sequences - 1)
    }

    /// Run one request to completion.
    pub fn generate(&mut self, request: &CompletionRequest<'_>) -> Result<Generation, GenerationError> {
        let slot = match request.slot {
            SlotChoice::Rotating => self.next_slot(),
            SlotChoice::Reserved => self.reserved_slot(),
        };
        let result = self.generate_in(slot, request);
        if request.slot == SlotChoice::Reserved {
            if let Err(e) = self.model.clear_sequence(slot) {
                log::warn!("Failed to clear reserved slot {}: {:#}", slot, e);
            }
        }
        result
    }

    fn generate_in(
        &mut self,
        slot: SequenceSlot,
        request: &CompletionRequest<'_>,
    ) -> Result<Generation, GenerationError> {
        log::log!(
            self.log_level,
            "=== PROMPT ({} chars, {}) ===\n{}\n=== END ===",
            request.prompt.len(),
            slot,
            request.prompt
        );

        // Stale entries from an earlier request would leak into attention.
        self.model
            .clear_sequence(slot)
            .map_err(|e| GenerationError::PromptDecode(format!("{e:#}")))?;

        let tokens = self
            .model
            .tokenize(request.prompt)
            .map_err(|e| GenerationError::Tokenize(format!("{e:#}")))?;
        if tokens.is_empty() {
            return Err(GenerationError::EmptyPrompt);
        }
        let context = self.model.context_size();
        if tokens.len() >= context {
            return Err(GenerationError::PromptTooLong {
                tokens: tokens.len(),
                context,
            });
        }

        let mut logits = self.feed_prompt(&tokens, slot)?;

        let sampler = match (request.sampler, self.creative.as_mut()) {
            (SamplerKind::Creative, Some(creative)) => creative,
            _ => &mut self.deterministic,
        };

        let mut stream = TokenStream::new();
        let mut text = String::new();
        let mut stop = StopReason::TokenBudget;
        let mut pos = tokens.len();

        for _ in 0..request.max_tokens {
            let token = match sampler.sample(&logits) {
                Ok(token) => token,
                Err(e) => {
                    log::warn!("Sampling failed on {}: {:#}", slot, e);
                    stop = StopReason::Failure;
                    break;
                }
            };
            if self.model.is_end_of_generation(token) {
                stop = StopReason::EndOfGeneration;
                break;
            }

            match stream.push(self.model.as_ref(), token) {
                Ok(piece) => text.push_str(&piece),
                Err(e) => {
                    log::warn!("Detokenize failed on {}: {:#}", slot, e);
                    stop = StopReason::Failure;
                    break;
                }
            }
            if request.stop_at_newline && text.contains('\n') {
                stop = StopReason::Newline;
                break;
            }
            if pos + 1 >= context {
                stop = StopReason::ContextFull;
                break;
            }

            let batch = Batch {
                tokens: &[token],
                start_pos: pos,
                slot,
                want_logits: true,
            };
            match self.model.decode(&batch) {
                Ok(Some(next)) => logits = next,
                Ok(None) => {
                    log::warn!("No logits at position {} on {}", pos, slot);
                    stop = StopReason::Failure;
                    break;
                }
                Err(e) => {
                    log::warn!("Decode failed at position {} on {}: {:#}", pos, slot, e);
                    stop = StopReason::Failure;
                    break;
                }
            }
            pos += 1;
        }

        log::log!(
            self.log_level,
            "=== OUTPUT ({} tokens, {:?}) ===\n{}\n=== END ===",
            stream.len(),
            stop,
            text
        );
        Ok(Generation {
            text,
            tokens: stream.len(),
            slot,
            stop,
        })
    }

    /// Feed the prompt in `batch_size` chunks split into `micro_batch_size`
    /// decode calls. Returns logits of the final prompt token.
    fn feed_prompt(
        &mut self,
        tokens: &[u32],
        slot: SequenceSlot,
    ) -> Result<candle_core::Tensor, GenerationError> {
        let mut pos = 0;
        let mut last_logits = None;
        for chunk in tokens.chunks(self.batch_size) {
            for micro in chunk.chunks(self.micro_batch_size) {
                let is_last = pos + micro.len() == tokens.len();
                let batch = Batch {
                    tokens: micro,
                    start_pos: pos,
                    slot,
                    want_logits: is_last,
                };
                last_logits = self
                    .model
                    .decode(&batch)
                    .map_err(|e| GenerationError::PromptDecode(format!("{e:#}")))?;
                pos += micro.len();
            }
        }
        last_logits.ok_or(GenerationError::NoLogits)
    }
}

impl Completion for InferenceSession {
    fn complete(&mut self, request: &CompletionRequest<'_>) -> Result<String, GenerationError> {
        self.generate(request).map(|generation| generation.text)
    }
}
