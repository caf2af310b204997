//! The inference-engine seam used by [`InferenceSession`](crate::session::InferenceSession).
//!
//! Engines expose tokenize / decode primitives over a KV cache partitioned
//! into sequence slots. Sampling and generation loops live in the session so
//! every engine shares them.

use std::fmt;

use anyhow::Result;
use candle_core::Tensor;

/// An isolated region of an engine's attention cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceSlot(pub usize);

impl SequenceSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SequenceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq{}", self.0)
    }
}

/// Contiguous tokens appended to one slot.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub tokens: &'a [u32],
    /// Position of `tokens[0]` within the slot's sequence.
    pub start_pos: usize,
    pub slot: SequenceSlot,
    /// Whether logits for the last token are needed.
    pub want_logits: bool,
}

/// A loaded model with a slot-partitioned cache.
///
/// Implementations must keep slots isolated: decoding into one slot never
/// changes what another slot attends to.
pub trait LanguageModel: Send {
    /// Short name for log lines.
    fn name(&self) -> &str;

    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode a whole token sequence to text.
    fn detokenize(&self, tokens: &[u32]) -> Result<String>;

    fn is_end_of_generation(&self, token: u32) -> bool;

    /// Maximum positions a single slot can hold.
    fn context_size(&self) -> usize;

    /// Drop every cached entry of `slot`.
    fn clear_sequence(&mut self, slot: SequenceSlot) -> Result<()>;

    /// Append `batch` to its slot's cache. Returns last-token logits when
    /// `want_logits` is set.
    fn decode(&mut self, batch: &Batch<'_>) -> Result<Option<Tensor>>;
}

/// Incremental detokenizer.
///
/// Decoding tokens one at a time loses leading spaces with SentencePiece
/// style tokenizers, so the full sequence is decoded and the new suffix
/// returned.
#[derive(Debug, Default)]
pub struct TokenStream {
    tokens: Vec<u32>,
    text_len: usize,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token and return the text it contributed (possibly empty while
    /// a multi-byte character is incomplete).
    pub fn push(&mut self, model: &dyn LanguageModel, token: u32) -> Result<String> {
        self.tokens.push(token);
        let text = model.detokenize(&self.tokens)?;
        if text.len() > self.text_len && text.is_char_boundary(self.text_len) {
            let piece = text[self.text_len..].to_string();
            // Incomplete UTF-8 shows up as a trailing replacement character.
            if piece.ends_with('\u{FFFD}') {
                return Ok(String::new());
            }
            self.text_len = text.len();
            Ok(piece)
        } else {
            Ok(String::new())
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Coalesces prompt batches that do not request logits.
///
/// The candle Llama attention masks only cover a square prefill, so a chunk
/// starting after position 0 cannot be run against a partially filled cache.
/// Engines stage every batch here and only run the model once logits are
/// wanted, on everything staged for that slot.
#[derive(Debug, Default)]
pub struct PrefillBuffer {
    slot: Option<SequenceSlot>,
    start_pos: usize,
    tokens: Vec<u32>,
}

impl PrefillBuffer {
    /// Stage `batch`. Returns `(start_pos, tokens)` to run now, or `None`
    /// when the batch was only buffered.
    pub fn stage(&mut self, batch: &Batch<'_>) -> Option<(usize, Vec<u32>)> {
        let contiguous = self.slot == Some(batch.slot)
            && batch.start_pos == self.start_pos + self.tokens.len();
        if !contiguous {
            self.slot = Some(batch.slot);
            self.start_pos = batch.start_pos;
            self.tokens.clear();
        }
        self.tokens.extend_from_slice(batch.tokens);
        if !batch.want_logits {
            return None;
        }
        self.slot = None;
        Some((self.start_pos, std::mem::take(&mut self.tokens)))
    }

    /// Drop anything staged for `slot`.
    pub fn discard(&mut self, slot: SequenceSlot) {
        if self.slot == Some(slot) {
            self.slot = None;
            self.tokens.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    fn batch(tokens: &[u32], start_pos: usize, want_logits: bool) -> Batch<'_> {
        Batch {
            tokens,
            start_pos,
            slot: SequenceSlot(1),
            want_logits,
        }
    }

    #[test]
    fn test_prefill_coalesces_until_logits() {
        let mut prefill = PrefillBuffer::default();
        assert_eq!(prefill.stage(&batch(&[1, 2], 0, false)), None);
        assert_eq!(prefill.stage(&batch(&[3, 4], 2, false)), None);
        assert_eq!(prefill.stage(&batch(&[5], 4, true)), Some((0, vec![1, 2, 3, 4, 5])));
        // Generation steps pass straight through.
        assert_eq!(prefill.stage(&batch(&[9], 5, true)), Some((5, vec![9])));
    }

    #[test]
    fn test_prefill_restarts_on_gap_or_discard() {
        let mut prefill = PrefillBuffer::default();
        prefill.stage(&batch(&[1, 2], 0, false));
        assert_eq!(prefill.stage(&batch(&[7], 0, true)), Some((0, vec![7])));

        prefill.stage(&batch(&[1, 2], 0, false));
        prefill.discard(SequenceSlot(1));
        assert_eq!(prefill.stage(&batch(&[3], 2, true)), Some((2, vec![3])));
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(SequenceSlot(3).to_string(), "seq3");
        assert_eq!(SequenceSlot(3).index(), 3);
    }

    #[test]
    fn test_token_stream_yields_suffixes() {
        let model = ScriptedModel::new();
        let script = model.handle();
        let ids = script.intern_pieces(&["look", " castle"]);

        let mut stream = TokenStream::new();
        assert_eq!(stream.push(&model, ids[0]).unwrap(), "look");
        assert_eq!(stream.push(&model, ids[1]).unwrap(), " castle");
        assert_eq!(stream.len(), 2);
    }
}
