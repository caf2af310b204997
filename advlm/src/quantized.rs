//! Low-bit GGUF engine for the quantized backend.
//!
//! The quantized weights are shared between slots; each slot owns a clone of
//! the model whose KV cache is private. Clones are made lazily on first use
//! and dropped when the slot is cleared.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::models::quantized_llama::ModelWeights;
use tokenizers::Tokenizer;

use crate::config::BackendConfig;
use crate::device::{DevicePreference, select_device};
use crate::engine::{Batch, LanguageModel, PrefillBuffer, SequenceSlot};
use crate::model::last_position_logits;

const END_MARKERS: [&str; 4] = ["</s>", "<|end|>", "<|eot_id|>", "<end_of_assistant>"];

/// GGUF Llama-family model with a private cache per slot.
pub struct QuantizedLlama {
    template: ModelWeights,
    slots: Vec<Option<ModelWeights>>,
    prefill: PrefillBuffer,
    tokenizer: Tokenizer,
    device: Device,
    eos_tokens: Vec<u32>,
    context_size: usize,
    name: String,
}

impl QuantizedLlama {
    /// Load `config.model_path` (a `.gguf` file) on the CPU.
    pub fn load(config: &BackendConfig) -> Result<Self> {
        let load_start = std::time::Instant::now();
        let device = select_device(DevicePreference::from_use_gpu(config.use_gpu));
        let path = Path::new(&config.model_path);

        let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let content = gguf_file::Content::read(&mut file)
            .map_err(|e| e.with_path(path))
            .context("Failed to read GGUF header")?;

        let metadata_u32 = |key: &str| content.metadata.get(key).and_then(|v| v.to_u32().ok());
        let trained_context = metadata_u32("llama.context_length").map(|n| n as usize);
        let mut eos_tokens: Vec<u32> = metadata_u32("tokenizer.ggml.eos_token_id").into_iter().collect();
        log::info!(
            "GGUF {}: {} tensors, trained context {:?}",
            path.display(),
            content.tensor_infos.len(),
            trained_context
        );

        let template = ModelWeights::from_gguf(content, &mut file, &device)
            .context("Failed to build quantized model")?;

        let tokenizer_path = tokenizer_path(path, config.tokenizer_path.as_deref());
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {}: {}", tokenizer_path.display(), e)
        })?;
        eos_tokens.extend(END_MARKERS.iter().filter_map(|m| tokenizer.token_to_id(m)));
        eos_tokens.sort_unstable();
        eos_tokens.dedup();

        let context_size = match trained_context {
            Some(trained) => config.context_size.min(trained),
            None => config.context_size,
        };
        let slots = config.max_concurrent_sequences.max(1);
        log::info!(
            "Quantized model loaded in {:.2}s (context {}, {} slots)",
            load_start.elapsed().as_secs_f64(),
            context_size,
            slots
        );

        Ok(Self {
            template,
            slots: (0..slots).map(|_| None).collect(),
            prefill: PrefillBuffer::default(),
            tokenizer,
            device,
            eos_tokens,
            context_size,
            name: path.display().to_string(),
        })
    }
}

/// The configured tokenizer, else `tokenizer.json` beside the model file.
fn tokenizer_path(model: &Path, configured: Option<&Path>) -> PathBuf {
    match configured {
        Some(path) => path.to_path_buf(),
        None => model.with_file_name("tokenizer.json"),
    }
}

impl LanguageModel for QuantizedLlama {
    fn name(&self) -> &str {
        &self.name
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow::anyhow!("Detokenization failed: {}", e))
    }

    fn is_end_of_generation(&self, token: u32) -> bool {
        self.eos_tokens.contains(&token)
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn clear_sequence(&mut self, slot: SequenceSlot) -> Result<()> {
        let entry = self
            .slots
            .get_mut(slot.index())
            .with_context(|| format!("No cache for {slot}"))?;
        *entry = None;
        self.prefill.discard(slot);
        Ok(())
    }

    fn decode(&mut self, batch: &Batch<'_>) -> Result<Option<Tensor>> {
        let entry = self
            .slots
            .get_mut(batch.slot.index())
            .with_context(|| format!("No cache for {}", batch.slot))?;
        let Some((start_pos, tokens)) = self.prefill.stage(batch) else {
            return Ok(None);
        };
        let model = entry.get_or_insert_with(|| self.template.clone());
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let logits = model.forward(&input, start_pos).context("Forward pass failed")?;
        Ok(Some(last_position_logits(logits)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizer_beside_model() {
        let path = tokenizer_path(Path::new("models/bitnet/ggml-model.gguf"), None);
        assert_eq!(path, PathBuf::from("models/bitnet/tokenizer.json"));
        let path = tokenizer_path(Path::new("m.gguf"), Some(Path::new("/t/tok.json")));
        assert_eq!(path, PathBuf::from("/t/tok.json"));
    }

    #[test]
    fn test_missing_model_file_fails() {
        let config = BackendConfig {
            model_path: "/nonexistent/model.gguf".into(),
            ..BackendConfig::for_backend(crate::config::BackendKind::Quantized)
        };
        let err = QuantizedLlama::load(&config).err().unwrap();
        assert!(format!("{err:#}").contains("/nonexistent/model.gguf"));
    }

    #[test]
    fn test_garbage_gguf_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.gguf");
        std::fs::write(&path, b"not a gguf file at all").unwrap();
        let config = BackendConfig {
            model_path: path.to_string_lossy().into_owned(),
            ..BackendConfig::for_backend(crate::config::BackendKind::Quantized)
        };
        assert!(QuantizedLlama::load(&config).is_err());
    }
}
