//! Full-precision Llama-family engine for the local backend.
//!
//! Loads `config.json`, `tokenizer.json` and safetensors weights from a local
//! directory or the Hugging Face Hub, optionally merges a LoRA adapter, and
//! keeps one KV cache per sequence slot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use hf_hub::{Repo, RepoType, api::sync::Api};
use tokenizers::Tokenizer;

use crate::config::BackendConfig;
use crate::device::{DevicePreference, device_info, select_device, weight_dtype};
use crate::engine::{Batch, LanguageModel, PrefillBuffer, SequenceSlot};
use crate::lora::{LoraAdapter, load_weights};

/// End-of-turn markers treated as end-of-generation when the tokenizer has them.
const END_MARKERS: [&str; 6] = [
    "</s>",
    "<|end|>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|eot_id|>",
    "<end_of_assistant>",
];

/// Resolved model files.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// Locate files for `model`: a local directory if it exists, otherwise a
    /// Hugging Face Hub repo id.
    pub fn resolve(model: &str, tokenizer_override: Option<&Path>) -> Result<Self> {
        let dir = Path::new(model);
        let mut files = if dir.is_dir() {
            Self::from_dir(dir)?
        } else {
            Self::from_hub(model)?
        };
        if let Some(tokenizer) = tokenizer_override {
            files.tokenizer = tokenizer.to_path_buf();
        }
        Ok(files)
    }

    fn from_dir(dir: &Path) -> Result<Self> {
        let mut weights: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
            .collect();
        weights.sort();
        if weights.is_empty() {
            anyhow::bail!("No .safetensors weights in {}", dir.display());
        }
        Ok(Self {
            config: dir.join("config.json"),
            tokenizer: dir.join("tokenizer.json"),
            weights,
        })
    }

    fn from_hub(repo_id: &str) -> Result<Self> {
        log::info!("Fetching model from Hugging Face Hub: {}", repo_id);
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.to_string(), RepoType::Model));

        let config = repo.get("config.json").context("Failed to download config.json")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let weights = match repo.get("model.safetensors") {
            Ok(path) => vec![path],
            Err(_) => {
                // Sharded checkpoints list their shards in an index file.
                let index_path = repo
                    .get("model.safetensors.index.json")
                    .context("Failed to download model.safetensors or its index")?;
                shard_names(&index_path)?
                    .iter()
                    .map(|shard| repo.get(shard).with_context(|| format!("Failed to download {shard}")))
                    .collect::<Result<Vec<_>>>()?
            }
        };
        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

/// Distinct shard file names from a `model.safetensors.index.json`.
fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(index_path).context("Failed to read safetensors index")?,
    )
    .context("Failed to parse safetensors index")?;
    let Some(map) = index.get("weight_map").and_then(|m| m.as_object()) else {
        anyhow::bail!("Safetensors index has no weight_map");
    };
    let mut shards: Vec<String> = map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}

/// Llama-family model with a KV cache per slot.
pub struct CandleLlama {
    model: Llama,
    caches: Vec<Cache>,
    /// Empty cache cloned into a slot when it is cleared.
    blank: Cache,
    prefill: PrefillBuffer,
    tokenizer: Tokenizer,
    device: Device,
    eos_tokens: Vec<u32>,
    context_size: usize,
    name: String,
}

impl CandleLlama {
    /// Load the model described by `config`.
    pub fn load(config: &BackendConfig) -> Result<Self> {
        let load_start = std::time::Instant::now();
        let device = select_device(DevicePreference::from_use_gpu(config.use_gpu));
        let dtype = weight_dtype(&device);

        let files = ModelFiles::resolve(&config.model_path, config.tokenizer_path.as_deref())?;
        let llama_config: LlamaConfig = serde_json::from_str(
            &std::fs::read_to_string(&files.config).context("Failed to read config.json")?,
        )
        .context("Failed to parse LlamaConfig")?;
        let model_config = llama_config.into_config(config.flash_attention);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))?;

        let vb = match &config.adapter_path {
            Some(adapter_dir) => {
                let adapter = LoraAdapter::open(adapter_dir)?;
                let mut weights = load_weights(&files.weights, &device, dtype)?;
                adapter.merge_into(&mut weights, &device, dtype)?;
                VarBuilder::from_tensors(weights, dtype, &device)
            }
            None => unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? },
        };
        let model = Llama::load(vb, &model_config).context("Failed to load Llama model")?;

        let blank = Cache::new(true, dtype, &model_config, &device).context("Failed to create KV cache")?;
        let slots = config.max_concurrent_sequences.max(1);
        let caches = vec![blank.clone(); slots];

        let eos_tokens = eos_tokens(&model_config, &tokenizer);
        let context_size = config.context_size.min(model_config.max_position_embeddings);

        log::info!(
            "Model {} loaded in {:.2}s (device: {}, dtype: {:?}, context {}, {} slots, eos {:?})",
            config.model_path,
            load_start.elapsed().as_secs_f64(),
            device_info(&device),
            dtype,
            context_size,
            slots,
            eos_tokens
        );

        Ok(Self {
            model,
            caches,
            blank,
            prefill: PrefillBuffer::default(),
            tokenizer,
            device,
            eos_tokens,
            context_size,
            name: config.model_path.clone(),
        })
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }
}

fn eos_tokens(config: &Config, tokenizer: &Tokenizer) -> Vec<u32> {
    let mut ids = match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    };
    ids.extend(END_MARKERS.iter().filter_map(|m| tokenizer.token_to_id(m)));
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Reduce `[batch, seq, vocab]` or `[batch, vocab]` logits to `[vocab]`.
pub(crate) fn last_position_logits(logits: Tensor) -> Result<Tensor> {
    let logits = if logits.dims().len() == 3 {
        let seq_len = logits.dim(1)?;
        logits.i((.., seq_len - 1, ..))?
    } else {
        logits
    };
    Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
}

impl LanguageModel for CandleLlama {
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
        let cache = self
            .caches
            .get_mut(slot.index())
            .with_context(|| format!("No cache for {slot}"))?;
        *cache = self.blank.clone();
        self.prefill.discard(slot);
        Ok(())
    }

    fn decode(&mut self, batch: &Batch<'_>) -> Result<Option<Tensor>> {
        let cache = self
            .caches
            .get_mut(batch.slot.index())
            .with_context(|| format!("No cache for {}", batch.slot))?;
        let Some((start_pos, tokens)) = self.prefill.stage(batch) else {
            return Ok(None);
        };
        let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let logits = self
            .model
            .forward(&input, start_pos, cache)
            .context("Forward pass failed")?;
        Ok(Some(last_position_logits(logits)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_dir_requires_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let err = ModelFiles::resolve(dir.path().to_str().unwrap(), None).unwrap_err();
        assert!(err.to_string().contains("No .safetensors"));
    }

    #[test]
    fn test_local_dir_lists_shards_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["model-00002-of-00002.safetensors", "model-00001-of-00002.safetensors", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let override_path = dir.path().join("custom-tokenizer.json");
        let files = ModelFiles::resolve(dir.path().to_str().unwrap(), Some(&override_path)).unwrap();
        assert_eq!(files.weights.len(), 2);
        assert!(files.weights[0].ends_with("model-00001-of-00002.safetensors"));
        assert_eq!(files.tokenizer, override_path);
        assert!(files.config.ends_with("config.json"));
    }

    #[test]
    fn test_shard_names_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("model.safetensors.index.json");
        std::fs::write(
            &index,
            r#"{"weight_map": {"a": "model-2.safetensors", "b": "model-1.safetensors", "c": "model-2.safetensors"}}"#,
        )
        .unwrap();
        assert_eq!(
            shard_names(&index).unwrap(),
            vec!["model-1.safetensors", "model-2.safetensors"]
        );
    }

    #[test]
    fn test_last_position_logits_shapes() {
        let device = Device::Cpu;
        let flat = Tensor::zeros((1, 5), DType::F32, &device).unwrap();
        assert_eq!(last_position_logits(flat).unwrap().dims(), &[5]);
        let full = Tensor::zeros((1, 3, 5), DType::F32, &device).unwrap();
        assert_eq!(last_position_logits(full).unwrap().dims(), &[5]);
    }
}
