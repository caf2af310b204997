//! LoRA adapter merging for full-precision local models.
//!
//! A game-specific adapter (PEFT layout: `adapter_config.json` and
//! `adapter_model.safetensors`) is folded into the base weights before the
//! model is built: `W' = W + (B @ A) * (alpha / r)`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;

/// Adapter hyper-parameters from `adapter_config.json`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LoraConfig {
    pub r: usize,
    pub lora_alpha: usize,
    #[serde(default)]
    pub target_modules: Vec<String>,
}

impl LoraConfig {
    pub fn scale(&self) -> f64 {
        self.lora_alpha as f64 / self.r.max(1) as f64
    }
}

/// A loaded adapter directory.
#[derive(Debug)]
pub struct LoraAdapter {
    dir: PathBuf,
    config: LoraConfig,
}

impl LoraAdapter {
    pub fn open(dir: &Path) -> Result<Self> {
        let config_path = dir.join("adapter_config.json");
        let config: LoraConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?,
        )
        .context("Failed to parse adapter_config.json")?;
        log::info!(
            "LoRA adapter {}: r={}, alpha={}, targets={:?}",
            dir.display(),
            config.r,
            config.lora_alpha,
            config.target_modules
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
        })
    }

    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Fold the adapter into `weights`, returning how many matrices changed.
    pub fn merge_into(
        &self,
        weights: &mut HashMap<String, Tensor>,
        device: &Device,
        dtype: DType,
    ) -> Result<usize> {
        let path = self.dir.join("adapter_model.safetensors");
        let data = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&data).context("Failed to parse adapter safetensors")?;
        let scale = self.config.scale();

        let mut merged = 0;
        for name in tensors.names() {
            let Some(prefix) = name.strip_suffix(".lora_A.weight") else {
                continue;
            };
            let b_name = format!("{prefix}.lora_B.weight");
            let Ok(b_view) = tensors.tensor(&b_name) else {
                log::warn!("LoRA pair incomplete, no {}", b_name);
                continue;
            };
            let target = base_weight_name(prefix);
            let Some(base) = weights.get(&target) else {
                log::debug!("No base weight {} for adapter entry {}", target, name);
                continue;
            };

            let a = view_to_tensor(&tensors.tensor(name)?, device, dtype)?;
            let b = view_to_tensor(&b_view, device, dtype)?;
            // A: [r, in], B: [out, r]
            let delta = (b.matmul(&a)? * scale)?;
            let updated = (base + &delta).with_context(|| format!("Shape mismatch merging {target}"))?;
            weights.insert(target, updated);
            merged += 1;
        }

        if merged == 0 {
            log::warn!("No LoRA weights merged from {}; check key names", self.dir.display());
        } else {
            log::info!("Merged {} LoRA weight pairs (scale {:.2})", merged, scale);
        }
        Ok(merged)
    }
}

/// Map a PEFT entry prefix to the base model's weight name.
///
/// `base_model.model.model.layers.0.self_attn.q_proj` becomes
/// `model.layers.0.self_attn.q_proj.weight`.
pub fn base_weight_name(prefix: &str) -> String {
    let key = prefix.strip_prefix("base_model.").unwrap_or(prefix);
    let key = key.strip_prefix("model.").unwrap_or(key);
    format!("{key}.weight")
}

/// Read every tensor of a safetensors file into memory.
pub fn load_weights(paths: &[PathBuf], device: &Device, dtype: DType) -> Result<HashMap<String, Tensor>> {
    let mut weights = HashMap::new();
    for path in paths {
        let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&data)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        for name in tensors.names() {
            let tensor = view_to_tensor(&tensors.tensor(name)?, device, dtype)?;
            weights.insert(name.to_string(), tensor);
        }
    }
    log::info!("Loaded {} base tensors for adapter merge", weights.len());
    Ok(weights)
}

/// Convert a safetensors view (F32, F16 or BF16) to a candle tensor.
fn view_to_tensor(view: &safetensors::tensor::TensorView<'_>, device: &Device, dtype: DType) -> Result<Tensor> {
    let shape = view.shape().to_vec();
    let data = view.data();
    let floats: Vec<f32> = match view.dtype() {
        safetensors::Dtype::F32 => bytemuck::pod_collect_to_vec::<u8, f32>(data),
        safetensors::Dtype::F16 => bytemuck::pod_collect_to_vec::<u8, u16>(data)
            .into_iter()
            .map(|bits| half::f16::from_bits(bits).to_f32())
            .collect(),
        safetensors::Dtype::BF16 => bytemuck::pod_collect_to_vec::<u8, u16>(data)
            .into_iter()
            .map(|bits| half::bf16::from_bits(bits).to_f32())
            .collect(),
        other => anyhow::bail!("Unsupported tensor dtype {:?}", other),
    };
    let tensor = Tensor::from_vec(floats, shape.as_slice(), device)?;
    if dtype == DType::F32 {
        Ok(tensor)
    } else {
        tensor.to_dtype(dtype).context("Failed to convert dtype")
    }
}
