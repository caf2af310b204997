//! Token samplers.
//!
//! A session owns two: a deterministic one for extraction, matching and
//! language detection, and a creative one for narration whose temperature is
//! randomized once per session.

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use rand::Rng;

use crate::config::BackendConfig;

/// Which of the session's samplers a request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Deterministic,
    Creative,
}

/// A configured logits processor.
pub struct Sampler {
    processor: LogitsProcessor,
    temperature: f64,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    /// Build a sampler. A non-positive temperature is greedy argmax.
    pub fn new(seed: u64, temperature: f64, top_k: usize, top_p: f64) -> Self {
        let sampling = if temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            match (top_k, top_p < 1.0) {
                (0, false) => Sampling::All { temperature },
                (0, true) => Sampling::TopP { p: top_p, temperature },
                (k, false) => Sampling::TopK { k, temperature },
                (k, true) => Sampling::TopKThenTopP { k, p: top_p, temperature },
            }
        };
        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
            temperature,
        }
    }

    /// Greedy sampler.
    pub fn greedy() -> Self {
        Self::new(0, 0.0, 0, 1.0)
    }

    /// The deterministic sampler described by `config`.
    pub fn deterministic(config: &BackendConfig, seed: u64) -> Self {
        Self::new(seed, config.temperature, config.top_k, config.top_p)
    }

    /// The creative sampler, with `base + U[0, offset)` temperature.
    pub fn creative(config: &BackendConfig, seed: u64) -> Self {
        let temperature = creative_temperature(
            config.temperature_creative_base,
            config.temperature_creative_offset,
            &mut rand::thread_rng(),
        );
        log::debug!("Creative sampler temperature: {:.3}", temperature);
        Self::new(seed, temperature, config.top_k, config.top_p)
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Pick the next token from last-position logits (`[vocab]` or `[1, vocab]`).
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits = if logits.rank() > 1 {
            logits.flatten_all()?
        } else {
            logits.clone()
        };
        Ok(self.processor.sample(&logits)?)
    }
}

/// Draw the per-session creative temperature.
pub fn creative_temperature(base: f64, offset: f64, rng: &mut impl Rng) -> f64 {
    if offset > 0.0 {
        base + rng.gen_range(0.0..offset)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_greedy_picks_max() {
        let logits = Tensor::new(&[0.1f32, 3.0, -1.0, 2.9], &Device::Cpu).unwrap();
        let mut sampler = Sampler::greedy();
        assert_eq!(sampler.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn test_batched_logits_are_flattened() {
        let logits = Tensor::new(&[[0.0f32, 0.0, 5.0]], &Device::Cpu).unwrap();
        let mut sampler = Sampler::greedy();
        assert_eq!(sampler.sample(&logits).unwrap(), 2);
    }

    #[test]
    fn test_creative_temperature_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let t = creative_temperature(0.3, 0.2, &mut rng);
            assert!((0.3..0.5).contains(&t), "temperature {t} out of range");
        }
        assert_eq!(creative_temperature(0.7, 0.0, &mut rng), 0.7);
    }

    #[test]
    fn test_dominant_logit_wins_at_creative_temperature() {
        let config = BackendConfig::default();
        let mut sampler = Sampler::creative(&config, 42);
        assert!(sampler.temperature() >= 0.3);
        let mut values = vec![0.0f32; 32];
        values[7] = 100.0;
        let logits = Tensor::new(values.as_slice(), &Device::Cpu).unwrap();
        assert_eq!(sampler.sample(&logits).unwrap(), 7);
    }
}
