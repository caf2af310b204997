//! Backend configuration.
//!
//! A flat, serde-friendly record. Defaults depend on the backend variant, so
//! JSON files are overlaid on [`BackendConfig::for_backend`] rather than on a
//! single global default.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Environment variable consulted when no credential is configured.
pub const CREDENTIAL_ENV_VAR: &str = "ADVLM_API_KEY";

/// Which inference provider backs the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Full-precision on-device model (safetensors).
    #[default]
    Local,
    /// Low-bit GGUF model, CPU only.
    Quantized,
    /// Stateless HTTP chat-completion API.
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Quantized => "quantized",
            Self::Remote => "remote",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "quantized" | "bitnet" | "gguf" => Ok(Self::Quantized),
            "remote" | "cloud" => Ok(Self::Remote),
            other => Err(format!("unknown backend '{other}' (expected local, quantized or remote)")),
        }
    }
}

/// How the resolver participates in parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// Every call returns its fallback; the host parses on its own.
    Disabled,
    /// Rewrite input into canonical English before exact matching.
    #[default]
    Extraction,
    /// Extraction, plus yes/no matching against expected commands.
    Semantic,
}

impl fmt::Display for ResolverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "disabled",
            Self::Extraction => "extraction",
            Self::Semantic => "semantic",
        })
    }
}

impl FromStr for ResolverMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "extraction" => Ok(Self::Extraction),
            "semantic" => Ok(Self::Semantic),
            other => Err(format!(
                "unknown mode '{other}' (expected disabled, extraction or semantic)"
            )),
        }
    }
}

/// Role markers wrapped around prompt turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatFormat {
    /// `<|system|>`, `<|user|>`, `<|assistant|>` terminated by `<|end|>`.
    Phi,
    /// `<start_of_user>` style markers.
    BitNet,
    /// `User:` / `Assistant:` lines, for chat APIs that add their own markers.
    Plain,
}

/// One few-shot translation example for the extraction prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShot {
    pub input: String,
    pub output: String,
}

impl FewShot {
    pub fn new(input: &str, output: &str) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
        }
    }
}

/// One labelled example for the semantic matching prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExample {
    pub expected: String,
    pub input: String,
    pub matches: bool,
}

impl MatchExample {
    pub fn new(expected: &str, input: &str, matches: bool) -> Self {
        Self {
            expected: expected.to_string(),
            input: input.to_string(),
            matches,
        }
    }
}

/// Built-in extraction examples.
pub fn default_extraction_examples() -> Vec<FewShot> {
    vec![
        FewShot::new("mira el castillo", "look castle"),
        FewShot::new("coge la llave", "get key"),
    ]
}

/// Built-in semantic matching examples, positive and negative.
pub fn default_match_examples() -> Vec<MatchExample> {
    vec![
        MatchExample::new("look castle", "mira el castillo", true),
        MatchExample::new("get key", "coge la llave", true),
        MatchExample::new("open door", "abrir puerta", true),
        MatchExample::new("quit", "mira el castillo", false),
        MatchExample::new("fast", "mira el castillo", false),
        MatchExample::new("restore game", "mirar castillo", false),
    ]
}

/// Configuration for one backend instance. Immutable once the backend is
/// initialized; changing it means initializing a new backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub backend: BackendKind,
    pub mode: ResolverMode,

    /// Local: model directory or Hugging Face repo id. Quantized: GGUF file.
    pub model_path: String,
    /// Overrides the `tokenizer.json` found next to the model.
    pub tokenizer_path: Option<PathBuf>,
    /// LoRA adapter directory merged into local full-precision weights.
    pub adapter_path: Option<PathBuf>,

    pub endpoint_url: String,
    /// Falls back to [`CREDENTIAL_ENV_VAR`].
    pub credential: Option<String>,
    pub model_identifier: String,
    /// Remote request timeout. `None` blocks until the server answers.
    pub request_timeout_secs: Option<u64>,

    pub context_size: usize,
    pub batch_size: usize,
    pub micro_batch_size: usize,
    pub thread_count: usize,
    pub max_concurrent_sequences: usize,
    pub use_gpu: bool,
    pub flash_attention: bool,

    /// Deterministic sampler temperature; `0.0` means greedy.
    pub temperature: f64,
    pub temperature_creative_base: f64,
    /// Upper bound of the random offset added to the creative base, drawn
    /// once per session.
    pub temperature_creative_offset: f64,
    /// When false, narrative generation uses the deterministic sampler.
    pub creative_sampling: bool,
    pub top_p: f64,
    pub top_k: usize,
    /// Token budget for semantic match answers.
    pub max_tokens: usize,
    pub response_max_tokens: usize,
    pub seed: Option<u64>,

    pub chat_format: ChatFormat,
    pub default_language: String,
    pub vocabulary_hint_words: usize,
    pub extraction_examples: Vec<FewShot>,
    pub match_examples: Vec<MatchExample>,

    /// Log prompts and raw output at debug instead of trace.
    pub verbose: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            mode: ResolverMode::Extraction,
            model_path: "HuggingFaceTB/SmolLM2-360M-Instruct".to_string(),
            tokenizer_path: None,
            adapter_path: None,
            endpoint_url: "https://api.openai.com/v1/chat/completions".to_string(),
            credential: None,
            model_identifier: "gpt-4o-mini".to_string(),
            request_timeout_secs: None,
            context_size: 4096,
            batch_size: 1024,
            micro_batch_size: 512,
            thread_count: 4,
            max_concurrent_sequences: 8,
            use_gpu: true,
            flash_attention: false,
            temperature: 0.0,
            temperature_creative_base: 0.3,
            temperature_creative_offset: 0.2,
            creative_sampling: true,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 5,
            response_max_tokens: 150,
            seed: None,
            chat_format: ChatFormat::Phi,
            default_language: "English".to_string(),
            vocabulary_hint_words: 50,
            extraction_examples: default_extraction_examples(),
            match_examples: default_match_examples(),
            verbose: false,
        }
    }
}

impl BackendConfig {
    /// Defaults tuned for one backend variant.
    pub fn for_backend(kind: BackendKind) -> Self {
        let base = Self::default();
        match kind {
            BackendKind::Local => base,
            BackendKind::Quantized => Self {
                backend: kind,
                model_path: "models/bitnet-b1.58-2B-4T.gguf".to_string(),
                context_size: 2048,
                batch_size: 512,
                micro_batch_size: 256,
                thread_count: 2,
                max_concurrent_sequences: 4,
                use_gpu: false,
                creative_sampling: false,
                chat_format: ChatFormat::BitNet,
                // One shot keeps the prompt inside the smaller window.
                extraction_examples: base.extraction_examples[..1].to_vec(),
                ..base
            },
            BackendKind::Remote => Self {
                backend: kind,
                max_concurrent_sequences: 1,
                use_gpu: false,
                chat_format: ChatFormat::Plain,
                ..base
            },
        }
    }

    /// Parse a JSON document, filling unset fields from the defaults of the
    /// backend it names.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let overrides: serde_json::Value =
            serde_json::from_str(json).context("Failed to parse backend config JSON")?;
        let Some(fields) = overrides.as_object() else {
            anyhow::bail!("Backend config must be a JSON object");
        };

        let kind = match fields.get("backend") {
            Some(value) => serde_json::from_value(value.clone()).context("Invalid 'backend'")?,
            None => BackendKind::default(),
        };

        let mut merged = serde_json::to_value(Self::for_backend(kind))?;
        if let Some(target) = merged.as_object_mut() {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(merged).context("Invalid backend config")
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_json_str(&text)
            .with_context(|| format!("Failed to load config {}", path.display()))?;
        log::info!("Loaded {} backend config from {}", config.backend, path.display());
        Ok(config)
    }

    /// Reject values no backend can work with.
    pub fn validate(&self) -> Result<(), BackendError> {
        let invalid = |msg: String| Err(BackendError::InvalidConfig(msg));

        if self.backend != BackendKind::Remote {
            if self.context_size == 0 || self.batch_size == 0 || self.micro_batch_size == 0 {
                return invalid("context, batch and micro-batch sizes must be non-zero".into());
            }
            if self.micro_batch_size > self.batch_size {
                return invalid(format!(
                    "micro_batch_size {} exceeds batch_size {}",
                    self.micro_batch_size, self.batch_size
                ));
            }
            if self.max_concurrent_sequences == 0 {
                return invalid("max_concurrent_sequences must be at least 1".into());
            }
            if self.model_path.trim().is_empty() {
                return invalid("model_path is empty".into());
            }
        } else if self.endpoint_url.trim().is_empty() {
            return invalid("endpoint_url is empty".into());
        }

        if self.temperature < 0.0
            || self.temperature_creative_base < 0.0
            || self.temperature_creative_offset < 0.0
        {
            return invalid("temperatures must not be negative".into());
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return invalid(format!("top_p {} is outside (0, 1]", self.top_p));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be at least 1".into());
        }
        Ok(())
    }

    /// The configured credential, else the environment one.
    pub fn resolve_credential(&self) -> Result<String, BackendError> {
        self.credential
            .clone()
            .filter(|c| !c.trim().is_empty())
            .or_else(|| std::env::var(CREDENTIAL_ENV_VAR).ok().filter(|c| !c.trim().is_empty()))
            .ok_or(BackendError::MissingCredential {
                env_var: CREDENTIAL_ENV_VAR,
            })
    }

    /// Level used for prompt and raw-output logging.
    pub fn prompt_log_level(&self) -> log::Level {
        if self.verbose {
            log::Level::Debug
        } else {
            log::Level::Trace
        }
    }

    /// Size the global CPU thread pool. Only the first call in a process wins.
    pub fn apply_thread_count(&self) {
        if self.thread_count == 0 {
            return;
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.thread_count)
            .build_global()
        {
            Ok(()) => log::info!("CPU thread pool: {} threads", self.thread_count),
            Err(e) => log::debug!("CPU thread pool already configured: {}", e),
        }
    }
}
