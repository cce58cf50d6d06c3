// Provides:
// - `ModelRegistry` trait + `ModelBundle` (config, tokenizer, weights)
// - `HubRegistry`: HTTP download from a Hugging Face style hub with a verified local cache
// - `LocalRegistry`: the same files from a directory (offline runs, tests)

pub mod hub;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::config;

pub use hub::HubRegistry;

/// Encoder hyper-parameters read from the model's `config.json` (DistilBERT naming).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub hidden_dim: usize,
    #[serde(default = "default_activation")]
    pub activation: String,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default)]
    pub model_type: Option<String>,
}

fn default_activation() -> String {
    "gelu".to_string()
}

impl EncoderConfig {
    pub fn head_dim(&self) -> usize {
        self.dim / self.n_heads
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.dim == 0 || self.n_heads == 0 || self.n_layers == 0 || self.vocab_size == 0 {
            bail!("encoder config has zero-sized dimensions: {self:?}");
        }
        if self.dim % self.n_heads != 0 {
            bail!("dim {} is not divisible by n_heads {}", self.dim, self.n_heads);
        }
        Ok(())
    }
}

/// Everything the export step needs about one resolved model.
pub struct ModelBundle {
    pub model_id: String,
    pub dir: PathBuf,
    pub config: EncoderConfig,
    /// Raw `config.json`, handed to the reference implementation unchanged.
    pub config_json: String,
    pub tokenizer: Tokenizer,
    pub weights_path: PathBuf,
}

impl ModelBundle {
    /// Load config, tokenizer and weights header from a directory holding the three model files.
    pub fn load(model_id: &str, dir: &Path) -> anyhow::Result<Self> {
        let config_path = dir.join(config::hub::CONFIG_FILE);
        let config_json = std::fs::read_to_string(&config_path)
            .with_context(|| format!("read {}", config_path.display()))?;
        let encoder: EncoderConfig = serde_json::from_str(&config_json)
            .with_context(|| format!("parse {}", config_path.display()))?;
        encoder.validate().with_context(|| format!("invalid {}", config_path.display()))?;

        let tokenizer_path = dir.join(config::hub::TOKENIZER_FILE);
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", tokenizer_path.display()))?;

        let weights_path = dir.join(config::hub::WEIGHTS_FILE);
        let dtypes = weight_dtypes(&weights_path)?;

        log::info!(
            "Resolved model '{}': dim={}, layers={}, heads={}, vocab={}, weights={:?}",
            model_id,
            encoder.dim,
            encoder.n_layers,
            encoder.n_heads,
            tokenizer.get_vocab_size(true),
            dtypes
        );

        Ok(Self {
            model_id: model_id.to_string(),
            dir: dir.to_path_buf(),
            config: encoder,
            config_json,
            tokenizer,
            weights_path,
        })
    }
}

/// Count tensors per dtype from the safetensors header; only float weights can be quantized.
/// Reads the length prefix and the JSON header, never the tensor data.
fn weight_dtypes(path: &Path) -> anyhow::Result<BTreeMap<String, usize>> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let file_len = file.metadata().with_context(|| format!("stat {}", path.display()))?.len();

    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)
        .with_context(|| format!("{} is too short for a safetensors header", path.display()))?;
    let header_len = u64::from_le_bytes(prefix);
    if header_len > config::hub::MAX_SAFETENSORS_HEADER_BYTES || header_len > file_len - 8 {
        bail!("{} declares an invalid header length {header_len}", path.display());
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .with_context(|| format!("read safetensors header {}", path.display()))?;
    let metadata: safetensors::tensor::Metadata = serde_json::from_slice(&header)
        .with_context(|| format!("parse safetensors header {}", path.display()))?;
    let data_len = file_len - 8 - header_len;

    let mut counts = BTreeMap::new();
    for (name, info) in metadata.tensors() {
        let dtype = info.dtype;
        if !matches!(
            dtype,
            safetensors::Dtype::F32 | safetensors::Dtype::F16 | safetensors::Dtype::BF16 | safetensors::Dtype::F64
        ) {
            bail!("tensor '{name}' in {} has non-float dtype {dtype:?}", path.display());
        }
        if info.data_offsets.1 as u64 > data_len {
            bail!("tensor '{name}' extends past the end of {}", path.display());
        }
        *counts.entry(format!("{dtype:?}")).or_insert(0) += 1;
    }
    if counts.is_empty() {
        bail!("{} contains no tensors", path.display());
    }
    Ok(counts)
}

/// Resolves a model identifier to a loaded bundle.
pub trait ModelRegistry {
    fn load(&self, model_id: &str) -> anyhow::Result<ModelBundle>;
}

/// Reject identifiers that could escape the cache/registry root.
pub fn validate_model_id(model_id: &str) -> anyhow::Result<()> {
    let trimmed = model_id.trim();
    if trimmed.is_empty() {
        bail!("model identifier is empty");
    }
    if trimmed != model_id
        || model_id.starts_with('/')
        || model_id.contains('\\')
        || model_id.split('/').any(|p| p.is_empty() || p == "." || p == "..")
    {
        bail!("invalid model identifier '{model_id}'");
    }
    Ok(())
}

/// Model files already on disk: `<root>/<model_id>/`, or `<root>` itself when it is named after
/// the model (or the default model is requested) and holds no `<model_id>` subdirectory.
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Whether the flat layout may stand in for `model_id`.
    fn root_matches(&self, model_id: &str) -> bool {
        let last_segment = model_id.rsplit('/').next().unwrap_or(model_id);
        model_id == config::hub::DEFAULT_MODEL_ID
            || self.root.file_name().is_some_and(|name| name.to_string_lossy() == last_segment)
    }

    fn has_model_files(dir: &Path) -> bool {
        [config::hub::CONFIG_FILE, config::hub::TOKENIZER_FILE, config::hub::WEIGHTS_FILE]
            .iter()
            .all(|f| dir.join(f).is_file())
    }
}

impl ModelRegistry for LocalRegistry {
    fn load(&self, model_id: &str) -> anyhow::Result<ModelBundle> {
        validate_model_id(model_id)?;

        let nested = self.root.join(model_id);
        let dir = if Self::has_model_files(&nested) {
            nested
        } else if !nested.exists() && self.root_matches(model_id) && Self::has_model_files(&self.root) {
            self.root.clone()
        } else if !nested.exists() && Self::has_model_files(&self.root) {
            bail!(
                "model '{}' not found: {} holds a different model (name the directory after the model \
                 or pass --model {})",
                model_id,
                self.root.display(),
                self.root.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            );
        } else {
            bail!(
                "model '{}' not found under {} (need {}, {}, {})",
                model_id,
                self.root.display(),
                config::hub::CONFIG_FILE,
                config::hub::TOKENIZER_FILE,
                config::hub::WEIGHTS_FILE
            );
        };

        log::info!("Loading model '{}' from local directory {}", model_id, dir.display());
        ModelBundle::load(model_id, &dir)
    }
}
