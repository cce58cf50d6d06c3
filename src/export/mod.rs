// Provides:
// - Sample input encoding with explicit padding/truncation
// - Reference forward pass (candle) that pins the expected output shape
// - DistilBERT graph emitter (opset 11 primitives, weights as initializers)

pub mod distilbert;
pub mod reference;

use anyhow::{bail, Context};
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams};

use crate::onnx::proto::ModelProto;
use crate::registry::ModelBundle;

pub use distilbert::DistilBertExporter;

/// The encoded sample that drives the export.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleInput {
    pub text: String,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Tokens before padding (including [CLS]/[SEP]).
    pub token_count: usize,
}

impl SampleInput {
    pub fn seq_len(&self) -> usize {
        self.input_ids.len()
    }
}

/// Turns a resolved model into an ONNX graph, driven by a sample input.
pub trait GraphExporter {
    fn export(&self, model: &ModelBundle, sample: &SampleInput) -> anyhow::Result<ModelProto>;
}

/// Encode `text` padded and truncated to exactly `max_len` tokens.
///
/// Padding/truncation is applied because the caller asked for it, never inferred: the result is
/// checked against `max_len` and against the model's vocabulary and position table, and any
/// mismatch is an error.
pub fn encode_sample(model: &ModelBundle, text: &str, max_len: usize) -> anyhow::Result<SampleInput> {
    if max_len == 0 {
        bail!("max sequence length must be positive");
    }
    if max_len > model.config.max_position_embeddings {
        bail!(
            "max sequence length {} exceeds the model's {} position embeddings",
            max_len,
            model.config.max_position_embeddings
        );
    }

    let (pad_id, pad_token) = match model.tokenizer.get_padding() {
        Some(p) => (p.pad_id, p.pad_token.clone()),
        None => {
            let id = model.config.pad_token_id;
            let token = model
                .tokenizer
                .id_to_token(id)
                .with_context(|| format!("pad_token_id {id} is not in the tokenizer vocabulary"))?;
            (id, token)
        }
    };

    let mut tokenizer = model.tokenizer.clone();
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_len,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("configure truncation: {e}"))?;
    tokenizer.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(max_len),
        pad_id,
        pad_token,
        ..Default::default()
    }));

    let encoding = tokenizer
        .encode(text, true)
        .map_err(|e| anyhow::anyhow!("tokenize sample input: {e}"))?;

    let input_ids = encoding.get_ids().to_vec();
    let attention_mask = encoding.get_attention_mask().to_vec();
    if input_ids.len() != max_len || attention_mask.len() != max_len {
        bail!(
            "sample encoded to {} tokens, expected exactly {}",
            input_ids.len(),
            max_len
        );
    }
    if let Some(bad) = input_ids.iter().find(|&&id| id as usize >= model.config.vocab_size) {
        bail!("token id {} is outside the model vocabulary ({})", bad, model.config.vocab_size);
    }
    if !encoding.get_overflowing().is_empty() {
        log::warn!("Sample input truncated to {} tokens", max_len);
    }

    let token_count = attention_mask.iter().filter(|&&m| m == 1).count();
    log::info!("Sample input '{}' → {} tokens, padded to {}", text, token_count, max_len);

    Ok(SampleInput {
        text: text.to_string(),
        input_ids,
        attention_mask,
        token_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LocalRegistry, ModelRegistry};
    use crate::test_support::{write_tiny_model, TINY_MAX_POSITIONS};

    fn tiny_bundle() -> (tempfile::TempDir, ModelBundle) {
        let tmp = tempfile::tempdir().unwrap();
        write_tiny_model(&tmp.path().join("tiny"));
        let bundle = LocalRegistry::new(tmp.path()).load("tiny").unwrap();
        (tmp, bundle)
    }

    #[test]
    fn test_sample_padded_to_max_len() {
        let (_tmp, bundle) = tiny_bundle();
        let sample = encode_sample(&bundle, "find a book club event near me", 128).unwrap();
        assert_eq!(sample.seq_len(), 128);
        // [CLS] + 7 words + [SEP]
        assert_eq!(sample.token_count, 9);
        assert_eq!(sample.input_ids[0], 2);
        assert_eq!(sample.input_ids[8], 3);
        assert!(sample.input_ids[9..].iter().all(|&id| id == 0));
        assert!(sample.attention_mask[9..].iter().all(|&m| m == 0));
    }

    #[test]
    fn test_sample_truncated_when_configured_shorter() {
        let (_tmp, bundle) = tiny_bundle();
        let sample = encode_sample(&bundle, "find a book club event near me", 4).unwrap();
        assert_eq!(sample.seq_len(), 4);
        assert_eq!(sample.token_count, 4);
    }

    #[test]
    fn test_rejects_length_beyond_position_table() {
        let (_tmp, bundle) = tiny_bundle();
        let err = encode_sample(&bundle, "find", TINY_MAX_POSITIONS + 1).unwrap_err();
        assert!(err.to_string().contains("position embeddings"));
    }
}
