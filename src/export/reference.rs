// Plays the role of tracing: it proves the checkpoint loads under the reference implementation and
// fixes the output shape the exported graph must declare.

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::distilbert::{Config as DistilBertConfig, DistilBertModel};

use super::SampleInput;
use crate::registry::ModelBundle;

/// The reference hidden states, row-major `[1, sequence, dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceOutput {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
    pub mean_abs: f32,
}

pub fn reference_forward(model: &ModelBundle, sample: &SampleInput) -> anyhow::Result<ReferenceOutput> {
    let device = Device::Cpu;

    let config: DistilBertConfig = serde_json::from_str(&model.config_json)
        .with_context(|| format!("parse config for reference model '{}'", model.model_id))?;

    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[model.weights_path.clone()], DType::F32, &device)
            .with_context(|| format!("load weights from {}", model.weights_path.display()))?
    };
    let encoder = DistilBertModel::load(vb, &config).context("load DistilBERT reference model")?;

    let seq_len = sample.seq_len();
    let input_ids = Tensor::new(sample.input_ids.as_slice(), &device)?.unsqueeze(0)?;

    // The reference attention fills positions where the mask is 1; padding is what gets masked.
    let pad_mask: Vec<u8> = sample.attention_mask.iter().map(|&m| u8::from(m == 0)).collect();
    let pad_mask = Tensor::new(pad_mask.as_slice(), &device)?.reshape((1, 1, 1, seq_len))?;

    let output = encoder
        .forward(&input_ids, &pad_mask)
        .context("reference forward pass on sample input")?;

    let (batch, seq, hidden) = output.dims3().context("reference output is not rank 3")?;
    if batch != 1 || seq != seq_len || hidden != model.config.dim {
        bail!(
            "reference output shape [{batch}, {seq}, {hidden}] does not match expected [1, {seq_len}, {}]",
            model.config.dim
        );
    }

    let mean_abs = output.abs()?.mean_all()?.to_scalar::<f32>()?;
    if !mean_abs.is_finite() {
        bail!("reference output contains non-finite values");
    }

    log::info!(
        "Reference forward pass: output [{}, {}, {}], mean |x| = {:.4}",
        batch,
        seq,
        hidden,
        mean_abs
    );

    Ok(ReferenceOutput {
        dims: vec![batch, seq, hidden],
        values: output.flatten_all()?.to_vec1::<f32>()?,
        mean_abs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::encode_sample;
    use crate::registry::{LocalRegistry, ModelRegistry};
    use crate::test_support::{write_tiny_model, TINY_DIM};

    #[test]
    fn test_reference_output_shape() {
        let tmp = tempfile::tempdir().unwrap();
        write_tiny_model(&tmp.path().join("tiny"));
        let bundle = LocalRegistry::new(tmp.path()).load("tiny").unwrap();
        let sample = encode_sample(&bundle, "find a book club event near me", 16).unwrap();

        let out = reference_forward(&bundle, &sample).unwrap();
        assert_eq!(out.dims, vec![1, 16, TINY_DIM]);
        assert_eq!(out.values.len(), 16 * TINY_DIM);
        assert!(out.mean_abs > 0.0);
    }
}
