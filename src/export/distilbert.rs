// Inputs `input_ids` / `attention_mask` (int64, [batch_size, sequence]), output `output`
// (float, [batch_size, sequence, dim]). Layer norm and GELU are decomposed into primitives since
// opset 11 has neither. Linear weights are stored pre-transposed ([in, out]) so MatMul reads them
// directly, which is also the form the quantizer recognizes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};

use super::reference::reference_forward;
use super::{GraphExporter, SampleInput};
use crate::config;
use crate::onnx::builder::{attr_int, attr_ints, tensor_f32, tensor_i64, value_info, Dim, GraphBuilder};
use crate::onnx::proto::{DataType, GraphProto, ModelProto, OperatorSetIdProto, StringStringEntryProto};
use crate::registry::{EncoderConfig, ModelBundle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Gelu,
    Relu,
}

impl Activation {
    fn parse(name: &str) -> anyhow::Result<Self> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "relu" => Ok(Activation::Relu),
            other => bail!("unsupported activation '{other}' (expected gelu or relu)"),
        }
    }
}

pub struct DistilBertExporter {
    pub opset: i64,
}

impl Default for DistilBertExporter {
    fn default() -> Self {
        Self {
            opset: config::export::OPSET_VERSION,
        }
    }
}

impl GraphExporter for DistilBertExporter {
    fn export(&self, model: &ModelBundle, sample: &SampleInput) -> anyhow::Result<ModelProto> {
        // Range needs opset 11.
        if self.opset < 11 {
            bail!("opset {} is too old for the encoder graph (need >= 11)", self.opset);
        }
        let cfg = &model.config;
        if sample.seq_len() > cfg.max_position_embeddings {
            bail!(
                "sample length {} exceeds the model's {} position embeddings",
                sample.seq_len(),
                cfg.max_position_embeddings
            );
        }
        let activation = Activation::parse(&cfg.activation)?;

        let reference = reference_forward(model, sample)?;

        let weights = Weights::load(&model.weights_path, cfg.model_type.as_deref())?;
        let graph = build_graph(cfg, activation, &weights)?;

        let output_dim = reference.dims.last().copied().unwrap_or_default();
        if output_dim != cfg.dim {
            bail!("reference output width {} differs from config dim {}", output_dim, cfg.dim);
        }

        log::info!(
            "Exported graph: {} nodes, {} initializers, opset {} (reference mean |x| {:.4})",
            graph.node.len(),
            graph.initializer.len(),
            self.opset,
            reference.mean_abs
        );

        Ok(ModelProto {
            ir_version: config::export::IR_VERSION,
            producer_name: config::TOOL_NAME.to_string(),
            producer_version: config::TOOL_VERSION.to_string(),
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: self.opset,
            }],
            metadata_props: vec![
                StringStringEntryProto {
                    key: "source_model".into(),
                    value: model.model_id.clone(),
                },
                StringStringEntryProto {
                    key: "sample_input".into(),
                    value: sample.text.clone(),
                },
                StringStringEntryProto {
                    key: "sample_sequence_length".into(),
                    value: sample.seq_len().to_string(),
                },
                StringStringEntryProto {
                    key: "sample_token_count".into(),
                    value: sample.token_count.to_string(),
                },
            ],
            ..Default::default()
        })
    }
}

/// Checkpoint tensors, addressed with or without the `distilbert.` prefix.
struct Weights {
    tensors: HashMap<String, Tensor>,
    prefix: Option<String>,
}

impl Weights {
    fn load(path: &Path, model_type: Option<&str>) -> anyhow::Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("read weights {}", path.display()))?;
        let prefix = if tensors.contains_key("embeddings.word_embeddings.weight") {
            None
        } else {
            Some(model_type.unwrap_or(config::export::WEIGHT_PREFIX).to_string())
        };
        Ok(Self { tensors, prefix })
    }

    fn raw(&self, name: &str, dims: &[usize]) -> anyhow::Result<&Tensor> {
        let key = match &self.prefix {
            Some(p) => format!("{p}.{name}"),
            None => name.to_string(),
        };
        let t = self.tensors.get(&key).with_context(|| format!("missing tensor '{key}'"))?;
        if t.dims() != dims {
            bail!("tensor '{key}' has shape {:?}, expected {:?}", t.dims(), dims);
        }
        Ok(t)
    }

    fn get(&self, name: &str, dims: &[usize]) -> anyhow::Result<Vec<f32>> {
        let t = self.raw(name, dims)?;
        Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    }

    /// A `[out, in]` linear weight as row-major `[in, out]`.
    fn get_transposed(&self, name: &str, out_features: usize, in_features: usize) -> anyhow::Result<Vec<f32>> {
        let t = self.raw(name, &[out_features, in_features])?;
        Ok(t.to_dtype(DType::F32)?.t()?.contiguous()?.flatten_all()?.to_vec1::<f32>()?)
    }
}

/// Names of the shared constant initializers.
struct Consts {
    two: String,
    eps: String,
    one_f: String,
    half: String,
    sqrt2: String,
    attn_scale: String,
    mask_fill: String,
    heads_shape: String,
    merge_shape: String,
}

fn dims_i64(dims: &[usize]) -> Vec<i64> {
    dims.iter().map(|&d| d as i64).collect()
}

fn add_weight(b: &mut GraphBuilder, w: &Weights, name: &str, dims: &[usize]) -> anyhow::Result<String> {
    let data = w.get(name, dims)?;
    Ok(b.add_initializer(tensor_f32(name, &dims_i64(dims), &data)))
}

fn linear(
    b: &mut GraphBuilder,
    w: &Weights,
    scope: &str,
    prefix: &str,
    x: &str,
    in_features: usize,
    out_features: usize,
) -> anyhow::Result<String> {
    let weight_name = format!("{prefix}.weight");
    let data = w.get_transposed(&weight_name, out_features, in_features)?;
    let weight = b.add_initializer(tensor_f32(&weight_name, &[in_features as i64, out_features as i64], &data));
    let bias = add_weight(b, w, &format!("{prefix}.bias"), &[out_features])?;

    let y = b.op("MatMul", scope, &[x, weight.as_str()], vec![]);
    Ok(b.op("Add", scope, &[y.as_str(), bias.as_str()], vec![]))
}

/// y = (x - mean) / sqrt(var + eps) * gamma + beta over the last axis.
fn layer_norm(
    b: &mut GraphBuilder,
    w: &Weights,
    c: &Consts,
    scope: &str,
    prefix: &str,
    x: &str,
    dim: usize,
    output: Option<&str>,
) -> anyhow::Result<String> {
    let gamma = add_weight(b, w, &format!("{prefix}.weight"), &[dim])?;
    let beta = add_weight(b, w, &format!("{prefix}.bias"), &[dim])?;
    let reduce = || vec![attr_ints("axes", &[-1]), attr_int("keepdims", 1)];

    let mean = b.op("ReduceMean", scope, &[x], reduce());
    let centered = b.op("Sub", scope, &[x, mean.as_str()], vec![]);
    let sq = b.op("Pow", scope, &[centered.as_str(), c.two.as_str()], vec![]);
    let var = b.op("ReduceMean", scope, &[sq.as_str()], reduce());
    let var_eps = b.op("Add", scope, &[var.as_str(), c.eps.as_str()], vec![]);
    let std = b.op("Sqrt", scope, &[var_eps.as_str()], vec![]);
    let normed = b.op("Div", scope, &[centered.as_str(), std.as_str()], vec![]);
    let scaled = b.op("Mul", scope, &[normed.as_str(), gamma.as_str()], vec![]);

    Ok(match output {
        Some(name) => {
            b.op_into("Add", scope, &[scaled.as_str(), beta.as_str()], &[name], vec![]);
            name.to_string()
        }
        None => b.op("Add", scope, &[scaled.as_str(), beta.as_str()], vec![]),
    })
}

/// Exact GELU: x * 0.5 * (1 + erf(x / sqrt(2))).
fn gelu(b: &mut GraphBuilder, c: &Consts, scope: &str, x: &str) -> String {
    let d = b.op("Div", scope, &[x, c.sqrt2.as_str()], vec![]);
    let e = b.op("Erf", scope, &[d.as_str()], vec![]);
    let a = b.op("Add", scope, &[e.as_str(), c.one_f.as_str()], vec![]);
    let m = b.op("Mul", scope, &[x, a.as_str()], vec![]);
    b.op("Mul", scope, &[m.as_str(), c.half.as_str()], vec![])
}

fn build_graph(cfg: &EncoderConfig, activation: Activation, w: &Weights) -> anyhow::Result<GraphProto> {
    let input_ids = config::export::INPUT_IDS;
    let attention_mask = config::export::ATTENTION_MASK;
    let (dim, hidden_dim, heads, head_dim) = (cfg.dim, cfg.hidden_dim, cfg.n_heads, cfg.head_dim());

    let mut b = GraphBuilder::new();

    let zero_i = b.scalar_i64("const_zero_i64", 0);
    let one_i = b.scalar_i64("const_one_i64", 1);
    let c = Consts {
        two: b.scalar_f32("const_two", 2.0),
        eps: b.scalar_f32("layer_norm_eps", config::export::LAYER_NORM_EPS),
        one_f: b.scalar_f32("const_one", 1.0),
        half: b.scalar_f32("const_half", 0.5),
        sqrt2: b.scalar_f32("const_sqrt2", std::f32::consts::SQRT_2),
        attn_scale: b.scalar_f32("attention_scale", (head_dim as f32).sqrt()),
        mask_fill: b.scalar_f32("attention_mask_fill", f32::MIN),
        heads_shape: b.add_initializer(tensor_i64(
            "attention_heads_shape",
            &[4],
            &[0, -1, heads as i64, head_dim as i64],
        )),
        merge_shape: b.add_initializer(tensor_i64("attention_merge_shape", &[3], &[0, -1, dim as i64])),
    };

    // Embeddings: word + position, positions = range(0, sequence)
    let scope = "/embeddings";
    let word = add_weight(&mut b, w, "embeddings.word_embeddings.weight", &[cfg.vocab_size, dim])?;
    let pos = add_weight(
        &mut b,
        w,
        "embeddings.position_embeddings.weight",
        &[cfg.max_position_embeddings, dim],
    )?;
    let shape = b.op("Shape", scope, &[input_ids], vec![]);
    let seq_len = b.op("Gather", scope, &[shape.as_str(), one_i.as_str()], vec![attr_int("axis", 0)]);
    let position_ids = b.op("Range", scope, &[zero_i.as_str(), seq_len.as_str(), one_i.as_str()], vec![]);
    let word_emb = b.op("Gather", "/embeddings/word_embeddings", &[word.as_str(), input_ids], vec![]);
    let pos_emb = b.op("Gather", "/embeddings/position_embeddings", &[pos.as_str(), position_ids.as_str()], vec![]);
    let emb = b.op("Add", scope, &[word_emb.as_str(), pos_emb.as_str()], vec![]);
    let mut hidden = layer_norm(&mut b, w, &c, "/embeddings/LayerNorm", "embeddings.LayerNorm", &emb, dim, None)?;

    // Padding positions (mask == 0) as a [batch, 1, 1, sequence] condition shared by all layers.
    let is_pad = b.op("Equal", "/attention_mask", &[attention_mask, zero_i.as_str()], vec![]);
    let pad_cond = b.op("Unsqueeze", "/attention_mask", &[is_pad.as_str()], vec![attr_ints("axes", &[1, 2])]);

    for i in 0..cfg.n_layers {
        let layer = format!("transformer.layer.{i}");
        let s = format!("/transformer/layer.{i}/attention");

        let q = linear(&mut b, w, &format!("{s}/q_lin"), &format!("{layer}.attention.q_lin"), &hidden, dim, dim)?;
        let k = linear(&mut b, w, &format!("{s}/k_lin"), &format!("{layer}.attention.k_lin"), &hidden, dim, dim)?;
        let v = linear(&mut b, w, &format!("{s}/v_lin"), &format!("{layer}.attention.v_lin"), &hidden, dim, dim)?;

        // [b, s, d] -> [b, h, s, hd]; keys go to [b, h, hd, s] for the score MatMul.
        let q = b.op("Reshape", &s, &[q.as_str(), c.heads_shape.as_str()], vec![]);
        let q = b.op("Transpose", &s, &[q.as_str()], vec![attr_ints("perm", &[0, 2, 1, 3])]);
        let q = b.op("Div", &s, &[q.as_str(), c.attn_scale.as_str()], vec![]);
        let k = b.op("Reshape", &s, &[k.as_str(), c.heads_shape.as_str()], vec![]);
        let k = b.op("Transpose", &s, &[k.as_str()], vec![attr_ints("perm", &[0, 2, 3, 1])]);
        let v = b.op("Reshape", &s, &[v.as_str(), c.heads_shape.as_str()], vec![]);
        let v = b.op("Transpose", &s, &[v.as_str()], vec![attr_ints("perm", &[0, 2, 1, 3])]);

        let scores = b.op("MatMul", &s, &[q.as_str(), k.as_str()], vec![]);
        let scores = b.op("Where", &s, &[pad_cond.as_str(), c.mask_fill.as_str(), scores.as_str()], vec![]);
        let probs = b.op("Softmax", &s, &[scores.as_str()], vec![attr_int("axis", 3)]);
        let ctx = b.op("MatMul", &s, &[probs.as_str(), v.as_str()], vec![]);
        let ctx = b.op("Transpose", &s, &[ctx.as_str()], vec![attr_ints("perm", &[0, 2, 1, 3])]);
        let ctx = b.op("Reshape", &s, &[ctx.as_str(), c.merge_shape.as_str()], vec![]);
        let attn = linear(&mut b, w, &format!("{s}/out_lin"), &format!("{layer}.attention.out_lin"), &ctx, dim, dim)?;

        let ls = format!("/transformer/layer.{i}");
        let residual = b.op("Add", &ls, &[attn.as_str(), hidden.as_str()], vec![]);
        let sa_out = layer_norm(
            &mut b,
            w,
            &c,
            &format!("{ls}/sa_layer_norm"),
            &format!("{layer}.sa_layer_norm"),
            &residual,
            dim,
            None,
        )?;

        let fs = format!("{ls}/ffn");
        let h = linear(&mut b, w, &format!("{fs}/lin1"), &format!("{layer}.ffn.lin1"), &sa_out, dim, hidden_dim)?;
        let h = match activation {
            Activation::Gelu => gelu(&mut b, &c, &format!("{fs}/activation"), &h),
            Activation::Relu => b.op("Relu", &format!("{fs}/activation"), &[h.as_str()], vec![]),
        };
        let h = linear(&mut b, w, &format!("{fs}/lin2"), &format!("{layer}.ffn.lin2"), &h, hidden_dim, dim)?;
        let residual = b.op("Add", &ls, &[h.as_str(), sa_out.as_str()], vec![]);

        let last = i + 1 == cfg.n_layers;
        hidden = layer_norm(
            &mut b,
            w,
            &c,
            &format!("{ls}/output_layer_norm"),
            &format!("{layer}.output_layer_norm"),
            &residual,
            dim,
            last.then_some(config::export::OUTPUT),
        )?;
    }

    let batch = Dim::Named(config::export::BATCH_AXIS.to_string());
    let sequence = Dim::Named(config::export::SEQUENCE_AXIS.to_string());
    let inputs = vec![
        value_info(input_ids, DataType::Int64, &[batch.clone(), sequence.clone()]),
        value_info(attention_mask, DataType::Int64, &[batch.clone(), sequence.clone()]),
    ];
    let outputs = vec![value_info(
        config::export::OUTPUT,
        DataType::Float,
        &[batch, sequence, Dim::Fixed(dim as i64)],
    )];

    Ok(b.finish("main_graph", inputs, outputs))
}
