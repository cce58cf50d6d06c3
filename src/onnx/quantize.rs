// Weights of MatMul and Gather nodes are stored as per-tensor asymmetric uint8; activations are
// quantized at run time by DynamicQuantizeLinear. Graph inputs/outputs keep their float types, so
// clients load the quantized model exactly like the full-precision one.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context};

use super::builder::{attr_int, tensor_f32, tensor_u8};
use super::proto::{DataType, ModelProto, NodeProto, TensorProto};
use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantType {
    /// Unsigned 8-bit weights with a per-tensor zero point.
    QUInt8,
}

/// Quantization parameters for one weight tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: u8,
}

/// Per-tensor asymmetric uint8 parameters. The range always includes 0 so that zero is exact.
pub fn compute_params(data: &[f32]) -> QuantParams {
    let (mut rmin, mut rmax) = (0.0f32, 0.0f32);
    for &v in data {
        if v.is_finite() {
            rmin = rmin.min(v);
            rmax = rmax.max(v);
        }
    }
    let mut scale = (rmax - rmin) / 255.0;
    if scale == 0.0 || !scale.is_finite() {
        scale = 1.0;
    }
    let zero_point = (-rmin / scale).round_ties_even().clamp(0.0, 255.0) as u8;
    QuantParams { scale, zero_point }
}

pub fn quantize_values(data: &[f32], params: &QuantParams) -> Vec<u8> {
    let zp = params.zero_point as f32;
    data.iter()
        .map(|&v| ((v / params.scale).round_ties_even() + zp).clamp(0.0, 255.0) as u8)
        .collect()
}

struct QuantizedWeight {
    quantized: String,
    scale: String,
    zero_point: String,
}

pub fn quantize_dynamic(model: &ModelProto, weight_type: QuantType) -> anyhow::Result<ModelProto> {
    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .context("model does not import the default operator set")?;
    if opset < config::quantize::MIN_OPSET {
        bail!(
            "dynamic quantization needs opset >= {}, model declares {opset}",
            config::quantize::MIN_OPSET
        );
    }

    let mut out = model.clone();
    let graph = out.graph.as_mut().context("model has no graph")?;

    let float_inits: HashMap<String, TensorProto> = graph
        .initializer
        .iter()
        .filter(|t| t.data_type() == Some(DataType::Float))
        .map(|t| (t.name.clone(), t.clone()))
        .collect();

    let mut done: HashMap<String, QuantizedWeight> = HashMap::new();
    let mut new_inits: Vec<TensorProto> = Vec::new();
    let mut new_nodes: Vec<NodeProto> = Vec::with_capacity(graph.node.len());
    let (mut matmuls, mut gathers) = (0usize, 0usize);

    for node in std::mem::take(&mut graph.node) {
        let domain_ok = node.domain.is_empty() || node.domain == "ai.onnx";
        match node.op_type.as_str() {
            "MatMul" if domain_ok && node.input.len() == 2 => {
                let weight = node.input.get(1).and_then(|n| float_inits.get(n)).filter(|t| t.dims.len() == 2);
                let Some(weight) = weight else {
                    new_nodes.push(node);
                    continue;
                };
                let q = quantize_weight(weight, &mut done, &mut new_inits)?;
                rewrite_matmul(&node, q, &mut new_nodes);
                matmuls += 1;
            }
            "Gather" if domain_ok && node.input.len() == 2 => {
                let weight = node.input.first().and_then(|n| float_inits.get(n)).filter(|t| t.dims.len() >= 2);
                let Some(weight) = weight else {
                    new_nodes.push(node);
                    continue;
                };
                let q = quantize_weight(weight, &mut done, &mut new_inits)?;
                rewrite_gather(&node, q, &mut new_nodes);
                gathers += 1;
            }
            _ => new_nodes.push(node),
        }
    }

    graph.node = new_nodes;
    graph.initializer.extend(new_inits);

    // Drop float weights that no node reads anymore.
    let referenced: HashSet<String> = graph
        .node
        .iter()
        .flat_map(|n| n.input.iter().cloned())
        .chain(graph.output.iter().map(|o| o.name.clone()))
        .collect();
    let before = graph.initializer.len();
    graph
        .initializer
        .retain(|t| !done.contains_key(&t.name) || referenced.contains(&t.name));
    let removed = before - graph.initializer.len();

    log::info!(
        "Quantized {} weights ({:?}): {} MatMul nodes, {} Gather nodes; {} float initializers removed",
        done.len(),
        weight_type,
        matmuls,
        gathers,
        removed
    );

    Ok(out)
}

fn quantize_weight<'a>(
    weight: &TensorProto,
    done: &'a mut HashMap<String, QuantizedWeight>,
    new_inits: &mut Vec<TensorProto>,
) -> anyhow::Result<&'a QuantizedWeight> {
    if !done.contains_key(&weight.name) {
        let data = weight.to_f32_vec()?;
        if data.len() != weight.element_count() {
            bail!(
                "weight '{}' holds {} values, dims {:?} need {}",
                weight.name,
                data.len(),
                weight.dims,
                weight.element_count()
            );
        }
        let params = compute_params(&data);
        let q = QuantizedWeight {
            quantized: format!("{}{}", weight.name, config::quantize::QUANTIZED_SUFFIX),
            scale: format!("{}{}", weight.name, config::quantize::SCALE_SUFFIX),
            zero_point: format!("{}{}", weight.name, config::quantize::ZERO_POINT_SUFFIX),
        };
        log::debug!(
            "Quantizing '{}' {:?}: scale={} zero_point={}",
            weight.name,
            weight.dims,
            params.scale,
            params.zero_point
        );
        new_inits.push(tensor_u8(&q.quantized, &weight.dims, quantize_values(&data, &params)));
        new_inits.push(tensor_f32(&q.scale, &[], &[params.scale]));
        new_inits.push(tensor_u8(&q.zero_point, &[], vec![params.zero_point]));
        done.insert(weight.name.clone(), q);
    }
    done.get(&weight.name).context("quantized weight missing after insert")
}

fn node(op_type: &str, name: String, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        name,
        op_type: op_type.to_string(),
        ..Default::default()
    }
}

/// `Y = MatMul(A, W)` becomes
/// `DynamicQuantizeLinear(A) -> MatMulInteger(A_q, W_q, A_zp, W_zp) -> Cast -> Mul(A_scale * W_scale)`.
fn rewrite_matmul(orig: &NodeProto, w: &QuantizedWeight, out: &mut Vec<NodeProto>) {
    let a = orig.input[0].as_str();
    let y = orig.output.first().map(String::as_str).unwrap_or_default();
    let base = if orig.name.is_empty() { y.to_string() } else { orig.name.clone() };

    let a_q = format!("{a}_quantized");
    let a_scale = format!("{a}_scale");
    let a_zp = format!("{a}_zero_point");
    // The same activation may feed several MatMuls (q/k/v); quantize it once.
    if !out.iter().any(|n| n.op_type == "DynamicQuantizeLinear" && n.input.first().map(String::as_str) == Some(a)) {
        out.push(node(
            "DynamicQuantizeLinear",
            format!("{a}_QuantizeLinear"),
            &[a],
            &[&a_q, &a_scale, &a_zp],
        ));
    }

    let y_int = format!("{y}_output_quantized");
    let y_float = format!("{y}_output_quantized_cast_output");
    let scale_prod = format!("{base}_scales_mul_output");

    out.push(node(
        "MatMulInteger",
        format!("{base}_quant"),
        &[&a_q, &w.quantized, &a_zp, &w.zero_point],
        &[&y_int],
    ));
    let mut cast = node("Cast", format!("{base}_output_quantized_cast"), &[&y_int], &[&y_float]);
    cast.attribute.push(attr_int("to", DataType::Float as i64));
    out.push(cast);
    out.push(node("Mul", format!("{base}_scales_mul"), &[&a_scale, &w.scale], &[&scale_prod]));
    out.push(node("Mul", format!("{base}_output_scale_mul"), &[&y_float, &scale_prod], &[y]));
}

/// `Y = Gather(W, idx)` becomes `Gather(W_q, idx) -> DequantizeLinear(W_scale, W_zp)`.
fn rewrite_gather(orig: &NodeProto, w: &QuantizedWeight, out: &mut Vec<NodeProto>) {
    let idx = orig.input[1].as_str();
    let y = orig.output.first().map(String::as_str).unwrap_or_default();
    let base = if orig.name.is_empty() { y.to_string() } else { orig.name.clone() };
    let y_q = format!("{y}_quantized");

    let mut gather = node("Gather", format!("{base}_quant"), &[&w.quantized, idx], &[&y_q]);
    gather.attribute = orig.attribute.clone();
    out.push(gather);
    out.push(node(
        "DequantizeLinear",
        format!("{base}_DequantizeLinear"),
        &[&y_q, &w.scale, &w.zero_point],
        &[y],
    ));
}
