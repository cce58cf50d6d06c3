// Mirrors what a graph-format checker guarantees for a consumer runtime: known operators for
// the declared opset, topologically ordered nodes with every input defined, single assignment of
// every value, graph outputs produced, and initializer payloads that match their shapes.

use std::collections::{HashMap, HashSet};

use anyhow::{bail, Context};

use super::proto::{AttributeProto, AttributeType, DataType, ModelProto, NodeProto, TensorProto};
use AttributeType::{Int, Ints, Tensor};

struct OpSchema {
    op_type: &'static str,
    since_version: i64,
    inputs: (usize, usize),
    outputs: (usize, usize),
    /// (name, type, required); any attribute not listed here is rejected.
    attributes: &'static [(&'static str, AttributeType, bool)],
}

const fn op(
    op_type: &'static str,
    since_version: i64,
    inputs: (usize, usize),
    outputs: (usize, usize),
    attributes: &'static [(&'static str, AttributeType, bool)],
) -> OpSchema {
    OpSchema {
        op_type,
        since_version,
        inputs,
        outputs,
        attributes,
    }
}

// Attribute sets as of opset 11.
const DEFAULT_DOMAIN_OPS: &[OpSchema] = &[
    op("Add", 7, (2, 2), (1, 1), &[]),
    op("Cast", 6, (1, 1), (1, 1), &[("to", Int, true)]),
    op("Concat", 4, (1, usize::MAX), (1, 1), &[("axis", Int, true)]),
    op("Constant", 9, (0, 0), (1, 1), &[("value", Tensor, true)]),
    op("DequantizeLinear", 10, (2, 3), (1, 1), &[]),
    op("Div", 7, (2, 2), (1, 1), &[]),
    op("DynamicQuantizeLinear", 11, (1, 1), (3, 3), &[]),
    op("Equal", 7, (2, 2), (1, 1), &[]),
    op("Erf", 9, (1, 1), (1, 1), &[]),
    op("Gather", 1, (2, 2), (1, 1), &[("axis", Int, false)]),
    op("MatMul", 1, (2, 2), (1, 1), &[]),
    op("MatMulInteger", 10, (2, 4), (1, 1), &[]),
    op("Mul", 7, (2, 2), (1, 1), &[]),
    op("Pow", 7, (2, 2), (1, 1), &[]),
    op("QuantizeLinear", 10, (2, 3), (1, 1), &[]),
    op("Range", 11, (3, 3), (1, 1), &[]),
    op("ReduceMean", 1, (1, 1), (1, 1), &[("axes", Ints, false), ("keepdims", Int, false)]),
    op("Relu", 6, (1, 1), (1, 1), &[]),
    op("Reshape", 5, (2, 2), (1, 1), &[]),
    op("Shape", 1, (1, 1), (1, 1), &[]),
    op("Softmax", 1, (1, 1), (1, 1), &[("axis", Int, false)]),
    op("Sqrt", 6, (1, 1), (1, 1), &[]),
    op("Sub", 7, (2, 2), (1, 1), &[]),
    op("Transpose", 1, (1, 1), (1, 1), &[("perm", Ints, false)]),
    op("Unsqueeze", 1, (1, 1), (1, 1), &[("axes", Ints, true)]),
    op("Where", 9, (3, 3), (1, 1), &[]),
];

fn schema(op_type: &str) -> Option<&'static OpSchema> {
    DEFAULT_DOMAIN_OPS.iter().find(|s| s.op_type == op_type)
}

pub fn check_model(model: &ModelProto) -> anyhow::Result<()> {
    if model.ir_version <= 0 {
        bail!("model has no ir_version");
    }

    let opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.is_empty() || o.domain == "ai.onnx")
        .map(|o| o.version)
        .context("model does not import the default operator set")?;
    if opset <= 0 {
        bail!("invalid default opset version {opset}");
    }

    let graph = model.graph.as_ref().context("model has no graph")?;
    if graph.name.is_empty() {
        bail!("graph has no name");
    }
    if graph.node.is_empty() {
        bail!("graph '{}' has no nodes", graph.name);
    }
    if graph.input.is_empty() {
        bail!("graph '{}' declares no inputs", graph.name);
    }
    if graph.output.is_empty() {
        bail!("graph '{}' declares no outputs", graph.name);
    }

    let mut defined: HashSet<&str> = HashSet::new();

    for init in &graph.initializer {
        check_initializer(init)?;
        if !defined.insert(init.name.as_str()) {
            bail!("initializer '{}' is defined more than once", init.name);
        }
    }

    for input in &graph.input {
        if input.name.is_empty() {
            bail!("graph input with empty name");
        }
        if input.r#type.is_none() {
            bail!("graph input '{}' has no type", input.name);
        }
        // Inputs may shadow initializers (default values); only duplicates among inputs are errors.
        if !defined.insert(input.name.as_str()) && !graph.initializer.iter().any(|i| i.name == input.name) {
            bail!("graph input '{}' is defined more than once", input.name);
        }
    }

    let mut node_names: HashMap<&str, usize> = HashMap::new();
    for (idx, node) in graph.node.iter().enumerate() {
        let label = if node.name.is_empty() { format!("#{idx}") } else { node.name.clone() };

        if !node.domain.is_empty() && node.domain != "ai.onnx" {
            bail!("node {label}: unsupported domain '{}'", node.domain);
        }
        let op_schema =
            schema(&node.op_type).with_context(|| format!("node {label}: unknown operator '{}'", node.op_type))?;
        let since = op_schema.since_version;
        let (min_in, max_in) = op_schema.inputs;
        let (min_out, max_out) = op_schema.outputs;
        if since > opset {
            bail!("node {label}: operator {} requires opset {since}, model declares {opset}", node.op_type);
        }
        if node.input.len() < min_in || node.input.len() > max_in {
            bail!(
                "node {label}: {} takes {min_in}..={max_in} inputs, got {}",
                node.op_type,
                node.input.len()
            );
        }
        if node.output.len() < min_out || node.output.len() > max_out {
            bail!(
                "node {label}: {} produces {min_out}..={max_out} outputs, got {}",
                node.op_type,
                node.output.len()
            );
        }

        check_attributes(node, op_schema).with_context(|| format!("node {label}"))?;

        if !node.name.is_empty() {
            if let Some(prev) = node_names.insert(node.name.as_str(), idx) {
                bail!("node name '{}' used by nodes #{prev} and #{idx}", node.name);
            }
        }

        for input in &node.input {
            // Empty string marks an omitted optional input.
            if !input.is_empty() && !defined.contains(input.as_str()) {
                bail!("node {label}: input '{input}' is not defined before use");
            }
        }
        for output in &node.output {
            if output.is_empty() {
                continue;
            }
            if !defined.insert(output.as_str()) {
                bail!("node {label}: output '{output}' is already defined");
            }
        }
    }

    for output in &graph.output {
        if !defined.contains(output.name.as_str()) {
            bail!("graph output '{}' is never produced", output.name);
        }
    }

    Ok(())
}

fn check_attributes(node: &NodeProto, op_schema: &OpSchema) -> anyhow::Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    for attr in &node.attribute {
        if !seen.insert(attr.name.as_str()) {
            bail!("attribute '{}' is set more than once", attr.name);
        }
        let (_, expected, _) = op_schema
            .attributes
            .iter()
            .find(|(name, _, _)| *name == attr.name)
            .with_context(|| format!("{} has no attribute '{}'", node.op_type, attr.name))?;
        if attr.r#type != *expected as i32 {
            bail!(
                "attribute '{}' of {} must be {:?}, got type {}",
                attr.name,
                node.op_type,
                expected,
                attr.r#type
            );
        }
        check_attribute_value(&node.op_type, attr)?;
    }

    for (name, _, required) in op_schema.attributes {
        if *required && !seen.contains(name) {
            bail!("{} is missing required attribute '{name}'", node.op_type);
        }
    }
    Ok(())
}

fn check_attribute_value(op_type: &str, attr: &AttributeProto) -> anyhow::Result<()> {
    match (op_type, attr.name.as_str()) {
        ("Cast", "to") => {
            let dtype = i32::try_from(attr.i).ok().and_then(|v| DataType::try_from(v).ok());
            if matches!(dtype, None | Some(DataType::Undefined)) {
                bail!("Cast 'to' is not a tensor data type: {}", attr.i);
            }
        }
        ("Transpose", "perm") => {
            let mut sorted = attr.ints.clone();
            sorted.sort_unstable();
            if sorted.is_empty() || sorted.iter().enumerate().any(|(i, &p)| p != i as i64) {
                bail!("Transpose 'perm' {:?} is not a permutation", attr.ints);
            }
        }
        ("Unsqueeze", "axes") => {
            let unique: HashSet<i64> = attr.ints.iter().copied().collect();
            if attr.ints.is_empty() || unique.len() != attr.ints.len() {
                bail!("Unsqueeze 'axes' {:?} must be non-empty and unique", attr.ints);
            }
        }
        ("Constant", "value") if attr.t.is_none() => bail!("Constant 'value' holds no tensor"),
        _ => {}
    }
    Ok(())
}

fn check_initializer(init: &TensorProto) -> anyhow::Result<()> {
    if init.name.is_empty() {
        bail!("initializer with empty name");
    }
    if init.dims.iter().any(|&d| d < 0) {
        bail!("initializer '{}' has negative dims {:?}", init.name, init.dims);
    }
    let dtype = init
        .data_type()
        .filter(|d| *d != DataType::Undefined)
        .with_context(|| format!("initializer '{}' has invalid data_type {}", init.name, init.data_type))?;
    let count = init.element_count();

    if !init.raw_data.is_empty() {
        let size = dtype
            .element_size()
            .with_context(|| format!("initializer '{}': {:?} cannot use raw_data", init.name, dtype))?;
        if init.raw_data.len() != count * size {
            bail!(
                "initializer '{}': raw_data is {} bytes, dims {:?} of {:?} need {}",
                init.name,
                init.raw_data.len(),
                init.dims,
                dtype,
                count * size
            );
        }
        return Ok(());
    }

    let typed_len = match dtype {
        DataType::Float => init.float_data.len(),
        DataType::Int64 => init.int64_data.len(),
        _ => init.int32_data.len(),
    };
    if typed_len != count {
        bail!(
            "initializer '{}': {} elements stored, dims {:?} need {}",
            init.name,
            typed_len,
            init.dims,
            count
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx::builder::{attr_int, attr_ints, tensor_f32, value_info, Dim, GraphBuilder};
    use crate::onnx::proto::OperatorSetIdProto;

    fn model_with(build: impl FnOnce(&mut GraphBuilder) -> String, opset: i64) -> ModelProto {
        let mut b = GraphBuilder::new();
        let out = build(&mut b);
        b.op_into("Sqrt", "/out", &[out.as_str()], &["y"], vec![]);
        let graph = b.finish(
            "g",
            vec![value_info("x", DataType::Float, &[Dim::Named("n".into())])],
            vec![value_info("y", DataType::Float, &[Dim::Named("n".into())])],
        );
        ModelProto {
            ir_version: 6,
            graph: Some(graph),
            opset_import: vec![OperatorSetIdProto { domain: String::new(), version: opset }],
            ..Default::default()
        }
    }

    #[test]
    fn test_accepts_well_formed_graph() {
        let model = model_with(
            |b| {
                let w = b.add_initializer(tensor_f32("w", &[2], &[1.0, 2.0]));
                b.op("Mul", "/m", &["x", w.as_str()], vec![])
            },
            11,
        );
        check_model(&model).unwrap();
    }

    #[test]
    fn test_rejects_undefined_input() {
        let model = model_with(|b| b.op("Mul", "/m", &["x", "missing"], vec![]), 11);
        let err = check_model(&model).unwrap_err().to_string();
        assert!(err.contains("'missing' is not defined"), "{err}");
    }

    #[test]
    fn test_rejects_unknown_and_too_new_ops() {
        let model = model_with(|b| b.op("FancyAttention", "/a", &["x"], vec![]), 11);
        assert!(check_model(&model).unwrap_err().to_string().contains("unknown operator"));

        let model = model_with(|b| b.op("Range", "/r", &["x", "x", "x"], vec![]), 10);
        assert!(check_model(&model).unwrap_err().to_string().contains("requires opset 11"));
    }

    #[test]
    fn test_rejects_bad_arity() {
        let model = model_with(|b| b.op("Add", "/a", &["x"], vec![]), 11);
        assert!(check_model(&model).unwrap_err().to_string().contains("inputs"));
    }

    #[test]
    fn test_rejects_duplicate_definition() {
        let mut model = model_with(|b| b.op("Sqrt", "/s", &["x"], vec![]), 11);
        let graph = model.graph.as_mut().unwrap();
        let dup = graph.node[0].clone();
        graph.node.insert(1, crate::onnx::proto::NodeProto { name: "/other".into(), ..dup });
        assert!(check_model(&model).unwrap_err().to_string().contains("already defined"));
    }

    #[test]
    fn test_rejects_truncated_initializer() {
        let model = model_with(
            |b| {
                let mut w = tensor_f32("w", &[3], &[1.0, 2.0, 3.0]);
                w.raw_data.truncate(8);
                let w = b.add_initializer(w);
                b.op("Mul", "/m", &["x", w.as_str()], vec![])
            },
            11,
        );
        assert!(check_model(&model).unwrap_err().to_string().contains("raw_data is 8 bytes"));
    }

    #[test]
    fn test_rejects_missing_opset_and_output() {
        let mut model = model_with(|b| b.op("Sqrt", "/s", &["x"], vec![]), 11);
        model.opset_import.clear();
        assert!(check_model(&model).is_err());

        let mut model = model_with(|b| b.op("Sqrt", "/s", &["x"], vec![]), 11);
        model.graph.as_mut().unwrap().output[0].name = "nowhere".into();
        assert!(check_model(&model).unwrap_err().to_string().contains("never produced"));
    }

    fn with_op(op_type: &str, attrs: Vec<AttributeProto>) -> ModelProto {
        model_with(|b| b.op(op_type, &format!("/{op_type}"), &["x"], attrs), 11)
    }

    #[test]
    fn test_accepts_expected_attributes() {
        for (op_type, attrs) in [
            ("Cast", vec![attr_int("to", DataType::Float as i64)]),
            ("Unsqueeze", vec![attr_ints("axes", &[1, 2])]),
            ("Transpose", vec![attr_ints("perm", &[0, 2, 1, 3])]),
            ("Transpose", vec![]),
            ("Softmax", vec![attr_int("axis", 3)]),
        ] {
            check_model(&with_op(op_type, attrs)).unwrap_or_else(|e| panic!("{op_type}: {e:#}"));
        }
    }

    #[test]
    fn test_rejects_missing_required_attribute() {
        let err = check_model(&with_op("Cast", vec![])).unwrap_err();
        assert!(format!("{err:#}").contains("missing required attribute 'to'"), "{err:#}");

        let err = check_model(&with_op("Unsqueeze", vec![])).unwrap_err();
        assert!(format!("{err:#}").contains("missing required attribute 'axes'"), "{err:#}");
    }

    #[test]
    fn test_rejects_wrongly_typed_attribute() {
        let err = check_model(&with_op("Softmax", vec![attr_ints("axis", &[3])])).unwrap_err();
        assert!(format!("{err:#}").contains("must be Int"), "{err:#}");

        let err = check_model(&with_op("Transpose", vec![attr_int("perm", 1)])).unwrap_err();
        assert!(format!("{err:#}").contains("must be Ints"), "{err:#}");
    }

    #[test]
    fn test_rejects_malformed_attribute_values() {
        for (op_type, attr) in [
            ("Transpose", attr_ints("perm", &[0, 2, 2, 3])),
            ("Unsqueeze", attr_ints("axes", &[1, 1])),
            ("Unsqueeze", attr_ints("axes", &[])),
            ("Cast", attr_int("to", 999)),
        ] {
            let label = format!("{op_type} {attr:?}");
            assert!(check_model(&with_op(op_type, vec![attr])).is_err(), "{label} accepted");
        }
    }

    #[test]
    fn test_rejects_unknown_and_repeated_attributes() {
        let err = check_model(&with_op("Sqrt", vec![attr_int("axis", 0)])).unwrap_err();
        assert!(format!("{err:#}").contains("Sqrt has no attribute 'axis'"), "{err:#}");

        let err = check_model(&with_op("Softmax", vec![attr_int("axis", 1), attr_int("axis", 2)])).unwrap_err();
        assert!(format!("{err:#}").contains("more than once"), "{err:#}");
    }
}
