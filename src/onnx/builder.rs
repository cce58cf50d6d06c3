use std::collections::HashSet;

use super::proto::{
    tensor_shape_proto, type_proto, AttributeProto, AttributeType, DataType, GraphProto, NodeProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

/// A tensor dimension in a graph input/output signature.
#[derive(Debug, Clone, PartialEq)]
pub enum Dim {
    Fixed(i64),
    Named(String),
}

pub fn value_info(name: &str, elem_type: DataType, dims: &[Dim]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| tensor_shape_proto::Dimension {
            value: Some(match d {
                Dim::Fixed(v) => tensor_shape_proto::dimension::Value::DimValue(*v),
                Dim::Named(p) => tensor_shape_proto::dimension::Value::DimParam(p.clone()),
            }),
        })
        .collect();

    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
        ..Default::default()
    }
}

pub fn attr_int(name: &str, v: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        i: v,
        r#type: AttributeType::Int as i32,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, v: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        ints: v.to_vec(),
        r#type: AttributeType::Ints as i32,
        ..Default::default()
    }
}

/// FLOAT tensor stored as little-endian `raw_data`.
pub fn tensor_f32(name: &str, dims: &[i64], data: &[f32]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: dims.to_vec(),
        data_type: DataType::Float as i32,
        raw_data: data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

pub fn tensor_i64(name: &str, dims: &[i64], data: &[i64]) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: dims.to_vec(),
        data_type: DataType::Int64 as i32,
        raw_data: data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

pub fn tensor_u8(name: &str, dims: &[i64], data: Vec<u8>) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        dims: dims.to_vec(),
        data_type: DataType::Uint8 as i32,
        raw_data: data,
        ..Default::default()
    }
}

/// Accumulates nodes and initializers; generates unique node and value names.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn unique(&mut self, base: &str) -> String {
        if self.names.insert(base.to_string()) {
            return base.to_string();
        }
        let mut n = 1;
        loop {
            let candidate = format!("{base}_{n}");
            if self.names.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn add_initializer(&mut self, tensor: TensorProto) -> String {
        let name = tensor.name.clone();
        self.names.insert(name.clone());
        self.initializers.push(tensor);
        name
    }

    pub fn scalar_f32(&mut self, name: &str, v: f32) -> String {
        self.add_initializer(tensor_f32(name, &[], &[v]))
    }

    pub fn scalar_i64(&mut self, name: &str, v: i64) -> String {
        self.add_initializer(tensor_i64(name, &[], &[v]))
    }

    /// Add a single-output node; returns the output value name (`<node name>_output_0`).
    pub fn op(&mut self, op_type: &str, scope: &str, inputs: &[&str], attrs: Vec<AttributeProto>) -> String {
        let node_name = self.unique(&format!("{scope}/{op_type}"));
        let output = self.unique(&format!("{node_name}_output_0"));
        self.push(op_type, node_name, inputs, &[output.as_str()], attrs);
        output
    }

    /// Add a node whose outputs are named by the caller (graph outputs).
    pub fn op_into(
        &mut self,
        op_type: &str,
        scope: &str,
        inputs: &[&str],
        outputs: &[&str],
        attrs: Vec<AttributeProto>,
    ) {
        let node_name = self.unique(&format!("{scope}/{op_type}"));
        for o in outputs {
            self.names.insert(o.to_string());
        }
        self.push(op_type, node_name, inputs, outputs, attrs);
    }

    fn push(&mut self, op_type: &str, name: String, inputs: &[&str], outputs: &[&str], attrs: Vec<AttributeProto>) {
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            name,
            op_type: op_type.to_string(),
            attribute: attrs,
            ..Default::default()
        });
    }

    pub fn finish(self, name: &str, inputs: Vec<ValueInfoProto>, outputs: Vec<ValueInfoProto>) -> GraphProto {
        GraphProto {
            node: self.nodes,
            name: name.to_string(),
            initializer: self.initializers,
            input: inputs,
            output: outputs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_names_are_unique_per_scope() {
        let mut b = GraphBuilder::new();
        let a = b.op("Add", "/layer.0", &["x", "y"], vec![]);
        let c = b.op("Add", "/layer.0", &[a.as_str(), "y"], vec![]);
        assert_ne!(a, c);

        let graph = b.finish("g", vec![], vec![]);
        assert_eq!(graph.node.len(), 2);
        assert_eq!(graph.node[0].name, "/layer.0/Add");
        assert_eq!(graph.node[1].name, "/layer.0/Add_1");
        assert_eq!(graph.node[1].input[0], a);
    }

    #[test]
    fn test_scalar_initializers_have_rank_zero() {
        let mut b = GraphBuilder::new();
        let name = b.scalar_i64("one", 1);
        let graph = b.finish("g", vec![], vec![]);
        assert_eq!(name, "one");
        assert!(graph.initializer[0].dims.is_empty());
        assert_eq!(graph.initializer[0].raw_data.len(), 8);
    }
}
