use crate::tensor::TensorDataType;

use super::{
    attribute_proto::AttributeType, tensor_shape_proto, type_proto, AttributeProto, GraphProto,
    ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto,
};

/// IR version written by [`GraphBuilder::build`].
pub const BUILDER_IR_VERSION: i64 = 8;

/// Assembles a model in memory, one graph element at a time.
///
/// Negative dimensions of inputs and outputs are written as the symbolic dimension `N`.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    opset: i64,
    graph: GraphProto,
}

impl GraphBuilder {
    pub fn new(opset: i64) -> Self {
        Self {
            opset,
            graph: GraphProto {
                name: Some(String::from("main")),
                ..Default::default()
            },
        }
    }

    pub fn input(mut self, name: &str, dims: &[i64]) -> Self {
        self.graph.input.push(float_value_info(name, dims));
        self
    }

    pub fn output(mut self, name: &str, dims: &[i64]) -> Self {
        self.graph.output.push(float_value_info(name, dims));
        self
    }

    pub fn initializer(mut self, name: &str, dims: &[i64], values: Vec<f32>) -> Self {
        self.graph.initializer.push(TensorProto {
            name: Some(name.to_string()),
            dims: dims.to_vec(),
            data_type: Some(TensorDataType::Float as i32),
            float_data: values,
            ..Default::default()
        });
        self
    }

    pub fn int64_initializer(mut self, name: &str, dims: &[i64], values: Vec<i64>) -> Self {
        self.graph.initializer.push(TensorProto {
            name: Some(name.to_string()),
            dims: dims.to_vec(),
            data_type: Some(TensorDataType::Int64 as i32),
            int64_data: values,
            ..Default::default()
        });
        self
    }

    pub fn node(mut self, node: NodeProto) -> Self {
        self.graph.node.push(node);
        self
    }

    pub fn build(self) -> ModelProto {
        ModelProto {
            ir_version: Some(BUILDER_IR_VERSION),
            producer_name: Some(String::from(env!("CARGO_PKG_NAME"))),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(self.opset),
            }],
            graph: Some(self.graph),
            ..Default::default()
        }
    }
}

fn float_value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| tensor_shape_proto::Dimension {
            value: Some(match *d {
                d if d < 0 => tensor_shape_proto::dimension::Value::DimParam(String::from("N")),
                d => tensor_shape_proto::dimension::Value::DimValue(d),
            }),
            ..Default::default()
        })
        .collect();
    ValueInfoProto {
        name: Some(name.to_string()),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: Some(TensorDataType::Float as i32),
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A node of the default domain named after its first output.
pub fn node(op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        name: outputs.first().map(|o| format!("{}_{}", op_type, o)),
        op_type: Some(op_type.to_string()),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

pub fn int_attribute(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        r#type: Some(AttributeType::Int as i32),
        i: Some(value),
        ..Default::default()
    }
}

pub fn float_attribute(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        r#type: Some(AttributeType::Float as i32),
        f: Some(value),
        ..Default::default()
    }
}

pub fn ints_attribute(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: Some(name.to_string()),
        r#type: Some(AttributeType::Ints as i32),
        ints: values.to_vec(),
        ..Default::default()
    }
}
