use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use log::debug;
use ndarray::{arr0, ArrayD, IxDyn};
use petgraph::graph::NodeIndex;
use petgraph::Graph;

use crate::onnx_format::{GraphProto, ModelProto, NodeProto};
use crate::operators::*;
use crate::tensor::{TensorData, TensorDataType, TensorShape};

use super::{default_opset, node_display_name, GraphError, NodeAttributes};

/// A node of the executable graph.
#[derive(Debug, Clone)]
pub struct RuntimeNode {
    /// Node name, or the graph value name for inputs, outputs and initializers.
    pub name: String,
    pub operator: Operator,
    /// Names of the consumed values, by input slot. Omitted optional inputs are empty.
    pub inputs: Vec<String>,
    /// Name of the produced value.
    pub output: String,
}

/// The data flowing from a producer to the input `slot` of its consumer.
#[derive(Debug)]
pub struct ValueEdge {
    pub slot: usize,
    pub data: RefCell<Option<TensorData>>,
}

impl ValueEdge {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            data: RefCell::new(None),
        }
    }
}

pub type RuntimeGraph = Graph<RuntimeNode, ValueEdge>;

/// Where a value of the ONNX graph comes from.
enum ValueSource {
    /// First output of a runtime node.
    Node(NodeIndex),
    /// Additional output of a node, which cannot be consumed.
    Secondary { node: String, slot: usize },
}

/// This function creates an executable graph from a parsed ONNX model.
/// It returns a [`RuntimeGraph`] that can be used to execute the ONNX model with the [`Session`](crate::session::Session).
/// It returns a [`GraphError`] if the conversion fails.
pub fn create_graph(model_proto: &ModelProto) -> Result<RuntimeGraph, GraphError> {
    let graph_proto = model_proto.graph.as_ref().ok_or(GraphError::MissingGraph)?;
    let opset = default_opset(model_proto).unwrap_or(13);
    let mut translator = Translator::default();

    for initializer in &graph_proto.initializer {
        let name = initializer.name.clone().unwrap_or_default();
        let data = TensorData::try_from(initializer)?;
        translator.add_source(name, Operator::Constant(data))?;
    }

    let initializer_names: HashSet<&str> = graph_proto
        .initializer
        .iter()
        .filter_map(|i| i.name.as_deref())
        .collect();
    for input in &graph_proto.input {
        let name = input.name.clone().unwrap_or_default();
        // initializers listed as inputs keep their stored value
        if initializer_names.contains(name.as_str()) {
            continue;
        }
        let shape = TensorShape::try_from(input)?;
        translator.add_source(name, Operator::InputFeed(shape))?;
    }

    for (position, node) in graph_proto.node.iter().enumerate() {
        let name = node_display_name(node, position);
        let operator = translate_node(node, &name, opset)?;
        debug!("Translated node {} into {}", name, operator.name());
        translator.add_node(node, name, operator)?;
    }

    translator.add_outputs(graph_proto)?;
    Ok(translator.graph)
}

#[derive(Default)]
struct Translator {
    graph: RuntimeGraph,
    values: HashMap<String, ValueSource>,
}

impl Translator {
    fn define(&mut self, value: String, source: ValueSource) -> Result<(), GraphError> {
        if value.is_empty() {
            return Ok(());
        }
        if self.values.contains_key(&value) {
            return Err(GraphError::DuplicateValue(value));
        }
        self.values.insert(value, source);
        Ok(())
    }

    fn add_source(&mut self, name: String, operator: Operator) -> Result<(), GraphError> {
        let index = self.graph.add_node(RuntimeNode {
            name: name.clone(),
            operator,
            inputs: Vec::new(),
            output: name.clone(),
        });
        self.define(name, ValueSource::Node(index))
    }

    fn connect(&mut self, consumer: NodeIndex, slot: usize, value: &str) -> Result<(), GraphError> {
        let consumer_name = self.graph[consumer].name.clone();
        match self.values.get(value) {
            Some(ValueSource::Node(producer)) => {
                self.graph.add_edge(*producer, consumer, ValueEdge::new(slot));
                Ok(())
            }
            Some(ValueSource::Secondary { node, slot }) => Err(GraphError::UnsupportedOutput {
                node: node.clone(),
                value: value.to_string(),
                slot: *slot,
            }),
            None => Err(GraphError::ParentNotFound {
                node: consumer_name,
                input: value.to_string(),
            }),
        }
    }

    fn add_node(
        &mut self,
        node: &NodeProto,
        name: String,
        operator: Operator,
    ) -> Result<(), GraphError> {
        let output = node.output.first().cloned().unwrap_or_default();
        let index = self.graph.add_node(RuntimeNode {
            name: name.clone(),
            operator,
            inputs: node.input.clone(),
            output: output.clone(),
        });

        for (slot, input) in node.input.iter().enumerate() {
            if !input.is_empty() {
                self.connect(index, slot, input)?;
            }
        }

        self.define(output, ValueSource::Node(index))?;
        for (slot, extra) in node.output.iter().enumerate().skip(1) {
            self.define(
                extra.clone(),
                ValueSource::Secondary {
                    node: name.clone(),
                    slot,
                },
            )?;
        }
        Ok(())
    }

    fn add_outputs(&mut self, graph_proto: &GraphProto) -> Result<(), GraphError> {
        for output in &graph_proto.output {
            let shape = TensorShape::try_from(output)?;
            let name = shape.name.clone();
            if !self.values.contains_key(&name) {
                return Err(GraphError::OutputNotFound(name));
            }
            let index = self.graph.add_node(RuntimeNode {
                name: name.clone(),
                operator: Operator::OutputCollector(shape),
                inputs: vec![name.clone()],
                output: name.clone(),
            });
            self.connect(index, 0, &name)?;
        }
        Ok(())
    }
}

fn translate_node(node: &NodeProto, name: &str, opset: i64) -> Result<Operator, GraphError> {
    let op_type = node.op_type.clone().unwrap_or_default();
    let attrs = NodeAttributes::new(node, name);

    let operator = match op_type.as_str() {
        "Conv" => {
            let kernel_shape = match attrs.has("kernel_shape") {
                true => Some(attrs.usize_array("kernel_shape", [1, 1])?),
                false => None,
            };
            Operator::Convolution(ConvAttributes {
                auto_pad: auto_pad(&attrs)?,
                dilations: attrs.usize_array("dilations", [1, 1])?,
                group: attrs.int("group").unwrap_or(1).max(1) as usize,
                kernel_shape,
                pads: attrs.usize_array("pads", [0; 4])?,
                strides: attrs.usize_array("strides", [1, 1])?,
            })
        }
        "MaxPool" | "AveragePool" => {
            if attrs.int("ceil_mode").unwrap_or(0) != 0 {
                return Err(attrs.invalid("ceil_mode", "only floor rounding is supported"));
            }
            if !attrs.has("kernel_shape") {
                return Err(attrs.missing("kernel_shape"));
            }
            if attrs.usize_array("dilations", [1, 1])? != [1, 1] {
                return Err(attrs.invalid("dilations", "dilated pooling is not supported"));
            }
            let pool = PoolAttributes {
                auto_pad: auto_pad(&attrs)?,
                kernel_shape: attrs.usize_array("kernel_shape", [1, 1])?,
                pads: attrs.usize_array("pads", [0; 4])?,
                strides: attrs.usize_array("strides", [1, 1])?,
                count_include_pad: attrs.int("count_include_pad").unwrap_or(0) != 0,
            };
            if op_type == "MaxPool" {
                Operator::MaxPool(pool)
            } else {
                Operator::AveragePool(pool)
            }
        }
        "GlobalAveragePool" => Operator::GlobalAveragePool,
        "BatchNormalization" => Operator::BatchNorm(BatchNormAttributes::new(
            attrs.float("epsilon").unwrap_or(1e-5),
            attrs.float("momentum").unwrap_or(0.9),
        )),
        "Gemm" => Operator::Gemm(GemmAttributes::new(
            attrs.float("alpha").unwrap_or(1.0),
            attrs.float("beta").unwrap_or(1.0),
            attrs.int("transA").unwrap_or(0) != 0,
            attrs.int("transB").unwrap_or(0) != 0,
        )),
        "MatMul" => Operator::MatMul,
        "Add" => Operator::Add,
        "Sub" => Operator::Sub,
        "Mul" => Operator::Mul,
        "Div" => Operator::Div,
        "Relu" => Operator::ReLU,
        "LeakyRelu" => Operator::LeakyReLU(attrs.float("alpha").unwrap_or(0.01)),
        "Sigmoid" => Operator::Sigmoid,
        "Tanh" => Operator::Tanh,
        "Softmax" => {
            let default_axis = if opset < 13 { 1 } else { -1 };
            Operator::Softmax(attrs.int("axis").unwrap_or(default_axis))
        }
        "Clip" => {
            let defaults = ClipAttributes::default();
            Operator::Clip(ClipAttributes::new(
                attrs.float("min").unwrap_or(defaults.min),
                attrs.float("max").unwrap_or(defaults.max),
            ))
        }
        "Reshape" => {
            if attrs.int("allowzero").unwrap_or(0) != 0 {
                return Err(attrs.invalid("allowzero", "only allowzero = 0 is supported"));
            }
            Operator::Reshape
        }
        "Flatten" => Operator::Flatten(attrs.int("axis").unwrap_or(1)),
        "Transpose" => {
            let perm = match attrs.ints("perm") {
                Some(perm) => Some(
                    perm.into_iter()
                        .map(usize::try_from)
                        .collect::<Result<Vec<usize>, _>>()
                        .map_err(|_| attrs.invalid("perm", "negative axis"))?,
                ),
                None => None,
            };
            Operator::Transpose(perm)
        }
        "Concat" => Operator::Concat(attrs.required_int("axis")?),
        "Squeeze" => Operator::Squeeze(attrs.ints("axes")),
        "Unsqueeze" => Operator::Unsqueeze(attrs.ints("axes")),
        "Shape" => {
            if attrs.has("start") || attrs.has("end") {
                return Err(attrs.invalid("start", "slicing the shape is not supported"));
            }
            Operator::Shape
        }
        "Gather" => Operator::Gather(attrs.int("axis").unwrap_or(0)),
        "Cast" => {
            let to = attrs.required_int("to")?;
            let data_type = i32::try_from(to)
                .ok()
                .and_then(TensorDataType::from_proto)
                .ok_or_else(|| attrs.invalid("to", format!("unknown data type {}", to)))?;
            Operator::Cast(data_type)
        }
        "Identity" | "Dropout" => Operator::Identity,
        "Constant" => Operator::Constant(constant_value(&attrs)?),
        _ => {
            return Err(GraphError::UnsupportedOperator {
                node: name.to_string(),
                op_type,
            })
        }
    };
    Ok(operator)
}

fn auto_pad(attrs: &NodeAttributes) -> Result<AutoPad, GraphError> {
    match attrs.string("auto_pad") {
        Some(value) => value
            .parse()
            .map_err(|reason: String| attrs.invalid("auto_pad", reason)),
        None => Ok(AutoPad::NotSet),
    }
}

fn constant_value(attrs: &NodeAttributes) -> Result<TensorData, GraphError> {
    if let Some(tensor) = attrs.tensor("value") {
        return Ok(TensorData::try_from(tensor)?);
    }
    if let Some(value) = attrs.float("value_float") {
        return Ok(TensorData::Float(arr0(value).into_dyn()));
    }
    if let Some(value) = attrs.int("value_int") {
        return Ok(TensorData::Int64(arr0(value).into_dyn()));
    }
    if let Some(values) = attrs.floats("value_floats") {
        let len = values.len();
        return ArrayD::from_shape_vec(IxDyn(&[len]), values)
            .map(TensorData::Float)
            .map_err(|e| attrs.invalid("value_floats", e.to_string()));
    }
    if let Some(values) = attrs.ints("value_ints") {
        let len = values.len();
        return ArrayD::from_shape_vec(IxDyn(&[len]), values)
            .map(TensorData::Int64)
            .map_err(|e| attrs.invalid("value_ints", e.to_string()));
    }
    Err(attrs.missing("value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::{
        attribute_proto::AttributeType, tensor_shape_proto, type_proto, AttributeProto,
        OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
    };

    fn value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
        ValueInfoProto {
            name: Some(name.to_string()),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: Some(TensorDataType::Float as i32),
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|d| tensor_shape_proto::Dimension {
                                value: Some(tensor_shape_proto::dimension::Value::DimValue(*d)),
                                ..Default::default()
                            })
                            .collect(),
                    }),
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
        NodeProto {
            op_type: Some(op_type.to_string()),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn model(nodes: Vec<NodeProto>, initializer: Vec<TensorProto>) -> ModelProto {
        ModelProto {
            ir_version: Some(8),
            opset_import: vec![OperatorSetIdProto {
                domain: None,
                version: Some(13),
            }],
            graph: Some(GraphProto {
                node: nodes,
                initializer,
                input: vec![value_info("x", &[1, 4])],
                output: vec![value_info("y", &[1, 4])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn initializers_and_io_become_graph_nodes() {
        let bias = TensorProto {
            name: Some(String::from("b")),
            dims: vec![4],
            data_type: Some(TensorDataType::Float as i32),
            float_data: vec![1.0; 4],
            ..Default::default()
        };
        let graph = create_graph(&model(
            vec![node("Add", &["x", "b"], &["sum"]), node("Relu", &["sum"], &["y"])],
            vec![bias],
        ))
        .unwrap();
        // b, x, Add, Relu, y
        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 4);
        let add = graph
            .node_indices()
            .find(|i| graph[*i].name == "Add_0")
            .unwrap();
        let mut slots: Vec<usize> = graph
            .edges_directed(add, petgraph::Direction::Incoming)
            .map(|e| e.weight().slot)
            .collect();
        slots.sort();
        assert_eq!(slots, vec![0, 1]);
    }

    #[test]
    fn unknown_operators_are_rejected() {
        let result = create_graph(&model(vec![node("Einsum", &["x"], &["y"])], vec![]));
        assert!(matches!(
            result,
            Err(GraphError::UnsupportedOperator { op_type, .. }) if op_type == "Einsum"
        ));
    }

    #[test]
    fn missing_parents_are_reported() {
        let result = create_graph(&model(vec![node("Relu", &["z"], &["y"])], vec![]));
        assert!(matches!(result, Err(GraphError::ParentNotFound { input, .. }) if input == "z"));
    }

    #[test]
    fn secondary_outputs_cannot_be_consumed() {
        let result = create_graph(&model(
            vec![
                node("Dropout", &["x"], &["d", "mask"]),
                node("Relu", &["mask"], &["y"]),
            ],
            vec![],
        ));
        assert!(matches!(result, Err(GraphError::UnsupportedOutput { slot: 1, .. })));
    }

    #[test]
    fn conv_attributes_are_read_by_name() {
        let mut conv = node("Conv", &["x", "w"], &["y"]);
        conv.attribute = vec![
            AttributeProto {
                name: Some(String::from("auto_pad")),
                r#type: Some(AttributeType::String as i32),
                s: Some(b"SAME_UPPER".to_vec()),
                ..Default::default()
            },
            AttributeProto {
                name: Some(String::from("strides")),
                r#type: Some(AttributeType::Ints as i32),
                ints: vec![2, 2],
                ..Default::default()
            },
        ];
        let Operator::Convolution(attrs) = translate_node(&conv, "conv", 13).unwrap() else {
            panic!("expected a convolution");
        };
        assert_eq!(attrs.auto_pad, AutoPad::SameUpper);
        assert_eq!(attrs.strides, [2, 2]);
        assert_eq!(attrs.dilations, [1, 1]);
        assert_eq!(attrs.kernel_shape, None);
    }

    #[test]
    fn softmax_default_axis_follows_the_opset() {
        let softmax = node("Softmax", &["x"], &["y"]);
        assert!(matches!(translate_node(&softmax, "s", 11).unwrap(), Operator::Softmax(1)));
        assert!(matches!(translate_node(&softmax, "s", 13).unwrap(), Operator::Softmax(-1)));
    }
}
