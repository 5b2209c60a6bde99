///
/// # Checker
///
/// Structural validation of ONNX models: versions, graph well-formedness (single
/// assignment, topological order), operator arity and attribute typing, and
/// initializer payloads.
///
mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use crate::graph::{default_opset, node_display_name};
use crate::onnx_format::{
    attribute_proto::AttributeType, read_model_proto, type_proto, AttributeProto, ModelProto,
    ModelReadError, NodeProto, TensorProto, ValueInfoProto,
};
use crate::tensor::TensorDataType;

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("the model could not be decoded: {0}")]
    Unreadable(#[from] ModelReadError),
    #[error(
        "unsupported IR version {0:?}, expected {min}..={max}",
        min = MIN_IR_VERSION,
        max = MAX_IR_VERSION
    )]
    InvalidIrVersion(Option<i64>),
    #[error("the model does not import the default operator set")]
    MissingOpsetImport,
    #[error("unsupported opset version {0}, expected 1..={max}", max = MAX_OPSET_VERSION)]
    InvalidOpsetVersion(i64),
    #[error("the model does not contain a graph")]
    MissingGraph,
    #[error("the graph does not declare any output")]
    NoGraphOutputs,
    #[error("node {0} has no op_type")]
    MissingOpType(String),
    #[error("attribute {attribute} of node {node} is invalid: {reason}")]
    InvalidAttribute {
        node: String,
        attribute: String,
        reason: String,
    },
    #[error("node {node} ({op_type}) has {actual} inputs, expected {expected}")]
    WrongInputCount {
        node: String,
        op_type: String,
        expected: String,
        actual: usize,
    },
    #[error("node {node} ({op_type}) is missing the required attribute {attribute}")]
    MissingAttribute {
        node: String,
        op_type: String,
        attribute: String,
    },
    #[error("{0} is defined more than once")]
    DuplicateDefinition(String),
    #[error("input {input} of node {node} is used before being defined (nodes must be topologically sorted)")]
    UndefinedInput { node: String, input: String },
    #[error("graph output {0} is never defined")]
    UndefinedOutput(String),
    #[error("initializer {name} is invalid: {reason}")]
    InvalidInitializer { name: String, reason: String },
    #[error("graph value {name} is invalid: {reason}")]
    InvalidValueInfo { name: String, reason: String },
}

/// Reads and checks the model at `path`.
pub fn check_model<P: AsRef<Path>>(path: P) -> Result<(), CheckError> {
    let path = path.as_ref();
    let model = read_model_proto(path)?;
    check_model_proto(&model)?;
    info!("ONNX check passed for {}", path.display());
    Ok(())
}

pub fn check_model_proto(model: &ModelProto) -> Result<(), CheckError> {
    match model.ir_version {
        Some(v) if (MIN_IR_VERSION..=MAX_IR_VERSION).contains(&v) => {}
        other => return Err(CheckError::InvalidIrVersion(other)),
    }

    let opset = default_opset(model).ok_or(CheckError::MissingOpsetImport)?;
    if !(1..=MAX_OPSET_VERSION).contains(&opset) {
        return Err(CheckError::InvalidOpsetVersion(opset));
    }

    let graph = model.graph.as_ref().ok_or(CheckError::MissingGraph)?;
    if graph.output.is_empty() {
        return Err(CheckError::NoGraphOutputs);
    }

    let mut defined: HashSet<&str> = HashSet::new();
    for initializer in &graph.initializer {
        check_initializer(initializer)?;
        let name = initializer.name.as_deref().unwrap_or_default();
        if !defined.insert(name) {
            return Err(CheckError::DuplicateDefinition(name.to_string()));
        }
    }
    let initializers = defined.clone();
    for input in &graph.input {
        check_value_info(input)?;
        let name = input.name.as_deref().unwrap_or_default();
        // an initializer may also be declared as a graph input
        if !defined.insert(name) && !initializers.contains(name) {
            return Err(CheckError::DuplicateDefinition(name.to_string()));
        }
    }

    for (position, node) in graph.node.iter().enumerate() {
        let node_name = node_display_name(node, position);
        check_node(node, &node_name)?;
        for input in node.input.iter().filter(|i| !i.is_empty()) {
            if !defined.contains(input.as_str()) {
                return Err(CheckError::UndefinedInput {
                    node: node_name,
                    input: input.clone(),
                });
            }
        }
        for output in node.output.iter().filter(|o| !o.is_empty()) {
            if !defined.insert(output.as_str()) {
                return Err(CheckError::DuplicateDefinition(output.clone()));
            }
        }
    }

    for output in &graph.output {
        check_value_info(output)?;
        let name = output.name.as_deref().unwrap_or_default();
        if !defined.contains(name) {
            return Err(CheckError::UndefinedOutput(name.to_string()));
        }
    }

    debug!(
        "Checked {} nodes and {} initializers against opset {}",
        graph.node.len(),
        graph.initializer.len(),
        opset
    );
    Ok(())
}

fn check_node(node: &NodeProto, node_name: &str) -> Result<(), CheckError> {
    let op_type = match node.op_type.as_deref() {
        Some(op_type) if !op_type.is_empty() => op_type,
        _ => return Err(CheckError::MissingOpType(node_name.to_string())),
    };

    for attribute in &node.attribute {
        check_attribute(attribute, node_name)?;
    }

    // custom domains are not described by the schema table
    if !matches!(node.domain.as_deref(), None | Some("") | Some("ai.onnx")) {
        return Ok(());
    }
    let Some(schema) = OPERATOR_SCHEMAS.get(op_type) else {
        return Ok(());
    };

    // trailing optional inputs may be omitted with an empty name
    let input_count = node
        .input
        .iter()
        .rposition(|i| !i.is_empty())
        .map_or(0, |last| last + 1);
    if !schema.accepts_inputs(input_count) {
        let expected = if schema.max_inputs == usize::MAX {
            format!("at least {}", schema.min_inputs)
        } else if schema.min_inputs == schema.max_inputs {
            schema.min_inputs.to_string()
        } else {
            format!("{} to {}", schema.min_inputs, schema.max_inputs)
        };
        return Err(CheckError::WrongInputCount {
            node: node_name.to_string(),
            op_type: op_type.to_string(),
            expected,
            actual: input_count,
        });
    }

    let has = |name: &str| node.attribute.iter().any(|a| a.name.as_deref() == Some(name));
    for attribute in schema.required_attributes {
        if !has(attribute) {
            return Err(CheckError::MissingAttribute {
                node: node_name.to_string(),
                op_type: op_type.to_string(),
                attribute: attribute.to_string(),
            });
        }
    }
    if op_type == "Constant" {
        let values = CONSTANT_VALUE_ATTRIBUTES.iter().filter(|a| has(a)).count();
        if values != 1 {
            return Err(CheckError::MissingAttribute {
                node: node_name.to_string(),
                op_type: op_type.to_string(),
                attribute: String::from("exactly one value attribute"),
            });
        }
    }
    Ok(())
}

fn check_attribute(attribute: &AttributeProto, node_name: &str) -> Result<(), CheckError> {
    let name = attribute.name.clone().unwrap_or_default();
    let invalid = |reason: &str| CheckError::InvalidAttribute {
        node: node_name.to_string(),
        attribute: name.clone(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("the attribute has no name"));
    }
    // attributes referring to a parent function attribute carry no value
    if attribute.ref_attr_name.is_some() {
        return Ok(());
    }
    let attribute_type = attribute
        .r#type
        .and_then(|t| AttributeType::try_from(t).ok())
        .unwrap_or(AttributeType::Undefined);
    let populated = match attribute_type {
        AttributeType::Undefined => return Err(invalid("the attribute type is undefined")),
        AttributeType::Float => attribute.f.is_some(),
        AttributeType::Int => attribute.i.is_some(),
        AttributeType::String => attribute.s.is_some(),
        AttributeType::Tensor => attribute.t.is_some(),
        AttributeType::Graph => attribute.g.is_some(),
        // repeated fields may legitimately be empty
        _ => true,
    };
    if !populated {
        return Err(invalid(&format!(
            "declared as {:?} but the matching value is missing",
            attribute_type
        )));
    }
    Ok(())
}

fn check_initializer(tensor: &TensorProto) -> Result<(), CheckError> {
    let name = tensor.name.clone().unwrap_or_default();
    let invalid = |reason: String| CheckError::InvalidInitializer {
        name: name.clone(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid(String::from("initializers must have a name")));
    }
    let data_type = tensor
        .data_type
        .and_then(TensorDataType::from_proto)
        .ok_or_else(|| invalid(format!("undefined element type {:?}", tensor.data_type)))?;
    if tensor.dims.iter().any(|d| *d < 0) {
        return Err(invalid(format!("negative dimension in {:?}", tensor.dims)));
    }
    // data_location = EXTERNAL
    if tensor.data_location == Some(1) {
        return Ok(());
    }

    let elements = tensor
        .dims
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(usize::try_from(*d).ok()?))
        .ok_or_else(|| invalid(format!("dimensions {:?} overflow", tensor.dims)))?;
    if let Some(raw) = &tensor.raw_data {
        if let Some(size) = data_type.element_size() {
            let bytes = elements
                .checked_mul(size)
                .ok_or_else(|| invalid(format!("dimensions {:?} overflow", tensor.dims)))?;
            if raw.len() != bytes {
                return Err(invalid(format!(
                    "raw_data holds {} bytes, {} expected",
                    raw.len(),
                    bytes
                )));
            }
        }
        return Ok(());
    }

    let stored = match data_type {
        TensorDataType::Float => tensor.float_data.len(),
        TensorDataType::Complex64 => tensor.float_data.len() / 2,
        TensorDataType::Double => tensor.double_data.len(),
        TensorDataType::Complex128 => tensor.double_data.len() / 2,
        TensorDataType::Int64 => tensor.int64_data.len(),
        TensorDataType::Uint32 | TensorDataType::Uint64 => tensor.uint64_data.len(),
        TensorDataType::String => tensor.string_data.len(),
        _ => tensor.int32_data.len(),
    };
    if stored != elements {
        return Err(invalid(format!(
            "{} elements stored, {} expected from dims {:?}",
            stored, elements, tensor.dims
        )));
    }
    Ok(())
}

fn check_value_info(value: &ValueInfoProto) -> Result<(), CheckError> {
    let name = value.name.clone().unwrap_or_default();
    let invalid = |reason: &str| CheckError::InvalidValueInfo {
        name: name.clone(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("graph inputs and outputs must have a name"));
    }
    match value.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(type_proto::Value::TensorType(tensor)) => {
            match tensor.elem_type.and_then(TensorDataType::from_proto) {
                Some(_) => Ok(()),
                None => Err(invalid("the tensor element type is undefined")),
            }
        }
        None => Err(invalid("the value has no type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::{GraphProto, OperatorSetIdProto, TypeProto};

    fn value_info(name: &str) -> ValueInfoProto {
        ValueInfoProto {
            name: Some(name.to_string()),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: Some(TensorDataType::Float as i32),
                    shape: None,
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(op_type: &str, inputs: &[&str], output: &str) -> NodeProto {
        NodeProto {
            op_type: Some(op_type.to_string()),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            ..Default::default()
        }
    }

    fn weights(name: &str, dims: Vec<i64>, values: usize) -> TensorProto {
        TensorProto {
            name: Some(name.to_string()),
            dims,
            data_type: Some(TensorDataType::Float as i32),
            float_data: vec![0.5; values],
            ..Default::default()
        }
    }

    fn model(nodes: Vec<NodeProto>, initializer: Vec<TensorProto>) -> ModelProto {
        ModelProto {
            ir_version: Some(8),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(13),
            }],
            graph: Some(GraphProto {
                node: nodes,
                initializer,
                input: vec![value_info("x")],
                output: vec![value_info("y")],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn valid_model() -> ModelProto {
        model(
            vec![
                node("MatMul", &["x", "w"], "h"),
                node("Relu", &["h"], "y"),
            ],
            vec![weights("w", vec![4, 2], 8)],
        )
    }

    #[test]
    fn accepts_a_well_formed_model() {
        check_model_proto(&valid_model()).unwrap();
    }

    #[test]
    fn rejects_unsorted_nodes() {
        let mut model = valid_model();
        model.graph.as_mut().unwrap().node.reverse();
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::UndefinedInput { input, .. }) if input == "h"
        ));
    }

    #[test]
    fn rejects_duplicate_definitions() {
        let model = model(
            vec![
                node("Relu", &["x"], "h"),
                node("Relu", &["x"], "h"),
                node("Relu", &["h"], "y"),
            ],
            vec![],
        );
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::DuplicateDefinition(name)) if name == "h"
        ));
    }

    #[test]
    fn rejects_missing_required_attributes() {
        let model = model(vec![node("Concat", &["x", "x"], "y")], vec![]);
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::MissingAttribute { attribute, .. }) if attribute == "axis"
        ));
    }

    #[test]
    fn rejects_wrong_arity() {
        let model = model(vec![node("Add", &["x"], "y")], vec![]);
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::WrongInputCount { actual: 1, .. })
        ));
    }

    #[test]
    fn rejects_inconsistent_initializer_payloads() {
        let model = model(
            vec![node("MatMul", &["x", "w"], "y")],
            vec![weights("w", vec![4, 2], 7)],
        );
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::InvalidInitializer { name, .. }) if name == "w"
        ));
    }

    #[test]
    fn rejects_overflowing_initializer_dims() {
        let huge = 1i64 << 32;
        let model = model(
            vec![node("MatMul", &["x", "w"], "y")],
            vec![weights("w", vec![huge, huge, huge], 0)],
        );
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::InvalidInitializer { name, .. }) if name == "w"
        ));

        let mut raw = weights("w", vec![1 << 62, 2], 0);
        raw.raw_data = Some(Vec::new());
        let model = self::model(vec![node("MatMul", &["x", "w"], "y")], vec![raw]);
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::InvalidInitializer { name, .. }) if name == "w"
        ));
    }

    #[test]
    fn rejects_attribute_type_mismatch() {
        let mut flatten = node("Flatten", &["x"], "y");
        flatten.attribute.push(AttributeProto {
            name: Some(String::from("axis")),
            r#type: Some(AttributeType::Int as i32),
            f: Some(1.0),
            ..Default::default()
        });
        let model = model(vec![flatten], vec![]);
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::InvalidAttribute { attribute, .. }) if attribute == "axis"
        ));
    }

    #[test]
    fn rejects_missing_versions_and_outputs() {
        let mut model = valid_model();
        model.ir_version = None;
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::InvalidIrVersion(None))
        ));

        let mut model = valid_model();
        model.opset_import.clear();
        assert!(matches!(
            check_model_proto(&model),
            Err(CheckError::MissingOpsetImport)
        ));

        let mut model = valid_model();
        model.graph.as_mut().unwrap().output.clear();
        assert!(matches!(check_model_proto(&model), Err(CheckError::NoGraphOutputs)));
    }
}
