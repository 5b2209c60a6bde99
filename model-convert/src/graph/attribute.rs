//! Name-based access to the attributes of an ONNX node.
use crate::onnx_format::{AttributeProto, ModelProto, NodeProto, TensorProto};

use super::GraphError;

/// Version of the default (`ai.onnx`) operator set imported by the model.
pub fn default_opset(model: &ModelProto) -> Option<i64> {
    model
        .opset_import
        .iter()
        .find(|opset| matches!(opset.domain.as_deref(), None | Some("") | Some("ai.onnx")))
        .and_then(|opset| opset.version)
}

/// Name used to report a node: its own name, or `<op_type>_<position>` for anonymous nodes.
pub fn node_display_name(node: &NodeProto, position: usize) -> String {
    match node.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{}_{}", node.op_type.as_deref().unwrap_or("node"), position),
    }
}

/// A node together with the name used in error messages.
pub struct NodeAttributes<'a> {
    pub node: &'a NodeProto,
    pub name: &'a str,
}

impl<'a> NodeAttributes<'a> {
    pub fn new(node: &'a NodeProto, name: &'a str) -> Self {
        Self { node, name }
    }

    pub fn get(&self, attribute: &str) -> Option<&'a AttributeProto> {
        self.node
            .attribute
            .iter()
            .find(|a| a.name.as_deref() == Some(attribute))
    }

    pub fn has(&self, attribute: &str) -> bool {
        self.get(attribute).is_some()
    }

    pub fn int(&self, attribute: &str) -> Option<i64> {
        self.get(attribute).and_then(|a| a.i)
    }

    pub fn float(&self, attribute: &str) -> Option<f32> {
        self.get(attribute).and_then(|a| a.f)
    }

    pub fn ints(&self, attribute: &str) -> Option<Vec<i64>> {
        self.get(attribute).map(|a| a.ints.clone())
    }

    pub fn floats(&self, attribute: &str) -> Option<Vec<f32>> {
        self.get(attribute).map(|a| a.floats.clone())
    }

    pub fn string(&self, attribute: &str) -> Option<String> {
        self.get(attribute)
            .and_then(|a| a.s.as_ref())
            .map(|s| String::from_utf8_lossy(s).into_owned())
    }

    pub fn tensor(&self, attribute: &str) -> Option<&'a TensorProto> {
        self.get(attribute).and_then(|a| a.t.as_ref())
    }

    pub fn required_int(&self, attribute: &str) -> Result<i64, GraphError> {
        self.int(attribute).ok_or_else(|| self.missing(attribute))
    }

    pub fn missing(&self, attribute: &str) -> GraphError {
        GraphError::MissingAttribute {
            node: self.name.to_string(),
            attribute: attribute.to_string(),
        }
    }

    pub fn invalid(&self, attribute: &str, reason: impl Into<String>) -> GraphError {
        GraphError::InvalidAttribute {
            node: self.name.to_string(),
            attribute: attribute.to_string(),
            reason: reason.into(),
        }
    }

    /// Reads a list of non-negative integers with a fixed length, e.g. 2D strides.
    pub fn usize_array<const N: usize>(
        &self,
        attribute: &str,
        default: [usize; N],
    ) -> Result<[usize; N], GraphError> {
        let Some(values) = self.ints(attribute) else {
            return Ok(default);
        };
        if values.len() != N {
            return Err(self.invalid(
                attribute,
                format!("expected {} values, found {}", N, values.len()),
            ));
        }
        let mut result = [0usize; N];
        for (slot, value) in result.iter_mut().zip(values) {
            *slot = usize::try_from(value)
                .map_err(|_| self.invalid(attribute, "negative values are not allowed"))?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::{attribute_proto::AttributeType, OperatorSetIdProto};

    fn ints_attribute(name: &str, ints: Vec<i64>) -> AttributeProto {
        AttributeProto {
            name: Some(name.to_string()),
            r#type: Some(AttributeType::Ints as i32),
            ints,
            ..Default::default()
        }
    }

    #[test]
    fn attributes_are_found_by_name() {
        let node = NodeProto {
            op_type: Some(String::from("Conv")),
            attribute: vec![
                ints_attribute("strides", vec![2, 2]),
                ints_attribute("pads", vec![1, 1, 1, 1]),
            ],
            ..Default::default()
        };
        let attrs = NodeAttributes::new(&node, "conv");
        assert_eq!(attrs.usize_array("pads", [0; 4]).unwrap(), [1, 1, 1, 1]);
        assert_eq!(attrs.usize_array("strides", [1, 1]).unwrap(), [2, 2]);
        assert_eq!(attrs.usize_array("dilations", [1, 1]).unwrap(), [1, 1]);
        assert!(attrs.usize_array::<3>("strides", [1, 1, 1]).is_err());
        assert!(matches!(
            attrs.required_int("group"),
            Err(GraphError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn anonymous_nodes_are_named_after_their_position() {
        let node = NodeProto {
            op_type: Some(String::from("Relu")),
            ..Default::default()
        };
        assert_eq!(node_display_name(&node, 3), "Relu_3");
    }

    #[test]
    fn default_opset_ignores_other_domains() {
        let model = ModelProto {
            opset_import: vec![
                OperatorSetIdProto {
                    domain: Some(String::from("ai.onnx.ml")),
                    version: Some(3),
                },
                OperatorSetIdProto {
                    domain: Some(String::new()),
                    version: Some(13),
                },
            ],
            ..Default::default()
        };
        assert_eq!(default_opset(&model), Some(13));
    }
}
