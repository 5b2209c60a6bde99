///
/// # Graph
///
/// This module defines the mapping between the ONNX standard and the graph structure used to execute an ONNX model.
///
mod attribute;
mod translator;

pub use attribute::*;
pub use translator::*;

use thiserror::Error;

use crate::tensor::TensorError;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("the model does not contain a graph")]
    MissingGraph,

    #[error("unsupported operator {op_type} (node {node})")]
    UnsupportedOperator { node: String, op_type: String },

    #[error("attribute {attribute} is required by node {node}")]
    MissingAttribute { node: String, attribute: String },

    #[error("attribute {attribute} of node {node} is invalid: {reason}")]
    InvalidAttribute {
        node: String,
        attribute: String,
        reason: String,
    },

    #[error("input {input} of node {node} is not produced by any node, initializer or graph input")]
    ParentNotFound { node: String, input: String },

    #[error("value {value} (output #{slot} of node {node}) is consumed, but only the first output of a node can be used")]
    UnsupportedOutput {
        node: String,
        value: String,
        slot: usize,
    },

    #[error("value {0} is defined more than once")]
    DuplicateValue(String),

    #[error("graph output {0} is not produced by the graph")]
    OutputNotFound(String),

    #[error(transparent)]
    InvalidTensor(#[from] TensorError),
}
