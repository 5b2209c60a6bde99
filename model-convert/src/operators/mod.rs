///
/// # Operators
///
/// This module defines the ONNX operators structures.
///
/// It covers the subset of operators emitted when exporting common Keras and
/// convolutional models, plus the shape arithmetic that usually surrounds them.
///
mod attributes;
mod shape;

pub use attributes::*;
pub use shape::*;

use thiserror::Error;

use crate::tensor::{TensorData, TensorDataType, TensorShape};

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("expected a tensor with {0} dimensions, found {1}")]
    WrongDim(usize, usize),
    #[error("expected shape {0}, found {1}")]
    WrongShape(String, String),
    #[error("shapes {0} and {1} are not compatible")]
    UnexpectedShape(String, String),
    #[error("operator {0} received an invalid tensor type for operand {1}")]
    InvalidTensorType(String, String),
    #[error("operator {0} is missing its input #{1}")]
    MissingInput(String, usize),
    #[error("the graph input requires shape {0:?}, but {1:?} was fed")]
    UnexpectedInputShape(Vec<String>, Vec<usize>),
    #[error("invalid attribute for operator {0}: {1}")]
    InvalidAttribute(String, String),
}

/// An executable operation of the runtime graph.
#[derive(Debug, Clone, strum::IntoStaticStr)]
pub enum Operator {
    /// Source node fed by the caller with the graph input of the same name.
    InputFeed(TensorShape),
    /// Sink node collecting one of the graph outputs.
    OutputCollector(TensorShape),
    /// Initializers and `Constant` nodes.
    Constant(TensorData),
    Convolution(ConvAttributes),
    MaxPool(PoolAttributes),
    AveragePool(PoolAttributes),
    GlobalAveragePool,
    BatchNorm(BatchNormAttributes),
    Gemm(GemmAttributes),
    MatMul,
    Add,
    Sub,
    Mul,
    Div,
    ReLU,
    LeakyReLU(f32),
    Sigmoid,
    Tanh,
    Softmax(i64),
    Clip(ClipAttributes),
    Reshape,
    Flatten(i64),
    Transpose(Option<Vec<usize>>),
    Concat(i64),
    Squeeze(Option<Vec<i64>>),
    Unsqueeze(Option<Vec<i64>>),
    Shape,
    Gather(i64),
    Cast(TensorDataType),
    /// `Identity`, and `Dropout` in inference mode.
    Identity,
}

impl Operator {
    pub fn name(&self) -> String {
        let name: &'static str = self.into();
        String::from(name)
    }
}
