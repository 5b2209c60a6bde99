///
/// # ONNX Format
///
/// This module contains the ONNX format related code.
///
/// The ONNX format is defined in the [ONNX specification](https://github.com/onnx/onnx/blob/main/docs/IR.md).
///
/// The messages mirror the `onnx.proto` (proto2) definitions provided by the
/// [official ONNX repository](https://github.com/onnx/onnx), restricted to the
/// fields used to read, check, execute and re-emit models.
///
pub mod builder;
mod onnx_model;

pub use onnx_model::*;

use std::{fs, path::Path};

use prost::Message;

/// Read and decode an ONNX model from the given path.
pub fn read_model_proto<P>(path: P) -> Result<ModelProto, ModelReadError>
where
    P: AsRef<Path>,
{
    let buffer = fs::read(path.as_ref())?;
    Ok(ModelProto::decode(buffer.as_slice())?)
}

/// Encode an ONNX model and write it to the given path.
pub fn write_model_proto<P>(model: &ModelProto, path: P) -> std::io::Result<()>
where
    P: AsRef<Path>,
{
    fs::write(path, model.encode_to_vec())
}

#[derive(thiserror::Error, Debug)]
pub enum ModelReadError {
    #[error("could not read the model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("the model file is not a valid ONNX protobuf: {0}")]
    Decode(#[from] prost::DecodeError),
}
