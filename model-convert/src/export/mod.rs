///
/// # Export
///
/// Production of an ONNX file from a Keras model. The export itself is delegated to
/// an implementation of [`NativeExporter`]; [`Tf2OnnxExporter`] drives the Python
/// `tf2onnx` toolchain.
///
mod keras;

pub use keras::*;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::request::InputSignature;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("a dependency of the Keras exporter is missing: {0}")]
    MissingDependency(String),
    #[error("the Keras exporter failed (exit status {status:?}): {stderr}")]
    Failed { status: Option<i32>, stderr: String },
    #[error("the Keras exporter did not write {0}")]
    NoOutput(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Traces a native model and writes it to `destination` as ONNX.
pub trait NativeExporter {
    fn export(
        &self,
        source: &Path,
        destination: &Path,
        signature: &InputSignature,
        opset: i64,
    ) -> Result<(), ExportError>;
}
