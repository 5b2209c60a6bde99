//! Description of one conversion: what to read, what to write and how to check it.
use std::path::PathBuf;

use crate::convert::ConvertError;

/// Spatial and channel dimensions of the model input, without the batch axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl InputShape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Channels-last shape of a batch with a single element: `(1, H, W, C)`.
    pub fn batch_shape(&self) -> [usize; 4] {
        [1, self.height, self.width, self.channels]
    }
}

/// Typed input signature: the tensor shape and the name it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSignature {
    pub shape: InputShape,
    pub name: String,
}

impl InputSignature {
    pub fn new(shape: InputShape, name: impl Into<String>) -> Self {
        Self {
            shape,
            name: name.into(),
        }
    }
}

/// Requested artifacts, each with its own destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputTargets {
    pub onnx: Option<PathBuf>,
    pub torch_full: Option<PathBuf>,
    pub torch_params: Option<PathBuf>,
    pub torch_script: Option<PathBuf>,
}

impl OutputTargets {
    pub fn is_empty(&self) -> bool {
        !self.needs_interchange()
    }

    /// Any PyTorch artifact requested.
    pub fn wants_torch(&self) -> bool {
        self.torch_full.is_some() || self.torch_params.is_some() || self.torch_script.is_some()
    }

    /// An ONNX file is needed when it is requested or when PyTorch artifacts are derived from it.
    pub fn needs_interchange(&self) -> bool {
        self.onnx.is_some() || self.wants_torch()
    }

    /// Every requested destination.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        [
            &self.onnx,
            &self.torch_full,
            &self.torch_params,
            &self.torch_script,
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub input: PathBuf,
    pub outputs: OutputTargets,
    pub signature: InputSignature,
    /// ONNX opset used when exporting a Keras model.
    pub opset: i64,
    /// Run the structural check on the ONNX file.
    pub validate: bool,
    /// Run a forward pass on a requested ONNX output.
    pub run_dummy: bool,
}

impl ConversionRequest {
    pub fn new(
        input: impl Into<PathBuf>,
        outputs: OutputTargets,
        signature: InputSignature,
        opset: i64,
        validate: bool,
        run_dummy: bool,
    ) -> Self {
        Self {
            input: input.into(),
            outputs,
            signature,
            opset,
            validate,
            run_dummy,
        }
    }

    /// Rejects requests that would produce nothing.
    pub fn validate(&self) -> Result<(), ConvertError> {
        if self.outputs.is_empty() {
            return Err(ConvertError::NoOutputRequested);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(outputs: OutputTargets) -> ConversionRequest {
        ConversionRequest::new(
            "model.h5",
            outputs,
            InputSignature::new(InputShape::new(32, 32, 3), "input"),
            13,
            true,
            true,
        )
    }

    #[test]
    fn empty_requests_are_rejected() {
        let result = request(OutputTargets::default()).validate();
        assert!(matches!(result, Err(ConvertError::NoOutputRequested)));
    }

    #[test]
    fn torch_outputs_need_an_interchange_file() {
        let outputs = OutputTargets {
            torch_params: Some(PathBuf::from("out/model.pth")),
            ..Default::default()
        };
        assert!(outputs.wants_torch());
        assert!(outputs.needs_interchange());
        assert!(request(outputs).validate().is_ok());
    }

    #[test]
    fn onnx_only_does_not_want_torch() {
        let outputs = OutputTargets {
            onnx: Some(PathBuf::from("out/model.onnx")),
            ..Default::default()
        };
        assert!(!outputs.wants_torch());
        assert!(outputs.needs_interchange());
        assert_eq!(outputs.paths().count(), 1);
    }

    #[test]
    fn batch_shape_is_channels_last() {
        assert_eq!(InputShape::new(128, 64, 3).batch_shape(), [1, 128, 64, 3]);
    }
}
