//! # model-convert
//!
//! Converts Keras (`.h5`, `.keras`) and ONNX (`.onnx`) models into ONNX and PyTorch
//! artifacts.
//!
//! A [`ConversionRequest`](request::ConversionRequest) names the input, the requested
//! outputs and the input signature; a [`Converter`](convert::Converter) serves it:
//!
//! 1. the input format is detected from the file extension ([`format`]);
//! 2. Keras models are exported to ONNX through a [`NativeExporter`](export::NativeExporter);
//! 3. the ONNX model is structurally checked ([`checker`]);
//! 4. a requested ONNX output is smoke tested with one forward pass on the CPU runtime
//!    ([`session`]);
//! 5. PyTorch outputs are rebuilt from the ONNX graph and serialized ([`torch`]).
pub mod checker;
pub mod convert;
pub mod export;
pub mod format;
pub mod graph;
pub mod onnx_format;
pub mod operators;
pub mod providers;
pub mod request;
pub mod session;
pub mod tensor;
#[cfg(feature = "torch")]
pub mod torch;
