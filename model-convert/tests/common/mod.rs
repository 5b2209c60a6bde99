use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

use model_convert::export::{ExportError, NativeExporter};
use model_convert::onnx_format::builder::{int_attribute, ints_attribute, node, GraphBuilder};
use model_convert::onnx_format::{write_model_proto, ModelProto};
use model_convert::request::{
    ConversionRequest, InputShape, InputSignature, OutputTargets,
};

pub const HEIGHT: usize = 8;
pub const WIDTH: usize = 8;
pub const CHANNELS: usize = 3;
pub const CLASSES: usize = 10;

/// Channels-last classifier shaped like a `tf2onnx` export:
/// transpose, conv + relu, global pooling, dense + softmax.
pub fn classifier() -> ModelProto {
    let mut transpose = node("Transpose", &["input"], &["t"]);
    transpose.attribute.push(ints_attribute("perm", &[0, 3, 1, 2]));
    let mut conv = node("Conv", &["t", "conv_w", "conv_b"], &["c"]);
    conv.attribute.push(ints_attribute("kernel_shape", &[3, 3]));
    conv.attribute.push(ints_attribute("pads", &[1, 1, 1, 1]));
    let mut flatten = node("Flatten", &["p"], &["f"]);
    flatten.attribute.push(int_attribute("axis", 1));

    GraphBuilder::new(13)
        .input("input", &[-1, HEIGHT as i64, WIDTH as i64, CHANNELS as i64])
        .output("probabilities", &[-1, CLASSES as i64])
        .initializer("conv_w", &[4, 3, 3, 3], ramp(108, 0.01))
        .initializer("conv_b", &[4], vec![0.1, 0.2, 0.3, 0.4])
        .initializer("fc_w", &[4, CLASSES as i64], ramp(40, 0.05))
        .initializer("fc_b", &[CLASSES as i64], vec![0.0; CLASSES])
        .node(transpose)
        .node(conv)
        .node(node("Relu", &["c"], &["r"]))
        .node(node("GlobalAveragePool", &["r"], &["p"]))
        .node(flatten)
        .node(node("Gemm", &["f", "fc_w", "fc_b"], &["g"]))
        .node(node("Softmax", &["g"], &["probabilities"]))
        .build()
}

fn ramp(len: usize, step: f32) -> Vec<f32> {
    (0..len).map(|v| v as f32 * step - 0.5).collect()
}

/// Stands in for the Python bridge: writes a prebuilt model to every destination.
pub struct FakeExporter {
    model: ModelProto,
    pub destinations: RefCell<Vec<PathBuf>>,
    pub calls: Cell<usize>,
}

impl FakeExporter {
    pub fn new(model: ModelProto) -> Self {
        Self {
            model,
            destinations: RefCell::new(Vec::new()),
            calls: Cell::new(0),
        }
    }
}

impl NativeExporter for FakeExporter {
    fn export(
        &self,
        source: &Path,
        destination: &Path,
        _signature: &InputSignature,
        _opset: i64,
    ) -> Result<(), ExportError> {
        assert!(source.exists(), "the exporter must receive the input model");
        self.calls.set(self.calls.get() + 1);
        self.destinations
            .borrow_mut()
            .push(destination.to_path_buf());
        write_model_proto(&self.model, destination)?;
        Ok(())
    }
}

pub fn signature() -> InputSignature {
    InputSignature::new(InputShape::new(HEIGHT, WIDTH, CHANNELS), "input")
}

pub fn request(input: &Path, outputs: OutputTargets) -> ConversionRequest {
    ConversionRequest::new(input, outputs, signature(), 13, true, true)
}

/// Sorted names of the files directly inside `dir`.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
