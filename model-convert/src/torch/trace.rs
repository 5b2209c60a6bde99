use std::collections::HashMap;
use std::fmt::Write;
use std::path::Path;

use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use rand::Rng;

use crate::onnx_format::ModelProto;
use crate::operators::Operator;
use crate::providers::DefaultProvider;
use crate::request::InputSignature;
use crate::session::{ExecutionStep, Session, SessionConfig, SessionError};
use crate::tensor::TensorData;

use super::archive::{ArchiveError, ArchiveWriter};
use super::model::{signature_value, Layer, TorchModel};
use super::pickle::Value;

/// Value of the `format` field of a pickled traced model.
pub const TRACED_MODEL_FORMAT: &str = "model-convert.traced-model";

/// One layer call recorded while tracing.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceStep {
    pub layer: String,
    pub op: String,
    pub inputs: Vec<String>,
    /// Shapes of `inputs`, by position.
    pub input_shapes: Vec<Vec<usize>>,
    pub output: String,
    pub output_shape: Vec<usize>,
}

/// A model together with the layer calls of one concrete forward pass.
#[derive(Debug)]
pub struct TracedModel<'m> {
    model: &'m TorchModel,
    example_input: (String, Vec<usize>),
    steps: Vec<TraceStep>,
    outputs: Vec<(String, Vec<usize>)>,
}

/// Records one forward pass of `onnx` over a standard-normal `(1, H, W, C)` batch fed
/// to its first graph input.
pub fn trace<'m>(
    onnx: &ModelProto,
    model: &'m TorchModel,
    signature: &InputSignature,
    config: SessionConfig,
) -> Result<TracedModel<'m>, SessionError> {
    let session = Session::new(onnx.clone(), config)?;
    let input = session
        .inputs()?
        .into_iter()
        .next()
        .ok_or_else(|| SessionError::MissingInput(signature.name.clone()))?;
    let shape = signature.shape.batch_shape();
    let mut rng = rand::thread_rng();
    let example = ArrayD::from_shape_simple_fn(IxDyn(&shape), || standard_normal(&mut rng));
    debug!(
        "Tracing with a random tensor of shape {:?} fed as {}",
        shape, input.name
    );

    let layers: HashMap<&str, &Layer> = model
        .layers()
        .iter()
        .map(|layer| (layer.output.as_str(), layer))
        .collect();
    let mut steps = Vec::new();
    let record = |step: &ExecutionStep<'_>| {
        if matches!(step.node.operator, Operator::Constant(_)) {
            return;
        }
        let layer = layers.get(step.node.output.as_str());
        // parameters owned by the layer are not call arguments
        let (inputs, input_shapes): (Vec<String>, Vec<Vec<usize>>) = step
            .node
            .inputs
            .iter()
            .zip(step.inputs)
            .filter(|(name, _)| {
                !name.is_empty() && layer.map_or(true, |layer| layer.inputs.contains(*name))
            })
            .map(|(name, data)| {
                let shape = data.as_ref().map(|d| d.shape().to_vec()).unwrap_or_default();
                (name.clone(), shape)
            })
            .unzip();
        steps.push(TraceStep {
            layer: layer.map_or_else(|| step.node.name.clone(), |layer| layer.name.clone()),
            op: step.node.operator.name(),
            inputs,
            input_shapes,
            output: step.node.output.clone(),
            output_shape: step.output.shape().to_vec(),
        });
    };

    let outputs = session.run_with_observer::<DefaultProvider, _>(
        HashMap::from([(input.name.clone(), TensorData::Float(example))]),
        record,
    )?;
    info!("Traced {} layer call(s)", steps.len());

    Ok(TracedModel {
        model,
        example_input: (input.name, shape.to_vec()),
        steps,
        outputs: outputs
            .into_iter()
            .map(|(name, data)| (name, data.shape().to_vec()))
            .collect(),
    })
}

/// Box-Muller transform over two uniform samples.
fn standard_normal(rng: &mut impl Rng) -> f32 {
    let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

impl<'m> TracedModel<'m> {
    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    /// Graph outputs with the shapes observed while tracing.
    pub fn outputs(&self) -> &[(String, Vec<usize>)] {
        &self.outputs
    }

    /// Human readable listing of the recorded calls, one per line.
    pub fn listing(&self) -> String {
        let mut code = String::new();
        let (name, shape) = &self.example_input;
        // writing into a String cannot fail
        let _ = writeln!(code, "# traced with {}: {:?}", name, shape);
        for step in &self.steps {
            let _ = writeln!(
                code,
                "{} = {}({})  # {}: {:?} -> {:?}",
                step.output,
                step.layer,
                step.inputs.join(", "),
                step.op,
                step.input_shapes,
                step.output_shape
            );
        }
        let returned: Vec<&str> = self.outputs.iter().map(|(n, _)| n.as_str()).collect();
        let _ = writeln!(code, "return {}", returned.join(", "));
        code
    }

    /// Saves the trace, the architecture and the state dict. The listing is stored as
    /// `code/trace.txt`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let mut writer = ArchiveWriter::new();
        writer.attach("code/trace.txt", self.listing().into_bytes());
        let state_dict = self.model.state_dict_value(&mut writer);

        let shape_list = |shape: &Vec<usize>| Value::ints(shape.iter().copied());
        let steps = self
            .steps
            .iter()
            .map(|step| {
                Value::record([
                    ("layer", Value::str(step.layer.as_str())),
                    ("op", Value::str(step.op.as_str())),
                    (
                        "inputs",
                        Value::List(step.inputs.iter().map(|i| Value::str(i.as_str())).collect()),
                    ),
                    (
                        "input_shapes",
                        Value::List(step.input_shapes.iter().map(shape_list).collect()),
                    ),
                    ("output", Value::str(step.output.as_str())),
                    ("output_shape", shape_list(&step.output_shape)),
                ])
            })
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|(name, shape)| {
                Value::record([("name", Value::str(name.as_str())), ("shape", shape_list(shape))])
            })
            .collect();

        let root = Value::record([
            ("format", Value::str(TRACED_MODEL_FORMAT)),
            ("version", Value::Int(1)),
            ("training", Value::Bool(self.model.is_training())),
            (
                "example_input",
                Value::record([
                    ("name", Value::str(self.example_input.0.as_str())),
                    ("shape", shape_list(&self.example_input.1)),
                ]),
            ),
            (
                "inputs",
                Value::List(self.model.inputs().iter().map(signature_value).collect()),
            ),
            ("outputs", Value::List(outputs)),
            ("layers", self.model.layers_value()),
            ("trace", Value::List(steps)),
            ("state_dict", state_dict),
        ]);
        writer.write(path.as_ref(), &root)?;
        info!("Saved the traced PyTorch model to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::builder::{int_attribute, node, GraphBuilder};
    use crate::request::InputShape;
    use crate::torch::rebuild;

    fn dense_model() -> ModelProto {
        let mut flatten = node("Flatten", &["x"], &["f"]);
        flatten.attribute.push(int_attribute("axis", 1));
        GraphBuilder::new(13)
            .input("x", &[-1, 2, 2, 3])
            .output("y", &[-1, 4])
            .initializer("w", &[12, 4], vec![0.1; 48])
            .initializer("b", &[4], vec![0.0; 4])
            .node(flatten)
            .node(node("Gemm", &["f", "w", "b"], &["g"]))
            .node(node("Relu", &["g"], &["y"]))
            .build()
    }

    #[test]
    fn records_every_layer_call() {
        let onnx = dense_model();
        let model = rebuild(&onnx).unwrap().eval();
        // the signature name differs from the graph input, the first input is fed
        let signature = InputSignature::new(InputShape::new(2, 2, 3), "image");
        let traced = trace(&onnx, &model, &signature, SessionConfig::default()).unwrap();

        let layers: Vec<&str> = traced.steps().iter().map(|s| s.layer.as_str()).collect();
        assert_eq!(layers, ["Flatten_f", "Gemm_g", "Relu_y"]);
        assert_eq!(traced.steps()[0].input_shapes, vec![vec![1, 2, 2, 3]]);
        assert_eq!(traced.steps()[1].inputs, ["f"]);
        assert_eq!(traced.outputs(), &[(String::from("y"), vec![1, 4])]);

        let listing = traced.listing();
        assert!(listing.starts_with("# traced with x: [1, 2, 2, 3]"));
        assert!(listing.contains("g = Gemm_g(f)  # Gemm: [[1, 12]] -> [1, 4]"));
        assert!(listing.ends_with("return y\n"));
    }

    #[test]
    fn saved_trace_keeps_the_listing() {
        let onnx = dense_model();
        let model = rebuild(&onnx).unwrap().eval();
        let signature = InputSignature::new(InputShape::new(2, 2, 3), "x");
        let traced = trace(&onnx, &model, &signature, SessionConfig::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ts.pt");
        traced.save(&path).unwrap();

        let archive = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        let names: Vec<&str> = archive.file_names().collect();
        assert!(names.contains(&"archive/code/trace.txt"));
        assert!(names.contains(&"archive/data.pkl"));
        // weight and bias of the dense layer
        assert_eq!(names.iter().filter(|n| n.starts_with("archive/data/")).count(), 2);
    }
}
