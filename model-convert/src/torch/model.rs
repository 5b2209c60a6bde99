use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::{debug, info};
use ndarray::{Array1, ArrayD, IxDyn};
use petgraph::algo::toposort;
use thiserror::Error;

use crate::graph::{create_graph, GraphError, RuntimeGraph, RuntimeNode};
use crate::onnx_format::ModelProto;
use crate::operators::{AutoPad, BatchNormAttributes, ConvAttributes, Operator};
use crate::tensor::{GraphDimension, TensorData, TensorDataType, TensorShape};

use super::archive::{ArchiveError, ArchiveWriter};
use super::pickle::Value;

/// Value of the `format` field of a pickled full model.
pub const FULL_MODEL_FORMAT: &str = "model-convert.torch-model";

#[derive(Error, Debug)]
pub enum RebuildError {
    #[error("the model could not be translated: {0}")]
    Graph(#[from] GraphError),
    #[error("the model's graph is not a DAG")]
    NotADag,
    #[error("layer {layer}: parameter {parameter} has shape {shape:?}, expected {expected}")]
    InvalidParameter {
        layer: String,
        parameter: &'static str,
        shape: Vec<usize>,
        expected: &'static str,
    },
}

/// Building block of a rebuilt model, named after its `torch.nn` counterpart.
#[derive(Debug, Clone)]
pub enum Module {
    Conv2d {
        in_channels: usize,
        out_channels: usize,
        kernel_size: [usize; 2],
        stride: [usize; 2],
        /// `[top, left, bottom, right]`
        padding: [usize; 4],
        dilation: [usize; 2],
        groups: usize,
        auto_pad: AutoPad,
        bias: bool,
    },
    Linear {
        in_features: usize,
        out_features: usize,
        bias: bool,
    },
    BatchNorm2d {
        num_features: usize,
        eps: f32,
        momentum: f32,
    },
    MaxPool2d {
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 4],
        auto_pad: AutoPad,
    },
    AvgPool2d {
        kernel_size: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 4],
        auto_pad: AutoPad,
        count_include_pad: bool,
    },
    /// Global average pooling, output size 1x1.
    AdaptiveAvgPool2d,
    ReLU,
    LeakyReLU { negative_slope: f32 },
    Sigmoid,
    Tanh,
    Softmax { dim: i64 },
    Hardtanh { min_val: f32, max_val: f32 },
    Flatten { start_dim: i64 },
    Identity,
    /// Stateless operation applied to the layer inputs.
    Functional(Operator),
}

impl Module {
    pub fn type_name(&self) -> &'static str {
        match self {
            Module::Conv2d { .. } => "Conv2d",
            Module::Linear { .. } => "Linear",
            Module::BatchNorm2d { .. } => "BatchNorm2d",
            Module::MaxPool2d { .. } => "MaxPool2d",
            Module::AvgPool2d { .. } => "AvgPool2d",
            Module::AdaptiveAvgPool2d => "AdaptiveAvgPool2d",
            Module::ReLU => "ReLU",
            Module::LeakyReLU { .. } => "LeakyReLU",
            Module::Sigmoid => "Sigmoid",
            Module::Tanh => "Tanh",
            Module::Softmax { .. } => "Softmax",
            Module::Hardtanh { .. } => "Hardtanh",
            Module::Flatten { .. } => "Flatten",
            Module::Identity => "Identity",
            Module::Functional(_) => "Functional",
        }
    }

    /// Constructor arguments, as keyword arguments.
    pub fn config(&self) -> Vec<(&'static str, Value)> {
        let pair = |v: [usize; 2]| {
            Value::Tuple(vec![Value::Int(v[0] as i64), Value::Int(v[1] as i64)])
        };
        match self {
            Module::Conv2d {
                in_channels,
                out_channels,
                kernel_size,
                stride,
                padding,
                dilation,
                groups,
                auto_pad,
                bias,
            } => vec![
                ("in_channels", Value::Int(*in_channels as i64)),
                ("out_channels", Value::Int(*out_channels as i64)),
                ("kernel_size", pair(*kernel_size)),
                ("stride", pair(*stride)),
                ("padding", Value::ints(*padding)),
                ("dilation", pair(*dilation)),
                ("groups", Value::Int(*groups as i64)),
                ("auto_pad", Value::str(auto_pad.as_str())),
                ("bias", Value::Bool(*bias)),
            ],
            Module::Linear {
                in_features,
                out_features,
                bias,
            } => vec![
                ("in_features", Value::Int(*in_features as i64)),
                ("out_features", Value::Int(*out_features as i64)),
                ("bias", Value::Bool(*bias)),
            ],
            Module::BatchNorm2d {
                num_features,
                eps,
                momentum,
            } => vec![
                ("num_features", Value::Int(*num_features as i64)),
                ("eps", Value::Float(*eps as f64)),
                ("momentum", Value::Float(*momentum as f64)),
            ],
            Module::MaxPool2d {
                kernel_size,
                stride,
                padding,
                auto_pad,
            } => vec![
                ("kernel_size", pair(*kernel_size)),
                ("stride", pair(*stride)),
                ("padding", Value::ints(*padding)),
                ("auto_pad", Value::str(auto_pad.as_str())),
            ],
            Module::AvgPool2d {
                kernel_size,
                stride,
                padding,
                auto_pad,
                count_include_pad,
            } => vec![
                ("kernel_size", pair(*kernel_size)),
                ("stride", pair(*stride)),
                ("padding", Value::ints(*padding)),
                ("auto_pad", Value::str(auto_pad.as_str())),
                ("count_include_pad", Value::Bool(*count_include_pad)),
            ],
            Module::AdaptiveAvgPool2d => vec![("output_size", pair([1, 1]))],
            Module::LeakyReLU { negative_slope } => {
                vec![("negative_slope", Value::Float(*negative_slope as f64))]
            }
            Module::Softmax { dim } => vec![("dim", Value::Int(*dim))],
            Module::Hardtanh { min_val, max_val } => vec![
                ("min_val", Value::Float(*min_val as f64)),
                ("max_val", Value::Float(*max_val as f64)),
            ],
            Module::Flatten { start_dim } => vec![("start_dim", Value::Int(*start_dim))],
            Module::Functional(operator) => functional_config(operator),
            Module::ReLU | Module::Sigmoid | Module::Tanh | Module::Identity => Vec::new(),
        }
    }
}

fn functional_config(operator: &Operator) -> Vec<(&'static str, Value)> {
    let mut config = vec![("op", Value::str(operator.name()))];
    let optional_ints = |values: &Option<Vec<i64>>| match values {
        Some(values) => Value::List(values.iter().map(|v| Value::Int(*v)).collect()),
        None => Value::None,
    };
    match operator {
        Operator::Convolution(attrs) => {
            config.push(("stride", Value::ints(attrs.strides)));
            config.push(("padding", Value::ints(attrs.pads)));
            config.push(("dilation", Value::ints(attrs.dilations)));
            config.push(("groups", Value::Int(attrs.group as i64)));
            config.push(("auto_pad", Value::str(attrs.auto_pad.as_str())));
        }
        Operator::BatchNorm(attrs) => config.push(("eps", Value::Float(attrs.epsilon as f64))),
        Operator::Gemm(attrs) => {
            config.push(("alpha", Value::Float(attrs.alpha as f64)));
            config.push(("beta", Value::Float(attrs.beta as f64)));
            config.push(("trans_a", Value::Bool(attrs.trans_a)));
            config.push(("trans_b", Value::Bool(attrs.trans_b)));
        }
        Operator::Clip(attrs) => {
            config.push(("min", Value::Float(attrs.min as f64)));
            config.push(("max", Value::Float(attrs.max as f64)));
        }
        Operator::Transpose(perm) => config.push((
            "perm",
            match perm {
                Some(perm) => Value::ints(perm.iter().copied()),
                None => Value::None,
            },
        )),
        Operator::Concat(axis) | Operator::Gather(axis) => config.push(("axis", Value::Int(*axis))),
        Operator::Squeeze(axes) | Operator::Unsqueeze(axes) => {
            config.push(("axes", optional_ints(axes)))
        }
        Operator::Cast(to) => config.push(("dtype", Value::str(dtype_name(*to)))),
        _ => {}
    }
    config
}

/// A named module applied to graph values.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub module: Module,
    /// Consumed graph values; values stored as parameters of the module are excluded.
    pub inputs: Vec<String>,
    pub output: String,
}

/// In-memory PyTorch reconstruction of an ONNX model.
#[derive(Debug, Clone)]
pub struct TorchModel {
    training: bool,
    inputs: Vec<TensorShape>,
    outputs: Vec<TensorShape>,
    layers: Vec<Layer>,
    /// Non floating-point constants, kept with the architecture.
    constants: Vec<(String, TensorData)>,
    /// Graph values stored in the state dict as buffers, with their key.
    buffers: Vec<(String, String)>,
    state_dict: Vec<(String, TensorData)>,
}

impl TorchModel {
    /// Switches the model to inference mode.
    pub fn eval(mut self) -> Self {
        self.training = false;
        self
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn inputs(&self) -> &[TensorShape] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorShape] {
        &self.outputs
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn constants(&self) -> &[(String, TensorData)] {
        &self.constants
    }

    /// Parameters and buffers, in registration order.
    pub fn state_dict(&self) -> &[(String, TensorData)] {
        &self.state_dict
    }

    pub fn parameter(&self, key: &str) -> Option<&TensorData> {
        self.state_dict
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, data)| data)
    }

    pub(super) fn state_dict_value(&self, writer: &mut ArchiveWriter) -> Value {
        Value::OrderedDict(
            self.state_dict
                .iter()
                .map(|(key, data)| (Value::str(key.as_str()), writer.tensor(data)))
                .collect(),
        )
    }

    pub(super) fn layers_value(&self) -> Value {
        Value::List(
            self.layers
                .iter()
                .map(|layer| {
                    Value::record([
                        ("name", Value::str(layer.name.as_str())),
                        ("type", Value::str(layer.module.type_name())),
                        ("config", Value::record(layer.module.config())),
                        (
                            "inputs",
                            Value::List(layer.inputs.iter().map(|i| Value::str(i.as_str())).collect()),
                        ),
                        ("output", Value::str(layer.output.as_str())),
                    ])
                })
                .collect(),
        )
    }

    /// Saves the complete model: architecture, graph signature, constants and state dict.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let mut writer = ArchiveWriter::new();
        let constants = Value::Dict(
            self.constants
                .iter()
                .map(|(name, data)| (Value::str(name.as_str()), writer.tensor(data)))
                .collect(),
        );
        let buffers = Value::Dict(
            self.buffers
                .iter()
                .map(|(value, key)| (Value::str(value.as_str()), Value::str(key.as_str())))
                .collect(),
        );
        let state_dict = self.state_dict_value(&mut writer);
        let root = Value::record([
            ("format", Value::str(FULL_MODEL_FORMAT)),
            ("version", Value::Int(1)),
            ("training", Value::Bool(self.training)),
            ("inputs", Value::List(self.inputs.iter().map(signature_value).collect())),
            ("outputs", Value::List(self.outputs.iter().map(signature_value).collect())),
            ("layers", self.layers_value()),
            ("constants", constants),
            ("buffers", buffers),
            ("state_dict", state_dict),
        ]);
        writer.write(path.as_ref(), &root)?;
        info!("Saved the full PyTorch model to {}", path.as_ref().display());
        Ok(())
    }

    /// Saves the parameters only, as an `OrderedDict[str, Tensor]`.
    pub fn save_state_dict<P: AsRef<Path>>(&self, path: P) -> Result<(), ArchiveError> {
        let mut writer = ArchiveWriter::new();
        let root = self.state_dict_value(&mut writer);
        writer.write(path.as_ref(), &root)?;
        info!(
            "Saved {} PyTorch parameter tensor(s) to {}",
            self.state_dict.len(),
            path.as_ref().display()
        );
        Ok(())
    }
}

pub(super) fn signature_value(shape: &TensorShape) -> Value {
    Value::record([
        ("name", Value::str(shape.name.as_str())),
        (
            "dtype",
            match shape.elem_type {
                Some(elem_type) => Value::str(dtype_name(elem_type)),
                None => Value::None,
            },
        ),
        (
            "shape",
            Value::List(
                shape
                    .dims
                    .iter()
                    .map(|dim| match dim {
                        GraphDimension::Value(v) => Value::Int(*v as i64),
                        GraphDimension::Parameter(p) => Value::str(p.as_str()),
                    })
                    .collect(),
            ),
        ),
    ])
}

/// Name of the matching `torch` dtype.
pub fn dtype_name(data_type: TensorDataType) -> &'static str {
    match data_type {
        TensorDataType::Float => "float32",
        TensorDataType::Uint8 => "uint8",
        TensorDataType::Int8 => "int8",
        TensorDataType::Uint16 => "uint16",
        TensorDataType::Int16 => "int16",
        TensorDataType::Int32 => "int32",
        TensorDataType::Int64 => "int64",
        TensorDataType::String => "str",
        TensorDataType::Bool => "bool",
        TensorDataType::Float16 => "float16",
        TensorDataType::Double => "float64",
        TensorDataType::Uint32 => "uint32",
        TensorDataType::Uint64 => "uint64",
        TensorDataType::Complex64 => "complex64",
        TensorDataType::Complex128 => "complex128",
        TensorDataType::BFloat16 => "bfloat16",
    }
}

/// Makes a value or node name usable as a module attribute name.
fn sanitize(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

fn unique(used: &mut HashSet<String>, base: String) -> String {
    let mut name = base.clone();
    let mut suffix = 1;
    while used.contains(&name) {
        name = format!("{}_{}", base, suffix);
        suffix += 1;
    }
    used.insert(name.clone());
    name
}

/// Rebuilds an ONNX model as a PyTorch module graph, in training mode like a freshly
/// constructed `nn.Module`.
///
/// Convolutions, dense layers (`Gemm`, or `MatMul` by a constant matrix) and batch
/// normalizations with constant parameters become `Conv2d`, `Linear` and `BatchNorm2d`
/// layers owning their parameters. Every other floating-point constant is registered
/// as a buffer, so that the state dict holds every floating-point initializer.
pub fn rebuild(model: &ModelProto) -> Result<TorchModel, RebuildError> {
    let graph = create_graph(model)?;
    let order = toposort(&graph, None).map_err(|_| RebuildError::NotADag)?;

    let mut builder = ModelBuilder::new(&graph);
    for index in order {
        let node = &graph[index];
        match &node.operator {
            Operator::InputFeed(_) | Operator::OutputCollector(_) | Operator::Constant(_) => {}
            operator => builder.add_layer(node, operator)?,
        }
    }
    let model = builder.finish(&graph);
    info!(
        "Rebuilt {} layer(s) with {} state dict entries",
        model.layers.len(),
        model.state_dict.len()
    );
    Ok(model)
}

struct ModelBuilder<'a> {
    constants: HashMap<&'a str, &'a TensorData>,
    names: HashSet<String>,
    layers: Vec<Layer>,
    state_dict: Vec<(String, TensorData)>,
    /// Constants stored as a module parameter at least once.
    absorbed: HashSet<String>,
    /// Constants consumed as a plain layer input.
    raw_uses: HashSet<String>,
}

type Parameters = Vec<(&'static str, TensorData)>;

impl<'a> ModelBuilder<'a> {
    fn new(graph: &'a RuntimeGraph) -> Self {
        let constants = graph
            .node_weights()
            .filter_map(|node| match &node.operator {
                Operator::Constant(data) => Some((node.output.as_str(), data)),
                _ => None,
            })
            .collect();
        Self {
            constants,
            names: HashSet::new(),
            layers: Vec::new(),
            state_dict: Vec::new(),
            absorbed: HashSet::new(),
            raw_uses: HashSet::new(),
        }
    }

    fn slot_used(node: &RuntimeNode, slot: usize) -> bool {
        node.inputs.get(slot).map_or(false, |v| !v.is_empty())
    }

    fn float_constant(&self, node: &RuntimeNode, slot: usize) -> Option<&'a ArrayD<f32>> {
        let value = node.inputs.get(slot)?;
        match self.constants.get(value.as_str()).copied() {
            Some(TensorData::Float(data)) => Some(data),
            _ => None,
        }
    }

    fn add_layer(&mut self, node: &RuntimeNode, operator: &Operator) -> Result<(), RebuildError> {
        let name = unique(&mut self.names, sanitize(&node.name));
        let (module, parameters, consumed) = match operator {
            Operator::Convolution(attrs) => self.convolution(node, operator, &name, attrs)?,
            Operator::Gemm(attrs)
                if attrs.alpha == 1.0
                    && !attrs.trans_a
                    && (attrs.beta == 1.0 || !Self::slot_used(node, 2)) =>
            {
                self.dense(node, operator, attrs.trans_b)
            }
            Operator::MatMul => self.dense(node, operator, false),
            Operator::BatchNorm(attrs) => self.batch_norm(node, operator, &name, attrs)?,
            Operator::MaxPool(attrs) => (
                Module::MaxPool2d {
                    kernel_size: attrs.kernel_shape,
                    stride: attrs.strides,
                    padding: attrs.pads,
                    auto_pad: attrs.auto_pad,
                },
                Vec::new(),
                Vec::new(),
            ),
            Operator::AveragePool(attrs) => (
                Module::AvgPool2d {
                    kernel_size: attrs.kernel_shape,
                    stride: attrs.strides,
                    padding: attrs.pads,
                    auto_pad: attrs.auto_pad,
                    count_include_pad: attrs.count_include_pad,
                },
                Vec::new(),
                Vec::new(),
            ),
            Operator::GlobalAveragePool => stateless(Module::AdaptiveAvgPool2d),
            Operator::ReLU => stateless(Module::ReLU),
            Operator::LeakyReLU(alpha) => stateless(Module::LeakyReLU {
                negative_slope: *alpha,
            }),
            Operator::Sigmoid => stateless(Module::Sigmoid),
            Operator::Tanh => stateless(Module::Tanh),
            Operator::Softmax(axis) => stateless(Module::Softmax { dim: *axis }),
            Operator::Clip(attrs) => self.clip(node, operator, attrs.min, attrs.max),
            Operator::Flatten(axis) => stateless(Module::Flatten { start_dim: *axis }),
            Operator::Identity => stateless(Module::Identity),
            operator => stateless(Module::Functional(operator.clone())),
        };

        if !parameters.is_empty() {
            for slot in &consumed {
                if let Some(value) = node.inputs.get(*slot) {
                    self.absorbed.insert(value.clone());
                }
            }
        }
        for (parameter, data) in parameters {
            self.state_dict.push((format!("{}.{}", name, parameter), data));
        }
        let inputs: Vec<String> = node
            .inputs
            .iter()
            .enumerate()
            .filter(|(slot, value)| !value.is_empty() && !consumed.contains(slot))
            .map(|(_, value)| value.clone())
            .collect();
        for value in &inputs {
            if self.constants.contains_key(value.as_str()) {
                self.raw_uses.insert(value.clone());
            }
        }

        debug!("Layer {} = {}", name, module.type_name());
        self.layers.push(Layer {
            name,
            module,
            inputs,
            output: node.output.clone(),
        });
        Ok(())
    }

    fn convolution(
        &self,
        node: &RuntimeNode,
        operator: &Operator,
        name: &str,
        attrs: &ConvAttributes,
    ) -> Result<(Module, Parameters, Vec<usize>), RebuildError> {
        let Some(weight) = self.float_constant(node, 1) else {
            return Ok(stateless(Module::Functional(operator.clone())));
        };
        let shape = weight.shape();
        if shape.len() != 4 {
            return Err(RebuildError::InvalidParameter {
                layer: name.to_string(),
                parameter: "weight",
                shape: shape.to_vec(),
                expected: "[out_channels, in_channels / groups, kH, kW]",
            });
        }
        let bias = self
            .float_constant(node, 2)
            .filter(|bias| bias.shape() == [shape[0]]);
        if Self::slot_used(node, 2) && bias.is_none() {
            return Ok(stateless(Module::Functional(operator.clone())));
        }

        let module = Module::Conv2d {
            in_channels: shape[1] * attrs.group,
            out_channels: shape[0],
            kernel_size: [shape[2], shape[3]],
            stride: attrs.strides,
            padding: attrs.pads,
            dilation: attrs.dilations,
            groups: attrs.group,
            auto_pad: attrs.auto_pad,
            bias: bias.is_some(),
        };
        let mut parameters = vec![("weight", TensorData::Float(weight.clone()))];
        let mut consumed = vec![1];
        if let Some(bias) = bias {
            parameters.push(("bias", TensorData::Float(bias.clone())));
            consumed.push(2);
        }
        Ok((module, parameters, consumed))
    }

    /// `Linear` from `x @ W (+ c)` with a constant 2D `W`, stored transposed as
    /// `[out_features, in_features]` unless it already is.
    fn dense(
        &self,
        node: &RuntimeNode,
        operator: &Operator,
        transposed: bool,
    ) -> (Module, Parameters, Vec<usize>) {
        let Some(matrix) = self.float_constant(node, 1).filter(|m| m.ndim() == 2) else {
            return stateless(Module::Functional(operator.clone()));
        };
        let weight = match transposed {
            true => matrix.clone(),
            false => matrix.t().to_owned(),
        };
        let out_features = weight.shape()[0];

        // MatMul has no third input
        let bias = match Self::slot_used(node, 2) {
            true => match self.float_constant(node, 2) {
                Some(c)
                    if c.len() == out_features
                        && c.shape().iter().rev().skip(1).all(|d| *d == 1) =>
                {
                    Some(Array1::from_iter(c.iter().copied()).into_dyn())
                }
                _ => return stateless(Module::Functional(operator.clone())),
            },
            false => None,
        };

        let module = Module::Linear {
            in_features: weight.shape()[1],
            out_features,
            bias: bias.is_some(),
        };
        let mut parameters = vec![("weight", TensorData::Float(weight))];
        let mut consumed = vec![1];
        if let Some(bias) = bias {
            parameters.push(("bias", TensorData::Float(bias)));
            consumed.push(2);
        }
        (module, parameters, consumed)
    }

    fn batch_norm(
        &self,
        node: &RuntimeNode,
        operator: &Operator,
        name: &str,
        attrs: &BatchNormAttributes,
    ) -> Result<(Module, Parameters, Vec<usize>), RebuildError> {
        let params: Option<Vec<&ArrayD<f32>>> =
            (1..=4).map(|slot| self.float_constant(node, slot)).collect();
        let Some(params) = params else {
            return Ok(stateless(Module::Functional(operator.clone())));
        };
        let num_features = params[0].len();
        for (param, parameter) in params
            .iter()
            .zip(["weight", "bias", "running_mean", "running_var"])
        {
            if param.shape() != [num_features] {
                return Err(RebuildError::InvalidParameter {
                    layer: name.to_string(),
                    parameter,
                    shape: param.shape().to_vec(),
                    expected: "[num_features]",
                });
            }
        }

        let module = Module::BatchNorm2d {
            num_features,
            eps: attrs.epsilon,
            // ONNX weights the running statistic, PyTorch the new observation
            momentum: 1.0 - attrs.momentum,
        };
        let parameters = vec![
            ("weight", TensorData::Float(params[0].clone())),
            ("bias", TensorData::Float(params[1].clone())),
            ("running_mean", TensorData::Float(params[2].clone())),
            ("running_var", TensorData::Float(params[3].clone())),
            (
                "num_batches_tracked",
                TensorData::Int64(ArrayD::zeros(IxDyn(&[]))),
            ),
        ];
        Ok((module, parameters, vec![1, 2, 3, 4]))
    }

    /// Folds constant bounds into `Hardtanh`. The bound constants stay in the state dict.
    fn clip(
        &self,
        node: &RuntimeNode,
        operator: &Operator,
        min: f32,
        max: f32,
    ) -> (Module, Parameters, Vec<usize>) {
        let mut bounds = [min, max];
        for (slot, bound) in [1, 2].into_iter().zip(bounds.iter_mut()) {
            if !Self::slot_used(node, slot) {
                continue;
            }
            match self.float_constant(node, slot) {
                Some(value) if value.len() == 1 => {
                    *bound = value.iter().copied().next().unwrap_or(*bound)
                }
                _ => return stateless(Module::Functional(operator.clone())),
            }
        }
        (
            Module::Hardtanh {
                min_val: bounds[0],
                max_val: bounds[1],
            },
            Vec::new(),
            vec![1, 2],
        )
    }

    fn finish(mut self, graph: &RuntimeGraph) -> TorchModel {
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut constants = Vec::new();
        let mut buffers = Vec::new();
        let mut keys: HashSet<String> = self.state_dict.iter().map(|(k, _)| k.clone()).collect();

        for node in graph.node_weights() {
            match &node.operator {
                Operator::InputFeed(shape) => inputs.push(shape.clone()),
                Operator::OutputCollector(shape) => outputs.push(shape.clone()),
                Operator::Constant(data) if data.is_floating_point() => {
                    let value = &node.output;
                    if self.raw_uses.contains(value) || !self.absorbed.contains(value) {
                        let key = unique(&mut keys, format!("buffers.{}", sanitize(value)));
                        self.state_dict.push((key.clone(), data.clone()));
                        buffers.push((value.clone(), key));
                    }
                }
                Operator::Constant(data) => constants.push((node.output.clone(), data.clone())),
                _ => {}
            }
        }

        TorchModel {
            training: true,
            inputs,
            outputs,
            layers: self.layers,
            constants,
            buffers,
            state_dict: self.state_dict,
        }
    }
}

fn stateless(module: Module) -> (Module, Parameters, Vec<usize>) {
    (module, Vec::new(), Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::builder::{int_attribute, ints_attribute, node, GraphBuilder};

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|v| v as f32).collect()
    }

    fn small_cnn() -> ModelProto {
        let mut conv = node("Conv", &["x", "w", "b"], &["c"]);
        conv.attribute.push(ints_attribute("pads", &[1, 1, 1, 1]));
        let mut gemm = node("Gemm", &["f", "fc_w", "fc_b"], &["g"]);
        gemm.attribute.push(int_attribute("transB", 0));
        GraphBuilder::new(13)
            .input("x", &[-1, 1, 4, 4])
            .output("y", &[-1, 3])
            .initializer("w", &[2, 1, 3, 3], ramp(18))
            .initializer("b", &[2], vec![0.5, -0.5])
            .initializer("scale", &[2], vec![1.0, 1.0])
            .initializer("shift", &[2], vec![0.0, 0.0])
            .initializer("mean", &[2], vec![0.0, 0.0])
            .initializer("var", &[2], vec![1.0, 1.0])
            .initializer("fc_w", &[32, 3], ramp(96))
            .initializer("fc_b", &[3], vec![1.0, 2.0, 3.0])
            .initializer("k", &[], vec![2.0])
            .int64_initializer("unused_shape", &[2], vec![1, -1])
            .node(conv)
            .node(node("BatchNormalization", &["c", "scale", "shift", "mean", "var"], &["n"]))
            .node(node("Relu", &["n"], &["r"]))
            .node(node("Flatten", &["r"], &["f"]))
            .node(gemm)
            .node(node("Mul", &["g", "k"], &["y"]))
            .build()
    }

    #[test]
    fn layers_own_their_parameters() {
        let model = rebuild(&small_cnn()).unwrap();
        let types: Vec<&str> = model.layers().iter().map(|l| l.module.type_name()).collect();
        assert_eq!(
            types,
            ["Conv2d", "BatchNorm2d", "ReLU", "Flatten", "Linear", "Functional"]
        );
        let conv = &model.layers()[0];
        assert_eq!(conv.name, "Conv_c");
        assert_eq!(conv.inputs, ["x"]);
        assert!(matches!(
            conv.module,
            Module::Conv2d {
                in_channels: 1,
                out_channels: 2,
                kernel_size: [3, 3],
                padding: [1, 1, 1, 1],
                bias: true,
                ..
            }
        ));

        let keys: Vec<&str> = model.state_dict().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            [
                "Conv_c.weight",
                "Conv_c.bias",
                "BatchNormalization_n.weight",
                "BatchNormalization_n.bias",
                "BatchNormalization_n.running_mean",
                "BatchNormalization_n.running_var",
                "BatchNormalization_n.num_batches_tracked",
                "Gemm_g.weight",
                "Gemm_g.bias",
                "buffers.k",
            ]
        );
        assert_eq!(model.constants().len(), 1);
        assert_eq!(model.layers()[5].inputs, ["g", "k"]);
    }

    #[test]
    fn dense_weights_are_stored_out_by_in() {
        let model = rebuild(&small_cnn()).unwrap();
        let Some(TensorData::Float(weight)) = model.parameter("Gemm_g.weight") else {
            panic!("missing dense weight")
        };
        assert_eq!(weight.shape(), &[3, 32]);
        // fc_w[4, 1] == 13
        assert_eq!(weight[[1, 4]], 13.0);
        assert!(matches!(
            model.layers()[4].module,
            Module::Linear {
                in_features: 32,
                out_features: 3,
                bias: true
            }
        ));
    }

    #[test]
    fn batch_norm_tracks_no_batches() {
        let model = rebuild(&small_cnn()).unwrap();
        let Some(TensorData::Int64(steps)) =
            model.parameter("BatchNormalization_n.num_batches_tracked")
        else {
            panic!("missing batch counter")
        };
        assert_eq!(steps.ndim(), 0);
        let Module::BatchNorm2d { momentum, .. } = model.layers()[1].module else {
            panic!("expected a batch norm")
        };
        assert!((momentum - 0.1).abs() < 1e-6);
    }

    #[test]
    fn eval_leaves_training_mode() {
        let model = rebuild(&small_cnn()).unwrap();
        assert!(model.is_training());
        assert!(!model.eval().is_training());
    }

    #[test]
    fn names_are_sanitized_and_unique() {
        let mut used = HashSet::new();
        assert_eq!(unique(&mut used, sanitize("model/dense/MatMul:0")), "model_dense_MatMul_0");
        assert_eq!(unique(&mut used, sanitize("model/dense/MatMul:0")), "model_dense_MatMul_0_1");
        assert_eq!(sanitize("3x3"), "_3x3");
        assert_eq!(sanitize(""), "_");
    }

    #[test]
    fn dynamic_weights_stay_functional() {
        let model = GraphBuilder::new(13)
            .input("a", &[2, 2])
            .input("b", &[2, 2])
            .output("y", &[2, 2])
            .node(node("MatMul", &["a", "b"], &["y"]))
            .build();
        let model = rebuild(&model).unwrap();
        assert!(matches!(model.layers()[0].module, Module::Functional(Operator::MatMul)));
        assert!(model.state_dict().is_empty());
        assert_eq!(model.inputs().len(), 2);
    }
}
