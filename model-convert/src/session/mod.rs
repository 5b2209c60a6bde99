//! Contains the session used to execute an ONNX model on the CPU.
//!
//! The session is created using a [`SessionBuilder`], which can be created using [`SessionBuilder::new`].
//!
//! The session runs inference on a model using the [`Session::run`] method, which feeds each graph input
//! by name and returns every graph output. [`dummy_run`] is the smoke test performed after a conversion:
//! one forward pass over an all-zero batch.

mod execution;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use petgraph::{algo::toposort, Direction};
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

use crate::{
    graph::{create_graph, GraphError, RuntimeNode},
    onnx_format::{read_model_proto, ModelProto, ModelReadError},
    operators::{OperationError, Operator},
    providers::{DefaultProvider, Provider},
    request::InputSignature,
    tensor::{GraphDimension, TensorData, TensorShape},
};

use self::execution::execute_operation;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("the model could not be read: {0}")]
    CouldNotReadModel(#[from] ModelReadError),
    #[error("the model could not be translated into an executable graph: {0}")]
    CouldNotTranslateModel(#[from] GraphError),
    #[error("node {node} failed: {source}")]
    CouldNotExecuteOperation {
        node: String,
        #[source]
        source: OperationError,
    },
    #[error("the model's graph is not a DAG")]
    InvalidModel,
    #[error("no value was provided for the graph input {0}")]
    MissingInput(String),
    #[error("the model does not declare any output")]
    OutputNodeNotFound,
    #[error("the thread pool could not be created: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub num_threads: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { num_threads: 1 }
    }
}

#[derive(Clone, Debug)]
pub struct SessionBuilder {
    model_path: PathBuf,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new<P: AsRef<Path>>(model_path: P) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            config: SessionConfig::default(),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        let model = read_model_proto(&self.model_path)?;
        Session::new(model, self.config)
    }
}

/// One executed node, as seen by an observer of [`Session::run_with_observer`].
pub struct ExecutionStep<'a> {
    pub node: &'a RuntimeNode,
    /// Operands by input slot; omitted optional inputs are `None`.
    pub inputs: &'a [Option<TensorData>],
    pub output: &'a TensorData,
}

pub struct Session {
    model: ModelProto,
    config: SessionConfig,
    thread_pool: ThreadPool,
}

impl Session {
    pub fn new(model: ModelProto, config: SessionConfig) -> Result<Self, SessionError> {
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(config.num_threads.max(1))
            .build()?;
        Ok(Self {
            model,
            config,
            thread_pool,
        })
    }

    pub fn current_config(&self) -> SessionConfig {
        self.config.clone()
    }

    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    /// Declared graph inputs that have to be fed, initializers excluded.
    pub fn inputs(&self) -> Result<Vec<TensorShape>, SessionError> {
        let graph = create_graph(&self.model)?;
        Ok(graph
            .node_weights()
            .filter_map(|node| match &node.operator {
                Operator::InputFeed(shape) => Some(shape.clone()),
                _ => None,
            })
            .collect())
    }

    /// Runs the model using the default execution provider.
    /// Outputs are returned in the order the graph declares them.
    pub fn run(
        &self,
        inputs: HashMap<String, TensorData>,
    ) -> Result<Vec<(String, TensorData)>, SessionError> {
        self.run_with_provider::<DefaultProvider>(inputs)
    }

    /// Runs the model using the chosen execution provider.
    pub fn run_with_provider<P: Provider>(
        &self,
        inputs: HashMap<String, TensorData>,
    ) -> Result<Vec<(String, TensorData)>, SessionError> {
        self.run_with_observer::<P, _>(inputs, |_| {})
    }

    /// Runs the model, calling `observer` after each executed node.
    pub fn run_with_observer<P, O>(
        &self,
        inputs: HashMap<String, TensorData>,
        mut observer: O,
    ) -> Result<Vec<(String, TensorData)>, SessionError>
    where
        P: Provider,
        O: FnMut(&ExecutionStep<'_>),
    {
        let operations_graph = create_graph(&self.model)?;
        let ordered_operation_list =
            toposort(&operations_graph, None).map_err(|_| SessionError::InvalidModel)?;
        info!(
            "Running {} nodes with the {} provider on {} thread(s)",
            ordered_operation_list.len(),
            P::NAME,
            self.thread_pool.current_num_threads()
        );

        let mut outputs = Vec::new();
        for node in ordered_operation_list {
            let runtime_node = &operations_graph[node];

            let mut incoming_data: Vec<Option<TensorData>> = vec![None; runtime_node.inputs.len()];
            for edge in operations_graph.edges_directed(node, Direction::Incoming) {
                let slot = edge.weight().slot;
                if slot >= incoming_data.len() {
                    incoming_data.resize(slot + 1, None);
                }
                incoming_data[slot] = edge.weight().data.borrow_mut().take();
            }

            let outgoing_data = match &runtime_node.operator {
                Operator::InputFeed(shape) => {
                    let data = inputs
                        .get(&runtime_node.name)
                        .cloned()
                        .ok_or_else(|| SessionError::MissingInput(runtime_node.name.clone()))?;
                    check_declared_shape(shape, &data).map_err(|source| {
                        SessionError::CouldNotExecuteOperation {
                            node: runtime_node.name.clone(),
                            source,
                        }
                    })?;
                    data
                }
                Operator::OutputCollector(shape) => {
                    let data = incoming_data.into_iter().next().flatten().ok_or_else(|| {
                        SessionError::CouldNotExecuteOperation {
                            node: runtime_node.name.clone(),
                            source: OperationError::MissingInput(runtime_node.name.clone(), 0),
                        }
                    })?;
                    // output declarations are informative, only the rank is enforced
                    if !shape.dims.is_empty() && shape.dims.len() != data.shape().len() {
                        return Err(SessionError::CouldNotExecuteOperation {
                            node: runtime_node.name.clone(),
                            source: OperationError::WrongDim(shape.dims.len(), data.shape().len()),
                        });
                    }
                    outputs.push((runtime_node.name.clone(), data));
                    continue;
                }
                operator => {
                    let result = execute_operation::<P>(
                        &incoming_data,
                        operator,
                        &self.thread_pool,
                    )
                    .map_err(|source| SessionError::CouldNotExecuteOperation {
                        node: runtime_node.name.clone(),
                        source,
                    })?;
                    debug!(
                        "Executed {} ({}) -> {:?}",
                        runtime_node.name,
                        operator.name(),
                        result.shape()
                    );
                    observer(&ExecutionStep {
                        node: runtime_node,
                        inputs: &incoming_data,
                        output: &result,
                    });
                    result
                }
            };

            // for each outgoing edge, set the data to the outgoing data
            for edge in operations_graph.edges_directed(node, Direction::Outgoing) {
                edge.weight().data.replace(Some(outgoing_data.clone()));
            }
        }

        if outputs.is_empty() {
            return Err(SessionError::OutputNodeNotFound);
        }
        // collectors run in topological order, callers expect the declared one
        let declared: HashMap<&str, usize> = self
            .model
            .graph
            .iter()
            .flat_map(|graph| graph.output.iter())
            .enumerate()
            .filter_map(|(position, output)| Some((output.name.as_deref()?, position)))
            .collect();
        outputs.sort_by_key(|(name, _)| declared.get(name.as_str()).copied().unwrap_or(usize::MAX));
        Ok(outputs)
    }
}

fn check_declared_shape(shape: &TensorShape, data: &TensorData) -> Result<(), OperationError> {
    if let Some(elem_type) = shape.elem_type {
        if elem_type != data.dtype() {
            return Err(OperationError::InvalidTensorType(
                shape.name.clone(),
                format!("{:?}", data.dtype()),
            ));
        }
    }
    if !shape.accepts(data.shape()) {
        let required = shape
            .dims
            .iter()
            .map(|dim| match dim {
                GraphDimension::Value(v) => v.to_string(),
                GraphDimension::Parameter(p) => p.clone(),
            })
            .collect();
        return Err(OperationError::UnexpectedInputShape(
            required,
            data.shape().to_vec(),
        ));
    }
    Ok(())
}

/// Builds a session for the model at `path`, runs one forward pass over an all-zero
/// `(1, H, W, C)` batch fed as the signature's input and returns the shape of the first output.
pub fn dummy_run<P: AsRef<Path>>(
    path: P,
    signature: &InputSignature,
    config: SessionConfig,
) -> Result<Vec<usize>, SessionError> {
    let session = SessionBuilder::new(path).config(config).build()?;
    let shape = signature.shape.batch_shape();
    debug!(
        "Feeding an all-zero tensor of shape {:?} as {}",
        shape, signature.name
    );
    let inputs = HashMap::from([(
        signature.name.clone(),
        TensorData::Float(ArrayD::zeros(IxDyn(&shape))),
    )]);
    let outputs = session.run(inputs)?;
    let (name, first) = outputs
        .into_iter()
        .next()
        .ok_or(SessionError::OutputNodeNotFound)?;
    info!("Dummy run succeeded, output {} has shape {:?}", name, first.shape());
    Ok(first.shape().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::builder::{node, GraphBuilder};
    use crate::onnx_format::write_model_proto;
    use crate::request::InputShape;

    fn scaled_relu(dims: &[i64]) -> ModelProto {
        GraphBuilder::new(13)
            .input("input", dims)
            .output("y", &[-1, 2, 2, 3])
            .initializer("k", &[], vec![2.0])
            .node(node("Mul", &["input", "k"], &["m"]))
            .node(node("Relu", &["m"], &["y"]))
            .build()
    }

    #[test]
    fn dummy_run_reports_the_output_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        write_model_proto(&scaled_relu(&[-1, 2, 2, 3]), &path).unwrap();

        let signature = InputSignature::new(InputShape::new(2, 2, 3), "input");
        let shape = dummy_run(&path, &signature, SessionConfig { num_threads: 2 }).unwrap();
        assert_eq!(shape, [1, 2, 2, 3]);
    }

    #[test]
    fn dummy_run_rejects_a_mismatching_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        write_model_proto(&scaled_relu(&[-1, 2, 2, 3]), &path).unwrap();

        let wrong_shape = InputSignature::new(InputShape::new(4, 4, 3), "input");
        assert!(matches!(
            dummy_run(&path, &wrong_shape, SessionConfig::default()),
            Err(SessionError::CouldNotExecuteOperation { .. })
        ));

        let wrong_name = InputSignature::new(InputShape::new(2, 2, 3), "image");
        assert!(matches!(
            dummy_run(&path, &wrong_name, SessionConfig::default()),
            Err(SessionError::MissingInput(name)) if name == "input"
        ));
    }

    #[test]
    fn dummy_run_reports_the_first_declared_output() {
        let mut flatten = node("Flatten", &["early"], &["late"]);
        flatten
            .attribute
            .push(crate::onnx_format::builder::int_attribute("axis", 1));
        let model = GraphBuilder::new(13)
            .input("input", &[-1, 2, 2, 3])
            .output("late", &[-1, 12])
            .output("early", &[-1, 2, 2, 3])
            .node(node("Relu", &["input"], &["early"]))
            .node(flatten)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        write_model_proto(&model, &path).unwrap();

        let signature = InputSignature::new(InputShape::new(2, 2, 3), "input");
        let shape = dummy_run(&path, &signature, SessionConfig::default()).unwrap();
        assert_eq!(shape, [1, 12]);

        let session = Session::new(model, SessionConfig::default()).unwrap();
        let zeros = TensorData::Float(ArrayD::zeros(IxDyn(&[1, 2, 2, 3])));
        let outputs = session
            .run(HashMap::from([(String::from("input"), zeros)]))
            .unwrap();
        let names: Vec<&str> = outputs.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["late", "early"]);
    }

    #[test]
    fn missing_model_cannot_be_read() {
        let signature = InputSignature::new(InputShape::new(2, 2, 3), "input");
        assert!(matches!(
            dummy_run("does-not-exist.onnx", &signature, SessionConfig::default()),
            Err(SessionError::CouldNotReadModel(_))
        ));
    }
}
