mod naive;
mod parallel;

pub use naive::*;
pub use parallel::*;

use ndarray::{Array1, ArrayD};
use rayon::ThreadPool;

use crate::operators::{
    BatchNormAttributes, ClipAttributes, ConvAttributes, GemmAttributes, OperationError,
    PoolAttributes,
};

pub type DefaultProvider = ParNaiveProvider;

/// A trait that has to be implemented by all the execution providers.
/// It contains the floating point kernels used to execute the ONNX operators;
/// operators that only move data around are shared by every provider
/// (see [`crate::operators`]).
///
/// Every provider executes on the CPU, using the given thread pool when it is
/// able to parallelize an operation.
pub trait Provider {
    /// Name of the execution provider, reported in the logs.
    const NAME: &'static str;

    fn conv(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        weights: ArrayD<f32>,
        bias: Option<Array1<f32>>,
        attrs: ConvAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn max_pool(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        attrs: PoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn average_pool(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        attrs: PoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn global_average_pool(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn batch_norm(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        scale: ArrayD<f32>,
        b: ArrayD<f32>,
        mean: ArrayD<f32>,
        var: ArrayD<f32>,
        attrs: BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn gemm(
        thread_pool: &ThreadPool,
        a: ArrayD<f32>,
        b: ArrayD<f32>,
        c: Option<ArrayD<f32>>,
        attrs: GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn matmul(
        thread_pool: &ThreadPool,
        a: ArrayD<f32>,
        b: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn add(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn sub(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn mul(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn div(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError>;

    fn relu(thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32>;

    fn leaky_relu(thread_pool: &ThreadPool, x: ArrayD<f32>, alpha: f32) -> ArrayD<f32>;

    fn sigmoid(thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32>;

    fn tanh(thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32>;

    fn clip(thread_pool: &ThreadPool, x: ArrayD<f32>, attrs: ClipAttributes) -> ArrayD<f32>;

    fn softmax(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        axis: i64,
    ) -> Result<ArrayD<f32>, OperationError>;
}
