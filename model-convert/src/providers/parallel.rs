use ndarray::{Array1, Array2, Array4, ArrayD};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::operators::{
    BatchNormAttributes, ClipAttributes, ConvAttributes, GemmAttributes, PoolAttributes,
};

use super::naive::{gemm_bias, gemm_operands, ConvProblem, PoolKind, PoolProblem};
use super::{NaiveProvider, OperationError, Provider};

/// Provider that splits the heavy kernels over the session thread pool.
/// Every operation falls back to [`NaiveProvider`] on a single thread.
pub struct ParNaiveProvider;

/// Assembles `[batch, channel]` planes computed in parallel into one tensor.
fn assemble_planes<F>(thread_pool: &ThreadPool, out_shape: [usize; 4], plane: F) -> ArrayD<f32>
where
    F: Fn(usize, usize) -> Array2<f32> + Sync,
{
    let [batch_size, channels, _, _] = out_shape;
    let planes: Vec<((usize, usize), Array2<f32>)> = thread_pool.install(|| {
        (0..batch_size * channels)
            .into_par_iter()
            .map(|i| {
                let (batch, channel) = (i / channels, i % channels);
                ((batch, channel), plane(batch, channel))
            })
            .collect()
    });

    let mut output = Array4::<f32>::zeros(out_shape);
    for ((batch, channel), values) in planes {
        output
            .slice_mut(ndarray::s![batch, channel, .., ..])
            .assign(&values);
    }
    output.into_dyn()
}

impl Provider for ParNaiveProvider {
    const NAME: &'static str = "ParNaive";

    fn add(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::add(thread_pool, x, y)
    }

    fn sub(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::sub(thread_pool, x, y)
    }

    fn mul(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::mul(thread_pool, x, y)
    }

    fn div(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::div(thread_pool, x, y)
    }

    fn relu(thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32> {
        NaiveProvider::relu(thread_pool, x)
    }

    fn leaky_relu(thread_pool: &ThreadPool, x: ArrayD<f32>, alpha: f32) -> ArrayD<f32> {
        NaiveProvider::leaky_relu(thread_pool, x, alpha)
    }

    fn sigmoid(thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32> {
        NaiveProvider::sigmoid(thread_pool, x)
    }

    fn tanh(thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32> {
        NaiveProvider::tanh(thread_pool, x)
    }

    fn clip(thread_pool: &ThreadPool, x: ArrayD<f32>, attrs: ClipAttributes) -> ArrayD<f32> {
        NaiveProvider::clip(thread_pool, x, attrs)
    }

    fn softmax(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        axis: i64,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::softmax(thread_pool, x, axis)
    }

    fn global_average_pool(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::global_average_pool(thread_pool, x)
    }

    fn batch_norm(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        scale: ArrayD<f32>,
        b: ArrayD<f32>,
        mean: ArrayD<f32>,
        var: ArrayD<f32>,
        attrs: BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::batch_norm(thread_pool, x, scale, b, mean, var, attrs)
    }

    fn matmul(
        thread_pool: &ThreadPool,
        a: ArrayD<f32>,
        b: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        NaiveProvider::matmul(thread_pool, a, b)
    }

    fn gemm(
        thread_pool: &ThreadPool,
        a: ArrayD<f32>,
        b: ArrayD<f32>,
        c: Option<ArrayD<f32>>,
        attrs: GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        if thread_pool.current_num_threads() == 1 {
            return NaiveProvider::gemm(thread_pool, a, b, c, attrs);
        }
        let (act_a, act_b) = gemm_operands(a, b, &attrs)?;

        // rows of A are split among the workers
        let n = act_b.shape()[1];
        let rows: Vec<Array1<f32>> = thread_pool.install(|| {
            (0..act_a.shape()[0])
                .into_par_iter()
                .map(|i| attrs.alpha * act_a.row(i).dot(&act_b))
                .collect()
        });
        let mut product = Array2::<f32>::zeros((act_a.shape()[0], n));
        for (mut out_row, row) in product.outer_iter_mut().zip(rows) {
            out_row.assign(&row);
        }
        gemm_bias(product, c, attrs.beta)
    }

    fn max_pool(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        attrs: PoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        if thread_pool.current_num_threads() == 1 {
            return NaiveProvider::max_pool(thread_pool, x, attrs);
        }
        let problem = PoolProblem::new(x, attrs, PoolKind::Max)?;
        Ok(assemble_planes(
            thread_pool,
            problem.output_shape(),
            |batch, channel| problem.plane(batch, channel),
        ))
    }

    fn average_pool(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        attrs: PoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        if thread_pool.current_num_threads() == 1 {
            return NaiveProvider::average_pool(thread_pool, x, attrs);
        }
        let count_include_pad = attrs.count_include_pad;
        let problem = PoolProblem::new(x, attrs, PoolKind::Average { count_include_pad })?;
        Ok(assemble_planes(
            thread_pool,
            problem.output_shape(),
            |batch, channel| problem.plane(batch, channel),
        ))
    }

    fn conv(
        thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        weights: ArrayD<f32>,
        bias: Option<Array1<f32>>,
        attrs: ConvAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        if thread_pool.current_num_threads() == 1 {
            return NaiveProvider::conv(thread_pool, x, weights, bias, attrs);
        }
        let problem = ConvProblem::new(x, weights, bias, attrs)?;
        Ok(assemble_planes(
            thread_pool,
            problem.output_shape(),
            |batch, featmap| problem.plane(batch, featmap),
        ))
    }
}
