use ndarray::{Array1, Array2, Array4, ArrayD, Axis, Ix2, Ix4, IxDyn};
use rayon::ThreadPool;
use std::ops::Range;

use crate::operators::{
    broadcast_binary, normalize_axis, BatchNormAttributes, ClipAttributes, ConvAttributes,
    GemmAttributes, PoolAttributes, WindowGeometry,
};

use super::{OperationError, Provider};

pub struct NaiveProvider;

/// Checked operands of a convolution, shared by the providers.
pub(crate) struct ConvProblem {
    pub x: Array4<f32>,
    pub weights: Array4<f32>,
    pub bias: Array1<f32>,
    pub geometry: WindowGeometry,
    pub groups: usize,
}

impl ConvProblem {
    pub fn new(
        x: ArrayD<f32>,
        weights: ArrayD<f32>,
        bias: Option<Array1<f32>>,
        attrs: ConvAttributes,
    ) -> Result<Self, OperationError> {
        let x = into_4d(x)?;
        let weights = into_4d(weights)?;
        let [_, in_chans, height, width] = *x.shape() else {
            return Err(OperationError::WrongDim(4, x.ndim()));
        };
        let [n_featmaps, group_chans, kern_h, kern_w] = *weights.shape() else {
            return Err(OperationError::WrongDim(4, weights.ndim()));
        };
        if let Some(kernel_shape) = attrs.kernel_shape {
            if kernel_shape != [kern_h, kern_w] {
                return Err(OperationError::WrongShape(
                    format!("[*, *, {}, {}]", kernel_shape[0], kernel_shape[1]),
                    format!("[*, *, {}, {}]", kern_h, kern_w),
                ));
            }
        }
        let groups = attrs.group.max(1);
        if group_chans * groups != in_chans || n_featmaps % groups != 0 {
            return Err(OperationError::WrongShape(
                format!("{} input channels in {} groups", group_chans * groups, groups),
                format!("{} input channels", in_chans),
            ));
        }
        let bias = bias.unwrap_or_else(|| Array1::zeros(n_featmaps));
        if bias.len() != n_featmaps {
            return Err(OperationError::WrongShape(
                format!("[{}]", n_featmaps),
                format!("[{}]", bias.len()),
            ));
        }
        let geometry = WindowGeometry::resolve(
            [height, width],
            [kern_h, kern_w],
            attrs.strides,
            attrs.dilations,
            attrs.auto_pad,
            attrs.pads,
        )?;
        Ok(Self {
            x,
            weights,
            bias,
            geometry,
            groups,
        })
    }

    pub fn output_shape(&self) -> [usize; 4] {
        [
            self.x.shape()[0],
            self.weights.shape()[0],
            self.geometry.output[0],
            self.geometry.output[1],
        ]
    }

    /// Input channels read by a feature map.
    fn group_channels(&self, featmap: usize) -> Range<usize> {
        let output_group_size = self.weights.shape()[0] / self.groups;
        let input_group_size = self.weights.shape()[1];
        let group = featmap / output_group_size;
        group * input_group_size..(group + 1) * input_group_size
    }

    /// Computes one output plane `[out_h, out_w]` for a batch element and feature map.
    pub fn plane(&self, batch: usize, featmap: usize) -> Array2<f32> {
        let WindowGeometry {
            // w = width, h = height; s = start
            kernel: [kern_h, kern_w],
            strides: [stride_h, stride_w],
            dilations: [dilat_h, dilat_w],
            pads: [pad_hs, pad_ws, _, _],
            output: [out_h, out_w],
        } = self.geometry;
        let height = self.x.shape()[2] as i64;
        let width = self.x.shape()[3] as i64;
        let channels = self.group_channels(featmap);

        Array2::from_shape_fn((out_h, out_w), |(out_row, out_col)| {
            let mut accumulator = self.bias[featmap];
            for (group_channel, channel) in channels.clone().enumerate() {
                for kern_row in 0..kern_h {
                    let input_row = (out_row * stride_h + kern_row * dilat_h) as i64 - pad_hs as i64;
                    if input_row < 0 || input_row >= height {
                        continue;
                    }
                    for kern_col in 0..kern_w {
                        let input_col =
                            (out_col * stride_w + kern_col * dilat_w) as i64 - pad_ws as i64;
                        if input_col < 0 || input_col >= width {
                            continue;
                        }
                        accumulator += self.x
                            [[batch, channel, input_row as usize, input_col as usize]]
                            * self.weights[[featmap, group_channel, kern_row, kern_col]];
                    }
                }
            }
            accumulator
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PoolKind {
    Max,
    Average { count_include_pad: bool },
}

/// Checked operands of a pooling operation, shared by the providers.
pub(crate) struct PoolProblem {
    pub x: Array4<f32>,
    pub geometry: WindowGeometry,
    pub kind: PoolKind,
}

impl PoolProblem {
    pub fn new(x: ArrayD<f32>, attrs: PoolAttributes, kind: PoolKind) -> Result<Self, OperationError> {
        let x = into_4d(x)?;
        let geometry = WindowGeometry::resolve(
            [x.shape()[2], x.shape()[3]],
            attrs.kernel_shape,
            attrs.strides,
            [1, 1],
            attrs.auto_pad,
            attrs.pads,
        )?;
        Ok(Self { x, geometry, kind })
    }

    pub fn output_shape(&self) -> [usize; 4] {
        [
            self.x.shape()[0],
            self.x.shape()[1],
            self.geometry.output[0],
            self.geometry.output[1],
        ]
    }

    pub fn plane(&self, batch: usize, channel: usize) -> Array2<f32> {
        let WindowGeometry {
            kernel: [kern_h, kern_w],
            strides: [stride_h, stride_w],
            pads: [pad_hs, pad_ws, _, _],
            output: [out_h, out_w],
            ..
        } = self.geometry;
        let height = self.x.shape()[2] as i64;
        let width = self.x.shape()[3] as i64;

        Array2::from_shape_fn((out_h, out_w), |(out_row, out_col)| {
            // window bounds clipped to the tensor, padding is never read
            let win_hs = (out_row * stride_h) as i64 - pad_hs as i64;
            let win_ws = (out_col * stride_w) as i64 - pad_ws as i64;
            let row_start = win_hs.clamp(0, height);
            let row_end = (win_hs + kern_h as i64).clamp(row_start, height);
            let col_start = win_ws.clamp(0, width);
            let col_end = (win_ws + kern_w as i64).clamp(col_start, width);
            let window = self.x.slice(ndarray::s![
                batch,
                channel,
                row_start as usize..row_end as usize,
                col_start as usize..col_end as usize
            ]);
            match self.kind {
                PoolKind::Max => window.fold(f32::MIN, |acc, v| acc.max(*v)),
                PoolKind::Average { count_include_pad } => {
                    let count = if count_include_pad {
                        kern_h * kern_w
                    } else {
                        window.len()
                    };
                    if count == 0 {
                        0.0
                    } else {
                        window.sum() / count as f32
                    }
                }
            }
        })
    }
}

pub(crate) fn into_4d(x: ArrayD<f32>) -> Result<Array4<f32>, OperationError> {
    let ndim = x.ndim();
    x.into_dimensionality::<Ix4>()
        .map_err(|_| OperationError::WrongDim(4, ndim))
}

fn into_2d(x: ArrayD<f32>) -> Result<Array2<f32>, OperationError> {
    let ndim = x.ndim();
    x.into_dimensionality::<Ix2>()
        .map_err(|_| OperationError::WrongDim(2, ndim))
}

/// Checked `Gemm` operands, already transposed as requested.
pub(crate) fn gemm_operands(
    a: ArrayD<f32>,
    b: ArrayD<f32>,
    attrs: &GemmAttributes,
) -> Result<(Array2<f32>, Array2<f32>), OperationError> {
    let act_a = into_2d(a)?;
    let act_b = into_2d(b)?;
    let act_a = if attrs.trans_a { act_a.reversed_axes() } else { act_a };
    let act_b = if attrs.trans_b { act_b.reversed_axes() } else { act_b };
    if act_a.shape()[1] != act_b.shape()[0] {
        return Err(OperationError::UnexpectedShape(
            format!("[*, {}]", act_a.shape()[1]),
            format!("[{}, *]", act_b.shape()[0]),
        ));
    }
    Ok((act_a, act_b))
}

pub(crate) fn gemm_bias(
    product: Array2<f32>,
    c: Option<ArrayD<f32>>,
    beta: f32,
) -> Result<ArrayD<f32>, OperationError> {
    let product = product.into_dyn();
    match c {
        Some(c) => broadcast_binary(&product, &c, |p, c| p + beta * c),
        None => Ok(product),
    }
}

impl Provider for NaiveProvider {
    const NAME: &'static str = "Naive";

    fn add(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        broadcast_binary(&x, &y, |a, b| a + b)
    }

    fn sub(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        broadcast_binary(&x, &y, |a, b| a - b)
    }

    fn mul(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        broadcast_binary(&x, &y, |a, b| a * b)
    }

    fn div(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        y: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        broadcast_binary(&x, &y, |a, b| a / b)
    }

    fn relu(_thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32> {
        x.mapv(|v| v.max(0.0))
    }

    fn leaky_relu(_thread_pool: &ThreadPool, x: ArrayD<f32>, alpha: f32) -> ArrayD<f32> {
        x.mapv(|v| if v < 0.0 { alpha * v } else { v })
    }

    fn sigmoid(_thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32> {
        x.mapv(|v| 1.0 / (1.0 + (-v).exp()))
    }

    fn tanh(_thread_pool: &ThreadPool, x: ArrayD<f32>) -> ArrayD<f32> {
        x.mapv(f32::tanh)
    }

    fn clip(_thread_pool: &ThreadPool, x: ArrayD<f32>, attrs: ClipAttributes) -> ArrayD<f32> {
        let ClipAttributes {
            min: min_v,
            max: max_v,
        } = attrs;
        x.mapv(|x| x.max(min_v).min(max_v))
    }

    fn softmax(
        _thread_pool: &ThreadPool,
        mut x: ArrayD<f32>,
        axis: i64,
    ) -> Result<ArrayD<f32>, OperationError> {
        let axis = normalize_axis(axis, x.ndim())?;
        for mut lane in x.lanes_mut(Axis(axis)) {
            let max = lane.fold(f32::MIN, |acc, v| acc.max(*v));
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.sum();
            lane.mapv_inplace(|v| v / sum);
        }
        Ok(x)
    }

    fn global_average_pool(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        let x = into_4d(x)?;
        let [batch_size, channels, height, width] = *x.shape() else {
            return Err(OperationError::WrongDim(4, x.ndim()));
        };
        let area = (height * width) as f32;
        Ok(ArrayD::from_shape_fn(
            IxDyn(&[batch_size, channels, 1, 1]),
            |idx| x.slice(ndarray::s![idx[0], idx[1], .., ..]).sum() / area,
        ))
    }

    fn gemm(
        _thread_pool: &ThreadPool,
        a: ArrayD<f32>,
        b: ArrayD<f32>,
        c: Option<ArrayD<f32>>,
        attrs: GemmAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let (act_a, act_b) = gemm_operands(a, b, &attrs)?;
        gemm_bias(attrs.alpha * act_a.dot(&act_b), c, attrs.beta)
    }

    fn matmul(
        _thread_pool: &ThreadPool,
        a: ArrayD<f32>,
        b: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OperationError> {
        let mismatch = |a: &[usize], b: &[usize]| {
            OperationError::UnexpectedShape(format!("{:?}", a), format!("{:?}", b))
        };
        if a.ndim() == 0 || b.ndim() == 0 {
            return Err(mismatch(a.shape(), b.shape()));
        }
        // 1-D operands are promoted to matrices and the extra axis removed afterwards
        let (a, squeeze_rows) = if a.ndim() == 1 {
            (a.insert_axis(Axis(0)), true)
        } else {
            (a, false)
        };
        let (b, squeeze_cols) = if b.ndim() == 1 {
            (b.insert_axis(Axis(1)), true)
        } else {
            (b, false)
        };
        let a_shape = a.shape().to_vec();
        let b_shape = b.shape().to_vec();
        let (k, n) = (b_shape[b_shape.len() - 2], b_shape[b_shape.len() - 1]);
        if a_shape[a_shape.len() - 1] != k {
            return Err(mismatch(&a_shape, &b_shape));
        }

        let mut out_shape = a_shape.clone();
        let last = out_shape.len() - 1;
        out_shape[last] = n;

        let result = if b.ndim() == 2 {
            // batch dimensions of `a` are folded into the rows
            let rows = a_shape[..a_shape.len() - 1].iter().product::<usize>();
            let a2 = a
                .as_standard_layout()
                .into_owned()
                .into_shape((rows, k))
                .map_err(|_| mismatch(&a_shape, &b_shape))?;
            a2.dot(&into_2d(b)?).into_dyn()
        } else {
            if a_shape[..a_shape.len() - 2] != b_shape[..b_shape.len() - 2] {
                return Err(mismatch(&a_shape, &b_shape));
            }
            let rows = a_shape[a_shape.len() - 2];
            let batch = a_shape[..a_shape.len() - 2].iter().product::<usize>();
            let a3 = a
                .as_standard_layout()
                .into_owned()
                .into_shape((batch, rows, k))
                .map_err(|_| mismatch(&a_shape, &b_shape))?;
            let b3 = b
                .as_standard_layout()
                .into_owned()
                .into_shape((batch, k, n))
                .map_err(|_| mismatch(&a_shape, &b_shape))?;
            let mut stacked = ndarray::Array3::<f32>::zeros((batch, rows, n));
            for i in 0..batch {
                let product = a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i));
                stacked.index_axis_mut(Axis(0), i).assign(&product);
            }
            stacked.into_dyn()
        };
        let result = result
            .into_shape(IxDyn(&out_shape))
            .map_err(|_| mismatch(&a_shape, &b_shape))?;
        Ok(squeeze_matmul(result, squeeze_rows, squeeze_cols))
    }

    fn batch_norm(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        scale: ArrayD<f32>,
        b: ArrayD<f32>,
        mean: ArrayD<f32>,
        var: ArrayD<f32>,
        attrs: BatchNormAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        // checks
        if x.ndim() < 2 {
            return Err(OperationError::WrongDim(4, x.ndim()));
        }
        let channels = x.shape()[1];
        for param in [&scale, &b, &mean, &var] {
            if param.ndim() != 1 {
                return Err(OperationError::WrongDim(1, param.ndim()));
            }
            if param.len() != channels {
                return Err(OperationError::WrongShape(
                    format!("[{}]", channels),
                    format!("[{}]", param.len()),
                ));
            }
        }

        // parameters are broadcast as [1, C, 1, ...]
        let mut param_shape = vec![1; x.ndim()];
        param_shape[1] = channels;
        let as_param = |p: ArrayD<f32>| {
            let actual = format!("{:?}", p.shape());
            p.into_shape(IxDyn(&param_shape))
                .map_err(|_| OperationError::WrongShape(format!("{:?}", param_shape), actual))
        };
        let mean = as_param(mean)?;
        let b = as_param(b)?;
        let scale = as_param(scale)?;
        let var = as_param(var)?;

        let x_normalized = (x - mean) / (var + attrs.epsilon).mapv(|v| v.sqrt());
        Ok(scale * x_normalized + b)
    }

    fn max_pool(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        attrs: PoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let problem = PoolProblem::new(x, attrs, PoolKind::Max)?;
        Ok(pool_sequential(&problem))
    }

    fn average_pool(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        attrs: PoolAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let count_include_pad = attrs.count_include_pad;
        let problem = PoolProblem::new(x, attrs, PoolKind::Average { count_include_pad })?;
        Ok(pool_sequential(&problem))
    }

    fn conv(
        _thread_pool: &ThreadPool,
        x: ArrayD<f32>,
        weights: ArrayD<f32>,
        bias: Option<Array1<f32>>,
        attrs: ConvAttributes,
    ) -> Result<ArrayD<f32>, OperationError> {
        let problem = ConvProblem::new(x, weights, bias, attrs)?;
        let out_shape = problem.output_shape();
        let mut output = Array4::<f32>::zeros(out_shape);
        for batch in 0..out_shape[0] {
            for featmap in 0..out_shape[1] {
                output
                    .slice_mut(ndarray::s![batch, featmap, .., ..])
                    .assign(&problem.plane(batch, featmap));
            }
        }
        Ok(output.into_dyn())
    }
}

fn pool_sequential(problem: &PoolProblem) -> ArrayD<f32> {
    let out_shape = problem.output_shape();
    let mut output = Array4::<f32>::zeros(out_shape);
    for batch in 0..out_shape[0] {
        for channel in 0..out_shape[1] {
            output
                .slice_mut(ndarray::s![batch, channel, .., ..])
                .assign(&problem.plane(batch, channel));
        }
    }
    output.into_dyn()
}

fn squeeze_matmul(result: ArrayD<f32>, squeeze_rows: bool, squeeze_cols: bool) -> ArrayD<f32> {
    let ndim = result.ndim();
    let result = if squeeze_cols {
        result.index_axis_move(Axis(ndim - 1), 0)
    } else {
        result
    };
    if squeeze_rows {
        let ndim = result.ndim();
        let axis = if squeeze_cols { ndim - 1 } else { ndim - 2 };
        result.index_axis_move(Axis(axis), 0)
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rayon::ThreadPoolBuilder;

    fn pool() -> ThreadPool {
        ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    #[test]
    fn conv_with_padding_sums_the_neighbourhood() {
        let x = ArrayD::from_elem(IxDyn(&[1, 1, 3, 3]), 1.0f32);
        let w = ArrayD::from_elem(IxDyn(&[1, 1, 3, 3]), 1.0f32);
        let attrs = ConvAttributes::new([1, 1], 1, [3, 3], [1, 1, 1, 1], [1, 1]);
        let y = NaiveProvider::conv(&pool(), x, w, Some(arr1(&[0.5])), attrs).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 3]);
        assert_eq!(y[[0, 0, 0, 0]], 4.5);
        assert_eq!(y[[0, 0, 1, 1]], 9.5);
    }

    #[test]
    fn depthwise_conv_keeps_channels_apart() {
        let mut x = ArrayD::zeros(IxDyn(&[1, 2, 2, 2]));
        x.slice_mut(ndarray::s![0, 1, .., ..]).fill(1.0f32);
        let w = ArrayD::from_elem(IxDyn(&[2, 1, 2, 2]), 1.0f32);
        let attrs = ConvAttributes {
            group: 2,
            ..Default::default()
        };
        let y = NaiveProvider::conv(&pool(), x, w, None, attrs).unwrap();
        assert_eq!(y.shape(), &[1, 2, 1, 1]);
        assert_eq!(y[[0, 0, 0, 0]], 0.0);
        assert_eq!(y[[0, 1, 0, 0]], 4.0);
    }

    #[test]
    fn max_and_average_pool() {
        let x = arr2(&[[1.0f32, 2.0], [3.0, 4.0]])
            .into_shape(IxDyn(&[1, 1, 2, 2]))
            .unwrap();
        let attrs = PoolAttributes::new([2, 2], [0; 4], [2, 2]);
        let max = NaiveProvider::max_pool(&pool(), x.clone(), attrs.clone()).unwrap();
        let avg = NaiveProvider::average_pool(&pool(), x, attrs).unwrap();
        assert_eq!(max[[0, 0, 0, 0]], 4.0);
        assert_eq!(avg[[0, 0, 0, 0]], 2.5);
    }

    #[test]
    fn gemm_with_transposed_weights_and_bias() {
        let a = arr2(&[[1.0f32, 2.0]]).into_dyn();
        let b = arr2(&[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0]]).into_dyn();
        let c = arr1(&[0.0f32, 1.0, 2.0]).into_dyn();
        let attrs = GemmAttributes::new(1.0, 1.0, false, true);
        let y = NaiveProvider::gemm(&pool(), a, b, Some(c), attrs).unwrap();
        assert_eq!(y, arr2(&[[1.0f32, 3.0, 5.0]]).into_dyn());
    }

    #[test]
    fn matmul_folds_batch_dimensions() {
        let a = ArrayD::from_elem(IxDyn(&[2, 3, 4]), 1.0f32);
        let b = ArrayD::from_elem(IxDyn(&[4, 5]), 2.0f32);
        let y = NaiveProvider::matmul(&pool(), a, b).unwrap();
        assert_eq!(y.shape(), &[2, 3, 5]);
        assert_eq!(y[[1, 2, 4]], 8.0);
    }

    #[test]
    fn matmul_vector_operand() {
        let a = arr1(&[1.0f32, 2.0]).into_dyn();
        let b = arr2(&[[1.0f32, 0.0, 1.0], [0.0, 1.0, 1.0]]).into_dyn();
        let y = NaiveProvider::matmul(&pool(), a, b).unwrap();
        assert_eq!(y, arr1(&[1.0f32, 2.0, 3.0]).into_dyn());
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = arr2(&[[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]]).into_dyn();
        let y = NaiveProvider::softmax(&pool(), x, -1).unwrap();
        for row in y.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((y[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn batch_norm_normalizes_per_channel() {
        let x = ArrayD::from_elem(IxDyn(&[1, 2, 1, 1]), 3.0f32);
        let ones = arr1(&[1.0f32, 1.0]).into_dyn();
        let zeros = arr1(&[0.0f32, 0.0]).into_dyn();
        let mean = arr1(&[1.0f32, 3.0]).into_dyn();
        let y = NaiveProvider::batch_norm(
            &pool(),
            x,
            ones.clone(),
            zeros,
            mean,
            ones,
            BatchNormAttributes::new(0.0, 0.9),
        )
        .unwrap();
        assert_eq!(y[[0, 0, 0, 0]], 2.0);
        assert_eq!(y[[0, 1, 0, 0]], 0.0);
    }
}
