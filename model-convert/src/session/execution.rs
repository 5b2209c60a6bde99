use ndarray::{ArrayD, Ix1};
use rayon::ThreadPool;

use crate::{
    operators::*,
    providers::Provider,
    tensor::TensorData,
};

fn operand<'a>(
    inputs: &'a [Option<TensorData>],
    slot: usize,
    operator: &Operator,
) -> Result<&'a TensorData, OperationError> {
    inputs
        .get(slot)
        .and_then(|input| input.as_ref())
        .ok_or_else(|| OperationError::MissingInput(operator.name(), slot))
}

fn optional_operand(inputs: &[Option<TensorData>], slot: usize) -> Option<&TensorData> {
    inputs.get(slot).and_then(|input| input.as_ref())
}

fn float_operand(
    inputs: &[Option<TensorData>],
    slot: usize,
    operator: &Operator,
    operand_name: &str,
) -> Result<ArrayD<f32>, OperationError> {
    match operand(inputs, slot, operator)? {
        TensorData::Float(x) => Ok(x.clone()),
        _ => Err(OperationError::InvalidTensorType(
            operator.name(),
            String::from(operand_name),
        )),
    }
}

fn scalar_f32(data: &TensorData, operator: &Operator, operand_name: &str) -> Result<f32, OperationError> {
    let invalid = || OperationError::InvalidTensorType(operator.name(), String::from(operand_name));
    let TensorData::Float(x) = data else {
        return Err(invalid());
    };
    if x.len() != 1 {
        return Err(invalid());
    }
    x.iter().next().copied().ok_or_else(invalid)
}

fn i64_operand(data: &TensorData, operator: &Operator, operand_name: &str) -> Result<Vec<i64>, OperationError> {
    data.to_i64_vec().ok_or_else(|| {
        OperationError::InvalidTensorType(operator.name(), String::from(operand_name))
    })
}

/// Element-wise arithmetic, on floats through the provider and on integers for shape computations.
fn arithmetic<P: Provider>(
    inputs: &[Option<TensorData>],
    operator: &Operator,
    thread_pool: &ThreadPool,
) -> Result<TensorData, OperationError> {
    let lhs = operand(inputs, 0, operator)?;
    let rhs = operand(inputs, 1, operator)?;
    match (lhs, rhs) {
        (TensorData::Float(a), TensorData::Float(b)) => {
            let (a, b) = (a.clone(), b.clone());
            let result = match operator {
                Operator::Add => P::add(thread_pool, a, b)?,
                Operator::Sub => P::sub(thread_pool, a, b)?,
                Operator::Mul => P::mul(thread_pool, a, b)?,
                _ => P::div(thread_pool, a, b)?,
            };
            Ok(TensorData::Float(result))
        }
        (TensorData::Int64(a), TensorData::Int64(b)) => {
            let result = match operator {
                Operator::Add => broadcast_binary(a, b, i64::wrapping_add)?,
                Operator::Sub => broadcast_binary(a, b, i64::wrapping_sub)?,
                Operator::Mul => broadcast_binary(a, b, i64::wrapping_mul)?,
                _ => broadcast_binary(a, b, |x, y| x.checked_div(y).unwrap_or(0))?,
            };
            Ok(TensorData::Int64(result))
        }
        (TensorData::Int32(a), TensorData::Int32(b)) => {
            let result = match operator {
                Operator::Add => broadcast_binary(a, b, i32::wrapping_add)?,
                Operator::Sub => broadcast_binary(a, b, i32::wrapping_sub)?,
                Operator::Mul => broadcast_binary(a, b, i32::wrapping_mul)?,
                _ => broadcast_binary(a, b, |x, y| x.checked_div(y).unwrap_or(0))?,
            };
            Ok(TensorData::Int32(result))
        }
        _ => Err(OperationError::InvalidTensorType(
            operator.name(),
            String::from("B"),
        )),
    }
}

pub(super) fn execute_operation<P>(
    inputs: &[Option<TensorData>],
    operator: &Operator,
    thread_pool: &ThreadPool,
) -> Result<TensorData, OperationError>
where
    P: Provider,
{
    match operator {
        Operator::Constant(data) => Ok(data.clone()),
        Operator::InputFeed(_) | Operator::OutputCollector(_) | Operator::Identity => {
            Ok(operand(inputs, 0, operator)?.clone())
        }
        Operator::Convolution(attrs) => {
            let x = float_operand(inputs, 0, operator, "X")?;
            let weights = float_operand(inputs, 1, operator, "W")?;
            let bias = match optional_operand(inputs, 2) {
                Some(TensorData::Float(b)) => {
                    let ndim = b.ndim();
                    Some(
                        b.clone()
                            .into_dimensionality::<Ix1>()
                            .map_err(|_| OperationError::WrongDim(1, ndim))?,
                    )
                }
                Some(_) => {
                    return Err(OperationError::InvalidTensorType(
                        operator.name(),
                        String::from("B"),
                    ))
                }
                None => None,
            };
            Ok(TensorData::Float(P::conv(
                thread_pool,
                x,
                weights,
                bias,
                attrs.clone(),
            )?))
        }
        Operator::MaxPool(attrs) => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::max_pool(thread_pool, x, attrs.clone())?))
        }
        Operator::AveragePool(attrs) => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::average_pool(
                thread_pool,
                x,
                attrs.clone(),
            )?))
        }
        Operator::GlobalAveragePool => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::global_average_pool(thread_pool, x)?))
        }
        Operator::BatchNorm(attrs) => {
            let x = float_operand(inputs, 0, operator, "X")?;
            let scale = float_operand(inputs, 1, operator, "scale")?;
            let b = float_operand(inputs, 2, operator, "B")?;
            let mean = float_operand(inputs, 3, operator, "input_mean")?;
            let var = float_operand(inputs, 4, operator, "input_var")?;
            Ok(TensorData::Float(P::batch_norm(
                thread_pool,
                x,
                scale,
                b,
                mean,
                var,
                attrs.clone(),
            )?))
        }
        Operator::Gemm(attrs) => {
            let a = float_operand(inputs, 0, operator, "A")?;
            let b = float_operand(inputs, 1, operator, "B")?;
            let c = match optional_operand(inputs, 2) {
                Some(_) => Some(float_operand(inputs, 2, operator, "C")?),
                None => None,
            };
            Ok(TensorData::Float(P::gemm(
                thread_pool,
                a,
                b,
                c,
                attrs.clone(),
            )?))
        }
        Operator::MatMul => {
            let a = float_operand(inputs, 0, operator, "A")?;
            let b = float_operand(inputs, 1, operator, "B")?;
            Ok(TensorData::Float(P::matmul(thread_pool, a, b)?))
        }
        Operator::Add | Operator::Sub | Operator::Mul | Operator::Div => {
            arithmetic::<P>(inputs, operator, thread_pool)
        }
        Operator::ReLU => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::relu(thread_pool, x)))
        }
        Operator::LeakyReLU(alpha) => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::leaky_relu(thread_pool, x, *alpha)))
        }
        Operator::Sigmoid => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::sigmoid(thread_pool, x)))
        }
        Operator::Tanh => {
            let x = float_operand(inputs, 0, operator, "X")?;
            Ok(TensorData::Float(P::tanh(thread_pool, x)))
        }
        Operator::Softmax(axis) => {
            let x = float_operand(inputs, 0, operator, "input")?;
            Ok(TensorData::Float(P::softmax(thread_pool, x, *axis)?))
        }
        Operator::Clip(attrs) => {
            let x = float_operand(inputs, 0, operator, "input")?;
            // since opset 11 the bounds are optional inputs
            let min = match optional_operand(inputs, 1) {
                Some(min) => scalar_f32(min, operator, "min")?,
                None => attrs.min,
            };
            let max = match optional_operand(inputs, 2) {
                Some(max) => scalar_f32(max, operator, "max")?,
                None => attrs.max,
            };
            Ok(TensorData::Float(P::clip(
                thread_pool,
                x,
                ClipAttributes::new(min, max),
            )))
        }
        Operator::Reshape => {
            let x = operand(inputs, 0, operator)?;
            let requested = i64_operand(operand(inputs, 1, operator)?, operator, "shape")?;
            let dims = reshape_target(x.shape(), &requested, false)?;
            reshape(x.clone(), &dims)
        }
        Operator::Flatten(axis) => flatten(operand(inputs, 0, operator)?.clone(), *axis),
        Operator::Transpose(perm) => {
            transpose(operand(inputs, 0, operator)?.clone(), perm.as_deref())
        }
        Operator::Concat(axis) => {
            let operands = inputs.iter().flatten().cloned().collect::<Vec<_>>();
            concat(operands, *axis)
        }
        Operator::Squeeze(axes) => {
            let x = operand(inputs, 0, operator)?;
            let axes = match (axes, optional_operand(inputs, 1)) {
                (Some(axes), _) => Some(axes.clone()),
                (None, Some(axes)) => Some(i64_operand(axes, operator, "axes")?),
                (None, None) => None,
            };
            squeeze(x.clone(), axes.as_deref())
        }
        Operator::Unsqueeze(axes) => {
            let x = operand(inputs, 0, operator)?;
            let axes = match axes {
                Some(axes) => axes.clone(),
                None => i64_operand(operand(inputs, 1, operator)?, operator, "axes")?,
            };
            unsqueeze(x.clone(), &axes)
        }
        Operator::Shape => Ok(shape_of(operand(inputs, 0, operator)?)),
        Operator::Gather(axis) => {
            let x = operand(inputs, 0, operator)?;
            let indices = operand(inputs, 1, operator)?;
            gather(x.clone(), indices, *axis)
        }
        Operator::Cast(to) => {
            let x = operand(inputs, 0, operator)?;
            x.cast(*to).ok_or_else(|| {
                OperationError::InvalidTensorType(operator.name(), format!("{:?}", to))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NaiveProvider;
    use ndarray::{arr1, ArrayD, IxDyn};
    use rayon::ThreadPoolBuilder;

    fn pool() -> ThreadPool {
        ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    #[test]
    fn clip_bounds_come_from_inputs() {
        let x = TensorData::Float(arr1(&[-2.0f32, 0.5, 8.0]).into_dyn());
        let min = TensorData::Float(ArrayD::from_elem(IxDyn(&[]), 0.0));
        let max = TensorData::Float(ArrayD::from_elem(IxDyn(&[]), 6.0));
        let result = execute_operation::<NaiveProvider>(
            &[Some(x), Some(min), Some(max)],
            &Operator::Clip(ClipAttributes::default()),
            &pool(),
        )
        .unwrap();
        assert_eq!(
            result,
            TensorData::Float(arr1(&[0.0f32, 0.5, 6.0]).into_dyn())
        );
    }

    #[test]
    fn shape_arithmetic_on_integers() {
        let shape = TensorData::Int64(arr1(&[1i64, 8, 4]).into_dyn());
        let two = TensorData::Int64(ArrayD::from_elem(IxDyn(&[]), 2));
        let result =
            execute_operation::<NaiveProvider>(&[Some(shape), Some(two)], &Operator::Mul, &pool())
                .unwrap();
        assert_eq!(result, TensorData::Int64(arr1(&[2i64, 16, 8]).into_dyn()));
    }

    #[test]
    fn reshape_reads_the_target_from_its_second_input() {
        let x = TensorData::Float(ArrayD::zeros(IxDyn(&[2, 3, 4])));
        let target = TensorData::Int64(arr1(&[0i64, -1]).into_dyn());
        let result =
            execute_operation::<NaiveProvider>(&[Some(x), Some(target)], &Operator::Reshape, &pool())
                .unwrap();
        assert_eq!(result.shape(), &[2, 12]);
    }

    #[test]
    fn missing_required_input_is_an_error() {
        let result = execute_operation::<NaiveProvider>(&[None], &Operator::ReLU, &pool());
        assert!(matches!(result, Err(OperationError::MissingInput(_, 0))));
    }
}
