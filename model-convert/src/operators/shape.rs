//! Element-type agnostic operators: they only move data around (or apply a
//! broadcast binary function) and work on every [`TensorData`] variant.
use ndarray::{ArrayD, Axis, IxDyn, Zip};

use crate::tensor::TensorData;

use super::OperationError;

macro_rules! try_map_tensor_data {
    ($data:expr, $array:ident => $body:expr) => {
        match $data {
            TensorData::Float($array) => TensorData::Float($body?),
            TensorData::Double($array) => TensorData::Double($body?),
            TensorData::Uint8($array) => TensorData::Uint8($body?),
            TensorData::Int8($array) => TensorData::Int8($body?),
            TensorData::Int16($array) => TensorData::Int16($body?),
            TensorData::Int32($array) => TensorData::Int32($body?),
            TensorData::Int64($array) => TensorData::Int64($body?),
            TensorData::Bool($array) => TensorData::Bool($body?),
        }
    };
}

/// Normalizes a possibly negative axis against a rank.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize, OperationError> {
    let normalized = if axis < 0 { axis + rank as i64 } else { axis };
    if normalized < 0 || normalized as usize >= rank.max(1) {
        return Err(OperationError::InvalidAttribute(
            String::from("axis"),
            format!("axis {} is out of range for rank {}", axis, rank),
        ));
    }
    Ok(normalized as usize)
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut shape = vec![0; rank];
    for i in 0..rank {
        let l = if i < rank - lhs.len() { 1 } else { lhs[i - (rank - lhs.len())] };
        let r = if i < rank - rhs.len() { 1 } else { rhs[i - (rank - rhs.len())] };
        shape[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return None,
        };
    }
    Some(shape)
}

/// Applies `f` element-wise after broadcasting both operands to a common shape.
pub fn broadcast_binary<T, F>(
    lhs: &ArrayD<T>,
    rhs: &ArrayD<T>,
    f: F,
) -> Result<ArrayD<T>, OperationError>
where
    T: Copy,
    F: Fn(T, T) -> T,
{
    let shape = broadcast_shape(lhs.shape(), rhs.shape()).ok_or_else(|| {
        OperationError::UnexpectedShape(format!("{:?}", lhs.shape()), format!("{:?}", rhs.shape()))
    })?;
    let broadcast_error = || {
        OperationError::UnexpectedShape(format!("{:?}", lhs.shape()), format!("{:?}", rhs.shape()))
    };
    let lhs = lhs.broadcast(IxDyn(&shape)).ok_or_else(broadcast_error)?;
    let rhs = rhs.broadcast(IxDyn(&shape)).ok_or_else(broadcast_error)?;
    Ok(Zip::from(&lhs).and(&rhs).map_collect(|l, r| f(*l, *r)))
}

fn reshape_array<T: Clone>(x: ArrayD<T>, dims: &[usize]) -> Result<ArrayD<T>, OperationError> {
    let from = x.shape().to_vec();
    let x = if x.is_standard_layout() {
        x
    } else {
        x.as_standard_layout().to_owned()
    };
    x.into_shape(IxDyn(dims))
        .map_err(|_| OperationError::UnexpectedShape(format!("{:?}", from), format!("{:?}", dims)))
}

/// Computes the concrete target of a `Reshape`, resolving `0` and `-1` entries.
pub fn reshape_target(
    input: &[usize],
    requested: &[i64],
    allow_zero: bool,
) -> Result<Vec<usize>, OperationError> {
    let total: usize = input.iter().product();
    let mut inferred = None;
    let mut dims = Vec::with_capacity(requested.len());
    for (i, &dim) in requested.iter().enumerate() {
        match dim {
            -1 if inferred.is_none() => {
                inferred = Some(i);
                dims.push(1);
            }
            0 if !allow_zero => dims.push(*input.get(i).ok_or_else(|| {
                OperationError::WrongShape(format!("{:?}", input), format!("{:?}", requested))
            })?),
            d if d >= 0 => dims.push(d as usize),
            _ => {
                return Err(OperationError::InvalidAttribute(
                    String::from("Reshape"),
                    format!("invalid target shape {:?}", requested),
                ))
            }
        }
    }
    if let Some(i) = inferred {
        let known: usize = dims.iter().product();
        if known == 0 || total % known != 0 {
            return Err(OperationError::WrongShape(
                format!("{:?}", input),
                format!("{:?}", requested),
            ));
        }
        dims[i] = total / known;
    }
    if dims.iter().product::<usize>() != total {
        return Err(OperationError::WrongShape(
            format!("{:?}", input),
            format!("{:?}", requested),
        ));
    }
    Ok(dims)
}

pub fn reshape(x: TensorData, dims: &[usize]) -> Result<TensorData, OperationError> {
    Ok(try_map_tensor_data!(x, a => reshape_array(a, dims)))
}

pub fn flatten(x: TensorData, axis: i64) -> Result<TensorData, OperationError> {
    let shape = x.shape().to_vec();
    let axis = if axis == shape.len() as i64 {
        shape.len()
    } else {
        normalize_axis(axis, shape.len())?
    };
    let outer = shape[..axis].iter().product::<usize>();
    let inner = shape[axis..].iter().product::<usize>();
    reshape(x, &[outer, inner])
}

pub fn transpose(x: TensorData, perm: Option<&[usize]>) -> Result<TensorData, OperationError> {
    let rank = x.shape().len();
    let perm = match perm {
        Some(perm) => perm.to_vec(),
        None => (0..rank).rev().collect(),
    };
    let mut sorted = perm.clone();
    sorted.sort_unstable();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(OperationError::InvalidAttribute(
            String::from("Transpose"),
            format!("{:?} is not a permutation of rank {}", perm, rank),
        ));
    }
    Ok(try_map_tensor_data!(x, a => Ok::<_, OperationError>(
        a.permuted_axes(IxDyn(&perm)).as_standard_layout().to_owned()
    )))
}

pub fn squeeze(x: TensorData, axes: Option<&[i64]>) -> Result<TensorData, OperationError> {
    let shape = x.shape().to_vec();
    let axes = match axes {
        Some(axes) => axes
            .iter()
            .map(|a| normalize_axis(*a, shape.len()))
            .collect::<Result<Vec<_>, _>>()?,
        None => (0..shape.len()).filter(|i| shape[*i] == 1).collect(),
    };
    if let Some(axis) = axes.iter().find(|a| shape[**a] != 1) {
        return Err(OperationError::WrongShape(
            format!("dimension {} of size 1", axis),
            format!("{:?}", shape),
        ));
    }
    let dims = shape
        .iter()
        .enumerate()
        .filter(|(i, _)| !axes.contains(i))
        .map(|(_, d)| *d)
        .collect::<Vec<_>>();
    reshape(x, &dims)
}

pub fn unsqueeze(x: TensorData, axes: &[i64]) -> Result<TensorData, OperationError> {
    let shape = x.shape().to_vec();
    let rank = shape.len() + axes.len();
    let mut axes = axes
        .iter()
        .map(|a| normalize_axis(*a, rank))
        .collect::<Result<Vec<_>, _>>()?;
    axes.sort_unstable();
    let mut dims = shape.into_iter();
    let dims = (0..rank)
        .map(|i| {
            if axes.contains(&i) {
                1
            } else {
                dims.next().unwrap_or(1)
            }
        })
        .collect::<Vec<_>>();
    reshape(x, &dims)
}

pub fn shape_of(x: &TensorData) -> TensorData {
    let dims = x.shape().iter().map(|d| *d as i64).collect::<Vec<_>>();
    TensorData::Int64(ArrayD::from_shape_vec(IxDyn(&[dims.len()]), dims).unwrap_or_default())
}

pub fn concat(inputs: Vec<TensorData>, axis: i64) -> Result<TensorData, OperationError> {
    let Some(first) = inputs.first() else {
        return Err(OperationError::MissingInput(String::from("Concat"), 0));
    };
    let axis = Axis(normalize_axis(axis, first.shape().len())?);

    macro_rules! concat_variant {
        ($variant:ident) => {{
            let arrays = inputs
                .iter()
                .map(|t| match t {
                    TensorData::$variant(a) => Ok(a.view()),
                    _ => Err(OperationError::InvalidTensorType(
                        String::from("Concat"),
                        String::from("inputs"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let shapes = arrays.iter().map(|a| a.shape().to_vec()).collect::<Vec<_>>();
            TensorData::$variant(ndarray::concatenate(axis, &arrays).map_err(|_| {
                OperationError::UnexpectedShape(format!("{:?}", shapes), format!("axis {}", axis.0))
            })?)
        }};
    }

    Ok(match first {
        TensorData::Float(_) => concat_variant!(Float),
        TensorData::Double(_) => concat_variant!(Double),
        TensorData::Uint8(_) => concat_variant!(Uint8),
        TensorData::Int8(_) => concat_variant!(Int8),
        TensorData::Int16(_) => concat_variant!(Int16),
        TensorData::Int32(_) => concat_variant!(Int32),
        TensorData::Int64(_) => concat_variant!(Int64),
        TensorData::Bool(_) => concat_variant!(Bool),
    })
}

pub fn gather(x: TensorData, indices: &TensorData, axis: i64) -> Result<TensorData, OperationError> {
    let shape = x.shape().to_vec();
    let axis = normalize_axis(axis, shape.len())?;
    let Some(raw_indices) = indices.to_i64_vec() else {
        return Err(OperationError::InvalidTensorType(
            String::from("Gather"),
            String::from("indices"),
        ));
    };
    let extent = shape[axis] as i64;
    let positions = raw_indices
        .iter()
        .map(|i| {
            let i = if *i < 0 { i + extent } else { *i };
            if i < 0 || i >= extent {
                Err(OperationError::InvalidAttribute(
                    String::from("Gather"),
                    format!("index out of range for a dimension of size {}", extent),
                ))
            } else {
                Ok(i as usize)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    let mut dims = shape[..axis].to_vec();
    dims.extend_from_slice(indices.shape());
    dims.extend_from_slice(&shape[axis + 1..]);

    let selected = try_map_tensor_data!(x, a => Ok::<_, OperationError>(a.select(Axis(axis), &positions)));
    reshape(selected, &dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn floats(shape: &[usize]) -> TensorData {
        let n = shape.iter().product::<usize>();
        TensorData::Float(
            ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|v| v as f32).collect()).unwrap(),
        )
    }

    #[test]
    fn broadcast_shapes() {
        assert_eq!(broadcast_shape(&[2, 3, 4], &[4]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shape(&[2, 1], &[1, 5]), Some(vec![2, 5]));
        assert_eq!(broadcast_shape(&[2, 3], &[4]), None);
    }

    #[test]
    fn broadcast_add_of_a_bias_row() {
        let lhs = arr2(&[[1.0f32, 2.0], [3.0, 4.0]]).into_dyn();
        let rhs = ndarray::arr1(&[10.0f32, 20.0]).into_dyn();
        let result = broadcast_binary(&lhs, &rhs, |a, b| a + b).unwrap();
        assert_eq!(result, arr2(&[[11.0f32, 22.0], [13.0, 24.0]]).into_dyn());
    }

    #[test]
    fn reshape_resolves_zero_and_minus_one() {
        assert_eq!(reshape_target(&[1, 8, 2, 2], &[0, -1], false).unwrap(), vec![1, 32]);
        assert!(reshape_target(&[1, 8], &[3, -1], false).is_err());
    }

    #[test]
    fn transpose_nhwc_to_nchw() {
        let result = transpose(floats(&[1, 2, 3, 4]), Some(&[0, 3, 1, 2])).unwrap();
        assert_eq!(result.shape(), &[1, 4, 2, 3]);
        let TensorData::Float(result) = result else {
            panic!("Invalid tensor type")
        };
        // element (h=1, w=2, c=3) of the input
        assert_eq!(result[[0, 3, 1, 2]], (12 + 2 * 4 + 3) as f32);
    }

    #[test]
    fn squeeze_and_unsqueeze() {
        let squeezed = squeeze(floats(&[1, 3, 1]), None).unwrap();
        assert_eq!(squeezed.shape(), &[3]);
        let unsqueezed = unsqueeze(squeezed, &[0, -1]).unwrap();
        assert_eq!(unsqueezed.shape(), &[1, 3, 1]);
    }

    #[test]
    fn gather_scalar_index_drops_the_axis() {
        let shape = shape_of(&floats(&[1, 7, 5]));
        let index = TensorData::Int64(ArrayD::from_elem(IxDyn(&[]), 1));
        let gathered = gather(shape, &index, 0).unwrap();
        assert_eq!(gathered.shape(), &[] as &[usize]);
        assert_eq!(gathered.to_i64_vec(), Some(vec![7]));
    }

    #[test]
    fn concat_along_negative_axis() {
        let result = concat(vec![floats(&[2, 1]), floats(&[2, 3])], -1).unwrap();
        assert_eq!(result.shape(), &[2, 4]);
    }
}
