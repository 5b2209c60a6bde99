//! # Tensor utilities
//!
//! This module contains utilities to deal with dynamic ONNX tensors.
//!
//! The data is stored in the [`TensorData`] enum, which contains the actual array with generic element data type.
//! Graph inputs and outputs are described by a [`TensorShape`], whose dimensions may be symbolic.
use ndarray::{ArrayD, IxDyn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::onnx_format::{
    tensor_shape_proto::dimension::Value as DimensionValue, type_proto::Value as TypeValue,
    TensorProto, ValueInfoProto,
};

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("tensor '{name}' has an unknown element data type {data_type}")]
    UnknownDataType { name: String, data_type: i32 },
    #[error("tensor '{name}' uses the unsupported element data type {data_type:?}")]
    UnsupportedDataType {
        name: String,
        data_type: TensorDataType,
    },
    #[error("tensor '{name}' declares {expected} elements but holds {actual}")]
    PayloadMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("tensor '{0}' has a negative dimension")]
    NegativeDimension(String),
    #[error("tensor '{0}' stores its data externally, which is not supported")]
    ExternalData(String),
    #[error("value '{0}' is not a tensor type")]
    NotATensor(String),
}

/// Enum representing the different types of data that can be stored in a tensor
/// in ONNX.
/// The tags are the same as the ones defined in the protobuf specification.
#[derive(Debug, Clone, Copy, FromPrimitive, ToPrimitive, PartialEq, Eq, Hash)]
pub enum TensorDataType {
    /// 32-bit floating point, equivalent to Rust's `f32`
    Float = 1,
    /// Unsigned 8-bit int, equivalent to Rust's `u8`
    Uint8,
    /// Signed 8-bit int, equivalent to Rust's `i8`
    Int8,
    /// Unsigned 16-bit int, equivalent to Rust's `u16`
    Uint16,
    /// Signed 16-bit int, equivalent to Rust's `i16`
    Int16,
    /// Signed 32-bit int, equivalent to Rust's `i32`
    Int32,
    /// Signed 64-bit int, equivalent to Rust's `i64`
    Int64,
    /// String, equivalent to Rust's `String`
    String,
    /// Boolean, stored as one byte per element
    Bool,
    /// IEEE 754 half precision float
    Float16,
    /// 64-bit floating point, equivalent to Rust's `f64`
    Double,
    /// Unsigned 32-bit int, equivalent to Rust's `u32`
    Uint32,
    /// Unsigned 64-bit int, equivalent to Rust's `u64`
    Uint64,
    /// Complex number with 32-bit real and imaginary parts
    Complex64,
    /// Complex number with 64-bit real and imaginary parts
    Complex128,
    /// Truncated 32-bit float
    BFloat16,
}

impl TensorDataType {
    pub fn from_proto(data_type: i32) -> Option<Self> {
        FromPrimitive::from_i32(data_type)
    }

    /// Size in bytes of one element in the little-endian `raw_data` encoding.
    /// Strings have no fixed size.
    pub fn element_size(self) -> Option<usize> {
        match self {
            TensorDataType::Uint8 | TensorDataType::Int8 | TensorDataType::Bool => Some(1),
            TensorDataType::Uint16
            | TensorDataType::Int16
            | TensorDataType::Float16
            | TensorDataType::BFloat16 => Some(2),
            TensorDataType::Float | TensorDataType::Int32 | TensorDataType::Uint32 => Some(4),
            TensorDataType::Int64
            | TensorDataType::Double
            | TensorDataType::Uint64
            | TensorDataType::Complex64 => Some(8),
            TensorDataType::Complex128 => Some(16),
            TensorDataType::String => None,
        }
    }
}

/// Tensor payload, restricted to the element types the runtime can compute on.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(ArrayD<f32>),
    Double(ArrayD<f64>),
    Uint8(ArrayD<u8>),
    Int8(ArrayD<i8>),
    Int16(ArrayD<i16>),
    Int32(ArrayD<i32>),
    Int64(ArrayD<i64>),
    Bool(ArrayD<bool>),
}

impl TensorData {
    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::Float(x) => x.shape(),
            TensorData::Double(x) => x.shape(),
            TensorData::Uint8(x) => x.shape(),
            TensorData::Int8(x) => x.shape(),
            TensorData::Int16(x) => x.shape(),
            TensorData::Int32(x) => x.shape(),
            TensorData::Int64(x) => x.shape(),
            TensorData::Bool(x) => x.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> TensorDataType {
        match self {
            TensorData::Float(_) => TensorDataType::Float,
            TensorData::Double(_) => TensorDataType::Double,
            TensorData::Uint8(_) => TensorDataType::Uint8,
            TensorData::Int8(_) => TensorDataType::Int8,
            TensorData::Int16(_) => TensorDataType::Int16,
            TensorData::Int32(_) => TensorDataType::Int32,
            TensorData::Int64(_) => TensorDataType::Int64,
            TensorData::Bool(_) => TensorDataType::Bool,
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(self, TensorData::Float(_) | TensorData::Double(_))
    }

    /// Elements in row-major order, little-endian encoded.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::Float(x) => x.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Double(x) => x.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Uint8(x) => x.iter().copied().collect(),
            TensorData::Int8(x) => x.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Int16(x) => x.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Int32(x) => x.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Int64(x) => x.iter().flat_map(|v| v.to_le_bytes()).collect(),
            TensorData::Bool(x) => x.iter().map(|v| u8::from(*v)).collect(),
        }
    }

    /// Values as `i64`, used for shape-like operands (`Reshape`, `Gather`, ...).
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match self {
            TensorData::Int64(x) => Some(x.iter().copied().collect()),
            TensorData::Int32(x) => Some(x.iter().map(|v| *v as i64).collect()),
            TensorData::Int16(x) => Some(x.iter().map(|v| *v as i64).collect()),
            TensorData::Int8(x) => Some(x.iter().map(|v| *v as i64).collect()),
            TensorData::Uint8(x) => Some(x.iter().map(|v| *v as i64).collect()),
            _ => None,
        }
    }

    /// Numeric cast to another element type, following ONNX `Cast` semantics
    /// for the supported types.
    pub fn cast(&self, to: TensorDataType) -> Option<TensorData> {
        macro_rules! cast_all {
            ($x:expr) => {
                match to {
                    TensorDataType::Float => Some(TensorData::Float($x.mapv(|v| v as f32))),
                    TensorDataType::Double => Some(TensorData::Double($x.mapv(|v| v as f64))),
                    TensorDataType::Int64 => Some(TensorData::Int64($x.mapv(|v| v as i64))),
                    TensorDataType::Int32 => Some(TensorData::Int32($x.mapv(|v| v as i32))),
                    TensorDataType::Int16 => Some(TensorData::Int16($x.mapv(|v| v as i16))),
                    TensorDataType::Int8 => Some(TensorData::Int8($x.mapv(|v| v as i8))),
                    TensorDataType::Uint8 => Some(TensorData::Uint8($x.mapv(|v| v as u8))),
                    TensorDataType::Bool => Some(TensorData::Bool($x.mapv(|v| v as f64 != 0.0))),
                    _ => None,
                }
            };
        }
        match self {
            TensorData::Float(x) => cast_all!(x),
            TensorData::Double(x) => cast_all!(x),
            TensorData::Uint8(x) => cast_all!(x),
            TensorData::Int8(x) => cast_all!(x),
            TensorData::Int16(x) => cast_all!(x),
            TensorData::Int32(x) => cast_all!(x),
            TensorData::Int64(x) => cast_all!(x),
            TensorData::Bool(x) => TensorData::Uint8(x.mapv(u8::from)).cast(to),
        }
    }
}

impl TryFrom<&TensorProto> for TensorData {
    type Error = TensorError;

    fn try_from(proto: &TensorProto) -> Result<Self, Self::Error> {
        let name = proto.name.clone().unwrap_or_default();
        if proto.data_location == Some(1) {
            return Err(TensorError::ExternalData(name));
        }
        let dimensions = proto
            .dims
            .iter()
            .map(|d| usize::try_from(*d).map_err(|_| TensorError::NegativeDimension(name.clone())))
            .collect::<Result<Vec<usize>, _>>()?;
        let raw_type = proto.data_type.unwrap_or_default();
        let data_type =
            TensorDataType::from_proto(raw_type).ok_or_else(|| TensorError::UnknownDataType {
                name: name.clone(),
                data_type: raw_type,
            })?;

        convert_proto_to_tensor_data(proto, &name, data_type, dimensions)
    }
}

macro_rules! decode_raw {
    ($raw:expr, $type_:ty) => {
        $raw.chunks_exact(std::mem::size_of::<$type_>())
            .map(|x| {
                let mut bytes = [0u8; std::mem::size_of::<$type_>()];
                bytes.copy_from_slice(x);
                <$type_>::from_le_bytes(bytes)
            })
            .collect::<Vec<$type_>>()
    };
}

fn convert_proto_to_tensor_data(
    proto: &TensorProto,
    name: &str,
    data_type: TensorDataType,
    dimensions: Vec<usize>,
) -> Result<TensorData, TensorError> {
    let raw = proto.raw_data.as_deref();
    let expected = dimensions
        .iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| TensorError::PayloadMismatch {
            name: name.to_string(),
            expected: usize::MAX,
            actual: 0,
        })?;

    macro_rules! build {
        ($variant:ident, $data:expr) => {{
            let data = $data;
            if data.len() != expected {
                return Err(TensorError::PayloadMismatch {
                    name: name.to_string(),
                    expected,
                    actual: data.len(),
                });
            }
            let array = ArrayD::from_shape_vec(IxDyn(&dimensions), data).map_err(|_| {
                TensorError::PayloadMismatch {
                    name: name.to_string(),
                    expected,
                    actual: 0,
                }
            })?;
            Ok(TensorData::$variant(array))
        }};
    }

    match data_type {
        TensorDataType::Float => build!(
            Float,
            match raw {
                Some(raw) => decode_raw!(raw, f32),
                None => proto.float_data.clone(),
            }
        ),
        TensorDataType::Double => build!(
            Double,
            match raw {
                Some(raw) => decode_raw!(raw, f64),
                None => proto.double_data.clone(),
            }
        ),
        TensorDataType::Uint8 => build!(
            Uint8,
            match raw {
                Some(raw) => raw.to_vec(),
                None => proto.int32_data.iter().map(|x| *x as u8).collect(),
            }
        ),
        TensorDataType::Int8 => build!(
            Int8,
            match raw {
                Some(raw) => decode_raw!(raw, i8),
                None => proto.int32_data.iter().map(|x| *x as i8).collect(),
            }
        ),
        TensorDataType::Int16 => build!(
            Int16,
            match raw {
                Some(raw) => decode_raw!(raw, i16),
                None => proto.int32_data.iter().map(|x| *x as i16).collect(),
            }
        ),
        TensorDataType::Int32 => build!(
            Int32,
            match raw {
                Some(raw) => decode_raw!(raw, i32),
                None => proto.int32_data.clone(),
            }
        ),
        TensorDataType::Int64 => build!(
            Int64,
            match raw {
                Some(raw) => decode_raw!(raw, i64),
                None => proto.int64_data.clone(),
            }
        ),
        TensorDataType::Bool => build!(
            Bool,
            match raw {
                Some(raw) => raw.iter().map(|x| *x != 0).collect::<Vec<bool>>(),
                None => proto.int32_data.iter().map(|x| *x != 0).collect(),
            }
        ),
        other => Err(TensorError::UnsupportedDataType {
            name: name.to_string(),
            data_type: other,
        }),
    }
}

/// A dimension of a graph input or output, either fixed or symbolic (e.g. the batch size `N`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphDimension {
    Value(usize),
    Parameter(String),
}

/// Name, element type and (possibly symbolic) shape of a graph input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorShape {
    pub name: String,
    pub elem_type: Option<TensorDataType>,
    pub dims: Vec<GraphDimension>,
}

impl TensorShape {
    /// Whether a concrete shape is compatible with this declaration.
    /// Symbolic and unknown dimensions accept any size.
    pub fn accepts(&self, shape: &[usize]) -> bool {
        self.dims.len() == shape.len()
            && self.dims.iter().zip(shape).all(|(dim, size)| match dim {
                GraphDimension::Value(v) => v == size,
                GraphDimension::Parameter(_) => true,
            })
    }
}

impl TryFrom<&ValueInfoProto> for TensorShape {
    type Error = TensorError;

    fn try_from(value_info: &ValueInfoProto) -> Result<Self, Self::Error> {
        let name = value_info.name.clone().unwrap_or_default();
        let Some(TypeValue::TensorType(tensor_type)) =
            value_info.r#type.as_ref().and_then(|t| t.value.as_ref())
        else {
            return Err(TensorError::NotATensor(name));
        };
        let elem_type = tensor_type.elem_type.and_then(TensorDataType::from_proto);
        let dims = tensor_type
            .shape
            .as_ref()
            .map(|shape| {
                shape
                    .dim
                    .iter()
                    .enumerate()
                    .map(|(i, dim)| match &dim.value {
                        Some(DimensionValue::DimValue(v)) if *v >= 0 => {
                            GraphDimension::Value(*v as usize)
                        }
                        Some(DimensionValue::DimParam(p)) => GraphDimension::Parameter(p.clone()),
                        _ => GraphDimension::Parameter(format!("unk__{}", i)),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(TensorShape {
            name,
            elem_type,
            dims,
        })
    }
}
