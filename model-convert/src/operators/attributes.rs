use std::str::FromStr;

use super::OperationError;

/// Padding policy of convolutions and pooling operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoPad {
    /// Explicit `pads` are used.
    #[default]
    NotSet,
    Valid,
    SameUpper,
    SameLower,
}

impl AutoPad {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoPad::NotSet => "NOTSET",
            AutoPad::Valid => "VALID",
            AutoPad::SameUpper => "SAME_UPPER",
            AutoPad::SameLower => "SAME_LOWER",
        }
    }
}

impl FromStr for AutoPad {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOTSET" | "" => Ok(Self::NotSet),
            "VALID" => Ok(Self::Valid),
            "SAME_UPPER" => Ok(Self::SameUpper),
            "SAME_LOWER" => Ok(Self::SameLower),
            _ => Err(format!("Invalid auto_pad value: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvAttributes {
    // assuming 4D tensors
    pub auto_pad: AutoPad,
    pub dilations: [usize; 2],
    pub group: usize,
    /// Inferred from the weights when absent.
    pub kernel_shape: Option<[usize; 2]>,
    pub pads: [usize; 4],
    pub strides: [usize; 2],
}

#[derive(Debug, Clone)]
pub struct PoolAttributes {
    pub auto_pad: AutoPad,
    pub kernel_shape: [usize; 2],
    pub pads: [usize; 4],
    pub strides: [usize; 2],
    /// Only meaningful for average pooling.
    pub count_include_pad: bool,
}

#[derive(Debug, Clone)]
pub struct ClipAttributes {
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone)]
pub struct BatchNormAttributes {
    pub epsilon: f32,
    pub momentum: f32, // not used during inference
}

#[derive(Debug, Clone)]
pub struct GemmAttributes {
    pub alpha: f32,
    pub beta: f32,
    pub trans_a: bool,
    pub trans_b: bool,
}

impl ConvAttributes {
    pub fn new(
        dilations: [usize; 2],
        group: usize,
        kernel_shape: [usize; 2],
        pads: [usize; 4],
        strides: [usize; 2],
    ) -> Self {
        Self {
            auto_pad: AutoPad::NotSet,
            dilations,
            group,
            kernel_shape: Some(kernel_shape),
            pads,
            strides,
        }
    }
}

impl Default for ConvAttributes {
    fn default() -> Self {
        ConvAttributes {
            auto_pad: AutoPad::NotSet,
            dilations: [1, 1],
            group: 1,
            kernel_shape: None,
            pads: [0, 0, 0, 0],
            strides: [1, 1],
        }
    }
}

impl PoolAttributes {
    pub fn new(kernel_shape: [usize; 2], pads: [usize; 4], strides: [usize; 2]) -> Self {
        Self {
            auto_pad: AutoPad::NotSet,
            kernel_shape,
            pads,
            strides,
            count_include_pad: false,
        }
    }
}

impl ClipAttributes {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }
}

impl Default for ClipAttributes {
    fn default() -> Self {
        Self {
            min: f32::MIN,
            max: f32::MAX,
        }
    }
}

impl BatchNormAttributes {
    pub fn new(epsilon: f32, momentum: f32) -> Self {
        Self { epsilon, momentum }
    }
}

impl GemmAttributes {
    pub fn new(alpha: f32, beta: f32, trans_a: bool, trans_b: bool) -> Self {
        Self {
            alpha,
            beta,
            trans_a,
            trans_b,
        }
    }
}

impl Default for GemmAttributes {
    fn default() -> Self {
        Self::new(1.0, 1.0, false, false)
    }
}

/// Spatial geometry of a sliding-window operator applied to a `[height, width]` input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub dilations: [usize; 2],
    /// `[h_begin, w_begin, h_end, w_end]`
    pub pads: [usize; 4],
    pub output: [usize; 2],
}

impl WindowGeometry {
    /// Resolves the padding policy and computes the output extent.
    pub fn resolve(
        input: [usize; 2],
        kernel: [usize; 2],
        strides: [usize; 2],
        dilations: [usize; 2],
        auto_pad: AutoPad,
        pads: [usize; 4],
    ) -> Result<Self, OperationError> {
        if strides.contains(&0) || dilations.contains(&0) || kernel.contains(&0) {
            return Err(OperationError::InvalidAttribute(
                String::from("window"),
                format!(
                    "kernel {:?}, strides {:?} and dilations {:?} must be positive",
                    kernel, strides, dilations
                ),
            ));
        }
        let mut resolved = pads;
        let mut output = [0usize; 2];
        for axis in 0..2 {
            let extent = dilations[axis] * (kernel[axis] - 1) + 1;
            match auto_pad {
                AutoPad::NotSet => {}
                AutoPad::Valid => {
                    resolved[axis] = 0;
                    resolved[axis + 2] = 0;
                }
                AutoPad::SameUpper | AutoPad::SameLower => {
                    let out = (input[axis] + strides[axis] - 1) / strides[axis];
                    let total = ((out.saturating_sub(1)) * strides[axis] + extent)
                        .saturating_sub(input[axis]);
                    let small = total / 2;
                    let (begin, end) = if auto_pad == AutoPad::SameUpper {
                        (small, total - small)
                    } else {
                        (total - small, small)
                    };
                    resolved[axis] = begin;
                    resolved[axis + 2] = end;
                }
            }
            let padded = input[axis] + resolved[axis] + resolved[axis + 2];
            if padded < extent {
                return Err(OperationError::WrongShape(
                    format!("a spatial extent of at least {}", extent),
                    format!("{}", padded),
                ));
            }
            output[axis] = 1 + (padded - extent) / strides[axis];
        }
        Ok(Self {
            kernel,
            strides,
            dilations,
            pads: resolved,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_upper_keeps_spatial_size_with_unit_stride() {
        let geometry =
            WindowGeometry::resolve([5, 5], [3, 3], [1, 1], [1, 1], AutoPad::SameUpper, [0; 4])
                .unwrap();
        assert_eq!(geometry.pads, [1, 1, 1, 1]);
        assert_eq!(geometry.output, [5, 5]);
    }

    #[test]
    fn same_lower_puts_the_extra_pad_first() {
        let geometry =
            WindowGeometry::resolve([4, 4], [2, 2], [1, 1], [1, 1], AutoPad::SameLower, [0; 4])
                .unwrap();
        assert_eq!(geometry.pads, [1, 1, 0, 0]);
        assert_eq!(geometry.output, [4, 4]);
    }

    #[test]
    fn explicit_pads_and_stride() {
        let geometry =
            WindowGeometry::resolve([5, 5], [3, 3], [2, 2], [1, 1], AutoPad::NotSet, [1, 1, 1, 1])
                .unwrap();
        assert_eq!(geometry.output, [3, 3]);
    }

    #[test]
    fn kernel_larger_than_input_is_rejected() {
        let result =
            WindowGeometry::resolve([2, 2], [3, 3], [1, 1], [1, 1], AutoPad::Valid, [0; 4]);
        assert!(result.is_err());
    }
}
