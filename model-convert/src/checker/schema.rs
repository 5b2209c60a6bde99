use std::collections::HashMap;

use lazy_static::lazy_static;

/// Highest IR version this checker understands.
pub const MAX_IR_VERSION: i64 = 10;
/// Lowest IR version accepted; older files predate typed attributes.
pub const MIN_IR_VERSION: i64 = 3;
/// Highest version of the default operator set this checker understands.
pub const MAX_OPSET_VERSION: i64 = 21;

/// Arity and required attributes of an operator of the default domain.
#[derive(Debug, Clone, Copy)]
pub struct OperatorSchema {
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub required_attributes: &'static [&'static str],
}

impl OperatorSchema {
    const fn new(min_inputs: usize, max_inputs: usize) -> Self {
        Self {
            min_inputs,
            max_inputs,
            required_attributes: &[],
        }
    }

    const fn requires(self, attributes: &'static [&'static str]) -> Self {
        Self {
            required_attributes: attributes,
            ..self
        }
    }

    pub fn accepts_inputs(&self, count: usize) -> bool {
        (self.min_inputs..=self.max_inputs).contains(&count)
    }
}

const VARIADIC: usize = usize::MAX;

lazy_static! {
    pub static ref OPERATOR_SCHEMAS: HashMap<&'static str, OperatorSchema> = {
        let unary = OperatorSchema::new(1, 1);
        let binary = OperatorSchema::new(2, 2);
        let mut schemas = HashMap::new();
        for op in [
            "Relu", "Sigmoid", "Tanh", "Softmax", "LogSoftmax", "Flatten", "Transpose", "Shape",
            "Identity", "GlobalAveragePool", "GlobalMaxPool", "LeakyRelu", "Elu", "Selu",
            "HardSigmoid", "Softplus", "Softsign", "Exp", "Log", "Sqrt", "Neg", "Abs",
            "Reciprocal", "Erf", "Not", "Floor", "Ceil", "Size", "LRN",
        ] {
            schemas.insert(op, unary);
        }
        for op in [
            "Add", "Sub", "Mul", "Div", "Pow", "MatMul", "Equal", "Less", "Greater", "And", "Or",
            "PRelu", "Gather", "Reshape", "Expand", "Tile",
        ] {
            schemas.insert(op, binary);
        }
        for op in ["Max", "Min", "Sum", "Mean"] {
            schemas.insert(op, OperatorSchema::new(1, VARIADIC));
        }
        schemas.insert("Conv", OperatorSchema::new(2, 3));
        schemas.insert("ConvTranspose", OperatorSchema::new(2, 3));
        schemas.insert("Gemm", OperatorSchema::new(2, 3));
        schemas.insert("BatchNormalization", OperatorSchema::new(5, 5));
        schemas.insert("InstanceNormalization", OperatorSchema::new(3, 3));
        schemas.insert(
            "MaxPool",
            OperatorSchema::new(1, 1).requires(&["kernel_shape"]),
        );
        schemas.insert(
            "AveragePool",
            OperatorSchema::new(1, 1).requires(&["kernel_shape"]),
        );
        schemas.insert("Clip", OperatorSchema::new(1, 3));
        schemas.insert("Dropout", OperatorSchema::new(1, 3));
        schemas.insert(
            "Concat",
            OperatorSchema::new(1, VARIADIC).requires(&["axis"]),
        );
        schemas.insert("Squeeze", OperatorSchema::new(1, 2));
        schemas.insert("Unsqueeze", OperatorSchema::new(1, 2));
        schemas.insert("Cast", OperatorSchema::new(1, 1).requires(&["to"]));
        schemas.insert("Pad", OperatorSchema::new(1, 4));
        schemas.insert("Slice", OperatorSchema::new(1, 5));
        schemas.insert("Split", OperatorSchema::new(1, 2));
        schemas.insert("Resize", OperatorSchema::new(1, 4));
        schemas.insert("ReduceMean", OperatorSchema::new(1, 2));
        schemas.insert("ReduceSum", OperatorSchema::new(1, 2));
        schemas.insert("ReduceMax", OperatorSchema::new(1, 2));
        schemas.insert("Where", OperatorSchema::new(3, 3));
        schemas.insert("Constant", OperatorSchema::new(0, 0));
        schemas
    };
}

/// Attributes of which exactly one must define the value of a `Constant` node.
pub const CONSTANT_VALUE_ATTRIBUTES: &[&str] = &[
    "value",
    "value_float",
    "value_floats",
    "value_int",
    "value_ints",
    "value_string",
    "value_strings",
    "sparse_value",
];
