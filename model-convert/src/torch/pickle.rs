//! Minimal pickle (protocol 2) encoder for the objects `torch.load` restores:
//! plain Python containers, `collections.OrderedDict` and tensors whose storages
//! live in separate archive records.

/// Tensor reference: the storage record `key` of the archive plus the view over it.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    pub key: String,
    /// Storage class in the `torch` module, e.g. `FloatStorage`.
    pub storage: &'static str,
    pub shape: Vec<usize>,
}

impl TensorRef {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Row-major strides of a contiguous tensor.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        strides
    }
}

/// A picklable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    OrderedDict(Vec<(Value, Value)>),
    Tensor(TensorRef),
}

impl Value {
    pub fn str<S: Into<String>>(s: S) -> Self {
        Value::Str(s.into())
    }

    pub fn ints<I: IntoIterator<Item = usize>>(values: I) -> Self {
        Value::List(values.into_iter().map(|v| Value::Int(v as i64)).collect())
    }

    /// Dictionary with string keys, in the given order.
    pub fn record<K: Into<String>, I: IntoIterator<Item = (K, Value)>>(fields: I) -> Self {
        Value::Dict(
            fields
                .into_iter()
                .map(|(k, v)| (Value::Str(k.into()), v))
                .collect(),
        )
    }
}

mod opcode {
    pub const PROTO: u8 = 0x80;
    pub const STOP: u8 = b'.';
    pub const MARK: u8 = b'(';
    pub const NONE: u8 = b'N';
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG1: u8 = 0x8a;
    pub const BINFLOAT: u8 = b'G';
    pub const BINUNICODE: u8 = b'X';
    pub const EMPTY_LIST: u8 = b']';
    pub const APPENDS: u8 = b'e';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_DICT: u8 = b'}';
    pub const SETITEMS: u8 = b'u';
    pub const GLOBAL: u8 = b'c';
    pub const REDUCE: u8 = b'R';
    pub const BINPERSID: u8 = b'Q';
}

/// Serializes `value` as a complete protocol 2 pickle.
pub fn dumps(value: &Value) -> Vec<u8> {
    let mut pickler = Pickler::default();
    pickler.buffer.extend_from_slice(&[opcode::PROTO, 2]);
    pickler.value(value);
    pickler.buffer.push(opcode::STOP);
    pickler.buffer
}

#[derive(Default)]
struct Pickler {
    buffer: Vec<u8>,
}

impl Pickler {
    fn value(&mut self, value: &Value) {
        match value {
            Value::None => self.buffer.push(opcode::NONE),
            Value::Bool(true) => self.buffer.push(opcode::NEWTRUE),
            Value::Bool(false) => self.buffer.push(opcode::NEWFALSE),
            Value::Int(v) => self.int(*v),
            Value::Float(v) => {
                self.buffer.push(opcode::BINFLOAT);
                self.buffer.extend_from_slice(&v.to_be_bytes());
            }
            Value::Str(s) => self.string(s),
            Value::List(items) => {
                self.buffer.push(opcode::EMPTY_LIST);
                if !items.is_empty() {
                    self.buffer.push(opcode::MARK);
                    items.iter().for_each(|item| self.value(item));
                    self.buffer.push(opcode::APPENDS);
                }
            }
            Value::Tuple(items) => self.tuple(items),
            Value::Dict(entries) => {
                self.buffer.push(opcode::EMPTY_DICT);
                self.set_items(entries);
            }
            Value::OrderedDict(entries) => {
                self.global("collections", "OrderedDict");
                self.buffer.push(opcode::EMPTY_TUPLE);
                self.buffer.push(opcode::REDUCE);
                self.set_items(entries);
            }
            Value::Tensor(tensor) => self.tensor(tensor),
        }
    }

    fn int(&mut self, v: i64) {
        if (0..=0xff).contains(&v) {
            self.buffer.push(opcode::BININT1);
            self.buffer.push(v as u8);
        } else if let Ok(v) = i32::try_from(v) {
            self.buffer.push(opcode::BININT);
            self.buffer.extend_from_slice(&v.to_le_bytes());
        } else {
            self.buffer.push(opcode::LONG1);
            self.buffer.push(8);
            self.buffer.extend_from_slice(&v.to_le_bytes());
        }
    }

    fn string(&mut self, s: &str) {
        self.buffer.push(opcode::BINUNICODE);
        self.buffer
            .extend_from_slice(&(s.len() as u32).to_le_bytes());
        self.buffer.extend_from_slice(s.as_bytes());
    }

    fn tuple(&mut self, items: &[Value]) {
        if items.is_empty() {
            self.buffer.push(opcode::EMPTY_TUPLE);
            return;
        }
        self.buffer.push(opcode::MARK);
        items.iter().for_each(|item| self.value(item));
        self.buffer.push(opcode::TUPLE);
    }

    fn set_items(&mut self, entries: &[(Value, Value)]) {
        if entries.is_empty() {
            return;
        }
        self.buffer.push(opcode::MARK);
        for (key, value) in entries {
            self.value(key);
            self.value(value);
        }
        self.buffer.push(opcode::SETITEMS);
    }

    fn global(&mut self, module: &str, name: &str) {
        self.buffer.push(opcode::GLOBAL);
        self.buffer.extend_from_slice(module.as_bytes());
        self.buffer.push(b'\n');
        self.buffer.extend_from_slice(name.as_bytes());
        self.buffer.push(b'\n');
    }

    /// `torch._utils._rebuild_tensor_v2(storage, 0, size, stride, False, OrderedDict())`,
    /// where the storage is the persistent id `('storage', torch.<Storage>, key, 'cpu', numel)`.
    fn tensor(&mut self, tensor: &TensorRef) {
        self.global("torch._utils", "_rebuild_tensor_v2");
        self.buffer.push(opcode::MARK);

        self.buffer.push(opcode::MARK);
        self.string("storage");
        self.global("torch", tensor.storage);
        self.string(&tensor.key);
        self.string("cpu");
        self.int(tensor.numel() as i64);
        self.buffer.push(opcode::TUPLE);
        self.buffer.push(opcode::BINPERSID);

        self.int(0);
        let shape: Vec<Value> = tensor.shape.iter().map(|d| Value::Int(*d as i64)).collect();
        self.tuple(&shape);
        let strides: Vec<Value> = tensor
            .strides()
            .into_iter()
            .map(|s| Value::Int(s as i64))
            .collect();
        self.tuple(&strides);
        self.buffer.push(opcode::NEWFALSE);
        self.value(&Value::OrderedDict(Vec::new()));

        self.buffer.push(opcode::TUPLE);
        self.buffer.push(opcode::REDUCE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_stop() {
        assert_eq!(dumps(&Value::None), vec![0x80, 2, b'N', b'.']);
    }

    #[test]
    fn integers_use_the_smallest_opcode() {
        assert_eq!(dumps(&Value::Int(7))[2..4], [b'K', 7]);
        assert_eq!(dumps(&Value::Int(-1))[2..7], [b'J', 0xff, 0xff, 0xff, 0xff]);
        let big = dumps(&Value::Int(1 << 40));
        assert_eq!(big[2..4], [0x8a, 8]);
    }

    #[test]
    fn floats_are_big_endian() {
        let bytes = dumps(&Value::Float(1.0));
        assert_eq!(bytes[2], b'G');
        assert_eq!(bytes[3..11], 1.0f64.to_be_bytes());
    }

    #[test]
    fn ordered_dict_is_reduced_from_collections() {
        let bytes = dumps(&Value::OrderedDict(vec![(Value::str("a"), Value::Int(1))]));
        let expected = b"\x80\x02ccollections\nOrderedDict\n)R(X\x01\x00\x00\x00aK\x01u.";
        assert_eq!(bytes, expected.to_vec());
    }

    #[test]
    fn tensor_references_its_storage() {
        let tensor = TensorRef {
            key: String::from("0"),
            storage: "FloatStorage",
            shape: vec![2, 3],
        };
        assert_eq!(tensor.strides(), vec![3, 1]);
        let bytes = dumps(&Value::Tensor(tensor));
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("torch._utils\n_rebuild_tensor_v2\n"));
        assert!(text.contains("torch\nFloatStorage\n"));
        assert!(bytes.contains(&b'Q'));
    }

    #[test]
    fn scalar_tensor_has_empty_size() {
        let tensor = TensorRef {
            key: String::from("1"),
            storage: "LongStorage",
            shape: vec![],
        };
        assert_eq!(tensor.numel(), 1);
        assert!(tensor.strides().is_empty());
    }
}
