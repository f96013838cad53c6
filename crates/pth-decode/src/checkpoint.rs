//! The decoded checkpoint: tensor name to serialized tensor or plain value.
//!
//! A [`Checkpoint`] serializes to the JSON object consumers expect:
//!
//! ```json
//! { "gpt_cond_latent": {"data": [[0.1, 0.2]], "shape": [1, 2], "dtype": "float32"} }
//! ```
//!
//! Values that are not tensors are converted to JSON and passed through.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value, json};

use crate::error::AttemptError;
use crate::pytorch::storage::StorageRecord;
use crate::pytorch::tensor::reshape;
use crate::pytorch::{ElementType, Object, TensorRecord};

/// Tensor values nested to their shape, the way `ndarray.tolist()` lays them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NestedArray {
    Int(i64),
    Float(f64),
    List(Vec<NestedArray>),
}

impl NestedArray {
    /// All leaf values in row-major order, as `f64`.
    pub fn flatten_f64(&self) -> Vec<f64> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<f64>) {
        match self {
            Self::Int(v) => out.push(*v as f64),
            Self::Float(v) => out.push(*v),
            Self::List(items) => items.iter().for_each(|item| item.flatten_into(out)),
        }
    }

    /// Shape inferred by following the first element of every level.
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::new();
        let mut current = self;
        while let Self::List(items) = current {
            shape.push(items.len());
            match items.first() {
                Some(first) => current = first,
                None => break,
            }
        }
        shape
    }

    /// Reads a JSON array of numbers. Returns `None` for anything else.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            _ => None,
        }
    }
}

impl From<&NestedArray> for Value {
    fn from(array: &NestedArray) -> Self {
        match array {
            NestedArray::Int(v) => Value::from(*v),
            // JSON has no NaN or infinity.
            NestedArray::Float(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
            NestedArray::List(items) => Value::Array(items.iter().map(Value::from).collect()),
        }
    }
}

/// A materialized tensor as it crosses the decoder boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTensor {
    pub data: NestedArray,
    /// The declared shape, kept even when `data` fell back to the flat slice.
    pub shape: Vec<usize>,
    pub dtype: ElementType,
}

impl SerializedTensor {
    pub fn from_tensor(tensor: &TensorRecord) -> Self {
        Self {
            data: tensor.materialize().into_inner(),
            shape: tensor.shape().to_vec(),
            dtype: tensor.element_type(),
        }
    }

    /// Wraps a bare storage as a one-dimensional tensor.
    pub fn from_storage(storage: &StorageRecord) -> Self {
        let values = storage.read_all();
        let len = values.len();
        Self {
            data: reshape(&values, &[len]),
            shape: vec![len],
            dtype: storage.element_type(),
        }
    }

    /// Number of elements the shape declares.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "data": Value::from(&self.data),
            "shape": self.shape,
            "dtype": self.dtype.label(),
        })
    }
}

/// One top-level entry of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckpointEntry {
    Tensor(SerializedTensor),
    Value(Value),
}

impl CheckpointEntry {
    pub fn as_tensor(&self) -> Option<&SerializedTensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Tensor(_) => None,
            Self::Value(value) => Some(value),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Tensor(tensor) => tensor.to_json(),
            Self::Value(value) => value.clone(),
        }
    }

    fn from_object(obj: &Object) -> Self {
        match obj {
            Object::Tensor(tensor) => Self::Tensor(SerializedTensor::from_tensor(tensor)),
            Object::Storage(storage) => Self::Tensor(SerializedTensor::from_storage(storage)),
            other => Self::Value(object_to_json(other)),
        }
    }
}

/// Decoded checkpoint, in the order the pickle inserted its entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    entries: IndexMap<String, CheckpointEntry>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts the root object of a replayed pickle.
    ///
    /// The root must be a mapping; non-string keys are stringified.
    pub fn from_object(root: &Object) -> Result<Self, AttemptError> {
        let entries = match root {
            Object::Dict(entries) => entries,
            other => return Err(AttemptError::NotAMapping(other.type_name())),
        };

        let mut checkpoint = Self::new();
        for (key, value) in entries {
            let name = key_string(key);
            log::debug!("Converting entry {name} ({})", value.type_name());
            checkpoint.insert(name, CheckpointEntry::from_object(value));
        }
        Ok(checkpoint)
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        entry: CheckpointEntry,
    ) -> Option<CheckpointEntry> {
        self.entries.insert(name.into(), entry)
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointEntry> {
        self.entries.get(name)
    }

    /// The entry named `name`, if it is a tensor.
    pub fn tensor(&self, name: &str) -> Option<&SerializedTensor> {
        self.get(name).and_then(CheckpointEntry::as_tensor)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, CheckpointEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps only the named entries, preserving checkpoint order.
    pub fn retain_keys(&mut self, names: &[String]) {
        self.entries.retain(|name, _| names.contains(name));
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.to_json()))
                .collect(),
        )
    }
}

impl IntoIterator for Checkpoint {
    type Item = (String, CheckpointEntry);
    type IntoIter = indexmap::map::IntoIter<String, CheckpointEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a Checkpoint {
    type Item = (&'a String, &'a CheckpointEntry);
    type IntoIter = indexmap::map::Iter<'a, String, CheckpointEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Converts a replayed object to JSON.
pub fn object_to_json(obj: &Object) -> Value {
    match obj {
        Object::Global(global) => Value::String(global.to_string()),
        Object::String(s) => Value::String(s.clone()),
        Object::Bytes(bytes) => Value::Array(bytes.iter().map(|&b| Value::from(b)).collect()),
        Object::Int(v) => Value::from(*v),
        Object::Long(bytes) => Value::String(long_to_decimal(bytes)),
        Object::Float(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        Object::Bool(v) => Value::Bool(*v),
        Object::None => Value::Null,
        Object::Tuple(items) | Object::List(items) => {
            Value::Array(items.iter().map(object_to_json).collect())
        }
        Object::Dict(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (key_string(key), object_to_json(value)))
                .collect::<Map<String, Value>>(),
        ),
        Object::Storage(storage) => SerializedTensor::from_storage(storage).to_json(),
        Object::Tensor(tensor) => SerializedTensor::from_tensor(tensor).to_json(),
        Object::Reduce { callable, args } => json!({
            "callable": object_to_json(callable),
            "args": object_to_json(args),
        }),
        Object::Build { object, state } => json!({
            "object": object_to_json(object),
            "state": object_to_json(state),
        }),
    }
}

/// Mapping keys the way Python's `str()` prints them.
fn key_string(key: &Object) -> String {
    match key {
        Object::String(s) => s.clone(),
        Object::Int(v) => v.to_string(),
        Object::Long(bytes) => long_to_decimal(bytes),
        Object::Float(v) => v.to_string(),
        Object::Bool(true) => "True".to_string(),
        Object::Bool(false) => "False".to_string(),
        Object::None => "None".to_string(),
        Object::Global(global) => global.to_string(),
        other => match other.as_text() {
            Some(text) => text.into_owned(),
            None => object_to_json(other).to_string(),
        },
    }
}

/// Decimal digits of a little-endian two's complement integer of any width.
fn long_to_decimal(bytes: &[u8]) -> String {
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    let mut magnitude = bytes.to_vec();
    if negative {
        let mut carry = true;
        for byte in magnitude.iter_mut() {
            *byte = !*byte;
            if carry {
                let (sum, overflow) = byte.overflowing_add(1);
                *byte = sum;
                carry = overflow;
            }
        }
    }

    // Long division by ten over big-endian bytes.
    magnitude.reverse();
    let mut digits = Vec::new();
    while magnitude.iter().any(|&b| b != 0) {
        let mut rem = 0u32;
        for byte in magnitude.iter_mut() {
            let current = (rem << 8) | *byte as u32;
            *byte = (current / 10) as u8;
            rem = current % 10;
        }
        digits.push(char::from(b'0' + rem as u8));
    }
    if digits.is_empty() {
        digits.push('0');
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}
