//! Tensor stand-ins built by `_rebuild_tensor_v2`.

use std::rc::Rc;

use super::storage::{ElementType, FlatValues, StorageRecord};
use crate::checkpoint::NestedArray;

/// A view over a storage: offset, shape and stride, as PyTorch pickles them.
#[derive(Debug, Clone)]
pub struct TensorRecord {
    storage: Option<Rc<StorageRecord>>,
    storage_offset: usize,
    shape: Vec<usize>,
    stride: Vec<i64>,
    requires_grad: bool,
}

/// Result of materializing a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Materialized {
    /// Values nested to the declared shape.
    Reshaped(NestedArray),
    /// The storage slice did not match the declared shape; values are kept flat.
    Flat(NestedArray),
}

impl Materialized {
    pub fn is_reshaped(&self) -> bool {
        matches!(self, Self::Reshaped(_))
    }

    pub fn into_inner(self) -> NestedArray {
        match self {
            Self::Reshaped(data) | Self::Flat(data) => data,
        }
    }
}

impl TensorRecord {
    pub fn new(
        storage: Option<Rc<StorageRecord>>,
        storage_offset: usize,
        shape: Vec<usize>,
        stride: Vec<i64>,
        requires_grad: bool,
    ) -> Self {
        Self {
            storage,
            storage_offset,
            shape,
            stride,
            requires_grad,
        }
    }

    pub fn storage(&self) -> Option<&Rc<StorageRecord>> {
        self.storage.as_ref()
    }

    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn stride(&self) -> &[i64] {
        &self.stride
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Element type of the backing storage; float32 when there is none.
    pub fn element_type(&self) -> ElementType {
        self.storage
            .as_ref()
            .map(|storage| storage.element_type())
            .unwrap_or_default()
    }

    /// Number of elements the shape declares.
    pub fn numel(&self) -> usize {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .unwrap_or(usize::MAX)
    }

    /// Slices `[offset, offset + numel)` out of the storage, clamped to its length.
    pub fn flat_values(&self) -> FlatValues {
        let element_type = self.element_type();
        match &self.storage {
            Some(storage) if !self.shape.is_empty() => {
                storage.read_or_zeros(self.storage_offset, self.numel())
            }
            _ => FlatValues::Float(Vec::new()).cast_to(element_type),
        }
    }

    /// Converts the tensor to nested values.
    ///
    /// Reshaping is row-major and ignores the stride. A tensor with an empty shape, or
    /// without a storage, materializes to an empty array. When the storage holds fewer
    /// elements than the shape needs the available slice is returned flat.
    ///
    /// A zero-element shape whose outer dimensions would nest more empty lists than the
    /// storage's fill limit also materializes to an empty array.
    pub fn materialize(&self) -> Materialized {
        let Some(storage) = &self.storage else {
            return Materialized::Flat(NestedArray::List(Vec::new()));
        };
        if self.shape.is_empty() {
            return Materialized::Flat(NestedArray::List(Vec::new()));
        }
        if self.numel() == 0
            && empty_rows(&self.shape).is_none_or(|rows| rows > storage.fill_limit())
        {
            log::warn!(
                "Shape {:?} nests more empty rows than the limit of {}; keeping flat",
                self.shape,
                storage.fill_limit()
            );
            return Materialized::Flat(NestedArray::List(Vec::new()));
        }

        let values = self.flat_values();
        if values.len() == self.numel() {
            Materialized::Reshaped(reshape(&values, &self.shape))
        } else {
            log::debug!(
                "Storage holds {} elements but shape {:?} needs {}; keeping flat",
                values.len(),
                self.shape,
                self.numel()
            );
            Materialized::Flat(reshape(&values, &[values.len()]))
        }
    }
}

impl FlatValues {
    fn cast_to(self, element_type: ElementType) -> Self {
        match (self, element_type.is_float()) {
            (Self::Float(v), false) => Self::Int(v.into_iter().map(|x| x as i64).collect()),
            (Self::Int(v), true) => Self::Float(v.into_iter().map(|x| x as f64).collect()),
            (values, _) => values,
        }
    }
}

/// Lists nested above the first zero-sized dimension, or `None` on overflow.
fn empty_rows(shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .take_while(|&&dim| dim != 0)
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Nests `values` to `shape`. The caller guarantees `values.len() == product(shape)`.
pub(crate) fn reshape(values: &FlatValues, shape: &[usize]) -> NestedArray {
    match values {
        FlatValues::Float(v) => nest(v, shape, NestedArray::Float),
        FlatValues::Int(v) => nest(v, shape, NestedArray::Int),
    }
}

fn nest<T: Copy>(values: &[T], shape: &[usize], leaf: fn(T) -> NestedArray) -> NestedArray {
    match shape {
        [] => values
            .first()
            .map(|&v| leaf(v))
            .unwrap_or(NestedArray::List(Vec::new())),
        [_] => NestedArray::List(values.iter().map(|&v| leaf(v)).collect()),
        [dim, rest @ ..] => {
            let inner: usize = rest.iter().product();
            NestedArray::List(
                (0..*dim)
                    .map(|i| nest(&values[i * inner..(i + 1) * inner], rest, leaf))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(values: &[f32]) -> Rc<StorageRecord> {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Rc::new(StorageRecord::loaded("0", ElementType::Float32, bytes))
    }

    fn tensor(storage: Rc<StorageRecord>, offset: usize, shape: &[usize]) -> TensorRecord {
        TensorRecord::new(Some(storage), offset, shape.to_vec(), vec![], false)
    }

    fn floats(values: &[f64]) -> NestedArray {
        NestedArray::List(values.iter().copied().map(NestedArray::Float).collect())
    }

    #[test]
    fn reshapes_row_major() {
        let t = tensor(storage(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 0, &[2, 3]);

        let out = t.materialize();

        assert!(out.is_reshaped());
        assert_eq!(
            out.into_inner(),
            NestedArray::List(vec![floats(&[1.0, 2.0, 3.0]), floats(&[4.0, 5.0, 6.0])])
        );
    }

    #[test]
    fn applies_storage_offset() {
        let t = tensor(storage(&[1.0, 2.0, 3.0, 4.0]), 2, &[2]);
        assert_eq!(t.materialize(), Materialized::Reshaped(floats(&[3.0, 4.0])));
    }

    #[test]
    fn short_storage_stays_flat() {
        let t = tensor(storage(&[1.0, 2.0, 3.0, 4.0]), 0, &[2, 3]);
        assert_eq!(t.materialize(), Materialized::Flat(floats(&[1.0, 2.0, 3.0, 4.0])));
    }

    #[test]
    fn offset_past_end_yields_empty_flat() {
        let t = tensor(storage(&[1.0]), 5, &[2]);
        assert_eq!(t.materialize(), Materialized::Flat(floats(&[])));
    }

    #[test]
    fn empty_shape_yields_empty_array() {
        let t = tensor(storage(&[7.0]), 0, &[]);
        assert_eq!(t.materialize().into_inner(), NestedArray::List(vec![]));
    }

    #[test]
    fn zero_sized_dimensions_reshape() {
        let t = tensor(storage(&[]), 0, &[3, 0]);
        assert_eq!(
            t.materialize(),
            Materialized::Reshaped(NestedArray::List(vec![
                NestedArray::List(vec![]),
                NestedArray::List(vec![]),
                NestedArray::List(vec![]),
            ]))
        );
    }

    #[test]
    fn huge_declared_shapes_stay_empty() {
        let storage = Rc::new(StorageRecord::unresolved("0", ElementType::Float32));
        let t = tensor(storage.clone(), 0, &[1 << 62]);
        assert_eq!(t.materialize(), Materialized::Flat(floats(&[])));

        let t = tensor(storage.clone(), 0, &[1 << 40, 0]);
        assert_eq!(t.materialize(), Materialized::Flat(floats(&[])));

        let t = tensor(storage, 0, &[usize::MAX, 2, 0]);
        assert_eq!(t.materialize(), Materialized::Flat(floats(&[])));
    }

    #[test]
    fn missing_storage_yields_empty_array() {
        let t = TensorRecord::new(None, 0, vec![2], vec![1], true);
        assert!(t.requires_grad());
        assert_eq!(t.materialize(), Materialized::Flat(NestedArray::List(vec![])));
        assert_eq!(t.element_type(), ElementType::Float32);
    }

    #[test]
    fn unresolved_storage_materializes_zeros() {
        let storage = Rc::new(StorageRecord::unresolved("k", ElementType::Int16));
        let t = tensor(storage, 0, &[1, 2]);
        assert_eq!(
            t.materialize(),
            Materialized::Reshaped(NestedArray::List(vec![NestedArray::List(vec![
                NestedArray::Int(0),
                NestedArray::Int(0)
            ])]))
        );
    }

    #[test]
    fn numel_saturates_on_overflow() {
        let t = TensorRecord::new(None, 0, vec![usize::MAX, 2], vec![], false);
        assert_eq!(t.numel(), usize::MAX);
    }
}
