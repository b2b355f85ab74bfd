#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::Int32 | Self::Int64)
    }

    #[must_use]
    pub const fn is_floating(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Maps a host value into the value domain of this dtype.
    #[must_use]
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            Self::Bool => {
                if value != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Int32 => f64::from(value as i32),
            Self::Int64 => (value as i64) as f64,
            Self::Float32 => f64::from(value as f32),
            Self::Float64 => value,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Strict,
    Hardened,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("shapes not compatible: rank {expected} vs rank {actual}")]
    RankMismatch { expected: usize, actual: usize },
    #[error("shapes not compatible at dim={dim}: expected={expected}, actual={actual}")]
    DimMismatch {
        dim: usize,
        expected: usize,
        actual: String,
    },
}

/// Shape whose individual dims may be unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartialShape {
    dims: Vec<Option<usize>>,
}

impl PartialShape {
    #[must_use]
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self { dims }
    }

    #[must_use]
    pub fn known(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Some).collect(),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn dims(&self) -> &[Option<usize>] {
        &self.dims
    }

    #[must_use]
    pub fn is_fully_defined(&self) -> bool {
        self.dims.iter().all(Option::is_some)
    }

    #[must_use]
    pub fn to_concrete(&self) -> Option<Vec<usize>> {
        self.dims.iter().copied().collect()
    }

    /// Unifies `other` into this constraint. Wildcards here adopt the
    /// corresponding dim of `other`; known dims must match exactly.
    pub fn merge_with(&self, other: &PartialShape) -> Result<PartialShape, ShapeError> {
        if self.rank() != other.rank() {
            return Err(ShapeError::RankMismatch {
                expected: self.rank(),
                actual: other.rank(),
            });
        }

        let mut merged = Vec::with_capacity(self.rank());
        for (dim, (existing, incoming)) in self.dims.iter().zip(other.dims.iter()).enumerate() {
            match existing {
                None => merged.push(*incoming),
                Some(known) if Some(*known) == *incoming => merged.push(*incoming),
                Some(known) => {
                    return Err(ShapeError::DimMismatch {
                        dim,
                        expected: *known,
                        actual: dim_label(*incoming),
                    });
                }
            }
        }
        Ok(PartialShape::new(merged))
    }

    /// True when `concrete` satisfies every known dim of this shape.
    #[must_use]
    pub fn is_compatible_with(&self, concrete: &[usize]) -> bool {
        self.rank() == concrete.len()
            && self
                .dims
                .iter()
                .zip(concrete.iter())
                .all(|(want, have)| want.is_none_or(|want| want == *have))
    }
}

impl From<Vec<usize>> for PartialShape {
    fn from(dims: Vec<usize>) -> Self {
        Self::known(&dims)
    }
}

impl From<&[usize]> for PartialShape {
    fn from(dims: &[usize]) -> Self {
        Self::known(dims)
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            f.write_str(&dim_label(*dim))?;
        }
        if self.dims.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

fn dim_label(dim: Option<usize>) -> String {
    dim.map_or_else(|| "None".to_string(), |size| size.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error("data length {data_len} does not match shape {shape:?} (numel={numel})")]
    NumelMismatch {
        shape: Vec<usize>,
        numel: usize,
        data_len: usize,
    },
    #[error("len() of a 0-d tensor")]
    ZeroDimLength,
    #[error("iteration over a 0-d tensor not supported")]
    ZeroDimIteration,
    #[error(
        "the truth value of a tensor with {numel} elements is ambiguous; reduce with any() or all()"
    )]
    AmbiguousTruthValue { numel: usize },
    #[error("tensor of dtype {dtype} with {numel} elements cannot be used as an index")]
    NotAnIndex { dtype: DType, numel: usize },
    #[error("index {value} does not fit in a signed 64-bit index")]
    IndexOverflow { value: usize },
    #[error("tensor's shape {actual:?} is not compatible with supplied shape {requested}")]
    IncompatibleShape {
        actual: Vec<usize>,
        requested: PartialShape,
    },
}

/// Eager tensor with contiguous row-major `f64` storage.
///
/// Values are normalized to the dtype's domain on construction, so an
/// `Int32` tensor only ever stores integral values.
#[derive(Debug, Clone)]
pub struct DenseTensor {
    id: u64,
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<f64>,
}

impl DenseTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>, dtype: DType) -> Result<Self, TensorError> {
        let numel = numel_of(&shape);
        if numel != data.len() {
            return Err(TensorError::NumelMismatch {
                shape,
                numel,
                data_len: data.len(),
            });
        }
        let data = data.into_iter().map(|value| dtype.normalize(value)).collect();
        Ok(Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            dtype,
            data,
        })
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            shape: Vec::new(),
            dtype,
            data: vec![dtype.normalize(value)],
        }
    }

    #[must_use]
    pub fn from_slice(values: &[f64], dtype: DType) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            shape: vec![values.len()],
            dtype,
            data: values.iter().map(|value| dtype.normalize(*value)).collect(),
        }
    }

    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let numel = numel_of(&shape);
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            dtype,
            data: vec![0.0; numel],
        }
    }

    /// Identity of this tensor value. Clones share it.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn partial_shape(&self) -> PartialShape {
        PartialShape::known(&self.shape)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Size of the leading axis.
    pub fn len(&self) -> Result<usize, TensorError> {
        self.shape.first().copied().ok_or(TensorError::ZeroDimLength)
    }

    pub fn is_empty(&self) -> Result<bool, TensorError> {
        Ok(self.len()? == 0)
    }

    /// Checks that this tensor satisfies `shape`; never mutates.
    pub fn set_shape(&self, shape: &PartialShape) -> Result<(), TensorError> {
        if shape.is_compatible_with(&self.shape) {
            Ok(())
        } else {
            Err(TensorError::IncompatibleShape {
                actual: self.shape.clone(),
                requested: shape.clone(),
            })
        }
    }

    pub fn truth_value(&self) -> Result<bool, TensorError> {
        match self.data.as_slice() {
            [value] => Ok(*value != 0.0),
            _ => Err(TensorError::AmbiguousTruthValue {
                numel: self.numel(),
            }),
        }
    }

    /// Unwraps a single-element integer tensor into an index value.
    pub fn to_index(&self) -> Result<i64, TensorError> {
        match self.data.as_slice() {
            [value] if self.dtype.is_integer() => Ok(*value as i64),
            _ => Err(TensorError::NotAnIndex {
                dtype: self.dtype,
                numel: self.numel(),
            }),
        }
    }

    /// Unwraps a rank-0 or rank-1 integer tensor into index values.
    pub fn to_indices(&self) -> Result<Vec<i64>, TensorError> {
        if !self.dtype.is_integer() || self.ndim() > 1 {
            return Err(TensorError::NotAnIndex {
                dtype: self.dtype,
                numel: self.numel(),
            });
        }
        Ok(self.data.iter().map(|value| *value as i64).collect())
    }

    /// Slices along the leading axis.
    pub fn rows(&self) -> Result<Rows<'_>, TensorError> {
        let count = self
            .shape
            .first()
            .copied()
            .ok_or(TensorError::ZeroDimIteration)?;
        let row_shape = self.shape[1..].to_vec();
        let stride = numel_of(&row_shape);
        Ok(Rows {
            source: self,
            row_shape,
            stride,
            next: 0,
            count,
        })
    }

    /// Copy with the same dtype and new values, under a fresh identity.
    pub fn with_data(&self, shape: Vec<usize>, data: Vec<f64>) -> Result<Self, TensorError> {
        Self::new(shape, data, self.dtype)
    }
}

impl PartialEq for DenseTensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && self.shape == other.shape && self.data == other.data
    }
}

impl fmt::Display for DenseTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EagerTensor({:?}, shape={}, dtype={})",
            self.data,
            PartialShape::known(&self.shape),
            self.dtype
        )
    }
}

pub struct Rows<'a> {
    source: &'a DenseTensor,
    row_shape: Vec<usize>,
    stride: usize,
    next: usize,
    count: usize,
}

impl Iterator for Rows<'_> {
    type Item = DenseTensor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let start = self.next * self.stride;
        self.next += 1;
        Some(DenseTensor {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            shape: self.row_shape.clone(),
            dtype: self.source.dtype,
            data: self.source.data[start..start + self.stride].to_vec(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Rows<'_> {}

#[must_use]
pub fn numel_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{DType, DenseTensor, PartialShape, ShapeError, TensorError};

    #[test]
    fn dtype_normalization_follows_domain() {
        assert_eq!(DType::Int32.normalize(2.9), 2.0);
        assert_eq!(DType::Int64.normalize(-3.7), -3.0);
        assert_eq!(DType::Bool.normalize(0.25), 1.0);
        assert_eq!(DType::Bool.normalize(0.0), 0.0);
        assert_eq!(DType::Float32.normalize(0.1), f64::from(0.1f32));
        assert_eq!(DType::Float64.normalize(0.1), 0.1);
    }

    #[test]
    fn new_rejects_numel_mismatch() {
        let err = DenseTensor::new(vec![2, 3], vec![0.0; 5], DType::Float32)
            .expect_err("five values cannot fill a 2x3 tensor");
        assert!(matches!(
            err,
            TensorError::NumelMismatch {
                numel: 6,
                data_len: 5,
                ..
            }
        ));
    }

    #[test]
    fn zeros_with_empty_leading_dim_has_no_data() {
        let tensor = DenseTensor::zeros(vec![0, 4], DType::Float32);
        assert_eq!(tensor.numel(), 0);
        assert_eq!(tensor.len().expect("rank-2 tensor has a length"), 0);
    }

    #[test]
    fn merge_fills_wildcards_from_incoming_shape() {
        let existing = PartialShape::new(vec![None, Some(4)]);
        let merged = existing
            .merge_with(&PartialShape::known(&[3, 4]))
            .expect("(None, 4) accepts (3, 4)");
        assert_eq!(merged, PartialShape::known(&[3, 4]));

        let err = merged
            .merge_with(&PartialShape::known(&[5, 4]))
            .expect_err("(3, 4) rejects (5, 4)");
        assert!(matches!(
            err,
            ShapeError::DimMismatch {
                dim: 0,
                expected: 3,
                ..
            }
        ));
    }

    #[test]
    fn merge_rejects_rank_mismatch() {
        let err = PartialShape::known(&[2])
            .merge_with(&PartialShape::known(&[2, 1]))
            .expect_err("rank 1 vs rank 2");
        assert_eq!(
            err,
            ShapeError::RankMismatch {
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn merge_does_not_relax_known_dim_to_wildcard() {
        let err = PartialShape::known(&[2])
            .merge_with(&PartialShape::new(vec![None]))
            .expect_err("a known dim never accepts an unknown one");
        assert!(matches!(err, ShapeError::DimMismatch { dim: 0, .. }));
    }

    #[test]
    fn partial_shape_display_reads_like_a_tuple() {
        assert_eq!(PartialShape::new(vec![None, Some(4)]).to_string(), "(None, 4)");
        assert_eq!(PartialShape::known(&[3]).to_string(), "(3,)");
        assert_eq!(PartialShape::known(&[]).to_string(), "()");
    }

    #[test]
    fn set_shape_checks_known_dims_only() {
        let tensor = DenseTensor::zeros(vec![2, 3], DType::Float64);
        assert!(tensor.set_shape(&PartialShape::new(vec![None, Some(3)])).is_ok());
        let err = tensor
            .set_shape(&PartialShape::new(vec![Some(3), None]))
            .expect_err("leading dim disagrees");
        assert!(matches!(err, TensorError::IncompatibleShape { .. }));
        assert!(tensor.set_shape(&PartialShape::known(&[6])).is_err());
    }

    #[test]
    fn truth_value_requires_single_element() {
        assert!(DenseTensor::scalar(2.0, DType::Int32)
            .truth_value()
            .expect("scalar has a truth value"));
        assert!(!DenseTensor::from_slice(&[0.0], DType::Float32)
            .truth_value()
            .expect("single element has a truth value"));
        let err = DenseTensor::from_slice(&[1.0, 0.0], DType::Float32)
            .truth_value()
            .expect_err("two elements are ambiguous");
        assert_eq!(err, TensorError::AmbiguousTruthValue { numel: 2 });
    }

    #[test]
    fn to_index_accepts_integer_scalars_only() {
        assert_eq!(
            DenseTensor::scalar(3.0, DType::Int32)
                .to_index()
                .expect("int32 scalar is an index"),
            3
        );
        assert!(DenseTensor::scalar(3.0, DType::Float32).to_index().is_err());
        assert!(DenseTensor::from_slice(&[1.0, 2.0], DType::Int64)
            .to_index()
            .is_err());
    }

    #[test]
    fn to_indices_reads_integer_vectors() {
        let indices = DenseTensor::from_slice(&[2.0, 0.0, 2.0], DType::Int32);
        assert_eq!(indices.to_indices().expect("int32 vector"), vec![2, 0, 2]);

        let matrix = DenseTensor::zeros(vec![2, 2], DType::Int64);
        assert!(matrix.to_indices().is_err());
        assert!(DenseTensor::from_slice(&[1.0], DType::Float32)
            .to_indices()
            .is_err());
    }

    #[test]
    fn rows_walk_the_leading_axis() {
        let tensor = DenseTensor::new(vec![3, 2], (0..6).map(f64::from).collect(), DType::Int32)
            .expect("3x2 tensor");
        let rows: Vec<_> = tensor.rows().expect("rank-2 tensor has rows").collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].shape(), &[2]);
        assert_eq!(rows[1].data(), &[2.0, 3.0]);
        assert_eq!(rows[2].dtype(), DType::Int32);

        let scalar = DenseTensor::scalar(1.0, DType::Int32);
        assert!(matches!(scalar.rows(), Err(TensorError::ZeroDimIteration)));
        assert_eq!(scalar.len(), Err(TensorError::ZeroDimLength));
    }

    #[test]
    fn equality_ignores_identity() {
        let a = DenseTensor::from_slice(&[1.0, 2.0], DType::Float32);
        let b = DenseTensor::from_slice(&[1.0, 2.0], DType::Float32);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
        assert_eq!(a.clone().id(), a.id());
    }

    proptest! {
        #[test]
        fn prop_merge_with_self_is_identity(
            dims in prop::collection::vec(prop::option::of(1usize..=8), 0..=4),
        ) {
            let shape = PartialShape::new(dims);
            let merged = shape.merge_with(&shape).expect("a shape is compatible with itself");
            prop_assert_eq!(merged, shape);
        }

        #[test]
        fn prop_wildcard_adopts_any_concrete(concrete in prop::collection::vec(0usize..=8, 0..=4)) {
            let wildcard = PartialShape::new(vec![None; concrete.len()]);
            let merged = wildcard
                .merge_with(&PartialShape::known(&concrete))
                .expect("all-wildcard shape accepts any shape of the same rank");
            prop_assert!(merged.is_fully_defined());
            prop_assert_eq!(merged.to_concrete(), Some(concrete));
        }
    }
}
