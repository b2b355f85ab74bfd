#![forbid(unsafe_code)]

//! Eager `TensorArray`: an index-addressable sequence of lazily
//! materialized tensor slots.
//!
//! Every slot is either empty or holds a tensor of the array's dtype. Writes
//! narrow a shared element-shape constraint, reads may clear the slot they
//! touched, and `stack`/`gather`/`concat` fill empty slots with zeros of the
//! inferred element shape before delegating to the array kernels.

use std::collections::HashSet;

use ff_core::{DType, DenseTensor, ExecutionMode, PartialShape, ShapeError, TensorError};
use ff_kernel_cpu::{ArrayKernels, CpuKernels, KernelError};
use ff_runtime::{EvidenceEntry, EvidenceKind, RuntimeContext};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Bounds,
    Capacity,
    ConsumedTwice,
    DtypeMismatch,
    ShapeMismatch,
    UnknownShape,
    InvalidArgument,
    Unsupported,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorArrayError {
    #[error("{op} at negative index {index} is not allowed")]
    NegativeIndex { op: &'static str, index: i64 },
    #[error("tried to read from index {index} but array size is {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("tried to write to index {index} but array is not resizable and size is {len}")]
    NotResizable { index: usize, len: usize },
    #[error("cannot grow TensorArray of size {len} to {requested} slots")]
    CapacityExceeded { requested: usize, len: usize },
    #[error("cannot unstack {slices} tensors into a TensorArray of static size {len}")]
    UnstackOverflow { slices: usize, len: usize },
    #[error(
        "could not read index {index} twice because it was cleared after a previous read \
         (perhaps try setting clear_after_read = false?)"
    )]
    AlreadyConsumed { index: usize },
    #[error("TensorArray dtype is {expected} but op is trying to write dtype {actual}")]
    DTypeMismatch { expected: DType, actual: DType },
    #[error("element shape {existing} is not compatible with {incoming}: {source}")]
    ShapeMismatch {
        existing: PartialShape,
        incoming: PartialShape,
        #[source]
        source: ShapeError,
    },
    #[error("scatter got {indices} indices for {rows} rows")]
    ScatterArity { indices: usize, rows: usize },
    #[error(
        "element shape {} is not fully defined; cannot build zeros",
        describe_shape(.shape.as_ref())
    )]
    UnknownElementShape { shape: Option<PartialShape> },
    #[error("TensorArray size must be non-negative, got {size}")]
    InvalidSize { size: i64 },
    #[error(
        "TensorArray.grad is not supported when executing eagerly; gradients of operations \
         that use TensorArrays do not go through this function"
    )]
    GradUnsupported,
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl TensorArrayError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NegativeIndex { .. } | Self::IndexOutOfBounds { .. } => ErrorKind::Bounds,
            Self::NotResizable { .. }
            | Self::CapacityExceeded { .. }
            | Self::UnstackOverflow { .. } => ErrorKind::Capacity,
            Self::AlreadyConsumed { .. } => ErrorKind::ConsumedTwice,
            Self::DTypeMismatch { .. } => ErrorKind::DtypeMismatch,
            Self::ShapeMismatch { .. } | Self::ScatterArity { .. } => ErrorKind::ShapeMismatch,
            Self::UnknownElementShape { .. } => ErrorKind::UnknownShape,
            Self::InvalidSize { .. } | Self::Tensor(_) => ErrorKind::InvalidArgument,
            Self::GradUnsupported => ErrorKind::Unsupported,
            Self::Kernel(_) => ErrorKind::Kernel,
        }
    }
}

fn describe_shape(shape: Option<&PartialShape>) -> String {
    shape.map_or_else(|| "<unknown rank>".to_string(), ToString::to_string)
}

/// Anything that resolves to a signed scalar index, including wrapped
/// integer scalar tensors.
pub trait ScalarIndex {
    fn to_index(&self) -> Result<i64, TensorError>;
}

impl ScalarIndex for i64 {
    fn to_index(&self) -> Result<i64, TensorError> {
        Ok(*self)
    }
}

impl ScalarIndex for i32 {
    fn to_index(&self) -> Result<i64, TensorError> {
        Ok(i64::from(*self))
    }
}

impl ScalarIndex for usize {
    fn to_index(&self) -> Result<i64, TensorError> {
        i64::try_from(*self).map_err(|_| TensorError::IndexOverflow { value: *self })
    }
}

impl ScalarIndex for DenseTensor {
    fn to_index(&self) -> Result<i64, TensorError> {
        DenseTensor::to_index(self)
    }
}

impl<T: ScalarIndex + ?Sized> ScalarIndex for &T {
    fn to_index(&self) -> Result<i64, TensorError> {
        (**self).to_index()
    }
}

/// Value accepted by write-style operations. Typed tensors are taken as-is;
/// host literals are cast to the array's dtype first.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayValue {
    Tensor(DenseTensor),
    Literal { shape: Vec<usize>, data: Vec<f64> },
}

impl ArrayValue {
    #[must_use]
    pub fn literal(shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self::Literal { shape, data }
    }
}

impl From<DenseTensor> for ArrayValue {
    fn from(value: DenseTensor) -> Self {
        Self::Tensor(value)
    }
}

impl From<&DenseTensor> for ArrayValue {
    fn from(value: &DenseTensor) -> Self {
        Self::Tensor(value.clone())
    }
}

impl From<f64> for ArrayValue {
    fn from(value: f64) -> Self {
        Self::Literal {
            shape: Vec::new(),
            data: vec![value],
        }
    }
}

impl From<Vec<f64>> for ArrayValue {
    fn from(values: Vec<f64>) -> Self {
        Self::Literal {
            shape: vec![values.len()],
            data: values,
        }
    }
}

impl From<&[f64]> for ArrayValue {
    fn from(values: &[f64]) -> Self {
        Self::from(values.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TensorArrayOptions {
    pub dynamic_size: bool,
    pub clear_after_read: bool,
    pub infer_shape: bool,
    pub element_shape: Option<PartialShape>,
    pub colocate_with_first_write_call: bool,
    pub mode: ExecutionMode,
}

impl Default for TensorArrayOptions {
    fn default() -> Self {
        Self {
            dynamic_size: false,
            clear_after_read: true,
            infer_shape: true,
            element_shape: None,
            colocate_with_first_write_call: true,
            mode: ExecutionMode::Strict,
        }
    }
}

impl TensorArrayOptions {
    #[must_use]
    pub fn with_dynamic_size(mut self, dynamic_size: bool) -> Self {
        self.dynamic_size = dynamic_size;
        self
    }

    #[must_use]
    pub fn with_clear_after_read(mut self, clear_after_read: bool) -> Self {
        self.clear_after_read = clear_after_read;
        self
    }

    #[must_use]
    pub fn with_infer_shape(mut self, infer_shape: bool) -> Self {
        self.infer_shape = infer_shape;
        self
    }

    #[must_use]
    pub fn with_element_shape(mut self, element_shape: impl Into<PartialShape>) -> Self {
        self.element_shape = Some(element_shape.into());
        self
    }

    #[must_use]
    pub fn with_colocate_with_first_write_call(mut self, colocate: bool) -> Self {
        self.colocate_with_first_write_call = colocate;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TensorArray<K: ArrayKernels = CpuKernels> {
    kernels: K,
    dtype: DType,
    slots: Vec<Option<DenseTensor>>,
    element_shape: Option<PartialShape>,
    dynamic_size: bool,
    clear_after_read: bool,
    infer_shape: bool,
    colocate_with_first_write_call: bool,
    consumed: HashSet<usize>,
    runtime: RuntimeContext,
}

impl TensorArray<CpuKernels> {
    pub fn new(dtype: DType, size: impl ScalarIndex) -> Result<Self, TensorArrayError> {
        Self::with_options(dtype, size, TensorArrayOptions::default())
    }

    pub fn with_options(
        dtype: DType,
        size: impl ScalarIndex,
        options: TensorArrayOptions,
    ) -> Result<Self, TensorArrayError> {
        Self::with_kernels(CpuKernels, dtype, size, options)
    }
}

impl<K: ArrayKernels> TensorArray<K> {
    pub fn with_kernels(
        kernels: K,
        dtype: DType,
        size: impl ScalarIndex,
        options: TensorArrayOptions,
    ) -> Result<Self, TensorArrayError> {
        let requested = size.to_index()?;
        let size = usize::try_from(requested)
            .map_err(|_| TensorArrayError::InvalidSize { size: requested })?;
        let mut slots = Vec::new();
        reserve_slots(&mut slots, size)?;

        let mut runtime = RuntimeContext::new(options.mode);
        runtime.record(
            EvidenceKind::Policy,
            format!(
                "created dtype={dtype} size={size} dynamic_size={} clear_after_read={} \
                 infer_shape={} element_shape={}",
                options.dynamic_size,
                options.clear_after_read,
                options.infer_shape,
                describe_shape(options.element_shape.as_ref()),
            ),
        );

        Ok(Self {
            kernels,
            dtype,
            slots,
            element_shape: options.element_shape,
            dynamic_size: options.dynamic_size,
            clear_after_read: options.clear_after_read,
            infer_shape: options.infer_shape,
            colocate_with_first_write_call: options.colocate_with_first_write_call,
            consumed: HashSet::new(),
            runtime,
        })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn element_shape(&self) -> Option<&PartialShape> {
        self.element_shape.as_ref()
    }

    #[must_use]
    pub fn dynamic_size(&self) -> bool {
        self.dynamic_size
    }

    #[must_use]
    pub fn clear_after_read(&self) -> bool {
        self.clear_after_read
    }

    #[must_use]
    pub fn infer_shape(&self) -> bool {
        self.infer_shape
    }

    #[must_use]
    pub fn colocate_with_first_write_call(&self) -> bool {
        self.colocate_with_first_write_call
    }

    /// Eager arrays have no graph flow; this is always an int32 zero.
    #[must_use]
    pub fn flow(&self) -> DenseTensor {
        DenseTensor::scalar(0.0, DType::Int32)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn size_tensor(&self) -> DenseTensor {
        DenseTensor::scalar(self.slots.len() as f64, DType::Int32)
    }

    #[must_use]
    pub fn is_consumed(&self, index: usize) -> bool {
        self.consumed.contains(&index)
    }

    #[must_use]
    pub fn is_materialized(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    #[must_use]
    pub fn evidence(&self) -> &[EvidenceEntry] {
        self.runtime.ledger().entries()
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.runtime
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.runtime.set_mode(mode);
    }

    /// The same array; eager arrays carry no separate graph handle.
    pub fn identity(&mut self) -> &mut Self {
        self
    }

    pub fn grad(&mut self, source: &str) -> Result<&mut Self, TensorArrayError> {
        let error = TensorArrayError::GradUnsupported;
        self.runtime
            .record_rejection(&format!("grad(source={source})"), &error);
        Err(error)
    }

    pub fn read<I: ScalarIndex>(&mut self, index: I) -> Result<DenseTensor, TensorArrayError> {
        let result = index
            .to_index()
            .map_err(TensorArrayError::from)
            .and_then(|index| self.read_at(index));
        self.observe("read", result)
    }

    pub fn write<I: ScalarIndex>(
        &mut self,
        index: I,
        value: impl Into<ArrayValue>,
    ) -> Result<&mut Self, TensorArrayError> {
        let value = value.into();
        let result = index
            .to_index()
            .map_err(TensorArrayError::from)
            .and_then(|index| self.write_at(index, value));
        self.observe("write", result)?;
        Ok(self)
    }

    pub fn stack(&mut self) -> Result<DenseTensor, TensorArrayError> {
        let result = self.stack_all();
        self.observe("stack", result)
    }

    pub fn gather<I: ScalarIndex>(
        &mut self,
        indices: &[I],
    ) -> Result<DenseTensor, TensorArrayError> {
        let result = self.gather_rows(indices);
        self.observe("gather", result)
    }

    pub fn concat(&mut self) -> Result<DenseTensor, TensorArrayError> {
        let result = self.concat_all();
        self.observe("concat", result)
    }

    pub fn unstack(&mut self, value: impl Into<ArrayValue>) -> Result<&mut Self, TensorArrayError> {
        let result = self.unstack_into(value.into());
        self.observe("unstack", result)?;
        Ok(self)
    }

    pub fn scatter<I: ScalarIndex>(
        &mut self,
        indices: &[I],
        value: impl Into<ArrayValue>,
    ) -> Result<&mut Self, TensorArrayError> {
        let result = self.scatter_rows(indices, value.into());
        self.observe("scatter", result)?;
        Ok(self)
    }

    pub fn split(
        &mut self,
        value: impl Into<ArrayValue>,
        lengths: &[usize],
    ) -> Result<&mut Self, TensorArrayError> {
        let result = self.split_into(value.into(), lengths);
        self.observe("split", result)?;
        Ok(self)
    }

    /// Drops every slot and forgets consumed indices.
    pub fn close(&mut self) {
        let len = self.slots.len();
        self.slots.clear();
        self.consumed.clear();
        self.runtime
            .record(EvidenceKind::Close, format!("closed len={len}"));
    }

    fn read_at(&mut self, index: i64) -> Result<DenseTensor, TensorArrayError> {
        let index = self.bounded_index("read", index)?;
        let tensor = match self.slots[index].clone() {
            Some(tensor) => tensor,
            None if self.consumed.contains(&index) => {
                return Err(TensorArrayError::AlreadyConsumed { index });
            }
            None => self.materialize(index)?,
        };

        if self.clear_after_read {
            self.slots[index] = None;
            self.consumed.insert(index);
            self.runtime
                .record(EvidenceKind::Clear, format!("index={index}"));
        }
        self.runtime.record(
            EvidenceKind::Read,
            format!("index={index} shape={:?}", tensor.shape()),
        );
        Ok(tensor)
    }

    fn write_at(&mut self, index: i64, value: ArrayValue) -> Result<(), TensorArrayError> {
        let index = non_negative("write", index)?;
        let len = self.slots.len();
        if index >= len && !self.dynamic_size {
            return Err(TensorArrayError::NotResizable { index, len });
        }

        if index >= len {
            let requested = index
                .checked_add(1)
                .ok_or(TensorArrayError::CapacityExceeded { requested: index, len })?;
            reserve_slots(&mut self.slots, requested)?;
            self.runtime
                .record(EvidenceKind::Grow, format!("len {len} -> {requested}"));
        }

        let tensor = self.coerce(value)?;
        let shape = self.admit(&tensor, self.element_shape.as_ref())?;
        self.element_shape = shape;
        self.runtime.record(
            EvidenceKind::Write,
            format!("index={index} shape={:?}", tensor.shape()),
        );
        self.slots[index] = Some(tensor);
        Ok(())
    }

    fn stack_all(&mut self) -> Result<DenseTensor, TensorArrayError> {
        if self.slots.is_empty() {
            return self.empty_stack();
        }
        let values = self.materialize_all()?;
        Ok(self.kernels.stack(&values)?)
    }

    fn gather_rows<I: ScalarIndex>(
        &mut self,
        indices: &[I],
    ) -> Result<DenseTensor, TensorArrayError> {
        if indices.is_empty() {
            return self.empty_stack();
        }

        let mut values = Vec::with_capacity(indices.len());
        for index in indices {
            let index = self.bounded_index("gather", index.to_index()?)?;
            values.push(self.materialize(index)?);
        }
        Ok(self.kernels.stack(&values)?)
    }

    fn concat_all(&mut self) -> Result<DenseTensor, TensorArrayError> {
        if self.slots.is_empty() {
            let shape = self.concrete_element_shape()?;
            if let Some((_, rest)) = shape.split_first() {
                let mut empty = vec![0];
                empty.extend_from_slice(rest);
                return Ok(self.kernels.zeros(&empty, self.dtype));
            }
            return Err(KernelError::ZeroDimInput { op: "concat" }.into());
        }
        let values = self.materialize_all()?;
        Ok(self.kernels.concat(&values, 0)?)
    }

    fn unstack_into(&mut self, value: ArrayValue) -> Result<(), TensorArrayError> {
        let value = self.coerce(value)?;
        let slices = self.kernels.unstack(&value)?;
        if slices.len() > self.slots.len() && !self.dynamic_size {
            return Err(TensorArrayError::UnstackOverflow {
                slices: slices.len(),
                len: self.slots.len(),
            });
        }
        self.replace_slots("unstack", slices)
    }

    fn scatter_rows<I: ScalarIndex>(
        &mut self,
        indices: &[I],
        value: ArrayValue,
    ) -> Result<(), TensorArrayError> {
        let indices = indices
            .iter()
            .map(|index| index.to_index())
            .collect::<Result<Vec<_>, _>>()?;
        let value = self.coerce(value)?;
        let rows = self.kernels.unstack(&value)?;

        if rows.len() != indices.len() {
            match self.runtime.mode() {
                ExecutionMode::Strict => {
                    return Err(TensorArrayError::ScatterArity {
                        indices: indices.len(),
                        rows: rows.len(),
                    });
                }
                ExecutionMode::Hardened => self.runtime.record(
                    EvidenceKind::Policy,
                    format!(
                        "scatter arity mismatch indices={} rows={}; unmatched entries ignored",
                        indices.len(),
                        rows.len()
                    ),
                ),
            }
        }

        for (index, row) in indices.into_iter().zip(rows) {
            self.write_at(index, ArrayValue::Tensor(row))?;
        }
        Ok(())
    }

    fn split_into(&mut self, value: ArrayValue, lengths: &[usize]) -> Result<(), TensorArrayError> {
        let value = match value {
            ArrayValue::Tensor(tensor) => self.kernels.cast(&tensor, self.dtype)?,
            literal => self.coerce(literal)?,
        };
        let chunks = self.kernels.split(&value, lengths)?;
        self.replace_slots("split", chunks)
    }

    /// Admits every tensor against a scratch constraint, then swaps the
    /// whole slot sequence in one step.
    fn replace_slots(
        &mut self,
        op: &'static str,
        tensors: Vec<DenseTensor>,
    ) -> Result<(), TensorArrayError> {
        let mut shape = self.element_shape.clone();
        for tensor in &tensors {
            shape = self.admit(tensor, shape.as_ref())?;
        }

        let previous = self.slots.len();
        self.element_shape = shape;
        self.slots = tensors.into_iter().map(Some).collect();
        self.runtime.record(
            EvidenceKind::Replace,
            format!("op={op} len {previous} -> {}", self.slots.len()),
        );
        Ok(())
    }

    fn coerce(&self, value: ArrayValue) -> Result<DenseTensor, TensorArrayError> {
        match value {
            ArrayValue::Tensor(tensor) => Ok(tensor),
            ArrayValue::Literal { shape, data } => {
                let host = DenseTensor::new(shape, data, DType::Float64)?;
                Ok(self.kernels.cast(&host, self.dtype)?)
            }
        }
    }

    /// Checks dtype and returns the element shape after unifying `tensor`
    /// into `constraint`.
    fn admit(
        &self,
        tensor: &DenseTensor,
        constraint: Option<&PartialShape>,
    ) -> Result<Option<PartialShape>, TensorArrayError> {
        if tensor.dtype() != self.dtype {
            return Err(TensorArrayError::DTypeMismatch {
                expected: self.dtype,
                actual: tensor.dtype(),
            });
        }
        if !self.infer_shape {
            return Ok(constraint.cloned());
        }

        let incoming = tensor.partial_shape();
        match constraint {
            None => Ok(Some(incoming)),
            Some(existing) => existing
                .merge_with(&incoming)
                .map(Some)
                .map_err(|source| TensorArrayError::ShapeMismatch {
                    existing: existing.clone(),
                    incoming,
                    source,
                }),
        }
    }

    fn materialize(&mut self, index: usize) -> Result<DenseTensor, TensorArrayError> {
        if let Some(tensor) = &self.slots[index] {
            return Ok(tensor.clone());
        }
        let shape = self.concrete_element_shape()?;
        let zeros = self.kernels.zeros(&shape, self.dtype);
        self.runtime.record(
            EvidenceKind::Materialize,
            format!("index={index} shape={shape:?}"),
        );
        self.slots[index] = Some(zeros.clone());
        Ok(zeros)
    }

    fn materialize_all(&mut self) -> Result<Vec<DenseTensor>, TensorArrayError> {
        (0..self.slots.len())
            .map(|index| self.materialize(index))
            .collect()
    }

    fn empty_stack(&self) -> Result<DenseTensor, TensorArrayError> {
        let mut shape = vec![0];
        shape.extend(self.concrete_element_shape()?);
        Ok(self.kernels.zeros(&shape, self.dtype))
    }

    fn concrete_element_shape(&self) -> Result<Vec<usize>, TensorArrayError> {
        self.element_shape
            .as_ref()
            .and_then(PartialShape::to_concrete)
            .ok_or_else(|| TensorArrayError::UnknownElementShape {
                shape: self.element_shape.clone(),
            })
    }

    fn bounded_index(&self, op: &'static str, index: i64) -> Result<usize, TensorArrayError> {
        let index = non_negative(op, index)?;
        if index >= self.slots.len() {
            return Err(TensorArrayError::IndexOutOfBounds {
                index,
                len: self.slots.len(),
            });
        }
        Ok(index)
    }

    fn observe<T>(
        &mut self,
        op: &'static str,
        result: Result<T, TensorArrayError>,
    ) -> Result<T, TensorArrayError> {
        if let Err(error) = &result {
            self.runtime.record_rejection(op, error);
        }
        result
    }
}

/// Extends `slots` with empty slots up to `len`, failing instead of
/// aborting when the allocation cannot be made.
fn reserve_slots(slots: &mut Vec<Option<DenseTensor>>, len: usize) -> Result<(), TensorArrayError> {
    let current = slots.len();
    if len <= current {
        return Ok(());
    }
    slots
        .try_reserve_exact(len - current)
        .map_err(|_| TensorArrayError::CapacityExceeded {
            requested: len,
            len: current,
        })?;
    slots.resize(len, None);
    Ok(())
}

fn non_negative(op: &'static str, index: i64) -> Result<usize, TensorArrayError> {
    usize::try_from(index).map_err(|_| TensorArrayError::NegativeIndex { op, index })
}
