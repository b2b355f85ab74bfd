#![forbid(unsafe_code)]

use ff_core::{DType, DenseTensor, TensorError, numel_of};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("{op} requires at least one input tensor")]
    EmptyInput { op: &'static str },
    #[error("{op}: dtype mismatch at input {position}: expected={expected}, actual={actual}")]
    DTypeMismatch {
        op: &'static str,
        position: usize,
        expected: DType,
        actual: DType,
    },
    #[error("{op}: shape mismatch at input {position}: expected={expected:?}, actual={actual:?}")]
    ShapeMismatch {
        op: &'static str,
        position: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{op}: axis {axis} out of range for rank {rank}")]
    AxisOutOfRange {
        op: &'static str,
        axis: usize,
        rank: usize,
    },
    #[error("{op} is not defined for 0-d tensors")]
    ZeroDimInput { op: &'static str },
    #[error(
        "split lengths {lengths:?} sum to {}, but the leading dim is {leading}",
        describe_total(.total.as_ref())
    )]
    SplitLengthMismatch {
        lengths: Vec<usize>,
        /// `None` when the lengths overflow `usize`.
        total: Option<usize>,
        leading: usize,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Numeric capabilities a tensor container delegates to.
pub trait ArrayKernels {
    fn zeros(&self, shape: &[usize], dtype: DType) -> DenseTensor;

    fn cast(&self, value: &DenseTensor, dtype: DType) -> Result<DenseTensor, KernelError>;

    /// Joins equally-shaped tensors along a new leading axis.
    fn stack(&self, values: &[DenseTensor]) -> Result<DenseTensor, KernelError>;

    /// Joins tensors along an existing axis.
    fn concat(&self, values: &[DenseTensor], axis: usize) -> Result<DenseTensor, KernelError>;

    /// Splits along the leading axis into chunks of the given lengths.
    fn split(&self, value: &DenseTensor, lengths: &[usize])
    -> Result<Vec<DenseTensor>, KernelError>;

    /// Splits along the leading axis into one tensor per row.
    fn unstack(&self, value: &DenseTensor) -> Result<Vec<DenseTensor>, KernelError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuKernels;

impl ArrayKernels for CpuKernels {
    fn zeros(&self, shape: &[usize], dtype: DType) -> DenseTensor {
        DenseTensor::zeros(shape.to_vec(), dtype)
    }

    fn cast(&self, value: &DenseTensor, dtype: DType) -> Result<DenseTensor, KernelError> {
        if value.dtype() == dtype {
            return Ok(value.clone());
        }
        Ok(DenseTensor::new(
            value.shape().to_vec(),
            value.data().to_vec(),
            dtype,
        )?)
    }

    fn stack(&self, values: &[DenseTensor]) -> Result<DenseTensor, KernelError> {
        let first = values.first().ok_or(KernelError::EmptyInput { op: "stack" })?;
        ensure_uniform(values, "stack", None)?;

        let mut shape = Vec::with_capacity(first.ndim() + 1);
        shape.push(values.len());
        shape.extend_from_slice(first.shape());

        let mut data = Vec::with_capacity(first.numel() * values.len());
        for value in values {
            data.extend_from_slice(value.data());
        }
        Ok(first.with_data(shape, data)?)
    }

    fn concat(&self, values: &[DenseTensor], axis: usize) -> Result<DenseTensor, KernelError> {
        let first = values
            .first()
            .ok_or(KernelError::EmptyInput { op: "concat" })?;
        if first.ndim() == 0 {
            return Err(KernelError::ZeroDimInput { op: "concat" });
        }
        if axis >= first.ndim() {
            return Err(KernelError::AxisOutOfRange {
                op: "concat",
                axis,
                rank: first.ndim(),
            });
        }
        ensure_uniform(values, "concat", Some(axis))?;

        let outer = numel_of(&first.shape()[..axis]);
        let inner = numel_of(&first.shape()[axis + 1..]);
        let joined: usize = values.iter().map(|value| value.shape()[axis]).sum();

        let mut data = Vec::with_capacity(outer * joined * inner);
        for block in 0..outer {
            for value in values {
                let chunk = value.shape()[axis] * inner;
                let start = block * chunk;
                data.extend_from_slice(&value.data()[start..start + chunk]);
            }
        }

        let mut shape = first.shape().to_vec();
        shape[axis] = joined;
        Ok(first.with_data(shape, data)?)
    }

    fn split(
        &self,
        value: &DenseTensor,
        lengths: &[usize],
    ) -> Result<Vec<DenseTensor>, KernelError> {
        let leading = value
            .len()
            .map_err(|_| KernelError::ZeroDimInput { op: "split" })?;
        let total = lengths
            .iter()
            .try_fold(0usize, |acc, length| acc.checked_add(*length));
        let mismatch = || KernelError::SplitLengthMismatch {
            lengths: lengths.to_vec(),
            total,
            leading,
        };
        if total != Some(leading) {
            return Err(mismatch());
        }

        let row = numel_of(&value.shape()[1..]);
        let mut chunks = Vec::with_capacity(lengths.len());
        let mut offset = 0usize;
        for length in lengths {
            let end = length
                .checked_mul(row)
                .and_then(|span| span.checked_add(offset))
                .ok_or_else(mismatch)?;
            let data = value.data().get(offset..end).ok_or_else(mismatch)?;
            let mut shape = value.shape().to_vec();
            shape[0] = *length;
            chunks.push(value.with_data(shape, data.to_vec())?);
            offset = end;
        }
        Ok(chunks)
    }

    fn unstack(&self, value: &DenseTensor) -> Result<Vec<DenseTensor>, KernelError> {
        let rows = value
            .rows()
            .map_err(|_| KernelError::ZeroDimInput { op: "unstack" })?;
        Ok(rows.collect())
    }
}

fn describe_total(total: Option<&usize>) -> String {
    total.map_or_else(|| "more than usize::MAX".to_string(), ToString::to_string)
}

fn ensure_uniform(
    values: &[DenseTensor],
    op: &'static str,
    free_axis: Option<usize>,
) -> Result<(), KernelError> {
    let Some(first) = values.first() else {
        return Ok(());
    };

    for (position, value) in values.iter().enumerate().skip(1) {
        if value.dtype() != first.dtype() {
            return Err(KernelError::DTypeMismatch {
                op,
                position,
                expected: first.dtype(),
                actual: value.dtype(),
            });
        }

        let shapes_agree = value.ndim() == first.ndim()
            && value
                .shape()
                .iter()
                .zip(first.shape())
                .enumerate()
                .all(|(dim, (lhs, rhs))| Some(dim) == free_axis || lhs == rhs);
        if !shapes_agree {
            return Err(KernelError::ShapeMismatch {
                op,
                position,
                expected: first.shape().to_vec(),
                actual: value.shape().to_vec(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ff_core::{DType, DenseTensor};
    use proptest::prelude::*;

    use super::{ArrayKernels, CpuKernels, KernelError};

    fn iota(shape: Vec<usize>, dtype: DType) -> DenseTensor {
        let numel = shape.iter().product::<usize>();
        DenseTensor::new(shape, (0..numel).map(|v| v as f64).collect(), dtype)
            .expect("iota tensor should build")
    }

    #[test]
    fn cast_normalizes_values_into_target_dtype() {
        let source = DenseTensor::from_slice(&[1.7, -2.2, 0.0], DType::Float64);
        let cast = CpuKernels
            .cast(&source, DType::Int32)
            .expect("float to int cast");
        assert_eq!(cast.dtype(), DType::Int32);
        assert_eq!(cast.data(), &[1.0, -2.0, 0.0]);
    }

    #[test]
    fn cast_to_same_dtype_keeps_identity() {
        let source = DenseTensor::from_slice(&[1.0], DType::Float32);
        let cast = CpuKernels
            .cast(&source, DType::Float32)
            .expect("no-op cast");
        assert_eq!(cast.id(), source.id());
    }

    #[test]
    fn stack_adds_leading_axis() {
        let a = DenseTensor::from_slice(&[1.0, 2.0], DType::Float32);
        let b = DenseTensor::from_slice(&[3.0, 4.0], DType::Float32);
        let out = CpuKernels.stack(&[a, b]).expect("stack two rows");
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn stack_rejects_empty_and_mismatched_inputs() {
        assert_eq!(
            CpuKernels.stack(&[]),
            Err(KernelError::EmptyInput { op: "stack" })
        );

        let a = DenseTensor::from_slice(&[1.0, 2.0], DType::Float32);
        let b = DenseTensor::from_slice(&[3.0], DType::Float32);
        let err = CpuKernels.stack(&[a.clone(), b]).expect_err("shape mismatch");
        assert!(matches!(err, KernelError::ShapeMismatch { position: 1, .. }));

        let c = DenseTensor::from_slice(&[3.0, 4.0], DType::Int32);
        let err = CpuKernels.stack(&[a, c]).expect_err("dtype mismatch");
        assert!(matches!(err, KernelError::DTypeMismatch { position: 1, .. }));
    }

    #[test]
    fn concat_joins_existing_axis() {
        let a = iota(vec![2, 2], DType::Int64);
        let b = iota(vec![1, 2], DType::Int64);
        let out = CpuKernels.concat(&[a, b], 0).expect("concat rows");
        assert_eq!(out.shape(), &[3, 2]);
        assert_eq!(out.data(), &[0.0, 1.0, 2.0, 3.0, 0.0, 1.0]);
    }

    #[test]
    fn concat_along_inner_axis_interleaves_blocks() {
        let a = iota(vec![2, 2], DType::Int64);
        let b = iota(vec![2, 1], DType::Int64);
        let out = CpuKernels.concat(&[a, b], 1).expect("concat columns");
        assert_eq!(out.shape(), &[2, 3]);
        assert_eq!(out.data(), &[0.0, 1.0, 0.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn concat_rejects_scalars_and_bad_axis() {
        let scalar = DenseTensor::scalar(1.0, DType::Float32);
        assert_eq!(
            CpuKernels.concat(&[scalar], 0),
            Err(KernelError::ZeroDimInput { op: "concat" })
        );
        let row = DenseTensor::from_slice(&[1.0], DType::Float32);
        assert!(matches!(
            CpuKernels.concat(&[row], 1),
            Err(KernelError::AxisOutOfRange { axis: 1, rank: 1, .. })
        ));
    }

    #[test]
    fn split_honors_lengths() {
        let value = iota(vec![5, 2], DType::Float32);
        let parts = CpuKernels.split(&value, &[2, 0, 3]).expect("split 2/0/3");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].shape(), &[2, 2]);
        assert_eq!(parts[1].shape(), &[0, 2]);
        assert_eq!(parts[2].shape(), &[3, 2]);
        assert_eq!(parts[2].data(), &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn split_rejects_length_mismatch() {
        let value = iota(vec![4], DType::Float32);
        let err = CpuKernels.split(&value, &[1, 2]).expect_err("1+2 != 4");
        assert!(matches!(
            err,
            KernelError::SplitLengthMismatch {
                total: Some(3),
                leading: 4,
                ..
            }
        ));
    }

    #[test]
    fn split_rejects_overflowing_lengths() {
        let value = iota(vec![1], DType::Float32);
        let err = CpuKernels
            .split(&value, &[usize::MAX, 2])
            .expect_err("lengths overflow usize");
        assert_eq!(
            err,
            KernelError::SplitLengthMismatch {
                lengths: vec![usize::MAX, 2],
                total: None,
                leading: 1,
            }
        );
        assert!(err.to_string().contains("more than usize::MAX"));
    }

    #[test]
    fn unstack_rejects_scalars() {
        let scalar = DenseTensor::scalar(1.0, DType::Float32);
        assert_eq!(
            CpuKernels.unstack(&scalar),
            Err(KernelError::ZeroDimInput { op: "unstack" })
        );
    }

    proptest! {
        #[test]
        fn prop_unstack_then_stack_round_trips(
            rows in 1usize..=5,
            cols in 0usize..=4,
        ) {
            let value = iota(vec![rows, cols], DType::Float64);
            let parts = CpuKernels.unstack(&value).expect("unstack rank-2");
            prop_assert_eq!(parts.len(), rows);
            let restored = CpuKernels.stack(&parts).expect("restack");
            prop_assert_eq!(restored, value);
        }

        #[test]
        fn prop_split_then_concat_round_trips(lengths in prop::collection::vec(0usize..=3, 1..=4)) {
            let total: usize = lengths.iter().sum();
            let value = iota(vec![total, 2], DType::Int32);
            let parts = CpuKernels.split(&value, &lengths).expect("lengths sum to leading dim");
            let restored = CpuKernels.concat(&parts, 0).expect("concat chunks");
            prop_assert_eq!(restored, value);
        }
    }
}
